use chrono::{DateTime, TimeZone, Utc};
use orchestrator_dispatcher::CronExpression;

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

#[test]
fn test_next_runs_follow_offset_step() {
    let cron = CronExpression::parse("5/20 * * * *").unwrap();
    let runs = cron.next_runs(at(2024, 6, 1, 10, 50, 0), 4);
    assert_eq!(
        runs,
        vec![
            at(2024, 6, 1, 11, 5, 0),
            at(2024, 6, 1, 11, 25, 0),
            at(2024, 6, 1, 11, 45, 0),
            at(2024, 6, 1, 12, 5, 0),
        ]
    );
}

#[test]
fn test_next_run_is_strictly_after() {
    let cron = CronExpression::parse("5/20 * * * *").unwrap();
    assert_eq!(
        cron.next_run(at(2024, 6, 1, 12, 5, 0)),
        Some(at(2024, 6, 1, 12, 25, 0))
    );
    assert_eq!(
        cron.next_run(at(2024, 6, 1, 12, 4, 59)),
        Some(at(2024, 6, 1, 12, 5, 0))
    );
}

#[test]
fn test_day_of_month_and_weekday_must_both_match() {
    // 13 号且为周五
    let cron = CronExpression::parse("0 12 13 * 5").unwrap();
    assert_eq!(
        cron.next_run(at(2024, 1, 1, 0, 0, 0)),
        Some(at(2024, 9, 13, 12, 0, 0))
    );
}

#[test]
fn test_year_rollover() {
    let cron = CronExpression::parse("0 0 1 1 *").unwrap();
    assert_eq!(
        cron.next_run(at(2024, 12, 31, 23, 59, 30)),
        Some(at(2025, 1, 1, 0, 0, 0))
    );
}

#[test]
fn test_scan_budget_limits_search() {
    let cron = CronExpression::parse("0 0 29 2 *").unwrap();
    let after = at(2025, 3, 1, 0, 0, 0);

    assert_eq!(cron.next_run_bounded(after, 10), None);
    assert_eq!(cron.next_run(after), Some(at(2028, 2, 29, 0, 0, 0)));
}

#[test]
fn test_parse_errors_name_the_expression() {
    for expr in ["", "* * *", "*/0 * * * *", "0 24 * * *", "0 0 0 * *", "a b c d e"] {
        let err = CronExpression::parse(expr).unwrap_err();
        assert!(
            err.to_string().contains(expr.trim()),
            "'{expr}' 的错误信息应包含表达式: {err}"
        );
    }
}

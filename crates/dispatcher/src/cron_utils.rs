use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use tracing::debug;

use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 默认的最大扫描步数
pub const DEFAULT_MAX_SCAN_ITERATIONS: u32 = 10_000;

/// 单个字段允许的取值集合，用位图表示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.bits |= 1u64 << value;
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const SECOND: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
};
const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
// 7 同样表示周日，解析后折叠为 0
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
};

/// CRON 表达式
///
/// 支持 5 个字段（分 时 日 月 周）。6 字段输入的第一个字段视为秒，
/// 只做语法校验，调度时被忽略，最小调度粒度始终是分钟。
/// 日与周两个字段必须同时匹配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    raw: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    has_seconds: bool,
}

impl CronExpression {
    pub fn parse(expr: &str) -> OrchestratorResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let has_seconds = fields.len() == 6;
        let fields = match fields.len() {
            5 => fields.as_slice(),
            6 => {
                parse_field(fields[0], SECOND)
                    .map_err(|m| OrchestratorError::invalid_cron(expr, m))?;
                debug!("CRON表达式 '{}' 包含秒字段，秒字段将被忽略", expr);
                &fields[1..]
            }
            n => {
                return Err(OrchestratorError::invalid_cron(
                    expr,
                    format!("需要5个或6个字段，实际为{n}个"),
                ))
            }
        };

        let field = |index: usize, spec: FieldSpec| {
            parse_field(fields[index], spec).map_err(|m| OrchestratorError::invalid_cron(expr, m))
        };

        let mut days_of_week = field(4, DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            raw: expr.trim().to_string(),
            minutes: field(0, MINUTE)?,
            hours: field(1, HOUR)?,
            days_of_month: field(2, DAY_OF_MONTH)?,
            months: field(3, MONTH)?,
            days_of_week,
            has_seconds,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 输入中是否包含（被忽略的）秒字段
    pub fn has_seconds_field(&self) -> bool {
        self.has_seconds
    }

    /// 检查给定时间所在的分钟是否匹配，秒被忽略
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        self.months.contains(instant.month())
            && self.day_matches(instant)
            && self.hours.contains(instant.hour())
            && self.minutes.contains(instant.minute())
    }

    fn day_matches(&self, instant: DateTime<Utc>) -> bool {
        self.days_of_month.contains(instant.day())
            && self
                .days_of_week
                .contains(instant.weekday().num_days_from_sunday())
    }

    /// 严格晚于 `after` 的第一个匹配时间（整分钟）
    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_run_bounded(after, DEFAULT_MAX_SCAN_ITERATIONS)
    }

    /// 向前扫描，依次跳过不匹配的月、日、小时、分钟，最多 `max_iterations` 步
    pub fn next_run_bounded(
        &self,
        after: DateTime<Utc>,
        max_iterations: u32,
    ) -> Option<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(after)? + Duration::minutes(1);

        for _ in 0..max_iterations {
            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = truncate_to_hour(candidate)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        debug!(
            "CRON表达式 '{}' 在 {} 步内没有找到下次执行时间",
            self.raw, max_iterations
        );
        None
    }

    /// 从 `after` 开始的连续 `count` 个执行时间
    pub fn next_runs(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut runs = Vec::with_capacity(count);
        let mut cursor = after;
        while runs.len() < count {
            match self.next_run(cursor) {
                Some(next) => {
                    runs.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        runs
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for CronExpression {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(field: &str, spec: FieldSpec) -> Result<FieldSet, String> {
    if field.is_empty() {
        return Err(format!("{} 字段为空", spec.name));
    }

    let mut set = FieldSet { bits: 0 };
    for part in field.split(',') {
        parse_part(part, spec, &mut set)?;
    }
    Ok(set)
}

fn parse_part(part: &str, spec: FieldSpec, set: &mut FieldSet) -> Result<(), String> {
    if part.is_empty() {
        return Err(format!("{} 字段包含空的列表项", spec.name));
    }

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("{} 字段的步长无效: {part}", spec.name))?;
            if step == 0 {
                return Err(format!("{} 字段的步长不能为0: {part}", spec.name));
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
        let a = parse_value(a, spec)?;
        let b = parse_value(b, spec)?;
        if a > b {
            return Err(format!("{} 字段的范围无效: {range}", spec.name));
        }
        (a, b)
    } else {
        let value = parse_value(range, spec)?;
        // `a/n` 表示从 a 开始到字段上限
        if step.is_some() {
            (value, spec.max)
        } else {
            (value, value)
        }
    };

    let step = step.unwrap_or(1);
    for value in start..=end {
        if (value - start) % step == 0 {
            set.insert(value);
        }
    }
    Ok(())
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("{} 字段的值无效: {raw}", spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} 字段的值 {value} 超出范围 {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}

fn truncate_to_minute(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    instant.with_second(0)?.with_nanosecond(0)
}

fn truncate_to_hour(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    truncate_to_minute(instant)?.with_minute(0)
}

fn start_of_next_day(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = instant.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if instant.month() == 12 {
        (instant.year() + 1, 1)
    } else {
        (instant.year(), instant.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_fifteen_minutes() {
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        assert_eq!(
            expr.next_run(at(2024, 1, 1, 0, 1, 0)),
            Some(at(2024, 1, 1, 0, 15, 0))
        );
        assert_eq!(
            expr.next_run(at(2024, 1, 1, 0, 15, 0)),
            Some(at(2024, 1, 1, 0, 30, 0))
        );
        assert_eq!(
            expr.next_run(at(2024, 1, 1, 23, 50, 0)),
            Some(at(2024, 1, 2, 0, 0, 0))
        );
    }

    #[test]
    fn test_weekday_schedule_skips_weekend() {
        let expr = CronExpression::parse("0 9 * * 1-5").unwrap();
        // 2024-01-06 是周六
        let next = expr.next_run(at(2024, 1, 6, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 8, 9, 0, 0));
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn test_six_field_input_ignores_seconds() {
        let expr = CronExpression::parse("30 */10 * * * *").unwrap();
        assert!(expr.has_seconds_field());
        assert_eq!(
            expr.next_run(at(2024, 3, 1, 12, 0, 0)),
            Some(at(2024, 3, 1, 12, 10, 0))
        );
        assert!(!CronExpression::parse("*/10 * * * *")
            .unwrap()
            .has_seconds_field());
    }

    #[test]
    fn test_lists_ranges_and_steps() {
        let expr = CronExpression::parse("5,10-12,40/10 * * * *").unwrap();
        let runs = expr.next_runs(at(2024, 1, 1, 0, 0, 0), 7);
        let minutes: Vec<u32> = runs.iter().map(|r| r.minute()).collect();
        assert_eq!(minutes, vec![5, 10, 11, 12, 40, 50, 5]);

        let expr = CronExpression::parse("0 8-18/5 * * *").unwrap();
        let hours: Vec<u32> = expr
            .next_runs(at(2024, 1, 1, 0, 0, 0), 3)
            .iter()
            .map(|r| r.hour())
            .collect();
        assert_eq!(hours, vec![8, 13, 18]);
    }

    #[test]
    fn test_sunday_as_seven() {
        let expr = CronExpression::parse("0 0 * * 7").unwrap();
        let next = expr.next_run(at(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 7, 0, 0, 0));
    }

    #[test]
    fn test_leap_day_and_month_rollover() {
        let expr = CronExpression::parse("0 12 29 2 *").unwrap();
        assert_eq!(
            expr.next_run(at(2023, 3, 1, 0, 0, 0)),
            Some(at(2024, 2, 29, 12, 0, 0))
        );

        let expr = CronExpression::parse("0 0 1 1 *").unwrap();
        assert_eq!(
            expr.next_run(at(2024, 12, 31, 23, 59, 59)),
            Some(at(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_impossible_date_exhausts_scan() {
        let expr = CronExpression::parse("0 0 31 2 *").unwrap();
        assert_eq!(expr.next_run(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_matches_ignores_seconds() {
        let expr = CronExpression::parse("30 14 * * *").unwrap();
        assert!(expr.matches(at(2024, 5, 5, 14, 30, 45)));
        assert!(!expr.matches(at(2024, 5, 5, 14, 31, 0)));
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in [
            "",
            "* * * *",
            "* * * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "61 * * * * *",
        ] {
            let err = CronExpression::parse(expr).unwrap_err();
            assert!(
                matches!(err, OrchestratorError::InvalidCronExpression { .. }),
                "{expr} 应该被拒绝"
            );
        }
    }

    #[test]
    fn test_display_and_from_str() {
        let expr: CronExpression = "0 9 * * 1-5".parse().unwrap();
        assert_eq!(expr.to_string(), "0 9 * * 1-5");
        assert_eq!(expr.as_str(), "0 9 * * 1-5");
    }
}

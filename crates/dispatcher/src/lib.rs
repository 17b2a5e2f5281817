pub mod cron_utils;
pub mod scheduler;

pub use cron_utils::{CronExpression, DEFAULT_MAX_SCAN_ITERATIONS};
pub use scheduler::{CronHandler, NextRun, ScheduledTask};

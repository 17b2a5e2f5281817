pub mod app_config;
pub mod engines;
pub mod observability;

pub use app_config::*;
pub use engines::*;
pub use observability::*;

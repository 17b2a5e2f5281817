pub mod retry;
pub mod store;
pub mod task_manager;

pub use retry::{RetryPolicy, MAX_RETRY_DELAY};
pub use store::{JsonFileTaskStore, TaskStore};
pub use task_manager::TaskManager;

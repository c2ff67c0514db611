pub mod executor;

pub use executor::{ActionExecutor, ActionResult, BatchReport, ExecutorSettings};

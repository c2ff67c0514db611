pub mod clock;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod execution;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod tui;
pub mod vision;

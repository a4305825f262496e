pub mod api;
pub mod config;
pub mod cron;
pub mod executor;
pub mod pipeline;
pub mod startup;
pub mod template;
pub mod watcher;

// Re-export commonly used items
pub use config::{Config, Spec};
pub use cron::CronService;
pub use executor::{Event, Executor, StateAction};
pub use pipeline::{ExecState, Instance, Pipeline, Task};
pub use startup::{ControllerBuilder, ControllerInstance};

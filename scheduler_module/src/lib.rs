pub mod config;
pub mod credential_store;
pub mod dispatcher;
pub mod message_store;
pub mod resolver;
pub mod vault;

mod scheduler;

pub use scheduler::{
    MessageScheduler, SchedulerHandle, SweepStats, DEFAULT_POLL_INTERVAL,
};

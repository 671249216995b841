//! Preload: out-of-band prefix downloads before playback

pub mod scheduler;
pub mod task;

pub use scheduler::{
    PreloadScheduler, SchedulerConfig, SchedulerCounters, SchedulerSnapshot,
};
pub use task::{PreloadTask, TaskId, TaskState};

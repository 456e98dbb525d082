//! Runtime services shared by the cluster layer.
//!
//! 1. **Background workers** (`worker`): sequential, channel-fed task loops
//!    with periodic ticks. The exchange coordinator runs on one.

pub mod worker;

pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerOptions, WorkerSender};

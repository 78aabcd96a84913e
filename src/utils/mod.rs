pub mod graceful_shutdown;
pub mod supervise;

pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
pub use supervise::{combine_errors, panic_message, spawn_supervised};

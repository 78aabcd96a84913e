pub mod fallback;
pub mod listener;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use fallback::StaticFallback;
pub use listener::{Listener, ListenerError};
pub use middleware::*;

pub mod auth;
pub mod worker;

pub use auth::{AuthStrategy, Principal};
pub use worker::Worker;

//! Built-in endpoint handlers.

pub mod health;

pub use health::health_handler;

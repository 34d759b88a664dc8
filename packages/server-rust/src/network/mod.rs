//! HTTP transport: listener options, Tower layers, built-in handlers and
//! the serving loop.

pub mod config;
pub mod handlers;
pub mod layers;
pub mod server;

pub use config::{ServeMode, WebHostOptions};
pub use server::RunningServer;

pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod io;
pub mod log;
pub mod orchestrator;
pub mod parser;
pub mod paths;
pub mod publisher;
pub mod resolver;
pub mod tracker;
pub mod types;

pub use error::{BridgeError, Result};

pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod redact;
pub mod stream;

pub use error::{Error, Result};

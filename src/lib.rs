//! Agent builder: turns a natural-language description of a data-tracking
//! agent into a live React widget built by an AI coding CLI inside an
//! ephemeral cloud sandbox, streaming progress as Server-Sent Events.

pub mod build;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod sandbox;

pub use config::Config;
pub use error::BuildError;
pub use protocol::{BuildEvent, EventKind};

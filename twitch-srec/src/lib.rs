//! twitch-srec library crate.
//!
//! Watches Twitch channels and records them with an external capture tool
//! while they are live.

pub mod capture;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod provision;
pub mod reconciler;
pub mod status;
pub mod streamer;
pub mod utils;

pub use error::{Error, Result};

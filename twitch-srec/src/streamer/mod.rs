//! Streamer registry module.
//!
//! The [`StreamerRegistry`] is the authoritative in-memory map of tracked
//! channels. Every change goes through its per-field setters and is
//! published to subscribers as a [`RegistryEvent`].

pub mod events;
pub mod registry;
pub mod state;

pub use events::{RegistryEvent, RegistryEventBroadcaster, StateChange};
pub use registry::{StreamerRegistry, channel_key, normalize_channel};
pub use state::{PLACEHOLDER_THUMBNAIL, StreamerState, StreamerStatus};

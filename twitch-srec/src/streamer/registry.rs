//! Streamer registry implementation.
//!
//! The registry is the single source of truth for channel state during
//! runtime. Each setter writes exactly one field (last write wins) and
//! publishes the change after the entry lock is released.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{RegistryEvent, RegistryEventBroadcaster, StateChange};
use super::state::{StreamerState, StreamerStatus};
use crate::persistence::{PersistedState, PersistedStreamer};
use crate::{Error, Result};

static LOGIN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{1,25}$").expect("valid login regex"));

/// Normalise a user supplied channel name into a registry key.
///
/// Twitch logins are case-insensitive; surrounding whitespace is dropped.
pub fn normalize_channel(name: &str) -> Result<String> {
    let key = name.trim().to_ascii_lowercase();
    if !LOGIN_REGEX.is_match(&key) {
        return Err(Error::validation(format!(
            "'{}' is not a valid channel name",
            name.trim()
        )));
    }
    Ok(key)
}

/// Lookup key for `channel`: trimmed and lower-cased, borrowed when already canonical.
///
/// Every component keyed by channel goes through this so `Alice` and
/// `alice` always name the same entry.
pub fn channel_key(channel: &str) -> Cow<'_, str> {
    let trimmed = channel.trim();
    if trimmed.len() == channel.len() && !channel.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Borrowed(channel)
    } else {
        Cow::Owned(trimmed.to_ascii_lowercase())
    }
}

struct Entry {
    /// Insertion sequence, used as the ordering tie-break.
    seq: u64,
    state: StreamerState,
}

/// In-memory map of tracked channels with change notifications.
pub struct StreamerRegistry {
    streamers: DashMap<String, Entry>,
    next_seq: AtomicU64,
    /// Base directory new captures are written under.
    location: RwLock<PathBuf>,
    broadcaster: RegistryEventBroadcaster,
}

impl StreamerRegistry {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            streamers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            location: RwLock::new(location.into()),
            broadcaster: RegistryEventBroadcaster::new(),
        }
    }

    /// Subscribe to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.broadcaster.subscribe()
    }

    // ========== Membership ==========

    /// Start tracking a channel with default state.
    ///
    /// Returns the normalised channel name. Fails with `AlreadyExists` if the
    /// channel is tracked already and with `Validation` for malformed names.
    pub fn add(&self, channel: &str) -> Result<String> {
        let key = normalize_channel(channel)?;

        match self.streamers.entry(key.clone()) {
            MapEntry::Occupied(_) => return Err(Error::already_exists("Streamer", key)),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    state: StreamerState::default(),
                });
            }
        }

        info!(channel = %key, "Streamer added");
        self.broadcaster.publish(RegistryEvent::Added {
            channel: key.clone(),
        });
        Ok(key)
    }

    /// Stop tracking a channel.
    ///
    /// Returns the last state, or `None` if the channel was not tracked.
    /// Stopping an attached capture is the caller's job.
    pub fn remove(&self, channel: &str) -> Option<StreamerState> {
        let key = channel_key(channel);
        let (name, entry) = self.streamers.remove(key.as_ref())?;

        info!(channel = %name, "Streamer removed");
        self.broadcaster
            .publish(RegistryEvent::Removed { channel: name });
        Some(entry.state)
    }

    // ========== Field setters ==========

    pub fn set_enabled(&self, channel: &str, enabled: bool) -> Result<bool> {
        self.apply(channel, StateChange::Enabled(enabled))
    }

    pub fn set_status(&self, channel: &str, status: StreamerStatus) -> Result<bool> {
        self.apply(channel, StateChange::Status(status))
    }

    pub fn set_skip_current(&self, channel: &str, skip: bool) -> Result<bool> {
        self.apply(channel, StateChange::SkipCurrent(skip))
    }

    pub fn set_downloading(&self, channel: &str, downloading: bool) -> Result<bool> {
        self.apply(channel, StateChange::Downloading(downloading))
    }

    pub fn set_title(&self, channel: &str, title: impl Into<String>) -> Result<bool> {
        self.apply(channel, StateChange::Title(title.into()))
    }

    pub fn set_thumbnail(&self, channel: &str, thumbnail: impl Into<String>) -> Result<bool> {
        self.apply(channel, StateChange::Thumbnail(thumbnail.into()))
    }

    /// Write one field and publish it if the stored value changed.
    ///
    /// Returns whether the value changed.
    fn apply(&self, channel: &str, change: StateChange) -> Result<bool> {
        let key = channel_key(channel);
        let changed = {
            let mut entry = self
                .streamers
                .get_mut(key.as_ref())
                .ok_or_else(|| Error::not_found("Streamer", key.as_ref()))?;
            let state = &mut entry.state;

            fn swap<T: PartialEq + Clone>(slot: &mut T, value: &T) -> bool {
                if slot == value {
                    return false;
                }
                *slot = value.clone();
                true
            }

            match &change {
                StateChange::Enabled(v) => swap(&mut state.enabled, v),
                StateChange::Status(v) => swap(&mut state.status, v),
                StateChange::SkipCurrent(v) => swap(&mut state.skip_current, v),
                StateChange::Downloading(v) => swap(&mut state.is_downloading, v),
                StateChange::Title(v) => swap(&mut state.title, v),
                StateChange::Thumbnail(v) => swap(&mut state.thumbnail, v),
            }
        };

        if changed {
            debug!(channel = %key, ?change, "Streamer state changed");
            self.broadcaster.publish(RegistryEvent::Updated {
                channel: key.into_owned(),
                change,
            });
        }
        Ok(changed)
    }

    // ========== Queries ==========

    pub fn get(&self, channel: &str) -> Option<StreamerState> {
        self.streamers
            .get(channel_key(channel).as_ref())
            .map(|entry| entry.state.clone())
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.streamers.contains_key(channel_key(channel).as_ref())
    }

    pub fn len(&self) -> usize {
        self.streamers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamers.is_empty()
    }

    /// Tracked channels with their state, in insertion order.
    pub fn entries(&self) -> Vec<(String, StreamerState)> {
        let mut entries: Vec<_> = self
            .streamers
            .iter()
            .map(|e| (e.seq, e.key().clone(), e.state.clone()))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries
            .into_iter()
            .map(|(_, name, state)| (name, state))
            .collect()
    }

    /// Tracked channel names in insertion order.
    pub fn list(&self) -> Vec<String> {
        self.entries().into_iter().map(|(name, _)| name).collect()
    }

    /// Tracked channel names with every ONLINE channel first.
    ///
    /// Channels with the same priority keep their insertion order.
    pub fn list_ordered(&self) -> Vec<String> {
        let mut entries = self.entries();
        // sort_by_key is stable
        entries.sort_by_key(|(_, state)| !state.status.is_online());
        entries.into_iter().map(|(name, _)| name).collect()
    }

    // ========== Global location ==========

    pub fn location(&self) -> PathBuf {
        self.location.read().clone()
    }

    /// Change the base download directory used by future captures.
    pub fn set_location(&self, location: impl Into<PathBuf>) -> bool {
        let location = location.into();
        {
            let mut current = self.location.write();
            if *current == location {
                return false;
            }
            *current = location.clone();
        }
        info!(location = %location.display(), "Download location changed");
        self.broadcaster
            .publish(RegistryEvent::LocationChanged { location });
        true
    }

    // ========== Startup / persistence ==========

    /// Clear the downloading flag of every channel.
    ///
    /// Capture processes never survive a restart.
    pub fn reset_downloading(&self) {
        for channel in self.list() {
            // A concurrent remove is fine here.
            let _ = self.set_downloading(&channel, false);
        }
    }

    /// Rebuild registry content from a persisted document.
    ///
    /// Existing entries are replaced; downloading flags are cleared.
    pub fn restore(&self, persisted: PersistedState) -> usize {
        self.set_location(persisted.global_location);

        let mut restored = 0;
        for PersistedStreamer { name, mut state } in persisted.streamers {
            let key = match normalize_channel(&name) {
                Ok(key) => key,
                Err(e) => {
                    warn!(channel = %name, error = %e, "Skipping persisted streamer");
                    continue;
                }
            };
            state.is_downloading = false;
            let previous = self.streamers.insert(
                key.clone(),
                Entry {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    state,
                },
            );
            if previous.is_none() {
                self.broadcaster
                    .publish(RegistryEvent::Added { channel: key });
            }
            restored += 1;
        }

        info!("Restored {} streamers", restored);
        restored
    }

    /// Capture the current content as a persistable document.
    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            global_location: self.location(),
            streamers: self
                .entries()
                .into_iter()
                .map(|(name, state)| PersistedStreamer { name, state })
                .collect(),
        }
    }

    /// Current download directory for `channel`.
    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.location().join(channel_key(channel).as_ref())
    }
}

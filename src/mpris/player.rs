//! Per-player state: playback status, position accounting, and the
//! metadata cache with redundant-signal suppression.
//!
//! The pure state machine lives in [`PlayerState`] and takes the current
//! wall-clock time as a parameter; [`Player`] wraps it with the bus proxy
//! and event emission. Wall-clock (not monotonic) time is deliberate:
//! `tracking:startTime` crosses the wire and clients subtract it from
//! their own clocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use zvariant::OwnedValue;

use crate::events::{EventClass, PlayerEvent};
use crate::metadata::{self, MetaValue, Metadata};
use crate::mpris::connection::{BusError, MediaPlayerProxy};
use crate::plugins::HandlerError;
use crate::transform::TransformEngine;

/// Keys compared to decide whether a metadata signal is a genuinely new
/// track.
const FINGERPRINT_KEYS: [&str; 4] = [
    "xesam:title",
    "xesam:url",
    "mpris:artUrl",
    "xesam:artist",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
}

impl PlaybackStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Playing" => Some(PlaybackStatus::Playing),
            "Paused" => Some(PlaybackStatus::Paused),
            "Stopped" => Some(PlaybackStatus::Stopped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Stopped => "Stopped",
        }
    }
}

/// Current wall-clock time as epoch seconds.
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// What a metadata signal amounted to after suppression checks.
#[derive(Debug, PartialEq)]
pub enum MetadataOutcome {
    /// Same fingerprint, same length: nothing to do.
    Redundant,
    /// Same fingerprint, new length: cached length patched in place.
    LengthPatched,
    /// New track: the transformation pipeline ran.
    Transformed,
}

/// The mutable core of a player record.
#[derive(Debug)]
pub struct PlayerState {
    pub status: PlaybackStatus,
    pub active: bool,
    pub last_active: f64,
    pub media_start: f64,
    pub existing_time: f64,
    pub metadata: Metadata,
    last_raw_metadata: Metadata,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Stopped,
            active: false,
            last_active: 0.0,
            media_start: 0.0,
            existing_time: 0.0,
            metadata: Metadata::new(),
            last_raw_metadata: Metadata::new(),
        }
    }
}

impl PlayerState {
    /// Apply a status transition at time `now`.
    ///
    /// Transitions are idempotent per status; `existing_time` carries
    /// forward across a pause so a resume continues the accumulated
    /// position.
    pub fn set_status(&mut self, status: PlaybackStatus, now: f64) {
        match status {
            PlaybackStatus::Playing => {
                if self.status != PlaybackStatus::Playing {
                    self.status = PlaybackStatus::Playing;
                    self.media_start = now;
                    self.active = true;
                }
            }
            PlaybackStatus::Paused => {
                if self.status != PlaybackStatus::Paused {
                    self.status = PlaybackStatus::Paused;
                    self.active = false;
                    self.existing_time += now - self.media_start;
                    self.media_start = now;
                    self.last_active = now;
                }
            }
            PlaybackStatus::Stopped => {
                self.status = PlaybackStatus::Stopped;
                self.active = false;
                self.last_active = now;
                self.existing_time = 0.0;
                self.metadata.clear();
            }
        }
    }

    /// Re-anchor position accounting after a seek.
    pub fn record_seek(&mut self, position: f64, now: f64) {
        self.existing_time = position;
        self.media_start = now;
    }

    /// Playback position at time `now`, as clients derive it from the
    /// tracking fields.
    pub fn derived_position(&self, now: f64) -> f64 {
        if self.status == PlaybackStatus::Playing {
            now - self.media_start + self.existing_time
        } else {
            self.existing_time
        }
    }

    /// The synthesized keys merged into outbound metadata.
    fn tracking_fields(&self) -> [(String, MetaValue); 3] {
        [
            (
                "tracking:startTime".to_string(),
                MetaValue::Float(self.media_start),
            ),
            (
                "tracking:existingTime".to_string(),
                MetaValue::Float(self.existing_time),
            ),
            (
                "tracking:status".to_string(),
                MetaValue::Str(self.status.as_str().to_string()),
            ),
        ]
    }

    /// Cached normalized metadata with the tracking fields merged in.
    pub fn metadata_with_tracking(&self) -> Metadata {
        let mut merged = self.metadata.clone();
        merged.extend(self.tracking_fields());
        merged
    }

    fn fingerprint_matches(&self, new: &Metadata) -> bool {
        // A key missing on either side compares unequal, so an empty
        // dictionary never matches.
        FINGERPRINT_KEYS.iter().all(|key| {
            match (new.get(*key), self.last_raw_metadata.get(*key)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
    }

    /// Ingest a raw (already unwrapped) metadata dictionary.
    ///
    /// `transform` runs only when the fingerprint differs from the last
    /// signal; redundant signals are suppressed, with a fast path that
    /// patches only `mpris:length` in place.
    pub fn ingest_metadata<F>(
        &mut self,
        new: Metadata,
        transform: F,
    ) -> Result<MetadataOutcome, HandlerError>
    where
        F: FnOnce(&Metadata) -> Result<Metadata, HandlerError>,
    {
        if self.fingerprint_matches(&new) {
            let new_length = new.get("mpris:length");
            if new_length == self.last_raw_metadata.get("mpris:length") {
                return Ok(MetadataOutcome::Redundant);
            }
            let Some(length) = new_length else {
                return Ok(MetadataOutcome::Redundant);
            };
            self.metadata
                .insert("mpris:length".to_string(), length.clone());
            return Ok(MetadataOutcome::LengthPatched);
        }

        self.last_raw_metadata = new.clone();
        let transformed = transform(&new)?;
        self.metadata = transformed;
        Ok(MetadataOutcome::Transformed)
    }
}

/// A registered MPRIS peer.
pub struct Player {
    name: String,
    proxy: MediaPlayerProxy<'static>,
    engine: Arc<StdMutex<TransformEngine>>,
    events: mpsc::Sender<PlayerEvent>,
    // Per-player lock: metadata signals can race a force_update, and the
    // fingerprint comparison must observe a consistent cache.
    state: Mutex<PlayerState>,
}

impl Player {
    pub fn new(
        name: impl Into<String>,
        proxy: MediaPlayerProxy<'static>,
        engine: Arc<StdMutex<TransformEngine>>,
        events: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            proxy,
            engine,
            events,
            state: Mutex::new(PlayerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// (active, last_active) pair used by the active-player arbiter.
    pub async fn activity(&self) -> (bool, f64) {
        let state = self.state.lock().await;
        (state.active, state.last_active)
    }

    pub async fn metadata_with_tracking(&self) -> Metadata {
        self.state.lock().await.metadata_with_tracking()
    }

    async fn emit(&self, class: EventClass, metadata: Metadata) {
        let _ = self
            .events
            .send(PlayerEvent {
                player: self.name.clone(),
                class,
                metadata,
            })
            .await;
    }

    /// Handle a `PropertiesChanged` signal body for the player interface.
    pub async fn on_properties_changed(&self, changed: HashMap<String, OwnedValue>) {
        let status = changed
            .get("PlaybackStatus")
            .and_then(|v| String::try_from(v.clone()).ok());
        let raw_metadata = changed
            .get("Metadata")
            .and_then(|v| HashMap::<String, OwnedValue>::try_from(v.clone()).ok());
        self.apply_update(status.as_deref(), raw_metadata.as_ref())
            .await;
    }

    async fn apply_update(
        &self,
        status: Option<&str>,
        raw_metadata: Option<&HashMap<String, OwnedValue>>,
    ) {
        if let Some(status) = status {
            match PlaybackStatus::parse(status) {
                Some(parsed) => self.update_status(parsed).await,
                None => {
                    warn!(player = self.name.as_str(), status, "unexpected playback status")
                }
            }
        }
        if let Some(raw) = raw_metadata {
            debug!(player = self.name.as_str(), "metadata updated");
            self.set_metadata(raw).await;
            if let Err(err) = self.on_seek(1).await {
                warn!(player = self.name.as_str(), error = %err, "position re-anchor failed");
            }
        }
    }

    /// Handle a `Seeked` signal.
    ///
    /// The signal argument is player-reported and has been observed to
    /// lag, so the position is re-read from the player instead.
    pub async fn on_seek(&self, _position_usec: i64) -> Result<(), BusError> {
        let position = self.proxy.position().await? as f64 / 1_000_000.0;
        let snapshot = {
            let mut state = self.state.lock().await;
            state.record_seek(position, wall_clock());
            state.metadata_with_tracking()
        };
        self.emit(EventClass::Seek, snapshot.clone()).await;
        self.emit(EventClass::Event, snapshot).await;
        Ok(())
    }

    /// Apply a playback status change and emit status/event callbacks.
    pub async fn update_status(&self, status: PlaybackStatus) {
        let snapshot = {
            let mut state = self.state.lock().await;
            let now = wall_clock();
            state.set_status(status, now);
            debug!(
                player = self.name.as_str(),
                status = status.as_str(),
                position = state.derived_position(now),
                "status changed"
            );
            state.metadata_with_tracking()
        };
        self.emit(EventClass::Status, snapshot.clone()).await;
        self.emit(EventClass::Event, snapshot).await;
    }

    /// Ingest a raw metadata signal, running the transformation pipeline
    /// when the track actually changed.
    pub async fn set_metadata(&self, raw: &HashMap<String, OwnedValue>) {
        let unwrapped = metadata::from_variant_map(raw);
        let snapshot = {
            let mut state = self.state.lock().await;
            let engine = Arc::clone(&self.engine);
            let outcome = state.ingest_metadata(unwrapped, |md| {
                let mut engine = engine.lock().unwrap_or_else(|e| e.into_inner());
                engine.apply(md)
            });
            match outcome {
                Ok(MetadataOutcome::Redundant) => {
                    debug!(
                        player = self.name.as_str(),
                        "redundant metadata signal, skipping"
                    );
                    None
                }
                Ok(MetadataOutcome::LengthPatched) | Ok(MetadataOutcome::Transformed) => {
                    Some(state.metadata_with_tracking())
                }
                Err(err) => {
                    warn!(
                        player = self.name.as_str(),
                        error = %err,
                        "metadata handler failed, keeping previous metadata"
                    );
                    None
                }
            }
        };
        if let Some(snapshot) = snapshot {
            self.emit(EventClass::Metadata, snapshot.clone()).await;
            self.emit(EventClass::Event, snapshot).await;
        }
    }

    /// Pull current metadata and playback status from the player and
    /// replay them as if they had arrived as a change signal.
    pub async fn force_update(&self) -> Result<(), BusError> {
        let raw_metadata = self.proxy.metadata().await?;
        let status = self.proxy.playback_status().await?;
        self.apply_update(Some(status.as_str()), Some(&raw_metadata))
            .await;
        self.on_seek(1).await
    }
}

//! Audio engine seam.
//!
//! The daemon never decodes audio itself.  A bound engine instance is driven
//! through a cloneable [`EngineHandle`]: commands go out over an unbounded
//! channel, the latest observed status is shared behind a mutex, and
//! lifecycle callbacks come back as [`EngineEvent`]s on the core inbox,
//! tagged with the track id they belong to.
//!
//! ```text
//!   Player ── EngineCommand ──► engine task ──► mpv / fake
//!      ▲                            │
//!      └──── EngineEvent {id} ◄─────┘
//! ```
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use playdeck_proto::protocol::TrackEntry;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Play,
    Pause,
    Stop,
    /// Absolute position in seconds.
    SeekTo(f64),
    SetVolume(f32),
    SetMuted(bool),
    /// Release the engine instance and its underlying resources.
    Unload,
}

/// Lifecycle callback from a bound engine, matched to controller state by
/// track id, never by callback identity.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub id: String,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    Started,
    Loaded,
    Ended,
    Paused,
    Stopped,
    LoadError(String),
    PlayError(String),
}

/// Latest observed playback status of one engine instance.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatus {
    pub duration: f64,
    pub position: f64,
    pub playing: bool,
    pub rate: f64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            duration: 0.0,
            position: 0.0,
            playing: false,
            rate: 1.0,
        }
    }
}

/// Cheaply cloneable handle to one bound engine instance.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    status: Arc<Mutex<EngineStatus>>,
}

impl EngineHandle {
    /// Returns the handle plus the command receiver and status slot the
    /// engine task drives.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<EngineCommand>,
        Arc<Mutex<EngineStatus>>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(EngineStatus::default()));
        (
            Self {
                cmd_tx,
                status: Arc::clone(&status),
            },
            cmd_rx,
            status,
        )
    }

    pub fn status(&self) -> EngineStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, cmd: EngineCommand) {
        // A dead engine task is not an error at this layer; the player learns
        // about it through lifecycle events.
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn play(&self) {
        self.send(EngineCommand::Play);
    }

    pub fn pause(&self) {
        self.send(EngineCommand::Pause);
    }

    pub fn stop(&self) {
        self.send(EngineCommand::Stop);
    }

    pub fn seek_to(&self, secs: f64) {
        self.send(EngineCommand::SeekTo(secs));
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(EngineCommand::SetVolume(volume));
    }

    pub fn set_muted(&self, muted: bool) {
        self.send(EngineCommand::SetMuted(muted));
    }

    pub fn unload(&self) {
        self.send(EngineCommand::Unload);
    }
}

/// Binds a resolved URI to a fresh engine instance for one track entry.
pub trait EngineFactory: Send {
    fn bind(
        &mut self,
        entry: &TrackEntry,
        uri: &str,
        volume: f32,
        muted: bool,
        events: mpsc::Sender<EngineEvent>,
    ) -> anyhow::Result<EngineHandle>;
}

use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this in the `Hello` handshake and can refuse
/// to talk to an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// One playlist entry as it appears on the wire.  The engine handle bound to
/// an entry never leaves the daemon; snapshots carry metadata only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    /// Artwork reference (cover URL).
    #[serde(default)]
    pub img_url: String,
    /// Source locator, when the submitter already knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Set after a resolution or engine failure; disabled entries are skipped
    /// by automatic track selection until explicitly re-selected.
    #[serde(default)]
    pub disabled: bool,
}

/// Strategy selecting the next index when a track ends naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    All,
    One,
    Shuffle,
}

impl LoopMode {
    /// Numeric codes kept for compatibility with clients that speak the
    /// original 0/1/2 encoding.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LoopMode::All),
            1 => Some(LoopMode::One),
            2 => Some(LoopMode::Shuffle),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            LoopMode::All => 0,
            LoopMode::One => 1,
            LoopMode::Shuffle => 2,
        }
    }
}

/// Why a `PlayState` event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayReason {
    Playing,
    Loaded,
    Ended,
    Paused,
    Stopped,
    #[serde(rename = "err")]
    Err,
}

/// Which execution surface should receive outbound events and drive actual
/// audio decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackContext {
    Foreground,
    #[default]
    Background,
}

/// Full state of the player.  `rev` is a monotonically increasing counter
/// incremented every time a snapshot is published.  Clients can use it to
/// detect missed updates and resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub rev: u64,
    pub playlist: Vec<TrackEntry>,
    /// Index of the current track, -1 when no track is current.
    pub index: i64,
    pub loop_mode: LoopMode,
    pub volume: f32,
    pub muted: bool,
    #[serde(default)]
    pub context: PlaybackContext,
    pub current_id: Option<String>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub position: f64,
    pub playing: bool,
}

/// Messages sent from clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Load and start a track; no index means the current (or first) one.
    Play { index: Option<usize> },
    PlayById { id: String },
    LoadById { id: String },
    Pause,
    TogglePause,
    Next,
    Prev,
    Random,
    /// Seek to `fraction` x duration of the current track.
    Seek { fraction: f64 },
    /// Relative seek by the configured skip time.
    SeekForward,
    SeekBackward,
    SetVolume { value: f32 },
    AdjustVolume { delta: f32 },
    Mute,
    Unmute,
    SetLoopMode { mode: LoopMode },
    InsertTrack { entry: TrackEntry, index: Option<usize> },
    RemoveTrack { index: usize },
    AppendTracks { entries: Vec<TrackEntry> },
    ClearPlaylist,
    SetPlaylist { entries: Vec<TrackEntry> },
    SetTrackDisabled { index: usize, disabled: bool },
    SetMode { context: PlaybackContext },
    SetRefreshRate { hz: u32 },
    GetState,
    /// Resolver response: a playable URI for the track with this id.
    MediaUriResolved { id: String, uri: String },
    /// Resolver response: no URI could be produced for this id.
    ResolveFailed { id: String, error: String },
}

/// Events published by the daemon (broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    /// Sent once when the player core starts.
    Ready,
    /// Snapshot of the playlist after every mutation.
    Playlist { tracks: Vec<TrackEntry> },
    /// The entry that just became current.
    Load { track: TrackEntry },
    PlayState { is_playing: bool, reason: PlayReason },
    /// Periodic position report while audio is active.
    FrameUpdate {
        id: String,
        duration: f64,
        pos: f64,
        /// Wall-clock milliseconds at which the current track last started.
        played_from: i64,
        playing: bool,
    },
    /// Global volume in percent (0-100).
    Volume { percent: f32 },
    Mute { muted: bool },
    /// A resolution or engine failure, with the underlying detail.
    PlayFailed { error: String },
    /// Resolution request to the external media URI resolver.
    RetrieveUrl {
        index: usize,
        track: TrackEntry,
        play_now: bool,
    },
    /// Full-state snapshot, emitted where the original sent full updates.
    State { data: PlayerState },
    /// WARN/ERROR log line forwarded to clients.
    Log { message: String },
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: PlayerState,
    },
    Event {
        context: PlaybackContext,
        #[serde(flatten)]
        event: Event,
    },
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

//! OS media controls bridge (MPRIS/SMTC/Now Playing).
//!
//! Publishes metadata, playback state, and position to the platform media
//! surface, and maps inbound transport actions onto protocol commands.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
    SeekDirection,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

use playdeck_proto::protocol::{Command, Event, TrackEntry};

use crate::Outbound;

const DISPLAY_NAME: &str = "Playdeck";
const DBUS_NAME: &str = "playdeck";

/// Snapshot shared with the platform callback thread.
#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    is_playing: bool,
    position_secs: f64,
    duration_secs: f64,
}

pub struct MediaControlsBridge {
    events: Receiver<Outbound>,
    control_state: Arc<Mutex<ControlState>>,
    controls: Option<MediaControls>,
    current_track: Option<TrackEntry>,
}

impl MediaControlsBridge {
    /// Creates the bridge and attempts to initialize platform media controls.
    /// Must be called on the thread that will run [`MediaControlsBridge::run`].
    pub fn new(events: Receiver<Outbound>, cmd_tx: Sender<Command>) -> Self {
        let control_state = Arc::new(Mutex::new(ControlState::default()));
        let controls = Self::create_controls(cmd_tx, Arc::clone(&control_state));
        Self {
            events,
            control_state,
            controls,
            current_track: None,
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(
        cmd_tx: Sender<Command>,
        control_state: Arc<Mutex<ControlState>>,
    ) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: DISPLAY_NAME,
            dbus_name: DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!("media controls backend unavailable: {:?}", err);
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            let snapshot = match control_state.lock() {
                Ok(state) => *state,
                Err(poisoned) => *poisoned.into_inner(),
            };
            if let Some(cmd) = map_control_event(event, snapshot) {
                if cmd_tx.try_send(cmd).is_err() {
                    warn!("core inbox full, dropping transport command");
                }
            }
        }) {
            warn!("failed to attach media controls handler: {:?}", err);
            return None;
        }

        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(
        _cmd_tx: Sender<Command>,
        _control_state: Arc<Mutex<ControlState>>,
    ) -> Option<MediaControls> {
        // Souvlaki requires an HWND on Windows, and a headless daemon has none.
        warn!("Windows media controls are disabled (no HWND available)");
        None
    }

    fn update_control_state<F>(&self, update: F)
    where
        F: FnOnce(&mut ControlState),
    {
        match self.control_state.lock() {
            Ok(mut state) => update(&mut state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                update(&mut state);
            }
        }
    }

    fn control_state_snapshot(&self) -> ControlState {
        match self.control_state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn publish_playback(&mut self) {
        let snapshot = self.control_state_snapshot();
        let has_track = self.current_track.is_some();
        let Some(controls) = self.controls.as_mut() else {
            return;
        };

        let progress = Some(MediaPosition(Duration::from_secs_f64(
            snapshot.position_secs.max(0.0),
        )));
        let playback = if !has_track {
            MediaPlayback::Stopped
        } else if snapshot.is_playing {
            MediaPlayback::Playing { progress }
        } else {
            MediaPlayback::Paused { progress }
        };

        if let Err(err) = controls.set_playback(playback) {
            warn!("failed to publish playback state: {:?}", err);
        }
    }

    fn publish_metadata(&mut self) {
        let snapshot = self.control_state_snapshot();
        let Some(controls) = self.controls.as_mut() else {
            return;
        };

        let result = match &self.current_track {
            Some(track) => {
                let duration =
                    (snapshot.duration_secs > 0.0).then(|| Duration::from_secs_f64(snapshot.duration_secs));
                controls.set_metadata(MediaMetadata {
                    title: Some(track.title.as_str()),
                    artist: Some(track.artist.as_str()),
                    album: Some(track.album.as_str()),
                    cover_url: (!track.img_url.is_empty()).then_some(track.img_url.as_str()),
                    duration,
                })
            }
            None => controls.set_metadata(MediaMetadata::default()),
        };

        if let Err(err) = result {
            warn!("failed to publish metadata: {:?}", err);
        }
    }

    fn handle_event(&mut self, outbound: Outbound) {
        match outbound.event {
            Event::Load { track } => {
                self.current_track = Some(track);
                self.publish_metadata();
            }
            Event::PlayState { is_playing, .. } => {
                self.update_control_state(|state| state.is_playing = is_playing);
                self.publish_playback();
            }
            Event::FrameUpdate {
                duration,
                pos,
                playing,
                ..
            } => {
                self.update_control_state(|state| {
                    state.duration_secs = duration;
                    state.position_secs = pos;
                    state.is_playing = playing;
                });
                self.publish_playback();
            }
            Event::Playlist { tracks } if tracks.is_empty() => {
                self.current_track = None;
                self.update_control_state(|state| *state = ControlState::default());
                self.publish_playback();
                self.publish_metadata();
            }
            _ => {}
        }
    }

    /// Blocking bridge loop; run on its own thread.
    pub fn run(mut self) {
        info!("media controls bridge started");
        loop {
            match self.events.blocking_recv() {
                Ok(outbound) => self.handle_event(outbound),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("media controls bridge lagged by {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// Maps one OS transport action onto a protocol command.
fn map_control_event(event: MediaControlEvent, state: ControlState) -> Option<Command> {
    match event {
        MediaControlEvent::Play => Some(Command::Play { index: None }),
        MediaControlEvent::Pause | MediaControlEvent::Stop => Some(Command::Pause),
        MediaControlEvent::Toggle => {
            if state.is_playing {
                Some(Command::Pause)
            } else {
                Some(Command::Play { index: None })
            }
        }
        MediaControlEvent::Next => Some(Command::Next),
        MediaControlEvent::Previous => Some(Command::Prev),
        MediaControlEvent::Seek(SeekDirection::Forward) => Some(Command::SeekForward),
        MediaControlEvent::Seek(SeekDirection::Backward) => Some(Command::SeekBackward),
        MediaControlEvent::SeekBy(direction, delta) => {
            if state.duration_secs <= 0.0 {
                return None;
            }
            let delta_secs = delta.as_secs_f64();
            let target = match direction {
                SeekDirection::Forward => state.position_secs + delta_secs,
                SeekDirection::Backward => (state.position_secs - delta_secs).max(0.0),
            };
            let fraction = (target / state.duration_secs).clamp(0.0, 1.0);
            Some(Command::Seek { fraction })
        }
        MediaControlEvent::SetPosition(MediaPosition(position)) => {
            if state.duration_secs <= 0.0 {
                return None;
            }
            let fraction = (position.as_secs_f64() / state.duration_secs).clamp(0.0, 1.0);
            Some(Command::Seek { fraction })
        }
        MediaControlEvent::SetVolume(volume) => Some(Command::SetVolume {
            value: volume as f32,
        }),
        MediaControlEvent::OpenUri(_) | MediaControlEvent::Raise | MediaControlEvent::Quit => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(is_playing: bool, position_secs: f64, duration_secs: f64) -> ControlState {
        ControlState {
            is_playing,
            position_secs,
            duration_secs,
        }
    }

    #[test]
    fn test_toggle_pauses_when_playing() {
        let cmd = map_control_event(MediaControlEvent::Toggle, state(true, 0.0, 0.0));
        assert!(matches!(cmd, Some(Command::Pause)));
    }

    #[test]
    fn test_toggle_plays_when_paused() {
        let cmd = map_control_event(MediaControlEvent::Toggle, state(false, 0.0, 0.0));
        assert!(matches!(cmd, Some(Command::Play { index: None })));
    }

    #[test]
    fn test_set_position_maps_to_seek_fraction() {
        let cmd = map_control_event(
            MediaControlEvent::SetPosition(MediaPosition(Duration::from_secs(50))),
            state(true, 0.0, 200.0),
        );
        match cmd {
            Some(Command::Seek { fraction }) => assert!((fraction - 0.25).abs() < 1e-9),
            other => panic!("expected Seek, got {:?}", other),
        }
    }

    #[test]
    fn test_seek_by_clamps_at_track_end() {
        let cmd = map_control_event(
            MediaControlEvent::SeekBy(SeekDirection::Forward, Duration::from_secs(60)),
            state(true, 180.0, 200.0),
        );
        match cmd {
            Some(Command::Seek { fraction }) => assert!((fraction - 1.0).abs() < 1e-9),
            other => panic!("expected Seek, got {:?}", other),
        }
    }

    #[test]
    fn test_seek_by_without_duration_is_ignored() {
        let cmd = map_control_event(
            MediaControlEvent::SeekBy(SeekDirection::Backward, Duration::from_secs(5)),
            state(true, 10.0, 0.0),
        );
        assert!(cmd.is_none());
    }

    #[test]
    fn test_fixed_step_seek_maps_to_transport_commands() {
        assert!(matches!(
            map_control_event(
                MediaControlEvent::Seek(SeekDirection::Forward),
                state(true, 0.0, 0.0)
            ),
            Some(Command::SeekForward)
        ));
        assert!(matches!(
            map_control_event(
                MediaControlEvent::Seek(SeekDirection::Backward),
                state(true, 0.0, 0.0)
            ),
            Some(Command::SeekBackward)
        ));
    }
}

//! Daemon core: the single logical thread of control.
//!
//! Client commands, OS transport actions, engine lifecycle callbacks, and the
//! periodic reporter tick all land in one `tokio::select!` loop and are
//! applied to the player one at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use playdeck_proto::config::Config;
use playdeck_proto::protocol::{Command, PlayerState};
use playdeck_proto::state::PersistentState;

use crate::engine::{EngineEvent, EngineEventKind, EngineFactory};
use crate::player::{Player, SkipDirection};
use crate::scrobble::Scrobbler;
use crate::Outbound;

pub struct DaemonCore {
    player: Player,
    skip_time_secs: f64,
    refresh_rate_hz: u32,
    state_file: PathBuf,
    shared_state: Arc<RwLock<PlayerState>>,
    scrobbler: Option<Arc<Scrobbler>>,
}

impl DaemonCore {
    pub fn new(
        config: &Config,
        persistent: PersistentState,
        events: broadcast::Sender<Outbound>,
        engine_tx: mpsc::Sender<EngineEvent>,
        factory: Box<dyn EngineFactory>,
    ) -> Self {
        let player = Player::new(
            factory,
            events,
            engine_tx,
            config.player.context,
            persistent.volume,
            persistent.muted,
            persistent.loop_mode,
        );
        let shared_state = Arc::new(RwLock::new(player.state()));
        Self {
            player,
            skip_time_secs: config.player.skip_time_secs,
            refresh_rate_hz: config.player.refresh_rate_hz.max(1),
            state_file: config.daemon.state_file.clone(),
            shared_state,
            scrobbler: Scrobbler::from_config(&config.scrobble).map(Arc::new),
        }
    }

    /// Snapshot shared with the socket server for the `Hello` handshake.
    pub fn shared_state(&self) -> Arc<RwLock<PlayerState>> {
        Arc::clone(&self.shared_state)
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut engine_events: mpsc::Receiver<EngineEvent>,
    ) -> anyhow::Result<()> {
        self.player.ready();

        let mut ticker = Self::make_ticker(self.refresh_rate_hz);
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    let old_rate = self.refresh_rate_hz;
                    self.handle_command(cmd);
                    if self.refresh_rate_hz != old_rate {
                        ticker = Self::make_ticker(self.refresh_rate_hz);
                    }
                    *self.shared_state.write().await = self.player.state();
                }
                event = engine_events.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch_scrobble(&event);
                    self.player.on_engine_event(event);
                    *self.shared_state.write().await = self.player.state();
                }
                _ = ticker.tick() => {
                    // Reporter fires only while an engine is actively playing.
                    if self.player.playing() {
                        self.player.send_frame_update();
                    }
                }
            }
        }
        Ok(())
    }

    fn make_ticker(hz: u32) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(Duration::from_millis(1000 / u64::from(hz.max(1))));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    fn handle_command(&mut self, cmd: Command) {
        debug!("command: {:?}", cmd);
        match cmd {
            Command::Play { index } => self.player.play(index),
            Command::PlayById { id } => self.player.play_by_id(&id),
            Command::LoadById { id } => self.player.load_by_id(&id),
            Command::Pause => self.player.pause(),
            Command::TogglePause => {
                if self.player.playing() {
                    self.player.pause();
                } else {
                    self.player.play(None);
                }
            }
            Command::Next => self.player.skip(SkipDirection::Next),
            Command::Prev => self.player.skip(SkipDirection::Prev),
            Command::Random => self.player.skip(SkipDirection::Random),
            Command::Seek { fraction } => self.player.seek(fraction),
            Command::SeekForward => self.player.seek_relative(self.skip_time_secs),
            Command::SeekBackward => self.player.seek_relative(-self.skip_time_secs),
            Command::SetVolume { value } => {
                self.player.set_volume(value);
                self.persist();
            }
            Command::AdjustVolume { delta } => {
                self.player.adjust_volume(delta);
                self.persist();
            }
            Command::Mute => {
                self.player.set_muted(true);
                self.persist();
            }
            Command::Unmute => {
                self.player.set_muted(false);
                self.persist();
            }
            Command::SetLoopMode { mode } => {
                self.player.set_loop_mode(mode);
                self.persist();
            }
            Command::InsertTrack { entry, index } => self.player.insert(entry, index),
            Command::RemoveTrack { index } => self.player.remove_at(index),
            Command::AppendTracks { entries } => self.player.append_all(entries),
            Command::ClearPlaylist => self.player.clear(),
            Command::SetPlaylist { entries } => self.player.replace_all(entries),
            Command::SetTrackDisabled { index, disabled } => {
                self.player.set_track_disabled(index, disabled)
            }
            Command::SetMode { context } => self.player.set_context(context),
            Command::SetRefreshRate { hz } => self.refresh_rate_hz = hz.max(1),
            Command::GetState => self.player.send_state_event(),
            Command::MediaUriResolved { id, uri } => self.player.on_uri_resolved(&id, uri),
            Command::ResolveFailed { id, error } => self.player.on_resolve_failed(&id, &error),
        }
    }

    /// Fire-and-forget scrobble calls, dispatched before the player reacts so
    /// the ended track's metadata and start timestamp are still current.
    fn dispatch_scrobble(&self, event: &EngineEvent) {
        let Some(scrobbler) = &self.scrobbler else {
            return;
        };
        let Some(track) = self.player.entry_by_id(&event.id) else {
            return;
        };
        match event.kind {
            EngineEventKind::Started => {
                let scrobbler = Arc::clone(scrobbler);
                tokio::spawn(async move {
                    if let Err(e) = scrobbler.update_now_playing(&track).await {
                        warn!("scrobble now-playing failed: {}", e);
                    }
                });
            }
            EngineEventKind::Ended => {
                let scrobbler = Arc::clone(scrobbler);
                let started_at = self.player.played_from() / 1000;
                tokio::spawn(async move {
                    if let Err(e) = scrobbler.scrobble(&track, started_at).await {
                        warn!("scrobble failed: {}", e);
                    }
                });
            }
            _ => {}
        }
    }

    fn persist(&self) {
        let state = PersistentState {
            volume: self.player.volume(),
            muted: self.player.muted(),
            loop_mode: self.player.loop_mode(),
        };
        if let Err(e) = state.save(&self.state_file) {
            warn!("failed to save state to {:?}: {}", self.state_file, e);
        }
    }
}

mod core;
mod engine;
mod media_controls;
mod mpv;
mod player;
mod scrobble;
mod socket;

use playdeck_proto::config::Config;
use playdeck_proto::protocol::{Event, PlaybackContext};
use playdeck_proto::state::PersistentState;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// One outbound player event, tagged with the execution context that should
/// receive it.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub context: PlaybackContext,
    pub event: Event,
}

/// A custom tracing layer that forwards log records to connected clients
struct ClientLogLayer {
    sender: broadcast::Sender<Outbound>,
    context: PlaybackContext,
}

impl ClientLogLayer {
    fn new(sender: broadcast::Sender<Outbound>, context: PlaybackContext) -> Self {
        Self { sender, context }
    }
}

impl<S> tracing_subscriber::Layer<S> for ClientLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to clients to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();

        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // Send to broadcast channel (ignore errors - no receivers is OK)
        let _ = self.sender.send(Outbound {
            context: self.context,
            event: Event::Log { message },
        });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Event channel first so the log layer can forward into it
    let (events_tx, _) = broadcast::channel::<Outbound>(256);

    let config = Config::load()?;

    // Setup file logging + client-forwarding layer
    let data_dir = playdeck_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let client_layer = ClientLogLayer::new(events_tx.clone(), config.player.context);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(client_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,playdeck_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", Config::config_path());

    if let Some(parent) = config.daemon.pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.daemon.pid_file, std::process::id().to_string())?;

    let persistent = PersistentState::load(&config.daemon.state_file);

    // Inbound command funnel: socket clients and the media-controls bridge
    // both feed the core through this channel.
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(256);
    // Engine lifecycle callbacks arrive on their own channel.
    let (engine_tx, engine_rx) = tokio::sync::mpsc::channel(64);

    let daemon_core = core::DaemonCore::new(
        &config,
        persistent,
        events_tx.clone(),
        engine_tx,
        Box::new(mpv::MpvEngineFactory::new()),
    );

    let shared_state = daemon_core.shared_state();

    // Start TCP socket server
    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        shared_state,
        cmd_tx.clone(),
        events_tx.clone(),
    );

    // Media controls run on their own thread; platform backends block.
    {
        let events_rx = events_tx.subscribe();
        let cmd_tx = cmd_tx.clone();
        std::thread::spawn(move || {
            media_controls::MediaControlsBridge::new(events_rx, cmd_tx).run();
        });
    }

    info!("Daemon initialised, running event loop");
    daemon_core.run(cmd_rx, engine_rx).await?;

    Ok(())
}

use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use postbox_common::{Signal, internal, logging, logging::LogFormat};
use postbox_delivery::{
    ArchivalService, ConfigHandle, Dispatcher, QueueConfig, TransportConfig,
};
use postbox_store::{QueueStore, StoreConfig};
use serde::Deserialize;
use tokio::sync::broadcast;

/// Daemon configuration, read from a RON file
///
/// ```ron
/// Postbox (
///     store: Sqlite(path: "/var/lib/postbox/queue.db"),
///     queue: (batch_size: 20, grouping: SenderSubject),
///     transport: Simulated((failure_rate: 0.05)),
///     log_format: Json,
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Postbox {
    #[serde(default)]
    pub store: StoreConfig,
    /// Hot-reloadable on SIGHUP
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Overrides the generated `hostname-pid-suffix` identity
    #[serde(default)]
    pub processor_id: Option<String>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Find the configuration file using the following precedence:
/// 1. `explicit`, typically from `--config`
/// 2. `POSTBOX_CONFIG` environment variable
/// 3. ./postbox.config.ron (current working directory)
/// 4. /etc/postbox/postbox.config.ron (system-wide config)
///
/// # Errors
/// If the chosen file does not exist, or none of the defaults do
pub fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("Configuration file does not exist: {}", path.display());
    }

    if let Ok(env_path) = std::env::var("POSTBOX_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "POSTBOX_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./postbox.config.ron"),
        PathBuf::from("/etc/postbox/postbox.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config\n  - POSTBOX_CONFIG environment variable\n{paths_tried}"
    )
}

impl Postbox {
    /// Parse and validate a configuration
    ///
    /// # Errors
    /// If the text is not valid RON for this shape, or a setting is out of range
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let postbox: Self = ron::from_str(content)?;
        postbox.validate()?;
        Ok(postbox)
    }

    /// # Errors
    /// If the file cannot be read, parsed or validated
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// # Errors
    /// The first setting that is out of range
    pub fn validate(&self) -> anyhow::Result<()> {
        self.queue.validate()?;
        match &self.transport {
            TransportConfig::Simulated(simulated) => simulated.validate()?,
        }
        Ok(())
    }

    /// Open the configured store, for one-shot commands
    ///
    /// # Errors
    /// If the store cannot be opened
    pub fn open_store(&self) -> anyhow::Result<Arc<dyn QueueStore>> {
        Ok(self.store.clone().into_store()?)
    }

    /// Run the dispatcher and the archival loop until shutdown.
    ///
    /// `source` is the file re-read on SIGHUP; without one, reloads are ignored.
    ///
    /// # Errors
    /// If the store or transport cannot be set up, or signal handlers cannot
    /// be installed
    pub async fn run(self, source: Option<PathBuf>) -> anyhow::Result<()> {
        logging::init(self.log_format);

        let Self {
            store,
            queue,
            transport,
            processor_id,
            ..
        } = self;

        let store = store.into_store()?;
        let transport = transport.into_transport()?;
        let config = ConfigHandle::new(queue)?;

        let mut dispatcher = Dispatcher::new(Arc::clone(&store), transport, config.clone());
        if let Some(processor_id) = processor_id {
            dispatcher = dispatcher.with_processor_id(processor_id);
        }
        let archival = ArchivalService::new(store, config.clone());

        internal!(level = INFO, "Postbox running as {}", dispatcher.processor_id());

        let dispatch_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let archive_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let serving = async {
            let (dispatched, archived) = tokio::join!(
                dispatcher.serve(dispatch_shutdown),
                archival.serve(archive_shutdown)
            );
            dispatched.and(archived)
        };
        tokio::pin!(serving);

        let ret = tokio::select! {
            r = &mut serving => r.map_err(anyhow::Error::from),
            r = signals(config, source) => match r {
                Ok(()) => tokio::select! {
                    r = &mut serving => r.map_err(anyhow::Error::from),
                    _ = tokio::signal::ctrl_c() => {
                        internal!(level = WARN, "Forced shutdown, in-flight deliveries abandoned");
                        Ok(())
                    }
                },
                Err(err) => Err(err),
            },
        };

        // Nobody may be listening any more
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
        internal!(level = INFO, "Shutting down...");

        ret
    }
}

/// Re-read `path` and publish its `queue` section.
///
/// Other sections only take effect on restart.
///
/// # Errors
/// If the file is unreadable or invalid; the running configuration is kept
pub fn reload(handle: &ConfigHandle, path: &Path) -> anyhow::Result<()> {
    let next = Postbox::load(path)?;
    handle.update(next.queue)?;
    internal!(level = INFO, "Reloaded queue configuration from {}", path.display());
    Ok(())
}

/// Wait for a shutdown request, handling reloads until then.
async fn signals(config: ConfigHandle, source: Option<PathBuf>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
                break;
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "Terminate Signal received, shutting down");
                break;
            }
            _ = hangup.recv() => {
                match source.as_deref() {
                    Some(path) => {
                        if let Err(err) = reload(&config, path) {
                            tracing::error!("Ignoring configuration reload: {err:#}");
                        }
                    }
                    None => tracing::warn!("No configuration file to reload"),
                }
                let _ = SHUTDOWN_BROADCAST.send(Signal::Reload);
            }
        }
    }

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

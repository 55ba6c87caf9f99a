use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use notify::{RecursiveMode, Watcher};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        ConfigurationValidator,
        loader::{ConfigFormat, load_configuration_dir, load_configuration_file},
        models::{Configuration, Message},
        settings::FileProviderSettings,
    },
    ports::config_provider::Provider,
};

pub const FILE_PROVIDER_NAME: &str = "file";

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Directory(PathBuf),
}

impl Source {
    fn path(&self) -> &Path {
        match self {
            Self::File(path) | Self::Directory(path) => path,
        }
    }

    /// Blocking read and validation of the source
    fn read(&self) -> Result<Configuration> {
        let config = match self {
            Self::File(path) => load_configuration_file(path)?,
            Self::Directory(dir) => load_configuration_dir(dir)?,
        };
        ConfigurationValidator::validate(&config)
            .wrap_err_with(|| format!("Invalid configuration in {}", self.path().display()))?;
        Ok(config)
    }
}

/// Dynamic configuration from one file or a directory of `.yaml/.yml/.toml/.json` files.
///
/// The source is re-read on filesystem changes (when watching), on SIGHUP, and whenever the
/// [`FileProvider::reload_handle`] is notified. Snapshots failing validation are not emitted.
pub struct FileProvider {
    source: Source,
    watch: bool,
    throttle: Option<Duration>,
    reload: Arc<Notify>,
}

impl FileProvider {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_source(Source::File(path.into()))
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::with_source(Source::Directory(path.into()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            watch: true,
            throttle: None,
            reload: Arc::new(Notify::new()),
        }
    }

    pub fn from_settings(settings: &FileProviderSettings) -> Result<Self> {
        let provider = match (&settings.filename, &settings.directory) {
            (Some(file), None) => Self::file(file),
            (None, Some(dir)) => Self::directory(dir),
            (None, None) => return Err(eyre!("File provider needs a filename or a directory")),
            (Some(_), Some(_)) => {
                return Err(eyre!("File provider accepts a filename or a directory, not both"));
            }
        };
        Ok(provider
            .with_watch(settings.watch)
            .with_throttle(settings.throttle_duration))
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_throttle(mut self, throttle: Option<Duration>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Notify the returned handle to force a re-read
    pub fn reload_handle(&self) -> Arc<Notify> {
        self.reload.clone()
    }

    /// Read and validate the source on the blocking pool
    async fn load(&self) -> Result<Configuration> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.read())
            .await
            .wrap_err("Configuration read task failed")?
    }

    /// Send the current snapshot; false once the receiver is gone.
    async fn emit(&self, tx: &mpsc::Sender<Message>) -> bool {
        match self.load().await {
            Ok(config) => {
                tracing::debug!(
                    path = %self.source.path().display(),
                    services = config.services.len(),
                    "Emitting configuration"
                );
                tx.send(Message::new(FILE_PROVIDER_NAME, config)).await.is_ok()
            }
            Err(e) => {
                tracing::error!(
                    path = %self.source.path().display(),
                    error = ?e,
                    "Failed to load configuration, keeping the previous one"
                );
                true
            }
        }
    }

    fn create_watcher(&self, tx: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
        let (watch_dir, file_name) = match &self.source {
            Source::File(path) => {
                let file_name = path
                    .file_name()
                    .ok_or_else(|| eyre!("Invalid config path: {}", path.display()))?
                    .to_owned();
                let parent = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                (parent.to_path_buf(), Some(file_name))
            }
            Source::Directory(dir) => (dir.clone(), None),
        };

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let relevant = event.paths.iter().any(|p| match &file_name {
                            Some(name) => p.file_name() == Some(name.as_os_str()),
                            None => ConfigFormat::from_path(p).is_some(),
                        });
                        if (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove())
                            && relevant
                        {
                            tracing::debug!("Config source changed: {:?}", event.kind);
                            // Try to send update signal, ignore if channel full or closed
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch {}", watch_dir.display()))?;
        Ok(watcher)
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        FILE_PROVIDER_NAME
    }

    async fn init(&self) -> Result<()> {
        let path = self.source.path();
        let exists = match tokio::fs::metadata(path).await {
            Ok(meta) => match &self.source {
                Source::File(_) => meta.is_file(),
                Source::Directory(_) => meta.is_dir(),
            },
            Err(_) => false,
        };
        if !exists {
            return Err(eyre!("Configuration source not found: {}", path.display()));
        }
        Ok(())
    }

    async fn provide(&self, tx: mpsc::Sender<Message>, token: CancellationToken) -> Result<()> {
        let (changed_tx, mut changed_rx) = mpsc::channel(1);
        // Kept alive for the duration of the feed; dropping it stops the OS watch.
        let _watcher = if self.watch {
            Some(self.create_watcher(changed_tx)?)
        } else {
            drop(changed_tx);
            None
        };
        let mut hangup = Hangup::new();

        if !self.emit(&tx).await {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                Some(()) = changed_rx.recv() => {}
                _ = self.reload.notified() => {
                    tracing::info!("Configuration reload requested");
                }
                _ = hangup.recv() => {
                    tracing::info!("Received SIGHUP, re-reading configuration");
                }
            }
            if !self.emit(&tx).await {
                return Ok(());
            }
        }
    }

    async fn get_config(&self) -> Result<Message> {
        let config = self.load().await?;
        Ok(Message::new(FILE_PROVIDER_NAME, config))
    }

    fn throttle_duration(&self) -> Option<Duration> {
        self.throttle
    }
}

#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn new() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::hangup()) {
            Ok(sig) => Self(Some(sig)),
            Err(e) => {
                tracing::warn!("Failed to register SIGHUP handler: {}", e);
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        match &mut self.0 {
            Some(sig) => {
                if sig.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

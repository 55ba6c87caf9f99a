//! Configuration pipeline: provider feed, per-provider dedup/merge, and listener fan-out.
//!
//! ```text
//! provider --mpsc--> merge task --watch (latest wins)--> apply task --> listeners
//! ```
//!
//! The merge task keeps the latest snapshot per provider and publishes the whole map through
//! a `watch` channel, so an apply task busy with listeners never blocks ingestion; it simply
//! picks up the newest map when it is done. The apply task is single-flight: listeners for
//! one snapshot all finish before the next map is read.
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        models::{Configuration, Configurations, Message},
        settings::ListenerPanicPolicy,
    },
    core::merge::merge_configurations,
    ports::config_provider::Provider,
    utils::routines::RoutinePool,
};

const MESSAGE_BUFFER: usize = 100;

/// Callback receiving every applied configuration
pub type ConfigurationListener = Arc<dyn Fn(&Arc<Configuration>) + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("configuration watcher already started")]
    AlreadyStarted,
}

pub struct ConfigurationWatcher {
    provider: Arc<dyn Provider>,
    pool: RoutinePool,
    required_provider: Option<String>,
    panic_policy: ListenerPanicPolicy,
    listeners: Vec<ConfigurationListener>,
    last_applied: Option<Arc<Configuration>>,
    started: bool,
}

impl ConfigurationWatcher {
    pub fn new(
        pool: RoutinePool,
        provider: Arc<dyn Provider>,
        required_provider: Option<String>,
    ) -> Self {
        Self {
            provider,
            pool,
            required_provider,
            panic_policy: ListenerPanicPolicy::default(),
            listeners: Vec::new(),
            last_applied: None,
            started: false,
        }
    }

    pub fn with_panic_policy(mut self, policy: ListenerPanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Treat `config` as already applied, e.g. after a synchronous bootstrap.
    pub fn with_applied(mut self, config: Arc<Configuration>) -> Self {
        self.last_applied = Some(config);
        self
    }

    /// Register a listener; listeners added after [`ConfigurationWatcher::start`] are ignored.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(&Arc<Configuration>) + Send + Sync + 'static,
    {
        if self.started {
            tracing::warn!("Listener registered after watcher start is ignored");
            return;
        }
        self.listeners.push(Arc::new(listener));
    }

    /// Launch the provider feed, the merge task and the apply task on the pool.
    pub fn start(&mut self) -> Result<(), WatcherError> {
        if self.started {
            return Err(WatcherError::AlreadyStarted);
        }
        self.started = true;

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (merged_tx, merged_rx) = watch::channel::<Option<Arc<Configurations>>>(None);

        let provider = self.provider.clone();
        self.pool.go_ctx("config-provider", move |token| async move {
            if let Err(e) = provider.provide(message_tx, token).await {
                tracing::error!(provider = provider.name(), error = ?e, "Configuration provider stopped");
            }
        });

        self.pool
            .go_ctx("config-merge", move |token| merge_loop(message_rx, merged_tx, token));

        let applier = Applier {
            listeners: std::mem::take(&mut self.listeners),
            required_provider: self.required_provider.clone(),
            panic_policy: self.panic_policy,
            last_applied: self.last_applied.take(),
            root: self.pool.token().clone(),
        };
        self.pool
            .go_ctx("config-apply", move |token| applier.run(merged_rx, token));

        tracing::info!(
            required_provider = ?self.required_provider,
            policy = ?self.panic_policy,
            "Configuration watcher started"
        );
        Ok(())
    }
}

async fn merge_loop(
    mut rx: mpsc::Receiver<Message>,
    merged_tx: watch::Sender<Option<Arc<Configurations>>>,
    token: CancellationToken,
) {
    let mut latest = Configurations::new();

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            // Provider feed is gone; keep the last published map until shutdown.
            token.cancelled().await;
            return;
        };

        let Some(config) = message.configuration else {
            tracing::debug!(provider = %message.provider_name, "Skipping nil configuration");
            continue;
        };
        if config.is_empty() {
            tracing::debug!(provider = %message.provider_name, "Skipping empty configuration");
            continue;
        }
        if latest
            .get(&message.provider_name)
            .is_some_and(|previous| **previous == *config)
        {
            tracing::debug!(
                provider = %message.provider_name,
                "Skipping configuration identical to the provider's previous one"
            );
            continue;
        }

        latest.insert(message.provider_name, config);
        merged_tx.send_replace(Some(Arc::new(latest.clone())));
    }
}

struct Applier {
    listeners: Vec<ConfigurationListener>,
    required_provider: Option<String>,
    panic_policy: ListenerPanicPolicy,
    last_applied: Option<Arc<Configuration>>,
    root: CancellationToken,
}

impl Applier {
    async fn run(
        mut self,
        mut rx: watch::Receiver<Option<Arc<Configurations>>>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            let configurations = rx.borrow_and_update().clone();
            let Some(configurations) = configurations else {
                continue;
            };
            if !self.apply(&configurations) {
                return;
            }
        }
    }

    /// Returns false when the pipeline must stop.
    fn apply(&mut self, configurations: &Configurations) -> bool {
        if let Some(required) = &self.required_provider {
            if !configurations.contains_key(required) {
                tracing::debug!(
                    required_provider = %required,
                    "Withholding configuration until the required provider has reported"
                );
                return true;
            }
        }

        let merged = Arc::new(merge_configurations(configurations));
        if self.last_applied.as_deref() == Some(merged.as_ref()) {
            tracing::debug!("Skipping configuration identical to the applied one");
            return true;
        }

        tracing::info!(
            providers = ?configurations.keys().collect::<Vec<_>>(),
            services = merged.services.len(),
            "Applying configuration"
        );

        for (index, listener) in self.listeners.iter().enumerate() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&merged))) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                tracing::error!(listener = index, panic = %message, "Configuration listener panicked");

                if self.panic_policy == ListenerPanicPolicy::FailFast {
                    tracing::error!("Listener panic policy is fail-fast, shutting down");
                    self.root.cancel();
                    return false;
                }
            }
        }

        self.last_applied = Some(merged);
        true
    }
}

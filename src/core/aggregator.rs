//! Fan-in of several providers behind one [`Provider`].
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures_util::future::join_all;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::{Configurations, Message},
    core::merge::merge_configurations,
    ports::config_provider::Provider,
};

pub const AGGREGATOR_NAME: &str = "aggregator";

/// Runs every registered provider and throttles each feed independently.
pub struct ProviderAggregator {
    providers: Vec<Arc<dyn Provider>>,
    throttle: Duration,
}

impl ProviderAggregator {
    /// `throttle` applies to providers that do not declare their own interval
    pub fn new(throttle: Duration) -> Self {
        Self {
            providers: Vec::new(),
            throttle,
        }
    }

    /// Initialize and register a provider
    pub async fn add_provider(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        provider
            .init()
            .await
            .wrap_err_with(|| format!("Failed to initialize provider '{}'", provider.name()))?;
        tracing::info!(provider = provider.name(), "Provider registered");
        self.providers.push(provider);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }
}

#[async_trait]
impl Provider for ProviderAggregator {
    fn name(&self) -> &str {
        AGGREGATOR_NAME
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn provide(&self, tx: mpsc::Sender<Message>, token: CancellationToken) -> Result<()> {
        let feeds = self.providers.iter().map(|provider| {
            let throttle = provider.throttle_duration().unwrap_or(self.throttle);
            launch_provider(provider.clone(), tx.clone(), token.clone(), throttle)
        });
        join_all(feeds).await;
        Ok(())
    }

    /// Point-in-time snapshot of every provider, merged
    async fn get_config(&self) -> Result<Message> {
        let mut configurations = Configurations::new();
        for provider in &self.providers {
            let message = provider
                .get_config()
                .await
                .wrap_err_with(|| format!("Provider '{}' failed to load", provider.name()))?;
            if let Some(config) = message.configuration {
                configurations.insert(message.provider_name, config);
            }
        }
        Ok(Message::new(
            AGGREGATOR_NAME,
            merge_configurations(&configurations),
        ))
    }
}

/// Run one provider until it returns, logging its failure without affecting other feeds.
async fn launch_provider(
    provider: Arc<dyn Provider>,
    tx: mpsc::Sender<Message>,
    token: CancellationToken,
    throttle: Duration,
) {
    let name = provider.name().to_string();
    tracing::debug!(provider = %name, ?throttle, "Starting provider feed");

    let result = if throttle.is_zero() {
        provider.provide(tx, token).await
    } else {
        let (inner_tx, inner_rx) = mpsc::channel(16);
        let (result, ()) = tokio::join!(
            provider.provide(inner_tx, token.clone()),
            throttle_messages(inner_rx, tx, throttle, token)
        );
        result
    };

    match result {
        Ok(()) => tracing::debug!(provider = %name, "Provider feed finished"),
        Err(e) => tracing::error!(provider = %name, error = ?e, "Provider feed failed"),
    }
}

/// Forward at most one message per `interval`, keeping only the newest pending one.
pub(crate) async fn throttle_messages(
    mut rx: mpsc::Receiver<Message>,
    tx: mpsc::Sender<Message>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut pending: Option<Message> = None;
    let mut last_sent: Option<Instant> = None;

    loop {
        let deadline = last_sent.map(|at| at + interval).unwrap_or_else(Instant::now);
        tokio::select! {
            _ = token.cancelled() => return,
            received = rx.recv() => match received {
                Some(message) => {
                    let ready = last_sent.is_none_or(|at| at.elapsed() >= interval);
                    if ready && pending.is_none() {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                        last_sent = Some(Instant::now());
                    } else {
                        if pending.is_some() {
                            tracing::debug!(provider = %message.provider_name, "Superseding throttled configuration");
                        }
                        pending = Some(message);
                    }
                }
                None => {
                    if let Some(message) = pending.take() {
                        sleep_until(deadline).await;
                        let _ = tx.send(message).await;
                    }
                    return;
                }
            },
            _ = sleep_until(deadline), if pending.is_some() => {
                if let Some(message) = pending.take() {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                    last_sent = Some(Instant::now());
                }
            }
        }
    }
}

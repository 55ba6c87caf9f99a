use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::models::Message;

/// A source of dynamic configuration snapshots.
///
/// Implementations emit [`Message`]s tagged with their own name. A provider must never block
/// the pipeline for longer than it takes to hand a message to the channel.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique provider name, used as the merge key
    fn name(&self) -> &str;

    /// One-time setup before [`Provider::provide`] or [`Provider::get_config`]
    async fn init(&self) -> Result<()>;

    /// Emit snapshots into `tx` until `token` is cancelled.
    ///
    /// An error stops only this provider's feed.
    async fn provide(&self, tx: mpsc::Sender<Message>, token: CancellationToken) -> Result<()>;

    /// Synchronous point-in-time read used for bootstrap
    async fn get_config(&self) -> Result<Message>;

    /// Minimum interval between two emissions of this provider, overriding the default
    fn throttle_duration(&self) -> Option<Duration> {
        None
    }
}

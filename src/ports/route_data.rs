use std::sync::Arc;

use eyre::Result;

use crate::config::models::{Configuration, ServiceRoute};

/// Source of the service routes compiled by the router manager.
pub trait RouteResourceData: Send + Sync {
    /// Service routes of `config`, keyed by service name, in a stable order
    fn services(&self, config: &Configuration) -> Result<Vec<(String, Arc<ServiceRoute>)>>;
}

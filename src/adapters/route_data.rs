use std::sync::Arc;

use eyre::Result;

use crate::{
    config::models::{Configuration, ServiceRoute},
    ports::route_data::RouteResourceData,
};

/// Route data read straight from the applied snapshot
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotRouteData;

impl RouteResourceData for SnapshotRouteData {
    fn services(&self, config: &Configuration) -> Result<Vec<(String, Arc<ServiceRoute>)>> {
        Ok(config
            .services
            .iter()
            .map(|(name, service)| (name.clone(), Arc::new(service.clone())))
            .collect())
    }
}

//! Per-service balancer registry.
//!
//! One [`UpstreamResolver`] belongs to one configuration generation. Balancers are created
//! lazily on the first request for a service and seeded from that service's server list.
use std::sync::Arc;

use crate::{
    config::models::ServiceRoute,
    core::{
        errors::{ErrorCode, GatewayError},
        load_balancer::{Balancer, BalancerError, BalancerFactory, Node},
    },
};

/// Upstream resolution errors
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// No balancer exists yet for the service; retry once nodes are supplied
    #[error("upstream not initialized for service '{0}'")]
    NotInitialized(String),
    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        let code = match &err {
            UpstreamError::NotInitialized(_) => ErrorCode::UPSTREAM_NOT_INIT,
            UpstreamError::Balancer(BalancerError::NoHost) => ErrorCode::NO_UPSTREAM,
            UpstreamError::Balancer(BalancerError::AlgorithmNotSupported(_)) => {
                ErrorCode::INTERNAL_SERVER_ERROR
            }
        };
        GatewayError::with_detail(code, err.to_string())
    }
}

/// Service name to balancer map
pub struct UpstreamResolver {
    balancers: scc::HashMap<String, Arc<dyn Balancer>>,
    factory: Arc<BalancerFactory>,
    default_mode: String,
}

impl UpstreamResolver {
    pub fn new(factory: Arc<BalancerFactory>, default_mode: impl Into<String>) -> Self {
        Self {
            balancers: scc::HashMap::new(),
            factory,
            default_mode: default_mode.into(),
        }
    }

    /// Select from an existing balancer only
    pub async fn select(&self, service: &str, key: &str) -> Result<String, UpstreamError> {
        let balancer = self
            .balancer(service)
            .await
            .ok_or_else(|| UpstreamError::NotInitialized(service.to_string()))?;
        Ok(balancer.balance(key)?.address())
    }

    /// Resolve the next backend address for `service`.
    ///
    /// A missing balancer, or one with no selectable host, is (re)seeded from `route.servers`
    /// before a second selection attempt.
    pub async fn next(
        &self,
        service: &str,
        route: &ServiceRoute,
        key: &str,
    ) -> Result<String, UpstreamError> {
        match self.select(service, key).await {
            Ok(address) => return Ok(address),
            Err(UpstreamError::NotInitialized(_))
            | Err(UpstreamError::Balancer(BalancerError::NoHost)) => {
                tracing::debug!(service, "Seeding balancer from configured servers");
            }
            Err(e) => return Err(e),
        }

        let nodes: Vec<Node> = route.servers.iter().map(Node::from).collect();
        let mode = route.balance_mode.as_deref().unwrap_or(&self.default_mode);
        let balancer = self.ensure(service, mode, nodes).await?;
        Ok(balancer.balance(key)?.address())
    }

    /// Create the balancer for `service` or merge `nodes` into the existing one
    pub async fn ensure(
        &self,
        service: &str,
        mode: &str,
        nodes: Vec<Node>,
    ) -> Result<Arc<dyn Balancer>, UpstreamError> {
        if let Some(existing) = self.balancer(service).await {
            existing.add(&nodes);
            return Ok(existing);
        }

        let created = self.factory.create(mode, nodes.clone())?;
        let balancer = self
            .balancers
            .entry_async(service.to_string())
            .await
            .or_insert(created)
            .get()
            .clone();
        // Another request may have won the race; its pool still needs these nodes.
        balancer.add(&nodes);
        Ok(balancer)
    }

    pub async fn balancer(&self, service: &str) -> Option<Arc<dyn Balancer>> {
        self.balancers
            .get_async(service)
            .await
            .map(|entry| entry.get().clone())
    }

    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::Server;

    fn resolver() -> UpstreamResolver {
        UpstreamResolver::new(Arc::new(BalancerFactory::default()), "roundRobin")
    }

    fn orders() -> ServiceRoute {
        ServiceRoute::new()
            .with_server(Server::new("10.0.0.1", 8080))
            .with_server(Server::new("10.0.0.2", 8080))
    }

    #[tokio::test]
    async fn test_select_before_seed_is_not_initialized() {
        let resolver = resolver();
        assert_eq!(
            resolver.select("orders", "").await,
            Err(UpstreamError::NotInitialized("orders".to_string()))
        );
        assert!(resolver.is_empty());
    }

    #[tokio::test]
    async fn test_next_seeds_and_round_robins() {
        let resolver = resolver();
        let route = orders();
        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(resolver.next("orders", &route, "").await.unwrap());
        }
        assert_eq!(
            picked,
            vec![
                "10.0.0.1:8080",
                "10.0.0.2:8080",
                "10.0.0.1:8080",
                "10.0.0.2:8080"
            ]
        );
        assert_eq!(resolver.len(), 1);
    }

    #[tokio::test]
    async fn test_service_balance_mode_overrides_default() {
        let resolver = resolver();
        let route = orders().with_balance_mode("ipHash");
        resolver.next("orders", &route, "1.2.3.4").await.unwrap();
        let balancer = resolver.balancer("orders").await.unwrap();
        assert_eq!(balancer.name(), "ipHash");
    }

    #[tokio::test]
    async fn test_unsupported_algorithm_surfaces_as_internal_error() {
        let resolver = resolver();
        let route = orders().with_balance_mode("leastConn");
        let err = resolver.next("orders", &route, "").await.unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::Balancer(BalancerError::AlgorithmNotSupported(_))
        ));
        let gateway: GatewayError = err.into();
        assert_eq!(gateway.code, ErrorCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_service_without_servers_has_no_upstream() {
        let resolver = resolver();
        let err = resolver
            .next("empty", &ServiceRoute::new(), "")
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::Balancer(BalancerError::NoHost));
        assert_eq!(GatewayError::from(err).code, ErrorCode::NO_UPSTREAM);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_lookups_create_one_balancer() {
        let resolver = Arc::new(resolver());
        let route = Arc::new(orders());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let resolver = resolver.clone();
            let route = route.clone();
            tasks.push(tokio::spawn(async move {
                resolver.next("orders", &route, "").await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(resolver.len(), 1);
        let balancer = resolver.balancer("orders").await.unwrap();
        assert_eq!(balancer.nodes().len(), 2);
    }
}

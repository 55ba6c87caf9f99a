//! Compiles a configuration snapshot into one dispatch handler.
//!
//! Every call builds a fresh generation: middleware registry, route tree and upstream
//! resolver. Nothing is shared with the previous generation, so a failed build leaves the
//! currently installed handler untouched.
use std::{collections::BTreeMap, sync::Arc};

use axum::{extract::Request, response::IntoResponse};
use eyre::{Result, WrapErr};

use crate::{
    config::models::{Configuration, DEFAULT_BALANCE_MODE, Protocol, RouteNode, RouteType, ServiceRoute},
    core::{
        errors::{ErrorCode, GatewayError},
        handler::{SharedHandler, handler_fn},
        load_balancer::BalancerFactory,
        middleware::{MiddlewareRegistry, union_unique},
        protocol::{DispatchContext, ProtocolFactory},
        router::{Endpoint, RouteError, RoutePattern, Router, parse_methods},
        upstream::UpstreamResolver,
    },
    ports::{middleware::MiddlewareCatalog, route_data::RouteResourceData},
};

/// Per-build state shared by every node of one generation
struct Generation {
    registry: MiddlewareRegistry,
    upstreams: Arc<UpstreamResolver>,
}

struct ServiceScope<'a> {
    name: &'a str,
    service: &'a Arc<ServiceRoute>,
    protocol: Protocol,
}

pub struct RouterManager {
    protocols: Arc<ProtocolFactory>,
    balancers: Arc<BalancerFactory>,
    route_data: Arc<dyn RouteResourceData>,
    middleware: Arc<dyn MiddlewareCatalog>,
}

impl RouterManager {
    pub fn new(
        protocols: Arc<ProtocolFactory>,
        balancers: Arc<BalancerFactory>,
        route_data: Arc<dyn RouteResourceData>,
        middleware: Arc<dyn MiddlewareCatalog>,
    ) -> Self {
        Self {
            protocols,
            balancers,
            route_data,
            middleware,
        }
    }

    /// Build the dispatch handler for `config`, wrapped in its global middleware.
    pub fn create_routers(&self, config: &Configuration) -> Result<SharedHandler> {
        let services = self
            .route_data
            .services(config)
            .wrap_err("Failed to read service routes")?;

        let generation = Generation {
            registry: MiddlewareRegistry::from_catalog(
                self.middleware.as_ref(),
                config.referenced_middleware(),
            ),
            upstreams: Arc::new(UpstreamResolver::new(
                self.balancers.clone(),
                config
                    .balance_mode
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BALANCE_MODE.to_string()),
            )),
        };

        let mut root = Router::new();
        let mut installed = 0;
        for (name, service) in &services {
            let Some(protocol) = service.protocol() else {
                tracing::debug!(service = %name, protocol = %service.protocol, "Skipping service with unsupported protocol");
                continue;
            };
            let scope = ServiceScope {
                name,
                service,
                protocol,
            };
            for node in &service.routers {
                installed += self
                    .install(&mut root, &generation, &scope, node, "", &service.middlewares)
                    .wrap_err_with(|| format!("Failed to build routes for service '{name}'"))?;
            }
        }

        tracing::info!(
            services = services.len(),
            routes = installed,
            middleware = generation.registry.len(),
            "Router generation built"
        );

        let root: SharedHandler = Arc::new(root);
        Ok(generation.registry.wrap(root, &config.global_middleware))
    }

    fn install(
        &self,
        router: &mut Router,
        generation: &Generation,
        scope: &ServiceScope<'_>,
        node: &RouteNode,
        prefix: &str,
        inherited: &[String],
    ) -> Result<usize, RouteError> {
        let methods = parse_methods(&node.methods, scope.protocol)?;
        let middlewares = union_unique(&[inherited, node.middlewares.as_slice()]);

        if node.kind == RouteType::Subrouter {
            let mount = if node.prefix.is_empty() {
                &node.path
            } else {
                &node.prefix
            };
            if mount.is_empty() {
                return Err(RouteError::MissingPrefix);
            }
            let nested_prefix = format!("{prefix}{}", mount.trim_end_matches('/'));

            let mut nested = Router::new();
            let mut installed = 0;
            for child in &node.routers {
                installed +=
                    self.install(&mut nested, generation, scope, child, &nested_prefix, &middlewares)?;
            }

            let catch_all = RoutePattern::compile(
                &format!("{nested_prefix}/*"),
                RouteType::Wildcard,
                &BTreeMap::new(),
            )?;
            router.add(&methods, &catch_all, Endpoint::Subrouter(Arc::new(nested)));
            return Ok(installed);
        }

        let pattern = RoutePattern::compile(&format!("{prefix}{}", node.path), node.kind, &node.params)?;
        let ctx = Arc::new(DispatchContext {
            service_name: scope.name.to_string(),
            service: scope.service.clone(),
            proxy_path: node.proxy_path.clone(),
            upstreams: generation.upstreams.clone(),
        });
        let handler = generation
            .registry
            .wrap(self.terminal(ctx), &middlewares);

        tracing::debug!(
            service = scope.name,
            path = pattern.path(),
            methods = ?methods,
            middleware = ?middlewares,
            "Route installed"
        );
        Ok(router.add(&methods, &pattern, Endpoint::Handler(handler)).min(1))
    }

    /// Innermost handler of a route: pick a protocol handler and dispatch.
    fn terminal(&self, ctx: Arc<DispatchContext>) -> SharedHandler {
        let protocols = self.protocols.clone();
        handler_fn(move |req: Request| {
            let ctx = ctx.clone();
            let handler = protocols
                .get_handler(&req)
                .or_else(|| protocols.default_handler());
            async move {
                match handler {
                    Some(handler) => handler.handle(req, ctx).await,
                    None => GatewayError::with_detail(
                        ErrorCode::INTERNAL_SERVER_ERROR,
                        "no protocol handler registered",
                    )
                    .into_response(),
                }
            }
        })
    }
}

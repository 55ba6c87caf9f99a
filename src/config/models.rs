//! Dynamic configuration data structures.
//!
//! A [`Configuration`] is one immutable snapshot of the routing world: which services exist,
//! how their routes are shaped, which backends serve them and which middleware wraps them.
//! Providers produce snapshots, the watcher merges them, and every accepted snapshot is
//! shared as an `Arc<Configuration>` that is never mutated afterwards.
//!
//! The types are serde-friendly and decode identically from YAML, TOML and JSON.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// Balance mode used when neither the service nor the snapshot names one.
pub const DEFAULT_BALANCE_MODE: &str = "roundRobin";

fn default_protocol() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

/// Root configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Default balance mode for services that do not override it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_mode: Option<String>,
    /// Middleware wrapped around the whole router, in request traversal order
    pub global_middleware: Vec<String>,
    /// Opaque section consumed by external collaborators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<serde_json::Value>,
    /// Logical services keyed by name
    pub services: BTreeMap<String, ServiceRoute>,
}

impl Configuration {
    /// Start building a configuration programmatically
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// A snapshot with nothing to route is treated as absent by the watcher.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.global_middleware.is_empty()
    }

    /// Balance mode for `service`, falling back to the snapshot default.
    pub fn balance_mode_for<'a>(&'a self, service: &'a ServiceRoute) -> &'a str {
        service
            .balance_mode
            .as_deref()
            .or(self.balance_mode.as_deref())
            .unwrap_or(DEFAULT_BALANCE_MODE)
    }

    /// Every middleware name referenced anywhere in the snapshot, lower-cased.
    pub fn referenced_middleware(&self) -> BTreeSet<String> {
        fn collect_nodes(nodes: &[RouteNode], out: &mut BTreeSet<String>) {
            for node in nodes {
                out.extend(node.middlewares.iter().map(|m| m.to_ascii_lowercase()));
                collect_nodes(&node.routers, out);
            }
        }

        let mut names: BTreeSet<String> = self
            .global_middleware
            .iter()
            .map(|m| m.to_ascii_lowercase())
            .collect();
        for service in self.services.values() {
            names.extend(service.middlewares.iter().map(|m| m.to_ascii_lowercase()));
            collect_nodes(&service.routers, &mut names);
        }
        names
    }
}

/// Builder for [`Configuration`]
#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    config: Configuration,
}

impl ConfigurationBuilder {
    pub fn balance_mode(mut self, mode: impl Into<String>) -> Self {
        self.config.balance_mode = Some(mode.into());
        self
    }

    pub fn global_middleware<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.global_middleware = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn service(mut self, name: impl Into<String>, service: ServiceRoute) -> Self {
        self.config.services.insert(name.into(), service);
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

/// Protocol family a service is dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    WebSocket,
}

impl Protocol {
    /// Parse a protocol tag; unknown tags yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "websocket" | "ws" => Some(Self::WebSocket),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// One logical upstream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRoute {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub route_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_mode: Option<String>,
    /// `http`, `https` or `websocket`; anything else is skipped at compile time
    pub protocol: String,
    pub middlewares: Vec<String>,
    pub routers: Vec<RouteNode>,
    pub servers: Vec<Server>,
}

impl Default for ServiceRoute {
    fn default() -> Self {
        Self {
            route_name: String::new(),
            balance_mode: None,
            protocol: default_protocol(),
            middlewares: Vec::new(),
            routers: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl ServiceRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_name(&self.protocol)
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_balance_mode(mut self, mode: impl Into<String>) -> Self {
        self.balance_mode = Some(mode.into());
        self
    }

    pub fn with_route(mut self, node: RouteNode) -> Self {
        self.routers.push(node);
        self
    }

    pub fn with_server(mut self, server: Server) -> Self {
        self.servers.push(server);
        self
    }

    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middlewares.push(name.into());
        self
    }

    /// Equality ignoring the server list, used to decide whether two
    /// definitions of the same service can be merged.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.route_name == other.route_name
            && self.balance_mode == other.balance_mode
            && self.protocol == other.protocol
            && self.middlewares == other.middlewares
            && self.routers == other.routers
    }
}

/// How a route node's path is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Static,
    Param,
    Wildcard,
    Subrouter,
}

/// A single path-matching rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteNode {
    pub path: String,
    /// HTTP verbs; `*` or an empty list means every verb
    pub methods: Vec<String>,
    #[serde(rename = "type")]
    pub kind: RouteType,
    /// Mount point of a subrouter
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    /// Upstream path template; `:name` and `*` are filled from the match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_path: Option<String>,
    /// Free-form annotation carried through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub middlewares: Vec<String>,
    /// Regex constraint per `:name` placeholder
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Children of a subrouter
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routers: Vec<RouteNode>,
}

impl RouteNode {
    /// A node whose kind is inferred from the path shape.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let kind = if path.contains("/*") {
            RouteType::Wildcard
        } else if path.contains("/:") {
            RouteType::Param
        } else {
            RouteType::Static
        };
        Self {
            path,
            kind,
            ..Self::default()
        }
    }

    pub fn subrouter(prefix: impl Into<String>, children: Vec<RouteNode>) -> Self {
        Self {
            kind: RouteType::Subrouter,
            prefix: prefix.into(),
            routers: children,
            ..Self::default()
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.params.insert(name.into(), pattern.into());
        self
    }

    pub fn with_proxy_path(mut self, path: impl Into<String>) -> Self {
        self.proxy_path = Some(path.into());
        self
    }

    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middlewares.push(name.into());
        self
    }
}

/// Declarative backend target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            healthy: default_healthy(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// `host:port` identity of the target
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Latest configuration per provider name.
pub type Configurations = BTreeMap<String, Arc<Configuration>>;

/// Unit of exchange between providers and the watcher.
#[derive(Debug, Clone)]
pub struct Message {
    pub provider_name: String,
    pub configuration: Option<Arc<Configuration>>,
}

impl Message {
    pub fn new(provider_name: impl Into<String>, configuration: Configuration) -> Self {
        Self {
            provider_name: provider_name.into(),
            configuration: Some(Arc::new(configuration)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_on_decode() {
        let yaml = r#"
services:
  orders:
    routers:
      - path: /orders
    servers:
      - host: 127.0.0.1
        port: 9000
"#;
        let config: Configuration = serde_yaml::from_str(yaml).unwrap();
        let orders = &config.services["orders"];
        assert_eq!(orders.protocol, "http");
        assert_eq!(orders.protocol(), Some(Protocol::Http));
        assert_eq!(orders.routers[0].kind, RouteType::Static);
        assert_eq!(orders.servers[0].weight, 1);
        assert!(orders.servers[0].healthy);
        assert_eq!(config.balance_mode_for(orders), DEFAULT_BALANCE_MODE);
    }

    #[test]
    fn test_balance_mode_override() {
        let config = Configuration::builder()
            .balance_mode("wwr")
            .service("a", ServiceRoute::new())
            .service("b", ServiceRoute::new().with_balance_mode("ipHash"))
            .build();
        assert_eq!(config.balance_mode_for(&config.services["a"]), "wwr");
        assert_eq!(config.balance_mode_for(&config.services["b"]), "ipHash");
    }

    #[test]
    fn test_balance_mode_for_service_outside_snapshot() {
        let config = Configuration::builder().balance_mode("wwr").build();
        let detached = ServiceRoute::new().with_balance_mode("random");
        let mode: &str = config.balance_mode_for(&detached);
        assert_eq!(mode, "random");
        assert_eq!(config.balance_mode_for(&ServiceRoute::new()), "wwr");
    }

    #[test]
    fn test_is_empty() {
        assert!(Configuration::default().is_empty());
        let config = Configuration::builder()
            .global_middleware(["recovery"])
            .build();
        assert!(!config.is_empty());
    }

    #[test]
    fn test_route_node_kind_inference() {
        assert_eq!(RouteNode::new("/a/b").kind, RouteType::Static);
        assert_eq!(RouteNode::new("/a/:id").kind, RouteType::Param);
        assert_eq!(RouteNode::new("/a/*").kind, RouteType::Wildcard);
    }

    #[test]
    fn test_referenced_middleware_is_lowercased_and_nested() {
        let config = Configuration::builder()
            .global_middleware(["Recovery"])
            .service(
                "svc",
                ServiceRoute::new().with_middleware("logging").with_route(
                    RouteNode::subrouter(
                        "/svc",
                        vec![RouteNode::new("/ping").with_middleware("RequestID")],
                    ),
                ),
            )
            .build();
        let names: Vec<_> = config.referenced_middleware().into_iter().collect();
        assert_eq!(names, vec!["logging", "recovery", "requestid"]);
    }

    #[test]
    fn test_unknown_protocol_is_preserved() {
        let service = ServiceRoute::new().with_protocol("grpc");
        assert_eq!(service.protocol(), None);
        assert_eq!(service.protocol, "grpc");
    }
}

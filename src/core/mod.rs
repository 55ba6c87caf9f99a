pub mod aggregator;
pub mod errors;
pub mod handler;
pub mod load_balancer;
pub mod merge;
pub mod middleware;
pub mod protocol;
pub mod router;
pub mod router_manager;
pub mod upstream;
pub mod watcher;

pub use aggregator::ProviderAggregator;
pub use errors::{ErrorCode, GatewayError};
pub use handler::{Handler, SharedHandler, handler_fn};
pub use load_balancer::BalancerFactory;
pub use protocol::{ProtocolFactory, ProtocolHandler};
pub use router_manager::RouterManager;
pub use upstream::UpstreamResolver;
pub use watcher::ConfigurationWatcher;

use crate::core::middleware::Middleware;

/// Resolves middleware names found in dynamic configuration to wrappers.
pub trait MiddlewareCatalog: Send + Sync {
    /// Wrapper registered under the lower-case `name`, if any
    fn lookup(&self, name: &str) -> Option<Middleware>;
}

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{core::handler::SharedHandler, ports::middleware::MiddlewareCatalog};

/// Wraps a handler into another handler
pub type Middleware = Arc<dyn Fn(SharedHandler) -> SharedHandler + Send + Sync>;

/// Name to wrapper mapping for one configuration generation.
///
/// Lookups are case-insensitive. The registry is built before the router and only read
/// afterwards, so requests never observe a partially populated registry.
#[derive(Default, Clone)]
pub struct MiddlewareRegistry {
    wrappers: HashMap<String, Middleware>,
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.wrappers.keys().collect();
        names.sort();
        f.debug_struct("MiddlewareRegistry")
            .field("names", &names)
            .finish()
    }
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the wrapper `catalog` knows for every name in `names`.
    ///
    /// Unrecognized names are skipped.
    pub fn from_catalog<I, S>(catalog: &dyn MiddlewareCatalog, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        for name in names {
            let name = name.as_ref().to_ascii_lowercase();
            match catalog.lookup(&name) {
                Some(wrapper) => registry.register(&name, wrapper),
                None => tracing::debug!(middleware = %name, "Unknown middleware ignored"),
            }
        }
        registry
    }

    pub fn register(&mut self, name: &str, wrapper: Middleware) {
        self.wrappers.insert(name.to_ascii_lowercase(), wrapper);
    }

    pub fn get(&self, name: &str) -> Option<&Middleware> {
        self.wrappers.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Wrap `handler` so that `names[0]` sees the request first.
    pub fn wrap(&self, handler: SharedHandler, names: &[String]) -> SharedHandler {
        names
            .iter()
            .rev()
            .fold(handler, |inner, name| match self.get(name) {
                Some(wrapper) => wrapper(inner),
                None => inner,
            })
    }
}

/// Concatenate lists, lower-casing and dropping repeats while keeping first-seen order.
pub fn union_unique(lists: &[&[String]]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for list in lists {
        for name in list.iter() {
            let name = name.to_ascii_lowercase();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{body::Body, extract::Request, response::Response};
    use http::Method;

    use super::*;
    use crate::core::handler::{empty_request, handler_fn};

    fn tracer(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
        Arc::new(move |next: SharedHandler| {
            let log = log.clone();
            handler_fn(move |req: Request| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("{label}:in"));
                    let resp = next.call(req).await;
                    log.lock().unwrap().push(format!("{label}:out"));
                    resp
                }
            })
        })
    }

    #[tokio::test]
    async fn test_first_declared_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MiddlewareRegistry::new();
        registry.register("a", tracer("a", log.clone()));
        registry.register("b", tracer("b", log.clone()));

        let terminal = {
            let log = log.clone();
            handler_fn(move |_req: Request| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("handler".to_string());
                    Response::new(Body::empty())
                }
            })
        };
        let names = vec!["A".to_string(), "missing".to_string(), "b".to_string()];
        let wrapped = registry.wrap(terminal, &names);
        wrapped.call(empty_request(Method::GET, "/")).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:in", "b:in", "handler", "b:out", "a:out"]
        );
    }

    /// Knows `recovery` and `errorhandler` as pass-through wrappers
    struct Passthrough;

    impl MiddlewareCatalog for Passthrough {
        fn lookup(&self, name: &str) -> Option<Middleware> {
            match name {
                "recovery" | "errorhandler" => Some(Arc::new(|next: SharedHandler| next)),
                _ => None,
            }
        }
    }

    #[test]
    fn test_from_catalog_skips_unknown_names() {
        let registry =
            MiddlewareRegistry::from_catalog(&Passthrough, ["Recovery", "errorhandler", "nope"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("recovery"));
        assert!(registry.contains("ERRORHANDLER"));
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_union_unique_keeps_encounter_order() {
        let service = vec!["logging".to_string(), "Recovery".to_string()];
        let node = vec!["recovery".to_string(), "requestid".to_string()];
        assert_eq!(
            union_unique(&[service.as_slice(), node.as_slice()]),
            vec!["logging", "recovery", "requestid"]
        );
    }
}

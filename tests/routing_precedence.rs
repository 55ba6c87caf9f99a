// Routing through the full proxy stack: matched node decides the backend path
#[cfg(test)]
mod test {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use axum::{
        Router,
        body::Body,
        extract::Request,
        http::{Method, StatusCode},
    };
    use http_body_util::BodyExt;
    use portway::{
        adapters::{BuiltinMiddleware, HttpClientAdapter, HttpProxyHandler, SnapshotRouteData},
        config::models::{Configuration, RouteNode, Server, ServiceRoute},
        core::{
            BalancerFactory, ProtocolFactory, RouterManager, SharedHandler,
            errors::{ErrorBody, ErrorCode},
        },
        utils::BufferPool,
    };
    use tower::ServiceExt;

    async fn spawn_echo_backend() -> SocketAddr {
        let app = Router::new().fallback(|req: Request| async move {
            format!("{} {}", req.method(), req.uri().path())
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn build_gateway(backend: SocketAddr) -> SharedHandler {
        let server = Server::new(backend.ip().to_string(), backend.port());
        let catalog = ServiceRoute::new()
            .with_server(server.clone())
            .with_route(RouteNode::new("/items/*").with_proxy_path("/raw/*"))
            .with_route(
                RouteNode::new("/items/:id")
                    .with_param("id", "[0-9]+")
                    .with_proxy_path("/v2/items/:id"),
            )
            .with_route(RouteNode::new("/items/featured").with_proxy_path("/featured"));
        let admin = ServiceRoute::new().with_server(server).with_route(RouteNode::subrouter(
            "/admin",
            vec![RouteNode::new("/ping").with_methods(["GET"])],
        ));
        let config = Configuration::builder()
            .global_middleware(["recovery", "errorhandler"])
            .service("catalog", catalog)
            .service("admin", admin)
            .build();

        let proxy = HttpProxyHandler::new(
            Arc::new(HttpClientAdapter::new()),
            Duration::from_secs(5),
            BufferPool::new(8),
        );
        let manager = RouterManager::new(
            Arc::new(ProtocolFactory::new().with_handler(Arc::new(proxy))),
            Arc::new(BalancerFactory::default()),
            Arc::new(SnapshotRouteData),
            Arc::new(BuiltinMiddleware),
        );
        manager.create_routers(&config).unwrap()
    }

    async fn send(handler: &SharedHandler, method: Method, path: &str) -> (StatusCode, String) {
        let handler = handler.clone();
        let app = Router::new().fallback(move |req: Request| handler.call(req));
        let request = http::Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_static_param_wildcard_precedence() {
        let gateway = build_gateway(spawn_echo_backend().await);

        assert_eq!(
            send(&gateway, Method::GET, "/items/featured").await,
            (StatusCode::OK, "GET /featured".to_string())
        );
        assert_eq!(
            send(&gateway, Method::GET, "/items/42").await,
            (StatusCode::OK, "GET /v2/items/42".to_string())
        );
        // fails the param constraint, falls through to the wildcard
        assert_eq!(
            send(&gateway, Method::GET, "/items/abc").await,
            (StatusCode::OK, "GET /raw/abc".to_string())
        );
        assert_eq!(
            send(&gateway, Method::DELETE, "/items/a/b").await,
            (StatusCode::OK, "DELETE /raw/a/b".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subrouter_scope_and_method_errors() {
        let gateway = build_gateway(spawn_echo_backend().await);

        assert_eq!(
            send(&gateway, Method::GET, "/admin/ping").await,
            (StatusCode::OK, "GET /admin/ping".to_string())
        );

        let (status, body) = send(&gateway, Method::POST, "/admin/ping").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(body.code, ErrorCode::METHOD_NOT_ALLOWED.code);

        for path in ["/ping", "/adminping"] {
            let (status, body) = send(&gateway, Method::GET, path).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
            let body: ErrorBody = serde_json::from_str(&body).unwrap();
            assert_eq!(body.code, ErrorCode::ROUTE_NOT_FOUND.code);
        }
    }
}

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::settings::{LogFormat, LogSettings};

/// Initialize logging from the static `log` settings section
pub fn init_tracing(settings: &LogSettings) -> Result<()> {
    init_tracing_with_config(
        &settings.level,
        settings.format == LogFormat::Json,
        settings.include_spans,
    )
}

/// Initialize tracing with custom configuration.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
            .wrap_err("Failed to install JSON tracing subscriber")?;
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install console tracing subscriber")?;
    }

    tracing::info!(
        level,
        json = json_format,
        spans = include_spans,
        "Portway logging initialized"
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a backend request span
pub fn create_backend_span(service: &str, backend_url: &str, method: &str) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        service = service,
        backend.url = backend_url,
        http.method = method,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_constructors() {
        let request = create_request_span("GET", "/api/test", "req-123");
        let backend = create_backend_span("orders", "http://10.0.0.1:8080/orders", "POST");
        if let (Some(request), Some(backend)) = (request.metadata(), backend.metadata()) {
            assert_eq!(request.name(), "request");
            assert_eq!(backend.name(), "backend_request");
        }
    }
}

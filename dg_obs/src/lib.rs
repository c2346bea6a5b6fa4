//! ABOUTME: Observability services including health checks and metrics
//! ABOUTME: Serves manager state, readiness and Prometheus metrics over HTTP

use actix_web::{
    dev::{Server, ServiceRequest, ServiceResponse},
    middleware::Logger,
    web, App, HttpResponse, HttpServer, Result as ActixResult,
};
use dg_core::Result;
use dg_pool::{PoolMetrics, StateSource};
use prometheus_client::{encoding::text::encode, metrics::counter::Counter, registry::Registry};
use serde_json::json;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Readiness gate, closed while the process starts up or drains
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    ready: Arc<AtomicBool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus registry holding the pool metrics and the server's own counters
#[derive(Debug)]
pub struct Metrics {
    registry: Mutex<Registry>,
    state_requests_total: Counter,
}

impl Metrics {
    pub fn new(pool: &PoolMetrics) -> Self {
        let mut registry = Registry::default();
        pool.register(&mut registry);

        let state_requests_total = Counter::default();
        registry.register(
            "dbguard_state_requests",
            "Health, readiness and state requests served",
            state_requests_total.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            state_requests_total,
        }
    }

    pub fn inc_requests(&self) {
        self.state_requests_total.inc();
    }

    pub fn encode(&self) -> Result<String> {
        let registry = self.registry.lock().map_err(|e| {
            dg_core::Error::Config(format!("Failed to lock metrics registry: {}", e))
        })?;

        let mut buffer = String::new();
        encode(&mut buffer, &registry)
            .map_err(|e| dg_core::Error::Config(format!("Failed to encode metrics: {}", e)))?;

        Ok(buffer)
    }
}

/// Application state for observability endpoints
#[derive(Clone)]
pub struct ObsState {
    pub readiness: ReadinessGate,
    pub metrics: Arc<Metrics>,
    source: Arc<dyn StateSource>,
}

impl ObsState {
    /// `pool_metrics` should be the instance the manager records into
    pub fn new(source: Arc<dyn StateSource>, pool_metrics: &PoolMetrics) -> Self {
        Self {
            readiness: ReadinessGate::new(),
            metrics: Arc::new(Metrics::new(pool_metrics)),
            source,
        }
    }
}

impl fmt::Debug for ObsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObsState")
            .field("readiness", &self.readiness)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Health endpoint handler
async fn health(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    state.metrics.inc_requests();
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok"
    })))
}

/// Readiness endpoint handler; not ready while the breaker is open
async fn readiness(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    state.metrics.inc_requests();
    let snapshot = state.source.snapshot();
    let is_ready = state.readiness.is_ready() && !snapshot.circuit_open;
    tracing::debug!(
        ready = is_ready,
        circuit_state = %snapshot.circuit_state,
        "Readiness check requested"
    );

    let body = json!({
        "status": if is_ready { "ready" } else { "not ready" },
        "circuit_state": snapshot.circuit_state,
        "is_connected": snapshot.is_connected,
    });

    if is_ready {
        Ok(HttpResponse::Ok().json(body))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(body))
    }
}

/// Manager state snapshot as JSON
async fn manager_state(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    state.metrics.inc_requests();
    Ok(HttpResponse::Ok().json(state.source.snapshot()))
}

/// Metrics endpoint handler
async fn metrics(state: web::Data<ObsState>) -> ActixResult<HttpResponse> {
    tracing::debug!("Metrics scrape requested");

    match state.metrics.encode() {
        Ok(metrics_text) => Ok(HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(metrics_text)),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            Ok(HttpResponse::InternalServerError().json(json!({
                "error": "Failed to encode metrics"
            })))
        }
    }
}

/// Create observability service factory
pub fn create_service(
    state: ObsState,
) -> App<
    impl actix_web::dev::ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    App::new()
        .app_data(web::Data::new(state))
        .wrap(Logger::default())
        .service(
            web::scope("")
                .route("/healthz", web::get().to(health))
                .route("/readyz", web::get().to(readiness))
                .route("/metrics", web::get().to(metrics))
                .route("/state", web::get().to(manager_state)),
        )
}

/// Bind the observability server without running it.
///
/// The returned server stops gracefully on SIGINT/SIGTERM.
pub fn bind_server(bind_addr: &str, state: ObsState) -> Result<Server> {
    tracing::info!("Starting observability server on {}", bind_addr);

    let server = HttpServer::new(move || create_service(state.clone()))
        .workers(1)
        .bind(bind_addr)
        .map_err(|e| dg_core::Error::Config(format!("Failed to bind server: {}", e)))?
        .run();

    Ok(server)
}

/// Start observability server and run it to completion
pub async fn start_server(bind_addr: &str, state: ObsState) -> Result<()> {
    bind_server(bind_addr, state)?.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use dg_pool::{CircuitState, ManagerStateSnapshot, PoolStatus};

    struct FakeSource {
        snapshot: Mutex<ManagerStateSnapshot>,
    }

    impl FakeSource {
        fn new(circuit_state: CircuitState) -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(ManagerStateSnapshot {
                    failure_count: 0,
                    circuit_open: circuit_state == CircuitState::Open,
                    circuit_state,
                    is_connected: true,
                    current_connections: 1,
                    max_connections: 4,
                    total_errors: 2,
                    last_error_message: Some("connection refused".to_string()),
                    last_failure_at: None,
                    breaker_trips: 0,
                    pool: PoolStatus {
                        max_size: 10,
                        size: 3,
                        idle: 2,
                        in_use: 1,
                    },
                }),
            })
        }
    }

    impl StateSource for FakeSource {
        fn snapshot(&self) -> ManagerStateSnapshot {
            self.snapshot.lock().unwrap().clone()
        }
    }

    fn state_with(circuit_state: CircuitState) -> (ObsState, Arc<PoolMetrics>) {
        let pool_metrics = Arc::new(PoolMetrics::new());
        let state = ObsState::new(FakeSource::new(circuit_state), &pool_metrics);
        (state, pool_metrics)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _) = state_with(CircuitState::Open);
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_readiness_with_closed_breaker() {
        let (state, _) = state_with(CircuitState::Closed);
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/readyz").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["circuit_state"], "closed");
    }

    #[tokio::test]
    async fn test_readiness_with_open_breaker() {
        let (state, _) = state_with(CircuitState::Open);
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/readyz").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "not ready");
        assert_eq!(body["circuit_state"], "open");
    }

    #[tokio::test]
    async fn test_half_open_breaker_is_ready() {
        let (state, _) = state_with(CircuitState::HalfOpen);
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/readyz").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[tokio::test]
    async fn test_readiness_gate_overrides_closed_breaker() {
        let (state, _) = state_with(CircuitState::Closed);
        state.readiness.set_ready(false);
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/readyz").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let (state, _) = state_with(CircuitState::Closed);
        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/state").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["circuit_open"], false);
        assert_eq!(body["max_connections"], 4);
        assert_eq!(body["total_errors"], 2);
        assert_eq!(body["last_error_message"], "connection refused");
        assert_eq!(body["pool"]["idle"], 2);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (state, pool_metrics) = state_with(CircuitState::Closed);
        pool_metrics.record_acquired();
        pool_metrics.record_retry();

        let app = test::init_service(create_service(state)).await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );

        let body = test::read_body(resp).await;
        let body_str = std::str::from_utf8(&body).unwrap();

        assert!(body_str.contains("dbguard_pool_connections_acquired_total 1"));
        assert!(body_str.contains("dbguard_pool_operation_retries_total 1"));
        assert!(body_str.contains("dbguard_state_requests_total 1"));
    }

    #[::core::prelude::v1::test]
    fn test_readiness_gate_toggle() {
        let gate = ReadinessGate::new();
        assert!(gate.is_ready());

        gate.set_ready(false);
        assert!(!gate.is_ready());

        gate.set_ready(true);
        assert!(gate.is_ready());
    }
}

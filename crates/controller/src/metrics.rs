use std::{
    convert::Infallible,
    sync::OnceLock,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::{
    extract::MatchedPath,
    http::{Request, Response},
};
use futures_util::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower::{Layer, Service};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder once; later calls share it.
pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .add_global_label("app_version", crate::version::VERSION)
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub fn record_build_info(snapshot: &crate::persistence::MigrationSnapshot) {
    let schema_version = snapshot
        .latest_applied
        .map_or_else(|| "none".to_string(), |version| version.to_string());

    gauge!(
        "devconf_controller_info",
        "version" => crate::version::VERSION,
        "git_sha" => crate::version::GIT_SHA,
        "schema_version" => schema_version
    )
    .set(1.0);
    gauge!("devconf_migrations_pending").set(snapshot.pending.len() as f64);
}

/// Count a device status report by the status it produced.
pub fn record_status_report(status: &str, outcome: &'static str) {
    counter!(
        "devconf_status_reports_total",
        "status" => status.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Time spent rendering and packing one configuration.
pub fn record_compile(backend: &str, ok: bool, elapsed: Duration) {
    let outcome = if ok { "success" } else { "error" };
    counter!(
        "devconf_compilations_total",
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("devconf_compile_duration_seconds", "backend" => backend.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_registration(is_new: bool) {
    let kind = if is_new { "created" } else { "existing" };
    counter!("devconf_registrations_total", "kind" => kind).increment(1);
}

fn route_label<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path(), MatchedPath::as_str)
        .to_owned()
}

/// Counts requests and observes their latency per method, route and status.
#[derive(Clone, Copy, Default)]
pub struct HttpMetricsLayer;

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService { inner }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
}

impl<S, B, ResBody> Service<Request<B>> for HttpMetricsService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let method = req.method().as_str().to_owned();
        let route = route_label(&req);
        let started = Instant::now();
        let response = self.inner.call(req);

        Box::pin(async move {
            let response = response.await?;
            let status = response.status().as_u16().to_string();
            histogram!(
                "devconf_http_request_duration_seconds",
                "method" => method.clone(),
                "path" => route.clone()
            )
            .record(started.elapsed().as_secs_f64());
            counter!(
                "devconf_http_requests_total",
                "method" => method,
                "path" => route,
                "status" => status
            )
            .increment(1);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MigrationSnapshot;

    #[test]
    fn build_info_is_rendered() {
        let handle = init_metrics_recorder();
        record_build_info(&MigrationSnapshot {
            latest_applied: Some(1),
            latest_available: Some(1),
            applied: Vec::new(),
            pending: Vec::new(),
        });
        let rendered = handle.render();
        assert!(rendered.contains("devconf_controller_info"));
        assert!(rendered.contains("devconf_migrations_pending"));
    }

    #[test]
    fn compile_and_registration_counters_are_labelled() {
        let handle = init_metrics_recorder();
        record_compile("openwrt", false, Duration::from_millis(3));
        record_registration(true);
        let rendered = handle.render();
        assert!(rendered.contains("devconf_compilations_total"));
        assert!(rendered.contains("backend=\"openwrt\""));
        assert!(rendered.contains("kind=\"created\""));
    }
}

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tunnelmux::{dispatch::VirtualListener, quota::ClientQuotas, telemetry, tunnel::manager::Manager};

#[derive(Clone)]
pub struct AdminState {
    pub prom: Arc<PrometheusHandle>,
    pub conns: telemetry::SharedConns,
    pub manager: Option<Arc<Manager>>,
    pub quotas: Option<Arc<ClientQuotas>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/tunnel/clients", get(tunnel_clients))
        .route("/tunnel/quotas", get(tunnel_quotas))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr=%addr, "admin: listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_shutdown(shutdown))
        .await?;
    Ok(())
}

/// Serves the admin API on connections the port dispatcher classified as
/// management traffic.
pub async fn serve_dispatched(
    listener: VirtualListener,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!("admin: serving on the shared bridge port");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_shutdown(shutdown))
        .await?;
    Ok(())
}

async fn wait_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|v| *v).await;
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.conns.snapshot()))
}

async fn tunnel_clients(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = match &st.manager {
        Some(mgr) => mgr.snapshot_clients().await,
        None => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}

async fn tunnel_quotas(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = st.quotas.as_ref().map(|q| q.snapshot()).unwrap_or_default();
    (StatusCode::OK, Json(snap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelmux::{
        dispatch::{ConnClass, DispatchRules, PortDispatcher},
        quota::ClientLimits,
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    fn state() -> AdminState {
        AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            conns: Arc::new(telemetry::ConnRegistry::new()),
            manager: Some(Arc::new(Manager::new())),
            quotas: Some(Arc::new(ClientQuotas::new([(
                "home",
                ClientLimits {
                    max_conn: 2,
                    flow_limit: 0,
                },
            )]))),
        }
    }

    async fn http_get(addr: SocketAddr, host: &str, path: &str) -> String {
        let mut c = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        c.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_json_endpoints() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(ln, router(state()))
                .with_graceful_shutdown(wait_shutdown(rx))
                .await
        });

        let health = http_get(addr, "x", "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.ends_with("{\"ok\":true}"), "{health}");

        assert!(http_get(addr, "x", "/tunnel/clients").await.ends_with("[]"));
        let quotas = http_get(addr, "x", "/tunnel/quotas").await;
        assert!(quotas.contains("\"client_id\":\"home\""), "{quotas}");
        assert!(quotas.contains("\"max_conn\":2"), "{quotas}");

        stop.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serves_through_the_port_dispatcher() {
        let d = PortDispatcher::new(DispatchRules {
            web_host: "admin.local".into(),
            ..DispatchRules::default()
        });
        let vl = d.listener(ConnClass::Manager);
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (_stop, rx) = watch::channel(false);
        tokio::spawn(d.serve(ln, rx.clone()));
        tokio::spawn(serve_dispatched(vl, state(), rx));

        let resp = http_get(addr, "admin.local", "/conns").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.ends_with("[]"), "{resp}");
    }
}

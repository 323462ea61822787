//! HTTP router: peer inbound messages and the admin API

use super::NodeHandle;
use crate::cluster::node::{DomainId, NodeAddr};
use crate::common::{Error, METRICS};
use crate::migration::{MigrationKind, SessionId};
use crate::transport::http::PEER_MESSAGE_PATH;
use crate::transport::Envelope;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdRequest {
    pub threshold: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusChangeRequest {
    pub allow: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostDomainRequest {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

fn default_replication_factor() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub domain: DomainId,
    pub destination: String,
    #[serde(default = "default_migration_kind")]
    pub kind: MigrationKind,
}

fn default_migration_kind() -> MigrationKind {
    MigrationKind::AddReplica
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MigrationStarted {
    pub session: SessionId,
}

pub fn create_router(node: NodeHandle) -> Router {
    Router::new()
        .route(PEER_MESSAGE_PATH, post(peer_message))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/status", get(cluster_status))
        .route("/admin/domains", get(list_domains))
        .route("/admin/domains/:id", get(domain_status).delete(delete_domain))
        .route("/admin/domains/:id/host", post(host_domain))
        .route("/admin/nodes", post(add_node))
        .route("/admin/nodes/:addr", get(node_status).delete(remove_node))
        .route("/admin/local/active", post(set_active))
        .route("/admin/local/inactive", post(set_inactive))
        .route("/admin/heavy-load-threshold", post(set_threshold))
        .route("/admin/exchange-mapping", post(exchange_mapping))
        .route("/admin/status-change", post(status_change))
        .route("/admin/reset", post(reset_cluster))
        .route("/admin/migrations", get(list_migrations).post(start_migration))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

async fn peer_message(State(node): State<NodeHandle>, Json(envelope): Json<Envelope>) -> StatusCode {
    node.handle_envelope(envelope).await;
    StatusCode::ACCEPTED
}

async fn health(State(node): State<NodeHandle>) -> impl IntoResponse {
    let leader = node.with_state(|s, _| s.membership().leader()).await;
    Json(json!({
        "status": "ok",
        "node": node.local(),
        "leader": leader,
        "version": crate::VERSION,
        "uptime_secs": METRICS.uptime_seconds(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

async fn cluster_status(State(node): State<NodeHandle>) -> impl IntoResponse {
    Json(node.with_state(|s, now| s.status(now)).await)
}

async fn list_domains(State(node): State<NodeHandle>) -> impl IntoResponse {
    Json(node.with_state(|s, _| s.domains_status()).await)
}

async fn domain_status(
    State(node): State<NodeHandle>,
    Path(id): Path<u32>,
) -> ApiResult<impl IntoResponse> {
    node.with_state(|s, _| s.domain_status(DomainId(id)))
        .await
        .map(Json)
        .ok_or(Error::DomainNotFound(id))
}

async fn delete_domain(
    State(node): State<NodeHandle>,
    Path(id): Path<u32>,
) -> ApiResult<StatusCode> {
    if node
        .with_state(|s, now| s.delete_domain(DomainId(id), now))
        .await
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::DomainNotFound(id))
    }
}

async fn host_domain(
    State(node): State<NodeHandle>,
    Path(id): Path<u32>,
    Json(req): Json<HostDomainRequest>,
) -> ApiResult<StatusCode> {
    node.with_state(|s, _| s.host_domain(DomainId(id), req.replication_factor))
        .await?;
    Ok(StatusCode::CREATED)
}

async fn add_node(
    State(node): State<NodeHandle>,
    Json(req): Json<AddNodeRequest>,
) -> ApiResult<StatusCode> {
    let addr: NodeAddr = req.address.parse()?;
    let added = node.with_state(|s, now| s.add_node(addr, now)).await;
    Ok(if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    })
}

async fn node_status(
    State(node): State<NodeHandle>,
    Path(addr): Path<String>,
) -> ApiResult<impl IntoResponse> {
    node.with_state(|s, now| s.node_status(&addr, now))
        .await
        .map(Json)
        .ok_or(Error::NodeNotFound(addr))
}

async fn remove_node(
    State(node): State<NodeHandle>,
    Path(addr): Path<String>,
) -> ApiResult<StatusCode> {
    let parsed = NodeAddr::parse(&addr).ok_or(Error::NodeNotFound(addr))?;
    node.with_state(|s, _| s.remove_node(parsed)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_active(State(node): State<NodeHandle>) -> ApiResult<StatusCode> {
    node.with_state(|s, now| s.set_local_active(true, now))
        .await?;
    Ok(StatusCode::OK)
}

async fn set_inactive(State(node): State<NodeHandle>) -> ApiResult<StatusCode> {
    node.with_state(|s, now| s.set_local_active(false, now))
        .await?;
    Ok(StatusCode::OK)
}

async fn set_threshold(
    State(node): State<NodeHandle>,
    Json(req): Json<ThresholdRequest>,
) -> ApiResult<StatusCode> {
    node.with_state(|s, _| s.set_heavy_load_threshold(req.threshold))
        .await?;
    Ok(StatusCode::OK)
}

async fn exchange_mapping(State(node): State<NodeHandle>) -> StatusCode {
    node.with_state(|s, _| s.request_mapping_exchange()).await;
    StatusCode::ACCEPTED
}

async fn reset_cluster(State(node): State<NodeHandle>) -> ApiResult<StatusCode> {
    node.with_state(|s, now| s.reset_cluster(now)).await?;
    Ok(StatusCode::OK)
}

async fn status_change(
    State(node): State<NodeHandle>,
    Json(req): Json<StatusChangeRequest>,
) -> StatusCode {
    node.with_state(|s, _| s.set_status_change_allow(req.allow))
        .await;
    StatusCode::OK
}

async fn list_migrations(State(node): State<NodeHandle>) -> impl IntoResponse {
    Json(node.with_state(|s, _| s.migrations()).await)
}

async fn start_migration(
    State(node): State<NodeHandle>,
    Json(req): Json<MigrationRequest>,
) -> ApiResult<(StatusCode, Json<MigrationStarted>)> {
    let destination: NodeAddr = req.destination.parse()?;
    let session = node
        .start_migration(req.domain, destination, req.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(MigrationStarted { session })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::domain_store::MemoryDomainStore;
    use crate::server::DirectoryNode;
    use crate::transport::MemoryNetwork;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> Router {
        let mut config = Config::default();
        config.node.address = "10.0.0.1".into();
        config.node.peers = vec!["10.0.0.2".into()];
        let net = MemoryNetwork::new();
        let transport = net.transport("10.0.0.1".parse().unwrap());
        let node = DirectoryNode::new(
            config,
            Arc::new(MemoryDomainStore::new()),
            Arc::new(transport),
        )
        .unwrap();
        create_router(node.handle())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_lists_bootstrap_nodes() {
        let response = router()
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["node"], "10.0.0.1:7400");
        assert_eq!(json["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_host_then_show_domain() {
        let app = router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/admin/domains/7/host",
                json!({ "replication_factor": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/admin/domains/7").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["replication_factor"], 2);
        assert_eq!(json["hosts"][0], "10.0.0.1:7400");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_lookups() {
        let app = router();
        let response = app
            .clone()
            .oneshot(Request::get("/admin/domains/99").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::get("/admin/nodes/not-an-address")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_threshold_rejects_non_positive() {
        let response = router()
            .oneshot(post_json(
                "/admin/heavy-load-threshold",
                json!({ "threshold": -1.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_peer_message_is_accepted() {
        let envelope = json!({
            "from": "10.0.0.2:7400",
            "message": { "type": "heartbeat_request" }
        });
        let response = router()
            .oneshot(post_json(PEER_MESSAGE_PATH, envelope))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}

//! Directory HTTP query surface.
//!
//! Consumers and the admin tooling discover brokers here: `/lookup` maps a
//! topic to the producers currently hosting it, `/nodes` lists every live
//! producer. Both filter by the liveness window; producers fall out of
//! query results once unseen for longer than `inactive_producer_timeout`
//! without being removed from the index.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::directory::Directory;
use crate::error::Result;
use crate::registration::{PeerInfo, Producer};

/// Build the directory's HTTP router.
pub fn router(dir: Arc<Directory>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/topics", get(topics))
        .route("/channels", get(channels))
        .route("/lookup", get(lookup))
        .route("/nodes", get(nodes))
        .with_state(dir)
}

/// Serve HTTP until shutdown.
///
/// # Errors
/// Fails if the server cannot run on the provided listener.
pub async fn serve(dir: Arc<Directory>, listener: tokio::net::TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http listener started");
    let mut exit = dir.exit_subscribe();
    axum::serve(listener, router(dir))
        .with_graceful_shutdown(async move {
            let _ = exit.recv().await;
        })
        .await?;
    info!(%addr, "http listener stopped");
    Ok(())
}

/// Producer fields exposed over HTTP.
#[derive(Debug, Serialize)]
pub struct ProducerInfo {
    /// Remote address of the producer's directory connection.
    pub remote_address: String,
    /// Producer hostname.
    pub hostname: String,
    /// Address consumers should connect to.
    pub broadcast_address: String,
    /// Producer client TCP port.
    pub tcp_port: u16,
    /// Producer HTTP port.
    pub http_port: u16,
    /// Producer software version.
    pub version: String,
}

impl From<&PeerInfo> for ProducerInfo {
    fn from(info: &PeerInfo) -> Self {
        Self {
            remote_address: info.id.clone(),
            hostname: info.hostname.clone(),
            broadcast_address: info.broadcast_address.clone(),
            tcp_port: info.tcp_port,
            http_port: info.http_port,
            version: info.version.clone(),
        }
    }
}

async fn ping() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct TopicsResponse {
    topics: Vec<String>,
}

async fn topics(State(dir): State<Arc<Directory>>) -> Json<TopicsResponse> {
    let mut topics: Vec<String> =
        dir.db.find_registrations("topic", "*", "").into_iter().map(|r| r.key).collect();
    topics.sort();
    Json(TopicsResponse { topics })
}

#[derive(Deserialize)]
struct TopicParams {
    topic: String,
}

#[derive(Serialize)]
struct ChannelsResponse {
    channels: Vec<String>,
}

async fn channels(
    State(dir): State<Arc<Directory>>,
    Query(params): Query<TopicParams>,
) -> Json<ChannelsResponse> {
    let mut channels: Vec<String> = dir
        .db
        .find_registrations("channel", &params.topic, "*")
        .into_iter()
        .map(|r| r.sub_key)
        .collect();
    channels.sort();
    Json(ChannelsResponse { channels })
}

#[derive(Serialize)]
struct LookupResponse {
    channels: Vec<String>,
    producers: Vec<ProducerInfo>,
}

async fn lookup(
    State(dir): State<Arc<Directory>>,
    Query(params): Query<TopicParams>,
) -> std::result::Result<Json<LookupResponse>, (StatusCode, String)> {
    if dir.db.find_registrations("topic", &params.topic, "").is_empty() {
        return Err((StatusCode::NOT_FOUND, "TOPIC_NOT_FOUND".into()));
    }
    let mut channels: Vec<String> = dir
        .db
        .find_registrations("channel", &params.topic, "*")
        .into_iter()
        .map(|r| r.sub_key)
        .collect();
    channels.sort();
    let producers = active_producers(&dir, dir.db.find_producers("topic", &params.topic, ""));
    Ok(Json(LookupResponse { channels, producers }))
}

#[derive(Serialize)]
struct NodeInfo {
    #[serde(flatten)]
    producer: ProducerInfo,
    topics: Vec<String>,
}

#[derive(Serialize)]
struct NodesResponse {
    producers: Vec<NodeInfo>,
}

async fn nodes(State(dir): State<Arc<Directory>>) -> Json<NodesResponse> {
    let window = dir.config().inactive_producer_timeout;
    let mut producers: Vec<NodeInfo> = dir
        .db
        .find_producers("client", "", "")
        .into_iter()
        .filter(|p| p.is_active(window))
        .map(|p| {
            let mut topics: Vec<String> = dir
                .db
                .lookup_registrations(&p.id)
                .into_iter()
                .filter(|r| r.category == "topic")
                .map(|r| r.key)
                .collect();
            topics.sort();
            NodeInfo { producer: ProducerInfo::from(p.as_ref()), topics }
        })
        .collect();
    producers.sort_by(|a, b| a.producer.hostname.cmp(&b.producer.hostname));
    Json(NodesResponse { producers })
}

fn active_producers(dir: &Arc<Directory>, producers: Vec<Producer>) -> Vec<ProducerInfo> {
    let window = dir.config().inactive_producer_timeout;
    let mut active: Vec<ProducerInfo> = producers
        .into_iter()
        .filter(|p| p.is_active(window))
        .map(|p| ProducerInfo::from(p.as_ref()))
        .collect();
    active.sort_by(|a, b| a.remote_address.cmp(&b.remote_address));
    active
}

//! Broker HTTP surface: stats and convenience publish endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use courier_core::{Message, MessageId};
use serde::Deserialize;
use tracing::info;

use crate::broker::{Broker, BrokerStats};
use crate::error::Result;

/// Build the broker's HTTP router.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats))
        .route("/put", post(put))
        .route("/empty_channel", post(empty_channel))
        .route("/pause_channel", post(pause_channel))
        .route("/unpause_channel", post(unpause_channel))
        .with_state(broker)
}

/// Serve HTTP until broker shutdown.
///
/// # Errors
/// Fails if the server cannot run on the provided listener.
pub async fn serve(broker: Arc<Broker>, listener: tokio::net::TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http listener started");
    let mut exit = broker.exit_subscribe();
    axum::serve(listener, router(broker))
        .with_graceful_shutdown(async move {
            let _ = exit.recv().await;
        })
        .await?;
    info!(%addr, "http listener stopped");
    Ok(())
}

async fn ping() -> &'static str {
    "OK"
}

async fn stats(State(broker): State<Arc<Broker>>) -> Json<BrokerStats> {
    Json(broker.stats())
}

#[derive(Deserialize)]
struct TopicParams {
    topic: String,
}

async fn put(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<TopicParams>,
    body: Bytes,
) -> std::result::Result<&'static str, (StatusCode, String)> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty message body".into()));
    }
    if body.len() > broker.config().max_msg_size as usize {
        return Err((StatusCode::BAD_REQUEST, "message too big".into()));
    }
    let topic = broker
        .get_topic(&params.topic)
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    topic
        .put_message(Message::new(MessageId::random(), body))
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok("OK")
}

#[derive(Deserialize)]
struct ChannelParams {
    topic: String,
    channel: String,
}

async fn empty_channel(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<ChannelParams>,
) -> std::result::Result<&'static str, (StatusCode, String)> {
    let channel = existing_channel(&broker, &params)?;
    channel
        .empty()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok("OK")
}

async fn pause_channel(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<ChannelParams>,
) -> std::result::Result<&'static str, (StatusCode, String)> {
    existing_channel(&broker, &params)?.pause();
    Ok("OK")
}

async fn unpause_channel(
    State(broker): State<Arc<Broker>>,
    Query(params): Query<ChannelParams>,
) -> std::result::Result<&'static str, (StatusCode, String)> {
    existing_channel(&broker, &params)?.unpause();
    Ok("OK")
}

fn existing_channel(
    broker: &Arc<Broker>,
    params: &ChannelParams,
) -> std::result::Result<Arc<crate::channel::Channel>, (StatusCode, String)> {
    let topic = broker
        .get_existing_topic(&params.topic)
        .map_err(|err| (StatusCode::NOT_FOUND, err.to_string()))?;
    topic
        .get_existing_channel(&params.channel)
        .map_err(|err| (StatusCode::NOT_FOUND, err.to_string()))
}

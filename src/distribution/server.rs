//! HTTP and WebSocket surface of the config distribution service
//!
//! Endpoints:
//! - `GET /healthz`
//! - `GET /api/v1/configs` lists keys with a published document
//! - `GET /api/v1/configs/{namespace}/{name}` returns the latest document
//! - `GET /api/v1/configs/{namespace}/{name}/watch` upgrades to a WebSocket
//!   that streams one JSON [`ConfigUpdate`] text frame per version
//!
//! When a token is configured, every `/api` request must present it as
//! `Authorization: Bearer <token>` or as the `token` query parameter.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfigDistributor, ConfigUpdate, DeliveryPolicy, Subscription};
use crate::crd::ObjectKey;

/// Errors returned by the distribution endpoints
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    /// No credentials were presented
    #[error("missing authorization")]
    MissingAuth,
    /// Credentials did not match
    #[error("invalid token")]
    InvalidToken,
    /// No document was published for the key
    #[error("config {0} not found")]
    NotFound(String),
}

impl IntoResponse for DistributionError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DistributionError::MissingAuth => (StatusCode::UNAUTHORIZED, self.to_string()),
            DistributionError::InvalidToken => (StatusCode::UNAUTHORIZED, self.to_string()),
            DistributionError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Shared state of the distribution server
#[derive(Clone, Debug)]
pub struct DistributionState {
    distributor: ConfigDistributor,
    token: Option<Arc<str>>,
}

impl DistributionState {
    /// State serving `distributor`, optionally requiring a bearer token
    pub fn new(distributor: ConfigDistributor, token: Option<String>) -> Self {
        Self {
            distributor,
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<(), DistributionError> {
        let Some(expected) = self.token.as_deref() else {
            return Ok(());
        };
        let presented = match query_token {
            Some(token) => token.to_string(),
            None => extract_bearer_token(headers)?,
        };
        if presented == expected {
            Ok(())
        } else {
            Err(DistributionError::InvalidToken)
        }
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, DistributionError> {
    let auth_header = headers.get("authorization").ok_or(DistributionError::MissingAuth)?;

    let auth_str = auth_header.to_str().map_err(|_| DistributionError::InvalidToken)?;

    auth_str
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
        .ok_or(DistributionError::InvalidToken)
}

/// Query parameters accepted by the config endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ConfigQuery {
    #[serde(default)]
    policy: DeliveryPolicy,
    token: Option<String>,
}

/// Response of the key listing endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigList {
    /// Keys with a published document, as `namespace/name`
    pub configs: Vec<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_configs(
    State(state): State<DistributionState>,
    Query(query): Query<ConfigQuery>,
    headers: HeaderMap,
) -> Result<Json<ConfigList>, DistributionError> {
    state.authorize(&headers, query.token.as_deref())?;
    let configs = state
        .distributor
        .keys()
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(Json(ConfigList { configs }))
}

async fn get_config(
    State(state): State<DistributionState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<ConfigQuery>,
    headers: HeaderMap,
) -> Result<Json<ConfigUpdate>, DistributionError> {
    state.authorize(&headers, query.token.as_deref())?;
    let key = ObjectKey::namespaced(namespace, name);
    let update = state
        .distributor
        .latest(&key)
        .ok_or_else(|| DistributionError::NotFound(key.to_string()))?;
    Ok(Json(update.as_ref().clone()))
}

async fn watch_config(
    ws: WebSocketUpgrade,
    State(state): State<DistributionState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<ConfigQuery>,
    headers: HeaderMap,
) -> Result<Response, DistributionError> {
    state.authorize(&headers, query.token.as_deref())?;
    let key = ObjectKey::namespaced(namespace, name);
    let policy = query.policy;
    Ok(ws
        .on_upgrade(move |socket| stream_configs(socket, state.distributor, key, policy))
        .into_response())
}

/// Forward every version of a topic to a WebSocket until either side ends
async fn stream_configs(
    socket: WebSocket,
    distributor: ConfigDistributor,
    key: ObjectKey,
    policy: DeliveryPolicy,
) {
    let (sender, receiver) = socket.split();
    forward_updates(sender, receiver, distributor.subscribe(&key, policy)).await;
}

/// Send one text frame per version, then a Close frame once the topic ends
///
/// Returns when the topic closes, the peer sends Close or hangs up, or a
/// frame cannot be sent.
async fn forward_updates<S, R, E>(mut sender: S, mut receiver: R, mut subscription: Subscription)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let key = subscription.key().clone();
    info!(key = %key, policy = ?subscription.policy(), "Config watch connected");

    loop {
        tokio::select! {
            update = subscription.next() => {
                let Some(update) = update else {
                    debug!(key = %key, "Config topic closed");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let payload = match serde_json::to_string(update.as_ref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to encode config update");
                        break;
                    }
                };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    debug!(key = %key, "Config watch peer went away");
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!(key = %key, "Config watch disconnected");
}

/// Router with every distribution endpoint
pub fn router(state: DistributionState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/configs", get(list_configs))
        .route("/api/v1/configs/{namespace}/{name}", get(get_config))
        .route("/api/v1/configs/{namespace}/{name}/watch", get(watch_config))
        .with_state(state)
}

/// Serve the distribution endpoints until cancelled
pub async fn serve(
    addr: SocketAddr,
    state: DistributionState,
    token: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Config distribution server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ClusterConfig, ClusterType, RenderedConfig};
    use axum::body::Body;
    use axum::http::Request;
    use futures::channel::mpsc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tower::ServiceExt;

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "gw")
    }

    fn state(token: Option<&str>) -> DistributionState {
        let distributor = ConfigDistributor::new(4);
        distributor.publish(&key(), RenderedConfig::default());
        DistributionState::new(distributor, token.map(str::to_string))
    }

    async fn request(state: DistributionState, uri: &str, auth: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header("authorization", auth);
        }
        router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_needs_no_token() {
        let response = request(state(Some("secret")), "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_latest_config() {
        let response = request(state(None), "/api/v1/configs/default/gw", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 1);
        assert!(body["config"]["listeners"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_config_is_404() {
        let response = request(state(None), "/api/v1/configs/default/missing", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("default/missing"));
    }

    #[tokio::test]
    async fn test_list_configs() {
        let response = request(state(None), "/api/v1/configs", None).await;
        let body = body_json(response).await;
        assert_eq!(body["configs"], serde_json::json!(["default/gw"]));
    }

    /// Story: relays must present the shared token when one is configured
    #[tokio::test]
    async fn story_token_is_enforced() {
        let missing = request(state(Some("secret")), "/api/v1/configs", None).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = request(state(Some("secret")), "/api/v1/configs", Some("Bearer nope")).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let header = request(
            state(Some("secret")),
            "/api/v1/configs",
            Some("Bearer secret"),
        )
        .await;
        assert_eq!(header.status(), StatusCode::OK);

        let query = request(state(Some("secret")), "/api/v1/configs?token=secret", None).await;
        assert_eq!(query.status(), StatusCode::OK);
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(DistributionError::MissingAuth)
        ));
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(DistributionError::InvalidToken)
        ));
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc");
    }

    #[test]
    fn test_policy_query_parsing() {
        let query: ConfigQuery =
            serde_json::from_value(serde_json::json!({"policy": "every"})).unwrap();
        assert_eq!(query.policy, DeliveryPolicy::Every);
        let query: ConfigQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(query.policy, DeliveryPolicy::Latest);
    }

    #[tokio::test]
    async fn test_watch_without_upgrade_is_rejected() {
        let response = request(state(None), "/api/v1/configs/default/gw/watch", None).await;
        assert!(response.status().is_client_error());
    }

    fn doc(endpoint: &str) -> RenderedConfig {
        RenderedConfig {
            listeners: vec![],
            clusters: vec![ClusterConfig {
                name: "default/route".to_string(),
                type_: ClusterType::Static,
                endpoints: [endpoint.to_string()].into(),
            }],
        }
    }

    type Incoming = mpsc::UnboundedSender<Result<Message, axum::Error>>;
    type Outgoing = mpsc::UnboundedReceiver<Message>;

    /// Run the frame forwarder over in-memory channels standing in for a socket
    fn connect(
        distributor: &ConfigDistributor,
        policy: DeliveryPolicy,
    ) -> (Incoming, Outgoing, tokio::task::JoinHandle<()>) {
        let (frames_tx, frames_rx) = mpsc::unbounded();
        let (peer_tx, peer_rx) = mpsc::unbounded();
        let subscription = distributor.subscribe(&key(), policy);
        let task = tokio::spawn(forward_updates(frames_tx, peer_rx, subscription));
        (peer_tx, frames_rx, task)
    }

    async fn next_frame(frames: &mut Outgoing) -> Message {
        timeout(Duration::from_secs(1), frames.next())
            .await
            .expect("no frame within a second")
            .expect("forwarder hung up")
    }

    async fn next_update(frames: &mut Outgoing) -> ConfigUpdate {
        match next_frame(frames).await {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Story: a relay watching its config gets the current document, every
    /// later version, and a Close frame when the gateway goes away
    #[tokio::test]
    async fn story_watch_streams_snapshot_versions_and_close() {
        let distributor = ConfigDistributor::new(4);
        distributor.publish(&key(), doc("10.0.0.1"));
        let (_peer, mut frames, task) = connect(&distributor, DeliveryPolicy::Latest);

        let first = next_update(&mut frames).await;
        assert_eq!(first.version, 1);
        assert!(first.config.clusters[0].endpoints.contains("10.0.0.1"));

        distributor.publish(&key(), doc("10.0.0.2"));
        let second = next_update(&mut frames).await;
        assert_eq!(second.version, 2);
        assert!(second.config.clusters[0].endpoints.contains("10.0.0.2"));

        distributor.remove(&key());
        let last = next_update(&mut frames).await;
        assert_eq!(last.version, 3);
        assert!(last.config.is_empty());
        assert!(matches!(next_frame(&mut frames).await, Message::Close(None)));

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    /// Story: with policy=every a relay sees each version in order
    #[tokio::test]
    async fn story_every_policy_streams_each_version() {
        let distributor = ConfigDistributor::new(8);
        distributor.publish(&key(), doc("10.0.0.1"));
        let (_peer, mut frames, _task) = connect(&distributor, DeliveryPolicy::Every);
        assert_eq!(next_update(&mut frames).await.version, 1);

        for i in 2..=4 {
            distributor.publish(&key(), doc(&format!("10.0.0.{i}")));
        }
        let versions = vec![
            next_update(&mut frames).await.version,
            next_update(&mut frames).await.version,
            next_update(&mut frames).await.version,
        ];
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_watch_waits_for_first_version() {
        let distributor = ConfigDistributor::new(4);
        let (_peer, mut frames, _task) = connect(&distributor, DeliveryPolicy::Latest);
        assert!(timeout(Duration::from_millis(50), frames.next()).await.is_err());

        distributor.publish(&key(), doc("10.0.0.1"));
        assert_eq!(next_update(&mut frames).await.version, 1);
    }

    #[tokio::test]
    async fn test_peer_close_ends_watch_and_releases_subscription() {
        let distributor = ConfigDistributor::new(4);
        distributor.publish(&key(), doc("10.0.0.1"));
        let (peer, mut frames, task) = connect(&distributor, DeliveryPolicy::Latest);
        assert_eq!(next_update(&mut frames).await.version, 1);
        assert_eq!(distributor.subscriber_count(&key()), 1);

        peer.unbounded_send(Ok(Message::Close(None))).unwrap();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(distributor.subscriber_count(&key()), 0);
    }
}

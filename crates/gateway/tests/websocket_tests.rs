use anyhow::anyhow;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use parley_auth::JwtManager;
use parley_bus::{GatewayChannel, MemoryGatewayChannel};
use parley_events::{GatewayEnvelope, GatewayId, MessageCreated, PushEvent, UserId};
use parley_gateway::{create_router, spawn_background_tasks, ConnectionManager, GatewayState};
use parley_presence::{MemoryPresenceRegistry, PresenceRegistry};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

type TestResult<T = ()> = anyhow::Result<T>;
type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "gateway-test-secret";
const WAIT: Duration = Duration::from_secs(5);

struct TestGateway {
    address: SocketAddr,
    gateway_id: GatewayId,
    presence: MemoryPresenceRegistry,
    channel: MemoryGatewayChannel,
    connections: Arc<ConnectionManager>,
    tokens: Arc<JwtManager>,
    shutdown: CancellationToken,
}

impl TestGateway {
    async fn start() -> TestResult<Self> {
        let gateway_id = GatewayId::from("G1");
        let presence = MemoryPresenceRegistry::new();
        let channel = MemoryGatewayChannel::new();
        let connections = Arc::new(ConnectionManager::new(
            gateway_id.clone(),
            Arc::new(presence.clone()),
            Duration::from_secs(60),
            16,
        ));
        let tokens = Arc::new(JwtManager::new(SECRET));
        let shutdown = CancellationToken::new();

        spawn_background_tasks(
            connections.clone(),
            Arc::new(channel.clone()),
            Duration::from_secs(30),
            shutdown.clone(),
        );

        let app = create_router(GatewayState::new(connections.clone(), tokens.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });

        Ok(Self {
            address,
            gateway_id,
            presence,
            channel,
            connections,
            tokens,
            shutdown,
        })
    }

    async fn connect(&self, authorization: Option<String>) -> TestResult<Client> {
        let mut request = format!("ws://{}/ws", self.address).into_client_request()?;
        if let Some(value) = authorization {
            request
                .headers_mut()
                .insert("authorization", HeaderValue::from_str(&value)?);
        }
        let (client, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(client)
    }

    async fn connect_as(&self, user: &str) -> TestResult<Client> {
        let token = self.tokens.issue(&UserId::from(user))?;
        self.connect(Some(format!("Bearer {token}"))).await
    }

    async fn wait_for_presence(&self, user: &str, expected: Option<&str>) -> TestResult<()> {
        let user = UserId::from(user);
        let expected = expected.map(GatewayId::from);
        tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(owner) = self.presence.lookup(&user).await {
                    if owner == expected {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(())
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn next_frame(client: &mut Client) -> TestResult<Value> {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await?
            .ok_or_else(|| anyhow!("socket closed"))??;
        match message {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => return Err(anyhow!("socket closed")),
            _ => continue,
        }
    }
}

fn message(seq: i64) -> PushEvent {
    PushEvent::MessageNew(MessageCreated::new(
        "c-1".into(),
        format!("m-{seq}").into(),
        seq,
        "alice".into(),
        Utc::now(),
        "hello bob",
    ))
}

#[tokio::test]
async fn authenticated_client_is_greeted_and_tracked() -> TestResult {
    let gateway = TestGateway::start().await?;
    let mut client = gateway.connect_as("bob").await?;

    let frame = next_frame(&mut client).await?;
    assert_eq!(frame["event"], "connected");
    assert_eq!(frame["data"]["userId"], "bob");
    assert_eq!(frame["data"]["gatewayId"], "G1");

    assert_eq!(
        gateway.presence.lookup(&"bob".into()).await?,
        Some(gateway.gateway_id.clone())
    );
    assert_eq!(gateway.connections.active_connections().await, 1);
    Ok(())
}

#[tokio::test]
async fn missing_or_bad_credentials_get_error_then_close() -> TestResult {
    let gateway = TestGateway::start().await?;

    for authorization in [None, Some("Bearer not-a-token".to_string())] {
        let mut client = gateway.connect(authorization).await?;
        let frame = next_frame(&mut client).await?;
        assert_eq!(frame["event"], "error");

        let closed = tokio::time::timeout(WAIT, async {
            loop {
                match client.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    assert_eq!(gateway.presence.len().await, 0);
    assert_eq!(gateway.connections.active_connections().await, 0);
    Ok(())
}

#[tokio::test]
async fn ping_is_answered_with_pong() -> TestResult {
    let gateway = TestGateway::start().await?;
    let mut client = gateway.connect_as("bob").await?;
    next_frame(&mut client).await?;

    client
        .send(Message::Text(r#"{"event":"ping","data":{}}"#.to_string()))
        .await?;
    let frame = next_frame(&mut client).await?;

    assert_eq!(frame["event"], "pong");
    assert!(frame["data"]["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn channel_envelopes_reach_the_socket() -> TestResult {
    let gateway = TestGateway::start().await?;
    let mut client = gateway.connect_as("bob").await?;
    next_frame(&mut client).await?;

    // Republish until the forwarder's subscription is live.
    let frame = tokio::time::timeout(WAIT, async {
        loop {
            gateway
                .channel
                .publish(
                    &gateway.gateway_id,
                    &GatewayEnvelope::new("bob".into(), message(5)),
                )
                .await?;
            if let Ok(frame) =
                tokio::time::timeout(Duration::from_millis(50), next_frame(&mut client)).await
            {
                return frame;
            }
        }
    })
    .await??;

    assert_eq!(frame["event"], "message.new");
    assert_eq!(frame["data"]["seq"], 5);
    assert_eq!(frame["data"]["preview"], "hello bob");
    Ok(())
}

#[tokio::test]
async fn closing_the_socket_releases_presence() -> TestResult {
    let gateway = TestGateway::start().await?;
    let mut client = gateway.connect_as("bob").await?;
    next_frame(&mut client).await?;

    client.close(None).await?;
    gateway.wait_for_presence("bob", None).await?;

    tokio::time::timeout(WAIT, async {
        while gateway.connections.active_connections().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn reconnect_on_same_gateway_survives_old_socket_closing() -> TestResult {
    let gateway = TestGateway::start().await?;
    let mut old = gateway.connect_as("bob").await?;
    next_frame(&mut old).await?;
    let mut new = gateway.connect_as("bob").await?;
    next_frame(&mut new).await?;

    old.close(None).await?;
    // Give the server time to process the close.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        gateway.presence.lookup(&"bob".into()).await?,
        Some(gateway.gateway_id.clone())
    );
    assert_eq!(gateway.connections.active_connections().await, 1);

    new.send(Message::Text(r#"{"event":"ping"}"#.to_string()))
        .await?;
    assert_eq!(next_frame(&mut new).await?["event"], "pong");
    Ok(())
}

#[tokio::test]
async fn health_reports_gateway_and_connection_count() -> TestResult {
    let gateway = TestGateway::start().await?;
    let mut client = gateway.connect_as("bob").await?;
    next_frame(&mut client).await?;

    let app = create_router(GatewayState::new(
        gateway.connections.clone(),
        gateway.tokens.clone(),
    ));
    let response = app
        .oneshot(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await?.to_bytes();
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["status"], "ok");
    assert_eq!(value["gatewayId"], "G1");
    assert_eq!(value["activeConnections"], 1);
    Ok(())
}

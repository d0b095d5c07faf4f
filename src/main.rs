/// Tutor Voice Core — real-time conversational orchestrator.
///
/// Terminates one client WebSocket per tutoring session and wires it into
/// a `Gateway` (§4.1). HTTP bootstrap, auth, and the pedagogical content
/// library are outside this crate's scope; this binary is the minimal
/// listener needed to actually exercise the Gateway end to end.
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tutor_voice_core::config::Config;
use tutor_voice_core::session::orchestrator::{GatewayHandle, Orchestrator};
use tutor_voice_core::voice::error::VoiceError;
use tutor_voice_core::voice::event_queue::EventHandler;
use tutor_voice_core::voice::gateway::{ClientInboundFrame, ClientTransport, Gateway};
use tutor_voice_core::voice::speech_scheduler::SpeechScheduler;
use tutor_voice_core::voice::voice_pool::ConnectionFactory;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = env::var("TUTOR_VOICE_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8787".to_string())
        .parse()?;

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "tutor voice core listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config).await {
                error!(%peer, error = %e, "session ended with an error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (sink, stream) = ws.split();
    let client: Arc<dyn ClientTransport> = Arc::new(WsClientTransport {
        sink: AsyncMutex::new(sink),
        stream: AsyncMutex::new(stream),
    });

    let scheduler = SpeechScheduler::new();
    let gateway_handle = GatewayHandle::new(config.allowed_roles.clone(), scheduler.clone());
    let orchestrator: Arc<dyn EventHandler> = Arc::new(Orchestrator::new(
        uuid::Uuid::new_v4().to_string(),
        config.allowed_roles.clone(),
        gateway_handle,
        None,
    ));

    let factory: Arc<dyn ConnectionFactory> = Arc::new(upstream::TungsteniteConnectionFactory::new(
        config.upstream_base_url.clone(),
        config.upstream_api_key.clone(),
        config.model_id.clone(),
    ));

    let gateway = Gateway::new(&config, client, factory, orchestrator, scheduler);
    gateway.start().await?;
    gateway.done().await;
    Ok(())
}

/// Bridges a `tokio-tungstenite` stream to [`ClientTransport`].
struct WsClientTransport {
    sink: AsyncMutex<futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, WsMessage>>,
    stream: AsyncMutex<futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>>,
}

#[async_trait]
impl ClientTransport for WsClientTransport {
    async fn send_text(&self, json: String) -> Result<(), VoiceError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| VoiceError::Transport { role: "client".to_string(), message: e.to_string() })
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), VoiceError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Binary(data.into()))
            .await
            .map_err(|e| VoiceError::Transport { role: "client".to_string(), message: e.to_string() })
    }

    async fn recv(&self) -> Option<ClientInboundFrame> {
        loop {
            match self.stream.lock().await.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(ClientInboundFrame::Text(text.to_string())),
                Some(Ok(WsMessage::Binary(data))) => return Some(ClientInboundFrame::Binary(data.to_vec())),
                Some(Ok(WsMessage::Close(_))) | None => return Some(ClientInboundFrame::Close),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "client websocket read error");
                    return Some(ClientInboundFrame::Close);
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// Minimal upstream connection factory: opens one WebSocket per role
/// against the configured realtime endpoint (§6 "Upstream voice
/// endpoints"). The vendor's wire protocol internals beyond the event
/// taxonomy pinned in `voice::types` are out of scope (§1), so this only
/// needs to move `UpstreamClientEvent`/`UpstreamServerEvent` JSON frames
/// across the socket.
mod upstream {
    use super::*;
    use futures_util::stream::{SplitSink, SplitStream};
    use tokio_tungstenite::WebSocketStream;
    use tutor_voice_core::voice::role_connection::UpstreamTransport;
    use tutor_voice_core::voice::types::{UpstreamClientEvent, UpstreamServerEvent};

    pub struct TungsteniteConnectionFactory {
        base_url: String,
        api_key: String,
        model_id: String,
    }

    impl TungsteniteConnectionFactory {
        pub fn new(base_url: String, api_key: String, model_id: String) -> Self {
            Self { base_url, api_key, model_id }
        }
    }

    #[async_trait]
    impl ConnectionFactory for TungsteniteConnectionFactory {
        async fn connect(&self, role: &str, _voice: &str) -> Result<Arc<dyn UpstreamTransport>, VoiceError> {
            let url = format!("{}?model={}", self.base_url, self.model_id);
            let mut request = url
                .into_client_request()
                .map_err(|e| VoiceError::Transport { role: role.to_string(), message: e.to_string() })?;
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {}", self.api_key)
                    .parse()
                    .map_err(|_| VoiceError::Transport { role: role.to_string(), message: "invalid api key header".to_string() })?,
            );

            let (ws, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| VoiceError::Transport { role: role.to_string(), message: e.to_string() })?;
            let (sink, stream) = ws.split();
            Ok(Arc::new(UpstreamWsTransport {
                sink: AsyncMutex::new(sink),
                stream: AsyncMutex::new(stream),
            }))
        }
    }

    struct UpstreamWsTransport {
        sink: AsyncMutex<SplitSink<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>, WsMessage>>,
        stream: AsyncMutex<SplitStream<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>>>,
    }

    #[async_trait]
    impl UpstreamTransport for UpstreamWsTransport {
        async fn send(&self, event: UpstreamClientEvent) -> Result<(), VoiceError> {
            let json = serde_json::to_string(&event)
                .map_err(|e| VoiceError::Transport { role: "upstream".to_string(), message: e.to_string() })?;
            self.sink
                .lock()
                .await
                .send(WsMessage::Text(json.into()))
                .await
                .map_err(|e| VoiceError::Transport { role: "upstream".to_string(), message: e.to_string() })
        }

        async fn recv(&self) -> Option<UpstreamServerEvent> {
            loop {
                match self.stream.lock().await.next().await {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str(&text) {
                        Ok(event) => return Some(event),
                        Err(e) => {
                            warn!(error = %e, "malformed upstream event, skipping");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream websocket read error");
                        return None;
                    }
                }
            }
        }

        async fn close(&self) {
            let _ = self.sink.lock().await.close().await;
        }
    }

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
}

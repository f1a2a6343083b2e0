//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use tether_core::{generate_device_key, validate_device_key, Config, DeviceKey, SignalError};

use crate::channel::{Channel, Outbound};
use crate::messages::ServerMessage;
use crate::reaper::Reaper;
use crate::router::{Connection, SignalRouter};

/// Bytes peeked when sniffing the request head
const PEEK_LIMIT: usize = 2048;
/// Attempts to see a complete request head before giving up on sniffing
const PEEK_ATTEMPTS: usize = 50;
const PEEK_RETRY: Duration = Duration::from_millis(10);
/// How long a fresh connection may take to send its request head
const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts at drawing an unused key for `/validate-key` suggestions
const SUGGESTION_ATTEMPTS: usize = 8;

type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Signal server state
pub struct SignalServer {
    router: SignalRouter,
    config: Config,
}

impl SignalServer {
    pub fn new(config: Config) -> Self {
        Self {
            router: SignalRouter::new(),
            config,
        }
    }

    pub fn router(&self) -> &SignalRouter {
        &self.router
    }

    /// Bind and start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.run(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn run(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let maintenance = Reaper::new(self.router.clone(), self.config.liveness.clone()).spawn();
        info!("Liveness mode: {:?}", self.config.liveness.mode);

        let result = self.accept_loop(&listener).await;

        for handle in maintenance {
            handle.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let router = self.router.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, router).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(mut stream: TcpStream, peer_addr: SocketAddr, router: SignalRouter) -> ConnResult {
    let head = sniff_request_head(&stream).await?;
    if head.starts_with(b"GET ") && !is_websocket_upgrade(&head) {
        return handle_http_request(&mut stream, &router).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (channel, mut outbound) = Channel::new();
    let mut conn = Connection::new(channel.clone());
    debug!("New connection from {} as {}", peer_addr, channel.id());

    // All socket writes happen here, in queue order
    let writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let frame = match item {
                Outbound::Message(msg) => match msg.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        warn!("Failed to encode outbound message: {}", e);
                        continue;
                    }
                },
                Outbound::Probe => Message::Ping(Vec::new()),
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };

            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => router.handle_text(&mut conn, &text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => router.handle_text(&mut conn, &text),
                    Err(_) => {
                        let err = SignalError::MalformedMessage("binary frame is not UTF-8".into());
                        let _ = channel.send(ServerMessage::error(&err));
                    }
                },
                Some(Ok(Message::Pong(_))) => router.confirm_liveness(&conn),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {:?}", channel.id(), e);
                    break;
                }
            },
            _ = channel.closed() => {
                debug!("{} closed by relay", channel.id());
                break;
            }
        }
    }

    // Cleanup on disconnect
    if let Some(key) = conn.device() {
        debug!("{} leaving, releasing {}", channel.id(), key);
    }
    router.channel_closed(&mut conn);
    channel.close();
    let _ = writer.await;

    debug!("Connection closed: {}", channel.id());
    Ok(())
}

/// Peek the request head, giving up on clients that never send one
async fn sniff_request_head(stream: &TcpStream) -> Result<Vec<u8>, std::io::Error> {
    tokio::time::timeout(SNIFF_TIMEOUT, peek_request_head(stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no request head received"))?
}

/// Peek until the request head is complete, the buffer fills, or the
/// client stops sending
async fn peek_request_head(stream: &TcpStream) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut n = 0;

    for _ in 0..PEEK_ATTEMPTS {
        n = stream.peek(&mut buf).await?;
        if n == 0 || n == buf.len() || contains_head_end(&buf[..n]) {
            break;
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }

    buf.truncate(n);
    Ok(buf)
}

fn contains_head_end(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"\r\n\r\n")
}

/// True if the request head carries `Upgrade: websocket`
fn is_websocket_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
}

/// Handle an HTTP request (health checks and key lookups)
async fn handle_http_request(stream: &mut TcpStream, router: &SignalRouter) -> ConnResult {
    // Read the HTTP request
    let mut buf = vec![0u8; PEEK_LIMIT];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Parse the request path
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = http_route(path, router);

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn http_route(path: &str, router: &SignalRouter) -> (&'static str, String) {
    match path {
        "/health" => (
            "200 OK",
            json!({
                "status": "healthy",
                "devices": router.device_count(),
                "negotiations": router.negotiation_count(),
            })
            .to_string(),
        ),
        "/stats" => (
            "200 OK",
            json!({
                "devices": router.device_count(),
                "negotiations": router.negotiation_count(),
            })
            .to_string(),
        ),
        _ => match path.strip_prefix("/validate-key/") {
            Some(key) => {
                let valid = validate_device_key(key);
                let available = match DeviceKey::parse(key) {
                    Ok(key) => !router.is_registered(&key),
                    Err(_) => false,
                };
                let suggestion = if available { None } else { suggest_key(router) };
                (
                    "200 OK",
                    json!({
                        "key": key,
                        "valid": valid,
                        "available": available,
                        "suggestion": suggestion,
                    })
                    .to_string(),
                )
            }
            None => ("404 Not Found", json!({"error": "not found"}).to_string()),
        },
    }
}

/// A random well-formed key nobody currently holds
fn suggest_key(router: &SignalRouter) -> Option<DeviceKey> {
    for _ in 0..SUGGESTION_ATTEMPTS {
        match generate_device_key() {
            Ok(key) if !router.is_registered(&key) => return Some(key),
            Ok(_) => continue,
            Err(e) => {
                warn!("Key suggestion unavailable: {}", e);
                return None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start() -> (SocketAddr, SignalRouter) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SignalServer::default();
        let router = server.router().clone();

        tokio::spawn(async move {
            let _ = server.run(listener).await;
        });
        (addr, router)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send(client: &mut Client, msg: Value) {
        client.send(Message::Text(msg.to_string())).await.unwrap();
    }

    async fn recv(client: &mut Client) -> ServerMessage {
        loop {
            let frame = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn register(addr: SocketAddr, key: &str) -> Client {
        let mut client = connect(addr).await;
        send(&mut client, json!({"type": "register", "deviceKey": key})).await;
        assert!(matches!(recv(&mut client).await, ServerMessage::RegistrationSuccess { .. }));
        client
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    fn body(response: &str) -> Value {
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_upgrade_detection() {
        let upgrade = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        let plain = b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n";

        assert!(is_websocket_upgrade(upgrade));
        assert!(!is_websocket_upgrade(plain));
        assert!(contains_head_end(plain));
        assert!(!contains_head_end(b"GET /health HTTP/1.1\r\n"));
    }

    #[test]
    fn test_http_routes() {
        let router = SignalRouter::new();

        let (status, body) = http_route("/validate-key/AAAA111111", &router);
        assert_eq!(status, "200 OK");
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["valid"], true);
        assert_eq!(body["available"], true);

        assert!(body["suggestion"].is_null());

        let (_, body) = http_route("/validate-key/short", &router);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["valid"], false);
        assert_eq!(body["available"], false);
        let suggestion = body["suggestion"].as_str().unwrap();
        assert!(validate_device_key(suggestion));

        let (status, _) = http_route("/nope", &router);
        assert_eq!(status, "404 Not Found");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, _router) = start().await;
        let _a = register(addr, "AAAA111111").await;

        let response = http_get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let health = body(&response);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["devices"], 1);

        let response = http_get(addr, "/validate-key/AAAA111111").await;
        let lookup = body(&response);
        assert_eq!(lookup["available"], false);
        assert_ne!(lookup["suggestion"], "AAAA111111");
        assert!(validate_device_key(lookup["suggestion"].as_str().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let err = sniff_request_head(&server_side).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_offer_answer_over_websocket() {
        let (addr, router) = start().await;
        let mut a = register(addr, "AAAA111111").await;
        let mut b = register(addr, "BBBB222222").await;
        let key_a = DeviceKey::parse("AAAA111111").unwrap();
        let key_b = DeviceKey::parse("BBBB222222").unwrap();

        send(&mut a, json!({"type": "offer", "targetKey": "BBBB222222", "offer": {"sdp": "x"}})).await;
        assert_eq!(
            recv(&mut b).await,
            ServerMessage::Offer {
                source_key: key_a.clone(),
                offer: json!({"sdp": "x"})
            }
        );

        send(&mut b, json!({"type": "answer", "targetKey": "AAAA111111", "answer": {"sdp": "y"}})).await;
        assert_eq!(
            recv(&mut a).await,
            ServerMessage::Answer {
                source_key: key_b,
                answer: json!({"sdp": "y"})
            }
        );

        a.close(None).await.unwrap();
        assert_eq!(
            recv(&mut b).await,
            ServerMessage::PeerDisconnected { device_key: key_a }
        );
        assert_eq!(router.negotiation_count(), 0);
        assert_eq!(router.device_count(), 1);
    }

    #[tokio::test]
    async fn test_superseded_socket_is_closed() {
        let (addr, router) = start().await;
        let mut first = register(addr, "AAAA111111").await;
        let _second = register(addr, "AAAA111111").await;

        assert!(matches!(recv(&mut first).await, ServerMessage::ForcedDisconnect { .. }));

        // the server closes the displaced socket
        loop {
            match timeout(WAIT, first.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
        assert_eq!(router.device_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (addr, _router) = start().await;
        let mut client = connect(addr).await;

        client.send(Message::Text("{nope".into())).await.unwrap();
        assert!(matches!(recv(&mut client).await, ServerMessage::Error { .. }));

        send(&mut client, json!({"type": "register", "deviceKey": "AAAA111111"})).await;
        assert!(matches!(recv(&mut client).await, ServerMessage::RegistrationSuccess { .. }));
    }
}

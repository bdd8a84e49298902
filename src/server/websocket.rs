//! WebSocket server implementation
//!
//! Listens on a configurable port, answers tool calls from each connection and
//! forwards registry events to every connected client.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use super::protocol::{ErrorCode, ServerMessage};
use crate::shell::Terminal;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Optional authentication token
    pub token: Option<String>,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            token: None,
        }
    }

    /// Set the authentication token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server exposing one shell registry
pub struct WebSocketServer {
    config: ServerConfig,
    handler: ConnectionHandler,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server over `terminal`
    pub fn new(config: ServerConfig, terminal: Arc<Terminal>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler: ConnectionHandler::new(terminal),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener
    ///
    /// Connections are handled concurrently. On shutdown every shell in the
    /// registry is closed.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("WebSocket server listening on ws://{}/ws", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let handler = self.handler.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let token = self.config.token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, handler, shutdown_rx, token).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        self.handler.terminal().shutdown_all();
        Ok(())
    }
}

/// Check a handshake request against the expected token
///
/// Accepts `?token=<token>` in the URL or an `Authorization: Bearer <token>`
/// header.
fn token_matches(request: &Request, expected: &str) -> bool {
    let in_query = request
        .uri()
        .query()
        .map(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .any(|(key, value)| key == "token" && value == expected)
        })
        .unwrap_or(false);

    let in_header = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value == expected)
        .unwrap_or(false);

    in_query || in_header
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: ConnectionHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
    token: Option<String>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let mut authorized = token.is_none();
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        if let Some(expected) = token.as_deref() {
            authorized = token_matches(request, expected);
        }
        Ok(response)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if !authorized {
        warn!("Rejected unauthenticated connection from {}", peer_addr);
        let error = ServerMessage::error_with_code("Authentication required", ErrorCode::AuthRequired);
        ws_sender.send(Message::Text(error.to_json()?)).await?;
        let _ = ws_sender.send(Message::Close(None)).await;
        return Ok(());
    }

    let welcome = ServerMessage::welcome_with_id(format!("shellmux/{}", env!("CARGO_PKG_VERSION")));
    ws_sender.send(Message::Text(welcome.to_json()?)).await?;
    debug!("Sent welcome message to {}", peer_addr);

    let mut events = handler.terminal().subscribe();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", peer_addr, text);
                        let response = handler.handle_text(&text).await;
                        ws_sender.send(Message::Text(response.to_json()?)).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let message = ServerMessage::from(event);
                        ws_sender.send(Message::Text(message.to_json()?)).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Connection {} missed {} registry events", peer_addr, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_server_config_with_token() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080)
            .with_token(Some("secret".to_string()));
        assert_eq!(config.token, Some("secret".to_string()));
    }

    #[test]
    fn test_token_matches() {
        let request = Request::builder()
            .uri("ws://localhost/ws?other=1&token=secret")
            .body(())
            .unwrap();
        assert!(token_matches(&request, "secret"));
        assert!(!token_matches(&request, "other"));

        let request = Request::builder()
            .uri("ws://localhost/ws")
            .header("Authorization", "Bearer secret")
            .body(())
            .unwrap();
        assert!(token_matches(&request, "secret"));

        let request = Request::builder().uri("ws://localhost/ws").body(()).unwrap();
        assert!(!token_matches(&request, "secret"));
    }

    async fn start_server(token: Option<String>) -> (Arc<WebSocketServer>, SocketAddr) {
        let terminal = Arc::new(Terminal::with_config(ShellConfig {
            wait_budget_ms: 500,
            ..ShellConfig::default()
        }));
        let config = ServerConfig::new("127.0.0.1".to_string(), 0).with_token(token);
        let server = Arc::new(WebSocketServer::new(config, terminal));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn next_message<S>(stream: &mut S) -> ServerMessage
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Connection ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_tool_call_over_websocket() {
        let (server, addr) = start_server(None).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        assert!(matches!(next_message(&mut ws).await, ServerMessage::Welcome { .. }));

        let create = r#"{"type":"call_tool","call_id":"1","call":{"tool":"create_shell","arguments":{"name":"ws"}}}"#;
        ws.send(Message::Text(create.to_string())).await.unwrap();
        let run = r#"{"type":"call_tool","call_id":"2","call":{"tool":"run_command","arguments":{"shell":"ws","command":"echo over-the-wire"}}}"#;
        ws.send(Message::Text(run.to_string())).await.unwrap();

        let mut created_event = false;
        let mut run_output = None;
        while run_output.is_none() || !created_event {
            match next_message(&mut ws).await {
                ServerMessage::ShellCreated { name } => {
                    assert_eq!(name, "ws");
                    created_event = true;
                }
                ServerMessage::ToolResult { call_id, output, .. } if call_id.as_deref() == Some("2") => {
                    run_output = Some(output);
                }
                _ => {}
            }
        }
        assert_eq!(run_output.as_deref(), Some("over-the-wire"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_token_required() {
        let (server, addr) = start_server(Some("secret".to_string())).await;

        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        match next_message(&mut ws).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::AuthRequired)),
            other => panic!("Expected Error, got {:?}", other),
        }

        let (mut ws, _) = connect_async(format!("ws://{}/ws?token=secret", addr))
            .await
            .unwrap();
        assert!(matches!(next_message(&mut ws).await, ServerMessage::Welcome { .. }));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_shells() {
        let (server, addr) = start_server(None).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        next_message(&mut ws).await;

        server.handler.terminal().create_shell(Some("doomed")).unwrap();
        server.shutdown();

        for _ in 0..50 {
            if server.handler.terminal().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(server.handler.terminal().is_empty());
    }
}

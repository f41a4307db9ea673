//! Local stand-ins for the monitoring service used by the integration tests.
//!
//! - `MockSocketIoServer` speaks enough Engine.IO v4 / Socket.IO v5 to accept one client
//!   into the default namespace and push frames on demand.
//! - `MockHttpServer` answers every request with one canned response and records the
//!   request heads.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const ENGINE_OPEN: &str =
    r#"0{"sid":"mock-sid","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

fn engine_open(ping_interval_ms: u64, ping_timeout_ms: u64) -> String {
    format!(
        r#"0{{"sid":"mock-sid","upgrades":[],"pingInterval":{ping_interval_ms},"pingTimeout":{ping_timeout_ms},"maxPayload":1000000}}"#
    )
}

#[derive(Debug)]
enum ServerCommand {
    Send(String),
    Close,
}

#[derive(Debug, Clone)]
enum NamespaceReply {
    Accept,
    Refuse(String),
}

pub struct MockSocketIoServer {
    addr: SocketAddr,
    commands: mpsc::UnboundedSender<ServerCommand>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<u32>>,
    client_closed: Arc<AtomicBool>,
}

impl MockSocketIoServer {
    pub async fn start() -> Self {
        Self::start_with(NamespaceReply::Accept, ENGINE_OPEN.to_string()).await
    }

    pub async fn refusing(message: &str) -> Self {
        Self::start_with(
            NamespaceReply::Refuse(message.to_string()),
            ENGINE_OPEN.to_string(),
        )
        .await
    }

    /// Accepts the client but advertises the given heartbeat and never pings.
    pub async fn with_heartbeat(ping_interval_ms: u64, ping_timeout_ms: u64) -> Self {
        Self::start_with(
            NamespaceReply::Accept,
            engine_open(ping_interval_ms, ping_timeout_ms),
        )
        .await
    }

    async fn start_with(reply: NamespaceReply, open_frame: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let client_closed = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let received_clone = received.clone();
        let connections_clone = connections.clone();
        let client_closed_clone = client_closed.clone();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            *connections_clone.lock().await += 1;
            let peer = Peer {
                received: received_clone,
                client_closed: client_closed_clone,
            };
            handle_connection(stream, reply, open_frame, peer, command_rx).await;
        });

        Self {
            addr,
            commands,
            received,
            connections,
            client_closed,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/socket.io/?EIO=4&transport=websocket", self.addr)
    }

    pub fn send_frame(&self, frame: impl Into<String>) {
        let _ = self.commands.send(ServerCommand::Send(frame.into()));
    }

    pub fn emit(&self, event: &str, payload_json: &str) {
        self.send_frame(format!(r#"42["{event}",{payload_json}]"#));
    }

    pub fn close(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    pub async fn received_frames(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Whether the client sent a websocket close frame.
    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_frame(&self, expected: &str) -> bool {
        for _ in 0..400 {
            if self.received.lock().await.iter().any(|frame| frame == expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

struct Peer {
    received: Arc<Mutex<Vec<String>>>,
    client_closed: Arc<AtomicBool>,
}

async fn handle_connection(
    stream: TcpStream,
    reply: NamespaceReply,
    open_frame: String,
    peer: Peer,
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    if write.send(Message::Text(open_frame)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = read.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => {
                        peer.client_closed.store(true, Ordering::SeqCst);
                        break;
                    }
                    Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                peer.received.lock().await.push(text.clone());

                if text == "40" {
                    let answer = match &reply {
                        NamespaceReply::Accept => r#"40{"sid":"mock-socket"}"#.to_string(),
                        NamespaceReply::Refuse(message) => {
                            format!(r#"44{{"message":"{message}"}}"#)
                        }
                    };
                    if write.send(Message::Text(answer)).await.is_err() {
                        break;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(ServerCommand::Send(frame)) => {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Some(ServerCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}

pub struct MockHttpServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockHttpServer {
    pub async fn start(status_line: &'static str, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let requests_clone = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let requests = requests_clone.clone();
                tokio::spawn(answer_request(stream, status_line, body, requests));
            }
        });

        Self { addr, requests }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

async fn answer_request(
    mut stream: TcpStream,
    status_line: &'static str,
    body: &'static str,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut head = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(read) => head.extend_from_slice(&buffer[..read]),
        }
    }
    requests
        .lock()
        .await
        .push(String::from_utf8_lossy(&head).into_owned());

    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

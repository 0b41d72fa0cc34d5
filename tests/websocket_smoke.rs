//! End-to-end check over a real socket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use snake_arena::network::{AuthConfig, GameServer, ServerConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A client socket plus the JSON lines already read but not yet consumed.
/// Frames may carry several newline-joined messages.
struct Client {
    socket: Socket,
    pending: VecDeque<serde_json::Value>,
}

impl Client {
    async fn open(url: String) -> Self {
        let (socket, _) = connect_async(url).await.unwrap();
        Self {
            socket,
            pending: VecDeque::new(),
        }
    }

    /// Read messages until one of type `kind` shows up. Messages of other
    /// types stay queued for later reads.
    async fn read_until(&mut self, kind: &str) -> serde_json::Value {
        if let Some(pos) = self.pending.iter().position(|v| v["type"] == kind) {
            return self.pending.remove(pos).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match self.socket.next().await {
                    Some(Ok(Message::Text(text))) => {
                        for line in text.split('\n').filter(|l| !l.trim().is_empty()) {
                            self.pending.push_back(serde_json::from_str(line).unwrap());
                        }
                        if let Some(pos) = self.pending.iter().position(|v| v["type"] == kind) {
                            return self.pending.remove(pos).unwrap();
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended waiting for {}: {:?}", kind, other),
                }
            }
        })
        .await
        .expect("timed out")
    }

    async fn send(&mut self, text: &str) {
        self.socket.send(Message::Text(text.into())).await.unwrap();
    }

    /// Drain until the server closes the socket.
    async fn read_until_closed(&mut self) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match self.socket.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .expect("socket not closed")
    }
}

async fn start_server() -> (Arc<GameServer>, String) {
    let server = Arc::new(GameServer::new(ServerConfig::default(), AuthConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    tokio::spawn(async move { running.run_with_listener(listener).await });
    (server, format!("ws://{}/", addr))
}

#[tokio::test]
async fn test_username_handshake_and_lobby() {
    let (server, url) = start_server().await;

    let mut client = Client::open(format!("{}?username=alice", url)).await;
    let connected = client.read_until("connected").await;
    assert_eq!(connected["player"]["username"], "alice");
    assert!(connected["token"].as_str().map(|t| !t.is_empty()).unwrap_or(false));

    let lobby = client.read_until("lobby_status").await;
    assert_eq!(lobby["players"][0]["username"], "alice");

    client.send("{\"type\":\"list_games\"}").await;
    let games = client.read_until("games_list").await;
    assert!(games["games"].as_array().unwrap().is_empty());

    server.shutdown();
}

#[tokio::test]
async fn test_username_with_encoded_space() {
    let (server, url) = start_server().await;

    let mut client = Client::open(format!("{}?username=ada%20lovelace", url)).await;
    let connected = client.read_until("connected").await;
    assert_eq!(connected["player"]["username"], "ada lovelace");

    server.shutdown();
}

#[tokio::test]
async fn test_token_reconnect_evicts_old_socket() {
    let (server, url) = start_server().await;

    let mut first = Client::open(format!("{}?username=bob", url)).await;
    let connected = first.read_until("connected").await;
    let id = connected["player"]["id"].as_str().unwrap().to_string();
    let token = connected["token"].as_str().unwrap().to_string();

    let mut second = Client::open(format!("{}?token={}", url, token)).await;
    let again = second.read_until("connected").await;
    assert_eq!(again["player"]["id"], id.as_str());

    first.read_until_closed().await;
    server.shutdown();
}

#[tokio::test]
async fn test_bad_token_gets_error_then_close() {
    let (server, url) = start_server().await;

    let mut client = Client::open(format!("{}?token=garbage", url)).await;
    let error = client.read_until("error").await;
    assert_eq!(error["code"], "INVALID_TOKEN");
    client.read_until_closed().await;

    assert_eq!(server.coordinator().directory().len().await, 0);
    server.shutdown();
}

#[tokio::test]
async fn test_missing_credentials_rejected() {
    let (server, url) = start_server().await;

    let mut client = Client::open(url).await;
    let error = client.read_until("error").await;
    assert_eq!(error["code"], "INVALID_MESSAGE");
    client.read_until_closed().await;

    server.shutdown();
}

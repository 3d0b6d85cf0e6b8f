//! Loopback Socket.IO server speaking just enough of the protocol to drive the client in tests.

use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;

const OPEN: &str = r#"0{"sid":"engine-sid","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
const CONNECTED: &str = r#"40{"sid":"test-sid"}"#;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Acknowledges the namespace and records frames until the client leaves.
    Accept,
    /// Acknowledges the namespace, then pings once.
    Ping,
    /// Answers the namespace connect with CONNECT_ERROR.
    Refuse,
    /// Acknowledges the namespace, then disconnects the client.
    Kick,
}

pub struct TestServer {
    pub url: String,
    frames: JoinHandle<Vec<(Instant, String)>>,
}

impl TestServer {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let frames = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            socket.send(Message::text(OPEN)).await.unwrap();

            let mut frames = Vec::new();
            while let Some(Ok(message)) = socket.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let text = text.as_str().to_owned();
                frames.push((Instant::now(), text.clone()));
                // The namespace connect may carry an auth object after the packet type.
                if !text.starts_with("40") {
                    continue;
                }
                // Sends may fail once the client has dropped the connection.
                let replies: &[&str] = match behavior {
                    Behavior::Accept => &[CONNECTED],
                    Behavior::Ping => &[CONNECTED, "2"],
                    Behavior::Refuse => &[r#"44{"message":"Not authorized"}"#],
                    Behavior::Kick => &[CONNECTED, "41"],
                };
                for reply in replies {
                    let _ = socket.send(Message::text(*reply)).await;
                }
            }
            frames
        });
        Self { url, frames }
    }

    /// Frames received from the client, available once it has disconnected.
    pub async fn frames(self) -> Vec<(Instant, String)> {
        self.frames.await.unwrap()
    }
}

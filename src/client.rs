use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use futures_util::FutureExt;
use rust_socketio::asynchronous::{Client as SocketClient, ClientBuilder};
use rust_socketio::{Event, Payload, TransportType};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

const DEFAULT_NAMESPACE: &str = "/";

/// Callbacks fired on lifecycle transitions of the connection.
pub trait LifecycleHandler: Send + Sync + 'static {
    fn on_connect(&self);
    fn on_disconnect(&self);
}

impl<T: LifecycleHandler + ?Sized> LifecycleHandler for Arc<T> {
    fn on_connect(&self) {
        (**self).on_connect()
    }

    fn on_disconnect(&self) {
        (**self).on_disconnect()
    }
}

pub struct ConsoleHandler {
    server_url: String,
}

impl ConsoleHandler {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }
}

impl LifecycleHandler for ConsoleHandler {
    fn on_connect(&self) {
        tracing::info!("Connected to server at {}", self.server_url);
    }

    fn on_disconnect(&self) {
        tracing::info!("Disconnected from server at {}", self.server_url);
    }
}

/// Reduces the configured server url to the plain http origin the socket client expects.
pub fn server_address(server_url: &str) -> anyhow::Result<String> {
    let (scheme, rest) = server_url
        .split_once("://")
        .ok_or_else(|| anyhow!("Server url {:?} has no scheme", server_url))?;
    match scheme {
        "http" | "ws" => {}
        "https" | "wss" => {
            return Err(anyhow!(
                "Server url {:?} requires TLS, only plain http servers are supported",
                server_url
            ))
        }
        other => return Err(anyhow!("Unsupported url scheme {:?}", other)),
    }
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(anyhow!("Server url {:?} has no host", server_url));
    }
    Ok(format!("http://{}", authority))
}

fn normalize_namespace(namespace: &str) -> String {
    match namespace.trim() {
        "" => DEFAULT_NAMESPACE.to_string(),
        ns if ns.starts_with('/') => ns.to_string(),
        ns => format!("/{}", ns),
    }
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Text(values) => values
            .iter()
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Payload::Binary(bytes) => format!("<{} bytes>", bytes.len()),
        #[allow(deprecated)]
        other => format!("{:?}", other),
    }
}

// State shared between the Client and the callbacks registered on the socket. The flags keep
// each lifecycle callback to a single call even if the socket reports a transition twice.
struct Link {
    handler: Box<dyn LifecycleHandler>,
    opened: AtomicBool,
    closed: AtomicBool,
    handshake: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
}

impl Link {
    fn new(
        handler: Box<dyn LifecycleHandler>,
        handshake: oneshot::Sender<Result<(), String>>,
    ) -> Self {
        Self {
            handler,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handshake: Mutex::new(Some(handshake)),
        }
    }

    fn open(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.handler.on_connect();
        }
        self.settle(Ok(()));
    }

    fn close(&self) {
        if self.opened.load(Ordering::SeqCst) && !self.closed.swap(true, Ordering::SeqCst) {
            self.handler.on_disconnect();
        }
        self.settle(Err("connection closed before the namespace was accepted".to_owned()));
    }

    fn fail(&self, reason: String) {
        self.settle(Err(reason));
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    // Only the first outcome reaches the waiting connect call.
    fn settle(&self, outcome: Result<(), String>) {
        let pending = match self.handshake.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handshake) = pending {
            let _ = handshake.send(outcome);
        }
    }
}

pub struct Client {
    socket: SocketClient,
    namespace: String,
    link: Arc<Link>,
}

impl Client {
    /// Connects and waits until the server has accepted the namespace.
    pub async fn connect<H: LifecycleHandler>(
        server_url: &str,
        namespace: &str,
        handler: H,
    ) -> anyhow::Result<Self> {
        let address = server_address(server_url)?;
        let namespace = normalize_namespace(namespace);
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let link = Arc::new(Link::new(Box::new(handler), handshake_tx));

        let on_open = link.clone();
        let on_close = link.clone();
        let on_error = link.clone();
        tracing::debug!("Connecting to {} [namespace={}]", address, namespace);
        let socket = ClientBuilder::new(address)
            .namespace(namespace.clone())
            .transport_type(TransportType::Websocket)
            .reconnect(false)
            .on(Event::Connect, move |_: Payload, _: SocketClient| {
                on_open.open();
                async {}.boxed()
            })
            .on(Event::Close, move |_: Payload, _: SocketClient| {
                on_close.close();
                async {}.boxed()
            })
            .on(Event::Error, move |payload: Payload, _: SocketClient| {
                let reason = describe(&payload);
                tracing::warn!("Socket.IO error: {}", reason);
                on_error.fail(reason);
                async {}.boxed()
            })
            .connect()
            .await
            .with_context(|| format!("Error connecting to {}", server_url))?;

        match handshake_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = socket.disconnect().await;
                return Err(anyhow!("Server refused namespace {}: {}", namespace, reason));
            }
            Err(_) => return Err(anyhow!("Connection closed during the handshake")),
        }

        Ok(Self {
            socket,
            namespace,
            link,
        })
    }

    /// Sends `data` as the single argument of `event`.
    pub async fn emit<T: Serialize>(&self, event: &str, data: &T) -> anyhow::Result<()> {
        if !self.link.is_open() {
            return Err(anyhow!("Cannot emit {:?}, connection is closed", event));
        }
        let data = serde_json::to_value(data)?;
        self.socket
            .emit(event, Payload::Text(vec![data]))
            .await
            .with_context(|| format!("Error emitting {:?}", event))
    }

    pub async fn disconnect(self) -> anyhow::Result<()> {
        tracing::debug!("Disconnecting from namespace {}", self.namespace);
        let was_open = self.link.is_open();
        let result = self.socket.disconnect().await;
        self.link.close();
        match result {
            Ok(()) => Ok(()),
            // The server already left, the transport may be gone with it.
            Err(err) if !was_open => {
                tracing::debug!("Error closing a finished connection: {}", err);
                Ok(())
            }
            Err(err) => Err(err).context("Error disconnecting"),
        }
    }
}

//! WebSocket gateway for out-of-process clients and workers.
//!
//! Binds one listener per channel:
//!
//! | Endpoint | Direction | Frames |
//! |---|---|---|
//! | control | client ⇄ kernel | `ControlRequest` in, `ControlResponse` out |
//! | command | kernel → worker | first frame `{"subscribe": "<name>"}`, then `TopicMessage`s |
//! | data | worker → kernel | `DataPacket`s, rate-limited per connection |
//!
//! Failing to bind any of the three is fatal for the process; everything
//! after that is per-connection and only logged.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use ionctl_types::{ControlRequest, ControlResponse, KernelError};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::CommandBus;
use crate::control::ControlClient;
use crate::data::DataSender;

/// Network endpoints of the three channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub host: String,
    pub control_port: u16,
    pub command_port: u16,
    pub data_port: u16,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            control_port: 5555,
            command_port: 5556,
            data_port: 5557,
        }
    }
}

/// Default per-connection data frame budget, frames per second.
pub const DEFAULT_DATA_RATE: NonZeroU32 = NonZeroU32::new(1000).unwrap();

/// Per-connection behaviour of the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// How long a control connection waits for the kernel's reply.
    pub control_timeout: Duration,
    /// Maximum data frames accepted per second on one connection.
    pub max_data_rate: NonZeroU32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(5),
            max_data_rate: DEFAULT_DATA_RATE,
        }
    }
}

/// Addresses the gateway actually bound (useful with port `0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayAddrs {
    pub control: SocketAddr,
    pub command: SocketAddr,
    pub data: SocketAddr,
}

/// Bound, not yet serving, listeners for the three channels.
pub struct Gateway {
    control: TcpListener,
    command: TcpListener,
    data: TcpListener,
}

impl Gateway {
    /// Bind all three listeners.
    ///
    /// # Errors
    ///
    /// [`KernelError::Transport`] naming the channel that failed to bind.
    pub async fn bind(endpoints: &Endpoints) -> Result<Self, KernelError> {
        let control = bind_one("control", &endpoints.host, endpoints.control_port).await?;
        let command = bind_one("command", &endpoints.host, endpoints.command_port).await?;
        let data = bind_one("data", &endpoints.host, endpoints.data_port).await?;
        Ok(Self {
            control,
            command,
            data,
        })
    }

    pub fn local_addrs(&self) -> Result<GatewayAddrs, KernelError> {
        let addr = |l: &TcpListener| {
            l.local_addr()
                .map_err(|e| KernelError::Transport(format!("local_addr: {e}")))
        };
        Ok(GatewayAddrs {
            control: addr(&self.control)?,
            command: addr(&self.command)?,
            data: addr(&self.data)?,
        })
    }

    /// Accept connections on all three listeners until `shutdown` flips to
    /// `true`.
    pub async fn serve(
        self,
        control: ControlClient,
        bus: CommandBus,
        data: DataSender,
        settings: GatewaySettings,
        shutdown: watch::Receiver<bool>,
    ) {
        let control_loop = accept_loop("control", self.control, shutdown.clone(), {
            let settings = settings.clone();
            move |stream, peer| {
                let client = control.clone();
                let timeout = settings.control_timeout;
                async move { handle_control(stream, peer, client, timeout).await }
            }
        });
        let command_loop = accept_loop("command", self.command, shutdown.clone(), move |stream, peer| {
            let bus = bus.clone();
            async move { handle_command(stream, peer, bus).await }
        });
        let data_loop = accept_loop("data", self.data, shutdown, move |stream, peer| {
            let sender = data.clone();
            let rate = settings.max_data_rate;
            async move { handle_data(stream, peer, sender, rate).await }
        });
        tokio::join!(control_loop, command_loop, data_loop);
    }
}

async fn bind_one(channel: &str, host: &str, port: u16) -> Result<TcpListener, KernelError> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| KernelError::Transport(format!("{channel} bind error on {host}:{port}: {e}")))?;
    info!(channel, host, port, "gateway listening");
    Ok(listener)
}

async fn accept_loop<F, Fut>(
    channel: &'static str,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: std::future::Future<Output = Result<(), KernelError>> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(channel, %peer, "connection accepted");
                    let conn = handler(stream, peer);
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            warn!(channel, %peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(channel, error = %e, "accept error"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(channel, "gateway listener stopping");
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control endpoint
// ---------------------------------------------------------------------------

/// Decode a control frame and forward it to the kernel. Never fails: every
/// problem becomes an `error` response for the client.
pub(crate) async fn process_control_frame(
    text: &str,
    client: &ControlClient,
    timeout: Duration,
) -> ControlResponse {
    let request = match serde_json::from_str::<ControlRequest>(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed control request");
            return ControlResponse::error("MALFORMED_REQUEST", e.to_string());
        }
    };
    match client.request(request, timeout).await {
        Ok(resp) => resp,
        Err(e) => ControlResponse::from_error(&e),
    }
}

async fn handle_control(
    stream: TcpStream,
    peer: SocketAddr,
    client: ControlClient,
    timeout: Duration,
) -> Result<(), KernelError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| KernelError::Transport(format!("control handshake from {peer}: {e}")))?;
    let (mut tx, mut rx) = ws.split();

    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let response = process_control_frame(text.as_str(), &client, timeout).await;
                let json = serde_json::to_string(&response)?;
                tx.send(Message::Text(json.into()))
                    .await
                    .map_err(|e| KernelError::Transport(format!("control write to {peer}: {e}")))?;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(KernelError::Transport(format!("control read from {peer}: {e}"))),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command endpoint
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubscribeFrame {
    subscribe: String,
}

pub(crate) fn parse_subscribe(text: &str) -> Result<String, KernelError> {
    let frame: SubscribeFrame = serde_json::from_str(text)?;
    if frame.subscribe.trim().is_empty() {
        return Err(KernelError::BadRequest("empty subscriber name".into()));
    }
    Ok(frame.subscribe)
}

async fn handle_command(stream: TcpStream, peer: SocketAddr, bus: CommandBus) -> Result<(), KernelError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| KernelError::Transport(format!("command handshake from {peer}: {e}")))?;
    let (mut tx, mut rx) = ws.split();

    let name = loop {
        match rx.next().await {
            Some(Ok(Message::Text(text))) => break parse_subscribe(text.as_str())?,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(KernelError::Transport(format!("command read from {peer}: {e}")));
            }
        }
    };
    info!(%peer, worker = %name, "worker subscribed to command channel");
    let mut sub = bus.subscribe(name);

    loop {
        tokio::select! {
            next = sub.recv() => {
                let Some(message) = next else { break };
                let json = serde_json::to_string(&message)?;
                if tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            }
        }
    }
    debug!(%peer, worker = %sub.name(), "command subscriber disconnected");
    Ok(())
}

// ---------------------------------------------------------------------------
// Data endpoint
// ---------------------------------------------------------------------------

async fn handle_data(
    stream: TcpStream,
    peer: SocketAddr,
    sender: DataSender,
    max_rate: NonZeroU32,
) -> Result<(), KernelError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| KernelError::Transport(format!("data handshake from {peer}: {e}")))?;
    let (_tx, mut rx) = ws.split();
    let limiter = RateLimiter::direct(Quota::per_second(max_rate));
    let mut dropped: u64 = 0;

    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if limiter.check().is_err() {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        warn!(%peer, dropped, "data connection over rate limit; frames dropped");
                    }
                    continue;
                }
                sender.send_raw(text.as_str());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(KernelError::Transport(format!("data read from {peer}: {e}"))),
        }
    }
    Ok(())
}

//! Synchronous control channel.
//!
//! Clients issue a [`ControlRequest`] and wait for the matching
//! [`ControlResponse`]. All [`ControlClient`] clones share one in-flight
//! lock, so the kernel only ever sees one outstanding request; the server
//! side reads with a short poll timeout so shutdown stays responsive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ionctl_types::{ControlRequest, ControlResponse, KernelError};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::warn;

/// Create a connected client/server pair.
pub fn control_channel() -> (ControlClient, ControlServer) {
    let (tx, rx) = mpsc::channel(1);
    (
        ControlClient {
            tx,
            in_flight: Arc::new(Mutex::new(())),
        },
        ControlServer { rx },
    )
}

/// A request waiting for its reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: ControlRequest,
    received_at: Instant,
    reply: oneshot::Sender<ControlResponse>,
}

impl PendingRequest {
    /// Send the reply back to the waiting client. Returns `false` if the
    /// client already gave up (timed out or disconnected).
    pub fn reply(self, response: ControlResponse) -> bool {
        let action = self.request.action;
        let ok = self.reply.send(response).is_ok();
        if !ok {
            warn!(
                action = %action,
                elapsed_ms = self.received_at.elapsed().as_millis() as u64,
                "control client went away before the reply was sent"
            );
        }
        ok
    }
}

/// Server half, owned by the kernel's control loop.
#[derive(Debug)]
pub struct ControlServer {
    rx: mpsc::Receiver<PendingRequest>,
}

impl ControlServer {
    /// Wait up to `poll` for the next request.
    ///
    /// `Ok(None)` on poll timeout; an error once every client is gone.
    pub async fn receive_control(&mut self, poll: Duration) -> Result<Option<PendingRequest>, KernelError> {
        match tokio::time::timeout(poll, self.rx.recv()).await {
            Ok(Some(pending)) => Ok(Some(pending)),
            Ok(None) => Err(KernelError::Transport("control channel closed".into())),
            Err(_) => Ok(None),
        }
    }
}

/// Client half. Cheap to clone; clones serialize on one in-flight lock.
#[derive(Clone, Debug)]
pub struct ControlClient {
    tx: mpsc::Sender<PendingRequest>,
    in_flight: Arc<Mutex<()>>,
}

impl ControlClient {
    /// Send `request` and wait for the reply.
    ///
    /// # Errors
    ///
    /// - [`KernelError::TransportTimeout`] – no reply within `timeout`
    ///   (time spent waiting for the in-flight slot counts).
    /// - [`KernelError::Transport`] – the server is gone.
    pub async fn request(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<ControlResponse, KernelError> {
        let exchange = async {
            let _slot = self.in_flight.lock().await;
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(PendingRequest {
                    request,
                    received_at: Instant::now(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| KernelError::Transport("control channel closed".into()))?;
            reply_rx
                .await
                .map_err(|_| KernelError::Transport("control reply dropped".into()))
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| KernelError::TransportTimeout {
                channel: "control".into(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionctl_types::ResponseStatus;

    #[tokio::test]
    async fn request_round_trips_through_server() {
        let (client, mut server) = control_channel();
        let srv = tokio::spawn(async move {
            let pending = server
                .receive_control(Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pending.request.action, "STATUS");
            pending.reply(ControlResponse::success().with("mode", "MANUAL"));
        });
        let resp = client
            .request(ControlRequest::new("STATUS", "USER"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Success);
        assert_eq!(resp.data["mode"], "MANUAL");
        srv.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, _server) = control_channel();
        let err = client
            .request(ControlRequest::new("STATUS", "USER"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::TransportTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn server_poll_returns_none_when_idle() {
        let (_client, mut server) = control_channel();
        let got = server.receive_control(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn dropped_server_is_a_transport_error() {
        let (client, server) = control_channel();
        drop(server);
        let err = client
            .request(ControlRequest::new("STATUS", "USER"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Transport(_)));
    }

    #[tokio::test]
    async fn second_client_waits_for_first_reply() {
        let (client, mut server) = control_channel();
        let other = client.clone();

        let first = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request(ControlRequest::new("A", "USER"), Duration::from_secs(5))
                    .await
            }
        });
        let p1 = server.receive_control(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(p1.request.action, "A");

        let second = tokio::spawn(async move {
            other
                .request(ControlRequest::new("B", "USER"), Duration::from_secs(5))
                .await
        });
        // B must not be visible while A is unanswered.
        assert!(
            server
                .receive_control(Duration::from_millis(50))
                .await
                .unwrap()
                .is_none()
        );

        p1.reply(ControlResponse::success());
        let p2 = server.receive_control(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(p2.request.action, "B");
        p2.reply(ControlResponse::success());

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }
}

//! `ionctl-transport` – the three channels between the kernel and the lab.
//!
//! Moves messages without interpreting them.
//!
//! # Modules
//!
//! - [`bus`] – one-to-many, topic-filtered command broadcast built on Tokio
//!   broadcast channels. Sends never block; slow workers lose messages.
//! - [`data`] – many-to-one telemetry/result queue with a bounded,
//!   drop-on-full ingress and a timed receive.
//! - [`control`] – synchronous request/reply channel with one request in
//!   flight at a time.
//! - [`gateway`] – WebSocket listeners that expose the three channels to
//!   out-of-process clients and workers.

pub mod bus;
pub mod control;
pub mod data;
pub mod gateway;

pub use bus::{CommandBus, CommandSubscriber};
pub use control::{ControlClient, ControlServer, PendingRequest, control_channel};
pub use data::{DataReceiver, DataSender, data_channel};
pub use gateway::{DEFAULT_DATA_RATE, Endpoints, Gateway, GatewayAddrs, GatewaySettings};

//! `ionctl-runtime` – assembles a running coordinator from a
//! [`KernelConfig`].
//!
//! | Module | Contents |
//! |---|---|
//! | [`config`] | `KernelConfig`: endpoints, timeouts, kill-switch limits, parameter table, fragment toggles |
//! | [`coordinator`] | `Coordinator`: component wiring, background loops, graceful shutdown |
//! | [`telemetry`] | `tracing` subscriber and optional OTLP span export |
//!
//! ```rust,no_run
//! use ionctl_runtime::{Coordinator, KernelConfig};
//!
//! # async fn run() -> Result<(), ionctl_types::KernelError> {
//! let mut coordinator = Coordinator::new(KernelConfig::default())?;
//! coordinator.start()?;
//! coordinator.serve_gateway().await?;
//! tokio::signal::ctrl_c().await.ok();
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod telemetry;

pub use config::{DeviceLimit, ExperimentConfig, FragmentToggles, KernelConfig, NetworkConfig, OptimizerConfig};
pub use coordinator::Coordinator;
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

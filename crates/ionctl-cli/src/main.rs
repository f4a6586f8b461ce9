//! `ionctl-cli` – the `ionctl` coordinator process.
//!
//! 1. Installs tracing (`RUST_LOG`, `IONCTL_LOG_FORMAT`, optional OTLP).
//! 2. Loads `~/.ionctl/config.toml` (or `$IONCTL_CONFIG`); on first run the
//!    built-in defaults are used and written there for editing. An invalid
//!    file aborts startup.
//! 3. Starts the coordinator and binds the three gateway endpoints. Failing
//!    to bind is the only fatal startup error.
//! 4. On **Ctrl-C** issues a final STOP (safety defaults broadcast), shuts
//!    fragments down in reverse order and exits.

mod config;

use std::sync::Arc;

use colored::Colorize;
use ionctl_runtime::{Coordinator, KernelConfig, telemetry};
use ionctl_types::KernelError;
use tokio::sync::Notify;
use tracing::{error, info, warn};

fn main() {
    let _telemetry = telemetry::init_tracing("ionctl");

    print_banner();

    let cfg = load_config();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let stop = Arc::new(Notify::new());
    let stop_signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping coordinator …".yellow().bold());
        stop_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start Tokio runtime");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cfg, stop)) {
        println!("{}: {}", "Fatal".red().bold(), e);
        error!(error = %e, code = e.code(), "coordinator exited with error");
        std::process::exit(1);
    }
}

async fn run(cfg: KernelConfig, stop: Arc<Notify>) -> Result<(), KernelError> {
    let mut coordinator = Coordinator::new(cfg)?;
    coordinator.start()?;

    if coordinator.config().network.enabled {
        match coordinator.serve_gateway().await {
            Ok(addrs) => {
                println!("  control  {}", format!("ws://{}", addrs.control).bold());
                println!("  command  {}", format!("ws://{}", addrs.command).bold());
                println!("  data     {}", format!("ws://{}", addrs.data).bold());
            }
            Err(e) => {
                coordinator.shutdown().await;
                return Err(e);
            }
        }
    } else {
        println!("  {}", "Network gateway disabled.".dimmed());
    }
    println!(
        "\n  Mode {}. Press {} to stop.\n",
        coordinator.modes().current().to_string().bold(),
        "Ctrl-C".bold().cyan()
    );

    stop.notified().await;

    let order = coordinator.shutdown().await;
    info!(fragments = ?order, "shutdown complete");
    println!("{}", "  ✓ Safety defaults broadcast.".green());
    println!("{}", "  ✓ Exiting ionctl.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> KernelConfig {
    let path = config::config_path();
    let mut cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let cfg = KernelConfig::default();
            match config::save_to(&cfg, &path) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red().bold(), e);
            error!(path = %path.display(), error = %e, "refusing to start with an invalid config");
            std::process::exit(2);
        }
    };
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║                ionctl                ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  {} {}", "ionctl".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Ion-trap coordination kernel");
    println!();
}

use bootstrap_core::config::{Config, HandoffMode, LoggingConfig};
use bootstrap_core::{exit_code, run_bootstrap, CancelToken, Cancellation, LogFormat, Orchestrator, ServerHandoff};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod handoff;
mod health;

use handoff::{server_argv, ExecHandoff, NoHandoff, SuperviseHandoff};
use health::{app_probe_addr, health_router, HealthState};

#[derive(Parser, Debug)]
#[command(name = "hospital-bootstrap")]
#[command(about = "Wait for the database, provision the hospital service, then start its server")]
#[command(version)]
struct Args {
    /// TOML configuration file (overrides BOOTSTRAP_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Provision only; exit 0 at READY instead of starting the server
    #[arg(long)]
    no_handoff: bool,

    /// Print the resolved step plan and exit
    #[arg(long)]
    print_plan: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = run(args).await;
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    let loaded = match &args.config {
        Some(path) => Config::load_from(Some(path.as_path()), |key| std::env::var(key).ok()),
        None => Config::load(),
    };

    let logging = loaded.as_ref().map(|c| c.logging.clone()).unwrap_or_default();
    init_tracing(&logging);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            return e.exit_code();
        }
    };
    info!("✅ Configuration loaded, database {}", config.database_display());

    let orchestrator = match Orchestrator::from_config(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("❌ {}", e);
            return e.exit_code();
        }
    };

    if args.print_plan {
        print_plan(&orchestrator);
        return exit_code::READY;
    }

    let cancellation = Cancellation::new();
    let cancel = cancellation.token();
    tokio::spawn(handle_signals(cancellation));

    if serves_liveness(&config, args.no_handoff) {
        spawn_health_server(&config, &orchestrator, !args.no_handoff, cancel.clone()).await;
    } else if config.health.port == 0 {
        info!("Liveness endpoint disabled");
    } else {
        info!("Liveness endpoint not started in exec mode, probe the application's own health path");
    }

    let handoff: Box<dyn ServerHandoff> = if args.no_handoff {
        Box::new(NoHandoff)
    } else {
        let argv = server_argv(&config.server);
        match config.server.handoff {
            HandoffMode::Exec => Box::new(ExecHandoff::new(argv)),
            HandoffMode::Supervise => Box::new(SuperviseHandoff::new(argv)),
        }
    };

    run_bootstrap(&orchestrator, handoff.as_ref(), &cancel).await
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn handle_signals(cancellation: Cancellation) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!("⚠️  failed to register signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️  failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C");
    }

    cancellation.cancel();
}

/// The liveness listener runs only when this process outlives READY. In exec
/// mode the application's own health path is authoritative.
fn serves_liveness(config: &Config, no_handoff: bool) -> bool {
    config.health.port != 0 && (no_handoff || config.server.handoff == HandoffMode::Supervise)
}

/// Start the liveness listener in the background. A bind failure is logged
/// and the bootstrap continues without the endpoint.
async fn spawn_health_server(config: &Config, orchestrator: &Orchestrator, check_app: bool, cancel: CancelToken) {
    let state = HealthState {
        phase: orchestrator.phase().watch(),
        app_addr: check_app.then(|| app_probe_addr(&config.server.bind_host, config.server.port)),
    };
    let router = health_router(state, &config.health.path);

    let addr = format!("0.0.0.0:{}", config.health.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("⚠️  liveness endpoint could not bind {}: {}", addr, e);
            return;
        }
    };

    tokio::spawn(async move {
        if let Err(e) = health::serve(listener, router, cancel).await {
            error!("❌ liveness endpoint stopped: {:#}", e);
        }
    });
}

fn print_plan(orchestrator: &Orchestrator) {
    println!("📋 Provisioning plan:");
    for (index, step) in orchestrator.steps().iter().enumerate() {
        let state = if step.enabled { "" } else { " (disabled)" };
        println!("  {}. {} [{}]{}", index + 1, step.name, step.policy, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_listener_not_started_for_exec_handoff() {
        let config = Config::default();
        assert_eq!(config.server.handoff, HandoffMode::Exec);
        assert!(!serves_liveness(&config, false));
    }

    #[test]
    fn test_liveness_listener_runs_when_process_outlives_ready() {
        let mut config = Config::default();
        assert!(serves_liveness(&config, true));

        config.server.handoff = HandoffMode::Supervise;
        assert!(serves_liveness(&config, false));

        config.health.port = 0;
        assert!(!serves_liveness(&config, false));
        assert!(!serves_liveness(&config, true));
    }
}

//! termgate binary: parse flags, bind the gateway, serve until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use termgate::provider::russh::RusshProvider;
use termgate::{Gateway, GatewayConfig};

#[derive(Parser)]
#[command(name = "termgate", about = "WebSocket to SSH session gateway")]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8022")]
    listen: String,

    /// Seconds allowed for connecting and authenticating a session.
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,

    /// Seconds a client gets to answer a single auth challenge.
    #[arg(long, default_value_t = 60)]
    challenge_timeout: u64,

    /// Seconds allowed for winding down a session's transport.
    #[arg(long, default_value_t = 5)]
    teardown_timeout: u64,

    /// Maximum concurrent sessions across all connections.
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termgate=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig {
        listen: args.listen,
        connect_timeout_secs: args.connect_timeout,
        challenge_timeout_secs: args.challenge_timeout,
        teardown_timeout_secs: args.teardown_timeout,
        max_sessions: args.max_sessions,
    };

    let provider = Arc::new(RusshProvider::new());
    let gateway = match Gateway::bind(&config, provider).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let registry = gateway.registry();
    tokio::select! {
        _ = gateway.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            registry.shutdown_all();
            // Live sessions get their bounded wind-down before the runtime
            // exits under them.
            if !registry
                .drain(Duration::from_secs(config.teardown_timeout_secs))
                .await
            {
                tracing::warn!(
                    "{} session(s) still winding down at exit",
                    registry.active_sessions()
                );
            }
        }
    }
}

mod backoff;
mod config;
mod history;
mod llm;
mod pipeline;
mod policy;
mod rate_limit;
mod sandbox;
mod security;
mod translator;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::history::JsonlHistory;
use crate::pipeline::Router;
use crate::policy::PolicyStore;
use crate::rate_limit::RateLimiter;
use crate::sandbox::SandboxExecutor;
use crate::translator::{CommandTranslator, Translator};

/// How often idle rate-limit entries are swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

fn print_help() {
    println!(
        "\
cmdgate v{}

Accepts literal or natural-language commands over TCP, validates them
against a security policy and runs the approved ones in a sandbox.

USAGE:
    cmdgate [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/cmdgate.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, cmdgate=debug,warn)
    ANTHROPIC_API_KEY     API key for Anthropic Claude models
                          (when [ai] provider = \"anthropic\")

EXAMPLES:
    cmdgate                              # uses config/cmdgate.toml
    cmdgate /etc/cmdgate/cmdgate.toml    # custom config path
    RUST_LOG=debug cmdgate               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("cmdgate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => config_path = Some(arg),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cmdgate=info")),
        )
        .init();

    let config_path = config_path.unwrap_or_else(|| "config/cmdgate.toml".to_string());
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let policy = Arc::new(PolicyStore::from_config(&config.policy)?);
    info!("Denylist: {} rules", policy.rules().len());
    info!(
        "Limits: {}ms timeout, {} output bytes, {} chars, confidence >= {}",
        policy.command_timeout.as_millis(),
        policy.max_output_bytes,
        policy.max_command_length,
        policy.confidence_threshold
    );
    info!(
        "Rate limit: {} requests per {}s",
        config.rate_limit.max_requests, config.rate_limit.window_secs
    );

    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let executor = Arc::new(SandboxExecutor::new(&policy));
    info!("Sandbox root: {}", executor.root().display());
    let history = Arc::new(
        JsonlHistory::open(&config.history.path).with_context(|| {
            format!("Cannot open history file {}", config.history.path.display())
        })?,
    );
    info!("History: {}", history.path().display());

    let mut router = Router::new(
        Arc::clone(&policy),
        Arc::clone(&limiter),
        executor,
        history.clone(),
    );

    match &config.ai {
        Some(ai) => {
            let translator = CommandTranslator::new(llm::from_config(ai)?);
            info!("AI translator: {}", translator.description());
            router = router.with_translator(
                Arc::new(translator),
                Duration::from_millis(ai.timeout_ms),
            );
        }
        None => warn!("No [ai] section, natural-language requests will be refused"),
    }

    let idle_after = Duration::from_secs(config.rate_limit.idle_eviction_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            interval.tick().await;
            limiter.evict_idle(idle_after);
            debug!("Rate limiter tracking {} clients", limiter.tracked_clients());
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot listen on {addr}"))?;
    info!("Listening on {}", listener.local_addr()?);

    let result = tokio::select! {
        result = transport::serve(listener, Arc::new(router)) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    };

    history.flush().await;
    if let Err(ref e) = result {
        error!("Server stopped: {e}");
    }
    result
}

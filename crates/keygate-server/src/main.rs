use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use keygate_auth::{
    AuthResult, AuthenticationOutcome, IdentityProvider, RequestHeaders, SecretClaims,
};
use keygate_server::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use keygate_server::{Engine, apply_logging_level, init_tracing};
use time::OffsetDateTime;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From KEYGATE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (keygate.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (KEYGATE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// What the process should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Keep the signing-key pool populated until interrupted.
    Run,
    /// Print the trusted JWKS and exit.
    PrintJwks,
    /// Print the effective configuration and exit.
    PrintConfig,
}

/// The standalone process only maintains the shared key pool; gateways
/// embedding the engine supply their own provider. Refreshes are refused.
struct RefreshDisabled;

#[async_trait]
impl IdentityProvider for RefreshDisabled {
    async fn refresh(
        &self,
        _secret_claims: &SecretClaims,
        _issued_on: OffsetDateTime,
        _headers: &RequestHeaders,
    ) -> AuthResult<AuthenticationOutcome> {
        Ok(AuthenticationOutcome::Denied)
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, source) = resolve_config_path(&args);
    let mode = resolve_mode(&args);

    let cfg = match load_config(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path.as_deref().unwrap_or(DEFAULT_CONFIG_FILE),
        source = %source,
        "Configuration loaded"
    );
    apply_logging_level(&cfg.logging.level);

    if mode == Mode::PrintConfig {
        match cfg.to_toml() {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        }
        return;
    }

    let engine = match Engine::start(&cfg, Arc::new(RefreshDisabled)).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Engine initialization failed: {e:#}");
            std::process::exit(2);
        }
    };

    if mode == Mode::PrintJwks {
        let code = print_jwks(&engine).await;
        engine.shutdown().await;
        std::process::exit(code);
    }

    tracing::info!(
        namespace = %cfg.tokens.namespace,
        backend = ?cfg.store.backend,
        "keygate running; press Ctrl+C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
    engine.shutdown().await;
}

async fn print_jwks(engine: &Engine) -> i32 {
    let service = engine.service();
    // An empty pool would otherwise print no keys.
    if let Err(e) = service.key_manager().populate_once().await {
        eprintln!("Failed to populate signing keys: {e}");
        return 1;
    }
    match service.jwks().await {
        Ok(jwks) => match serde_json::to_string_pretty(&jwks) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                eprintln!("Failed to render JWKS: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("Failed to load JWKS: {e}");
            1
        }
    }
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: KEYGATE_CONFIG
/// 3. Default: keygate.toml (optional)
fn resolve_config_path(args: &[String]) -> (Option<String>, ConfigSource) {
    // 1. Check CLI: --config <path>
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            if let Some(path) = iter.next() {
                return (Some(path.clone()), ConfigSource::CliArgument);
            }
        }
    }

    // 2. Check environment variable
    if let Ok(path) = env::var("KEYGATE_CONFIG") {
        if !path.is_empty() {
            return (Some(path), ConfigSource::EnvironmentVariable);
        }
    }

    // 3. Default
    (None, ConfigSource::Default)
}

fn resolve_mode(args: &[String]) -> Mode {
    if args.iter().any(|a| a == "--print-jwks") {
        Mode::PrintJwks
    } else if args.iter().any(|a| a == "--print-config") {
        Mode::PrintConfig
    } else {
        Mode::Run
    }
}

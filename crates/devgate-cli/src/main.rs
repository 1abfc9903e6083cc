//! devgate - log in to an embedded device and drive its control surface.
//!
//! Commands:
//!   devgate status              check the stored session with the device
//!   devgate login [username]    log in (password is prompted)
//!   devgate logout              end the session
//!   devgate mode                show the current operating mode
//!   devgate mode set <mode>     change the operating mode
//!   devgate health              query the public status endpoint

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use devgate_core::api::{retry_transient, RetryPolicy};
use devgate_core::auth::AuthPhase;
use devgate_core::{ApiError, AuthOrchestrator, Config, DeviceClient, LoginCredentials, RequestGateway};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable naming a directory for the debug log file
const LOG_DIR_VAR: &str = "DEVGATE_LOG_DIR";

/// Log file name prefix inside `DEVGATE_LOG_DIR`
const LOG_FILE_PREFIX: &str = "devgate.log";

const USAGE: &str = "usage: devgate <status|login [username]|logout|mode [set <mode>]|health>";

enum Command {
    Status,
    Login(Option<String>),
    Logout,
    ShowMode,
    SetMode(String),
    Health,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            [] | ["status"] => Some(Command::Status),
            ["login"] => Some(Command::Login(None)),
            ["login", user] => Some(Command::Login(Some(user.to_string()))),
            ["logout"] => Some(Command::Logout),
            ["mode"] => Some(Command::ShowMode),
            ["mode", "set", mode] => Some(Command::SetMode(mode.to_string())),
            ["health"] => Some(Command::Health),
            _ => None,
        }
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets `RUST_LOG` (default `warn`). With `DEVGATE_LOG_DIR` set, a daily
/// log file at debug level captures transport and parse detail as well.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(filter);

    match std::env::var(LOG_DIR_VAR) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("devgate_core=debug,devgate=debug"));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    match run(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!(error = ?e, "Command failed");
            match e.downcast_ref::<ApiError>() {
                Some(ApiError::AuthRequired) => {
                    eprintln!("Not logged in. Run `devgate login` first.");
                }
                Some(api) if api.is_auth_failure() => {
                    eprintln!("Session expired. Please log in again with `devgate login`.");
                }
                Some(api) => eprintln!("Error: {}", api.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<()> {
    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env()?;
    info!(base_url = %config.base_url, storage = ?config.storage, "devgate starting");

    let store = Arc::new(config.token_store()?);
    let gateway = RequestGateway::new(config.clone(), store)?;
    let orchestrator = AuthOrchestrator::new(gateway);
    let device = DeviceClient::new(orchestrator.gateway().clone());

    // Health needs no session, so skip the startup check.
    if !matches!(command, Command::Health) {
        orchestrator.initialize().await;
    }

    match command {
        Command::Health => {
            let status = retry_transient(RetryPolicy::default(), || device.fetch_status()).await?;
            println!("status:  {}", status.status.as_deref().unwrap_or("unknown"));
            if let Some(version) = status.version {
                println!("version: {}", version);
            }
            if let Some(uptime) = status.uptime {
                println!("uptime:  {}s", uptime);
            }
        }
        Command::Status => print_status(&orchestrator),
        Command::Login(username) => login(&orchestrator, &config, username).await?,
        Command::Logout => {
            orchestrator.request_logout().await;
            println!("Logged out.");
        }
        Command::ShowMode => {
            require_session(&orchestrator)?;
            let cancel = CancellationToken::new();
            let mode = tokio::select! {
                result = device.fetch_mode(Some(cancel.clone())) => result?,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    return Err(ApiError::Cancelled.into());
                }
            };
            println!("mode: {}", mode.mode);
        }
        Command::SetMode(mode) => {
            require_session(&orchestrator)?;
            let status = device.set_mode(&mode).await?;
            println!("mode: {}", status.mode);
        }
    }

    Ok(())
}

fn print_status(orchestrator: &AuthOrchestrator) {
    let state = orchestrator.state();
    match state.phase() {
        AuthPhase::Authenticated => {
            let user = state.user.map(|u| u.username).unwrap_or_default();
            if user.is_empty() {
                println!("Logged in.");
            } else {
                println!("Logged in as {}.", user);
            }
        }
        AuthPhase::Unauthenticated => println!("Not logged in. Run `devgate login`."),
        AuthPhase::Initializing => println!("Checking session..."),
    }
}

fn require_session(orchestrator: &AuthOrchestrator) -> Result<()> {
    if orchestrator.state().authenticated {
        Ok(())
    } else {
        Err(ApiError::AuthRequired.into())
    }
}

async fn login(
    orchestrator: &AuthOrchestrator,
    config: &Config,
    username: Option<String>,
) -> Result<()> {
    if orchestrator.state().authenticated {
        print_status(orchestrator);
        return Ok(());
    }

    let username = match username.or_else(|| config.last_username.clone()) {
        Some(user) => user,
        None => prompt_username()?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))?;

    let result = orchestrator
        .submit_login(LoginCredentials::new(username.clone(), password))
        .await;

    if let Err(e) = result {
        let message = orchestrator
            .state()
            .last_error
            .unwrap_or_else(|| e.login_message());
        orchestrator.acknowledge_error();
        anyhow::bail!(message);
    }

    // Reload so environment overrides are not written back to disk.
    let saved = Config::load().and_then(|mut on_disk| {
        on_disk.last_username = Some(username);
        on_disk.save()
    });
    if let Err(e) = saved {
        warn!(error = %e, "Failed to save config");
    }

    print_status(orchestrator);
    Ok(())
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

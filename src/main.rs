mod config_proxy;
mod control;
mod launcher;
mod prompt;
mod settings;
mod xmpp_proxy;

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use config_proxy::{ConfigProxy, ConfigProxyError};
use control::{ConsoleAction, ControlHandle, ProxyState, CONSOLE_HELP};
use launcher::watch::{self, ProcessProbe, SystemProbe, Watched, EXIT_GRACE, PID_POLL_INTERVAL};
use launcher::{LaunchError, LaunchGame, LaunchOptions};
use prompt::{Prompt, TerminalPrompt};
use settings::{Settings, SettingsError};
use xmpp_proxy::engine::PresenceMemory;
use xmpp_proxy::{SetupError, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "veil", version, about)]
struct Cli {
    /// Game to launch through the proxy.
    #[arg(long, value_enum, default_value_t = LaunchGame::Auto)]
    game: LaunchGame,

    #[arg(long, default_value = "live")]
    patchline: String,

    /// Extra arguments for the client, space separated.
    #[arg(long, allow_hyphen_values = true)]
    client_params: Option<String>,

    /// Arguments passed through to the game, space separated.
    #[arg(long, allow_hyphen_values = true)]
    game_params: Option<String>,

    /// Client executable, instead of looking it up.
    #[arg(long)]
    client_path: Option<PathBuf>,

    /// Verbose logging to stderr; `--verbose=xmpp` also traces chat traffic.
    #[arg(
        short,
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "default",
        value_name = "LEVEL"
    )]
    verbose: Option<String>,

    /// Override log file location (its directory is used).
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Disable TLS certificate verification towards the chat server (INSECURE!)
    #[arg(long)]
    dangerous_insecure_tls: bool,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    ConfigProxy(#[from] ConfigProxyError),
}

fn print_startup_diagnostics() {
    eprintln!("Veil v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("---");
}

fn init_tracing(cli: &Cli) {
    // Determine the log directory: --log-file=<path> overrides the default platform path
    let log_dir = if let Some(ref path) = cli.log_file {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("veil")
            .join("logs")
    };

    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("veil=info,info")
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "veil.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    // Stderr layer: only when --verbose or --log-file is passed
    let stderr_layer = if cli.verbose.is_some() || cli.log_file.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if cli.verbose.as_deref() == Some("xmpp") {
            EnvFilter::new("veil=info,veil::xmpp_proxy=debug,info")
        } else {
            EnvFilter::new("veil=info,info")
        };

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must outlive every log call; leak the guard until exit.
    std::mem::forget(_guard);

    eprintln!("Log file: {}", log_dir.display());
}

fn main() {
    let cli = Cli::parse();

    // Set insecure TLS flag before any proxy can start
    xmpp_proxy::set_dangerous_insecure_tls(cli.dangerous_insecure_tls);
    if cli.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    init_tracing(&cli);
    if cli.verbose.is_some() || cli.log_file.is_some() {
        print_startup_diagnostics();
    }
    info!(version = env!("CARGO_PKG_VERSION"), build = env!("GIT_HASH"), "Veil starting");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start the async runtime");
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let prompt = Arc::new(TerminalPrompt::new());
    runtime.block_on(async {
        if let Err(e) = run(cli, prompt.clone()).await {
            error!(error = %e, "Veil stopped");
            prompt.alert(&e.to_string()).await;
        }
    });

    // The stdin reader sits in a blocking read that never returns on its own.
    runtime.shutdown_background();
    info!("Veil exited");
}

async fn run(cli: Cli, prompt: Arc<TerminalPrompt>) -> Result<(), AppError> {
    let settings = Settings::from_platform()?;
    info!(dir = %settings.dir().display(), "Settings loaded");
    let mut console = route_stdin(prompt.clone());

    let client = launcher::find_client(cli.client_path.as_deref())?;

    let Some(game) = resolve_game(cli.game, &settings, prompt.as_ref()).await else {
        info!("No game chosen, nothing to launch");
        return Ok(());
    };

    let options = LaunchOptions {
        product: game.product(),
        patchline: cli.patchline,
        client_params: cli.client_params,
        game_params: cli.game_params,
    };

    let probe: Arc<dyn ProcessProbe> = Arc::new(SystemProbe);
    if !options.allows_multiple_clients() && watch::client_running(&probe).await {
        return Err(LaunchError::AlreadyRunning.into());
    }

    let memory = Arc::new(PresenceMemory::default());
    let initial = ProxyState::new(settings.load_status());
    let (control, _controller) = control::spawn_controller(initial, memory.clone());

    let supervisor =
        Supervisor::bind(memory, control.clone(), settings.clone(), prompt.clone()).await?;
    let config_proxy = ConfigProxy::start(supervisor.port()?).await?;

    let args = launcher::launch_args(config_proxy.port(), &options);
    let child = launcher::launch(&client, &args)?;
    info!(game = game.as_str(), patchline = %options.patchline, "Client launched");

    let watcher = watch::watch_client(Watched::Child(child), probe, EXIT_GRACE, PID_POLL_INTERVAL);
    let proxy = supervisor.run(config_proxy.chat_server());
    tokio::pin!(watcher, proxy);

    eprintln!("{}", control::describe(control.state()));
    eprintln!("{}", CONSOLE_HELP);

    let outcome = loop {
        tokio::select! {
            result = &mut proxy => break result.map_err(AppError::from),
            _ = &mut watcher => {
                info!("Client closed, shutting down");
                break Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
            Some(line) = console.recv() => {
                if handle_console(&line, &control, &settings).await.is_break() {
                    info!("Quit requested");
                    break Ok(());
                }
            }
        }
    };

    if let Err(e) = settings.save_status(control.state().visibility) {
        warn!(error = %e, "Failed to save status");
    }
    outcome
}

/// `Auto` falls back to the stored default. When that says to ask, the answer
/// becomes the new default.
async fn resolve_game<P: Prompt>(
    requested: LaunchGame,
    settings: &Settings,
    prompt: &P,
) -> Option<LaunchGame> {
    let game = match requested {
        LaunchGame::Auto => settings.load_launch_game(),
        other => other,
    };
    if game.is_concrete() {
        return Some(game);
    }

    let picked = prompt.choose_game().await?;
    if requested == LaunchGame::Auto {
        if let Err(e) = settings.save_launch_game(picked) {
            warn!(error = %e, "Failed to save default launch game");
        }
    }
    Some(picked)
}

/// Lines nobody is asking a question for come back as console commands.
fn route_stdin(prompt: Arc<TerminalPrompt>) -> mpsc::Receiver<String> {
    let mut lines = prompt::spawn_stdin_lines();
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Some(line) = prompt.offer(line) {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        }
        prompt.close();
    });
    rx
}

async fn handle_console(line: &str, control: &ControlHandle, settings: &Settings) -> ControlFlow<()> {
    if line.trim().is_empty() {
        return ControlFlow::Continue(());
    }
    match control::parse_console(line) {
        Some(ConsoleAction::Appear(visibility)) => {
            control.set_visibility(visibility).await;
            if let Err(e) = settings.save_status(visibility) {
                warn!(error = %e, "Failed to save status");
            }
        }
        Some(ConsoleAction::Enable(enabled)) => control.set_enabled(enabled).await,
        Some(ConsoleAction::MucRouting(allow)) => control.set_muc_routing(allow).await,
        Some(ConsoleAction::Status) => {}
        Some(ConsoleAction::Help) => {
            eprintln!("{}", CONSOLE_HELP);
            return ControlFlow::Continue(());
        }
        Some(ConsoleAction::Quit) => return ControlFlow::Break(()),
        None => {
            eprintln!("Unknown command. {}", CONSOLE_HELP);
            return ControlFlow::Continue(());
        }
    }
    eprintln!("{}", control::describe(control.state()));
    ControlFlow::Continue(())
}

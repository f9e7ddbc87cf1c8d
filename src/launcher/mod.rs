//! Finding and starting the game client.

pub mod watch;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Lets several clients run side by side; skips the already-running check.
const ALLOW_MULTIPLE_CLIENTS: &str = "allow-multiple-clients";

const INSTALLS_FILE: &str = "RiotClientInstalls.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LaunchGame {
    /// Use the stored default, or ask.
    Auto,
    /// Ask every time.
    Prompt,
    #[value(name = "league", alias = "lol")]
    LeagueOfLegends,
    #[value(alias = "lor")]
    Runeterra,
    Valorant,
    /// Only the launcher, no game.
    RiotClient,
}

impl LaunchGame {
    /// What the operator can pick from.
    pub const CHOICES: [LaunchGame; 4] = [
        LaunchGame::LeagueOfLegends,
        LaunchGame::Runeterra,
        LaunchGame::Valorant,
        LaunchGame::RiotClient,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LaunchGame::Auto => "auto",
            LaunchGame::Prompt => "prompt",
            LaunchGame::LeagueOfLegends => "league",
            LaunchGame::Runeterra => "runeterra",
            LaunchGame::Valorant => "valorant",
            LaunchGame::RiotClient => "riot-client",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        let value = value.trim();
        [
            LaunchGame::Auto,
            LaunchGame::Prompt,
            LaunchGame::LeagueOfLegends,
            LaunchGame::Runeterra,
            LaunchGame::Valorant,
            LaunchGame::RiotClient,
        ]
        .into_iter()
        .find(|game| game.as_str() == value)
    }

    pub fn title(self) -> &'static str {
        match self {
            LaunchGame::Auto => "Default",
            LaunchGame::Prompt => "Ask",
            LaunchGame::LeagueOfLegends => "League of Legends",
            LaunchGame::Runeterra => "Legends of Runeterra",
            LaunchGame::Valorant => "VALORANT",
            LaunchGame::RiotClient => "Riot Client",
        }
    }

    /// `--launch-product` value. `None` starts the bare client.
    pub fn product(self) -> Option<&'static str> {
        match self {
            LaunchGame::LeagueOfLegends => Some("league_of_legends"),
            LaunchGame::Runeterra => Some("bacon"),
            LaunchGame::Valorant => Some("valorant"),
            LaunchGame::Auto | LaunchGame::Prompt | LaunchGame::RiotClient => None,
        }
    }

    /// Whether this names a concrete thing to launch.
    pub fn is_concrete(self) -> bool {
        !matches!(self, LaunchGame::Auto | LaunchGame::Prompt)
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(
        "Could not find the Riot Client. Launching any Riot game once usually fixes this; \
         otherwise pass its location with --client-path."
    )]
    ClientNotFound,
    #[error(
        "The Riot Client is already running. Close it (and any game it started) first so it \
         can be relaunched through the proxy."
    )]
    AlreadyRunning,
    #[error("failed to start {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Everything needed to build the client's command line.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub product: Option<&'static str>,
    pub patchline: String,
    pub client_params: Option<String>,
    pub game_params: Option<String>,
}

impl LaunchOptions {
    pub fn allows_multiple_clients(&self) -> bool {
        self.client_params
            .as_deref()
            .is_some_and(|p| p.contains(ALLOW_MULTIPLE_CLIENTS))
    }
}

/// Client arguments: config URL, product and patchline, raw client
/// parameters, then `--` and the game parameters.
pub fn launch_args(config_port: u16, opts: &LaunchOptions) -> Vec<String> {
    let mut args = vec![format!("--client-config-url=http://127.0.0.1:{}", config_port)];
    if let Some(product) = opts.product {
        args.push(format!("--launch-product={}", product));
        args.push(format!("--launch-patchline={}", opts.patchline));
    }
    if let Some(params) = &opts.client_params {
        args.extend(params.split_whitespace().map(str::to_string));
    }
    if let Some(params) = &opts.game_params {
        args.push("--".to_string());
        args.extend(params.split_whitespace().map(str::to_string));
    }
    args
}

#[derive(Debug, Deserialize)]
struct ClientInstalls {
    rc_default: Option<String>,
    rc_live: Option<String>,
    rc_beta: Option<String>,
}

/// Client executable from the installs manifest, first existing entry wins.
fn client_from_installs(manifest: &str, exists: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let installs: ClientInstalls = match serde_json::from_str(manifest) {
        Ok(installs) => installs,
        Err(e) => {
            debug!(error = %e, "Installs manifest is not valid JSON");
            return None;
        }
    };
    [installs.rc_default, installs.rc_live, installs.rc_beta]
        .into_iter()
        .flatten()
        .map(PathBuf::from)
        .find(|path| exists(path.as_path()))
}

fn installs_manifest_path() -> PathBuf {
    let program_data =
        std::env::var_os("PROGRAMDATA").unwrap_or_else(|| r"C:\ProgramData".into());
    PathBuf::from(program_data).join("Riot Games").join(INSTALLS_FILE)
}

/// Locates the client executable. An explicit path wins over discovery.
pub fn find_client(override_path: Option<&Path>) -> Result<PathBuf, LaunchError> {
    if let Some(path) = override_path {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(LaunchError::ClientNotFound)
        };
    }
    let manifest_path = installs_manifest_path();
    let manifest = std::fs::read_to_string(&manifest_path).map_err(|e| {
        debug!(path = %manifest_path.display(), error = %e, "No installs manifest");
        LaunchError::ClientNotFound
    })?;
    client_from_installs(&manifest, Path::is_file).ok_or(LaunchError::ClientNotFound)
}

pub fn launch(client: &Path, args: &[String]) -> Result<Child, LaunchError> {
    info!(client = %client.display(), args = ?args, "Starting client");
    Command::new(client)
        .args(args)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            path: client.to_path_buf(),
            source,
        })
}

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::control::Visibility;
use crate::launcher::LaunchGame;

const APP_DIR: &str = "veil";
const STATUS_FILE: &str = "status";
const LAUNCH_GAME_FILE: &str = "launch_game";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no local data directory on this platform")]
    NoDataDir,
    #[error("failed to create {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Single-line settings files under one directory.
#[derive(Debug, Clone)]
pub struct Settings {
    dir: PathBuf,
}

impl Settings {
    /// `<data_local_dir>/veil`
    pub fn from_platform() -> Result<Self, SettingsError> {
        let base = dirs::data_local_dir().ok_or(SettingsError::NoDataDir)?;
        Self::at(base.join(APP_DIR))
    }

    pub fn at(dir: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SettingsError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Missing or unreadable state appears offline.
    pub fn load_status(&self) -> Visibility {
        match self.read(STATUS_FILE) {
            Some(value) => Visibility::from_stored(&value),
            None => Visibility::default(),
        }
    }

    pub fn save_status(&self, visibility: Visibility) -> Result<(), SettingsError> {
        debug!(visibility = %visibility, "Saving status");
        self.write(STATUS_FILE, visibility.as_str())
    }

    /// Defaults to asking when nothing usable is stored.
    pub fn load_launch_game(&self) -> LaunchGame {
        self.read(LAUNCH_GAME_FILE)
            .and_then(|value| LaunchGame::from_stored(&value))
            .unwrap_or(LaunchGame::Prompt)
    }

    pub fn save_launch_game(&self, game: LaunchGame) -> Result<(), SettingsError> {
        debug!(game = game.as_str(), "Saving default launch game");
        self.write(LAUNCH_GAME_FILE, game.as_str())
    }

    fn read(&self, name: &str) -> Option<String> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read settings file");
                None
            }
        }
    }

    fn write(&self, name: &str, value: &str) -> Result<(), SettingsError> {
        let path = self.dir.join(name);
        fs::write(&path, value).map_err(|source| SettingsError::Write { path, source })
    }
}

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConfigError;

/// Name of the engine's private directory.
pub const STATE_DIR: &str = ".dotry";

/// Default name of the directory holding data artifacts.
pub const DATA_DIR: &str = "data";

/// Where an [`Engine`](crate::Engine) keeps artifacts and its run history.
///
/// Artifact names declared by tasks are resolved under `data_dir`; the
/// state file and the clock marker live under `state_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(crate) data_dir: Utf8PathBuf,
    pub(crate) state_dir: Utf8PathBuf,
}

impl Config {
    /// Relative `data` and `.dotry` directories, resolved against the
    /// current working directory.
    pub fn new() -> Self {
        Self {
            data_dir: Utf8PathBuf::from(DATA_DIR),
            state_dir: Utf8PathBuf::from(STATE_DIR),
        }
    }

    /// Both directories placed under a common project root.
    pub fn rooted(root: impl AsRef<Utf8Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join(DATA_DIR),
            state_dir: root.join(STATE_DIR),
        }
    }

    /// Looks for a `.dotry` directory in `start` and its ancestors, and roots
    /// the configuration at the first directory that has one.
    pub fn discover(start: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let start = start.as_ref();

        for dir in start.ancestors() {
            if dir.join(STATE_DIR).is_dir() {
                tracing::debug!("found {} in {}", STATE_DIR, dir);
                return Ok(Self::rooted(dir));
            }
        }

        Err(ConfigError::NotFound(start.to_path_buf()))
    }

    /// Same as [`Config::discover`], starting from the current directory.
    pub fn discover_from_cwd() -> Result<Self, ConfigError> {
        let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
        Self::discover(cwd)
    }

    pub fn data_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    pub fn state_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    pub fn get_data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn get_state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

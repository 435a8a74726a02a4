use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DotryError {
    #[error("Error while registering a task:\n{0}")]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("Error while executing tasks:\n{0}")]
    Execute(#[from] ExecuteError),

    #[error("Error while persisting run history:\n{0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Couldn't create the data directory {0}:\n{1}")]
    DataDir(Utf8PathBuf, std::io::Error),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(
        "Artifact '{artifact}' is already provided by task '{producer}', \
         task '{offender}' can't provide it too"
    )]
    ProducerConflict {
        artifact: String,
        producer: String,
        offender: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Task '{0}' is not registered")]
    TaskNotFound(String),

    #[error("Artifact '{0}' is not registered")]
    ArtifactNotFound(String),

    #[error("Artifact '{0}' is not managed, no task provides it")]
    NotManaged(String),

    #[error("Couldn't find matching tasks for names: {}", .0.join(", "))]
    MissingTasks(Vec<String>),
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("Cycle detected in task graph at task '{0}'")]
    Cycle(String),

    #[error("Task '{0}' was restored from saved state but never registered, it has no body to run")]
    Inert(String),

    #[error("Task '{name}' ({position}/{total}):\n{source}")]
    Task {
        name: String,
        position: usize,
        total: usize,
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode the state file.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode the state file.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Unsupported state file version {0}")]
    Version(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find a .dotry directory in {0} or any of its parents")]
    NotFound(Utf8PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("Task '{task}' did not declare artifact '{artifact}'")]
    Undeclared { task: String, artifact: String },
}

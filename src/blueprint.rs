use crate::core::Fingerprint;
use crate::engine::Engine;
use crate::error::RegistrationError;
use crate::task::{Declaration, Registration, TaskContext};

/// A builder for registering a single task with an [`Engine`].
///
/// Obtained from [`Engine::task`]. Nothing is registered until
/// [`TaskDef::run`] supplies the body.
///
/// ```rust,no_run
/// # use dotry::{Config, Engine};
/// # fn main() -> Result<(), dotry::DotryError> {
/// let mut engine = Engine::open(Config::new())?;
///
/// engine
///     .task("count")
///     .describe("Count the lines of the input")
///     .requires(["input.txt"])
///     .provides(["count.txt"])
///     .run(|ctx| {
///         let text = std::fs::read_to_string(ctx.din("input.txt")?)?;
///         std::fs::write(ctx.dout("count.txt")?, text.lines().count().to_string())?;
///         Ok(())
///     })?;
/// # Ok(())
/// # }
/// ```
pub struct TaskDef<'a> {
    engine: &'a mut Engine,
    name: String,
    description: Option<String>,
    requires: Vec<String>,
    provides: Vec<String>,
    fingerprint: Option<Fingerprint>,
}

impl<'a> TaskDef<'a> {
    pub(crate) fn new(engine: &'a mut Engine, name: String) -> Self {
        Self {
            engine,
            name,
            description: None,
            requires: Vec::new(),
            provides: Vec::new(),
            fingerprint: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds artifacts read by the task.
    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds artifacts written by the task.
    pub fn provides<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(names.into_iter().map(Into::into));
        self
    }

    /// Identifies the implementation of the body, e.g. its source text or a
    /// version string. Without one the fingerprint is derived from the
    /// declaration, so edits to the body alone go unnoticed.
    pub fn fingerprint(mut self, implementation: impl AsRef<[u8]>) -> Self {
        self.fingerprint = Some(Fingerprint::hash(implementation));
        self
    }

    /// Registers the task with `body` as its implementation.
    pub fn run<F, R>(self, body: F) -> Result<Registration, RegistrationError>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let mut declaration = Declaration {
            name: self.name,
            description: self.description,
            fingerprint: Fingerprint::default(),
            requires: self.requires,
            provides: self.provides,
        };

        declaration.fingerprint = match self.fingerprint {
            Some(fingerprint) => fingerprint,
            None => declaration.derived_fingerprint(),
        };

        self.engine.register(declaration, body)
    }
}

mod listing;
mod runner;

use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::artifact::{Artifact, ArtifactRegistry};
use crate::blueprint::TaskDef;
use crate::config::Config;
use crate::core::{ArcStr, Clock, NEVER};
use crate::error::{DotryError, ExecuteError, LookupError, RegistrationError, StateError};
use crate::graph::{DependencyGraph, GraphSnapshot, Subgraph};
use crate::state::StateStore;
use crate::task::{Body, Declaration, FnBody, Registration, Task, TaskContext, TaskRegistry};

pub use listing::{ArtifactEntry, TaskStatus};
pub use runner::{Diagnostics, Execution, TaskExecution};

/// One instance of the task runner.
///
/// The engine owns every registry: artifacts, tasks and the dependency graph
/// between them. It is created empty, or rehydrated from the state file by
/// [`Engine::open`], and is persisted again by [`Engine::close`]. An engine
/// dropped without being closed, for example after a failed execution,
/// still saves its run history and logs a warning if that fails.
///
/// Registration is expected to finish before execution starts; executing only
/// ever reads the registries, apart from stamping call times.
pub struct Engine {
    config: Config,
    artifacts: ArtifactRegistry,
    tasks: TaskRegistry,
    graph: DependencyGraph,
    store: StateStore,
    clock: Clock,
    closed: bool,
}

impl Engine {
    /// Creates the data directory if needed and loads the run history.
    ///
    /// Tasks found in the state file are restored without a body. They keep
    /// their call time and fingerprint, so a later registration with the same
    /// fingerprint picks up where the previous session left off.
    pub fn open(config: Config) -> Result<Self, DotryError> {
        fs::create_dir_all(&config.data_dir)
            .map_err(|e| DotryError::DataDir(config.data_dir.clone(), e))?;

        let store = StateStore::new(&config.state_dir);
        let mut tasks = TaskRegistry::default();
        let mut graph = DependencyGraph::default();

        for (_, record) in store.load() {
            let name: ArcStr = record.name.as_str().into();
            if tasks.restore(record) {
                graph.upsert_node(&name);
            }
        }

        tracing::debug!(
            "opened engine at {} with {} restored tasks",
            config.state_dir,
            tasks.iter().count()
        );

        Ok(Self {
            artifacts: ArtifactRegistry::new(config.data_dir.clone()),
            clock: Clock::new(&config.state_dir),
            config,
            tasks,
            graph,
            store,
            closed: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts building a task called `name`.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef::new(self, name.into())
    }

    /// Registers `declaration` with `body` as its implementation.
    ///
    /// Fails without touching any registry if one of the declared outputs
    /// already has another producer.
    pub fn register<F, R>(
        &mut self,
        declaration: Declaration,
        body: F,
    ) -> Result<Registration, RegistrationError>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.register_body(declaration, Arc::new(FnBody::<F, R>::new(body)))
    }

    fn register_body(
        &mut self,
        declaration: Declaration,
        body: Arc<dyn Body>,
    ) -> Result<Registration, RegistrationError> {
        let Declaration {
            name,
            description,
            fingerprint,
            requires,
            provides,
        } = declaration;

        let paths: Vec<(&str, Utf8PathBuf)> = provides
            .iter()
            .map(|artifact| (artifact.as_str(), self.artifacts.path_for(artifact)))
            .collect();
        self.tasks
            .check_producers(&name, paths.iter().map(|(a, p)| (*a, p.as_path())))?;

        let requires: Vec<Artifact> = requires.iter().map(|a| self.artifacts.resolve(a)).collect();
        let provides: Vec<Artifact> = provides.iter().map(|a| self.artifacts.resolve(a)).collect();

        let registration = self.tasks.upsert(
            &name,
            description,
            fingerprint,
            requires.clone(),
            provides.clone(),
            body,
        );

        let node: ArcStr = name.as_str().into();
        self.graph.upsert_node(&node);

        for artifact in &requires {
            if let Some(producer) = self.tasks.producer_name(artifact.path()) {
                self.graph.add_edge(producer, &node, &artifact.name().into());
            }
        }

        for artifact in &provides {
            for consumer in self.tasks.consumer_names(artifact.path()) {
                self.graph.add_edge(&node, consumer, &artifact.name().into());
            }
        }

        match registration {
            Registration::New => tracing::debug!("registered task {}", name),
            Registration::Redeclared => tracing::debug!("redeclared task {}", name),
            Registration::Overridden => {
                tracing::warn!("overriding task {}, its implementation changed", name)
            }
        }

        Ok(registration)
    }

    pub fn task_by_name(&self, name: &str) -> Result<&Task, LookupError> {
        self.tasks.get(name)
    }

    /// Looks up several tasks at once, reporting every unknown name together.
    pub fn tasks_by_name<I, S>(&self, names: I) -> Result<Vec<&Task>, LookupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut found = Vec::new();
        let mut missing = Vec::new();

        for name in names {
            match self.tasks.get(name.as_ref()) {
                Ok(task) => found.push(task),
                Err(_) => missing.push(name.as_ref().to_string()),
            }
        }

        if missing.is_empty() {
            Ok(found)
        } else {
            Err(LookupError::MissingTasks(missing))
        }
    }

    /// The tasks with an edge into `name`, i.e. the producers of its inputs.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<&Task>, LookupError> {
        if !self.graph.contains(name) {
            return Err(LookupError::TaskNotFound(name.to_string()));
        }

        self.graph
            .producers_of(name)
            .iter()
            .map(|producer| self.tasks.get(producer))
            .collect()
    }

    pub fn artifact(&self, name: &str) -> Result<&Artifact, LookupError> {
        self.artifacts.get(name)
    }

    /// The task that provides the artifact called `name`.
    pub fn producer_of(&self, name: &str) -> Result<&Task, LookupError> {
        let artifact = self.artifacts.get(name)?;
        self.tasks.producer_of(artifact)
    }

    /// The tasks that require the artifact called `name`.
    pub fn consumers_of(&self, name: &str) -> Result<Vec<&Task>, LookupError> {
        let artifact = self.artifacts.get(name)?;
        Ok(self.tasks.consumers_of(artifact))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    /// Where an artifact called `name` lives, registered or not.
    pub fn path(&self, name: &str) -> Utf8PathBuf {
        self.artifacts.path_for(name)
    }

    /// Every task with its run state, ordered by name.
    pub fn task_statuses(&self) -> Vec<TaskStatus> {
        self.tasks.iter().map(TaskStatus::from).collect()
    }

    /// Every artifact with its producer and consumers.
    pub fn artifact_entries(&self) -> Vec<ArtifactEntry> {
        self.artifacts
            .iter()
            .map(|artifact| ArtifactEntry {
                name: artifact.name().to_string(),
                path: artifact.path().to_path_buf(),
                exists: artifact.exists(),
                producer: self
                    .tasks
                    .producer_name(artifact.path())
                    .map(|name| name.to_string()),
                consumers: self
                    .tasks
                    .consumer_names(artifact.path())
                    .map(|name| name.to_string())
                    .collect(),
            })
            .collect()
    }

    /// Marks a task as never run, so the next execution request that covers
    /// it runs it again.
    pub fn invalidate(&mut self, name: &str) -> Result<(), LookupError> {
        self.tasks.get_mut(name)?.call_time = NEVER;
        tracing::debug!("invalidated task {}", name);
        Ok(())
    }

    pub fn graph(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// The ancestor closure of `targets` and its topological order. Fails
    /// before anything runs if a target is unknown or the closure has a
    /// cycle.
    fn plan<I, S>(&self, targets: I) -> Result<(Subgraph, Vec<ArcStr>), ExecuteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let subgraph = self.graph.ancestors_of(targets)?;
        let order = subgraph.topological_order()?;
        Ok((subgraph, order))
    }

    /// Runs every stale task needed for `targets`, one at a time, producers
    /// before consumers.
    ///
    /// Up to date tasks are skipped even when named as targets, use
    /// [`Engine::invalidate`] to force a run. The walk stops at the first
    /// failing task.
    pub fn execute<I, S>(&mut self, targets: I) -> Result<Execution, ExecuteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (_, order) = self.plan(targets)?;
        runner::run_sequential(&mut self.tasks, &self.clock, &order)
    }

    /// Same as [`Engine::execute`], except that independent tasks run
    /// concurrently on the rayon thread pool.
    #[cfg(feature = "parallel")]
    pub fn execute_parallel<I, S>(&mut self, targets: I) -> Result<Execution, ExecuteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (subgraph, order) = self.plan(targets)?;
        runner::run_parallel(&mut self.tasks, &self.clock, &subgraph, &order)
    }

    /// Executes the producers of the named artifacts.
    pub fn generate<I, S>(&mut self, artifacts: I) -> Result<Execution, ExecuteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut targets: Vec<String> = Vec::new();

        for name in artifacts {
            let producer = self.producer_of(name.as_ref())?.name().to_string();
            if !targets.contains(&producer) {
                targets.push(producer);
            }
        }

        self.execute(targets)
    }

    /// Writes the run history of every task to the state file.
    pub fn persist(&self) -> Result<(), StateError> {
        self.store.save(self.tasks.iter().map(Task::record))
    }

    /// Persists the run history and shuts the engine down.
    pub fn close(mut self) -> Result<(), StateError> {
        self.persist()?;
        self.closed = true;
        tracing::debug!("saved run history to {}", self.store.path());
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        match self.persist() {
            Ok(()) => tracing::debug!("saved run history to {}", self.store.path()),
            Err(e) => tracing::warn!("failed to save run history on drop: {}", e),
        }
    }
}

//! Tasks, their bodies and the registry that owns them.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::{Artifact, normalize};
use crate::core::{ArcStr, Dynamic, Fingerprint, NEVER};
use crate::error::{ContextError, LookupError, RegistrationError};
use crate::staleness::Staleness;
use crate::state::TaskRecord;

/// What a caller declares when registering a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub description: Option<String>,
    pub fingerprint: Fingerprint,
    /// Names of the artifacts the task reads.
    pub requires: Vec<String>,
    /// Names of the artifacts the task writes.
    pub provides: Vec<String>,
}

impl Declaration {
    /// A declaration whose fingerprint is derived from the declaration
    /// itself, so changing the description or the declared artifacts counts
    /// as a new implementation.
    pub fn new<R, P, S1, S2>(name: impl Into<String>, requires: R, provides: P) -> Self
    where
        R: IntoIterator<Item = S1>,
        P: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let mut declaration = Self {
            name: name.into(),
            description: None,
            fingerprint: Fingerprint::default(),
            requires: requires.into_iter().map(Into::into).collect(),
            provides: provides.into_iter().map(Into::into).collect(),
        };
        declaration.fingerprint = declaration.derived_fingerprint();
        declaration
    }

    pub(crate) fn derived_fingerprint(&self) -> Fingerprint {
        let description = self.description.as_deref().unwrap_or_default();
        let parts = [self.name.as_str(), "\0desc", description, "\0requires"]
            .into_iter()
            .chain(self.requires.iter().map(String::as_str))
            .chain(["\0provides"])
            .chain(self.provides.iter().map(String::as_str));

        Fingerprint::hash_parts(parts)
    }
}

/// Resolved paths of the artifacts a task declared, handed to its body.
pub struct TaskContext<'a> {
    pub(crate) task: &'a str,
    pub(crate) requires: &'a [Artifact],
    pub(crate) provides: &'a [Artifact],
}

impl<'a> TaskContext<'a> {
    pub fn name(&self) -> &str {
        self.task
    }

    /// Path of a declared input.
    pub fn din(&self, name: &str) -> Result<&'a Utf8Path, ContextError> {
        self.find(self.requires, name)
    }

    /// Path of a declared output.
    pub fn dout(&self, name: &str) -> Result<&'a Utf8Path, ContextError> {
        self.find(self.provides, name)
    }

    /// Path of any declared artifact, input or output.
    pub fn dany(&self, name: &str) -> Result<&'a Utf8Path, ContextError> {
        self.find(self.requires, name)
            .or_else(|_| self.find(self.provides, name))
    }

    pub fn inputs(&self) -> &'a [Artifact] {
        self.requires
    }

    pub fn outputs(&self) -> &'a [Artifact] {
        self.provides
    }

    /// Matches `name` against the declared artifacts by normalized name, so
    /// `./a.dat` finds an artifact first declared as `a.dat`.
    fn find(&self, list: &'a [Artifact], name: &str) -> Result<&'a Utf8Path, ContextError> {
        let wanted = normalize(Utf8Path::new(name));

        list.iter()
            .find(|artifact| {
                artifact.name() == name || normalize(Utf8Path::new(artifact.name())) == wanted
            })
            .map(Artifact::path)
            .ok_or_else(|| ContextError::Undeclared {
                task: self.task.to_string(),
                artifact: name.to_string(),
            })
    }
}

pub(crate) trait TypedBody: Send + Sync {
    /// The concrete value returned by this body.
    type Output: Send + Sync + 'static;

    fn call(&self, context: &TaskContext<'_>) -> anyhow::Result<Self::Output>;
}

pub(crate) trait Body: Send + Sync {
    fn call(&self, context: &TaskContext<'_>) -> anyhow::Result<Dynamic>;
}

// This is where the type erasure happens.
impl<T> Body for T
where
    T: TypedBody + 'static,
{
    fn call(&self, context: &TaskContext<'_>) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(T::call(self, context)?))
    }
}

pub(crate) struct FnBody<F, R> {
    callback: F,
    _phantom: PhantomData<fn() -> R>,
}

impl<F, R> FnBody<F, R> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback,
            _phantom: PhantomData,
        }
    }
}

impl<F, R> TypedBody for FnBody<F, R>
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<R> + Send + Sync,
    R: Send + Sync + 'static,
{
    type Output = R;

    fn call(&self, context: &TaskContext<'_>) -> anyhow::Result<R> {
        (self.callback)(context)
    }
}

/// One registered unit of work.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: ArcStr,
    pub(crate) description: Option<String>,
    pub(crate) requires: Vec<Artifact>,
    pub(crate) provides: Vec<Artifact>,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) creation_time: SystemTime,
    pub(crate) call_time: SystemTime,
    pub(crate) body: Option<Arc<dyn Body>>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn requires(&self) -> &[Artifact] {
        &self.requires
    }

    pub fn provides(&self) -> &[Artifact] {
        &self.provides
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    pub fn call_time(&self) -> SystemTime {
        self.call_time
    }

    /// Restored from the state file and not registered since, so there's
    /// nothing to invoke.
    pub fn is_inert(&self) -> bool {
        self.body.is_none()
    }

    pub fn staleness(&self) -> Staleness {
        Staleness::evaluate(&self.requires, &self.provides, self.call_time)
    }

    pub fn has_run(&self) -> bool {
        self.call_time > NEVER
    }

    pub fn outputs_up_to_date(&self) -> bool {
        self.staleness().outputs_up_to_date()
    }

    pub fn needs_run(&self) -> bool {
        self.staleness().needs_run()
    }

    pub(crate) fn reset_time(&mut self) {
        self.call_time = NEVER;
        self.creation_time = SystemTime::now();
    }

    pub(crate) fn context(&self) -> TaskContext<'_> {
        TaskContext {
            task: &self.name,
            requires: &self.requires,
            provides: &self.provides,
        }
    }

    pub(crate) fn record(&self) -> TaskRecord {
        TaskRecord {
            name: self.name.to_string(),
            description: self.description.clone(),
            creation_time: self.creation_time,
            call_time: self.call_time,
            fingerprint: self.fingerprint,
        }
    }

    pub(crate) fn restore(record: TaskRecord) -> Self {
        Self {
            name: record.name.into(),
            description: record.description,
            requires: Vec::new(),
            provides: Vec::new(),
            fingerprint: record.fingerprint,
            creation_time: record.creation_time,
            call_time: record.call_time,
            body: None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("requires", &self.requires)
            .field("provides", &self.provides)
            .field("fingerprint", &self.fingerprint)
            .field("call_time", &self.call_time)
            .field("inert", &self.is_inert())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ran = if self.has_run() { 'R' } else { ' ' };
        let fresh = if self.outputs_up_to_date() { 'U' } else { ' ' };
        write!(f, "Task: {} ({}{})", self.name, ran, fresh)
    }
}

/// How a registration changed the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this name was seen.
    New,
    /// Same name and fingerprint, run history kept.
    Redeclared,
    /// Same name, different fingerprint, run history reset.
    Overridden,
}

/// Owns every task, plus the producer and consumer links of artifacts.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: BTreeMap<ArcStr, Task>,
    producers: HashMap<Utf8PathBuf, ArcStr>,
    consumers: HashMap<Utf8PathBuf, BTreeSet<ArcStr>>,
}

impl TaskRegistry {
    /// Fails if any of `provides` already has a producer other than `name`.
    pub(crate) fn check_producers<'p>(
        &self,
        name: &str,
        provides: impl IntoIterator<Item = (&'p str, &'p Utf8Path)>,
    ) -> Result<(), RegistrationError> {
        for (artifact, path) in provides {
            match self.producers.get(path) {
                Some(producer) if producer.as_ref() != name => {
                    return Err(RegistrationError::ProducerConflict {
                        artifact: artifact.to_string(),
                        producer: producer.to_string(),
                        offender: name.to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Creates or updates a task. Producer conflicts must have been ruled out
    /// with [`TaskRegistry::check_producers`] beforehand.
    pub(crate) fn upsert(
        &mut self,
        name: &str,
        description: Option<String>,
        fingerprint: Fingerprint,
        requires: Vec<Artifact>,
        provides: Vec<Artifact>,
        body: Arc<dyn Body>,
    ) -> Registration {
        let registration = match self.tasks.get(name) {
            None => Registration::New,
            Some(task) if task.fingerprint == fingerprint => Registration::Redeclared,
            Some(_) => Registration::Overridden,
        };

        self.unlink(name);

        let key: ArcStr = match self.tasks.get_key_value(name) {
            Some((key, _)) => key.clone(),
            None => name.into(),
        };

        for artifact in &provides {
            self.producers
                .insert(artifact.path().to_path_buf(), key.clone());
        }
        for artifact in &requires {
            self.consumers
                .entry(artifact.path().to_path_buf())
                .or_default()
                .insert(key.clone());
        }

        let task = self.tasks.entry(key.clone()).or_insert_with(|| Task {
            name: key,
            description: None,
            requires: Vec::new(),
            provides: Vec::new(),
            fingerprint,
            creation_time: SystemTime::now(),
            call_time: NEVER,
            body: None,
        });

        task.description = description;
        task.requires = requires;
        task.provides = provides;
        task.fingerprint = fingerprint;
        task.body = Some(body);

        if registration == Registration::Overridden {
            task.reset_time();
        }

        registration
    }

    /// Drops the producer and consumer links left by a previous registration.
    fn unlink(&mut self, name: &str) {
        let Some(task) = self.tasks.get(name) else {
            return;
        };

        for artifact in &task.provides {
            if self
                .producers
                .get(artifact.path())
                .is_some_and(|producer| producer.as_ref() == name)
            {
                self.producers.remove(artifact.path());
            }
        }

        for artifact in &task.requires {
            if let Some(set) = self.consumers.get_mut(artifact.path()) {
                set.remove(name);
                if set.is_empty() {
                    self.consumers.remove(artifact.path());
                }
            }
        }
    }

    /// Inserts a task read back from the state file, unless a live task with
    /// that name already exists.
    pub(crate) fn restore(&mut self, record: TaskRecord) -> bool {
        if self.tasks.contains_key(record.name.as_str()) {
            return false;
        }

        let task = Task::restore(record);
        self.tasks.insert(task.name.clone(), task);
        true
    }

    pub(crate) fn get(&self, name: &str) -> Result<&Task, LookupError> {
        self.tasks
            .get(name)
            .ok_or_else(|| LookupError::TaskNotFound(name.to_string()))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut Task, LookupError> {
        self.tasks
            .get_mut(name)
            .ok_or_else(|| LookupError::TaskNotFound(name.to_string()))
    }

    pub(crate) fn producer_of(&self, artifact: &Artifact) -> Result<&Task, LookupError> {
        self.producers
            .get(artifact.path())
            .and_then(|name| self.tasks.get(name))
            .ok_or_else(|| LookupError::NotManaged(artifact.name().to_string()))
    }

    pub(crate) fn producer_name(&self, path: &Utf8Path) -> Option<&ArcStr> {
        self.producers.get(path)
    }

    pub(crate) fn consumer_names(&self, path: &Utf8Path) -> impl Iterator<Item = &ArcStr> {
        self.consumers.get(path).into_iter().flatten()
    }

    pub(crate) fn consumers_of(&self, artifact: &Artifact) -> Vec<&Task> {
        self.consumer_names(artifact.path())
            .filter_map(|name| self.tasks.get(name))
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactRegistry;

    fn body() -> Arc<dyn Body> {
        Arc::new(FnBody::<_, ()>::new(
            |_: &TaskContext<'_>| -> anyhow::Result<()> { Ok(()) },
        ))
    }

    fn register(
        tasks: &mut TaskRegistry,
        artifacts: &mut ArtifactRegistry,
        name: &str,
        fingerprint: &str,
        requires: &[&str],
        provides: &[&str],
    ) -> Result<Registration, RegistrationError> {
        let paths: Vec<_> = provides.iter().map(|p| (*p, artifacts.path_for(p))).collect();
        tasks.check_producers(name, paths.iter().map(|(n, p)| (*n, p.as_path())))?;

        let requires = requires.iter().map(|n| artifacts.resolve(n)).collect();
        let provides = provides.iter().map(|n| artifacts.resolve(n)).collect();

        Ok(tasks.upsert(
            name,
            None,
            Fingerprint::hash(fingerprint),
            requires,
            provides,
            body(),
        ))
    }

    #[test]
    fn test_registration_kinds() {
        let mut tasks = TaskRegistry::default();
        let mut artifacts = ArtifactRegistry::new("data");

        let first = register(&mut tasks, &mut artifacts, "p", "v1", &[], &["a.dat"]).unwrap();
        assert_eq!(first, Registration::New);
        assert!(!tasks.get("p").unwrap().has_run());

        tasks.get_mut("p").unwrap().call_time = SystemTime::now();

        let same = register(&mut tasks, &mut artifacts, "p", "v1", &[], &["a.dat"]).unwrap();
        assert_eq!(same, Registration::Redeclared);
        assert!(tasks.get("p").unwrap().has_run());

        let changed = register(&mut tasks, &mut artifacts, "p", "v2", &[], &["a.dat"]).unwrap();
        assert_eq!(changed, Registration::Overridden);
        assert!(!tasks.get("p").unwrap().has_run());
    }

    #[test]
    fn test_producer_conflict_leaves_registry_untouched() {
        let mut tasks = TaskRegistry::default();
        let mut artifacts = ArtifactRegistry::new("data");

        register(&mut tasks, &mut artifacts, "first", "v1", &[], &["out.dat"]).unwrap();
        let err = register(&mut tasks, &mut artifacts, "second", "v1", &[], &["out.dat"]);

        assert!(matches!(
            err,
            Err(RegistrationError::ProducerConflict { ref producer, ref offender, .. })
                if producer == "first" && offender == "second"
        ));
        assert!(tasks.get("second").is_err());

        let out = artifacts.resolve("out.dat");
        assert_eq!(tasks.producer_of(&out).unwrap().name(), "first");
    }

    #[test]
    fn test_reregistration_moves_links() {
        let mut tasks = TaskRegistry::default();
        let mut artifacts = ArtifactRegistry::new("data");

        register(&mut tasks, &mut artifacts, "t", "v1", &["in.dat"], &["old.dat"]).unwrap();
        register(&mut tasks, &mut artifacts, "t", "v1", &["other.dat"], &["new.dat"]).unwrap();

        let old = artifacts.resolve("old.dat");
        let new = artifacts.resolve("new.dat");
        let input = artifacts.resolve("in.dat");
        let other = artifacts.resolve("other.dat");

        assert_eq!(
            tasks.producer_of(&old).unwrap_err(),
            LookupError::NotManaged("old.dat".into())
        );
        assert_eq!(tasks.producer_of(&new).unwrap().name(), "t");
        assert!(tasks.consumers_of(&input).is_empty());
        assert_eq!(tasks.consumers_of(&other).len(), 1);

        // the same task may take its own output back
        register(&mut tasks, &mut artifacts, "t", "v1", &[], &["new.dat"]).unwrap();
    }

    #[test]
    fn test_restore_is_inert() {
        let mut tasks = TaskRegistry::default();
        let record = TaskRecord {
            name: "old".into(),
            description: Some("from disk".into()),
            creation_time: SystemTime::now(),
            call_time: SystemTime::now(),
            fingerprint: Fingerprint::hash("v1"),
        };

        assert!(tasks.restore(record.clone()));
        assert!(!tasks.restore(record));

        let task = tasks.get("old").unwrap();
        assert!(task.is_inert());
        assert!(task.has_run());
        assert_eq!(task.description(), Some("from disk"));
    }

    #[test]
    fn test_context_lookups() {
        let mut artifacts = ArtifactRegistry::new("data");
        let requires = vec![artifacts.resolve("in.dat")];
        let provides = vec![artifacts.resolve("sub/out.dat")];
        let ctx = TaskContext {
            task: "t",
            requires: &requires,
            provides: &provides,
        };

        assert_eq!(ctx.din("in.dat").unwrap().as_str(), "data/in.dat");
        assert_eq!(ctx.dout("sub/out.dat").unwrap().as_str(), "data/sub/out.dat");
        assert_eq!(ctx.dany("sub/out.dat").unwrap().as_str(), "data/sub/out.dat");
        assert_eq!(ctx.din("./in.dat").unwrap().as_str(), "data/in.dat");
        assert_eq!(ctx.dout("sub/./x/../out.dat").unwrap().as_str(), "data/sub/out.dat");
        assert_eq!(
            ctx.dout("in.dat"),
            Err(ContextError::Undeclared {
                task: "t".into(),
                artifact: "in.dat".into()
            })
        );
    }

    #[test]
    fn test_derived_fingerprint_tracks_declaration() {
        let a = Declaration::new("t", ["in.dat"], ["out.dat"]);
        let b = Declaration::new("t", ["in.dat"], ["out.dat"]);
        let c = Declaration::new("t", ["in.dat"], ["other.dat"]);

        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }
}

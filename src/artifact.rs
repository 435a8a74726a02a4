//! Named, filesystem-backed data items consumed or produced by tasks.
//!
//! An [`Artifact`] carries no cached state: [`Artifact::exists`] and
//! [`Artifact::modified_at`] ask the filesystem every time they are called,
//! so changes made between two checks are visible immediately.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::core::ArcStr;
use crate::error::LookupError;

/// One named data file.
///
/// Identity is the resolved path: two artifacts are equal when they point at
/// the same file, whatever logical name was used to declare them.
#[derive(Debug, Clone)]
pub struct Artifact {
    name: ArcStr,
    path: Utf8PathBuf,
}

impl Artifact {
    /// The logical name, as declared by the first task that referenced it.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// True if the file exists right now.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Last modification time, `None` when the file doesn't exist.
    pub fn modified_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path)
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Artifact {}

impl Hash for Artifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Data: {}", self.path)
    }
}

/// Lexically normalizes a path: drops `.` components and folds `..` into
/// the preceding component where there is one.
pub(crate) fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_str()),
        }
    }

    out
}

/// Maps logical artifact names to unique [`Artifact`]s rooted under the
/// data directory.
#[derive(Debug)]
pub(crate) struct ArtifactRegistry {
    root: Utf8PathBuf,
    by_path: HashMap<Utf8PathBuf, Artifact>,
    by_name: BTreeMap<ArcStr, Utf8PathBuf>,
}

impl ArtifactRegistry {
    pub(crate) fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            by_path: HashMap::new(),
            by_name: BTreeMap::new(),
        }
    }

    /// The path `name` resolves to, without registering anything.
    pub(crate) fn path_for(&self, name: &str) -> Utf8PathBuf {
        normalize(&self.root.join(name))
    }

    /// Returns the artifact for `name`, creating and registering it on first
    /// reference.
    pub(crate) fn resolve(&mut self, name: &str) -> Artifact {
        if let Some(path) = self.by_name.get(name) {
            return self.by_path[path].clone();
        }

        let path = self.path_for(name);
        let artifact = self
            .by_path
            .entry(path.clone())
            .or_insert_with(|| Artifact {
                name: name.into(),
                path: path.clone(),
            })
            .clone();

        self.by_name.insert(name.into(), path);
        artifact
    }

    pub(crate) fn get(&self, name: &str) -> Result<&Artifact, LookupError> {
        self.by_name
            .get(name)
            .and_then(|path| self.by_path.get(path))
            .ok_or_else(|| LookupError::ArtifactNotFound(name.to_string()))
    }

    /// Every registered artifact once, ordered by logical name of first
    /// declaration.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.by_name
            .iter()
            .filter(|(name, path)| self.by_path[*path].name == **name)
            .map(|(_, path)| &self.by_path[path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Utf8Path::new("data/./a.dat")).as_str(), "data/a.dat");
        assert_eq!(normalize(Utf8Path::new("data/sub/../a.dat")).as_str(), "data/a.dat");
        assert_eq!(normalize(Utf8Path::new("/root/data/a.dat")).as_str(), "/root/data/a.dat");
        assert_eq!(normalize(Utf8Path::new("../a.dat")).as_str(), "../a.dat");
    }

    #[test]
    fn test_resolve_is_stable() {
        let mut registry = ArtifactRegistry::new("data");
        let a = registry.resolve("a.dat");
        let b = registry.resolve("a.dat");

        assert_eq!(a, b);
        assert_eq!(a.path().as_str(), "data/a.dat");
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn test_identity_is_by_path() {
        let mut registry = ArtifactRegistry::new("data");
        let a = registry.resolve("a.dat");
        let b = registry.resolve("./a.dat");

        assert_eq!(a, b);
        assert_eq!(b.name(), "a.dat");
        assert_eq!(registry.iter().count(), 1);
        assert!(registry.get("./a.dat").is_ok());
    }

    #[test]
    fn test_get_unknown() {
        let registry = ArtifactRegistry::new("data");
        assert_eq!(
            registry.get("nope.dat"),
            Err(LookupError::ArtifactNotFound("nope.dat".into()))
        );
    }

    #[test]
    fn test_live_filesystem_view() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut registry = ArtifactRegistry::new(root);
        let artifact = registry.resolve("live.dat");

        assert!(!artifact.exists());
        assert_eq!(artifact.modified_at(), None);

        fs::write(artifact.path(), "x").unwrap();

        assert!(artifact.exists());
        assert!(artifact.modified_at().is_some());
    }
}

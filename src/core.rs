use std::any::Any;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A type-erased, thread-safe container holding the value returned by a task
/// body.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for task and artifact names.
pub(crate) type ArcStr = Arc<str>;

/// The "never run" sentinel for a task's call time.
pub const NEVER: SystemTime = UNIX_EPOCH;

/// A 32-byte BLAKE3 hash identifying the implementation of a task.
///
/// Two registrations of the same task name with equal fingerprints are
/// treated as the same logic, so the recorded run history is kept. A
/// different fingerprint means the behavior may have changed, and the task
/// goes back to "never run".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    /// Hashes an arbitrary buffer, typically the source text or a version
    /// string of the task body.
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a sequence of parts, each one length-prefixed so that
    /// `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn hash_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

/// Error returned when parsing a [`Fingerprint`] from a hex string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint '{0}', expected 64 hex digits")]
pub struct ParseFingerprintError(String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 64 {
            return Err(ParseFingerprintError(s.to_string()));
        }

        let nibble = |c: u8| match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        };

        let mut out = [0u8; 32];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            match (nibble(pair[0]), nibble(pair[1])) {
                (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                _ => return Err(ParseFingerprintError(s.to_string())),
            }
        }

        Ok(Fingerprint(out))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

/// Source of call times.
///
/// File modification times are stamped by the filesystem, whose clock can be
/// coarser than [`SystemTime::now`]. Reading the time back from a freshly
/// rewritten marker file puts call times on the same clock as the artifacts
/// they are compared against.
#[derive(Debug, Clone)]
pub(crate) struct Clock {
    stamp: Utf8PathBuf,
}

impl Clock {
    pub(crate) fn new(state_dir: &Utf8Path) -> Self {
        Self {
            stamp: state_dir.join("clock"),
        }
    }

    pub(crate) fn now(&self) -> SystemTime {
        match self.touch() {
            Ok(time) => time,
            Err(e) => {
                tracing::warn!("falling back to system clock, can't touch {}: {}", self.stamp, e);
                SystemTime::now()
            }
        }
    }

    fn touch(&self) -> std::io::Result<SystemTime> {
        if let Some(dir) = self.stamp.parent() {
            fs::create_dir_all(dir)?;
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        fs::write(&self.stamp, nanos.to_string())?;
        fs::metadata(&self.stamp)?.modified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let hash = Fingerprint::hash("fn body() {}");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), hash);
    }

    #[test]
    fn test_fingerprint_rejects_garbage() {
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_hash_parts_is_length_prefixed() {
        assert_ne!(
            Fingerprint::hash_parts(["ab", "c"]),
            Fingerprint::hash_parts(["a", "bc"])
        );
        assert_eq!(
            Fingerprint::hash_parts(["a", "bc"]),
            Fingerprint::hash_parts(["a", "bc"])
        );
    }

    #[test]
    fn test_clock_follows_file_writes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let clock = Clock::new(&root.join(".dotry"));

        let before = clock.now();
        let file = root.join("later.dat");
        fs::write(&file, "x").unwrap();
        let mtime = fs::metadata(&file).unwrap().modified().unwrap();

        assert!(before > NEVER);
        assert!(before <= mtime);
    }
}

//! The world: file reads and the clock.
//!
//! The evaluator never touches the filesystem or the system time directly;
//! everything goes through a [`World`] handle so embedders can substitute
//! in-memory sources and a fixed clock, and so the `eval` builtin can run
//! with file access cut off entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::diag::{EvalError, EvalResult};

/// Host callbacks available to an evaluation.
pub trait World: Send + Sync {
    /// Read the raw bytes of a source file.
    fn read(&self, path: &str) -> EvalResult<Vec<u8>>;

    /// The current wall-clock time.
    fn now(&self) -> NaiveDateTime;
}

/// A world that refuses all file access.
///
/// Used for the `eval` sandbox: code evaluated there must not be able to
/// observe the filesystem.
pub struct NoopWorld;

impl World for NoopWorld {
    fn read(&self, path: &str) -> EvalResult<Vec<u8>> {
        Err(EvalError::io(format!("cannot access file system from here: {path}")))
    }

    fn now(&self) -> NaiveDateTime {
        NaiveDateTime::default()
    }
}

/// An in-memory world for tests and embedded content.
#[derive(Default)]
pub struct MemoryWorld {
    files: HashMap<String, Vec<u8>>,
    now: NaiveDateTime,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a text file under the given path.
    pub fn with_file(mut self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.files.insert(normalize(&path.into()), text.into().into_bytes());
        self
    }

    /// Pin the clock to a fixed instant.
    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = now;
        self
    }
}

impl World for MemoryWorld {
    fn read(&self, path: &str) -> EvalResult<Vec<u8>> {
        self.files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| EvalError::io(format!("file not found: {path}")))
    }

    fn now(&self) -> NaiveDateTime {
        self.now
    }
}

/// A world backed by the real filesystem and clock.
pub struct SystemWorld {
    root: PathBuf,
}

impl SystemWorld {
    /// Create a world rooted at the given directory; relative paths resolve
    /// against it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl World for SystemWorld {
    fn read(&self, path: &str) -> EvalResult<Vec<u8>> {
        let full = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.root.join(path)
        };
        std::fs::read(&full).map_err(|e| EvalError::io(format!("{}: {}", path, e)))
    }

    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Collapse `.` and `..` components so memory-world lookups are stable no
/// matter how the importing file spelled the path.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            std::path::Component::ParentDir => {
                parts.pop();
            }
            std::path::Component::CurDir => {}
            std::path::Component::Normal(s) => {
                if let Some(s) = s.to_str() {
                    parts.push(s);
                }
            }
            std::path::Component::RootDir => {
                parts.clear();
                parts.push("");
            }
            std::path::Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

/// Resolve a sibling path the way module imports do: replace the file name
/// of `current` with `relative`.
pub fn resolve(current: &str, relative: &str) -> String {
    if relative.starts_with('/') {
        return normalize(relative);
    }
    let parent = Path::new(current).parent().unwrap_or(Path::new(""));
    normalize(&parent.join(relative).to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_world_reads() {
        let world = MemoryWorld::new().with_file("lib.typ", "#let x = 1");
        assert_eq!(world.read("lib.typ").unwrap(), b"#let x = 1");
        assert!(world.read("missing.typ").is_err());
    }

    #[test]
    fn resolve_sibling() {
        assert_eq!(resolve("docs/main.typ", "util.typ"), "docs/util.typ");
        assert_eq!(resolve("docs/sub/main.typ", "../util.typ"), "docs/util.typ");
        assert_eq!(resolve("main.typ", "util.typ"), "util.typ");
    }

    #[test]
    fn noop_world_denies_reads() {
        assert!(NoopWorld.read("anything.typ").is_err());
    }
}

//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestStore;
//! ```

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

use codectx::chunk::{ChunkType, CodeChunk};
use codectx::config::{CacheSettings, PoolSettings, StoreSettings};
use codectx::pool::resources::{ResourceProbe, ResourceSample};
use codectx::{ModelInfo, VectorStore, EMBEDDING_DIM};

/// Test store with automatic cleanup
///
/// Wraps a `VectorStore` with its backing `TempDir`, ensuring the
/// directory lives as long as the store is in use.
pub struct TestStore {
    pub store: VectorStore,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = StoreSettings {
            snapshot_path: dir.path().join("snapshot.json"),
            global_mirror: None,
        };
        let store = VectorStore::open(&settings, ModelInfo::default());
        Self { store, _dir: dir }
    }

    /// A second handle over the same snapshot directory
    pub fn reopen(&self) -> VectorStore {
        let settings = StoreSettings {
            snapshot_path: self._dir.path().join("snapshot.json"),
            global_mirror: None,
        };
        VectorStore::open(&settings, ModelInfo::default())
    }
}

impl std::ops::Deref for TestStore {
    type Target = VectorStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Create a test chunk with sensible defaults
pub fn test_chunk(file: &str, start: u32, content: &str) -> CodeChunk {
    CodeChunk::new(file, start, start + 4, ChunkType::Function, content)
}

/// Create an embedded test chunk with a one-hot vector on `axis`
pub fn embedded_chunk(file: &str, start: u32, content: &str, axis: usize) -> CodeChunk {
    let mut chunk = test_chunk(file, start, content);
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[axis % EMBEDDING_DIM] = 1.0;
    chunk.embedding = Some(v);
    chunk
}

/// The real worker binary (the `codectx worker` subcommand)
pub fn worker_command() -> Vec<String> {
    vec![
        env!("CARGO_BIN_EXE_codectx").to_string(),
        "worker".to_string(),
    ]
}

/// Pool settings pointed at the real worker binary
pub fn pool_settings() -> PoolSettings {
    PoolSettings {
        worker_command: worker_command(),
        ..PoolSettings::default()
    }
}

pub fn cache_settings() -> CacheSettings {
    CacheSettings::default()
}

/// Write a `sh` wrapper that crashes exactly once.
///
/// On the first spawn (marker absent) the script completes the init
/// handshake, then exits with code 1 as soon as a batch arrives. Every
/// later spawn execs the real worker. Returns (argv, tempdir-guard).
#[cfg(unix)]
pub fn crash_once_worker() -> (Vec<String>, TempDir) {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("temp dir");
    let marker = dir.path().join("crashed.marker");
    let script_path = dir.path().join("crashy-worker.sh");
    let script = format!(
        r#"#!/bin/sh
if [ ! -e "{marker}" ]; then
  : > "{marker}"
  read _init
  printf '{{"type":"init_complete","success":true}}\n'
  read _batch
  exit 1
fi
exec "{worker}" worker
"#,
        marker = marker.display(),
        worker = env!("CARGO_BIN_EXE_codectx"),
    );
    std::fs::write(&script_path, script).expect("write script");
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");

    (vec![script_path.display().to_string()], dir)
}

/// Scripted resource probe: replays a fixed sample sequence, then
/// repeats the last sample forever.
pub struct ScriptedProbe {
    samples: Vec<ResourceSample>,
    cursor: usize,
}

impl ScriptedProbe {
    pub fn new(samples: Vec<(f64, f64)>) -> Self {
        ScriptedProbe {
            samples: samples
                .into_iter()
                .map(|(memory_fraction, cpu_fraction)| ResourceSample {
                    memory_fraction,
                    cpu_fraction,
                })
                .collect(),
            cursor: 0,
        }
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        let sample = self.samples.get(self.cursor).or(self.samples.last())?;
        if self.cursor + 1 < self.samples.len() {
            self.cursor += 1;
        }
        Some(*sample)
    }

    fn total_memory_bytes(&self) -> u64 {
        16 * 1024 * 1024 * 1024
    }
}

/// A small three-file fixture repository on disk
pub struct FixtureRepo {
    pub dir: TempDir,
}

impl FixtureRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let repo = FixtureRepo { dir };
        repo.write(
            "alpha.rs",
            "use std::fs;\n\npub fn read_settings(path: &str) -> String {\n    let data = fs::read_to_string(path).unwrap();\n    let trimmed = data.trim();\n    trimmed.to_string()\n}\n",
        );
        repo.write(
            "beta.rs",
            "pub fn checksum(bytes: &[u8]) -> u32 {\n    let mut acc = 0u32;\n    for b in bytes {\n        acc = acc.wrapping_add(*b as u32);\n    }\n    acc\n}\n",
        );
        repo.write(
            "gamma.rs",
            "pub struct Settings {\n    pub limit: usize,\n    pub verbose: bool,\n    pub quiet: bool,\n    pub retries: u8,\n}\n",
        );
        repo
    }

    pub fn write(&self, name: &str, content: &str) {
        std::fs::write(self.dir.path().join(name), content).expect("write fixture file");
    }

    pub fn root(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            snapshot_path: self.dir.path().join(".codectx/snapshot.json"),
            global_mirror: None,
        }
    }
}

/// Path to a snapshot inside a temp dir (helper for store tests)
pub fn snapshot_path(dir: &TempDir) -> PathBuf {
    dir.path().join("snapshot.json")
}

//! Configuration file support for codectx
//!
//! Config files are loaded in order (later overrides earlier):
//! 1. `~/.config/codectx/config.toml` (user defaults)
//! 2. `.codectx.toml` in project root (project overrides)
//!
//! CLI flags override all config file values. Components never read
//! config files themselves — the resolved [`Settings`] value is threaded
//! through constructors.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("pool.batch_min ({min}) must not exceed pool.batch_max ({max})")]
    BatchBounds { min: usize, max: usize },
    #[error("unknown mmr.diversity_metric '{0}' (expected cosine, jaccard, or semantic)")]
    UnknownMetric(String),
}

/// Similarity family used for MMR diversity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiversityMetric {
    Cosine,
    Jaccard,
    /// 0.7·cosine + 0.3·jaccard
    Semantic,
}

impl std::str::FromStr for DiversityMetric {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DiversityMetric::Cosine),
            "jaccard" => Ok(DiversityMetric::Jaccard),
            "semantic" => Ok(DiversityMetric::Semantic),
            other => Err(ConfigError::UnknownMetric(other.to_string())),
        }
    }
}

// ===== File-layer structs (everything optional, merged field-wise) =====

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolSection {
    max_fraction: Option<f64>,
    start_fraction: Option<f64>,
    memory_stop: Option<f64>,
    memory_resume: Option<f64>,
    cpu_stop: Option<f64>,
    cpu_resume: Option<f64>,
    batch_min: Option<usize>,
    batch_max: Option<usize>,
    batch_step: Option<usize>,
    batch_start: Option<usize>,
    batch_timeout_ms: Option<u64>,
    worker_command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CacheSection {
    max_entries: Option<usize>,
    evict_threshold: Option<f64>,
    evict_percent: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MmrSection {
    lambda_relevance: Option<f32>,
    max_token_budget: Option<usize>,
    token_cushion_percent: Option<f32>,
    diversity_metric: Option<String>,
    min_critical_set_coverage: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoreSection {
    snapshot_path: Option<PathBuf>,
    global_mirror: Option<PathBuf>,
}

/// Raw configuration as read from a TOML file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    verbose: Option<bool>,
    quiet: Option<bool>,
    pool: PoolSection,
    cache: CacheSection,
    mmr: MmrSection,
    store: StoreSection,
}

impl ConfigFile {
    /// Load and merge user + project config files
    pub fn load(project_root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("codectx/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();

        let project_config =
            Self::load_file(&project_root.join(".codectx.toml")).unwrap_or_default();

        user_config.override_with(project_config)
    }

    fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Layer another config on top (other overrides self where present)
    fn override_with(self, other: Self) -> Self {
        ConfigFile {
            verbose: other.verbose.or(self.verbose),
            quiet: other.quiet.or(self.quiet),
            pool: PoolSection {
                max_fraction: other.pool.max_fraction.or(self.pool.max_fraction),
                start_fraction: other.pool.start_fraction.or(self.pool.start_fraction),
                memory_stop: other.pool.memory_stop.or(self.pool.memory_stop),
                memory_resume: other.pool.memory_resume.or(self.pool.memory_resume),
                cpu_stop: other.pool.cpu_stop.or(self.pool.cpu_stop),
                cpu_resume: other.pool.cpu_resume.or(self.pool.cpu_resume),
                batch_min: other.pool.batch_min.or(self.pool.batch_min),
                batch_max: other.pool.batch_max.or(self.pool.batch_max),
                batch_step: other.pool.batch_step.or(self.pool.batch_step),
                batch_start: other.pool.batch_start.or(self.pool.batch_start),
                batch_timeout_ms: other.pool.batch_timeout_ms.or(self.pool.batch_timeout_ms),
                worker_command: other.pool.worker_command.or(self.pool.worker_command),
            },
            cache: CacheSection {
                max_entries: other.cache.max_entries.or(self.cache.max_entries),
                evict_threshold: other.cache.evict_threshold.or(self.cache.evict_threshold),
                evict_percent: other.cache.evict_percent.or(self.cache.evict_percent),
            },
            mmr: MmrSection {
                lambda_relevance: other.mmr.lambda_relevance.or(self.mmr.lambda_relevance),
                max_token_budget: other.mmr.max_token_budget.or(self.mmr.max_token_budget),
                token_cushion_percent: other
                    .mmr
                    .token_cushion_percent
                    .or(self.mmr.token_cushion_percent),
                diversity_metric: other.mmr.diversity_metric.or(self.mmr.diversity_metric),
                min_critical_set_coverage: other
                    .mmr
                    .min_critical_set_coverage
                    .or(self.mmr.min_critical_set_coverage),
            },
            store: StoreSection {
                snapshot_path: other.store.snapshot_path.or(self.store.snapshot_path),
                global_mirror: other.store.global_mirror.or(self.store.global_mirror),
            },
        }
    }

    /// Resolve into validated settings with defaults applied.
    pub fn resolve(self, project_root: &Path) -> Result<Settings, ConfigError> {
        let pool = PoolSettings {
            max_fraction: self.pool.max_fraction.unwrap_or(0.69),
            start_fraction: self.pool.start_fraction.unwrap_or(0.25),
            memory_stop: self.pool.memory_stop.unwrap_or(0.78),
            memory_resume: self.pool.memory_resume.unwrap_or(0.69),
            cpu_stop: self.pool.cpu_stop.unwrap_or(0.69),
            cpu_resume: self.pool.cpu_resume.unwrap_or(0.49),
            batch_min: self.pool.batch_min.unwrap_or(200),
            batch_max: self.pool.batch_max.unwrap_or(800),
            batch_step: self.pool.batch_step.unwrap_or(100),
            batch_start: self.pool.batch_start.unwrap_or(400),
            batch_timeout_ms: self.pool.batch_timeout_ms.unwrap_or(120_000),
            worker_command: self.pool.worker_command.unwrap_or_default(),
        };
        let cache = CacheSettings {
            max_entries: self.cache.max_entries.unwrap_or(10_000),
            evict_threshold: self.cache.evict_threshold.unwrap_or(0.8),
            evict_percent: self.cache.evict_percent.unwrap_or(0.2),
        };
        let mmr = MmrSettings {
            lambda_relevance: self.mmr.lambda_relevance.unwrap_or(0.7),
            max_token_budget: self.mmr.max_token_budget.unwrap_or(100_000),
            token_cushion_percent: self.mmr.token_cushion_percent.unwrap_or(0.20),
            diversity_metric: self
                .mmr
                .diversity_metric
                .as_deref()
                .unwrap_or("semantic")
                .parse()?,
            min_critical_set_coverage: self.mmr.min_critical_set_coverage.unwrap_or(0.95),
        };
        let index_dir = project_root.join(crate::INDEX_DIR);
        let store = StoreSettings {
            snapshot_path: self
                .store
                .snapshot_path
                .unwrap_or_else(|| index_dir.join("snapshot.json")),
            global_mirror: self.store.global_mirror.or_else(|| {
                dirs::data_dir().map(|d| {
                    d.join("codectx/mirrors")
                        .join(mirror_file_name(project_root))
                })
            }),
        };

        let settings = Settings {
            verbose: self.verbose.unwrap_or(false),
            quiet: self.quiet.unwrap_or(false),
            pool,
            cache,
            mmr,
            store,
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Mirror file name derived from the project root path hash, so
/// mirrors of different projects never collide in the shared directory.
fn mirror_file_name(project_root: &Path) -> String {
    let hash = blake3::hash(project_root.to_string_lossy().as_bytes());
    format!("{}.json", &hash.to_hex()[..16])
}

// ===== Resolved settings =====

/// Pool sizing, timeouts, and worker spawn settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Fraction of logical cores used as the hard process ceiling
    pub max_fraction: f64,
    /// Initial fraction of the ceiling
    pub start_fraction: f64,
    pub memory_stop: f64,
    pub memory_resume: f64,
    pub cpu_stop: f64,
    pub cpu_resume: f64,
    pub batch_min: usize,
    pub batch_max: usize,
    pub batch_step: usize,
    pub batch_start: usize,
    pub batch_timeout_ms: u64,
    /// argv for spawning workers; empty = `current_exe() worker`
    pub worker_command: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        ConfigFile::default()
            .resolve(Path::new("."))
            .expect("defaults are valid")
            .pool
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: usize,
    /// Fill fraction that triggers eviction
    pub evict_threshold: f64,
    /// Fraction of entries evicted per pass
    pub evict_percent: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_entries: 10_000,
            evict_threshold: 0.8,
            evict_percent: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmrSettings {
    pub lambda_relevance: f32,
    pub max_token_budget: usize,
    pub token_cushion_percent: f32,
    pub diversity_metric: DiversityMetric,
    /// Reported target; never enforced when the critical set cannot fit
    pub min_critical_set_coverage: f32,
}

impl Default for MmrSettings {
    fn default() -> Self {
        MmrSettings {
            lambda_relevance: 0.7,
            max_token_budget: 100_000,
            token_cushion_percent: 0.20,
            diversity_metric: DiversityMetric::Semantic,
            min_critical_set_coverage: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub snapshot_path: PathBuf,
    /// Cross-checkout mirror; `None` disables mirroring
    pub global_mirror: Option<PathBuf>,
}

/// Fully resolved, validated configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub verbose: bool,
    pub quiet: bool,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub mmr: MmrSettings,
    pub store: StoreSettings,
}

impl Settings {
    /// Load config files for a project and resolve with defaults.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        ConfigFile::load(project_root).resolve(project_root)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("pool.max_fraction", self.pool.max_fraction)?;
        check_fraction("pool.start_fraction", self.pool.start_fraction)?;
        check_fraction("pool.memory_stop", self.pool.memory_stop)?;
        check_fraction("pool.memory_resume", self.pool.memory_resume)?;
        check_fraction("pool.cpu_stop", self.pool.cpu_stop)?;
        check_fraction("pool.cpu_resume", self.pool.cpu_resume)?;
        check_fraction("cache.evict_threshold", self.cache.evict_threshold)?;
        check_fraction("cache.evict_percent", self.cache.evict_percent)?;
        check_fraction("mmr.lambda_relevance", self.mmr.lambda_relevance as f64)?;
        check_fraction(
            "mmr.min_critical_set_coverage",
            self.mmr.min_critical_set_coverage as f64,
        )?;
        if !(0.0..=0.5).contains(&self.mmr.token_cushion_percent) {
            return Err(ConfigError::OutOfRange {
                field: "mmr.token_cushion_percent",
                value: self.mmr.token_cushion_percent as f64,
                min: 0.0,
                max: 0.5,
            });
        }
        if self.pool.batch_min > self.pool.batch_max {
            return Err(ConfigError::BatchBounds {
                min: self.pool.batch_min,
                max: self.pool.batch_max,
            });
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        ConfigFile::default()
            .resolve(Path::new("."))
            .expect("defaults are valid")
    }
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}

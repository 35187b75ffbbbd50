use std::collections::HashMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Hook wall-clock budget for the token monitor (must return within this).
pub const TOKEN_MONITOR_BUDGET_MS: u64 = 2_500;
/// Token threshold that triggers background extraction: 65% of a 128k window.
pub const TOKEN_TRIGGER_THRESHOLD: u64 = (128_000 * 65) / 100;
/// Observation log rolls over once it exceeds this size.
pub const OBSERVATION_ROLL_BYTES: u64 = 10 * 1024 * 1024;

/// Top-level config (engram.toml + ENGRAM_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub guards: GuardsConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub instinct: InstinctConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Recognized key categories. The extractor prompt and key validation
    /// both read this list, so deployments can narrow or extend it without
    /// a rebuild.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Search `type` tag → set of key prefixes it selects.
    #[serde(default = "default_type_mappings")]
    pub type_mappings: HashMap<String, Vec<String>>,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            extractor: ExtractorConfig::default(),
            embedding: EmbeddingConfig::default(),
            dedup: DedupConfig::default(),
            search: SearchConfig::default(),
            digest: DigestConfig::default(),
            noise: NoiseConfig::default(),
            guards: GuardsConfig::default(),
            lock: LockConfig::default(),
            instinct: InstinctConfig::default(),
            providers: ProvidersConfig::default(),
            categories: default_categories(),
            type_mappings: default_type_mappings(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the database, ledger, locks, and derived files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Database file path. Defaults to `<data_dir>/engram.db`.
    pub db_path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(&self.data_dir).join("engram.db"),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("processed_sources.ledger")
    }

    pub fn locks_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("locks")
    }

    pub fn digest_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("digest.json")
    }

    pub fn daily_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("daily")
    }

    pub fn topics_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("topics")
    }

    pub fn observations_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("observations.jsonl")
    }

    pub fn worker_log_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("worker.log")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Which provider slot to use: "ollama" or "openai".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_extract_model")]
    pub model: String,
    /// Chunk size cap in characters; chunks split only on paragraph breaks.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    /// Per-chunk deadline when called inline from a hook.
    #[serde(default = "default_inline_timeout")]
    pub inline_timeout_secs: u64,
    /// Per-chunk deadline in background workers.
    #[serde(default = "default_background_timeout")]
    pub background_timeout_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_extract_model(),
            chunk_chars: default_chunk_chars(),
            inline_timeout_secs: default_inline_timeout(),
            background_timeout_secs: default_background_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_model")]
    pub model: String,
    /// Expected vector dimension. Written into the store on first embed;
    /// vectors of any other length are rejected.
    #[serde(default = "default_embed_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embed_model(),
            dimension: default_embed_dimension(),
            batch_size: default_embed_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_similarity_threshold(),
            max_candidates: default_max_candidates(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_vector_threshold")]
    pub vector_threshold: f32,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f32,
    /// Added (scaled by the vector score) when both methods return a row.
    #[serde(default = "default_bm25_bonus")]
    pub bm25_bonus: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_threshold: default_vector_threshold(),
            vector_weight: default_vector_weight(),
            bm25_weight: default_bm25_weight(),
            bm25_bonus: default_bm25_bonus(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Categories below this count are folded out of the digest summary.
    #[serde(default = "default_min_count_for_l0")]
    pub min_count_for_l0: usize,
    #[serde(default = "default_max_categories_in_l0")]
    pub max_categories_in_l0: usize,
    /// Categories always shown regardless of count.
    #[serde(default)]
    pub shown_categories: Vec<String>,
    /// Keys always included in the digest samples.
    #[serde(default)]
    pub pinned_keys: Vec<String>,
    /// Example facts sampled per category.
    #[serde(default = "default_samples_per_category")]
    pub samples_per_category: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            min_count_for_l0: default_min_count_for_l0(),
            max_categories_in_l0: default_max_categories_in_l0(),
            shown_categories: Vec::new(),
            pinned_keys: Vec::new(),
            samples_per_category: default_samples_per_category(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    #[serde(default = "default_noise_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_noise_max_chars")]
    pub max_chars: usize,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            min_chars: default_noise_min_chars(),
            max_chars: default_noise_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardsConfig {
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,
    #[serde(default = "default_max_sessions_per_run")]
    pub max_sessions_per_run: usize,
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            min_free_mb: default_min_free_mb(),
            max_sessions_per_run: default_max_sessions_per_run(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Stale TTL for background worker locks.
    #[serde(default = "default_worker_stale_ttl")]
    pub worker_stale_ttl_secs: u64,
    /// Stale TTL for hook-held locks (shorter — hooks are bounded).
    #[serde(default = "default_hook_stale_ttl")]
    pub hook_stale_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            worker_stale_ttl_secs: default_worker_stale_ttl(),
            hook_stale_ttl_secs: default_hook_stale_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstinctConfig {
    /// Instincts below this confidence are discarded at synthesis time.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Instincts at or above this confidence are injected at session start.
    #[serde(default = "default_inject_confidence")]
    pub inject_confidence: f64,
}

impl Default for InstinctConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            inject_confidence: default_inject_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub openai: Option<OpenAiProviderConfig>,
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

fn bool_true() -> bool {
    true
}
fn default_provider() -> String {
    "ollama".to_string()
}
fn default_extract_model() -> String {
    "qwen2.5:7b".to_string()
}
fn default_chunk_chars() -> usize {
    30_000
}
fn default_inline_timeout() -> u64 {
    45
}
fn default_background_timeout() -> u64 {
    120
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_embed_dimension() -> usize {
    768
}
fn default_embed_batch() -> usize {
    100
}
fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_max_candidates() -> usize {
    5
}
fn default_vector_threshold() -> f32 {
    0.3
}
fn default_vector_weight() -> f32 {
    0.7
}
fn default_bm25_weight() -> f32 {
    0.3
}
fn default_bm25_bonus() -> f32 {
    0.15
}
fn default_min_count_for_l0() -> usize {
    5
}
fn default_max_categories_in_l0() -> usize {
    15
}
fn default_samples_per_category() -> usize {
    3
}
fn default_noise_min_chars() -> usize {
    10
}
fn default_noise_max_chars() -> usize {
    5_000
}
fn default_min_free_mb() -> u64 {
    400
}
fn default_max_sessions_per_run() -> usize {
    50
}
fn default_worker_stale_ttl() -> u64 {
    600
}
fn default_hook_stale_ttl() -> u64 {
    300
}
fn default_min_confidence() -> f64 {
    0.5
}
fn default_inject_confidence() -> f64 {
    0.6
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.engram", home)
}

fn default_categories() -> Vec<String> {
    [
        "user",
        "project",
        "task",
        "system",
        "config",
        "preference",
        "location",
        "tool",
        "agent",
        "workflow",
        "team",
        "environment",
        "model",
        "auth",
        "channel",
        "gateway",
        "plugin",
        "binding",
        "command",
        "meta",
        "error",
        "correction",
        "event",
        "entity",
        "inferred",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_type_mappings() -> HashMap<String, Vec<String>> {
    let mut m = HashMap::new();
    let ins = |m: &mut HashMap<String, Vec<String>>, tag: &str, prefixes: &[&str]| {
        m.insert(
            tag.to_string(),
            prefixes.iter().map(|p| p.to_string()).collect(),
        );
    };
    ins(&mut m, "fact", &["user.", "project.", "system.", "config."]);
    ins(&mut m, "pref", &["preference."]);
    ins(&mut m, "entity", &["entity.", "location.", "team."]);
    ins(&mut m, "event", &["event.", "task."]);
    ins(&mut m, "agent", &["agent."]);
    ins(&mut m, "inferred", &["inferred."]);
    ins(&mut m, "error", &["error.", "correction."]);
    m
}

impl EngramConfig {
    /// Load config from a TOML file with ENGRAM_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ENGRAM_CONFIG env var
    ///   3. ~/.engram/engram.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("ENGRAM_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: EngramConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ENGRAM_").split("_"))
            .extract()
            .map_err(|e| crate::error::EngramError::Config(e.to_string()))?;

        Ok(config)
    }

    /// True when the category (already singular/lowercase) is recognized.
    pub fn is_known_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.engram/engram.toml", home)
}

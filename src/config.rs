//! Configuration for evidence gathering and gene resolution
//!
//! Every struct deserializes with `#[serde(default)]`, so a file only needs the
//! values it overrides. Loaded configurations are checked by
//! [`EvidenceConfig::validate`] before use.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EvidenceError, Result};
use crate::evidence::EvidenceKind;
use crate::resilience::{BreakerSettings, TripCondition};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Upper bound for one whole gather; no source call may be configured longer
    pub gather_timeout: Duration,

    pub cache: CacheConfig,

    pub sources: SourcesConfig,

    pub gene: GeneResolutionConfig,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            gather_timeout: Duration::from_secs(30),
            cache: CacheConfig::default(),
            sources: SourcesConfig::default(),
            gene: GeneResolutionConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: usize,

    /// Initial retry delay
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,

    /// Jitter to add randomness to retries
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Cache backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// sqlx connection URL of the sqlite cache
    pub url: String,

    /// TTL used when a write does not name one
    pub default_ttl: Duration,

    /// Maximum pooled connections
    pub pool_size: u32,

    /// How long to wait for a pooled connection
    pub pool_timeout: Duration,

    /// Retries of transient backend failures
    pub max_retries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://variant_cache.db".to_string(),
            default_ttl: DAY,
            pool_size: 10,
            pool_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl CacheConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }
}

/// Settings of one evidence source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Requests per second
    pub rate_limit: f64,

    pub burst: u32,

    /// Per-call timeout, clamped to the gather deadline
    pub timeout: Duration,

    pub cache_ttl: Duration,

    pub breaker: BreakerSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::public(DAY)
    }
}

impl ServiceConfig {
    fn public(cache_ttl: Duration) -> Self {
        Self {
            rate_limit: 5.0,
            burst: 1,
            timeout: Duration::from_secs(10),
            cache_ttl,
            breaker: BreakerSettings::public_source(),
        }
    }

    pub fn clinvar() -> Self {
        Self::public(EvidenceKind::ClinicalSignificance.default_ttl())
    }

    pub fn gnomad() -> Self {
        Self::public(EvidenceKind::PopulationFrequency.default_ttl())
    }

    pub fn cosmic() -> Self {
        Self::public(EvidenceKind::Somatic.default_ttl())
    }

    /// NCBI E-utilities allow 3 requests per second without a key.
    pub fn pubmed() -> Self {
        Self {
            rate_limit: 3.0,
            breaker: BreakerSettings::sensitive_source(),
            ..Self::public(EvidenceKind::Literature.default_ttl())
        }
    }

    pub fn lovd() -> Self {
        Self::public(EvidenceKind::GeneSpecificDatabase.default_ttl())
    }

    pub fn hgmd() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            breaker: BreakerSettings::commercial_source(),
            ..Self::public(EvidenceKind::MutationDatabase.default_ttl())
        }
    }
}

/// Per-source settings for the six evidence sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub clinvar: ServiceConfig,
    pub gnomad: ServiceConfig,
    pub cosmic: ServiceConfig,
    pub pubmed: ServiceConfig,
    pub lovd: ServiceConfig,
    pub hgmd: ServiceConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            clinvar: ServiceConfig::clinvar(),
            gnomad: ServiceConfig::gnomad(),
            cosmic: ServiceConfig::cosmic(),
            pubmed: ServiceConfig::pubmed(),
            lovd: ServiceConfig::lovd(),
            hgmd: ServiceConfig::hgmd(),
        }
    }
}

impl SourcesConfig {
    pub fn for_kind(&self, kind: EvidenceKind) -> &ServiceConfig {
        match kind {
            EvidenceKind::ClinicalSignificance => &self.clinvar,
            EvidenceKind::PopulationFrequency => &self.gnomad,
            EvidenceKind::Somatic => &self.cosmic,
            EvidenceKind::Literature => &self.pubmed,
            EvidenceKind::GeneSpecificDatabase => &self.lovd,
            EvidenceKind::MutationDatabase => &self.hgmd,
        }
    }

    pub fn for_kind_mut(&mut self, kind: EvidenceKind) -> &mut ServiceConfig {
        match kind {
            EvidenceKind::ClinicalSignificance => &mut self.clinvar,
            EvidenceKind::PopulationFrequency => &mut self.gnomad,
            EvidenceKind::Somatic => &mut self.cosmic,
            EvidenceKind::Literature => &mut self.pubmed,
            EvidenceKind::GeneSpecificDatabase => &mut self.lovd,
            EvidenceKind::MutationDatabase => &mut self.hgmd,
        }
    }
}

/// Throttling of one gene service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneServiceConfig {
    pub rate_limit: f64,
    pub burst: u32,
    pub timeout: Duration,
}

impl Default for GeneServiceConfig {
    fn default() -> Self {
        Self {
            rate_limit: 3.0,
            burst: 1,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Gene symbol to transcript failover settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneResolutionConfig {
    pub hgnc: GeneServiceConfig,

    /// Rate with an API key; without one RefSeq is held to 3 req/s
    pub refseq: GeneServiceConfig,

    pub ensembl: GeneServiceConfig,

    pub refseq_api_key: Option<String>,

    /// Outer breaker around the whole failover chain
    pub breaker: BreakerSettings,

    /// TTL in the shared cache store
    pub transcript_cache_ttl: Duration,

    /// TTL in the in-process hot tier
    pub memory_cache_ttl: Duration,

    /// Transcripts kept in the hot tier before least-recently-used eviction
    pub max_memory_size: usize,

    /// Concurrent lookups in a batch resolve
    pub max_concurrency: usize,
}

impl Default for GeneResolutionConfig {
    fn default() -> Self {
        Self {
            hgnc: GeneServiceConfig::default(),
            refseq: GeneServiceConfig {
                rate_limit: 10.0,
                ..GeneServiceConfig::default()
            },
            ensembl: GeneServiceConfig {
                rate_limit: 15.0,
                ..GeneServiceConfig::default()
            },
            refseq_api_key: None,
            breaker: BreakerSettings::failover_chain(),
            transcript_cache_ttl: 24 * HOUR,
            memory_cache_ttl: 15 * MINUTE,
            max_memory_size: 1000,
            max_concurrency: 5,
        }
    }
}

impl GeneResolutionConfig {
    /// Effective RefSeq rate given whether an API key is configured.
    pub fn refseq_rate_limit(&self) -> f64 {
        match self.refseq_api_key.as_deref() {
            Some(key) if !key.is_empty() => self.refseq.rate_limit,
            _ => self.refseq.rate_limit.min(3.0),
        }
    }
}

impl EvidenceConfig {
    /// Check the invariants every consumer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.gather_timeout.is_zero() {
            return Err(EvidenceError::Config(
                "gather_timeout must be greater than zero".into(),
            ));
        }
        if self.cache.pool_size == 0 {
            return Err(EvidenceError::Config(
                "cache.pool_size must be at least 1".into(),
            ));
        }
        for kind in EvidenceKind::ALL {
            let service = self.sources.for_kind(kind);
            let name = kind.service_name();
            check_rate(name, service.rate_limit)?;
            check_breaker(name, &service.breaker)?;
            if service.timeout > self.gather_timeout {
                return Err(EvidenceError::Config(format!(
                    "{} timeout {:?} exceeds gather_timeout {:?}",
                    name, service.timeout, self.gather_timeout
                )));
            }
        }
        check_rate("HGNC", self.gene.hgnc.rate_limit)?;
        check_rate("RefSeq", self.gene.refseq.rate_limit)?;
        check_rate("Ensembl", self.gene.ensembl.rate_limit)?;
        check_breaker("gene failover", &self.gene.breaker)?;
        if self.gene.max_concurrency == 0 {
            return Err(EvidenceError::Config(
                "gene.max_concurrency must be at least 1".into(),
            ));
        }
        if self.gene.max_memory_size == 0 {
            return Err(EvidenceError::Config(
                "gene.max_memory_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file. `.json` files are read as JSON,
    /// anything else as TOML.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            return Self::from_json_str(&contents);
        }
        let config: Self = toml::from_str(&contents)
            .map_err(|e| EvidenceError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VARIANT_CACHE_URL`, `VARIANT_GATHER_TIMEOUT`
    /// and `VARIANT_CACHE_TTL` (seconds), and `NCBI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Like [`EvidenceConfig::from_env`], reading variables through `lookup`.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("VARIANT_CACHE_URL") {
            config.cache.url = url;
        }
        if let Some(secs) = lookup("VARIANT_GATHER_TIMEOUT") {
            config.gather_timeout = parse_secs("VARIANT_GATHER_TIMEOUT", &secs)?;
        }
        if let Some(secs) = lookup("VARIANT_CACHE_TTL") {
            config.cache.default_ttl = parse_secs("VARIANT_CACHE_TTL", &secs)?;
        }
        if let Some(key) = lookup("NCBI_API_KEY").filter(|key| !key.is_empty()) {
            config.gene.refseq_api_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| EvidenceError::Config(format!("{} must be whole seconds: {}", name, e)))
}

fn check_rate(name: &str, rate: f64) -> Result<()> {
    if rate > 0.0 && rate.is_finite() {
        Ok(())
    } else {
        Err(EvidenceError::Config(format!(
            "{} rate_limit must be a positive number, got {}",
            name, rate
        )))
    }
}

fn check_breaker(name: &str, settings: &BreakerSettings) -> Result<()> {
    if settings.max_half_open_requests == 0 {
        return Err(EvidenceError::Config(format!(
            "{} breaker needs at least one half-open request",
            name
        )));
    }
    match settings.trip {
        TripCondition::FailureRatio { ratio, .. } if !(ratio > 0.0 && ratio <= 1.0) => {
            Err(EvidenceError::Config(format!(
                "{} breaker ratio must be in (0, 1], got {}",
                name, ratio
            )))
        }
        TripCondition::ConsecutiveFailures(0) => Err(EvidenceError::Config(format!(
            "{} breaker needs at least one consecutive failure to trip",
            name
        ))),
        _ => Ok(()),
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: EvidenceConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EvidenceConfig::default(),
        }
    }

    pub fn gather_timeout(mut self, timeout: Duration) -> Self {
        self.config.gather_timeout = timeout;
        self
    }

    pub fn cache_url(mut self, url: impl Into<String>) -> Self {
        self.config.cache.url = url.into();
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.default_ttl = ttl;
        self
    }

    pub fn source(mut self, kind: EvidenceKind, service: ServiceConfig) -> Self {
        *self.config.sources.for_kind_mut(kind) = service;
        self
    }

    pub fn refseq_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.gene.refseq_api_key = Some(key.into());
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.gene.max_concurrency = n;
        self
    }

    pub fn build(self) -> Result<EvidenceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvidenceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gather_timeout, Duration::from_secs(30));
        assert_eq!(config.gene.max_concurrency, 5);
        assert_eq!(config.sources.pubmed.rate_limit, 3.0);
    }

    #[test]
    fn test_ttl_defaults_per_source() {
        let sources = SourcesConfig::default();
        assert_eq!(sources.clinvar.cache_ttl, DAY);
        assert_eq!(sources.gnomad.cache_ttl, 7 * DAY);
        assert_eq!(sources.hgmd.cache_ttl, 7 * DAY);
        assert_eq!(sources.lovd.cache_ttl, DAY);
        assert_eq!(
            GeneResolutionConfig::default().transcript_cache_ttl,
            24 * HOUR
        );
    }

    #[test]
    fn test_breaker_presets_per_source() {
        let sources = SourcesConfig::default();
        assert_eq!(sources.hgmd.breaker.open_timeout, Duration::from_secs(90));
        assert_eq!(
            sources.pubmed.breaker.trip,
            TripCondition::FailureRatio {
                min_requests: 2,
                ratio: 0.5
            }
        );
        assert_eq!(
            GeneResolutionConfig::default().breaker.trip,
            TripCondition::ConsecutiveFailures(5)
        );
    }

    #[test]
    fn test_refseq_rate_depends_on_key() {
        let mut gene = GeneResolutionConfig::default();
        assert_eq!(gene.refseq_rate_limit(), 3.0);
        gene.refseq_api_key = Some("secret".into());
        assert_eq!(gene.refseq_rate_limit(), 10.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EvidenceConfig::default();
        config.sources.cosmic.rate_limit = 0.0;
        assert!(matches!(config.validate(), Err(EvidenceError::Config(_))));

        let mut config = EvidenceConfig::default();
        config.sources.clinvar.breaker.trip = TripCondition::FailureRatio {
            min_requests: 3,
            ratio: 1.5,
        };
        assert!(config.validate().is_err());

        let mut config = EvidenceConfig::default();
        config.gene.breaker.max_half_open_requests = 0;
        assert!(config.validate().is_err());

        let err = ConfigBuilder::new()
            .gather_timeout(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exceeds gather_timeout"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EvidenceConfig::from_json_str(
            r#"{"gene": {"max_concurrency": 8}, "cache": {"pool_size": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.gene.max_concurrency, 8);
        assert_eq!(config.cache.pool_size, 2);
        assert_eq!(config.cache.max_retries, 3);
        assert_eq!(config.sources.gnomad.cache_ttl, 7 * DAY);
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.toml");
        std::fs::write(
            &path,
            "[cache]\nurl = \"sqlite::memory:\"\npool_size = 1\n\n[gene]\nrefseq_api_key = \"k\"\n",
        )
        .unwrap();
        let config = EvidenceConfig::from_file(&path).unwrap();
        assert_eq!(config.cache.url, "sqlite::memory:");
        assert_eq!(config.gene.refseq_rate_limit(), 10.0);
    }

    #[test]
    fn test_cache_retry_config() {
        let cache = CacheConfig {
            max_retries: 7,
            ..CacheConfig::default()
        };
        let retry = cache.retry_config();
        assert_eq!(retry.max_retries, 7);
        assert!(retry.jitter);
    }

    #[test]
    fn test_from_env_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("VARIANT_CACHE_URL", "sqlite://evidence.db"),
            ("VARIANT_GATHER_TIMEOUT", "45"),
            ("VARIANT_CACHE_TTL", " 600 "),
            ("NCBI_API_KEY", "abc123"),
        ]
        .into_iter()
        .collect();
        let config =
            EvidenceConfig::from_env_with(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.cache.url, "sqlite://evidence.db");
        assert_eq!(config.gather_timeout, Duration::from_secs(45));
        assert_eq!(config.cache.default_ttl, Duration::from_secs(600));
        assert_eq!(config.gene.refseq_api_key.as_deref(), Some("abc123"));
        assert_eq!(config.gene.refseq_rate_limit(), 10.0);
    }

    #[test]
    fn test_from_env_without_variables_is_default() {
        let config = EvidenceConfig::from_env_with(|_| None).unwrap();
        assert_eq!(config.gather_timeout, Duration::from_secs(30));
        assert!(config.gene.refseq_api_key.is_none());

        let empty_key = EvidenceConfig::from_env_with(|name| {
            (name == "NCBI_API_KEY").then(String::new)
        })
        .unwrap();
        assert!(empty_key.gene.refseq_api_key.is_none());
    }

    #[test]
    fn test_from_env_rejects_bad_values() {
        let err = EvidenceConfig::from_env_with(|name| {
            (name == "VARIANT_GATHER_TIMEOUT").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("VARIANT_GATHER_TIMEOUT"), "{err}");

        let err = EvidenceConfig::from_env_with(|name| {
            (name == "VARIANT_GATHER_TIMEOUT").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("gather_timeout"), "{err}");
    }

    #[test]
    fn test_transcript_memory_tier_defaults() {
        let gene = GeneResolutionConfig::default();
        assert_eq!(gene.memory_cache_ttl, 15 * MINUTE);
        assert_eq!(gene.max_memory_size, 1000);

        let mut config = EvidenceConfig::default();
        config.gene.max_memory_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_memory_size"), "{err}");
    }
}

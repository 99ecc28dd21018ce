//! # Variant Evidence
//!
//! Resilience and aggregation layer for clinical variant interpretation. It
//! gathers supporting evidence for a variant from several independent, unreliable
//! knowledge bases, and resolves gene symbols to canonical transcripts through
//! redundant nomenclature services.
//!
//! ## Core Concepts
//!
//! - **Source adapters**: one [`ExternalSourceClient`] per knowledge base, one
//!   [`GeneSource`] per gene service. Only the wire calls live here.
//! - **Resilient clients**: [`ResilientServiceClient`] puts a cache, a circuit
//!   breaker and a rate limiter around an adapter. It is also a tower `Service`.
//! - **Aggregation**: [`EvidenceAggregator`] fans a variant out to all six sources
//!   and returns whatever succeeded. Only a total failure is an error.
//! - **Failover**: [`GeneResolutionClient`] tries HGNC, RefSeq and Ensembl in order
//!   behind one breaker; [`CachedTranscriptResolver`] caches its answers.
//! - **Static DI**: breakers, limiters and the cache are built once and shared.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use variant_evidence::{
//!     CacheStore, EvidenceAggregator, EvidenceConfig, QueryContext, SourceAdapters,
//!     SqliteCacheBackend, Variant,
//! };
//!
//! # async fn example(adapters: SourceAdapters) -> variant_evidence::Result<()> {
//! let config = EvidenceConfig::from_file("evidence.toml")?;
//! let backend = Arc::new(SqliteCacheBackend::new(&config.cache).await?);
//! let cache = CacheStore::new(backend, config.cache.default_ttl);
//!
//! let aggregator = EvidenceAggregator::from_config(adapters, &config, cache);
//! let variant = Variant::new("17", 43104121, "G", "A");
//! let bundle = aggregator
//!     .gather_evidence(&QueryContext::background(), &variant)
//!     .await?;
//! println!("populated: {:?}", bundle.populated_kinds());
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod evidence;
pub mod gene;
pub mod resilience;
pub mod retry;
pub mod source;
pub mod variant;

// Public re-exports for convenience
pub use aggregator::{AggregatorStats, EvidenceAggregator, EvidenceSources, HealthReport, SourceAdapters};
pub use cache::{CacheBackend, CacheKey, CacheStats, CacheStore, MemoryCacheBackend, SqliteCacheBackend};
pub use client::{ResilientServiceClient, SourceRequest};
pub use config::EvidenceConfig;
pub use context::{CancelHandle, QueryContext};
pub use error::{EvidenceError, Result, SourceFailure};
pub use evidence::{Evidence, EvidenceBundle, EvidenceKind};
pub use gene::{
    CachedTranscriptResolver, GeneResolutionClient, GeneService, GeneSource,
    GeneTranscriptResolver, GeneValidationResult, TranscriptInfo,
};
pub use resilience::{BreakerSettings, CircuitBreaker, CircuitState, RateLimiter};
pub use source::ExternalSourceClient;
pub use variant::{Variant, VariantKey};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_imports() {
        let _ = std::mem::size_of::<EvidenceError>();
        let _ = std::mem::size_of::<EvidenceBundle>();
    }
}

//! Gene symbol and canonical transcript resolution
//!
//! What this module provides
//! - The [`GeneSource`] contract implemented by each gene nomenclature service
//! - [`GeneResolutionClient`]: priority-ordered failover HGNC → RefSeq → Ensembl
//!   behind one outer circuit breaker
//! - [`CachedTranscriptResolver`]: symbol normalisation, caching, batch resolution
//!
//! Exports
//! - Models: `GeneService`, `TranscriptType`, `TranscriptInfo`, `TranscriptMetadata`,
//!   `GeneValidationResult`, `ServiceHealth`, `ResolverStats`
//! - Traits: `GeneSource`, `GeneTranscriptResolver`
//! - Decorators: `RateLimitedGeneSource`

mod failover;
mod resolver;

pub use failover::GeneResolutionClient;
pub use resolver::{CachedTranscriptResolver, GeneTranscriptResolver, ResolverStats};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::QueryContext;
use crate::error::Result;
use crate::resilience::RateLimiter;

/// The gene services, in failover priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeneService {
    #[serde(rename = "HGNC")]
    Hgnc,
    #[serde(rename = "RefSeq")]
    RefSeq,
    #[serde(rename = "Ensembl")]
    Ensembl,
}

impl GeneService {
    pub const PRIORITY: [GeneService; 3] =
        [GeneService::Hgnc, GeneService::RefSeq, GeneService::Ensembl];

    pub fn as_str(&self) -> &'static str {
        match self {
            GeneService::Hgnc => "HGNC",
            GeneService::RefSeq => "RefSeq",
            GeneService::Ensembl => "Ensembl",
        }
    }
}

impl fmt::Display for GeneService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptType {
    Canonical,
    Alternative,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    pub chromosome_location: String,
    pub genomic_coordinates: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hgnc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A resolved transcript. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptInfo {
    pub refseq_id: String,
    pub gene_symbol: String,
    #[serde(rename = "type")]
    pub transcript_type: TranscriptType,
    pub length: u32,
    pub source: GeneService,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: TranscriptMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneValidationResult {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub normalized_symbol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    pub source: GeneService,
}

impl GeneValidationResult {
    /// The answer given when no service could validate the symbol.
    pub fn unverified(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            normalized_symbol: String::new(),
            suggestions: vec![
                "Check gene symbol spelling".to_string(),
                "Verify gene symbol is approved by HGNC".to_string(),
            ],
            deprecated_from: None,
            validation_errors: errors,
            source: GeneService::Hgnc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: GeneService,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One gene nomenclature service.
#[async_trait]
pub trait GeneSource: Send + Sync {
    fn service(&self) -> GeneService;

    async fn get_canonical_transcript(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<TranscriptInfo>;

    async fn validate_gene_symbol(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<GeneValidationResult>;
}

#[async_trait]
impl<T> GeneSource for Arc<T>
where
    T: GeneSource + ?Sized,
{
    fn service(&self) -> GeneService {
        (**self).service()
    }

    async fn get_canonical_transcript(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<TranscriptInfo> {
        (**self).get_canonical_transcript(ctx, symbol).await
    }

    async fn validate_gene_symbol(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<GeneValidationResult> {
        (**self).validate_gene_symbol(ctx, symbol).await
    }
}

/// Takes a token from a shared [`RateLimiter`] before each call to the wrapped service.
pub struct RateLimitedGeneSource<G> {
    inner: G,
    limiter: Arc<RateLimiter>,
}

impl<G> RateLimitedGeneSource<G> {
    pub fn new(inner: G, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<G: GeneSource> GeneSource for RateLimitedGeneSource<G> {
    fn service(&self) -> GeneService {
        self.inner.service()
    }

    async fn get_canonical_transcript(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<TranscriptInfo> {
        self.limiter.acquire(ctx).await?;
        self.inner.get_canonical_transcript(ctx, symbol).await
    }

    async fn validate_gene_symbol(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<GeneValidationResult> {
        self.limiter.acquire(ctx).await?;
        self.inner.validate_gene_symbol(ctx, symbol).await
    }
}

//! Evidence payloads and the aggregated bundle
//!
//! Each external source returns one typed payload. The payload type is bound to
//! its [`EvidenceKind`] through the [`Evidence`] trait, which is what lets a
//! single generic client serve all six sources.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// The six evidence categories gathered per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    ClinicalSignificance,
    PopulationFrequency,
    Somatic,
    Literature,
    GeneSpecificDatabase,
    MutationDatabase,
}

impl EvidenceKind {
    pub const ALL: [EvidenceKind; 6] = [
        EvidenceKind::ClinicalSignificance,
        EvidenceKind::PopulationFrequency,
        EvidenceKind::Somatic,
        EvidenceKind::Literature,
        EvidenceKind::GeneSpecificDatabase,
        EvidenceKind::MutationDatabase,
    ];

    /// Name of the service backing this kind; also used as the breaker name.
    pub fn service_name(&self) -> &'static str {
        match self {
            EvidenceKind::ClinicalSignificance => "ClinVar",
            EvidenceKind::PopulationFrequency => "gnomAD",
            EvidenceKind::Somatic => "COSMIC",
            EvidenceKind::Literature => "PubMed",
            EvidenceKind::GeneSpecificDatabase => "LOVD",
            EvidenceKind::MutationDatabase => "HGMD",
        }
    }

    pub fn cache_prefix(&self) -> &'static str {
        match self {
            EvidenceKind::ClinicalSignificance => "clinvar",
            EvidenceKind::PopulationFrequency => "population",
            EvidenceKind::Somatic => "somatic",
            EvidenceKind::Literature => "literature",
            EvidenceKind::GeneSpecificDatabase => "lovd",
            EvidenceKind::MutationDatabase => "hgmd",
        }
    }

    /// Default time-to-live of cached payloads of this kind.
    pub fn default_ttl(&self) -> Duration {
        match self {
            EvidenceKind::PopulationFrequency | EvidenceKind::MutationDatabase => {
                Duration::from_secs(7 * DAY)
            }
            _ => Duration::from_secs(DAY),
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// A payload produced by one external source.
pub trait Evidence: Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static {
    const KIND: EvidenceKind;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClinVarSubmission {
    pub submitter: String,
    pub clinical_significance: String,
    pub review_status: String,
    pub submission_date: Option<DateTime<Utc>>,
    pub condition: String,
}

/// Clinical significance assertions (ClinVar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClinVarData {
    pub variation_id: String,
    pub clinical_significance: String,
    pub review_status: String,
    #[serde(default)]
    pub submissions: Vec<ClinVarSubmission>,
    pub last_evaluated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QualityMetrics {
    pub coverage: u32,
    pub quality: f64,
    pub filter_pass: bool,
}

/// Population allele frequencies (gnomAD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PopulationData {
    pub allele_frequency: f64,
    pub allele_count: u64,
    pub allele_number: u64,
    #[serde(default)]
    pub population_frequencies: HashMap<String, f64>,
    pub homozygote_count: u64,
    pub quality_metrics: Option<QualityMetrics>,
}

/// Somatic occurrence in tumours (COSMIC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SomaticData {
    pub cosmic_id: String,
    #[serde(default)]
    pub tumor_types: Vec<String>,
    pub sample_count: u64,
    pub mutation_count: u64,
    pub pathogenicity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Citation {
    pub pmid: String,
    pub title: String,
    pub journal: String,
    pub year: Option<i32>,
}

/// Literature search results (PubMed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LiteratureData {
    pub total_citations: u32,
    pub retrieved_citations: u32,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub search_query: String,
    pub high_impact_citations: u32,
    pub recent_citations: u32,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Gene-specific curated database entry (LOVD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LovdData {
    pub variant_id: String,
    pub gene_specific_db: String,
    pub classification: String,
    pub clinical_description: String,
    pub phenotype: String,
    pub pathogenicity: String,
    #[serde(default)]
    pub references: Vec<String>,
    pub submission_date: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Professional mutation database entry (HGMD).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HgmdData {
    pub accession_number: String,
    pub category: String,
    pub phenotype: String,
    pub reference: String,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Evidence for ClinVarData {
    const KIND: EvidenceKind = EvidenceKind::ClinicalSignificance;
}
impl Evidence for PopulationData {
    const KIND: EvidenceKind = EvidenceKind::PopulationFrequency;
}
impl Evidence for SomaticData {
    const KIND: EvidenceKind = EvidenceKind::Somatic;
}
impl Evidence for LiteratureData {
    const KIND: EvidenceKind = EvidenceKind::Literature;
}
impl Evidence for LovdData {
    const KIND: EvidenceKind = EvidenceKind::GeneSpecificDatabase;
}
impl Evidence for HgmdData {
    const KIND: EvidenceKind = EvidenceKind::MutationDatabase;
}

/// Evidence gathered for one variant. A field is set only when its source answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub gather_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinical_significance: Option<ClinVarData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population_frequency: Option<PopulationData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub somatic: Option<SomaticData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literature: Option<LiteratureData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gene_specific_database: Option<LovdData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_database: Option<HgmdData>,
    pub gathered_at: DateTime<Utc>,
}

impl EvidenceBundle {
    pub fn empty(gather_id: Uuid, gathered_at: DateTime<Utc>) -> Self {
        Self {
            gather_id,
            clinical_significance: None,
            population_frequency: None,
            somatic: None,
            literature: None,
            gene_specific_database: None,
            mutation_database: None,
            gathered_at,
        }
    }

    pub fn has(&self, kind: EvidenceKind) -> bool {
        match kind {
            EvidenceKind::ClinicalSignificance => self.clinical_significance.is_some(),
            EvidenceKind::PopulationFrequency => self.population_frequency.is_some(),
            EvidenceKind::Somatic => self.somatic.is_some(),
            EvidenceKind::Literature => self.literature.is_some(),
            EvidenceKind::GeneSpecificDatabase => self.gene_specific_database.is_some(),
            EvidenceKind::MutationDatabase => self.mutation_database.is_some(),
        }
    }

    /// Kinds present in this bundle, in [`EvidenceKind::ALL`] order.
    pub fn populated_kinds(&self) -> Vec<EvidenceKind> {
        EvidenceKind::ALL
            .into_iter()
            .filter(|k| self.has(*k))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.populated_kinds().is_empty()
    }
}

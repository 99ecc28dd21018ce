//! Variant identity
//!
//! A [`Variant`] is addressed by a [`VariantKey`]: a SHA-256 over the genomic
//! coordinates and all three HGVS representations. The key depends only on
//! those fields, so two independently built values for the same variant land
//! in the same cache slot.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A standardized variant as handed to external sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Variant {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternative: String,
    pub hgvs_genomic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hgvs_coding: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hgvs_protein: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_id: Option<String>,
}

impl Variant {
    pub fn new(
        chromosome: impl Into<String>,
        position: u64,
        reference: impl Into<String>,
        alternative: impl Into<String>,
    ) -> Self {
        Self {
            chromosome: chromosome.into(),
            position,
            reference: reference.into(),
            alternative: alternative.into(),
            ..Default::default()
        }
    }

    pub fn with_hgvs(
        mut self,
        genomic: impl Into<String>,
        coding: impl Into<String>,
        protein: impl Into<String>,
    ) -> Self {
        self.hgvs_genomic = genomic.into();
        self.hgvs_coding = coding.into();
        self.hgvs_protein = protein.into();
        self
    }

    pub fn with_gene(mut self, symbol: impl Into<String>) -> Self {
        self.gene_symbol = Some(symbol.into());
        self
    }

    /// Deterministic identity key of this variant.
    pub fn key(&self) -> VariantKey {
        VariantKey::of(self)
    }
}

/// SHA-256 digest of the identity fields of a [`Variant`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey([u8; 32]);

impl VariantKey {
    /// Each field is hashed behind its little-endian `u64` length, so no
    /// choice of field contents can make two variants collide.
    pub fn of(variant: &Variant) -> Self {
        let position = variant.position.to_string();
        let fields = [
            variant.chromosome.as_str(),
            position.as_str(),
            variant.reference.as_str(),
            variant.alternative.as_str(),
            variant.hgvs_genomic.as_str(),
            variant.hgvs_coding.as_str(),
            variant.hgvs_protein.as_str(),
        ];
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex of the first `n` bytes (clamped to 32).
    pub fn short_hex(&self, n: usize) -> String {
        to_hex(&self.0[..n.min(self.0.len())])
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl fmt::Debug for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariantKey({})", self.short_hex(8))
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

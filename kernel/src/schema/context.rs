//! Context items fed to the planning collaborator.

use serde::{Deserialize, Serialize};

use super::{check_non_empty, check_permille, SchemaViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    /// Never evicted automatically. Holds the run's goal statement.
    Pinned,
    /// Bounded by the working-set budget; evicted least-relevant-first.
    Working,
    /// Addressable by reference; content is not held in active memory.
    LongTerm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    pub tier: ContextTier,
    pub reference: String,
    pub content: String,
    pub added_at_ms: u64,
    /// Relevance in permille.
    pub relevance: u32,
}

impl ContextItem {
    #[must_use]
    pub fn new(
        tier: ContextTier,
        reference: impl Into<String>,
        content: impl Into<String>,
        relevance: u32,
    ) -> Self {
        Self {
            tier,
            reference: reference.into(),
            content: content.into(),
            added_at_ms: 0,
            relevance,
        }
    }

    /// Size charged against the working-set budget (content bytes).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub(crate) fn validate(&self, event_type: &'static str) -> Result<(), SchemaViolation> {
        check_non_empty(event_type, "context reference", &self.reference)?;
        check_permille(event_type, "relevance", self.relevance)
    }
}

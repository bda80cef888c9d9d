//! Named, versioned task outputs and their index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use crate::proof::hash::{canonical_hash, ContentHash, HashDomain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Text,
    Structured,
}

/// An indexed artifact. `id` is `"<name>@v<version>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub kind: ArtifactKind,
    pub content_hash: ContentHash,
    pub content: String,
    pub produced_by: TaskId,
}

impl Artifact {
    #[must_use]
    pub fn new(
        name: &str,
        version: u32,
        kind: ArtifactKind,
        content: String,
        produced_by: TaskId,
    ) -> Self {
        Self {
            id: format!("{name}@v{version}"),
            name: name.to_string(),
            version,
            kind,
            content_hash: canonical_hash(HashDomain::ArtifactContent, content.as_bytes()),
            content,
            produced_by,
        }
    }
}

/// Artifacts by id, plus the latest version per name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtifactIndex {
    by_id: BTreeMap<String, Artifact>,
    latest: BTreeMap<String, u32>,
}

impl ArtifactIndex {
    /// Version the next artifact called `name` will receive.
    #[must_use]
    pub fn next_version(&self, name: &str) -> u32 {
        self.latest.get(name).map_or(1, |v| v + 1)
    }

    pub fn record(&mut self, artifact: Artifact) {
        let entry = self.latest.entry(artifact.name.clone()).or_insert(0);
        *entry = (*entry).max(artifact.version);
        self.by_id.insert(artifact.id.clone(), artifact);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Artifact> {
        self.by_id.get(id)
    }

    /// Latest version of the artifact called `name`.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<&Artifact> {
        let version = self.latest.get(name)?;
        self.by_id.get(&format!("{name}@v{version}"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.by_id.values()
    }
}

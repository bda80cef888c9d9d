//! Tiered context: pinned goal, bounded working set, long-term references.
//!
//! The working set is bounded by `RunConfig::working_set_budget` bytes. When
//! an addition would overflow it, the least relevant items are evicted first
//! (oldest first on ties), each eviction logged before the addition.
//!
//! Long-term items keep only a digest and the index of the event that added
//! them; [`recall`] reads the content back from the log and checks it.
//!
//! Drift is the Jaccard token distance between the working set and the
//! pinned items, in permille. Detecting drift records an event and asks the
//! governor for a review; it never halts the run.

use std::collections::BTreeSet;

use keel_kernel::event::EventPayload;
use keel_kernel::materialize::KernelState;
use keel_kernel::proof::hash::{canonical_hash, HashDomain};
use keel_kernel::schema::{permille, ContextItem, ContextTier, PERMILLE_MAX};
use keel_kernel::store::EventBackend;

use crate::error::ContextError;
use crate::journal::Journal;

/// Shortest token that counts for drift and relevance.
const MIN_TOKEN_LEN: usize = 3;

/// Pin `content` under `reference`. Pinned items are never evicted.
///
/// # Errors
///
/// Store errors.
pub fn pin<B: EventBackend>(
    journal: &mut Journal<B>,
    reference: &str,
    content: &str,
) -> Result<(), ContextError> {
    if !journal.state().is_started() {
        return Err(ContextError::NotStarted);
    }
    journal.record(EventPayload::ContextPinned {
        item: ContextItem::new(ContextTier::Pinned, reference, content, PERMILLE_MAX),
    })?;
    Ok(())
}

/// Add an item to the working set, evicting until it fits. Returns the
/// references evicted, in eviction order.
///
/// # Errors
///
/// [`ContextError::ItemTooLarge`] if the item alone exceeds the budget,
/// [`ContextError::DuplicateReference`] if the reference is already in the
/// working set. Nothing is appended on error.
pub fn add_working<B: EventBackend>(
    journal: &mut Journal<B>,
    reference: &str,
    content: &str,
    relevance: u32,
) -> Result<Vec<String>, ContextError> {
    let state = journal.state();
    let budget = state
        .config()
        .ok_or(ContextError::NotStarted)?
        .working_set_budget;
    let item = ContextItem::new(
        ContextTier::Working,
        reference,
        content,
        relevance.min(PERMILLE_MAX),
    );
    if item.size() > budget {
        return Err(ContextError::ItemTooLarge {
            reference: reference.to_string(),
            size: item.size(),
            budget,
        });
    }
    if state.context.working_item(reference).is_some() {
        return Err(ContextError::DuplicateReference {
            reference: reference.to_string(),
        });
    }

    let victims = eviction_order(state, item.size(), budget);
    for victim in &victims {
        journal.record(EventPayload::ContextEvicted {
            reference: victim.reference.clone(),
            relevance: victim.relevance,
            freed_bytes: victim.size(),
        })?;
        tracing::debug!(
            reference = %victim.reference,
            relevance = victim.relevance,
            freed = victim.size(),
            "context evicted"
        );
    }
    journal.record(EventPayload::ContextAdded { item })?;
    Ok(victims.into_iter().map(|v| v.reference).collect())
}

/// Items to evict so that `incoming` bytes fit, lowest relevance then
/// oldest first.
fn eviction_order(state: &KernelState, incoming: u64, budget: u64) -> Vec<ContextItem> {
    let mut candidates: Vec<&ContextItem> = state.context.working.iter().collect();
    candidates.sort_by(|a, b| {
        a.relevance
            .cmp(&b.relevance)
            .then(a.added_at_ms.cmp(&b.added_at_ms))
            .then_with(|| a.reference.cmp(&b.reference))
    });
    let mut used = state.context.working_bytes;
    let mut victims = Vec::new();
    for candidate in candidates {
        if used.saturating_add(incoming) <= budget {
            break;
        }
        used = used.saturating_sub(candidate.size());
        victims.push(candidate.clone());
    }
    victims
}

/// Move a working item to long-term storage.
///
/// # Errors
///
/// [`ContextError::UnknownReference`] if it is not in the working set.
pub fn promote_to_long_term<B: EventBackend>(
    journal: &mut Journal<B>,
    reference: &str,
) -> Result<(), ContextError> {
    if journal.state().context.working_item(reference).is_none() {
        return Err(ContextError::UnknownReference {
            reference: reference.to_string(),
            tier: "working",
        });
    }
    journal.record(EventPayload::ContextPromoted {
        reference: reference.to_string(),
    })?;
    Ok(())
}

/// Read a long-term item back from the log.
///
/// # Errors
///
/// [`ContextError::UnknownReference`] if nothing is stored under
/// `reference`, [`ContextError::DigestMismatch`] if the logged content no
/// longer hashes to the recorded digest.
pub fn recall<B: EventBackend>(
    journal: &Journal<B>,
    reference: &str,
) -> Result<ContextItem, ContextError> {
    let entry = journal
        .state()
        .context
        .long_term
        .get(reference)
        .ok_or_else(|| ContextError::UnknownReference {
            reference: reference.to_string(),
            tier: "long-term",
        })?;
    let events = journal.read_from(entry.source_event)?;
    let item = events
        .first()
        .filter(|e| e.index == entry.source_event)
        .and_then(|e| match &e.payload {
            EventPayload::ContextAdded { item } if item.reference == reference => {
                Some(item.clone())
            }
            _ => None,
        })
        .ok_or_else(|| ContextError::DigestMismatch {
            reference: reference.to_string(),
        })?;
    if canonical_hash(HashDomain::ArtifactContent, item.content.as_bytes()) != entry.digest {
        return Err(ContextError::DigestMismatch {
            reference: reference.to_string(),
        });
    }
    Ok(ContextItem {
        tier: ContextTier::LongTerm,
        relevance: entry.relevance,
        ..item
    })
}

/// Context handed to the planner: every pinned item, then working items by
/// relevance (newest first on ties) while they fit in `budget` bytes.
#[must_use]
pub fn get_active_context(state: &KernelState, budget: u64) -> Vec<ContextItem> {
    let mut out: Vec<ContextItem> = state.context.pinned.clone();
    let mut used: u64 = out.iter().map(ContextItem::size).sum();

    let mut working: Vec<&ContextItem> = state.context.working.iter().collect();
    working.sort_by(|a, b| {
        b.relevance
            .cmp(&a.relevance)
            .then(b.added_at_ms.cmp(&a.added_at_ms))
            .then_with(|| a.reference.cmp(&b.reference))
    });
    for item in working {
        let next = used.saturating_add(item.size());
        if next > budget {
            continue;
        }
        used = next;
        out.push(item.clone());
    }
    out
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard distance between two token sets, permille. Two empty sets are
/// identical.
fn jaccard_distance(a: &BTreeSet<String>, b: &BTreeSet<String>) -> u32 {
    let union = a.union(b).count() as u64;
    if union == 0 {
        return 0;
    }
    let shared = a.intersection(b).count() as u64;
    PERMILLE_MAX - permille(shared, union)
}

fn pinned_tokens(state: &KernelState) -> BTreeSet<String> {
    state
        .context
        .pinned
        .iter()
        .flat_map(|i| tokens(&i.content))
        .collect()
}

/// Similarity of `content` to the pinned items, permille.
#[must_use]
pub fn relevance_to_goal(state: &KernelState, content: &str) -> u32 {
    let goal = pinned_tokens(state);
    let words = tokens(content);
    if goal.is_empty() || words.is_empty() {
        return 0;
    }
    let shared = goal.intersection(&words).count() as u64;
    permille(shared, words.len() as u64)
}

/// Distance of the working set from the pinned goal, permille. An empty
/// working set has not drifted.
#[must_use]
pub fn drift_distance(state: &KernelState) -> u32 {
    let working: BTreeSet<String> = state
        .context
        .working
        .iter()
        .flat_map(|i| tokens(&i.content))
        .collect();
    if working.is_empty() {
        return 0;
    }
    jaccard_distance(&working, &pinned_tokens(state))
}

/// Record drift if the working set is further from the goal than the run's
/// threshold and no earlier signal is still awaiting review. Returns the
/// distance when a signal was recorded.
///
/// # Errors
///
/// Store errors.
pub fn check_drift<B: EventBackend>(journal: &mut Journal<B>) -> Result<Option<u32>, ContextError> {
    let state = journal.state();
    let threshold = state.config().ok_or(ContextError::NotStarted)?.drift_threshold;
    if state.drift.as_ref().is_some_and(|d| d.review_pending) {
        return Ok(None);
    }
    let distance = drift_distance(state);
    if distance <= threshold {
        return Ok(None);
    }
    journal.record(EventPayload::DriftDetected {
        distance,
        threshold,
    })?;
    tracing::warn!(distance, threshold, "context drift detected");
    Ok(Some(distance))
}

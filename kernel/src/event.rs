//! `EventV1`: the only write target of the system.
//!
//! Every state change is an event appended to a run's log. Events form a
//! hash chain: each commits to its predecessor's hash, and the first commits
//! to the well-known genesis hash.
//!
//! ```text
//! hash = sha256(KEEL::EVENT_CHAIN::V1\0 ‖ raw(prev_hash) ‖ canonical_json(body))
//! body = {index, run_id, timestamp_ms, payload: {type, data}}
//! ```
//!
//! `hash` and `prev_hash` themselves are not part of the body.

use serde::{Deserialize, Serialize};

use crate::proof::canon::{canonical_bytes, CanonError};
use crate::proof::hash::{chained_hash, ContentHash, HashDomain};
use crate::schema::{
    check_non_empty, check_permille, Artifact, ArtifactKind, AuditResult, AutonomyMode,
    CollaboratorStage, ContextItem, ContextTier, FailureReason, PlannedAction, ResourceCost,
    RiskRule, RunConfig, RunId, RunStatus, SchemaViolation, Severity, StopReason, TaskId,
    TaskResult, TaskSpec, VerificationResult,
};

/// Mutations of the task DAG and queue ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueMutation {
    Enqueued {
        task_id: TaskId,
        spec: TaskSpec,
        priority: i64,
        depends_on: Vec<TaskId>,
    },
    DependencyAdded {
        task_id: TaskId,
        depends_on: TaskId,
    },
    Reprioritized {
        task_id: TaskId,
        priority: i64,
    },
}

/// Closed set of event payloads. The materializer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        goal: String,
        config: RunConfig,
    },
    QueueMutation(QueueMutation),
    ConfirmationRequested {
        task_id: TaskId,
        action: PlannedAction,
        rule: RiskRule,
    },
    ConfirmationReceived {
        task_id: TaskId,
        approved: bool,
        operator: String,
    },
    /// Authorized action entering execution; `reservation` is held against
    /// the budget until the task settles.
    TaskRunning {
        task_id: TaskId,
        task_kind: String,
        action: PlannedAction,
        reservation: ResourceCost,
    },
    TaskVerifying {
        task_id: TaskId,
        result: TaskResult,
    },
    TaskCompleted {
        task_id: TaskId,
        verification: VerificationResult,
        usage: ResourceCost,
    },
    /// `usage` is charged against the reservation if the task was running.
    TaskFailed {
        task_id: TaskId,
        reason: FailureReason,
        usage: Option<ResourceCost>,
    },
    TaskBlocked {
        task_id: TaskId,
        blocked_by: TaskId,
    },
    CollaboratorRetry {
        task_id: TaskId,
        stage: CollaboratorStage,
        attempt: u32,
        not_before_ms: u64,
        detail: String,
    },
    AuditRecorded {
        audit: AuditResult,
    },
    ArtifactRecorded {
        artifact: Artifact,
    },
    ContextPinned {
        item: ContextItem,
    },
    ContextAdded {
        item: ContextItem,
    },
    ContextEvicted {
        reference: String,
        relevance: u32,
        freed_bytes: u64,
    },
    ContextPromoted {
        reference: String,
    },
    DriftDetected {
        distance: u32,
        threshold: u32,
    },
    AutonomyChanged {
        from: AutonomyMode,
        to: AutonomyMode,
        reason: String,
    },
    /// A drift signal the governor reviewed without changing the mode.
    DriftReviewed {
        distance: u32,
        mode: AutonomyMode,
    },
    StopRequested {
        reason: StopReason,
    },
    RunStatusChanged {
        status: RunStatus,
    },
}

impl EventPayload {
    /// Wire name of the variant (the `type` tag).
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::QueueMutation(_) => "queue_mutation",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::ConfirmationReceived { .. } => "confirmation_received",
            Self::TaskRunning { .. } => "task_running",
            Self::TaskVerifying { .. } => "task_verifying",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskBlocked { .. } => "task_blocked",
            Self::CollaboratorRetry { .. } => "collaborator_retry",
            Self::AuditRecorded { .. } => "audit_recorded",
            Self::ArtifactRecorded { .. } => "artifact_recorded",
            Self::ContextPinned { .. } => "context_pinned",
            Self::ContextAdded { .. } => "context_added",
            Self::ContextEvicted { .. } => "context_evicted",
            Self::ContextPromoted { .. } => "context_promoted",
            Self::DriftDetected { .. } => "drift_detected",
            Self::AutonomyChanged { .. } => "autonomy_changed",
            Self::DriftReviewed { .. } => "drift_reviewed",
            Self::StopRequested { .. } => "stop_requested",
            Self::RunStatusChanged { .. } => "run_status_changed",
        }
    }

    /// The task this event is about, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::QueueMutation(
                QueueMutation::Enqueued { task_id, .. }
                | QueueMutation::DependencyAdded { task_id, .. }
                | QueueMutation::Reprioritized { task_id, .. },
            )
            | Self::ConfirmationRequested { task_id, .. }
            | Self::ConfirmationReceived { task_id, .. }
            | Self::TaskRunning { task_id, .. }
            | Self::TaskVerifying { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskBlocked { task_id, .. }
            | Self::CollaboratorRetry { task_id, .. } => Some(task_id),
            Self::AuditRecorded { audit } => Some(&audit.task_id),
            Self::ArtifactRecorded { artifact } => Some(&artifact.produced_by),
            Self::RunStarted { .. }
            | Self::ContextPinned { .. }
            | Self::ContextAdded { .. }
            | Self::ContextEvicted { .. }
            | Self::ContextPromoted { .. }
            | Self::DriftDetected { .. }
            | Self::AutonomyChanged { .. }
            | Self::DriftReviewed { .. }
            | Self::StopRequested { .. }
            | Self::RunStatusChanged { .. } => None,
        }
    }

    /// Check the payload against the schema for its type.
    ///
    /// This is structural validation only. Whether the payload makes sense
    /// against the current state (known task ids, legal transitions) is the
    /// materializer's concern.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaViolation`] describing the first offending field.
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        let ty = self.event_type();
        match self {
            Self::RunStarted { goal, config } => {
                check_non_empty(ty, "goal", goal)?;
                config.validate(ty)
            }
            Self::QueueMutation(mutation) => validate_mutation(ty, mutation),
            Self::ConfirmationRequested {
                task_id, action, ..
            } => {
                check_non_empty(ty, "task_id", task_id.as_str())?;
                action.validate(ty)
            }
            Self::ConfirmationReceived {
                task_id, operator, ..
            } => {
                check_non_empty(ty, "task_id", task_id.as_str())?;
                check_non_empty(ty, "operator", operator)
            }
            Self::TaskRunning {
                task_id,
                task_kind,
                action,
                reservation,
            } => {
                check_non_empty(ty, "task_id", task_id.as_str())?;
                check_non_empty(ty, "task_kind", task_kind)?;
                if reservation.steps == 0 {
                    return Err(SchemaViolation::new(
                        ty,
                        "reservation must cover at least one step",
                    ));
                }
                action.validate(ty)
            }
            Self::TaskVerifying { task_id, result } => {
                check_non_empty(ty, "task_id", task_id.as_str())?;
                result.validate(ty)
            }
            Self::TaskCompleted {
                task_id,
                verification,
                ..
            } => {
                if !verification.passed {
                    return Err(SchemaViolation::new(
                        ty,
                        "a task can only complete with a passing verification",
                    ));
                }
                if &verification.task_id != task_id {
                    return Err(SchemaViolation::new(
                        ty,
                        format!(
                            "verification is for {}, not {task_id}",
                            verification.task_id
                        ),
                    ));
                }
                Ok(())
            }
            Self::TaskFailed { task_id, reason, .. } => {
                check_non_empty(ty, "task_id", task_id.as_str())?;
                match reason {
                    FailureReason::VerificationFailed {
                        failed_criteria,
                        remediation,
                    } => {
                        if remediation == task_id {
                            return Err(SchemaViolation::new(
                                ty,
                                "a task cannot be its own remediation",
                            ));
                        }
                        non_empty_list(ty, "failed_criteria", failed_criteria)
                    }
                    FailureReason::RemediationExhausted { failed_criteria } => {
                        non_empty_list(ty, "failed_criteria", failed_criteria)
                    }
                    FailureReason::Collaborator { detail, .. } => {
                        check_non_empty(ty, "detail", detail)
                    }
                    FailureReason::Denied { .. } | FailureReason::Stopped => Ok(()),
                }
            }
            Self::TaskBlocked {
                task_id,
                blocked_by,
            } => {
                if task_id == blocked_by {
                    return Err(SchemaViolation::new(ty, "a task cannot block itself"));
                }
                Ok(())
            }
            Self::CollaboratorRetry {
                attempt, detail, ..
            } => {
                if *attempt == 0 {
                    return Err(SchemaViolation::new(ty, "retry attempt is 1-based"));
                }
                check_non_empty(ty, "detail", detail)
            }
            Self::AuditRecorded { audit } => {
                let has_error = audit.flags.iter().any(|f| f.severity == Severity::Error);
                if (audit.passed && has_error) || (!audit.passed && audit.flags.is_empty()) {
                    return Err(SchemaViolation::new(
                        ty,
                        "audit verdict disagrees with its flags",
                    ));
                }
                Ok(())
            }
            Self::ArtifactRecorded { artifact } => validate_artifact(ty, artifact),
            Self::ContextPinned { item } => {
                expect_tier(ty, item, ContextTier::Pinned)?;
                item.validate(ty)
            }
            Self::ContextAdded { item } => {
                expect_tier(ty, item, ContextTier::Working)?;
                item.validate(ty)
            }
            Self::ContextEvicted {
                reference,
                relevance,
                ..
            } => {
                check_non_empty(ty, "reference", reference)?;
                check_permille(ty, "relevance", *relevance)
            }
            Self::ContextPromoted { reference } => check_non_empty(ty, "reference", reference),
            Self::DriftDetected {
                distance,
                threshold,
            } => {
                check_permille(ty, "distance", *distance)?;
                check_permille(ty, "threshold", *threshold)?;
                if distance <= threshold {
                    return Err(SchemaViolation::new(
                        ty,
                        format!("distance {distance} does not exceed threshold {threshold}"),
                    ));
                }
                Ok(())
            }
            Self::AutonomyChanged { from, to, reason } => {
                if from == to {
                    return Err(SchemaViolation::new(ty, "autonomy change must change mode"));
                }
                check_non_empty(ty, "reason", reason)
            }
            Self::DriftReviewed { distance, mode } => {
                check_permille(ty, "distance", *distance)?;
                if *mode == AutonomyMode::Stopped {
                    return Err(SchemaViolation::new(ty, "a stopped run has nothing to review"));
                }
                Ok(())
            }
            Self::StopRequested { .. } => Ok(()),
            Self::RunStatusChanged { status } => match status {
                RunStatus::Failed { reason } => check_non_empty(ty, "failure reason", reason),
                _ => Ok(()),
            },
        }
    }
}

fn validate_mutation(ty: &'static str, mutation: &QueueMutation) -> Result<(), SchemaViolation> {
    match mutation {
        QueueMutation::Enqueued {
            task_id,
            spec,
            depends_on,
            ..
        } => {
            check_non_empty(ty, "task_id", task_id.as_str())?;
            spec.validate(ty)?;
            if depends_on.contains(task_id) {
                return Err(SchemaViolation::new(
                    ty,
                    format!("{task_id} depends on itself"),
                ));
            }
            let mut sorted: Vec<&TaskId> = depends_on.iter().collect();
            sorted.sort();
            sorted.dedup();
            if sorted.len() != depends_on.len() {
                return Err(SchemaViolation::new(ty, "duplicate dependency"));
            }
            Ok(())
        }
        QueueMutation::DependencyAdded {
            task_id,
            depends_on,
        } => {
            if task_id == depends_on {
                return Err(SchemaViolation::new(
                    ty,
                    format!("{task_id} depends on itself"),
                ));
            }
            Ok(())
        }
        QueueMutation::Reprioritized { task_id, .. } => {
            check_non_empty(ty, "task_id", task_id.as_str())
        }
    }
}

fn validate_artifact(ty: &'static str, artifact: &Artifact) -> Result<(), SchemaViolation> {
    check_non_empty(ty, "artifact name", &artifact.name)?;
    if artifact.version == 0 {
        return Err(SchemaViolation::new(ty, "artifact versions start at 1"));
    }
    let expected = Artifact::new(
        &artifact.name,
        artifact.version,
        artifact.kind,
        artifact.content.clone(),
        artifact.produced_by.clone(),
    );
    if expected.id != artifact.id || expected.content_hash != artifact.content_hash {
        return Err(SchemaViolation::new(
            ty,
            format!("artifact {} does not match its content", artifact.id),
        ));
    }
    if artifact.kind == ArtifactKind::Structured
        && serde_json::from_str::<serde_json::Value>(&artifact.content).is_err()
    {
        return Err(SchemaViolation::new(
            ty,
            format!("structured artifact {} is not JSON", artifact.id),
        ));
    }
    Ok(())
}

fn expect_tier(
    ty: &'static str,
    item: &ContextItem,
    tier: ContextTier,
) -> Result<(), SchemaViolation> {
    if item.tier != tier {
        return Err(SchemaViolation::new(
            ty,
            format!("expected a {tier:?} item, got {:?}", item.tier),
        ));
    }
    Ok(())
}

fn non_empty_list(ty: &'static str, field: &str, list: &[String]) -> Result<(), SchemaViolation> {
    if list.is_empty() {
        return Err(SchemaViolation::new(ty, format!("{field} must not be empty")));
    }
    Ok(())
}

/// An appended, hash-chained event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventV1 {
    /// Position in the run's log, 0-based and contiguous.
    pub index: u64,
    pub run_id: RunId,
    pub timestamp_ms: u64,
    pub payload: EventPayload,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

#[derive(Serialize)]
struct EventBody<'a> {
    index: u64,
    run_id: &'a RunId,
    timestamp_ms: u64,
    payload: &'a EventPayload,
}

fn body_hash(
    index: u64,
    run_id: &RunId,
    timestamp_ms: u64,
    payload: &EventPayload,
    prev_hash: &ContentHash,
) -> Result<ContentHash, CanonError> {
    let body = canonical_bytes(&EventBody {
        index,
        run_id,
        timestamp_ms,
        payload,
    })?;
    Ok(chained_hash(HashDomain::EventChain, prev_hash, &body))
}

impl EventV1 {
    /// Build an event and compute its chained hash.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if the payload cannot be canonicalized.
    pub fn seal(
        index: u64,
        run_id: RunId,
        timestamp_ms: u64,
        payload: EventPayload,
        prev_hash: ContentHash,
    ) -> Result<Self, CanonError> {
        let hash = body_hash(index, &run_id, timestamp_ms, &payload, &prev_hash)?;
        Ok(Self {
            index,
            run_id,
            timestamp_ms,
            payload,
            prev_hash,
            hash,
        })
    }

    /// Recompute the hash from the event's contents and `prev_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if the payload cannot be canonicalized.
    pub fn compute_hash(&self) -> Result<ContentHash, CanonError> {
        body_hash(
            self.index,
            &self.run_id,
            self.timestamp_ms,
            &self.payload,
            &self.prev_hash,
        )
    }

    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

//! Verification and audit of task results.
//!
//! Everything here is a pure function of its inputs: verifying the same
//! result against the same criteria always yields the same record, so a
//! replayed run re-derives identical verdicts.
//!
//! A task passes when every deterministic check passes and the weighted
//! rubric aggregate (permille) reaches the threshold. A task without
//! criteria is held to an implicit `execution_succeeded` check.

use keel_kernel::schema::{
    AcceptanceCriterion, AuditFlag, AuditResult, CriterionKind, CriterionOutcome,
    DeterministicCheck, FlagCategory, RubricMeasure, Severity, Task, TaskKind, TaskResult,
    TaskSpec, VerificationResult, PERMILLE_MAX,
};

const IMPLICIT_CHECK: &str = "execution_succeeded";

fn check(check: &DeterministicCheck, result: &TaskResult) -> (bool, String) {
    match check {
        DeterministicCheck::ExecutionSucceeded => (
            result.success,
            if result.success {
                "execution reported success".to_string()
            } else {
                "execution reported failure".to_string()
            },
        ),
        DeterministicCheck::OutputIsJson => {
            match serde_json::from_str::<serde_json::Value>(&result.output) {
                Ok(_) => (true, "output is valid JSON".to_string()),
                Err(e) => (false, format!("output is not JSON: {e}")),
            }
        }
        DeterministicCheck::ArtifactExists { name } => {
            let found = result.artifacts.iter().any(|a| &a.name == name);
            (found, format!("artifact `{name}` {}", present(found)))
        }
        DeterministicCheck::OutputContains { needle } => {
            let found = result.output.contains(needle.as_str());
            (found, format!("output {} `{needle}`", contains(found)))
        }
        DeterministicCheck::LogsExclude { needle } => {
            let hit = result
                .logs
                .iter()
                .position(|line| line.contains(needle.as_str()));
            match hit {
                Some(line) => (false, format!("log line {line} contains `{needle}`")),
                None => (true, format!("no log line contains `{needle}`")),
            }
        }
        DeterministicCheck::MaxOutputBytes { limit } => {
            let size = result.output.len() as u64;
            (size <= *limit, format!("output is {size} bytes (limit {limit})"))
        }
    }
}

const fn present(found: bool) -> &'static str {
    if found {
        "present"
    } else {
        "missing"
    }
}

const fn contains(found: bool) -> &'static str {
    if found {
        "contains"
    } else {
        "does not contain"
    }
}

fn measure(measure: &RubricMeasure, result: &TaskResult) -> (u32, String) {
    match measure {
        RubricMeasure::ReportedScore { key } => match result.scores.get(key) {
            Some(score) => ((*score).min(PERMILLE_MAX), format!("reported {key} = {score}")),
            None => (0, format!("no score reported for {key}")),
        },
        RubricMeasure::ArtifactPresent { name } => {
            let found = result.artifacts.iter().any(|a| &a.name == name);
            (
                if found { PERMILLE_MAX } else { 0 },
                format!("artifact `{name}` {}", present(found)),
            )
        }
        RubricMeasure::OutputMentions { needle } => {
            let found = result
                .output
                .to_lowercase()
                .contains(&needle.to_lowercase());
            (
                if found { PERMILLE_MAX } else { 0 },
                format!("output {} `{needle}`", contains(found)),
            )
        }
    }
}

/// Judge `result` against the criteria of `task`. Rubric items use the
/// task's threshold when it sets one, else `default_threshold`.
#[must_use]
pub fn verify(task: &Task, result: &TaskResult, default_threshold: u32) -> VerificationResult {
    let threshold = task.spec.rubric_threshold.unwrap_or(default_threshold);
    let implicit;
    let criteria: &[AcceptanceCriterion] = if task.spec.criteria.is_empty() {
        implicit = [AcceptanceCriterion::deterministic(
            IMPLICIT_CHECK,
            DeterministicCheck::ExecutionSucceeded,
        )];
        &implicit
    } else {
        &task.spec.criteria
    };

    let mut outcomes = Vec::with_capacity(criteria.len());
    let mut weighted: u64 = 0;
    let mut total_weight: u64 = 0;
    for criterion in criteria {
        let outcome = match criterion {
            AcceptanceCriterion::Deterministic { name, check: c } => {
                let (passed, detail) = check(c, result);
                CriterionOutcome {
                    criterion: name.clone(),
                    kind: CriterionKind::Deterministic,
                    passed,
                    score: None,
                    detail,
                }
            }
            AcceptanceCriterion::Rubric {
                name,
                weight,
                measure: m,
            } => {
                let (score, detail) = measure(m, result);
                weighted += u64::from(*weight) * u64::from(score);
                total_weight += u64::from(*weight);
                CriterionOutcome {
                    criterion: name.clone(),
                    kind: CriterionKind::Rubric,
                    passed: score >= threshold,
                    score: Some(score),
                    detail,
                }
            }
        };
        outcomes.push(outcome);
    }

    let rubric_score = (total_weight > 0)
        .then(|| u32::try_from(weighted / total_weight).unwrap_or(PERMILLE_MAX));
    let rubric_passed = rubric_score.is_none_or(|s| s >= threshold);
    let failed_criteria: Vec<String> = outcomes
        .iter()
        .filter(|o| match o.kind {
            CriterionKind::Deterministic => !o.passed,
            CriterionKind::Rubric => !rubric_passed && !o.passed,
        })
        .map(|o| o.criterion.clone())
        .collect();
    let deterministic_passed = outcomes
        .iter()
        .all(|o| o.kind == CriterionKind::Rubric || o.passed);

    VerificationResult {
        task_id: task.id.clone(),
        passed: deterministic_passed && rubric_passed,
        outcomes,
        rubric_score,
        rubric_threshold: threshold,
        failed_criteria,
    }
}

fn category_of(spec: &TaskSpec, criterion: &str) -> FlagCategory {
    let check = spec.criteria.iter().find_map(|c| match c {
        AcceptanceCriterion::Deterministic { name, check } if name == criterion => Some(check),
        _ => None,
    });
    match check {
        Some(DeterministicCheck::LogsExclude { .. }) => FlagCategory::Safety,
        Some(DeterministicCheck::MaxOutputBytes { .. }) => FlagCategory::Policy,
        _ => FlagCategory::Quality,
    }
}

/// Flag every criterion that fell short. Failed deterministic checks are
/// errors; rubric items below threshold are warnings when they sank the
/// aggregate and informational otherwise.
#[must_use]
pub fn audit(task: &Task, verification: &VerificationResult) -> AuditResult {
    let flags = verification
        .outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| {
            let severity = match o.kind {
                CriterionKind::Deterministic => Severity::Error,
                CriterionKind::Rubric if verification.passed => Severity::Info,
                CriterionKind::Rubric => Severity::Warning,
            };
            AuditFlag {
                criterion: o.criterion.clone(),
                severity,
                category: category_of(&task.spec, &o.criterion),
                detail: o.detail.clone(),
            }
        })
        .collect();
    AuditResult {
        task_id: task.id.clone(),
        passed: verification.passed,
        flags,
    }
}

/// Spec of the task that retries `task` after a failed verification. It
/// has no dependencies and carries the same criteria.
#[must_use]
pub fn remediation_spec(task: &Task, verification: &VerificationResult, attempt: u32) -> TaskSpec {
    let original = match &task.spec.kind {
        TaskKind::Remediation { original, .. } => original.clone(),
        _ => task.id.clone(),
    };
    let failed = verification.failed_criteria.clone();
    let mut spec = TaskSpec::new(
        format!("{} (remediation {attempt})", base_title(&task.spec.title)),
        TaskKind::Remediation {
            original,
            failed_criteria: failed.clone(),
            attempt,
        },
    );
    spec.description = format!(
        "Redo {}; failed criteria: {}.",
        task.id,
        failed.join(", ")
    );
    spec.criteria.clone_from(&task.spec.criteria);
    spec.rubric_threshold = task.spec.rubric_threshold;
    spec.uninterruptible = task.spec.uninterruptible;
    spec.retryable = task.spec.retryable;
    spec
}

fn base_title(title: &str) -> &str {
    title
        .rfind(" (remediation ")
        .map_or(title, |at| &title[..at])
}

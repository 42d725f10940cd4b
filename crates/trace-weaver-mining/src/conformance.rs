use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use trace_weaver_core::{InterruptReason, Trace, TraceError};
use tracing::{debug, warn};

use crate::model::ReferenceModel;

/// Activity label used for the synthetic deviation of a trace that stops
/// outside the accepting states.
pub const END_OF_TRACE: &str = "<end>";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviationKind {
    Unexpected,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deviation {
    pub case_id: String,
    pub position: usize,
    pub kind: DeviationKind,
    pub state: String,
    pub activity: String,
    pub expected: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviationPattern {
    pub kind: DeviationKind,
    pub state: String,
    pub activity: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayStatus {
    Complete,
    Interrupted { reason: InterruptReason },
}

/// Progress of a replay up to the last fully processed trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayCheckpoint {
    pub model_fingerprint: String,
    pub next_trace: usize,
    pub traces_fitting: usize,
    pub transitions: u64,
    pub fitting_transitions: u64,
    pub deviations: Vec<Deviation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConformanceReport {
    pub model_name: String,
    pub model_fingerprint: String,
    pub fitness: f64,
    pub event_fitness: f64,
    pub traces_checked: usize,
    pub traces_total: usize,
    pub traces_fitting: usize,
    pub deviations: Vec<Deviation>,
    pub patterns: Vec<DeviationPattern>,
    pub truncated: bool,
    pub status: ReplayStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<ReplayCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
}

/// Cooperative cancellation shared between a replay and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Extension point for model precision; no estimator ships with the crate.
pub trait PrecisionEstimator: Send + Sync {
    fn name(&self) -> &str;

    fn estimate(&self, model: &ReferenceModel, traces: &[Trace]) -> f64;
}

/// Token replay of traces against a [`ReferenceModel`].
pub struct ConformanceChecker<'m> {
    model: &'m ReferenceModel,
    fingerprint: String,
    cancel: CancelFlag,
    deadline: Option<Duration>,
    precision: Option<Box<dyn PrecisionEstimator>>,
}

impl<'m> ConformanceChecker<'m> {
    /// # Errors
    /// Returns [`TraceError::Validation`] when the model is invalid.
    pub fn new(model: &'m ReferenceModel) -> Result<Self, TraceError> {
        model.validate()?;
        Ok(Self {
            model,
            fingerprint: model.fingerprint()?,
            cancel: CancelFlag::new(),
            deadline: None,
            precision: None,
        })
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_precision_estimator(mut self, estimator: Box<dyn PrecisionEstimator>) -> Self {
        self.precision = Some(estimator);
        self
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Replays every trace from the start.
    #[must_use]
    pub fn check(&self, traces: &[Trace]) -> ConformanceReport {
        self.replay_from(traces, self.empty_checkpoint())
    }

    /// Continues an interrupted replay over the same trace snapshot.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when the checkpoint belongs to a
    /// different model or points past the end of `traces`.
    pub fn resume(
        &self,
        traces: &[Trace],
        checkpoint: ReplayCheckpoint,
    ) -> Result<ConformanceReport, TraceError> {
        if checkpoint.model_fingerprint != self.fingerprint {
            return Err(TraceError::Validation(
                "checkpoint was taken against a different reference model".to_string(),
            ));
        }
        if checkpoint.next_trace > traces.len() {
            return Err(TraceError::Validation(format!(
                "checkpoint position {} exceeds corpus size {}",
                checkpoint.next_trace,
                traces.len()
            )));
        }
        Ok(self.replay_from(traces, checkpoint))
    }

    fn empty_checkpoint(&self) -> ReplayCheckpoint {
        ReplayCheckpoint {
            model_fingerprint: self.fingerprint.clone(),
            next_trace: 0,
            traces_fitting: 0,
            transitions: 0,
            fitting_transitions: 0,
            deviations: Vec::new(),
        }
    }

    fn replay_from(&self, traces: &[Trace], mut progress: ReplayCheckpoint) -> ConformanceReport {
        let started = Instant::now();
        let mut interrupted = None;

        while progress.next_trace < traces.len() {
            if self.cancel.is_cancelled() {
                interrupted = Some(InterruptReason::Cancelled);
                break;
            }
            if self.deadline.is_some_and(|deadline| started.elapsed() >= deadline) {
                interrupted = Some(InterruptReason::DeadlineExceeded);
                break;
            }

            let trace = &traces[progress.next_trace];
            let outcome = self.replay_trace(trace);
            progress.transitions += outcome.transitions;
            progress.fitting_transitions += outcome.fitting;
            if outcome.deviations.is_empty() {
                progress.traces_fitting += 1;
            }
            progress.deviations.extend(outcome.deviations);
            progress.next_trace += 1;
        }

        if let Some(reason) = interrupted {
            let err = TraceError::ReplayInterrupted {
                processed: progress.next_trace,
                reason,
            };
            warn!(event = "replay_interrupted", code = err.code(), error = %err);
        }

        self.report(traces, progress, interrupted)
    }

    fn replay_trace(&self, trace: &Trace) -> TraceReplay {
        let mut state = self.model.initial.as_str();
        let mut replay = TraceReplay::default();

        for (position, activity) in trace.activities().enumerate() {
            replay.transitions += 1;
            let allowed = self.model.allowed(state);
            if allowed.is_some_and(|targets| targets.contains(activity)) {
                replay.fitting += 1;
                // Targets are states, so the token moves to the state named after the activity.
                state = allowed
                    .and_then(|targets| targets.get(activity))
                    .map_or(state, String::as_str);
            } else {
                replay.deviations.push(Deviation {
                    case_id: trace.case_id.clone(),
                    position,
                    kind: DeviationKind::Unexpected,
                    state: state.to_string(),
                    activity: activity.to_string(),
                    expected: allowed
                        .map(|targets| targets.iter().cloned().collect())
                        .unwrap_or_default(),
                });
            }
        }

        if !self.model.is_final(state) {
            replay.deviations.push(Deviation {
                case_id: trace.case_id.clone(),
                position: trace.len(),
                kind: DeviationKind::Incomplete,
                state: state.to_string(),
                activity: END_OF_TRACE.to_string(),
                expected: self.model.final_states.iter().cloned().collect(),
            });
        }

        debug!(
            event = "trace_replayed",
            case_id = trace.case_id.as_str(),
            deviations = replay.deviations.len()
        );
        replay
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(
        &self,
        traces: &[Trace],
        progress: ReplayCheckpoint,
        interrupted: Option<InterruptReason>,
    ) -> ConformanceReport {
        let traces_checked = progress.next_trace;
        let fitness = if traces_checked == 0 {
            1.0
        } else {
            progress.traces_fitting as f64 / traces_checked as f64
        };
        let event_fitness = if progress.transitions == 0 {
            1.0
        } else {
            progress.fitting_transitions as f64 / progress.transitions as f64
        };

        let (deviations, patterns) = rank_deviations(progress.deviations.clone());
        let precision = match (&self.precision, interrupted) {
            (Some(estimator), None) => Some(estimator.estimate(self.model, traces)),
            _ => None,
        };

        ConformanceReport {
            model_name: self.model.name.clone(),
            model_fingerprint: self.fingerprint.clone(),
            fitness,
            event_fitness,
            traces_checked,
            traces_total: traces.len(),
            traces_fitting: progress.traces_fitting,
            deviations,
            patterns,
            truncated: interrupted.is_some(),
            status: interrupted.map_or(ReplayStatus::Complete, |reason| {
                ReplayStatus::Interrupted { reason }
            }),
            checkpoint: interrupted.map(|_| progress),
            precision,
        }
    }
}

#[derive(Debug, Default)]
struct TraceReplay {
    transitions: u64,
    fitting: u64,
    deviations: Vec<Deviation>,
}

/// Orders deviations by how common their (kind, state, activity) pattern is,
/// most frequent first, then by case and position.
fn rank_deviations(mut deviations: Vec<Deviation>) -> (Vec<Deviation>, Vec<DeviationPattern>) {
    let mut counts: BTreeMap<(DeviationKind, String, String), usize> = BTreeMap::new();
    for deviation in &deviations {
        *counts
            .entry((
                deviation.kind,
                deviation.state.clone(),
                deviation.activity.clone(),
            ))
            .or_default() += 1;
    }

    let count_of = |deviation: &Deviation| {
        counts
            .get(&(
                deviation.kind,
                deviation.state.clone(),
                deviation.activity.clone(),
            ))
            .copied()
            .unwrap_or_default()
    };
    deviations.sort_by(|left, right| {
        count_of(right)
            .cmp(&count_of(left))
            .then_with(|| left.kind.cmp(&right.kind))
            .then_with(|| left.state.cmp(&right.state))
            .then_with(|| left.activity.cmp(&right.activity))
            .then_with(|| left.case_id.cmp(&right.case_id))
            .then_with(|| left.position.cmp(&right.position))
    });

    let mut patterns: Vec<DeviationPattern> = counts
        .into_iter()
        .map(|((kind, state, activity), count)| DeviationPattern {
            kind,
            state,
            activity,
            count,
        })
        .collect();
    patterns.sort_by(|left, right| right.count.cmp(&left.count));

    (deviations, patterns)
}

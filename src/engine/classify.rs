//! Pure step math: default classification, confidence, progress and
//! suggestions.
//!
//! Nothing here touches storage, so every function is a plain function of
//! its arguments.

use crate::storage::StepType;

use super::Progress;

/// Lower bound for computed confidence.
pub const MIN_CONFIDENCE: f64 = 0.5;
/// Upper bound for computed confidence.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Bonus applied once a branch has more than this many prior steps.
const CONTEXT_THRESHOLD: usize = 3;
const CONTEXT_BONUS: f64 = 0.05;
const REVISION_BONUS: f64 = 0.03;

/// Position past which a post-evidence step is treated as synthesis.
const SYNTHESIS_POSITION: f64 = 0.7;

/// Classify a step from its position and the types already present in its
/// branch.
///
/// Step 1 always decomposes the problem and the declared final step always
/// concludes. In between, the default progression walks
/// decomposition → hypothesis → evidence gathering, then picks deduction or
/// synthesis by position; without that history it falls back to a
/// proportional mapping over the declared total.
pub fn classify_step(step_number: u32, total_steps: u32, prior: &[StepType]) -> StepType {
    if step_number == 1 {
        return StepType::Decomposition;
    }
    if step_number == total_steps {
        return StepType::Conclusion;
    }

    let seen = |t: StepType| prior.contains(&t);
    let position = f64::from(step_number) / f64::from(total_steps.max(1));

    if seen(StepType::Decomposition) && !seen(StepType::Hypothesis) {
        return StepType::Hypothesis;
    }
    if seen(StepType::Hypothesis) && !seen(StepType::EvidenceGathering) {
        return StepType::EvidenceGathering;
    }
    if seen(StepType::EvidenceGathering) {
        return if position > SYNTHESIS_POSITION {
            StepType::Synthesis
        } else {
            StepType::LogicalDeduction
        };
    }

    match position {
        p if p <= 0.3 => StepType::PatternRecognition,
        p if p <= 0.6 => StepType::LogicalDeduction,
        p if p <= 0.8 => StepType::Validation,
        _ => StepType::Synthesis,
    }
}

/// Base confidence for each step type.
pub fn base_confidence(step_type: StepType) -> f64 {
    match step_type {
        StepType::Decomposition => 0.85,
        StepType::Hypothesis => 0.70,
        StepType::EvidenceGathering => 0.80,
        StepType::PatternRecognition => 0.75,
        StepType::LogicalDeduction => 0.88,
        StepType::Synthesis => 0.85,
        StepType::Validation => 0.90,
        StepType::Conclusion => 0.87,
    }
}

/// Confidence for a step, clamped to `[MIN_CONFIDENCE, MAX_CONFIDENCE]`.
pub fn compute_confidence(step_type: StepType, prior_steps: usize, is_revision: bool) -> f64 {
    let mut confidence = base_confidence(step_type);
    if prior_steps > CONTEXT_THRESHOLD {
        confidence += CONTEXT_BONUS;
    }
    if is_revision {
        confidence += REVISION_BONUS;
    }
    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Progress of a branch after `step_number` has been written.
pub fn compute_progress(
    step_number: u32,
    total_steps: u32,
    chain_length: usize,
    branch_id: Option<&str>,
) -> Progress {
    let total = total_steps.max(1);
    let percent = (f64::from(step_number) / f64::from(total) * 100.0).round();

    Progress {
        current_chain_length: chain_length,
        percent_complete: percent.max(0.0) as u32,
        steps_remaining: total.saturating_sub(step_number),
        on_track: step_number <= total,
        branch: branch_id.is_some(),
    }
}

/// Canned hint for what to do after a step of this type.
pub fn default_suggestion(step_type: StepType) -> &'static str {
    match step_type {
        StepType::Decomposition => {
            "Pick the most uncertain sub-problem and state a hypothesis about it."
        }
        StepType::Hypothesis => "Gather evidence that could confirm or refute the hypothesis.",
        StepType::EvidenceGathering => {
            "Reason from the evidence: what follows, and what does it rule out?"
        }
        StepType::PatternRecognition => {
            "Check whether the pattern holds across all cases before relying on it."
        }
        StepType::LogicalDeduction => {
            "Test the deduction against a counter-example or an edge case."
        }
        StepType::Synthesis => "Validate the combined result against the original problem.",
        StepType::Validation => "Address any gaps the validation exposed, then conclude.",
        StepType::Conclusion => {
            "Review the conclusion; revise an earlier step if new information contradicts it."
        }
    }
}

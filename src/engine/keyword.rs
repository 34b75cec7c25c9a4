//! Table-driven [`ToolAdapter`] used by the built-in tools.

use crate::storage::{Step, StepType};

use super::{default_suggestion, Extraction, ToolAdapter};

/// Keyword → step type rule. The first rule with a matching keyword wins.
type Rule = (StepType, &'static [&'static str]);

/// Classifies and extracts by case-insensitive phrase matching.
///
/// Content is split into sentences; a sentence containing an evidence,
/// assumption or risk marker is copied into the matching extraction list.
#[derive(Debug, Clone)]
pub struct KeywordAdapter {
    name: &'static str,
    rules: &'static [Rule],
    evidence_markers: &'static [&'static str],
    assumption_markers: &'static [&'static str],
    risk_markers: &'static [&'static str],
    suggestions: &'static [(StepType, &'static str)],
}

const EVIDENCE_MARKERS: &[&str] = &[
    "because",
    "observed",
    "the logs show",
    "measured",
    "data shows",
    "according to",
    "confirmed",
];

const ASSUMPTION_MARKERS: &[&str] = &[
    "assume",
    "assuming",
    "presumably",
    "probably",
    "likely",
    "should be",
    "if we take",
];

const RISK_MARKERS: &[&str] = &[
    "risk",
    "might fail",
    "could break",
    "side effect",
    "regression",
    "downside",
    "unknown",
];

const DEBUGGING_RULES: &[Rule] = &[
    (StepType::Hypothesis, &["suspect", "hypothes", "might be caused", "root cause could"]),
    (
        StepType::EvidenceGathering,
        &[
            "reproduce",
            "stack trace",
            "the logs",
            "log output",
            "log file",
            "bisect",
            "breakpoint",
        ],
    ),
    (StepType::Validation, &["verify the fix", "regression test", "re-run", "confirm the fix"]),
    (StepType::Conclusion, &["root cause is", "fixed by", "the bug was"]),
];

const DEBUGGING_SUGGESTIONS: &[(StepType, &str)] = &[
    (StepType::Decomposition, "Isolate the smallest input that still reproduces the failure."),
    (StepType::Hypothesis, "Find an observation that would distinguish this cause from the next most likely one."),
    (StepType::EvidenceGathering, "Narrow the search: bisect the change history or the code path."),
    (StepType::Validation, "Add a regression test that fails without the fix."),
];

const MENTAL_MODEL_RULES: &[Rule] = &[
    (StepType::Decomposition, &["first principles", "break down", "fundamental"]),
    (StepType::PatternRecognition, &["analogy", "similar to", "pattern", "like a"]),
    (StepType::LogicalDeduction, &["therefore", "it follows", "second-order", "implies"]),
    (StepType::Validation, &["inversion", "what would make this fail", "pre-mortem"]),
];

const MENTAL_MODEL_SUGGESTIONS: &[(StepType, &str)] = &[
    (StepType::Decomposition, "Name the few facts that must be true and build up from them."),
    (StepType::PatternRecognition, "Check where the analogy breaks down."),
    (StepType::LogicalDeduction, "Follow the consequence one step further: what happens next?"),
];

const COLLABORATIVE_RULES: &[Rule] = &[
    (StepType::Hypothesis, &["propose", "suggest we", "what if we"]),
    (StepType::EvidenceGathering, &["from the perspective", "stakeholder", "expert", "feedback"]),
    (StepType::Synthesis, &["consensus", "combining", "we agree", "common ground"]),
    (StepType::Validation, &["disagree", "objection", "challenge", "devil's advocate"]),
];

const COLLABORATIVE_SUGGESTIONS: &[(StepType, &str)] = &[
    (StepType::Hypothesis, "Invite the persona most likely to disagree to respond."),
    (StepType::Synthesis, "List the open disagreements before declaring consensus."),
    (StepType::Validation, "Resolve or explicitly record each objection."),
];

const DECISION_RULES: &[Rule] = &[
    (StepType::Decomposition, &["options", "alternatives", "criteria"]),
    (StepType::EvidenceGathering, &["cost", "benefit", "trade-off", "tradeoff", "score"]),
    (StepType::Validation, &["sensitivity", "what if the weights", "sanity check"]),
    (StepType::Conclusion, &["we choose", "decision:", "recommend"]),
];

const DECISION_SUGGESTIONS: &[(StepType, &str)] = &[
    (StepType::Decomposition, "Weight the criteria before scoring any option."),
    (StepType::EvidenceGathering, "Score every option against every criterion."),
    (StepType::Validation, "Check whether a small change in weights flips the decision."),
];

impl KeywordAdapter {
    /// Adapter for the debugging tool
    pub fn debugging() -> Self {
        Self::with_tables("debugging_approach", DEBUGGING_RULES, DEBUGGING_SUGGESTIONS)
    }

    /// Adapter for the mental model tool
    pub fn mental_model() -> Self {
        Self::with_tables("mental_model", MENTAL_MODEL_RULES, MENTAL_MODEL_SUGGESTIONS)
    }

    /// Adapter for the collaborative reasoning tool
    pub fn collaborative() -> Self {
        Self::with_tables(
            "collaborative_reasoning",
            COLLABORATIVE_RULES,
            COLLABORATIVE_SUGGESTIONS,
        )
    }

    /// Adapter for the decision framework tool
    pub fn decision() -> Self {
        Self::with_tables("decision_framework", DECISION_RULES, DECISION_SUGGESTIONS)
    }

    fn with_tables(
        name: &'static str,
        rules: &'static [Rule],
        suggestions: &'static [(StepType, &'static str)],
    ) -> Self {
        Self {
            name,
            rules,
            evidence_markers: EVIDENCE_MARKERS,
            assumption_markers: ASSUMPTION_MARKERS,
            risk_markers: RISK_MARKERS,
            suggestions,
        }
    }

    /// Tool this adapter was built for.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn sentences(content: &str) -> impl Iterator<Item = &str> {
    content
        .split(|c: char| matches!(c, '.' | '!' | '?' | '\n' | ';'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl ToolAdapter for KeywordAdapter {
    fn classify(&self, content: &str, _prior_steps: &[Step]) -> Option<StepType> {
        let lowered = content.to_lowercase();
        self.rules
            .iter()
            .find(|(_, keywords)| contains_any(&lowered, keywords))
            .map(|(step_type, _)| *step_type)
    }

    fn extract(&self, content: &str, _prior_steps: &[Step]) -> Extraction {
        let mut extraction = Extraction::default();
        for sentence in sentences(content) {
            let lowered = sentence.to_lowercase();
            if contains_any(&lowered, self.evidence_markers) {
                extraction.evidence.push(sentence.to_string());
            }
            if contains_any(&lowered, self.assumption_markers) {
                extraction.assumptions.push(sentence.to_string());
            }
            if contains_any(&lowered, self.risk_markers) {
                extraction.risks.push(sentence.to_string());
            }
        }
        extraction
    }

    fn suggest(&self, step_type: StepType, _content: &str) -> String {
        self.suggestions
            .iter()
            .find(|(t, _)| *t == step_type)
            .map(|(_, hint)| *hint)
            .unwrap_or_else(|| default_suggestion(step_type))
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debugging_classification() {
        let adapter = KeywordAdapter::debugging();
        assert_eq!(
            adapter.classify("I suspect the cache eviction", &[]),
            Some(StepType::Hypothesis)
        );
        assert_eq!(
            adapter.classify("Let me reproduce it with a stack trace", &[]),
            Some(StepType::EvidenceGathering)
        );
        assert_eq!(adapter.classify("Thinking about lunch", &[]), None);
    }

    #[test]
    fn test_log_keyword_needs_whole_phrase() {
        let adapter = KeywordAdapter::debugging();
        assert_eq!(
            adapter.classify("Check the logs for timeouts", &[]),
            Some(StepType::EvidenceGathering)
        );
        assert_eq!(
            adapter.classify("The logical next step is obvious", &[]),
            None
        );
        assert_eq!(adapter.classify("Open the catalog dialog", &[]), None);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let adapter = KeywordAdapter::decision();
        // "options" (decomposition) precedes "recommend" (conclusion) in the table.
        assert_eq!(
            adapter.classify("Of the options, I recommend B", &[]),
            Some(StepType::Decomposition)
        );
    }

    #[test]
    fn test_extract_by_sentence() {
        let adapter = KeywordAdapter::debugging();
        let extraction = adapter.extract(
            "The logs show a timeout at 12:00. Assuming the pool is exhausted! \
             Raising the limit might fail under load",
            &[],
        );

        assert_eq!(extraction.evidence, vec!["The logs show a timeout at 12:00"]);
        assert_eq!(extraction.assumptions, vec!["Assuming the pool is exhausted"]);
        assert_eq!(extraction.risks, vec!["Raising the limit might fail under load"]);
    }

    #[test]
    fn test_extract_nothing() {
        let adapter = KeywordAdapter::mental_model();
        assert!(adapter.extract("Plain statement", &[]).is_empty());
    }

    #[test]
    fn test_suggest_prefers_tool_table() {
        let adapter = KeywordAdapter::debugging();
        assert_eq!(
            adapter.suggest(StepType::Validation, ""),
            "Add a regression test that fails without the fix."
        );
        assert_eq!(
            adapter.suggest(StepType::Conclusion, ""),
            default_suggestion(StepType::Conclusion)
        );
    }

    #[test]
    fn test_adapter_names() {
        assert_eq!(KeywordAdapter::debugging().name(), "debugging_approach");
        assert_eq!(KeywordAdapter::collaborative().name(), "collaborative_reasoning");
    }
}

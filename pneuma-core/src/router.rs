//! Intent classification (the gating network).
//!
//! Rule-based: each category owns a small pattern set and scores the fraction
//! of its patterns that match. A learned model can replace this as long as
//! `classify` and `create_routing_request` keep their contracts.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::integrity::hash_payload;
use crate::protocol::{Intent, IntentConstraints, RoutingRequest};

/// Top score below this falls back to `General`.
const FALLBACK_THRESHOLD: f64 = 0.2;
/// Non-primary categories scoring above this become secondary intents.
const SECONDARY_THRESHOLD: f64 = 0.3;
const GENERAL_BASE_SCORE: f64 = 0.5;
// Saturates at 1.0 for any score >= 0.5, so strong and moderate matches
// report the same confidence. Kept for compatibility with deployed moderators.
const CONFIDENCE_BOOST: f64 = 0.5;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("classifier pattern should compile"))
        .collect()
}

static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(code|script|function|program|python|javascript|rust|golang|c\+\+)\b",
        r"\b(implement|debug|fix|refactor|write|create)\b.*\b(code|function|class)\b",
        r"\bdef\s+\w+|class\s+\w+|function\s+\w+",
    ])
});

static SECURITY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(security|vulnerability|exploit|attack|encrypt|decrypt|auth)\b",
        r"\b(password|credential|token|key|certificate|ssl|tls)\b",
        r"\b(injection|xss|csrf|sqli|rce)\b",
    ])
});

static MATH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(calculate|compute|solve|equation|formula|integral|derivative)\b",
        r"\b(math|algebra|calculus|statistics|probability)\b",
        r"[\d+\-*/=()]{5,}",
    ])
});

static CREATIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(write|compose|create|generate)\b.*\b(story|poem|song|essay)\b",
        r"\b(creative|artistic|imaginative|fiction)\b",
    ])
});

/// Intent categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentType {
    Code,
    Security,
    General,
    Math,
    Creative,
}

impl IntentType {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentType::Code => "code",
            IntentType::Security => "security",
            IntentType::General => "general",
            IntentType::Math => "math",
            IntentType::Creative => "creative",
        }
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub intent_type: IntentType,
    pub confidence: f64,
    pub sensitivity: Sensitivity,
    pub secondary_intents: Vec<IntentType>,
}

impl ClassificationResult {
    /// Protocol form, as embedded in a `RoutingRequest`.
    pub fn to_intent(&self) -> Intent {
        Intent {
            primary: self.intent_type.as_str().to_owned(),
            secondary: self
                .secondary_intents
                .iter()
                .map(|s| s.as_str().to_owned())
                .collect(),
            confidence: self.confidence,
        }
    }
}

/// Rule-based classifier. Stateless; patterns are compiled once per process.
#[derive(Debug, Clone, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    fn match_score(text: &str, patterns: &[Regex]) -> f64 {
        let matches = patterns.iter().filter(|p| p.is_match(text)).count();
        (matches as f64 / patterns.len().max(1) as f64).min(1.0)
    }

    pub fn classify(&self, text: &str) -> ClassificationResult {
        let mut scores = vec![
            (IntentType::Code, Self::match_score(text, &CODE_PATTERNS)),
            (IntentType::Security, Self::match_score(text, &SECURITY_PATTERNS)),
            (IntentType::Math, Self::match_score(text, &MATH_PATTERNS)),
            (IntentType::Creative, Self::match_score(text, &CREATIVE_PATTERNS)),
        ];
        // Stable: ties keep the order above.
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (mut primary, mut primary_score) = scores[0];
        if primary_score < FALLBACK_THRESHOLD {
            primary = IntentType::General;
            primary_score = GENERAL_BASE_SCORE;
        }

        let secondary: Vec<IntentType> = scores[1..]
            .iter()
            .filter(|(_, score)| *score > SECONDARY_THRESHOLD)
            .map(|(intent, _)| *intent)
            .collect();

        let involved = |t: IntentType| primary == t || secondary.contains(&t);
        let sensitivity = if involved(IntentType::Security) {
            Sensitivity::High
        } else if involved(IntentType::Code) {
            Sensitivity::Medium
        } else {
            Sensitivity::Low
        };

        ClassificationResult {
            intent_type: primary,
            confidence: (primary_score + CONFIDENCE_BOOST).min(1.0),
            sensitivity,
            secondary_intents: secondary,
        }
    }

    /// Classify `text` and build the request a Moderator broadcasts for it.
    pub fn create_routing_request(
        &self,
        text: &str,
        node_id: &str,
        request_id: &str,
        constraints: Option<IntentConstraints>,
    ) -> RoutingRequest {
        let result = self.classify(text);
        tracing::debug!(
            request_id,
            intent = %result.intent_type,
            confidence = result.confidence,
            sensitivity = ?result.sensitivity,
            "classified input"
        );
        RoutingRequest::new(
            request_id,
            node_id,
            result.to_intent(),
            constraints.unwrap_or_default(),
            hash_payload(text),
        )
    }
}

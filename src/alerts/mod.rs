pub mod dispatcher;
pub mod engine;
pub mod incidents;
pub mod insights;

use serde::{Deserialize, Serialize};

/// Alert severity, ordered low < medium < high < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "\u{2139}\u{fe0f}",
            Severity::Medium => "\u{26a0}\u{fe0f}",
            Severity::High => "\u{1f6a8}",
            Severity::Critical => "\u{1f534}",
        }
    }
}

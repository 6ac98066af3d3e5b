//! Durable record types owned by the storage engine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Classification of a feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Positive,
    Negative,
    Neutral,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }

    /// Outcome implied by a quality score when the caller did not classify it.
    pub fn from_quality(quality: f64) -> Self {
        if quality >= 0.7 {
            Self::Positive
        } else if quality <= 0.3 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    /// UUID v7, assigned once and never reused.
    pub id: String,
    pub content: String,
    pub category: String,
    /// Normalized hierarchical path, e.g. `project/docs`.
    pub domain: String,
    pub tags: BTreeSet<String>,
    /// Quality score in `[0.0, 1.0]`.
    pub quality: f64,
    /// Number of reads that returned this entry.
    pub usage_count: u64,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl KnowledgeEntry {
    /// Whether this entry lives at `domain`, or below it when `include_subdomains` is set.
    pub fn in_domain(&self, domain: &str, include_subdomains: bool) -> bool {
        domain_matches(&self.domain, domain, include_subdomains)
    }

    /// Rough in-memory footprint, used for status and memory accounting.
    pub fn approx_bytes(&self) -> usize {
        let tags: usize = self.tags.iter().map(|t| t.len() + 24).sum();
        let metadata = self
            .metadata
            .as_ref()
            .map(|m| m.to_string().len())
            .unwrap_or(0);
        128 + self.id.len() + self.content.len() + self.category.len() + self.domain.len()
            + tags
            + metadata
    }

    /// Record a read: bump the usage counter and refresh `last_used`.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used = now;
    }
}

/// An append-only outcome record for a tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub id: String,
    pub trajectory_id: String,
    pub quality: f64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackEntry {
    pub fn approx_bytes(&self) -> usize {
        96 + self.id.len()
            + self.trajectory_id.len()
            + self.feedback.as_ref().map(String::len).unwrap_or(0)
    }
}

/// Input for a new knowledge entry, before normalization.
#[derive(Debug, Clone, Default)]
pub struct NewKnowledge {
    pub content: String,
    pub domain: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub quality: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

/// Filters for a pattern query.
#[derive(Debug, Clone, Default)]
pub struct PatternQuery {
    pub query: Option<String>,
    pub domain: Option<String>,
    pub category: Option<String>,
    pub min_quality: Option<f64>,
    pub limit: usize,
}

/// Normalize a domain path: trim, drop empty segments and surrounding slashes.
///
/// `" /project//docs/ "` becomes `"project/docs"`.
pub fn normalize_domain(domain: &str) -> String {
    domain
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether `candidate` equals `domain`, or is nested under it.
pub fn domain_matches(candidate: &str, domain: &str, include_subdomains: bool) -> bool {
    if candidate == domain {
        return true;
    }
    include_subdomains
        && candidate.len() > domain.len()
        && candidate.starts_with(domain)
        && candidate.as_bytes().get(domain.len()) == Some(&b'/')
}

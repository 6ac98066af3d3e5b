//! The closed set of remote methods and their typed parameters.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::storage::Outcome;

/// Default number of entries returned by list-style reads.
pub const DEFAULT_LIMIT: usize = 10;
/// Upper bound accepted for `limit`.
pub const MAX_LIMIT: usize = 1000;

/// Every method the daemon answers. Anything else is `UNKNOWN_METHOD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    StoreKnowledge,
    GetKnowledge,
    GetKnowledgeByDomain,
    GetKnowledgeByTags,
    DeleteKnowledge,
    ProvideFeedback,
    QueryPatterns,
    BeginTrajectory,
    Flush,
    GetStatus,
    Ping,
    DescribeMethods,
}

impl Method {
    pub const ALL: [Method; 12] = [
        Self::StoreKnowledge,
        Self::GetKnowledge,
        Self::GetKnowledgeByDomain,
        Self::GetKnowledgeByTags,
        Self::DeleteKnowledge,
        Self::ProvideFeedback,
        Self::QueryPatterns,
        Self::BeginTrajectory,
        Self::Flush,
        Self::GetStatus,
        Self::Ping,
        Self::DescribeMethods,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreKnowledge => "storeKnowledge",
            Self::GetKnowledge => "getKnowledge",
            Self::GetKnowledgeByDomain => "getKnowledgeByDomain",
            Self::GetKnowledgeByTags => "getKnowledgeByTags",
            Self::DeleteKnowledge => "deleteKnowledge",
            Self::ProvideFeedback => "provideFeedback",
            Self::QueryPatterns => "queryPatterns",
            Self::BeginTrajectory => "beginTrajectory",
            Self::Flush => "flush",
            Self::GetStatus => "getStatus",
            Self::Ping => "ping",
            Self::DescribeMethods => "describeMethods",
        }
    }

    /// Whether the method mutates storage state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::StoreKnowledge | Self::DeleteKnowledge | Self::ProvideFeedback
        )
    }

    /// JSON schema describing this method's `params`.
    pub fn params_schema(&self) -> serde_json::Value {
        let schema = match self {
            Self::StoreKnowledge => schemars::schema_for!(StoreKnowledgeParams),
            Self::GetKnowledge | Self::DeleteKnowledge => schemars::schema_for!(IdParams),
            Self::GetKnowledgeByDomain => schemars::schema_for!(DomainQueryParams),
            Self::GetKnowledgeByTags => schemars::schema_for!(TagQueryParams),
            Self::ProvideFeedback => schemars::schema_for!(ProvideFeedbackParams),
            Self::QueryPatterns => schemars::schema_for!(QueryPatternsParams),
            Self::BeginTrajectory => schemars::schema_for!(BeginTrajectoryParams),
            Self::Flush | Self::GetStatus | Self::Ping | Self::DescribeMethods => {
                schemars::schema_for!(NoParams)
            }
        };
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    /// Deserialize and validate `params` for this method.
    pub fn parse_params<T>(&self, params: serde_json::Value) -> Result<T, RpcError>
    where
        T: DeserializeOwned + Validate,
    {
        let parsed: T = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(self.as_str(), e))?;
        parsed
            .validate()
            .map_err(|reason| RpcError::invalid_params(self.as_str(), reason))?;
        Ok(parsed)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RpcError::UnknownMethod(s.to_string()))
    }
}

/// Semantic checks that serde's shape validation cannot express.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{field} must be between 0.0 and 1.0"))
    }
}

fn check_limit(limit: Option<usize>) -> Result<(), String> {
    match limit {
        Some(l) if l == 0 || l > MAX_LIMIT => Err(format!("limit must be between 1 and {MAX_LIMIT}")),
        _ => Ok(()),
    }
}

fn check_not_blank(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StoreKnowledgeParams {
    #[schemars(description = "Opaque knowledge content")]
    pub content: String,

    #[schemars(description = "Hierarchical domain path, e.g. 'project/docs'")]
    pub domain: String,

    #[schemars(description = "Free-form category. Defaults to 'general'.")]
    pub category: Option<String>,

    #[schemars(description = "Tags used by getKnowledgeByTags")]
    pub tags: Option<Vec<String>>,

    #[schemars(description = "Quality score 0.0-1.0. Defaults to 0.5.")]
    pub quality: Option<f64>,

    #[schemars(description = "Optional JSON metadata blob")]
    pub metadata: Option<serde_json::Value>,
}

impl Validate for StoreKnowledgeParams {
    fn validate(&self) -> Result<(), String> {
        check_not_blank("content", &self.content)?;
        check_not_blank("domain", &self.domain)?;
        if let Some(q) = self.quality {
            check_unit_interval("quality", q)?;
        }
        if let Some(tags) = &self.tags {
            if tags.iter().any(|t| t.trim().is_empty()) {
                return Err("tags must not contain empty strings".into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdParams {
    #[schemars(description = "Knowledge entry id")]
    pub id: String,
}

impl Validate for IdParams {
    fn validate(&self) -> Result<(), String> {
        check_not_blank("id", &self.id)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DomainQueryParams {
    #[schemars(description = "Domain path to read, e.g. 'project/docs'")]
    pub domain: String,

    #[schemars(description = "Maximum entries to return (1-1000). Defaults to 10.")]
    pub limit: Option<usize>,

    #[schemars(description = "Also match nested domains such as 'project/docs/api'. Defaults to true.")]
    pub include_subdomains: Option<bool>,
}

impl Validate for DomainQueryParams {
    fn validate(&self) -> Result<(), String> {
        check_not_blank("domain", &self.domain)?;
        check_limit(self.limit)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TagQueryParams {
    #[schemars(description = "Tags to match")]
    pub tags: Vec<String>,

    #[schemars(description = "Require every tag instead of any. Defaults to false.")]
    pub match_all: Option<bool>,

    #[schemars(description = "Maximum entries to return (1-1000). Defaults to 10.")]
    pub limit: Option<usize>,
}

impl Validate for TagQueryParams {
    fn validate(&self) -> Result<(), String> {
        if self.tags.is_empty() {
            return Err("tags must not be empty".into());
        }
        check_limit(self.limit)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProvideFeedbackParams {
    #[schemars(description = "Identifier of the unit of work the feedback is about")]
    pub trajectory_id: String,

    #[schemars(description = "Outcome quality 0.0-1.0")]
    pub quality: f64,

    #[schemars(description = "'positive', 'negative' or 'neutral'. Derived from quality when omitted.")]
    pub outcome: Option<Outcome>,

    #[schemars(description = "Optional free-text feedback")]
    pub feedback: Option<String>,
}

impl Validate for ProvideFeedbackParams {
    fn validate(&self) -> Result<(), String> {
        check_not_blank("trajectoryId", &self.trajectory_id)?;
        check_unit_interval("quality", self.quality)
    }
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryPatternsParams {
    #[schemars(description = "Case-insensitive terms matched against content, category and tags")]
    pub query: Option<String>,

    #[schemars(description = "Restrict to a domain and its subdomains")]
    pub domain: Option<String>,

    #[schemars(description = "Restrict to a category")]
    pub category: Option<String>,

    #[schemars(description = "Minimum quality 0.0-1.0")]
    pub min_quality: Option<f64>,

    #[schemars(description = "Maximum entries to return (1-1000). Defaults to 10.")]
    pub limit: Option<usize>,
}

impl Validate for QueryPatternsParams {
    fn validate(&self) -> Result<(), String> {
        if let Some(q) = self.min_quality {
            check_unit_interval("minQuality", q)?;
        }
        check_limit(self.limit)
    }
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BeginTrajectoryParams {
    #[schemars(description = "Caller-chosen id. Generated when omitted.")]
    pub trajectory_id: Option<String>,

    #[schemars(description = "Optional human-readable label")]
    pub label: Option<String>,
}

impl Validate for BeginTrajectoryParams {
    fn validate(&self) -> Result<(), String> {
        match &self.trajectory_id {
            Some(id) => check_not_blank("trajectoryId", id),
            None => Ok(()),
        }
    }
}

/// Methods without parameters accept (and ignore) any object.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct NoParams {}

impl Validate for NoParams {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert!(matches!(
            "doesNotExist".parse::<Method>(),
            Err(RpcError::UnknownMethod(_))
        ));
    }

    #[test]
    fn store_params_are_validated() {
        let ok: StoreKnowledgeParams = Method::StoreKnowledge
            .parse_params(json!({"content": "x", "domain": "a/b", "quality": 0.9}))
            .unwrap();
        assert_eq!(ok.quality, Some(0.9));

        let err = Method::StoreKnowledge
            .parse_params::<StoreKnowledgeParams>(json!({"content": "x", "domain": "a", "quality": 1.5}))
            .unwrap_err();
        assert!(err.to_string().contains("quality"));

        let err = Method::StoreKnowledge
            .parse_params::<StoreKnowledgeParams>(json!({"content": "x"}))
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams { .. }));

        let err = Method::StoreKnowledge
            .parse_params::<StoreKnowledgeParams>(json!({"content": "x", "domain": "a", "qualty": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("qualty"));
    }

    #[test]
    fn limits_are_bounded() {
        let err = Method::GetKnowledgeByDomain
            .parse_params::<DomainQueryParams>(json!({"domain": "a", "limit": 0}))
            .unwrap_err();
        assert!(err.to_string().contains("limit"));

        let err = Method::GetKnowledgeByTags
            .parse_params::<TagQueryParams>(json!({"tags": []}))
            .unwrap_err();
        assert!(err.to_string().contains("tags"));
    }

    #[test]
    fn no_params_ignores_extra_fields() {
        Method::Ping
            .parse_params::<NoParams>(json!({"anything": true}))
            .unwrap();
    }

    #[test]
    fn every_method_has_a_schema() {
        for method in Method::ALL {
            assert!(method.params_schema().is_object(), "{method} has no schema");
        }
        let schema = Method::ProvideFeedback.params_schema();
        assert!(schema.to_string().contains("trajectoryId"));
    }
}

//! The seven ephemeral query/preview kinds: plain `{spec, status}` structs
//! served over a plain axum router standing in for the aggregated
//! API server's generic `create`-only storage.

use serde::{Deserialize, Serialize};

use crate::error::FieldError;
use crate::types::ActivityRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetRequest {
    pub field: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetResult {
    pub field: String,
    pub values: Vec<FacetValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetValue {
    pub value: String,
    pub count: u64,
}

/// Fields shared by every record-returning query surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpecCommon {
    #[serde(default = "default_start")]
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#continue: Option<String>,
}

fn default_start() -> String {
    "now-1h".to_string()
}

fn default_limit() -> u32 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatusCommon {
    pub effective_start_time: String,
    pub effective_end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#continue: Option<String>,
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

macro_rules! ephemeral_kind {
    ($spec:ident, $status:ident, $record:ty) => {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $spec {
            #[serde(flatten)]
            pub common: QuerySpecCommon,
        }

        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $status {
            #[serde(flatten)]
            pub common: QueryStatusCommon,
            #[serde(default)]
            pub items: Vec<$record>,
        }
    };
}

ephemeral_kind!(AuditLogQuerySpec, AuditLogQueryStatus, crate::types::AuditRecord);
ephemeral_kind!(EventQuerySpec, EventQueryStatus, crate::types::ClusterEventRecord);
ephemeral_kind!(ActivityQuerySpec, ActivityQueryStatus, ActivityRecord);

macro_rules! facet_kind {
    ($spec:ident, $status:ident) => {
        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $spec {
            #[serde(flatten)]
            pub common: QuerySpecCommon,
            pub facets: Vec<FacetRequest>,
        }

        #[derive(Debug, Clone, Default, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $status {
            #[serde(flatten)]
            pub common: QueryStatusCommon,
            #[serde(default)]
            pub results: Vec<FacetResult>,
        }
    };
}

facet_kind!(AuditLogFacetsQuerySpec, AuditLogFacetsQueryStatus);
facet_kind!(ActivityFacetQuerySpec, ActivityFacetQueryStatus);
facet_kind!(EventFacetQuerySpec, EventFacetQueryStatus);

/// Event-specific field selector, appended to the common skeleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuerySpecExt {
    #[serde(flatten)]
    pub base: EventQuerySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPreviewSample {
    pub record: serde_json::Value,
    pub actor: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPreviewSpec {
    pub kind: crate::policy::RuleKind,
    pub rules: Vec<crate::crd::PolicyRule>,
    pub samples: Vec<PolicyPreviewSample>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPreviewStatus {
    pub results: Vec<crate::policy::PreviewResult>,
}

//! JSON documents exchanged with the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SaveOptions {
    pub save_type: String,
    pub save_state_file_path: String,
}

impl SaveOptions {
    pub fn to_file(path: &Path) -> Self {
        Self {
            save_type: "ToFile".to_string(),
            save_state_file_path: path.display().to_string(),
        }
    }
}

/// Compute system property query. Each requested property maps to null.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyQuery {
    pub queries: BTreeMap<String, Value>,
}

impl PropertyQuery {
    pub fn basic(vm_version: bool) -> Self {
        let mut queries = BTreeMap::new();
        queries.insert("Basic".to_string(), Value::Null);
        if vm_version {
            queries.insert("VmVersion".to_string(), Value::Null);
        }
        Self { queries }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServicePropertyQuery {
    pub property_queries: BTreeMap<String, Value>,
}

impl Default for ServicePropertyQuery {
    fn default() -> Self {
        let property_queries = ["Basic", "ProcessorCapabilities"]
            .into_iter()
            .map(|name| (name.to_string(), Value::Null))
            .collect();
        Self { property_queries }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_request: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Response<T> {
    pub response: T,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct BasicProperties {
    pub state: String,
    pub runtime_id: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemPropertyResponses {
    pub basic: Response<BasicProperties>,
    pub vm_version: Option<Response<Version>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemProperties {
    pub property_responses: SystemPropertyResponses,
}

/// One row of a system enumeration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemSummary {
    pub id: String,
    pub name: String,
    pub system_type: String,
    pub owner: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceBasic {
    pub supported_schema_versions: Vec<Version>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServicePropertyResponses {
    pub basic: Response<ServiceBasic>,
    pub processor_capabilities: Response<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceProperties {
    pub property_responses: ServicePropertyResponses,
}

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "lds-conformance-log-v1";

/// One forensic record per fixture case, emitted as a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub fixture_id: String,
    pub scenario_id: String,
    pub case_id: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        case_id: &str,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            fixture_id: fixture_id.to_string(),
            scenario_id: format!("{suite_id}/{case_id}"),
            case_id: case_id.to_string(),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(fields);
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

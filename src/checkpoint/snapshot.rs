/*!
Snapshot (de)serialization for workflow records.

Design goals, in the same spirit as the rest of the persistence layer:

- Explicit serde-friendly structs decoupled from the in-memory
  representation, with conversion logic localized in `From` / `TryFrom`.
- Timestamps as RFC3339 strings carrying UTC; parsing restores `Utc` kind.
- Empty collections serialize as empty (`[]` / `{}`), never disappear;
  absent optionals are omitted from output.
- Unicode content passes through untouched.

This module performs no I/O; it is pure data transformation.
*/

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use chrono::{DateTime, Utc};

use crate::checkpoint::model::SNAPSHOT_SCHEMA_VERSION;
use crate::message::Message;
use crate::workflow::WorkflowRecord;

/// Serialization errors for snapshot encode/decode.
#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {source}")]
    #[diagnostic(
        code(wayfarer::snapshot::parse),
        help("The snapshot text must be a JSON object produced by this engine.")
    )]
    Parse {
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot could not be encoded: {source}")]
    #[diagnostic(code(wayfarer::snapshot::encode))]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot field {field} holds an invalid timestamp: {value}")]
    #[diagnostic(
        code(wayfarer::snapshot::timestamp),
        help("Timestamps must be RFC3339 with an explicit offset.")
    )]
    BadTimestamp {
        field: &'static str,
        value: String,
    },
}

/// Persisted shape of one log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedMessage {
    pub role: String,
    pub content: String,
    /// RFC3339 string form; keeps chrono types out of the serialized shape.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Persisted shape of the full workflow record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedWorkflow {
    pub workflow_id: String,
    pub workflow_type: String,
    pub user_input: String,
    pub started_at: String,
    pub current_stage_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent_id: Option<String>,
    #[serde(default)]
    pub completed_agents: Vec<String>,
    #[serde(default)]
    pub stage_results: FxHashMap<String, String>,
    #[serde(default)]
    pub log: Vec<PersistedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SNAPSHOT_SCHEMA_VERSION
}

/* ---------- Message <-> PersistedMessage ---------- */

impl From<&Message> for PersistedMessage {
    fn from(m: &Message) -> Self {
        PersistedMessage {
            role: m.role.clone(),
            content: m.content.clone(),
            timestamp: m.timestamp.to_rfc3339(),
            agent_id: m.agent_id.clone(),
        }
    }
}

impl TryFrom<PersistedMessage> for Message {
    type Error = SnapshotError;

    fn try_from(p: PersistedMessage) -> Result<Self, SnapshotError> {
        let timestamp = parse_utc("log.timestamp", &p.timestamp)?;
        Ok(Message {
            role: p.role,
            content: p.content,
            timestamp,
            agent_id: p.agent_id,
        })
    }
}

/* ---------- WorkflowRecord <-> PersistedWorkflow ---------- */

impl From<&WorkflowRecord> for PersistedWorkflow {
    fn from(record: &WorkflowRecord) -> Self {
        PersistedWorkflow {
            workflow_id: record.workflow_id.clone(),
            workflow_type: record.workflow_type.clone(),
            user_input: record.user_input.clone(),
            started_at: record.started_at.to_rfc3339(),
            current_stage_index: record.current_stage_index,
            current_agent_id: record.current_agent_id.clone(),
            completed_agents: record.completed_agents.clone(),
            stage_results: record.stage_results.clone(),
            log: record.log.iter().map(PersistedMessage::from).collect(),
            paused_at: record.paused_at.map(|t| t.to_rfc3339()),
            pause_reason: record.pause_reason.clone(),
            is_paused: record.is_paused,
            metadata: record.metadata.clone(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
        }
    }
}

impl TryFrom<PersistedWorkflow> for WorkflowRecord {
    type Error = SnapshotError;

    fn try_from(p: PersistedWorkflow) -> Result<Self, SnapshotError> {
        let started_at = parse_utc("started_at", &p.started_at)?;
        let paused_at = match p.paused_at {
            Some(raw) => Some(parse_utc("paused_at", &raw)?),
            None => None,
        };
        let log = p
            .log
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WorkflowRecord {
            workflow_id: p.workflow_id,
            workflow_type: p.workflow_type,
            user_input: p.user_input,
            started_at,
            current_stage_index: p.current_stage_index,
            current_agent_id: p.current_agent_id,
            completed_agents: p.completed_agents,
            stage_results: p.stage_results,
            log,
            paused_at,
            pause_reason: p.pause_reason,
            is_paused: p.is_paused,
            metadata: p.metadata,
        })
    }
}

fn parse_utc(field: &'static str, raw: &str) -> Result<DateTime<Utc>, SnapshotError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SnapshotError::BadTimestamp {
            field,
            value: raw.to_string(),
        })
}

/// Serialize a workflow record into snapshot text.
pub fn encode_snapshot(record: &WorkflowRecord) -> Result<String, SnapshotError> {
    serde_json::to_string(&PersistedWorkflow::from(record))
        .map_err(|source| SnapshotError::Encode { source })
}

/// Restore a workflow record from snapshot text.
pub fn decode_snapshot(text: &str) -> Result<WorkflowRecord, SnapshotError> {
    let persisted: PersistedWorkflow =
        serde_json::from_str(text).map_err(|source| SnapshotError::Parse { source })?;
    WorkflowRecord::try_from(persisted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> WorkflowRecord {
        let mut record = WorkflowRecord::new("wf_x", "research", "What is 量子計算?");
        record.append_message(Message::user("What is 量子計算?"));
        record.append_message(Message::assistant("Query is clear").tagged("clarify"));
        record.record_stage_result("clarify", "Query is clear".into());
        record.current_agent_id = Some("brief".into());
        record
            .metadata
            .insert("locale".into(), serde_json::json!("ja-JP"));
        record
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let original = sample_record();
        let text = encode_snapshot(&original).unwrap();
        let restored = decode_snapshot(&text).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn unicode_survives_the_round_trip() {
        let record = sample_record();
        let text = encode_snapshot(&record).unwrap();
        let restored = decode_snapshot(&text).unwrap();
        assert_eq!(restored.user_input, "What is 量子計算?");
    }

    #[test]
    fn timestamps_restore_with_utc_kind() {
        let record = sample_record();
        let restored = decode_snapshot(&encode_snapshot(&record).unwrap()).unwrap();
        assert_eq!(restored.started_at.timezone(), Utc);
        assert_eq!(restored.started_at, record.started_at);
    }

    #[test]
    fn empty_collections_serialize_as_empty() {
        let record = WorkflowRecord::new("wf_x", "research", "input");
        let text = encode_snapshot(&record).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["completed_agents"].as_array().unwrap().is_empty());
        assert!(value["stage_results"].as_object().unwrap().is_empty());
        assert!(value["log"].as_array().unwrap().is_empty());
        // Absent optionals are omitted entirely.
        assert!(value.get("paused_at").is_none());
    }

    #[test]
    fn malformed_text_reports_invalid_json() {
        let err = decode_snapshot("{ invalid json content without closing").unwrap_err();
        assert!(err.to_string().contains("not valid JSON"), "{err}");
    }

    #[test]
    fn bad_timestamp_is_reported_by_field() {
        let text = encode_snapshot(&sample_record())
            .unwrap()
            .replace(char::is_numeric, "x");
        // Either the JSON no longer parses or the timestamp is rejected;
        // both are SnapshotError.
        assert!(decode_snapshot(&text).is_err());
    }
}

//! # Workflow State Codec
//!
//! The only place that touches the untyped session metadata. A stored value
//! may arrive in one of three physical encodings depending on which writer
//! produced it:
//!
//! - a structured JSON object
//! - raw bytes (a JSON array of `u8`) holding JSON text
//! - a string holding base64 of JSON text, or JSON text directly
//!
//! All three normalize to the same typed record. Anything else decodes to a
//! fresh record with a warning; decoding never fails the caller.

use crate::constants::metadata_keys;
use crate::error::{EngineError, EngineResult};
use crate::models::{DeploymentFailureTracking, Session, WorkflowState};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Physical encoding a metadata value was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Structured,
    Bytes,
    Base64String,
    JsonString,
}

/// Normalize a stored metadata value to a JSON object
pub fn normalize(value: &Value) -> Option<(Map<String, Value>, Encoding)> {
    match value {
        Value::Object(map) => Some((map.clone(), Encoding::Structured)),
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()?;
            parse_object(&bytes).map(|map| (map, Encoding::Bytes))
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(bytes) = BASE64.decode(trimmed) {
                if let Some(map) = parse_object(&bytes) {
                    return Some((map, Encoding::Base64String));
                }
            }
            parse_object(trimmed.as_bytes()).map(|map| (map, Encoding::JsonString))
        }
        _ => None,
    }
}

fn parse_object(bytes: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Decode a typed record from any accepted encoding
pub fn decode<T: DeserializeOwned>(value: &Value) -> EngineResult<T> {
    let (map, _) = normalize(value).ok_or_else(|| {
        EngineError::Serialization(format!(
            "unrecognized metadata encoding ({})",
            value_kind(value)
        ))
    })?;
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Records are always written in the structured encoding
pub fn encode<T: Serialize>(record: &T) -> EngineResult<Value> {
    Ok(serde_json::to_value(record)?)
}

/// Workflow state stored on `session`, or a fresh one
pub fn workflow_state_from_session(session: &Session) -> WorkflowState {
    let Some(raw) = session.metadata.get(metadata_keys::WORKFLOW_STATE) else {
        return WorkflowState::new(&session.id);
    };

    match decode::<WorkflowState>(raw) {
        Ok(mut state) => {
            // the record is keyed by the session, never by what was written inside it
            state.session_id = session.id.clone();
            state
        }
        Err(e) => {
            warn!(
                session_id = %session.id,
                error = %e,
                "Failed to decode workflow state, starting fresh"
            );
            WorkflowState::new(&session.id)
        }
    }
}

pub fn store_workflow_state(session: &mut Session, state: &WorkflowState) -> EngineResult<()> {
    let value = encode(state)?;
    session
        .metadata
        .insert(metadata_keys::WORKFLOW_STATE.to_string(), value);
    Ok(())
}

/// Deploy failure tracking stored on `session`, or an empty record
pub fn failure_tracking_from_session(session: &Session) -> DeploymentFailureTracking {
    let Some(raw) = session.metadata.get(metadata_keys::DEPLOYMENT_FAILURE_TRACKING) else {
        return DeploymentFailureTracking::default();
    };

    decode(raw).unwrap_or_else(|e| {
        warn!(
            session_id = %session.id,
            error = %e,
            "Failed to decode deployment failure tracking, starting fresh"
        );
        DeploymentFailureTracking::default()
    })
}

pub fn store_failure_tracking(
    session: &mut Session,
    tracking: &DeploymentFailureTracking,
) -> EngineResult<()> {
    let value = encode(tracking)?;
    session
        .metadata
        .insert(metadata_keys::DEPLOYMENT_FAILURE_TRACKING.to_string(), value);
    Ok(())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

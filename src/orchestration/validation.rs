//! Input validation for step requests.
//!
//! Runs before any state is touched: every failure here is an
//! [`EngineError::Validation`] and the session is left as it was. Besides the
//! per-step required parameters, caller-supplied JSON is bounded in size and
//! depth because it ends up persisted in session metadata.

use crate::constants::{params, steps};
use crate::error::{EngineError, EngineResult};
use crate::orchestration::step_sequence::StepSequence;
use crate::orchestration::types::StepRequest;
use serde_json::{Map, Value};

/// Maximum serialized size of a request's parameters (1MB)
const MAX_JSON_SIZE_BYTES: usize = 1024 * 1024;

/// Maximum nesting depth for JSON objects/arrays
const MAX_JSON_DEPTH: usize = 10;

/// Maximum number of keys in a JSON object or items in an array
const MAX_JSON_KEYS: usize = 1000;

const MAX_JSON_STRING_LENGTH: usize = 10000;

/// Required non-empty string parameters for `step`
pub fn required_params(step: &str) -> &'static [&'static str] {
    match step {
        steps::ANALYZE_REPOSITORY => &[params::SESSION_ID, params::REPO_PATH],
        _ => &[params::SESSION_ID],
    }
}

/// Check a request against the step schema and the JSON bounds
pub fn validate_step_request(request: &StepRequest, sequence: &StepSequence) -> EngineResult<()> {
    if request.step.trim().is_empty() {
        return Err(EngineError::validation("step name is required"));
    }
    if !sequence.contains(&request.step) {
        return Err(EngineError::validation(format!(
            "unknown step: {}",
            request.step
        )));
    }
    if request.session_id.trim().is_empty() {
        return Err(EngineError::validation(format!(
            "{} is required",
            params::SESSION_ID
        )));
    }
    if request.attempt == 0 {
        return Err(EngineError::validation("attempt numbers start at 1"));
    }

    for key in required_params(&request.step) {
        if *key == params::SESSION_ID {
            continue;
        }
        match request.params.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(EngineError::validation(format!(
                    "{key} is required for {}",
                    request.step
                )));
            }
            Some(_) => {
                return Err(EngineError::validation(format!("{key} must be a string")));
            }
        }
    }

    // a session id in params must agree with the request's
    if let Some(value) = request.params.get(params::SESSION_ID) {
        if value.as_str() != Some(request.session_id.as_str()) {
            return Err(EngineError::validation(format!(
                "{} in params does not match the request",
                params::SESSION_ID
            )));
        }
    }

    validate_params(&request.params)
}

/// Validate a repository path handed to `start_workflow`
pub fn validate_repo_path(repo_path: &str) -> EngineResult<()> {
    if repo_path.trim().is_empty() {
        return Err(EngineError::validation(format!(
            "{} is required",
            params::REPO_PATH
        )));
    }
    if repo_path.len() > MAX_JSON_STRING_LENGTH {
        return Err(EngineError::validation(format!(
            "{} too long: {} chars (max: {MAX_JSON_STRING_LENGTH})",
            params::REPO_PATH,
            repo_path.len()
        )));
    }
    Ok(())
}

/// Size and structure bounds for caller-supplied parameters
pub fn validate_params(params: &Map<String, Value>) -> EngineResult<()> {
    let serialized = serde_json::to_string(params)
        .map_err(|e| EngineError::validation(format!("Invalid JSON structure: {e}")))?;
    if serialized.len() > MAX_JSON_SIZE_BYTES {
        return Err(EngineError::validation(format!(
            "JSON payload too large: {} bytes (max: {MAX_JSON_SIZE_BYTES})",
            serialized.len()
        )));
    }
    for value in params.values() {
        validate_json_depth(value, 1)?;
    }
    Ok(())
}

fn validate_json_depth(value: &Value, current_depth: usize) -> EngineResult<()> {
    if current_depth > MAX_JSON_DEPTH {
        return Err(EngineError::validation(format!(
            "JSON nesting too deep: {current_depth} (max: {MAX_JSON_DEPTH})"
        )));
    }

    match value {
        Value::Object(map) => {
            if map.len() > MAX_JSON_KEYS {
                return Err(EngineError::validation(format!(
                    "Too many JSON keys: {} (max: {MAX_JSON_KEYS})",
                    map.len()
                )));
            }
            for (key, val) in map {
                if key.len() > MAX_JSON_STRING_LENGTH {
                    return Err(EngineError::validation(format!(
                        "JSON key too long: {} chars (max: {MAX_JSON_STRING_LENGTH})",
                        key.len()
                    )));
                }
                validate_json_depth(val, current_depth + 1)?;
            }
        }
        Value::Array(items) => {
            if items.len() > MAX_JSON_KEYS {
                return Err(EngineError::validation(format!(
                    "JSON array too large: {} items (max: {MAX_JSON_KEYS})",
                    items.len()
                )));
            }
            for item in items {
                validate_json_depth(item, current_depth + 1)?;
            }
        }
        Value::String(s) if s.len() > MAX_JSON_STRING_LENGTH => {
            return Err(EngineError::validation(format!(
                "JSON string too long: {} chars (max: {MAX_JSON_STRING_LENGTH})",
                s.len()
            )));
        }
        _ => {}
    }

    Ok(())
}

//! Structural validation of `/predict` request bodies
//!
//! Validation runs on the raw JSON value before typed deserialization so
//! that rejections name the offending field and instance, and so that
//! disallowed fields are caught even when serde would silently ignore them.

use crate::error::{GatewayError, Result};
use crate::models::InferenceRequest;
use serde_json::Value;
use tracing::debug;

/// Fields a client may not send; image data is always fetched by reference
const FORBIDDEN_FIELDS: [&str; 2] = ["raw_image_bytes", "image_file_uri"];

/// Validate a decoded request body
///
/// # Logic
/// The body must be an object with a non-empty `instances` array. For every
/// instance, in order:
/// 1. `dicom_path.series_path` must be a non-empty string
/// 2. `patch_coordinates` must be a non-empty list
/// 3. `raw_image_bytes` must be absent
/// 4. `image_file_uri` must be absent
///
/// The first violation fails the whole request.
pub fn validate(body: &Value) -> Result<()> {
    let instances = body
        .get("instances")
        .ok_or_else(|| invalid("request body must contain an 'instances' list"))?
        .as_array()
        .ok_or_else(|| invalid("'instances' must be a list"))?;

    if instances.is_empty() {
        return Err(invalid("'instances' must not be empty"));
    }

    for (index, instance) in instances.iter().enumerate() {
        validate_instance(index, instance)?;
    }

    debug!("Validated request with {} instance(s)", instances.len());
    Ok(())
}

fn validate_instance(index: usize, instance: &Value) -> Result<()> {
    let fields = instance
        .as_object()
        .ok_or_else(|| invalid(format!("instance {} must be an object", index)))?;

    let series_path = fields
        .get("dicom_path")
        .and_then(|path| path.get("series_path"))
        .and_then(Value::as_str);
    match series_path {
        Some(path) if !path.trim().is_empty() => {}
        _ => {
            return Err(invalid(format!(
                "instance {} must contain 'dicom_path' with a non-empty 'series_path'",
                index
            )))
        }
    }

    let has_patches = fields
        .get("patch_coordinates")
        .and_then(Value::as_array)
        .is_some_and(|patches| !patches.is_empty());
    if !has_patches {
        return Err(invalid(format!(
            "instance {} must contain a non-empty 'patch_coordinates' list",
            index
        )));
    }

    for field in FORBIDDEN_FIELDS {
        if fields.contains_key(field) {
            return Err(invalid(format!(
                "instance {} must not contain '{}'",
                index, field
            )));
        }
    }

    Ok(())
}

/// Decode, validate and type a request body
pub fn parse_request(body: &[u8]) -> Result<InferenceRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| invalid(format!("request body is not valid JSON: {}", e)))?;

    validate(&value)?;

    serde_json::from_value(value).map_err(|e| invalid(format!("invalid request: {}", e)))
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::Validation(message.into())
}

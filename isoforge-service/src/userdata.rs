// User Data
// Checks on the autoinstall document injected into the image

use crate::error::{ServiceError, ServiceResult};

use serde_yaml::Value;

pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

const AUTOINSTALL_KEY: &str = "autoinstall";

/// Reject user-data the installer would not act on: empty documents,
/// invalid YAML, non-mapping roots and documents without `autoinstall`
pub fn validate(user_data: &[u8]) -> ServiceResult<()> {
    let text = std::str::from_utf8(user_data)
        .map_err(|e| ServiceError::Validation(format!("user-data is not UTF-8: {}", e)))?;

    if text.trim().is_empty() {
        return Err(ServiceError::Validation("user-data is empty".to_string()));
    }

    let document: Value = serde_yaml::from_str(text)
        .map_err(|e| ServiceError::Validation(format!("user-data is not valid YAML: {}", e)))?;

    let Value::Mapping(mapping) = document else {
        return Err(ServiceError::Validation(
            "user-data must be a YAML mapping".to_string(),
        ));
    };

    if !mapping.contains_key(AUTOINSTALL_KEY) {
        return Err(ServiceError::Validation(format!(
            "user-data has no top-level '{}' section",
            AUTOINSTALL_KEY
        )));
    }

    Ok(())
}

/// Prepend `#cloud-config` when the document does not start with it
pub fn with_cloud_config_header(user_data: &[u8]) -> Vec<u8> {
    if user_data.starts_with(CLOUD_CONFIG_HEADER.as_bytes()) {
        return user_data.to_vec();
    }

    let mut out = Vec::with_capacity(CLOUD_CONFIG_HEADER.len() + 1 + user_data.len());
    out.extend_from_slice(CLOUD_CONFIG_HEADER.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(user_data);
    out
}

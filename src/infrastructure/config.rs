use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const ENFORCEMENT_JSON: &str = "enforcement.json";

pub const DEFAULT_SERVER_BASE_URL: &str = "https://appfence.example.com";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_STATUS_POLL_SECONDS: u64 = 60;

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "AppFence",
                "serverBaseUrl": DEFAULT_SERVER_BASE_URL,
                "requestTimeoutSeconds": DEFAULT_REQUEST_TIMEOUT_SECONDS,
                "statusPollSeconds": DEFAULT_STATUS_POLL_SECONDS
            }),
        ),
        (
            ENFORCEMENT_JSON,
            serde_json::json!({
                "schema": 1,
                "attemptLogCapacity": 100
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn read_server_base_url(config_dir: &Path) -> Result<String, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let base_url = app
        .get("serverBaseUrl")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_SERVER_BASE_URL);
    Ok(base_url.trim_end_matches('/').to_string())
}

pub fn read_request_timeout_seconds(config_dir: &Path) -> Result<u64, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let timeout = app
        .get("requestTimeoutSeconds")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS);
    if timeout == 0 {
        return Err(InfraError::InvalidConfig(
            "requestTimeoutSeconds must be > 0".to_string(),
        ));
    }
    Ok(timeout)
}

pub fn read_status_poll_seconds(config_dir: &Path) -> Result<u64, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    Ok(app
        .get("statusPollSeconds")
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_STATUS_POLL_SECONDS))
}

pub fn read_attempt_log_capacity(config_dir: &Path) -> Result<usize, InfraError> {
    let enforcement = read_config(&config_dir.join(ENFORCEMENT_JSON))?;
    Ok(enforcement
        .get("attemptLogCapacity")
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .unwrap_or(100) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_config_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "appfence-config-{tag}-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).expect("create temp config dir");
        dir
    }

    #[test]
    fn defaults_are_written_once_and_readable() {
        let dir = temp_config_dir("defaults");
        ensure_default_configs(&dir).expect("write defaults");

        assert_eq!(
            read_server_base_url(&dir).expect("base url"),
            DEFAULT_SERVER_BASE_URL
        );
        assert_eq!(
            read_request_timeout_seconds(&dir).expect("timeout"),
            DEFAULT_REQUEST_TIMEOUT_SECONDS
        );
        assert_eq!(read_attempt_log_capacity(&dir).expect("capacity"), 100);
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = temp_config_dir("schema");
        fs::write(
            dir.join(APP_JSON),
            serde_json::json!({"schema": 2, "serverBaseUrl": "https://x"}).to_string(),
        )
        .expect("write config");

        assert!(matches!(
            read_server_base_url(&dir),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn trailing_slash_is_stripped_from_base_url() {
        let dir = temp_config_dir("slash");
        fs::write(
            dir.join(APP_JSON),
            serde_json::json!({"schema": 1, "serverBaseUrl": "https://fence.test/"}).to_string(),
        )
        .expect("write config");

        assert_eq!(
            read_server_base_url(&dir).expect("base url"),
            "https://fence.test"
        );
    }
}

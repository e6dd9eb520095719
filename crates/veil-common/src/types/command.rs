//! Command surface wire envelope
//!
//! Each request names a command from the fixed method table and carries its
//! parameters as loose JSON; the optional `id` is echoed back unchanged so
//! clients can correlate responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Command-specific parameters; unknown keys are preserved
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            id: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            success: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            id,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_flattens_params() {
        let raw = r#"{"command":"memory.read","id":"7","address":"0x1000","size":"4"}"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(request.command, "memory.read");
        assert_eq!(request.id.as_deref(), Some("7"));
        assert_eq!(request.param("address"), Some(&json!("0x1000")));
        assert_eq!(request.param("size"), Some(&json!("4")));
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new("pattern.scan").with_param("pattern", json!("DE AD ?? EF"));
        assert_eq!(request.param("pattern"), Some(&json!("DE AD ?? EF")));
        assert!(request.id.is_none());
    }

    #[test]
    fn test_response_ok_shape() {
        let response = Response::ok(Some("9".to_string()), json!({"pong": true}));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"id\":\"9\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_response_fail_shape() {
        let response = Response::fail(None, "Missing address parameter");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("Missing address parameter"));
        assert!(!json.contains("data"));
        assert!(!json.contains("id"));
    }
}

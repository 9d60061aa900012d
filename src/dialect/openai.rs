//! OpenAI inbound dialect: the canonical representation is already this wire
//! format, so parsing is deserialization and rendering is identity.

use serde_json::Value;

use crate::handler::GatewayError;
use crate::llm::universal;

pub fn parse_request(body: &Value) -> Result<universal::Request, GatewayError> {
	serde_json::from_value(body.clone())
		.map_err(|e| GatewayError::new(400, format!("invalid request body: {e}")))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn parse_is_deserialization() {
		let req = parse_request(&json!({
			"model": "gpt-4o",
			"messages": [{"role": "user", "content": "hi"}],
			"stream": true
		}))
		.unwrap();
		assert_eq!(req.model, "gpt-4o");
		assert!(req.stream());
	}

	#[test]
	fn missing_model_is_a_client_error() {
		let err = parse_request(&json!({"messages": []})).unwrap_err();
		assert_eq!(err.status, 400);
	}
}

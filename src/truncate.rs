//! Depth-aware truncation for raw request/response capture.
//!
//! Captured bodies can be arbitrarily large (a 100 KB stream tail, a payload
//! with a megabyte of base64). Stored rows must stay readable in a viewer, so
//! truncation preserves JSON structure instead of slicing bytes.

use serde_json::{Map, Value};

pub const MAX_STRING_LEN: usize = 500;
pub const MAX_LIST_ITEMS: usize = 20;
pub const MAX_MAP_KEYS: usize = 30;
pub const MAX_DEPTH: usize = 10;

/// Truncate a JSON value: strings to 500 chars, lists to 20 elements, maps to
/// 30 keys, nesting to depth 10. Anything deeper collapses to a marker string.
pub fn truncate_value(value: &Value, depth: usize) -> Value {
	if depth >= MAX_DEPTH {
		return Value::String("...(max depth)".to_string());
	}
	match value {
		Value::String(s) => Value::String(truncate_str(s)),
		Value::Array(items) => {
			let mut out: Vec<Value> = items
				.iter()
				.take(MAX_LIST_ITEMS)
				.map(|v| truncate_value(v, depth + 1))
				.collect();
			if items.len() > MAX_LIST_ITEMS {
				out.push(Value::String(format!(
					"...({} more items)",
					items.len() - MAX_LIST_ITEMS
				)));
			}
			Value::Array(out)
		},
		Value::Object(map) => {
			let mut out = Map::new();
			for (k, v) in map.iter().take(MAX_MAP_KEYS) {
				out.insert(k.clone(), truncate_value(v, depth + 1));
			}
			if map.len() > MAX_MAP_KEYS {
				out.insert(
					"...".to_string(),
					Value::String(format!("({} more keys)", map.len() - MAX_MAP_KEYS)),
				);
			}
			Value::Object(out)
		},
		other => other.clone(),
	}
}

fn truncate_str(s: &str) -> String {
	if s.chars().count() <= MAX_STRING_LEN {
		return s.to_string();
	}
	let kept: String = s.chars().take(MAX_STRING_LEN).collect();
	format!("{kept}...(truncated, {} chars total)", s.chars().count())
}

/// Truncate arbitrary captured bytes for storage. JSON input keeps its
/// structure; anything else is decoded with replacement and clipped.
pub fn truncate_for_logging(raw: &[u8]) -> String {
	let text = String::from_utf8_lossy(raw);
	match serde_json::from_str::<Value>(&text) {
		Ok(v) => truncate_value(&v, 0).to_string(),
		Err(_) => truncate_str(&text),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn long_strings_are_clipped() {
		let v = json!({"body": "x".repeat(2000)});
		let out = truncate_value(&v, 0);
		let s = out["body"].as_str().unwrap();
		assert!(s.starts_with(&"x".repeat(500)));
		assert!(s.contains("2000 chars total"));
	}

	#[test]
	fn lists_and_maps_are_capped() {
		let v = json!((0..50).collect::<Vec<i32>>());
		let out = truncate_value(&v, 0);
		let arr = out.as_array().unwrap();
		assert_eq!(arr.len(), MAX_LIST_ITEMS + 1);
		assert_eq!(arr.last().unwrap(), &json!("...(30 more items)"));

		let mut map = Map::new();
		for i in 0..40 {
			map.insert(format!("k{i:02}"), json!(i));
		}
		let out = truncate_value(&Value::Object(map), 0);
		assert_eq!(out.as_object().unwrap().len(), MAX_MAP_KEYS + 1);
	}

	#[test]
	fn deep_nesting_collapses() {
		let mut v = json!("leaf");
		for _ in 0..20 {
			v = json!({ "inner": v });
		}
		let out = truncate_value(&v, 0);
		let text = out.to_string();
		assert!(text.contains("max depth"));
	}

	#[test]
	fn non_json_bytes_fall_back_to_lossy_text() {
		let out = truncate_for_logging(b"plain \xff text");
		assert!(out.contains("plain"));
	}
}

//! Field-name normalization for Electrum JSON.
//!
//! Electrum servers speak snake_case (`tx_hash`, `block_height`, `tx_pos`). Every object key that
//! crosses the wire, in either direction, is passed through [`to_snake_case`] so that
//! PascalCase/camelCase producers still line up with the typed results.

use serde_json::{Map, Value};

/// Converts a PascalCase or camelCase name to snake_case.
///
/// An `_` is inserted before every internal uppercase letter and before the first digit of every
/// internal digit run, unless the previous character already is `_`; the result is lowercased.
/// Already snake_cased input is returned unchanged, so the transform is idempotent.
pub fn to_snake_case(name: &str) -> String {
	let mut out = String::with_capacity(name.len() + 4);
	let mut prev: Option<char> = None;

	for c in name.chars() {
		if let Some(p) = prev {
			let starts_word = c.is_ascii_uppercase() || (c.is_ascii_digit() && !p.is_ascii_digit());
			if starts_word && p != '_' {
				out.push('_');
			}
		}
		out.push(c.to_ascii_lowercase());
		prev = Some(c);
	}

	out
}

/// Recursively renames every object key in `value` with [`to_snake_case`].
pub fn snake_case_keys(value: Value) -> Value {
	match value {
		Value::Object(map) => Value::Object(
			map.into_iter()
				.map(|(key, inner)| (to_snake_case(&key), snake_case_keys(inner)))
				.collect::<Map<String, Value>>(),
		),
		Value::Array(items) => Value::Array(items.into_iter().map(snake_case_keys).collect()),
		other => other,
	}
}

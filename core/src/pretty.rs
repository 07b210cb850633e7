//! Indented JSON rendering for diagnostics.

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};

/// Renders `value` as four-space indented JSON.
///
/// Lossy: a value that cannot be serialized (for example a map with
/// non-string keys) renders as an empty string. Use [`try_jsonify`] when the
/// failure matters.
pub fn jsonify<T: Serialize + ?Sized>(value: &T) -> String {
    try_jsonify(value).unwrap_or_default()
}

pub fn try_jsonify<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

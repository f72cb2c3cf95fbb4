//! Metadata documents.
//!
//! Extractors produce [`Fragment`]s: maps of named top-level sections. The
//! pipeline merges fragments section by section; the stores persist the
//! merged document after normalizing it with a tree walk.

use serde_json::{Map, Value};

/// Partial metadata document produced by one extractor
pub type Fragment = Map<String, Value>;

/// Merge `other` into `into`, replacing whole sections on key collision.
///
/// Sections are not deep-merged: the later fragment wins per top-level key.
pub fn merge(into: &mut Fragment, other: Fragment) {
    for (section, value) in other {
        into.insert(section, value);
    }
}

/// Rebuild `value` with every scalar leaf passed through `f`.
///
/// Maps and lists are walked recursively and rebuilt, so the input tree is
/// consumed rather than mutated behind shared references.
pub fn map_scalars<F>(value: Value, f: &F) -> Value
where
    F: Fn(Value) -> Value,
{
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, map_scalars(v, f)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| map_scalars(v, f)).collect())
        }
        scalar => f(scalar),
    }
}

/// Remove NUL characters from every string leaf and map key.
///
/// PostgreSQL `jsonb` rejects `\u0000`, which EXIF and label payloads can
/// carry.
pub fn strip_nul(value: Value) -> Value {
    let stripped = map_scalars(value, &|scalar| match scalar {
        Value::String(s) if s.contains('\0') => Value::String(s.replace('\0', "")),
        other => other,
    });
    strip_nul_keys(stripped)
}

fn strip_nul_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.replace('\0', ""), strip_nul_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nul_keys).collect()),
        scalar => scalar,
    }
}

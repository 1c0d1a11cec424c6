//! Canonical JSON and projection hashing.
//!
//! Canonical form: UTF-8 JSON, object keys sorted by code point, `,` and `:`
//! separators with no whitespace, one trailing line feed. Keys are sorted
//! while writing, so the result does not depend on map ordering features of
//! `serde_json`.

use crate::core::projection::RoadmapView;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Renders a value in canonical form, including the trailing newline.
pub fn canonical_json(value: &Value) -> serde_json::Result<String> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    out.push('\n');
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> serde_json::Result<()> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Lower-case hex SHA-256 of the canonical form of `value`.
pub fn sha256_hex<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let canonical = canonical_json(&serde_json::to_value(value)?)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Lower-case hex SHA-256 of raw bytes (file contents).
#[must_use]
pub fn sha256_bytes_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hash of the projected state.
///
/// Covers `schema_version`, `project`, `tasks` and `indexes`. The run block
/// is excluded because it carries the hash itself.
pub fn projection_hash(roadmap: &RoadmapView) -> serde_json::Result<String> {
    let input = serde_json::json!({
        "schema_version": roadmap.meta.schema_version,
        "project": roadmap.project,
        "tasks": roadmap.tasks,
        "indexes": roadmap.indexes,
    });
    sha256_hex(&input)
}

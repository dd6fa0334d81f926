//! Column Path Normalisation and Record Walking
//!
//! A column path locates a value inside a decoded record: an ordered
//! sequence of string map-keys and integer array-indices. Configuration
//! supplies paths as JSON arrays; normalisation narrows the integers to
//! the engine's index type once, at construction, so per-row extraction
//! never validates segments again.

use std::fmt;

use crate::data_section::Value;
use crate::error::{MergeError, Result};

/// One step of a column path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A map key
    Key(String),
    /// An array index; negative values count from the end
    Index(i32),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{}", key),
            PathSegment::Index(idx) => write!(f, "{}", idx),
        }
    }
}

/// A normalised column path
///
/// The empty path addresses the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    /// The empty path, addressing the whole record
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-key path, the default output placement of a column
    pub fn from_key(key: &str) -> Self {
        Self {
            segments: vec![PathSegment::Key(key.to_string())],
        }
    }

    /// Normalise configuration segments into a path
    ///
    /// Strings become map keys and integers become array indices; any
    /// other JSON kind, or an integer that does not fit the index type,
    /// is a configuration error.
    pub fn from_config(segments: &[serde_json::Value]) -> Result<Self> {
        let mut normalised = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                serde_json::Value::String(key) => {
                    normalised.push(PathSegment::Key(key.clone()));
                }
                serde_json::Value::Number(num) => {
                    let index = num
                        .as_i64()
                        .and_then(|wide| i32::try_from(wide).ok())
                        .ok_or_else(|| {
                            MergeError::Config(format!("path index {} out of range", num))
                        })?;
                    normalised.push(PathSegment::Index(index));
                }
                other => {
                    return Err(MergeError::Config(format!(
                        "unsupported path segment type: {}",
                        other
                    )))
                }
            }
        }
        Ok(Self {
            segments: normalised,
        })
    }

    /// The normalised segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// True for the whole-record path
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", segment)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }
}

/// Navigate a decoded record by a normalised path
///
/// A missing map key or an out-of-bounds array index yields None; a
/// segment kind that does not match the node kind is an error. The empty
/// path yields the whole record. The record is never mutated.
pub fn walk<'v>(record: &'v Value, path: &Path) -> Result<Option<&'v Value>> {
    let mut current = record;

    for (i, segment) in path.segments().iter().enumerate() {
        match segment {
            PathSegment::Key(key) => {
                let map = match current {
                    Value::Map(map) => map,
                    other => {
                        return Err(MergeError::Path(format!(
                            "navigating path {} segment '{}': expected map but found {}",
                            Path::from(path.segments()[..i].to_vec()),
                            key,
                            other.type_name()
                        )))
                    }
                };
                match map.get(key) {
                    Some(value) => current = value,
                    None => return Ok(None),
                }
            }
            PathSegment::Index(index) => {
                let items = match current {
                    Value::Array(items) => items,
                    other => {
                        return Err(MergeError::Path(format!(
                            "navigating path {} segment {}: expected array but found {}",
                            Path::from(path.segments()[..i].to_vec()),
                            index,
                            other.type_name()
                        )))
                    }
                };
                let resolved = if *index < 0 {
                    items.len() as i64 + *index as i64
                } else {
                    *index as i64
                };
                if resolved < 0 || resolved >= items.len() as i64 {
                    return Ok(None);
                }
                current = &items[resolved as usize];
            }
        }
    }

    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn record() -> Value {
        let mut country = HashMap::new();
        country.insert("iso_code".to_string(), Value::String("US".to_string()));
        let mut root = HashMap::new();
        root.insert("country".to_string(), Value::Map(country));
        root.insert(
            "subdivisions".to_string(),
            Value::Array(vec![
                Value::String("CA".to_string()),
                Value::String("NV".to_string()),
            ]),
        );
        Value::Map(root)
    }

    fn path(segments: &[serde_json::Value]) -> Path {
        Path::from_config(segments).unwrap()
    }

    #[test]
    fn test_normalise_accepts_strings_and_integers() {
        let p = path(&[json!("country"), json!(0), json!(-1)]);
        assert_eq!(
            p.segments(),
            &[
                PathSegment::Key("country".to_string()),
                PathSegment::Index(0),
                PathSegment::Index(-1),
            ]
        );
    }

    #[test]
    fn test_normalise_rejects_wide_integers() {
        let err = Path::from_config(&[json!(i64::from(i32::MAX) + 1)]).unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));
    }

    #[test]
    fn test_normalise_rejects_other_kinds() {
        for segment in [json!(1.5), json!(true), json!(null), json!({"a": 1})] {
            assert!(Path::from_config(&[segment]).is_err());
        }
    }

    #[test]
    fn test_empty_path_is_whole_record() {
        let rec = record();
        let found = walk(&rec, &Path::empty()).unwrap().unwrap();
        assert_eq!(found, &rec);
    }

    #[test]
    fn test_walk_nested_key() {
        let rec = record();
        let found = walk(&rec, &path(&[json!("country"), json!("iso_code")]))
            .unwrap()
            .unwrap();
        assert_eq!(found, &Value::String("US".to_string()));
    }

    #[test]
    fn test_walk_missing_key_is_none() {
        let rec = record();
        assert!(walk(&rec, &path(&[json!("city")])).unwrap().is_none());
        assert!(walk(&rec, &path(&[json!("country"), json!("names")]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_walk_array_indices() {
        let rec = record();
        let first = walk(&rec, &path(&[json!("subdivisions"), json!(0)]))
            .unwrap()
            .unwrap();
        assert_eq!(first, &Value::String("CA".to_string()));

        let last = walk(&rec, &path(&[json!("subdivisions"), json!(-1)]))
            .unwrap()
            .unwrap();
        assert_eq!(last, &Value::String("NV".to_string()));

        assert!(walk(&rec, &path(&[json!("subdivisions"), json!(5)]))
            .unwrap()
            .is_none());
        assert!(walk(&rec, &path(&[json!("subdivisions"), json!(-3)]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_walk_kind_mismatch_is_error() {
        let rec = record();
        // String segment against an array.
        let err = walk(&rec, &path(&[json!("subdivisions"), json!("x")])).unwrap_err();
        assert!(matches!(err, MergeError::Path(_)));
        // Index segment against a map.
        let err = walk(&rec, &path(&[json!(0)])).unwrap_err();
        assert!(matches!(err, MergeError::Path(_)));
    }

    #[test]
    fn test_normalise_is_idempotent_for_walking() {
        let rec = record();
        let once = path(&[json!("country"), json!("iso_code")]);
        let twice = Path::from_config(&[json!("country"), json!("iso_code")]).unwrap();
        assert_eq!(
            walk(&rec, &once).unwrap(),
            walk(&rec, &twice).unwrap()
        );
        assert_eq!(once, twice);
    }
}

//! History states and pruning.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One retained snapshot: the file holding the content plus capture metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryState {
    /// File name relative to the cache directory.
    pub file: String,
    /// Capture timestamp.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Response headers, names lowercased.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Caller-supplied fields, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryState {
    pub fn new(file: impl Into<String>, time: i64) -> Self {
        Self { file: file.into(), time, status_code: None, headers: BTreeMap::new(), extra: Map::new() }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .or_else(|| self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v))
            .map(String::as_str)
    }
}

/// Metadata recorded alongside stored content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMeta {
    pub status_code: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub extra: Map<String, Value>,
}

/// Keys owned by [`HistoryState`]; caller extras may not shadow them.
const RESERVED_FIELDS: [&str; 4] = ["file", "time", "statusCode", "headers"];

impl StateMeta {
    /// Build the stored state. Extra fields named like a reserved key are
    /// dropped so they can never overwrite `file` or `time` in the catalog.
    pub(crate) fn into_state(self, file: String, time: i64) -> HistoryState {
        let headers = self.headers.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();

        let mut extra = self.extra;
        extra.retain(|key, _| {
            let reserved = RESERVED_FIELDS.contains(&key.as_str());
            if reserved {
                tracing::warn!(field = %key, "ignoring extra history field that shadows a reserved key");
            }
            !reserved
        });

        HistoryState { file, time, status_code: self.status_code, headers, extra }
    }
}

/// Prepend `state` and cap the list at `limit`. Returns the states that fell off.
pub(crate) fn push_front(history: &mut Vec<HistoryState>, state: HistoryState, limit: usize) -> Vec<HistoryState> {
    history.insert(0, state);
    if history.len() > limit { history.split_off(limit) } else { Vec::new() }
}

/// Files present on disk that no retained state references.
pub(crate) fn orphaned_files(present: &[String], history: &[HistoryState]) -> Vec<String> {
    let referenced: HashSet<&str> = history.iter().map(|s| s.file.as_str()).collect();
    present.iter().filter(|name| !referenced.contains(name.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_front_caps_newest_first() {
        let mut history = vec![HistoryState::new("b", 2), HistoryState::new("a", 1)];
        let dropped = push_front(&mut history, HistoryState::new("c", 3), 2);

        let files: Vec<_> = history.iter().map(|s| s.file.as_str()).collect();
        assert_eq!(files, ["c", "b"]);
        assert_eq!(dropped, vec![HistoryState::new("a", 1)]);
    }

    #[test]
    fn test_push_front_under_limit_drops_nothing() {
        let mut history = Vec::new();
        assert!(push_front(&mut history, HistoryState::new("a", 1), 3).is_empty());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_orphaned_files() {
        let present = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let history = vec![HistoryState::new("c", 3), HistoryState::new("a", 1)];
        assert_eq!(orphaned_files(&present, &history), vec!["b".to_string()]);
    }

    #[test]
    fn test_serialization_shape_keeps_extra_fields() {
        let mut state = StateMeta {
            status_code: Some(200),
            headers: BTreeMap::from([("X-RateLimit-Remaining".to_string(), "5".to_string())]),
            extra: json!({"source": "nightly-job"}).as_object().cloned().unwrap(),
        }
        .into_state("f1".into(), 42);

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            json!({
                "file": "f1",
                "time": 42,
                "statusCode": 200,
                "headers": {"x-ratelimit-remaining": "5"},
                "source": "nightly-job"
            })
        );

        let parsed: HistoryState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.extra.get("source"), Some(&json!("nightly-job")));
        state.extra.clear();
        assert_ne!(parsed, state);
    }

    #[test]
    fn test_extra_fields_cannot_shadow_reserved_keys() {
        let state = StateMeta {
            status_code: Some(200),
            headers: BTreeMap::new(),
            extra: json!({"file": "bogus", "time": "noon", "statusCode": "x", "headers": 1, "source": "job"})
                .as_object()
                .cloned()
                .unwrap(),
        }
        .into_state("real".into(), 7);

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value, json!({"file": "real", "time": 7, "statusCode": 200, "source": "job"}));

        let parsed: HistoryState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_minimal_state_deserializes() {
        let parsed: HistoryState = serde_json::from_value(json!({"file": "f", "time": 1})).unwrap();
        assert_eq!(parsed, HistoryState::new("f", 1));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut state = HistoryState::new("f", 1);
        state.headers.insert("x-ratelimit-reset".into(), "60".into());
        state.headers.insert("Legacy-Header".into(), "yes".into());

        assert_eq!(state.header("X-RateLimit-Reset"), Some("60"));
        assert_eq!(state.header("legacy-header"), Some("yes"));
        assert_eq!(state.header("missing"), None);
    }
}

//! JSON-backed metadata record for one cache key.
//!
//! The catalog is a single JSON object stored at `<container>/<key>/.catalog`.
//! It is read lazily and cached in memory; [`Catalog::refresh`] rereads the file
//! for callers that need to observe writes from other processes. A missing or
//! corrupt file reads as an empty object.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::history::HistoryState;
use super::storage::Storage;
use crate::Error;

/// On-disk schema version. Catalogs written with any other version are rebuilt.
pub const CATALOG_VERSION: u32 = 1;

/// File name of the catalog inside a cache directory.
pub const CATALOG_FILE: &str = ".catalog";

/// Typed view of a catalog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub version: u32,
    pub key: String,
    pub expire: String,
    pub offset: i64,
    pub must_match: Option<String>,
    pub must_not_match: Option<String>,
    pub history_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub created_time: i64,
    pub expire_time: i64,
    pub cleanup_time: i64,
    #[serde(default)]
    pub history: Vec<HistoryState>,
}

/// Partial update merged into a catalog. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryState>>,
}

/// Serialize a value that must produce a JSON object.
pub(crate) fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Catalog(serde::ser::Error::custom(format!("expected a JSON object, got {other}")))),
    }
}

/// A cache's catalog file and its in-memory copy.
pub struct Catalog {
    path: PathBuf,
    storage: Arc<dyn Storage>,
    data: Option<Map<String, Value>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("path", &self.path).field("data", &self.data).finish()
    }
}

impl Catalog {
    pub fn new(path: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Self {
        Self { path: path.into(), storage, data: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Map<String, Value> {
        let bytes = match self.storage.read(&self.path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Map::new(),
            Err(e) => {
                tracing::warn!("unreadable catalog treated as empty: {}", e);
                return Map::new();
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("corrupt catalog at {} treated as empty", self.path.display());
                Map::new()
            }
        }
    }

    /// All catalog values, loading the file on first use.
    pub fn read_all(&mut self) -> &Map<String, Value> {
        if self.data.is_none() {
            self.data = Some(self.load());
        }
        self.data.get_or_insert_with(Map::new)
    }

    /// A single catalog value.
    pub fn read(&mut self, key: &str) -> Option<&Value> {
        self.read_all().get(key)
    }

    /// Discard the in-memory copy and reread the file.
    pub fn refresh(&mut self) -> &Map<String, Value> {
        self.data = None;
        self.read_all()
    }

    /// The catalog as a typed record, or `None` if it is empty or malformed.
    pub fn record(&mut self) -> Option<CatalogRecord> {
        let data = self.read_all();
        if data.is_empty() {
            return None;
        }
        serde_json::from_value(Value::Object(data.clone())).ok()
    }

    fn save(&mut self, data: Map<String, Value>) -> Result<(), Error> {
        let json = serde_json::to_vec(&data)?;
        self.storage.write(&self.path, &json)?;
        self.data = Some(data);
        Ok(())
    }

    /// Replace the whole catalog.
    pub fn create(&mut self, data: Map<String, Value>) -> Result<(), Error> {
        self.save(data)
    }

    /// Shallow-merge top-level keys into the catalog. A key present in
    /// `partial` replaces its previous value wholesale, lists included.
    pub fn update(&mut self, partial: Map<String, Value>) -> Result<(), Error> {
        let mut data = self.read_all().clone();
        data.extend(partial);
        self.save(data)
    }

    /// Set a single top-level key.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), Error> {
        let mut partial = Map::new();
        partial.insert(key.to_string(), value);
        self.update(partial)
    }

    /// Apply a typed partial update.
    pub fn apply(&mut self, patch: &CatalogPatch) -> Result<(), Error> {
        self.update(to_object(patch)?)
    }

    /// Delete the catalog file and clear the in-memory copy.
    pub fn delete(&mut self) -> Result<(), Error> {
        self.storage.delete_file(&self.path)?;
        self.data = Some(Map::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::FsStorage;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_catalog() -> (Catalog, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let catalog = Catalog::new(temp_dir.path().join(CATALOG_FILE), Arc::new(FsStorage));
        (catalog, temp_dir)
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn sample_record() -> CatalogRecord {
        CatalogRecord {
            version: CATALOG_VERSION,
            key: "wx".into(),
            expire: "hourly".into(),
            offset: 0,
            must_match: None,
            must_not_match: None,
            history_limit: 2,
            container: None,
            created_time: 100,
            expire_time: 3600,
            cleanup_time: 86_400,
            history: vec![HistoryState::new("abc", 100)],
        }
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let (mut catalog, _dir) = create_test_catalog();
        assert!(catalog.read_all().is_empty());
        assert!(catalog.record().is_none());
    }

    #[test]
    fn test_corrupt_file_reads_empty() {
        let (mut catalog, _dir) = create_test_catalog();
        std::fs::write(catalog.path(), b"{not json").unwrap();
        assert!(catalog.read_all().is_empty());

        std::fs::write(catalog.path(), b"[1, 2, 3]").unwrap();
        assert!(catalog.refresh().is_empty());
    }

    #[test]
    fn test_create_and_read() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog.create(object(json!({"key": "wx", "expireTime": 10}))).unwrap();

        assert_eq!(catalog.read("key"), Some(&json!("wx")));
        assert_eq!(catalog.read("missing"), None);
        assert!(catalog.path().exists());
    }

    #[test]
    fn test_create_overwrites() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog.create(object(json!({"a": 1, "b": 2}))).unwrap();
        catalog.create(object(json!({"c": 3}))).unwrap();

        let data = catalog.refresh().clone();
        assert_eq!(data, object(json!({"c": 3})));
    }

    #[test]
    fn test_update_is_shallow_and_replaces_history() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog
            .create(object(json!({"expireTime": 1, "history": [{"file": "a", "time": 1}, {"file": "b", "time": 0}]})))
            .unwrap();

        catalog.update(object(json!({"history": [{"file": "c", "time": 2}]}))).unwrap();

        let data = catalog.refresh().clone();
        assert_eq!(data["expireTime"], json!(1));
        assert_eq!(data["history"], json!([{"file": "c", "time": 2}]));
    }

    #[test]
    fn test_set_single_key() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog.create(object(json!({"expireTime": 50, "key": "wx"}))).unwrap();
        catalog.set("expireTime", json!(0)).unwrap();

        assert_eq!(catalog.refresh()["expireTime"], json!(0));
        assert_eq!(catalog.read("key"), Some(&json!("wx")));
    }

    #[test]
    fn test_record_roundtrip_and_patch() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog.create(to_object(&sample_record()).unwrap()).unwrap();
        assert_eq!(catalog.refresh().get("container"), None);

        catalog.apply(&CatalogPatch { expire_time: Some(7200), ..Default::default() }).unwrap();

        let record = catalog.record().unwrap();
        assert_eq!(record.expire_time, 7200);
        assert_eq!(record.cleanup_time, 86_400);
        assert_eq!(record.history, sample_record().history);
    }

    #[test]
    fn test_in_memory_copy_until_refresh() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog.create(object(json!({"expireTime": 1}))).unwrap();

        std::fs::write(catalog.path(), br#"{"expireTime": 2}"#).unwrap();
        assert_eq!(catalog.read("expireTime"), Some(&json!(1)));
        assert_eq!(catalog.refresh()["expireTime"], json!(2));
    }

    #[test]
    fn test_delete() {
        let (mut catalog, _dir) = create_test_catalog();
        catalog.create(object(json!({"key": "wx"}))).unwrap();
        catalog.delete().unwrap();

        assert!(!catalog.path().exists());
        assert!(catalog.read_all().is_empty());
    }
}

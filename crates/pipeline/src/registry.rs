//! Registered output databases, keyed by (owner, tag).

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ledger::LockFile;

/// Fields a link database must expose, with their property types
pub const LINK_DATABASE_FIELDS: &[(&str, &str)] = &[
    ("url", "url"),
    ("tag", "select"),
    ("processing_type", "select"),
    ("status", "select"),
    ("updated_time", "date"),
];

/// One property of a target database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Allowed values for select-like properties
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FieldSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Vec::new(),
        }
    }
}

/// Property name -> spec, ordered by name
pub type FieldSchema = BTreeMap<String, FieldSpec>;

/// Build a field schema from a database `properties` object as returned by the document API.
/// Select and multi-select option names are kept.
pub fn field_schema_from_properties(properties: &Value) -> Result<FieldSchema> {
    let map = properties
        .as_object()
        .context("Database properties must be a JSON object")?;

    let mut schema = FieldSchema::new();
    for (name, prop) in map {
        let kind = prop
            .get("type")
            .and_then(Value::as_str)
            .with_context(|| format!("Property {:?} has no type", name))?;
        let options = prop
            .get(kind)
            .and_then(|inner| inner.get("options"))
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .filter_map(|o| o.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        schema.insert(name.clone(), FieldSpec { kind: kind.to_string(), options });
    }
    Ok(schema)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaBinding {
    pub owner_id: String,
    pub tag: String,
    pub target_resource_id: String,
    pub field_schema: FieldSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_override: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SchemaBinding {
    pub fn new(
        owner_id: impl Into<String>,
        tag: impl Into<String>,
        target_resource_id: impl Into<String>,
        field_schema: FieldSchema,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            tag: tag.into(),
            target_resource_id: target_resource_id.into(),
            field_schema,
            prompt_override: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt_override = Some(prompt.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tag '{tag}' is already in use by owner {owner_id}")]
    DuplicateTag { owner_id: String, tag: String },
    #[error("no schema registered with tag '{tag}' for owner {owner_id}")]
    UnknownTag { owner_id: String, tag: String },
    #[error("link database schema is invalid: {0}")]
    InvalidLinkSchema(String),
    #[error("failed to persist bindings: {0}")]
    Persist(String),
}

/// Check that a link database exposes the fields the poller reads and writes
pub fn validate_link_schema(schema: &FieldSchema) -> Result<(), RegistryError> {
    let missing: Vec<&str> = LINK_DATABASE_FIELDS
        .iter()
        .filter(|(name, _)| !schema.contains_key(*name))
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(RegistryError::InvalidLinkSchema(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let invalid: Vec<String> = LINK_DATABASE_FIELDS
        .iter()
        .filter_map(|(name, expected)| {
            let actual = &schema[*name].kind;
            (actual != expected).then(|| format!("{} (expected {}, got {})", name, expected, actual))
        })
        .collect();
    if !invalid.is_empty() {
        return Err(RegistryError::InvalidLinkSchema(format!(
            "invalid field types: {}",
            invalid.join(", ")
        )));
    }
    Ok(())
}

/// Size and modification time of the bindings file, used to notice writes
/// made by other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

fn file_stamp(path: &Path) -> Result<Option<FileStamp>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta
                .modified()
                .with_context(|| format!("Failed to read modification time: {}", path.display()))?,
            len: meta.len(),
        })),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat bindings file: {}", path.display())),
    }
}

fn read_bindings(path: &Path) -> Result<Vec<SchemaBinding>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read bindings file: {}", path.display())),
    };
    serde_json::from_str(&content).with_context(|| format!("Failed to parse bindings file: {}", path.display()))
}

fn write_bindings(path: &Path, bindings: &[SchemaBinding]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(bindings).context("Failed to serialize bindings")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).with_context(|| format!("Failed to write bindings file: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

fn persist_error(err: anyhow::Error) -> RegistryError {
    RegistryError::Persist(format!("{:#}", err))
}

/// Schema bindings, optionally persisted to a JSON file shared with other processes
pub struct SchemaRegistry {
    bindings: RwLock<Vec<SchemaBinding>>,
    path: Option<PathBuf>,
    loaded: Mutex<Option<FileStamp>>,
}

impl SchemaRegistry {
    pub fn in_memory() -> Self {
        Self {
            bindings: RwLock::new(Vec::new()),
            path: None,
            loaded: Mutex::new(None),
        }
    }

    /// Load bindings from `path`, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let loaded = file_stamp(&path)?;
        let bindings = read_bindings(&path)?;
        Ok(Self {
            bindings: RwLock::new(bindings),
            path: Some(path),
            loaded: Mutex::new(loaded),
        })
    }

    /// Re-read the bindings file if it changed since it was last loaded.
    /// Returns whether anything was re-read.
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        // Stamp before reading: a write racing the read is picked up next time
        let current = file_stamp(path)?;
        if current == *self.loaded.lock() {
            return Ok(false);
        }
        let bindings = read_bindings(path)?;
        debug!("Reloaded {} binding(s) from {}", bindings.len(), path.display());
        *self.bindings.write() = bindings;
        *self.loaded.lock() = current;
        Ok(true)
    }

    pub fn register(&self, binding: SchemaBinding) -> Result<(), RegistryError> {
        self.update(|bindings| {
            if bindings
                .iter()
                .any(|b| b.owner_id == binding.owner_id && b.tag == binding.tag)
            {
                return Err(RegistryError::DuplicateTag {
                    owner_id: binding.owner_id,
                    tag: binding.tag,
                });
            }
            info!(
                "Registered schema: owner={}, tag={}, target={}",
                binding.owner_id, binding.tag, binding.target_resource_id
            );
            bindings.push(binding);
            Ok(())
        })
    }

    pub fn resolve(&self, owner_id: &str, tag: &str) -> Option<SchemaBinding> {
        self.bindings
            .read()
            .iter()
            .find(|b| b.owner_id == owner_id && b.tag == tag)
            .cloned()
    }

    /// Bindings of one owner, newest first
    pub fn list(&self, owner_id: &str) -> Vec<SchemaBinding> {
        let mut bindings: Vec<_> = self
            .bindings
            .read()
            .iter()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect();
        bindings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        bindings
    }

    pub fn set_prompt(
        &self,
        owner_id: &str,
        tag: &str,
        prompt: Option<String>,
    ) -> Result<SchemaBinding, RegistryError> {
        self.update(|bindings| {
            let binding = bindings
                .iter_mut()
                .find(|b| b.owner_id == owner_id && b.tag == tag)
                .ok_or_else(|| RegistryError::UnknownTag {
                    owner_id: owner_id.to_string(),
                    tag: tag.to_string(),
                })?;
            binding.prompt_override = prompt;
            Ok(binding.clone())
        })
    }

    /// Read-modify-write of the bindings. With a backing file this runs under
    /// `<bindings>.lock` against the file's current contents, so writers in
    /// other processes are not lost.
    fn update<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Vec<SchemaBinding>) -> Result<T, RegistryError>,
    {
        let Some(path) = &self.path else {
            return f(&mut self.bindings.write());
        };

        let _lock = LockFile::acquire(&path.with_extension("lock")).map_err(persist_error)?;
        let mut bindings = read_bindings(path).map_err(persist_error)?;
        let out = f(&mut bindings)?;
        write_bindings(path, &bindings).map_err(persist_error)?;
        let stamp = file_stamp(path).map_err(persist_error)?;

        *self.bindings.write() = bindings;
        *self.loaded.lock() = stamp;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cooking_schema() -> FieldSchema {
        let mut schema = FieldSchema::new();
        schema.insert("Place".to_string(), FieldSpec::new("title"));
        schema.insert("Address".to_string(), FieldSpec::new("rich_text"));
        schema
    }

    fn link_schema() -> FieldSchema {
        LINK_DATABASE_FIELDS
            .iter()
            .map(|(name, kind)| (name.to_string(), FieldSpec::new(*kind)))
            .collect()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = SchemaRegistry::in_memory();
        registry
            .register(SchemaBinding::new("u1", "cooking", "db-1", cooking_schema()))
            .unwrap();

        let binding = registry.resolve("u1", "cooking").unwrap();
        assert_eq!(binding.target_resource_id, "db-1");
        assert!(registry.resolve("u2", "cooking").is_none());
        assert!(registry.resolve("u1", "travel").is_none());
    }

    #[test]
    fn test_duplicate_tag_per_owner() {
        let registry = SchemaRegistry::in_memory();
        registry
            .register(SchemaBinding::new("u1", "cooking", "db-1", cooking_schema()))
            .unwrap();

        let err = registry
            .register(SchemaBinding::new("u1", "cooking", "db-2", cooking_schema()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTag { .. }));
        assert!(err.to_string().contains("already in use"));

        // Same tag for another owner is fine
        registry
            .register(SchemaBinding::new("u2", "cooking", "db-3", cooking_schema()))
            .unwrap();
    }

    #[test]
    fn test_list_newest_first_and_set_prompt() {
        let registry = SchemaRegistry::in_memory();
        let mut older = SchemaBinding::new("u1", "cooking", "db-1", cooking_schema());
        older.created_at = Utc::now() - chrono::Duration::days(1);
        registry.register(older).unwrap();
        registry
            .register(SchemaBinding::new("u1", "travel", "db-2", cooking_schema()))
            .unwrap();

        let tags: Vec<_> = registry.list("u1").into_iter().map(|b| b.tag).collect();
        assert_eq!(tags, vec!["travel", "cooking"]);

        let updated = registry
            .set_prompt("u1", "cooking", Some("List every dish".to_string()))
            .unwrap();
        assert_eq!(updated.prompt_override.as_deref(), Some("List every dish"));
        assert!(matches!(
            registry.set_prompt("u1", "nope", None),
            Err(RegistryError::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");

        let registry = SchemaRegistry::open(&path).unwrap();
        registry
            .register(SchemaBinding::new("u1", "cooking", "db-1", cooking_schema()).with_prompt("p"))
            .unwrap();
        drop(registry);

        let reopened = SchemaRegistry::open(&path).unwrap();
        let binding = reopened.resolve("u1", "cooking").unwrap();
        assert_eq!(binding.prompt_override.as_deref(), Some("p"));
        assert_eq!(binding.field_schema, cooking_schema());
    }

    #[test]
    fn test_reload_picks_up_bindings_from_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");

        let daemon = SchemaRegistry::open(&path).unwrap();
        assert!(!daemon.reload().unwrap());

        SchemaRegistry::open(&path)
            .unwrap()
            .register(SchemaBinding::new("u1", "cooking", "db-1", cooking_schema()))
            .unwrap();

        assert!(daemon.resolve("u1", "cooking").is_none());
        assert!(daemon.reload().unwrap());
        assert_eq!(daemon.resolve("u1", "cooking").unwrap().target_resource_id, "db-1");
        assert!(!daemon.reload().unwrap());
    }

    #[test]
    fn test_stale_writers_do_not_lose_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");
        let first = SchemaRegistry::open(&path).unwrap();
        let second = SchemaRegistry::open(&path).unwrap();

        first
            .register(SchemaBinding::new("u1", "cooking", "db-1", cooking_schema()))
            .unwrap();
        // `second` never saw the first write, yet must keep it
        second
            .register(SchemaBinding::new("u1", "travel", "db-2", cooking_schema()))
            .unwrap();
        let err = second
            .register(SchemaBinding::new("u1", "cooking", "db-3", cooking_schema()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTag { .. }));
        second.set_prompt("u1", "cooking", Some("List every dish".to_string())).unwrap();

        let reopened = SchemaRegistry::open(&path).unwrap();
        let tags: Vec<_> = reopened.list("u1").into_iter().map(|b| b.tag).collect();
        assert_eq!(tags.len(), 2);
        assert_eq!(reopened.resolve("u1", "cooking").unwrap().target_resource_id, "db-1");
        assert_eq!(
            reopened.resolve("u1", "cooking").unwrap().prompt_override.as_deref(),
            Some("List every dish")
        );
        assert!(!path.with_extension("lock").exists());
    }

    #[test]
    fn test_field_schema_from_properties() {
        let properties = json!({
            "Place": {"id": "title", "type": "title", "title": {}},
            "Category": {"id": "abc", "type": "select", "select": {"options": [
                {"name": "Restaurant", "color": "red"},
                {"name": "Bakery", "color": "blue"}
            ]}}
        });
        let schema = field_schema_from_properties(&properties).unwrap();
        assert_eq!(schema["Place"].kind, "title");
        assert_eq!(schema["Category"].options, vec!["Restaurant", "Bakery"]);

        assert!(field_schema_from_properties(&json!({"Broken": {}})).is_err());
        assert!(field_schema_from_properties(&json!([])).is_err());
    }

    #[test]
    fn test_validate_link_schema() {
        assert!(validate_link_schema(&link_schema()).is_ok());

        let mut missing = link_schema();
        missing.remove("status");
        missing.remove("url");
        let err = validate_link_schema(&missing).unwrap_err().to_string();
        assert!(err.contains("missing required fields: url, status"), "{}", err);

        let mut wrong = link_schema();
        wrong.insert("updated_time".to_string(), FieldSpec::new("rich_text"));
        let err = validate_link_schema(&wrong).unwrap_err().to_string();
        assert!(err.contains("updated_time (expected date, got rich_text)"), "{}", err);
    }
}

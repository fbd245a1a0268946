// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Datastore Drivers
//
// - InMemoryDatastore: rows live only for the process lifetime
// - FileDatastore: same tables, rewritten to a JSON snapshot after every
//   write (temp file + rename) so task history survives a restart

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::node_config::{DatastoreConfig, DatastoreDriver};
use crate::domain::repository::{
    id_key, Datastore, DatastoreError, Filter, QueryOptions,
};

#[derive(Debug, Default, Deserialize)]
struct Collection {
    next_id: u64,
    rows: Vec<Value>,
    #[serde(skip)]
    seq: u64,
    #[serde(skip)]
    by_seq: BTreeMap<u64, Value>,
    #[serde(skip)]
    index: HashMap<String, u64>,
}

impl Collection {
    fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Rebuild the lookup structures after loading a snapshot
    fn reindex(&mut self) {
        self.by_seq.clear();
        self.index.clear();
        self.seq = 0;
        for row in std::mem::take(&mut self.rows) {
            if let Some(id) = row.get("id") {
                let key = id_key(id);
                self.seq += 1;
                self.index.insert(key, self.seq);
                self.by_seq.insert(self.seq, row);
            }
        }
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }

    fn to_snapshot(&self) -> Value {
        serde_json::json!({
            "next_id": self.next_id,
            "rows": self.by_seq.values().collect::<Vec<_>>(),
        })
    }

    fn get(&self, id: &Value) -> Option<&Value> {
        self.index
            .get(&id_key(id))
            .and_then(|seq| self.by_seq.get(seq))
    }

    fn insert(&mut self, name: &str, row: Value) -> Result<Value, DatastoreError> {
        let Value::Object(mut map) = row else {
            return Err(DatastoreError::Serialization(format!(
                "rows of {} must be JSON objects",
                name
            )));
        };

        let id = match map.get("id") {
            Some(id) if !id.is_null() => {
                if let Some(n) = id.as_u64() {
                    self.next_id = self.next_id.max(n + 1);
                }
                id.clone()
            }
            _ => {
                let id = Value::from(self.next_id);
                self.next_id += 1;
                map.insert("id".to_string(), id.clone());
                id
            }
        };

        let key = id_key(&id);
        if self.index.contains_key(&key) {
            return Err(DatastoreError::Duplicate {
                collection: name.to_string(),
                id: key,
            });
        }
        self.seq += 1;
        self.index.insert(key, self.seq);
        self.by_seq.insert(self.seq, Value::Object(map));
        Ok(id)
    }

    fn update(&mut self, name: &str, id: &Value, patch: Value) -> Result<(), DatastoreError> {
        let key = id_key(id);
        let row = self
            .index
            .get(&key)
            .and_then(|seq| self.by_seq.get_mut(seq))
            .ok_or_else(|| DatastoreError::NotFound {
                collection: name.to_string(),
                id: key.clone(),
            })?;

        let Value::Object(patch) = patch else {
            return Err(DatastoreError::Serialization(
                "patch must be a JSON object".to_string(),
            ));
        };
        if let Value::Object(row) = row {
            for (field, value) in patch {
                if field != "id" {
                    row.insert(field, value);
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, name: &str, id: &Value) -> Result<(), DatastoreError> {
        let key = id_key(id);
        let seq = self.index.remove(&key).ok_or_else(|| DatastoreError::NotFound {
            collection: name.to_string(),
            id: key,
        })?;
        self.by_seq.remove(&seq);
        Ok(())
    }

    fn query(&self, filters: &[Filter], options: &QueryOptions) -> Vec<Value> {
        let rows = self
            .by_seq
            .values()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();
        options.apply(rows)
    }
}

#[derive(Default)]
struct Tables {
    collections: HashMap<String, Collection>,
}

impl Tables {
    fn collection(&self, name: &str) -> Result<&Collection, DatastoreError> {
        self.collections
            .get(name)
            .ok_or_else(|| DatastoreError::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection, DatastoreError> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| DatastoreError::CollectionNotFound(name.to_string()))
    }

    fn snapshot(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .collections
            .iter()
            .map(|(name, c)| (name.clone(), c.to_snapshot()))
            .collect();
        Value::Object(map)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> Result<Vec<Value>, DatastoreError> {
        Ok(self.tables.lock().collection(collection)?.query(filters, options))
    }

    async fn get_by_id(&self, collection: &str, id: &Value) -> Result<Option<Value>, DatastoreError> {
        Ok(self.tables.lock().collection(collection)?.get(id).cloned())
    }

    async fn insert(&self, collection: &str, row: Value) -> Result<Value, DatastoreError> {
        self.tables
            .lock()
            .collection_mut(collection)?
            .insert(collection, row)
    }

    async fn update(&self, collection: &str, id: &Value, patch: Value) -> Result<(), DatastoreError> {
        self.tables
            .lock()
            .collection_mut(collection)?
            .update(collection, id, patch)
    }

    async fn delete(&self, collection: &str, id: &Value) -> Result<(), DatastoreError> {
        self.tables
            .lock()
            .collection_mut(collection)?
            .delete(collection, id)
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, DatastoreError> {
        Ok(self.tables.lock().collections.contains_key(collection))
    }

    async fn collection_create(&self, collection: &str) -> Result<(), DatastoreError> {
        self.tables
            .lock()
            .collections
            .entry(collection.to_string())
            .or_insert_with(Collection::new);
        Ok(())
    }
}

/// JSON snapshot backed datastore
#[derive(Clone)]
pub struct FileDatastore {
    memory: InMemoryDatastore,
    path: PathBuf,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileDatastore {
    /// Open (or create) the snapshot at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DatastoreError> {
        let path = path.into();
        let mut tables = Tables::default();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut collections: HashMap<String, Collection> = serde_json::from_slice(&bytes)?;
                for collection in collections.values_mut() {
                    collection.reindex();
                }
                info!(path = ?path, collections = collections.len(), "Loaded datastore snapshot");
                tables.collections = collections;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "No datastore snapshot yet");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            memory: InMemoryDatastore {
                tables: Arc::new(Mutex::new(tables)),
            },
            path,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn persist(&self) -> Result<(), DatastoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.memory.tables.lock().snapshot();
        let bytes = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for FileDatastore {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> Result<Vec<Value>, DatastoreError> {
        self.memory.query(collection, filters, options).await
    }

    async fn get_by_id(&self, collection: &str, id: &Value) -> Result<Option<Value>, DatastoreError> {
        self.memory.get_by_id(collection, id).await
    }

    async fn insert(&self, collection: &str, row: Value) -> Result<Value, DatastoreError> {
        let id = self.memory.insert(collection, row).await?;
        self.persist().await?;
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &Value, patch: Value) -> Result<(), DatastoreError> {
        self.memory.update(collection, id, patch).await?;
        self.persist().await
    }

    async fn delete(&self, collection: &str, id: &Value) -> Result<(), DatastoreError> {
        self.memory.delete(collection, id).await?;
        self.persist().await
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, DatastoreError> {
        self.memory.collection_exists(collection).await
    }

    async fn collection_create(&self, collection: &str) -> Result<(), DatastoreError> {
        self.memory.collection_create(collection).await?;
        self.persist().await
    }
}

/// Build the datastore selected by configuration
pub async fn open_datastore(config: &DatastoreConfig) -> Result<Arc<dyn Datastore>, DatastoreError> {
    match DatastoreDriver::parse(&config.driver) {
        Some(DatastoreDriver::Memory) => Ok(Arc::new(InMemoryDatastore::new())),
        Some(DatastoreDriver::File) => {
            let path = config.path.clone().ok_or_else(|| {
                DatastoreError::Storage("the file driver requires a path".to_string())
            })?;
            Ok(Arc::new(FileDatastore::open(path).await?))
        }
        None => Err(DatastoreError::Storage(format!(
            "unknown datastore driver '{}'",
            config.driver
        ))),
    }
}

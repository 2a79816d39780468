// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::AppResult;

/// A tiny string map persisted as one pretty printed JSON file.
#[derive(Debug, Serialize, Deserialize)]
pub struct KvStore {
    #[serde(skip)]
    path: PathBuf,
    store: BTreeMap<String, String>,
}

impl KvStore {
    /// Loads the file at `path`, an absent or empty file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> AppResult<KvStore> {
        let path = path.as_ref().to_path_buf();
        let store = match fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => serde_json::from_str(&contents)?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        trace!("kv store {} loaded with {} keys", path.display(), store.len());
        Ok(KvStore { path, store })
    }

    /// Returns the value `key` had before.
    pub fn put(&mut self, key: String, value: String) -> Option<String> {
        self.store.insert(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.store.get(key).map(String::as_str)
    }

    pub fn delete(&mut self, key: &str) -> Option<String> {
        self.store.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.store.iter()
    }

    /// Writes a sibling temp file and renames it over the store file, so a
    /// crash leaves either the old or the new content.
    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(&self.store)?;
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_kv_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("kv.db");

        let mut kv_store = KvStore::open(&path).unwrap();
        kv_store.put("key1".to_owned(), "value1".to_owned());
        kv_store.put("key2".to_owned(), "value2".to_owned());

        assert_eq!(kv_store.get("key1"), Some("value1"));
        assert_eq!(kv_store.get("key2"), Some("value2"));

        assert_eq!(kv_store.delete("key1"), Some("value1".to_owned()));
        assert_eq!(kv_store.get("key1"), None);

        kv_store.save().unwrap();

        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.get("key1"), None);
        assert_eq!(store.get("key2"), Some("value2"));
        assert_eq!(store.iter().count(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kv.db");
        fs::write(&path, "{ not json").unwrap();
        assert!(KvStore::open(&path).is_err());

        fs::write(&path, "\n").unwrap();
        assert_eq!(KvStore::open(&path).unwrap().iter().count(), 0);
    }
}

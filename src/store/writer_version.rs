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

use std::fmt::Debug;
use std::path::Path;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::utils::KvStore;
use crate::AppResult;

pub trait WriterVersionStore: Send + Sync + Debug {
    /// Accepts `(major, minor)` when it is not older than the newest version
    /// seen for `writer_name`, and remembers it.
    fn validate_then_update(&self, writer_name: &str, major: u32, minor: u32) -> bool;
}

/// Writer versions cached in memory and, unless created with `in_memory`,
/// persisted in a JSON key value file.
#[derive(Debug)]
pub struct KvWriterVersionStore {
    versions: DashMap<String, (u32, u32)>,
    kv_store: Option<Mutex<KvStore>>,
}

impl KvWriterVersionStore {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let kv_store = KvStore::open(path.as_ref())?;
        let versions = DashMap::new();
        for (writer, version) in kv_store.iter() {
            match parse_version(version) {
                Some(parsed) => {
                    versions.insert(writer.clone(), parsed);
                }
                None => warn!("ignore unparsable version {} of writer {}", version, writer),
            }
        }
        info!(
            "loaded {} writer versions from {}",
            versions.len(),
            path.as_ref().display()
        );
        Ok(KvWriterVersionStore {
            versions,
            kv_store: Some(Mutex::new(kv_store)),
        })
    }

    pub fn in_memory() -> Self {
        KvWriterVersionStore {
            versions: DashMap::new(),
            kv_store: None,
        }
    }

    pub fn version_of(&self, writer_name: &str) -> Option<(u32, u32)> {
        self.versions.get(writer_name).map(|entry| *entry)
    }
}

impl WriterVersionStore for KvWriterVersionStore {
    fn validate_then_update(&self, writer_name: &str, major: u32, minor: u32) -> bool {
        let version = (major, minor);
        match self.version_of(writer_name) {
            Some(current) if current > version => return false,
            Some(current) if current == version => return true,
            _ => {}
        }
        let Some(kv_store) = &self.kv_store else {
            // the entry guard serializes concurrent writers of the same name
            let mut entry = self.versions.entry(writer_name.to_string()).or_insert(version);
            if *entry > version {
                return false;
            }
            *entry = version;
            return true;
        };

        // cached versions only change while the file lock is held
        let mut kv_store = kv_store.lock();
        if self.version_of(writer_name).is_some_and(|current| current > version) {
            return false;
        }
        let previous = kv_store.put(writer_name.to_string(), format!("{}.{}", major, minor));
        if let Err(e) = kv_store.save() {
            error!("persist version of writer {} failed: {}", writer_name, e);
            match previous {
                Some(previous) => kv_store.put(writer_name.to_string(), previous),
                None => kv_store.delete(writer_name),
            };
            return false;
        }
        self.versions.insert(writer_name.to_string(), version);
        true
    }
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

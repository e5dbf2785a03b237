//! Discovery and parsing of the HuggingFace `*index.json` weight manifest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::error::{ConvertError, Result};

const INDEX_SUFFIX: &str = "index.json";

/// Find the single manifest file directly inside `dir`.
pub fn find_index_manifest(dir: &Path) -> Result<PathBuf> {
    let mut found: Option<PathBuf> = None;

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            ConvertError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_index =
            entry.file_name().to_str().is_some_and(|name| name.ends_with(INDEX_SUFFIX));
        if !is_index {
            continue;
        }
        if let Some(first) = found {
            return Err(ConvertError::AmbiguousIndex { first, second: entry.into_path() });
        }
        found = Some(entry.into_path());
    }

    found.ok_or_else(|| ConvertError::IndexNotFound { dir: dir.to_path_buf() })
}

#[derive(Deserialize)]
struct IndexFile {
    weight_map: Option<Map<String, Value>>,
}

/// Tensor name → shard file name, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct WeightIndex {
    entries: Vec<(String, String)>,
    lookup: HashMap<String, usize>,
}

impl WeightIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConvertError::io(path, e))?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let invalid =
            |reason: String| ConvertError::InvalidIndex { path: path.to_path_buf(), reason };

        let file: IndexFile = serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let weight_map = file.weight_map.ok_or_else(|| invalid("missing `weight_map`".into()))?;

        let mut index = Self::default();
        for (name, file_name) in weight_map {
            let Value::String(file_name) = file_name else {
                return Err(invalid(format!("shard for `{name}` is not a string")));
            };
            index.insert(name, file_name);
        }
        Ok(index)
    }

    /// Add or replace an entry; replacement keeps the original position.
    pub fn insert(&mut self, name: String, file_name: String) {
        match self.lookup.get(&name) {
            Some(&pos) => self.entries[pos].1 = file_name,
            None => {
                self.lookup.insert(name.clone(), self.entries.len());
                self.entries.push((name, file_name));
            }
        }
    }

    /// Shard file holding `name`.
    pub fn shard_for(&self, name: &str) -> Option<&str> {
        self.lookup.get(name).map(|&pos| self.entries[pos].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// Tensor names in manifest order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Distinct shard files in order of first reference.
    pub fn shard_files(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .map(|(_, file)| file.as_str())
            .filter(|file| seen.insert(*file))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for WeightIndex {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut index = Self::default();
        for (name, file) in iter {
            index.insert(name, file);
        }
        index
    }
}

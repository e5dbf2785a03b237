//! In-memory cache of input shard files.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use safetensors::SafeTensors;

use crate::error::{ConvertError, Result};
use crate::index::WeightIndex;
use crate::tensor::Tensor;

/// Shard file name → raw file bytes. Files are read on first reference and
/// kept for the rest of the run.
pub struct TensorCache {
    dir: PathBuf,
    shards: HashMap<String, Vec<u8>>,
}

impl TensorCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), shards: HashMap::new() }
    }

    /// Load every shard file the index references.
    pub fn preload(&mut self, index: &WeightIndex) -> Result<()> {
        for file_name in index.shard_files() {
            self.shard(file_name)?;
        }
        Ok(())
    }

    pub fn loaded_files(&self) -> usize {
        self.shards.len()
    }

    /// Bytes of `file_name`, reading it if this is the first reference.
    fn shard(&mut self, file_name: &str) -> Result<&[u8]> {
        if !self.shards.contains_key(file_name) {
            let path = self.dir.join(file_name);
            tracing::info!("Loading shard: {}", path.display());
            let buffer = fs::read(&path).map_err(|e| ConvertError::io(&path, e))?;
            // Validate the header once up front.
            SafeTensors::deserialize(&buffer)
                .map_err(|source| ConvertError::SafeTensors { path: path.clone(), source })?;
            self.shards.insert(file_name.to_string(), buffer);
        }
        Ok(&self.shards[file_name])
    }

    /// Copy tensor `name` out of shard `file_name`.
    pub fn tensor(&mut self, file_name: &str, name: &str) -> Result<Tensor> {
        let path = self.path_of(file_name);
        let buffer = self.shard(file_name)?;
        let st = SafeTensors::deserialize(buffer)
            .map_err(|source| ConvertError::SafeTensors { path: path.clone(), source })?;
        let view = st.tensor(name).map_err(|source| ConvertError::SafeTensors { path, source })?;
        Tensor::from_view(name, &view)
    }

    /// Look `name` up in the index and load it.
    pub fn tensor_from_index(&mut self, index: &WeightIndex, name: &str) -> Result<Tensor> {
        let file_name = index
            .shard_for(name)
            .ok_or_else(|| ConvertError::MissingTensor { name: name.to_string() })?;
        self.tensor(file_name, name)
    }

    fn path_of(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

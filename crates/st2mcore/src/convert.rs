//! The remap pass: HuggingFace tensors in, per-rank Megatron state dicts out.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::arch::ArchitectureConfig;
use crate::cache::TensorCache;
use crate::error::{ConvertError, Result};
use crate::index::{WeightIndex, find_index_manifest};
use crate::names::{self, FusedKind, Mapping, Split};
use crate::tensor::Tensor;

/// Settings for one conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    pub tensor_parallel_size: usize,
    /// Emit Transformer Engine parameter names and `_extra_state` placeholders.
    pub use_te: bool,
    pub arch: ArchitectureConfig,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self { tensor_parallel_size: 1, use_te: false, arch: ArchitectureConfig::default() }
    }
}

/// A value in a rank's state dict.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Tensor(Tensor),
    /// Empty `_extra_state` entry; serialized as `None`.
    ExtraState,
}

/// Ordered destination name → value mapping for one tensor-parallel rank.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: Vec<(String, StateValue)>,
    positions: HashMap<String, usize>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced entry keeps its position.
    pub fn insert(&mut self, name: String, value: StateValue) {
        match self.positions.get(&name) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.positions.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&StateValue> {
        self.positions.get(name).map(|&pos| &self.entries[pos].1)
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        match self.get(name)? {
            StateValue::Tensor(t) => Some(t),
            StateValue::ExtraState => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tensor_count(&self) -> usize {
        self.entries.iter().filter(|(_, v)| matches!(v, StateValue::Tensor(_))).count()
    }

    pub fn extra_state_count(&self) -> usize {
        self.len() - self.tensor_count()
    }
}

/// Counts reported after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    pub source_tensors: usize,
    pub destination_tensors: usize,
    pub fused_groups: usize,
    pub extra_state_entries: usize,
    pub shard_files: usize,
}

/// Resolve every name in the index before touching any tensor data, so an
/// unknown name aborts the run before anything is loaded or written.
pub fn plan(index: &WeightIndex, use_te: bool) -> Result<Vec<(String, Mapping)>> {
    index
        .names()
        .map(|name| Ok((name.to_string(), names::map_tensor_name(name, use_te)?)))
        .collect()
}

struct Converter<'a> {
    index: &'a WeightIndex,
    cache: TensorCache,
    options: ConvertOptions,
    qkv_indices: Vec<usize>,
    gate_up_indices: Vec<usize>,
    /// Fused destinations already emitted.
    emitted_groups: HashSet<String>,
    states: Vec<StateDict>,
}

impl<'a> Converter<'a> {
    fn new(index: &'a WeightIndex, cache: TensorCache, options: ConvertOptions) -> Self {
        let tp = options.tensor_parallel_size;
        Self {
            index,
            cache,
            options,
            qkv_indices: options.arch.qkv_permutation(),
            gate_up_indices: options.arch.gate_up_permutation(tp),
            emitted_groups: HashSet::new(),
            states: vec![StateDict::new(); tp],
        }
    }

    fn load(&mut self, name: &str) -> Result<Tensor> {
        Ok(self.cache.tensor_from_index(self.index, name)?.upcast_half())
    }

    /// Concatenate the group's members and reorder rows into Megatron layout.
    fn fuse(&mut self, name: &str, destination: &str, kind: FusedKind) -> Result<Tensor> {
        let members = names::group_members(name, kind);
        if let Some(missing) = members.iter().find(|member| !self.index.contains(member)) {
            return Err(ConvertError::MissingTensor { name: missing.clone() });
        }
        let members =
            members.iter().map(|member| self.load(member)).collect::<Result<Vec<_>>>()?;
        let fused = Tensor::cat_rows(destination, &members)?;

        let indices = match kind {
            FusedKind::Qkv => &self.qkv_indices,
            FusedKind::GateUp => &self.gate_up_indices,
        };
        if fused.shape()[0] != indices.len() {
            return Err(ConvertError::ShapeMismatch {
                name: destination.to_string(),
                reason: format!(
                    "fused tensor has {} rows but the architecture expects {}",
                    fused.shape()[0],
                    indices.len()
                ),
            });
        }
        fused.index_rows(destination, indices)
    }

    fn distribute(&self, destination: &str, tensor: Tensor, split: Split) -> Result<Vec<Tensor>> {
        let tp = self.options.tensor_parallel_size;
        match split {
            Split::Replicate => Ok(vec![tensor; tp]),
            Split::Dim(dim) => tensor.chunk(destination, tp, dim),
        }
    }

    fn process(&mut self, name: &str, mapping: &Mapping) -> Result<()> {
        let destination = mapping.destination.as_str();

        let tensor = match mapping.fused {
            Some(_) if self.emitted_groups.contains(destination) => {
                tracing::trace!("{name}: {destination} already emitted");
                return Ok(());
            }
            Some(kind) => {
                let fused = self.fuse(name, destination, kind)?;
                self.emitted_groups.insert(destination.to_string());
                fused
            }
            None => self.load(name)?,
        };

        let pieces = self.distribute(destination, tensor, mapping.split)?;
        let extra_state =
            if self.options.use_te { names::extra_state_name(destination) } else { None };

        for (state, piece) in self.states.iter_mut().zip(pieces) {
            state.insert(destination.to_string(), StateValue::Tensor(piece));
            if let Some(extra) = &extra_state {
                state.insert(extra.clone(), StateValue::ExtraState);
            }
        }
        tracing::debug!("{destination} processed");
        Ok(())
    }
}

/// Convert an in-memory index + cache into per-rank state dicts.
pub fn convert_index(
    index: &WeightIndex,
    cache: TensorCache,
    options: ConvertOptions,
) -> Result<(Vec<StateDict>, ConversionSummary)> {
    options.arch.validate(options.tensor_parallel_size)?;
    let plan = plan(index, options.use_te)?;

    let mut converter = Converter::new(index, cache, options);
    converter.cache.preload(index)?;

    for (name, mapping) in &plan {
        converter.process(name, mapping)?;
    }

    let first = &converter.states[0];
    let summary = ConversionSummary {
        source_tensors: index.len(),
        destination_tensors: first.tensor_count(),
        fused_groups: converter.emitted_groups.len(),
        extra_state_entries: first.extra_state_count(),
        shard_files: converter.cache.loaded_files(),
    };
    Ok((converter.states, summary))
}

/// Load the checkpoint in `input` and build per-rank state dicts.
pub fn convert_checkpoint(
    input: &Path,
    options: ConvertOptions,
) -> Result<(Vec<StateDict>, ConversionSummary)> {
    options.arch.validate(options.tensor_parallel_size)?;

    let manifest = find_index_manifest(input)?;
    tracing::info!("Index: {}", manifest.display());
    let index = WeightIndex::load(&manifest)?;
    tracing::info!("Found {} tensors in the weight map", index.len());

    convert_index(&index, TensorCache::new(input), options)
}

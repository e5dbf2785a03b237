//! Synthetic Qwen2-style checkpoints for integration tests.

#![allow(dead_code)]

pub mod unpickle;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use half::f16;
use safetensors::Dtype;
use safetensors::tensor::{TensorView, serialize_to_file};
use serde_json::{Map, Value, json};
use st2mcore::ArchitectureConfig;
use tempfile::TempDir;

pub const VOCAB: usize = 8;

/// hidden 8, 4 heads of width 2, 2 query groups, ffn 6.
pub fn tiny_arch() -> ArchitectureConfig {
    ArchitectureConfig {
        hidden_size: 8,
        num_attention_heads: 4,
        num_query_groups: 2,
        ffn_hidden_size: 6,
    }
}

/// A checkpoint on disk plus the values every tensor was written with.
pub struct Fixture {
    pub dir: TempDir,
    pub arch: ArchitectureConfig,
    pub layers: usize,
    /// Source name → (shape, values as they decode from the stored dtype).
    pub tensors: BTreeMap<String, (Vec<usize>, Vec<f32>)>,
}

impl Fixture {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn values(&self, name: &str) -> &[f32] {
        &self.tensors[name].1
    }

    pub fn shape(&self, name: &str) -> &[usize] {
        &self.tensors[name].0
    }
}

fn source_shapes(arch: &ArchitectureConfig, layers: usize) -> Vec<(String, Vec<usize>)> {
    let h = arch.hidden_size;
    let kv = arch.kv_projection_size();
    let f = arch.ffn_hidden_size;

    let mut shapes = vec![
        ("model.embed_tokens.weight".to_string(), vec![VOCAB, h]),
        ("lm_head.weight".to_string(), vec![VOCAB, h]),
        ("model.norm.weight".to_string(), vec![h]),
    ];
    for l in 0..layers {
        let p = format!("model.layers.{l}");
        shapes.extend([
            (format!("{p}.self_attn.q_proj.weight"), vec![h, h]),
            (format!("{p}.self_attn.q_proj.bias"), vec![h]),
            (format!("{p}.self_attn.k_proj.weight"), vec![kv, h]),
            (format!("{p}.self_attn.k_proj.bias"), vec![kv]),
            (format!("{p}.self_attn.v_proj.weight"), vec![kv, h]),
            (format!("{p}.self_attn.v_proj.bias"), vec![kv]),
            (format!("{p}.self_attn.o_proj.weight"), vec![h, h]),
            (format!("{p}.mlp.gate_proj.weight"), vec![f, h]),
            (format!("{p}.mlp.up_proj.weight"), vec![f, h]),
            (format!("{p}.mlp.down_proj.weight"), vec![h, f]),
            (format!("{p}.input_layernorm.weight"), vec![h]),
            (format!("{p}.post_attention_layernorm.weight"), vec![h]),
        ]);
    }
    shapes
}

fn encode(dtype: Dtype, values: &[f32]) -> (Vec<u8>, Vec<f32>) {
    match dtype {
        Dtype::F16 => {
            let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
            let bytes = halves.iter().flat_map(|h| h.to_le_bytes()).collect();
            (bytes, halves.iter().map(|h| h.to_f32()).collect())
        }
        Dtype::F32 => (values.iter().flat_map(|v| v.to_le_bytes()).collect(), values.to_vec()),
        other => panic!("fixture does not support {other:?}"),
    }
}

/// Write a two-file checkpoint: embeddings and layer 0 in the first shard,
/// everything else in the second. Names for which `keep_in_index` returns
/// false are still written to the shard files but left out of the manifest.
pub fn build_checkpoint_with(
    arch: ArchitectureConfig,
    layers: usize,
    dtype: Dtype,
    keep_in_index: impl Fn(&str) -> bool,
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut tensors = BTreeMap::new();
    let mut encoded: HashMap<String, (Vec<usize>, Vec<u8>)> = HashMap::new();

    for (id, (name, shape)) in source_shapes(&arch, layers).into_iter().enumerate() {
        let n: usize = shape.iter().product();
        // distinct per tensor and exact in f16
        let values: Vec<f32> = (0..n).map(|i| (id * 7 + i) as f32 * 0.25).collect();
        let (bytes, decoded) = encode(dtype, &values);
        encoded.insert(name.clone(), (shape.clone(), bytes));
        tensors.insert(name, (shape, decoded));
    }

    let shard_of = |name: &str| {
        if name.contains("embed_tokens") || name.starts_with("model.layers.0.") {
            "model-00001-of-00002.safetensors"
        } else {
            "model-00002-of-00002.safetensors"
        }
    };

    for file in ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"] {
        let views: HashMap<String, TensorView<'_>> = encoded
            .iter()
            .filter(|(name, _)| shard_of(name) == file)
            .map(|(name, (shape, bytes))| {
                (name.clone(), TensorView::new(dtype, shape.clone(), bytes).unwrap())
            })
            .collect();
        serialize_to_file(&views, None, &dir.path().join(file)).unwrap();
    }

    let mut weight_map = Map::new();
    for name in tensors.keys().filter(|n| keep_in_index(n)) {
        weight_map.insert(name.clone(), Value::String(shard_of(name).to_string()));
    }
    let index = json!({ "metadata": { "total_size": 0 }, "weight_map": weight_map });
    fs::write(
        dir.path().join("model.safetensors.index.json"),
        serde_json::to_string_pretty(&index).unwrap(),
    )
    .unwrap();
    fs::write(dir.path().join("config.json"), r#"{"model_type": "qwen2"}"#).unwrap();

    Fixture { dir, arch, layers, tensors }
}

pub fn build_checkpoint(layers: usize) -> Fixture {
    build_checkpoint_with(tiny_arch(), layers, Dtype::F32, |_| true)
}

/// Add an extra manifest entry pointing at an existing shard file.
pub fn add_index_entry(fixture: &Fixture, name: &str) {
    let path = fixture.path().join("model.safetensors.index.json");
    let mut index: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    index["weight_map"][name] = Value::String("model-00002-of-00002.safetensors".to_string());
    fs::write(&path, serde_json::to_string_pretty(&index).unwrap()).unwrap();
}

/// Columns `[start, start + len)` of a row-major `[rows, cols]` buffer.
pub fn column_block(values: &[f32], cols: usize, start: usize, len: usize) -> Vec<f32> {
    values.chunks(cols).flat_map(|row| row[start..start + len].iter().copied()).collect()
}

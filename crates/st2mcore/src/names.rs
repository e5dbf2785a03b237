//! HuggingFace → Megatron-Core tensor name rules.
//!
//! A fixed, exhaustive table for Qwen2-style decoders. Any name the table does
//! not cover is a configuration error: converting a checkpoint with tensors we
//! would silently drop is worse than refusing to run.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{ConvertError, Result};

/// How a destination tensor is distributed over tensor-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Every rank gets the full tensor.
    Replicate,
    /// Split into equal contiguous pieces along this dimension.
    Dim(usize),
}

/// Sibling tensors that are fused into one destination tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusedKind {
    /// `q_proj`, `k_proj`, `v_proj` → `linear_qkv`
    Qkv,
    /// `gate_proj`, `up_proj` → `linear_fc1`
    GateUp,
}

impl FusedKind {
    /// Projection names of the group members, in concatenation order.
    pub fn projections(self) -> &'static [&'static str] {
        match self {
            Self::Qkv => &["q_proj", "k_proj", "v_proj"],
            Self::GateUp => &["gate_proj", "up_proj"],
        }
    }
}

/// Where a source tensor goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub destination: String,
    pub split: Split,
    /// Set when the source is one member of a fused group.
    pub fused: Option<FusedKind>,
}

impl Mapping {
    fn plain(destination: String, split: Split) -> Self {
        Self { destination, split, fused: None }
    }

    fn fused(destination: String, kind: FusedKind) -> Self {
        Self { destination, split: Split::Dim(0), fused: Some(kind) }
    }
}

/// Destination layers that Transformer Engine tags with `_extra_state`.
pub const EXTRA_STATE_LAYERS: &[&str] = &["linear_qkv", "linear_proj", "linear_fc1", "linear_fc2"];

const QKV_WEIGHTS: &[&str] =
    &["self_attn.q_proj.weight", "self_attn.k_proj.weight", "self_attn.v_proj.weight"];
const QKV_BIASES: &[&str] =
    &["self_attn.q_proj.bias", "self_attn.k_proj.bias", "self_attn.v_proj.bias"];
const GATE_UP_WEIGHTS: &[&str] = &["mlp.gate_proj.weight", "mlp.up_proj.weight"];

lazy_static! {
    static ref LAYER_RE: Regex = Regex::new(r"(?:^|\.)model\.layers\.(\d+)\.").unwrap();
}

/// Layer index of a per-layer tensor (`...model.layers.<N>.`).
pub fn layer_index(name: &str) -> Option<usize> {
    LAYER_RE.captures(name).and_then(|c| c[1].parse().ok())
}

/// Resolve the destination of `name`. `use_te` selects Transformer Engine's
/// fused layer-norm parameter names.
pub fn map_tensor_name(name: &str, use_te: bool) -> Result<Mapping> {
    if name.contains("embed_tokens.weight") {
        return Ok(Mapping::plain("embedding.word_embeddings.weight".into(), Split::Dim(0)));
    }
    if name.contains("lm_head.weight") {
        return Ok(Mapping::plain("output_layer.weight".into(), Split::Dim(0)));
    }

    let Some(layer) = layer_index(name) else {
        // the norm after the last layer
        if name.contains("norm.weight") && !name.contains("layernorm.weight") {
            return Ok(Mapping::plain("decoder.final_layernorm.weight".into(), Split::Replicate));
        }
        return Err(ConvertError::UnmappedTensor(name.to_string()));
    };
    let base = format!("decoder.layers.{layer}");

    let mapping = if contains_any(name, QKV_WEIGHTS) {
        Mapping::fused(format!("{base}.self_attention.linear_qkv.weight"), FusedKind::Qkv)
    } else if contains_any(name, QKV_BIASES) {
        Mapping::fused(format!("{base}.self_attention.linear_qkv.bias"), FusedKind::Qkv)
    } else if name.contains("self_attn.o_proj.weight") {
        Mapping::plain(format!("{base}.self_attention.linear_proj.weight"), Split::Dim(1))
    } else if name.contains("post_attention_layernorm.weight") {
        let destination = if use_te {
            format!("{base}.mlp.linear_fc1.layer_norm_weight")
        } else {
            format!("{base}.pre_mlp_layernorm.weight")
        };
        Mapping::plain(destination, Split::Replicate)
    } else if name.contains("input_layernorm.weight") {
        let destination = if use_te {
            format!("{base}.self_attention.linear_qkv.layer_norm_weight")
        } else {
            format!("{base}.input_layernorm.weight")
        };
        Mapping::plain(destination, Split::Replicate)
    } else if contains_any(name, GATE_UP_WEIGHTS) {
        Mapping::fused(format!("{base}.mlp.linear_fc1.weight"), FusedKind::GateUp)
    } else if name.contains("mlp.down_proj.weight") {
        Mapping::plain(format!("{base}.mlp.linear_fc2.weight"), Split::Dim(1))
    } else {
        return Err(ConvertError::UnmappedTensor(name.to_string()));
    };
    Ok(mapping)
}

fn contains_any(name: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| name.contains(p))
}

/// Source names of every member of the group `name` belongs to, obtained by
/// swapping the projection component (second to last) of the name.
pub fn group_members(name: &str, kind: FusedKind) -> Vec<String> {
    let mut parts: Vec<&str> = name.split('.').collect();
    let proj_pos = parts.len().saturating_sub(2);
    kind.projections()
        .iter()
        .map(|proj| {
            parts[proj_pos] = *proj;
            parts.join(".")
        })
        .collect()
}

/// `_extra_state` companion for a destination tensor, if its layer has one.
pub fn extra_state_name(destination: &str) -> Option<String> {
    let (prefix, _) = destination.rsplit_once('.')?;
    let layer = prefix.rsplit('.').next()?;
    EXTRA_STATE_LAYERS.contains(&layer).then(|| format!("{prefix}._extra_state"))
}

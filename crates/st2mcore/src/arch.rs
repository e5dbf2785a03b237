//! Architecture constants and the row permutations derived from them.
//!
//! Megatron-Core stores attention projections as one fused `linear_qkv` tensor
//! whose rows are grouped per query group (`q` heads of the group, then its `k`
//! head, then its `v` head), and MLP `linear_fc1` with gate and up rows
//! interleaved per tensor-parallel rank. HuggingFace checkpoints keep these
//! projections separate, so after concatenating the siblings the rows must be
//! reordered with the indices built here.

use crate::error::{ConvertError, Result};

/// Shape constants of a GQA transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchitectureConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_query_groups: usize,
    pub ffn_hidden_size: usize,
}

impl ArchitectureConfig {
    /// Qwen2.5-7B (also the language model of LLaVA-OneVision 7B).
    pub const fn qwen2_5_7b() -> Self {
        Self {
            hidden_size: 3584,
            num_attention_heads: 28,
            num_query_groups: 4,
            ffn_hidden_size: 18944,
        }
    }

    /// Width of a single attention head.
    pub fn kv_channels(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn heads_per_group(&self) -> usize {
        self.num_attention_heads / self.num_query_groups
    }

    /// Rows of the `k` (and of the `v`) projection.
    pub fn kv_projection_size(&self) -> usize {
        self.kv_channels() * self.num_query_groups
    }

    /// Rows of the fused `linear_qkv` tensor.
    pub fn qkv_rows(&self) -> usize {
        self.hidden_size + 2 * self.kv_projection_size()
    }

    /// Check the constants against each other and against the requested
    /// tensor-parallel size.
    ///
    /// # Errors
    ///
    /// - [`ConvertError::InvalidTensorParallelSize`] when `tensor_parallel_size` is 0.
    /// - [`ConvertError::InvalidArchitecture`] when the head or group counts are zero or
    ///   do not divide `hidden_size` and `num_attention_heads` respectively.
    /// - [`ConvertError::NotDivisible`] when `ffn_hidden_size` or `num_query_groups` is
    ///   not a multiple of `tensor_parallel_size`. Every rank must own whole query
    ///   groups, so the Qwen2.5-7B preset (4 groups) accepts tp 1, 2 and 4 but not 8.
    pub fn validate(&self, tensor_parallel_size: usize) -> Result<()> {
        if tensor_parallel_size == 0 {
            return Err(ConvertError::InvalidTensorParallelSize(tensor_parallel_size));
        }
        if self.num_attention_heads == 0 || self.num_query_groups == 0 {
            return Err(ConvertError::InvalidArchitecture(
                "head and query group counts must be non-zero".to_string(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ConvertError::InvalidArchitecture(format!(
                "hidden size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_query_groups != 0 {
            return Err(ConvertError::InvalidArchitecture(format!(
                "{} attention heads are not divisible into {} query groups",
                self.num_attention_heads, self.num_query_groups
            )));
        }
        if self.ffn_hidden_size % tensor_parallel_size != 0 {
            return Err(ConvertError::NotDivisible {
                what: "ffn_hidden_size".to_string(),
                size: self.ffn_hidden_size,
                parts: tensor_parallel_size,
            });
        }
        if self.num_query_groups % tensor_parallel_size != 0 {
            return Err(ConvertError::NotDivisible {
                what: "num_query_groups".to_string(),
                size: self.num_query_groups,
                parts: tensor_parallel_size,
            });
        }
        Ok(())
    }

    /// Row order that turns `cat([q, k, v])` into Megatron's grouped layout.
    ///
    /// Independent of the tensor-parallel size: every rank receives whole
    /// query groups once the fused tensor is split evenly.
    pub fn qkv_permutation(&self) -> Vec<usize> {
        let kv = self.kv_channels();
        let q_rows_per_group = self.heads_per_group() * kv;
        let k_base = self.hidden_size;
        let v_base = self.hidden_size + self.kv_projection_size();

        let mut indices = Vec::with_capacity(self.qkv_rows());
        for group in 0..self.num_query_groups {
            let q_start = group * q_rows_per_group;
            indices.extend(q_start..q_start + q_rows_per_group);
            indices.extend(k_base + group * kv..k_base + (group + 1) * kv);
            indices.extend(v_base + group * kv..v_base + (group + 1) * kv);
        }
        indices
    }

    /// Row order that turns `cat([gate, up])` into per-rank `[gate_r, up_r]` blocks.
    pub fn gate_up_permutation(&self, tensor_parallel_size: usize) -> Vec<usize> {
        let ffn = self.ffn_hidden_size;
        let interval = ffn / tensor_parallel_size;

        let mut indices = Vec::with_capacity(2 * ffn);
        for rank in 0..tensor_parallel_size {
            let lb = rank * interval;
            let ub = lb + interval;
            indices.extend(lb..ub);
            indices.extend(ffn + lb..ffn + ub);
        }
        indices
    }
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self::qwen2_5_7b()
    }
}

/// Inverse of a permutation: `inverse[perm[i]] == i`.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (position, &source) in perm.iter().enumerate() {
        inverse[source] = position;
    }
    inverse
}

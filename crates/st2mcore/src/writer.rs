//! Megatron-Core checkpoint directory layout.
//!
//! ```text
//! <output>/
//!   latest_checkpointed_iteration.txt      "1"
//!   st2mcore.meta.json                     conversion summary
//!   iter_0000001/
//!     mp_rank_00/model_optim_rng.pt
//!     mp_rank_01/model_optim_rng.pt
//!     ...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::archive;
use crate::convert::{ConversionSummary, ConvertOptions, StateDict};
use crate::error::{ConvertError, Result};

/// Iteration the converted weights are filed under.
pub const ITERATION: u32 = 1;
pub const TRACKER_FILE: &str = "latest_checkpointed_iteration.txt";
pub const CHECKPOINT_FILE: &str = "model_optim_rng.pt";
pub const SIDECAR_FILE: &str = "st2mcore.meta.json";

/// `<output>/iter_0000001/mp_rank_XX/model_optim_rng.pt`
pub fn rank_checkpoint_path(output: &Path, rank: usize) -> PathBuf {
    output
        .join(format!("iter_{ITERATION:07}"))
        .join(format!("mp_rank_{rank:02}"))
        .join(CHECKPOINT_FILE)
}

/// Write one archive per rank, in rank order. Returns the written paths.
pub fn write_rank_checkpoints(output: &Path, states: &[StateDict]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(states.len());
    for (rank, state) in states.iter().enumerate() {
        let path = rank_checkpoint_path(output, rank);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ConvertError::io(dir, e))?;
        }
        tracing::info!("Writing rank {rank}: {} ({} entries)", path.display(), state.len());
        archive::save_state_dict(&path, state)?;
        written.push(path);
    }
    Ok(written)
}

/// Record the iteration so Megatron-Core's loader finds it.
pub fn write_tracker(output: &Path) -> Result<()> {
    let path = output.join(TRACKER_FILE);
    fs::write(&path, ITERATION.to_string()).map_err(|e| ConvertError::io(&path, e))
}

/// Write a JSON summary of the run next to the checkpoint.
pub fn write_sidecar_metadata(
    output: &Path,
    source: &Path,
    options: &ConvertOptions,
    summary: &ConversionSummary,
) -> Result<()> {
    let arch = &options.arch;
    let metadata = json!({
        "source": source.display().to_string(),
        "format": "megatron-core",
        "iteration": ITERATION,
        "tensor_parallel_size": options.tensor_parallel_size,
        "transformer_engine": options.use_te,
        "architecture": {
            "hidden_size": arch.hidden_size,
            "num_attention_heads": arch.num_attention_heads,
            "num_query_groups": arch.num_query_groups,
            "ffn_hidden_size": arch.ffn_hidden_size,
        },
        "source_tensors": summary.source_tensors,
        "destination_tensors": summary.destination_tensors,
        "fused_groups": summary.fused_groups,
        "extra_state_entries": summary.extra_state_entries,
        "shard_files": summary.shard_files,
        "conversion_tool": "st2mcore",
        "conversion_version": env!("CARGO_PKG_VERSION"),
    });

    let path = output.join(SIDECAR_FILE);
    let text =
        serde_json::to_string_pretty(&metadata).map_err(|e| ConvertError::io(&path, e.into()))?;
    fs::write(&path, text).map_err(|e| ConvertError::io(&path, e))?;
    tracing::debug!("Wrote sidecar metadata: {}", path.display());
    Ok(())
}

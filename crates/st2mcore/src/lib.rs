//! SafeTensors → Megatron-Core checkpoint conversion.
//!
//! Reads a HuggingFace checkpoint directory (an `*index.json` manifest plus
//! `*.safetensors` shards), renames tensors to Megatron-Core parameter names,
//! fuses Q/K/V and gate/up projections, splits every partitioned tensor across
//! the requested tensor-parallel ranks, and writes one torch archive per rank.
//!
//! ```rust,no_run
//! use st2mcore::{ConvertOptions, convert};
//! use std::path::Path;
//!
//! let options = ConvertOptions { tensor_parallel_size: 4, ..ConvertOptions::default() };
//! let summary = convert(Path::new("Qwen2.5-7B-Instruct"), Path::new("qwen-mcore-tp4"), options)?;
//! println!("{} tensors written", summary.destination_tensors);
//! # Ok::<(), st2mcore::ConvertError>(())
//! ```

pub mod arch;
pub mod archive;
pub mod cache;
pub mod convert;
pub mod error;
pub mod index;
pub mod names;
pub mod pickle;
pub mod tensor;
pub mod writer;

use std::path::Path;

pub use arch::ArchitectureConfig;
pub use convert::{ConversionSummary, ConvertOptions, StateDict, StateValue, convert_checkpoint};
pub use error::{ConvertError, Result};
pub use tensor::Tensor;

/// Run a full conversion from `input` to `output`.
///
/// Nothing is written until every tensor has been converted; a failure while
/// writing leaves any ranks already written in place.
pub fn convert(input: &Path, output: &Path, options: ConvertOptions) -> Result<ConversionSummary> {
    let (states, summary) = convert_checkpoint(input, options)?;

    writer::write_rank_checkpoints(output, &states)?;
    writer::write_tracker(output)?;
    writer::write_sidecar_metadata(output, input, &options, &summary)?;
    Ok(summary)
}

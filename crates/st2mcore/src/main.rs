//! SafeTensors to Megatron-Core Converter
//!
//! This binary converts a HuggingFace Qwen2.5-7B checkpoint directory into a
//! tensor-parallel Megatron-Core checkpoint.
//!
//! # Usage
//!
//! ```bash
//! # Single rank
//! st2mcore --input Qwen2.5-7B-Instruct/ --output qwen-mcore/
//!
//! # Four tensor-parallel ranks, Transformer Engine parameter names
//! st2mcore --input Qwen2.5-7B-Instruct/ --output qwen-mcore-tp4/ \
//!          --tensor-parallel-size 4 --use-te
//! ```
//!
//! Output:
//!
//! ```text
//! qwen-mcore-tp4/
//!   latest_checkpointed_iteration.txt
//!   st2mcore.meta.json
//!   iter_0000001/mp_rank_00/model_optim_rng.pt
//!   ...
//!   iter_0000001/mp_rank_03/model_optim_rng.pt
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use st2mcore::{ArchitectureConfig, ConvertOptions};
use std::path::PathBuf;

/// Convert HuggingFace SafeTensors weights to Megatron-Core format
#[derive(Parser, Debug)]
#[command(name = "st2mcore")]
#[command(about = "Convert Qwen weights to Megatron-Core format")]
#[command(version)]
struct Args {
    /// Qwen checkpoint directory (index.json + *.safetensors)
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for Megatron state dict file(s)
    #[arg(short, long)]
    output: PathBuf,

    /// Model tensor parallel size
    #[arg(short, long, default_value_t = 1)]
    tensor_parallel_size: usize,

    /// Use Transformer Engine parameter names and `_extra_state` entries
    #[arg(long)]
    use_te: bool,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if !args.input.is_dir() {
        bail!("Input directory does not exist: {}", args.input.display());
    }

    let options = ConvertOptions {
        tensor_parallel_size: args.tensor_parallel_size,
        use_te: args.use_te,
        arch: ArchitectureConfig::qwen2_5_7b(),
    };

    tracing::info!("Input: {}", args.input.display());
    tracing::info!("Output: {}", args.output.display());
    tracing::info!("Tensor parallel size: {}", options.tensor_parallel_size);
    if options.use_te {
        tracing::info!("Transformer Engine: enabled");
    }

    let summary = st2mcore::convert(&args.input, &args.output, options)
        .with_context(|| format!("Failed to convert {}", args.input.display()))?;

    tracing::info!("Conversion complete!");
    tracing::info!(
        "  Tensors: {} source -> {} per rank ({} fused groups)",
        summary.source_tensors,
        summary.destination_tensors,
        summary.fused_groups
    );
    if options.use_te {
        tracing::info!("  Extra state entries: {}", summary.extra_state_entries);
    }
    tracing::info!("  Output: {}", args.output.display());

    Ok(())
}

//! Torch zip-archive (`.pt`) writer.
//!
//! Produces what `torch.save({"model": state_dict}, path)` would: an
//! uncompressed zip holding `data.pkl`, one raw record per tensor storage
//! under `data/`, plus `byteorder` and `version` records, all below a common
//! archive prefix. Tensors are pickled as `torch._utils._rebuild_tensor_v2`
//! calls over persistent storage ids, which `torch.load` resolves against the
//! `data/<key>` records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use safetensors::Dtype;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::convert::{StateDict, StateValue};
use crate::error::{ConvertError, Result};
use crate::pickle::PickleWriter;
use crate::tensor::Tensor;

/// Serialization format version written by current torch releases.
const FORMAT_VERSION: &str = "3\n";

/// Record payloads start on this boundary so torch can mmap them.
const RECORD_ALIGNMENT: u16 = 64;

/// Top-level key Megatron-Core reads model weights from.
pub const MODEL_KEY: &str = "model";

/// Torch storage class for a dtype.
pub fn storage_type(dtype: Dtype) -> Option<&'static str> {
    let name = match dtype {
        Dtype::BOOL => "BoolStorage",
        Dtype::U8 => "ByteStorage",
        Dtype::I8 => "CharStorage",
        Dtype::I16 => "ShortStorage",
        Dtype::I32 => "IntStorage",
        Dtype::I64 => "LongStorage",
        Dtype::F16 => "HalfStorage",
        Dtype::BF16 => "BFloat16Storage",
        Dtype::F32 => "FloatStorage",
        Dtype::F64 => "DoubleStorage",
        _ => return None,
    };
    Some(name)
}

/// Pickle `{"model": state}`, returning the pickle bytes and the tensors
/// whose storages must be written as `data/<i>` records, in key order.
pub fn pickle_state_dict(state: &StateDict) -> Result<(Vec<u8>, Vec<&Tensor>)> {
    let mut w = PickleWriter::new();
    let mut storages = Vec::new();

    w.empty_dict();
    w.string(MODEL_KEY);
    w.empty_dict();
    w.mark();
    for (name, value) in state.iter() {
        w.string(name);
        match value {
            StateValue::Tensor(tensor) => {
                pickle_tensor(&mut w, name, tensor, storages.len())?;
                storages.push(tensor);
            }
            StateValue::ExtraState => w.none(),
        }
    }
    w.set_items();
    w.set_item();

    Ok((w.finish(), storages))
}

fn pickle_tensor(w: &mut PickleWriter, name: &str, tensor: &Tensor, key: usize) -> Result<()> {
    let storage = storage_type(tensor.dtype()).ok_or_else(|| ConvertError::UnsupportedDtype {
        name: name.to_string(),
        dtype: tensor.dtype(),
    })?;
    let to_i64 = |dims: &[usize]| dims.iter().map(|&d| d as i64).collect::<Vec<_>>();

    w.global("torch._utils", "_rebuild_tensor_v2");
    w.mark();
    {
        // persistent id: ('storage', torch.<Type>Storage, key, location, numel)
        w.mark();
        w.string("storage");
        w.global("torch", storage);
        w.string(&key.to_string());
        w.string("cpu");
        w.int(tensor.numel() as i64);
        w.tuple_from_mark();
        w.persistent_id();

        w.int(0);
        w.int_tuple(&to_i64(tensor.shape()));
        w.int_tuple(&to_i64(&tensor.contiguous_strides()));
        w.bool(false);

        w.global("collections", "OrderedDict");
        w.empty_tuple();
        w.reduce();
    }
    w.tuple_from_mark();
    w.reduce();
    Ok(())
}

/// Archive prefix torch derives from the output file name.
fn archive_prefix(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("archive")
        .to_string()
}

/// Write `{"model": state}` to `path` in torch's zip serialization format,
/// replacing any existing file.
pub fn save_state_dict(path: &Path, state: &StateDict) -> Result<()> {
    let (pickle, storages) = pickle_state_dict(state)?;
    let prefix = archive_prefix(path);

    let file = File::create(path).map_err(|e| ConvertError::io(path, e))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let archive_err =
        |source: zip::result::ZipError| ConvertError::Archive { path: path.to_path_buf(), source };

    let write_record = |zip: &mut ZipWriter<BufWriter<File>>, name: String, data: &[u8]| {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .with_alignment(RECORD_ALIGNMENT)
            .large_file(data.len() as u64 >= u64::from(u32::MAX));
        zip.start_file(name, options).map_err(archive_err)?;
        zip.write_all(data).map_err(|e| ConvertError::io(path, e))
    };

    write_record(&mut zip, format!("{prefix}/data.pkl"), &pickle)?;
    write_record(&mut zip, format!("{prefix}/byteorder"), b"little")?;
    for (key, tensor) in storages.iter().enumerate() {
        write_record(&mut zip, format!("{prefix}/data/{key}"), tensor.data())?;
    }
    write_record(&mut zip, format!("{prefix}/version"), FORMAT_VERSION.as_bytes())?;

    let mut inner = zip.finish().map_err(archive_err)?;
    inner.flush().map_err(|e| ConvertError::io(path, e))?;
    Ok(())
}

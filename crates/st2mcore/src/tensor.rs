//! Owned dense tensors and the few shape operations the conversion needs.
//!
//! Data is kept as raw little-endian bytes in row-major order, exactly as it
//! sits in a safetensors file, so concatenation, row selection and chunking
//! are dtype-agnostic byte copies.

use half::f16;
use safetensors::Dtype;
use safetensors::tensor::TensorView;

use crate::error::{ConvertError, Result};

/// Size in bytes of one element, for the dtypes a torch storage can hold.
pub fn element_size(dtype: Dtype) -> Option<usize> {
    match dtype {
        Dtype::BOOL | Dtype::U8 | Dtype::I8 => Some(1),
        Dtype::I16 | Dtype::F16 | Dtype::BF16 => Some(2),
        Dtype::I32 | Dtype::F32 => Some(4),
        Dtype::I64 | Dtype::F64 => Some(8),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Build a tensor, checking that `data` holds exactly `shape` elements.
    pub fn new(name: &str, dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let size = element_size(dtype)
            .ok_or_else(|| ConvertError::UnsupportedDtype { name: name.to_string(), dtype })?;
        let numel: usize = shape.iter().product();
        if numel * size != data.len() {
            return Err(ConvertError::ShapeMismatch {
                name: name.to_string(),
                reason: format!(
                    "shape {:?} of {:?} needs {} bytes, got {}",
                    shape,
                    dtype,
                    numel * size,
                    data.len()
                ),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Copy a tensor out of a safetensors view.
    pub fn from_view(name: &str, view: &TensorView<'_>) -> Result<Self> {
        Self::new(name, view.dtype(), view.shape().to_vec(), view.data().to_vec())
    }

    /// Convenience constructor for f32 data.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new("<f32>", Dtype::F32, shape, data)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Row-major strides in elements.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for d in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.shape[d + 1];
        }
        strides
    }

    /// Decode as f32 values; F16 and BF16 are widened.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        match self.dtype {
            Dtype::F32 => Some(
                self.data
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            Dtype::F16 => Some(
                self.data
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            Dtype::BF16 => Some(
                self.data
                    .chunks_exact(2)
                    .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Widen F16 to F32; any other dtype is returned untouched.
    pub fn upcast_half(self) -> Self {
        if self.dtype != Dtype::F16 {
            return self;
        }
        let widened: Vec<f32> = self
            .data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect();
        Self { dtype: Dtype::F32, shape: self.shape, data: bytemuck::cast_slice(&widened).to_vec() }
    }

    /// Concatenate along dim 0. All parts must share dtype and trailing dims.
    pub fn cat_rows(name: &str, parts: &[Tensor]) -> Result<Self> {
        let first = parts.first().ok_or_else(|| ConvertError::ShapeMismatch {
            name: name.to_string(),
            reason: "nothing to concatenate".to_string(),
        })?;
        if first.shape.is_empty() {
            return Err(ConvertError::ShapeMismatch {
                name: name.to_string(),
                reason: "cannot concatenate scalars".to_string(),
            });
        }

        let mut rows = 0;
        for part in parts {
            if part.dtype != first.dtype {
                return Err(ConvertError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("dtype {:?} differs from {:?}", part.dtype, first.dtype),
                });
            }
            if part.shape.len() != first.shape.len() || part.shape[1..] != first.shape[1..] {
                return Err(ConvertError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("shape {:?} incompatible with {:?}", part.shape, first.shape),
                });
            }
            rows += part.shape[0];
        }

        let mut shape = first.shape.clone();
        shape[0] = rows;
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            data.extend_from_slice(&part.data);
        }
        Ok(Self { dtype: first.dtype, shape, data })
    }

    /// Gather rows (dim 0) in the given order.
    pub fn index_rows(&self, name: &str, indices: &[usize]) -> Result<Self> {
        let rows = self.shape.first().copied().ok_or_else(|| ConvertError::ShapeMismatch {
            name: name.to_string(),
            reason: "cannot index rows of a scalar".to_string(),
        })?;
        if rows == 0 {
            return Ok(self.clone());
        }
        let row_bytes = self.data.len() / rows;

        let mut data = Vec::with_capacity(indices.len() * row_bytes);
        for &row in indices {
            if row >= rows {
                return Err(ConvertError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("row index {row} out of range for {rows} rows"),
                });
            }
            data.extend_from_slice(&self.data[row * row_bytes..(row + 1) * row_bytes]);
        }

        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(Self { dtype: self.dtype, shape, data })
    }

    /// Split into `parts` equal contiguous pieces along `dim`.
    pub fn chunk(&self, name: &str, parts: usize, dim: usize) -> Result<Vec<Self>> {
        if dim >= self.shape.len() {
            return Err(ConvertError::ShapeMismatch {
                name: name.to_string(),
                reason: format!("cannot split dim {dim} of shape {:?}", self.shape),
            });
        }
        let size = self.shape[dim];
        if parts == 0 || size % parts != 0 {
            return Err(ConvertError::NotDivisible {
                what: format!("dim {dim} of `{name}`"),
                size,
                parts,
            });
        }

        let elem = element_size(self.dtype).unwrap_or(1);
        let outer: usize = self.shape[..dim].iter().product();
        let inner_bytes: usize = self.shape[dim + 1..].iter().product::<usize>() * elem;
        let part_len = size / parts;
        let part_bytes = part_len * inner_bytes;
        let span_bytes = size * inner_bytes;

        let mut out = Vec::with_capacity(parts);
        for p in 0..parts {
            let mut data = Vec::with_capacity(outer * part_bytes);
            for o in 0..outer {
                let start = o * span_bytes + p * part_bytes;
                data.extend_from_slice(&self.data[start..start + part_bytes]);
            }
            let mut shape = self.shape.clone();
            shape[dim] = part_len;
            out.push(Self { dtype: self.dtype, shape, data });
        }
        Ok(out)
    }
}

//! Named-item checkpoint container.
//!
//! Every item is stored as one tensor of a safetensors file: its name, shape, element type and
//! raw little-endian payload.

use std::{fs, path::Path};

use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use crate::{
    dtype::DType,
    error::{OptimErr, Result},
};

/// A single named entry of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub bytes: Vec<u8>,
}

impl Item {
    /// Creates a `{1, N}` item holding `values` as `float32`.
    pub fn from_f32(name: impl Into<String>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape: vec![1, values.len()],
            dtype: DType::Float32,
            bytes: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Creates a `{1, N}` item holding `values` as `float64`.
    pub fn from_f64(name: impl Into<String>, values: &[f64]) -> Self {
        Self {
            name: name.into(),
            shape: vec![1, values.len()],
            dtype: DType::Float64,
            bytes: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// The amount of elements described by the item's shape.
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decodes a `float32` payload.
    ///
    /// # Returns
    /// A `DTypeMismatch` error if the item holds another element type.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.check(DType::Float32)?;
        Ok(bytemuck::pod_collect_to_vec(&self.bytes[..]))
    }

    /// Decodes a `float64` payload.
    ///
    /// # Returns
    /// A `DTypeMismatch` error if the item holds another element type.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.check(DType::Float64)?;
        Ok(bytemuck::pod_collect_to_vec(&self.bytes[..]))
    }

    fn check(&self, expected: DType) -> Result<()> {
        if self.dtype != expected {
            return Err(OptimErr::DTypeMismatch {
                expected,
                got: self.dtype,
            });
        }

        let expected_bytes = self.elements() * self.dtype.size();
        if self.bytes.len() != expected_bytes {
            return Err(OptimErr::SizeMismatch {
                a: "item payload",
                b: "item shape",
                got: self.bytes.len(),
                expected: expected_bytes,
            });
        }

        Ok(())
    }
}

/// Reads every item of the checkpoint at `path`.
pub fn load_items<P: AsRef<Path>>(path: P) -> Result<Vec<Item>> {
    let data = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data)?;

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| item_from_view(name, &view))
        .collect()
}

/// Writes all `items` to `path` in a single container, replacing any previous file.
pub fn save_items<P: AsRef<Path>>(path: P, items: &[Item]) -> Result<()> {
    let views = items.iter().map(view_of).collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, &None)?;
    fs::write(path, bytes)?;
    Ok(())
}

fn item_from_view(name: String, view: &TensorView<'_>) -> Result<Item> {
    Ok(Item {
        name,
        shape: view.shape().to_vec(),
        dtype: from_safetensors(view.dtype())?,
        bytes: view.data().to_vec(),
    })
}

fn view_of(item: &Item) -> Result<(&str, TensorView<'_>)> {
    let view = TensorView::new(to_safetensors(item.dtype), item.shape.clone(), &item.bytes)?;
    Ok((item.name.as_str(), view))
}

fn to_safetensors(dtype: DType) -> Dtype {
    match dtype {
        DType::Float16 => Dtype::F16,
        DType::Bfloat16 => Dtype::BF16,
        DType::Float32 => Dtype::F32,
        DType::Float64 => Dtype::F64,
    }
}

fn from_safetensors(dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::F16 => Ok(DType::Float16),
        Dtype::BF16 => Ok(DType::Bfloat16),
        Dtype::F32 => Ok(DType::Float32),
        Dtype::F64 => Ok(DType::Float64),
        other => Err(OptimErr::Checkpoint(format!(
            "unsupported item element type {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.safetensors");

        let items = vec![
            Item::from_f32("adam_mt", &[1.5, -2.25, 3.]),
            Item::from_f64("adam_denoms", &[0.1, 0.001]),
        ];
        save_items(&path, &items).unwrap();

        let mut loaded = load_items(&path).unwrap();
        loaded.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(loaded[0].name, "adam_denoms");
        assert_eq!(loaded[0].to_f64_vec().unwrap(), vec![0.1, 0.001]);
        assert_eq!(loaded[1].name, "adam_mt");
        assert_eq!(loaded[1].shape, vec![1, 3]);
        assert_eq!(loaded[1].to_f32_vec().unwrap(), vec![1.5, -2.25, 3.]);
    }

    #[test]
    fn wrong_dtype() {
        let item = Item::from_f64("adam_mt", &[1.]);
        assert!(matches!(
            item.to_f32_vec(),
            Err(OptimErr::DTypeMismatch {
                expected: DType::Float32,
                got: DType::Float64
            })
        ));
    }

    #[test]
    fn missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_items(dir.path().join("nope.safetensors")).unwrap_err();
        assert!(matches!(err, OptimErr::Io(_)));
    }

    #[test]
    fn empty_vector() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.safetensors");

        save_items(&path, &[Item::from_f32("adagrad_gt", &[])]).unwrap();
        let loaded = load_items(&path).unwrap();
        assert_eq!(loaded[0].elements(), 0);
        assert!(loaded[0].to_f32_vec().unwrap().is_empty());
    }
}

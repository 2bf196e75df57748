use std::borrow::Cow;

use half::{bf16, f16};

use crate::{
    device::Device,
    dtype::{DType, Element},
    error::{OptimErr, Result},
};

#[derive(Debug, Clone)]
enum Storage {
    F16(Box<[f16]>),
    Bf16(Box<[bf16]>),
    F32(Box<[f32]>),
}

/// Runs `$body` with `$data` bound to the concrete typed slice of `$storage`.
macro_rules! dispatch {
    ($storage:expr, $data:ident => $body:expr) => {
        match $storage {
            Storage::F16($data) => $body,
            Storage::Bf16($data) => $body,
            Storage::F32($data) => $body,
        }
    };
}

/// A typed, device resident flat array of floating point values.
///
/// Element-wise operations widen every operand to `f32`, evaluate the expression and round the
/// result back into the destination's element type.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Storage,
    device: Device,
}

impl Buffer {
    /// Creates a new zero filled `Buffer`.
    ///
    /// # Arguments
    /// * `device` - The device owning the buffer.
    /// * `dtype` - The element type.
    /// * `len` - The amount of elements.
    ///
    /// # Returns
    /// A new `Buffer` or an `UnsupportedDType` error for element types without buffer storage.
    pub fn zeros(device: Device, dtype: DType, len: usize) -> Result<Self> {
        let storage = match dtype {
            DType::Float16 => Storage::F16(vec![f16::ZERO; len].into_boxed_slice()),
            DType::Bfloat16 => Storage::Bf16(vec![bf16::ZERO; len].into_boxed_slice()),
            DType::Float32 => Storage::F32(vec![0.; len].into_boxed_slice()),
            DType::Float64 => return Err(OptimErr::UnsupportedDType(dtype)),
        };

        Ok(Self { storage, device })
    }

    /// Creates a new `Buffer` of the given element type holding `values`.
    ///
    /// # Arguments
    /// * `device` - The device owning the buffer.
    /// * `dtype` - The element type, values are rounded into it.
    /// * `values` - The initial contents.
    pub fn from_f32(device: Device, dtype: DType, values: &[f32]) -> Result<Self> {
        let mut buffer = Self::zeros(device, dtype, values.len())?;
        buffer.set_f32(values)?;
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        dispatch!(&self.storage, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self.storage {
            Storage::F16(_) => DType::Float16,
            Storage::Bf16(_) => DType::Bfloat16,
            Storage::F32(_) => DType::Float32,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The amount of device memory backing this buffer.
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size()
    }

    /// Reads a single element widened to `f32`.
    pub fn get(&self, idx: usize) -> Option<f32> {
        dispatch!(&self.storage, data => data.get(idx).map(|x| x.to_f32()))
    }

    /// Writes a single element, rounding `value` into the buffer's element type.
    ///
    /// # Returns
    /// `false` if `idx` is out of bounds.
    pub fn set(&mut self, idx: usize, value: f32) -> bool {
        dispatch!(&mut self.storage, data => match data.get_mut(idx) {
            Some(x) => {
                *x = Element::from_f32(value);
                true
            }
            None => false,
        })
    }

    /// Type checked view of the buffer's elements.
    ///
    /// # Returns
    /// A `DTypeMismatch` error if `T` isn't the buffer's element type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype(T::DTYPE)?;
        Ok(dispatch!(&self.storage, data => bytemuck::cast_slice(&data[..])))
    }

    /// Type checked mutable view of the buffer's elements.
    ///
    /// # Returns
    /// A `DTypeMismatch` error if `T` isn't the buffer's element type.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype(T::DTYPE)?;
        Ok(dispatch!(&mut self.storage, data => bytemuck::cast_slice_mut(&mut data[..])))
    }

    /// Copies the contents of the buffer into host memory as `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.read_f32().into_owned()
    }

    /// Overwrites the entire buffer with `values`.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `values` isn't the same size as the buffer.
    pub fn set_f32(&mut self, values: &[f32]) -> Result<()> {
        self.check_len("values", values.len())?;
        self.apply(|i, _| values[i]);
        Ok(())
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f32) {
        self.apply(|_, _| value);
    }

    /// Overwrites this buffer with the contents of `src`, converting element types if needed.
    ///
    /// # Returns
    /// A `SizeMismatch` error if both buffers differ in length.
    pub fn copy_cast_from(&mut self, src: &Buffer) -> Result<()> {
        self.check_len("source buffer", src.len())?;

        match (&mut self.storage, &src.storage) {
            (Storage::F16(dst), Storage::F16(src)) => dst.copy_from_slice(src),
            (Storage::Bf16(dst), Storage::Bf16(src)) => dst.copy_from_slice(src),
            (Storage::F32(dst), Storage::F32(src)) => dst.copy_from_slice(src),
            (dst, _) => {
                let src = src.read_f32();
                dispatch!(dst, data => apply_typed(&mut data[..], |i, _| src[i]));
            }
        }

        Ok(())
    }

    /// Element-wise `self = f(self)`.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f32) -> f32,
    {
        self.apply(|_, x| f(x));
    }

    /// Element-wise `self = f(self, other)`.
    ///
    /// # Returns
    /// A `SizeMismatch` error if both buffers differ in length.
    pub fn zip_apply<F>(&mut self, other: &Buffer, f: F) -> Result<()>
    where
        F: Fn(f32, f32) -> f32,
    {
        self.check_len("operand", other.len())?;

        let other = other.read_f32();
        self.apply(|i, x| f(x, other[i]));
        Ok(())
    }

    /// Element-wise `self = f(self, a, b)`.
    ///
    /// # Returns
    /// A `SizeMismatch` error if any operand differs in length.
    pub fn zip_apply2<F>(&mut self, a: &Buffer, b: &Buffer, f: F) -> Result<()>
    where
        F: Fn(f32, f32, f32) -> f32,
    {
        self.check_len("first operand", a.len())?;
        self.check_len("second operand", b.len())?;

        let (a, b) = (a.read_f32(), b.read_f32());
        self.apply(|i, x| f(x, a[i], b[i]));
        Ok(())
    }

    /// Sum of the squared elements, accumulated in `f64`.
    pub fn sum_squares(&self) -> f64 {
        dispatch!(&self.storage, data => data
            .iter()
            .map(|x| {
                let x = x.to_f32() as f64;
                x * x
            })
            .sum())
    }

    fn apply<F>(&mut self, f: F)
    where
        F: Fn(usize, f32) -> f32,
    {
        dispatch!(&mut self.storage, data => apply_typed(&mut data[..], f));
    }

    fn read_f32(&self) -> Cow<'_, [f32]> {
        match &self.storage {
            Storage::F32(data) => Cow::Borrowed(&data[..]),
            Storage::F16(data) => Cow::Owned(data.iter().map(|x| x.to_f32()).collect()),
            Storage::Bf16(data) => Cow::Owned(data.iter().map(|x| x.to_f32()).collect()),
        }
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.len() {
            return Err(OptimErr::SizeMismatch {
                a: "buffer",
                b: what,
                got,
                expected: self.len(),
            });
        }

        Ok(())
    }

    fn check_dtype(&self, expected: DType) -> Result<()> {
        let got = self.dtype();
        if got != expected {
            return Err(OptimErr::DTypeMismatch { expected, got });
        }

        Ok(())
    }
}

fn apply_typed<T, F>(data: &mut [T], f: F)
where
    T: Element,
    F: Fn(usize, f32) -> f32,
{
    data.iter_mut()
        .enumerate()
        .for_each(|(i, x)| *x = T::from_f32(f(i, x.to_f32())));
}

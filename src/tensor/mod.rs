use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use num_traits::AsPrimitive;

use crate::errors::{FlintError, FlintResult};
use crate::types::FType;

/// A flat, row-major buffer of one of the four supported element types.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Data {
    pub fn alloc(ftype: FType, len: usize) -> Data {
        match ftype {
            FType::I32 => Data::I32(vec![0; len]),
            FType::I64 => Data::I64(vec![0; len]),
            FType::F32 => Data::F32(vec![0.0; len]),
            FType::F64 => Data::F64(vec![0.0; len]),
        }
    }

    /// Checked allocation for result buffers, surfacing host exhaustion as
    /// an error instead of aborting.
    pub fn try_alloc(ftype: FType, len: usize) -> FlintResult<Data> {
        fn zeroed<T: Clone + Default>(len: usize, bytes: usize) -> FlintResult<Vec<T>> {
            let mut v = Vec::new();
            v.try_reserve_exact(len)
                .map_err(|_| FlintError::OutOfMemory(bytes))?;
            v.resize(len, T::default());
            Ok(v)
        }
        let bytes = len * ftype.byte_size();
        Ok(match ftype {
            FType::I32 => Data::I32(zeroed(len, bytes)?),
            FType::I64 => Data::I64(zeroed(len, bytes)?),
            FType::F32 => Data::F32(zeroed(len, bytes)?),
            FType::F64 => Data::F64(zeroed(len, bytes)?),
        })
    }

    pub fn ftype(&self) -> FType {
        match self {
            Data::I32(_) => FType::I32,
            Data::I64(_) => FType::I64,
            Data::F32(_) => FType::F32,
            Data::F64(_) => FType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Data::I32(v) => v.len(),
            Data::I64(v) => v.len(),
            Data::F32(v) => v.len(),
            Data::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar read with a lossless-enough widening, used by slow paths and
    /// diagnostics only. Kernels go through the typed slices.
    pub fn get_f64(&self, i: usize) -> f64 {
        match self {
            Data::I32(v) => v[i] as f64,
            Data::I64(v) => v[i] as f64,
            Data::F32(v) => v[i] as f64,
            Data::F64(v) => v[i],
        }
    }

    pub fn as_slice<T: Element>(&self) -> FlintResult<&[T]> {
        T::slice_of(self).ok_or_else(|| {
            FlintError::WrongType(format!(
                "buffer holds {:?}, requested {:?}",
                self.ftype(),
                T::TYPE
            ))
        })
    }

    /// Raw view handed to the worker threads. Each range task writes a
    /// disjoint `[from, from + len)` window of the buffer; the driver keeps
    /// the allocation alive until the completion counter drains. The caller
    /// must guarantee exclusive write access per range; when an input buffer
    /// is reused in place, the element-wise kernels read an index strictly
    /// before writing it.
    pub(crate) unsafe fn raw_shared(&self) -> RawBuf {
        let (ptr, len) = match self {
            Data::I32(v) => (v.as_ptr() as *mut u8, v.len()),
            Data::I64(v) => (v.as_ptr() as *mut u8, v.len()),
            Data::F32(v) => (v.as_ptr() as *mut u8, v.len()),
            Data::F64(v) => (v.as_ptr() as *mut u8, v.len()),
        };
        RawBuf {
            ptr,
            len,
            ftype: self.ftype(),
        }
    }
}

/// Unsafe shared view of an output buffer, see [`Data::raw`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawBuf {
    ptr: *mut u8,
    len: usize,
    ftype: FType,
}

unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

impl RawBuf {
    /// Reconstructs the full typed slice. Caller must only write the range it
    /// was handed and must not outlive the owning `Data`.
    pub(crate) unsafe fn slice_mut<T: Element>(&self) -> &mut [T] {
        debug_assert_eq!(self.ftype, T::TYPE);
        std::slice::from_raw_parts_mut(self.ptr as *mut T, self.len)
    }
}

/// Marker for the four element types, bridging buffers, scalars and ndarray.
pub trait Element:
    Copy + PartialOrd + Send + Sync + 'static + AsPrimitive<f64> + AsPrimitive<i64>
{
    const TYPE: FType;
    fn vec_into(data: Vec<Self>) -> Data;
    fn slice_of(data: &Data) -> Option<&[Self]>;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $tag:expr) => {
        impl Element for $t {
            const TYPE: FType = $tag;
            fn vec_into(data: Vec<Self>) -> Data {
                Data::$variant(data)
            }
            fn slice_of(data: &Data) -> Option<&[Self]> {
                match data {
                    Data::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

impl_element!(i32, I32, FType::I32);
impl_element!(i64, I64, FType::I64);
impl_element!(f32, F32, FType::F32);
impl_element!(f64, F64, FType::F64);

/// Materialized representation of a node: host buffer, device buffer, or
/// both. At least one side is present once a node counts as executed; the
/// missing side is bridged on demand.
#[derive(Debug, Clone, Default)]
pub struct ResultData {
    pub cpu: Option<Arc<Data>>,
    #[cfg(feature = "cuda")]
    pub gpu: Option<crate::backend::cuda::GpuBuf>,
    pub entries: usize,
}

impl ResultData {
    pub fn from_cpu(data: Arc<Data>) -> ResultData {
        ResultData {
            entries: data.len(),
            cpu: Some(data),
            #[cfg(feature = "cuda")]
            gpu: None,
        }
    }

    #[cfg(feature = "cuda")]
    pub fn from_gpu(buf: crate::backend::cuda::GpuBuf, entries: usize) -> ResultData {
        ResultData {
            cpu: None,
            gpu: Some(buf),
            entries,
        }
    }

    pub fn has_cpu(&self) -> bool {
        self.cpu.is_some()
    }

    pub fn has_gpu(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            self.gpu.is_some()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }
}

/// Converts a host ndarray into a flat store buffer (standard row-major
/// layout, copied if the array is not contiguous).
pub fn array_to_data<T: Element>(array: &ArrayD<T>) -> (Data, Vec<usize>) {
    let shape = array.shape().to_vec();
    let flat: Vec<T> = array.iter().copied().collect();
    (T::vec_into(flat), shape)
}

/// Reassembles an ndarray from a flat buffer, converting elements when the
/// buffer type differs from the requested one.
pub fn data_to_array<T: Element>(data: &Data, shape: &[usize]) -> FlintResult<ArrayD<T>> {
    let flat: Vec<T> = match T::slice_of(data) {
        Some(slice) => slice.to_vec(),
        None => (0..data.len()).map(|i| T::from_f64(data.get_f64(i))).collect(),
    };
    ArrayD::from_shape_vec(IxDyn(shape), flat).map_err(|_| FlintError::IncompatibleShapes {
        a: shape.to_vec(),
        b: vec![data.len()],
        op: "data_to_array",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn array_round_trip() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let (data, shape) = array_to_data(&a);
        assert_eq!(shape, vec![2, 2]);
        assert_eq!(data.ftype(), FType::F32);
        let back: ArrayD<f32> = data_to_array(&data, &shape).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn converting_read_back() {
        let data = Data::I32(vec![1, 2, 3]);
        let arr: ArrayD<f64> = data_to_array(&data, &[3]).unwrap();
        assert_eq!(arr, array![1.0, 2.0, 3.0].into_dyn());
    }
}

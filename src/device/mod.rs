//! Device-visible data: element types and global-memory tensor views.

pub mod launch;

pub use launch::{launch, CoreCtx, DeviceKernel, LaunchGeometry};

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use half::f16;

/// Element types the pipelines move and compute on.
///
/// Accumulation is always in `f32`; `from_f32` is the narrowing cast applied
/// when results are stored (round-to-nearest-even for `f16`).
pub trait Element: bytemuck::Pod + Copy + Debug + PartialEq + Send + Sync + 'static {
    const NAME: &'static str;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl Element for f32 {
    const NAME: &'static str = "f32";

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f16 {
    const NAME: &'static str = "f16";

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
}

impl Element for i8 {
    const NAME: &'static str = "i8";

    #[inline]
    fn from_f32(v: f32) -> Self {
        v.round().clamp(-128.0, 127.0) as i8
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

/// A view into a global-memory buffer, shared across cores.
///
/// Cloning is cheap and aliases the same storage. `at` derives a sub-view at
/// an element offset, the device idiom for addressing a tile or a workspace
/// region. Cross-core visibility is the point: ordering between cores comes
/// from flags, never from this type.
pub struct GmTensor<E> {
    data: Arc<Mutex<Vec<E>>>,
    offset: usize,
    len: usize,
}

impl<E> Clone for GmTensor<E> {
    fn clone(&self) -> Self {
        GmTensor {
            data: Arc::clone(&self.data),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl<E: Element> GmTensor<E> {
    /// Zero-initialized buffer of `len` elements.
    pub fn new(len: usize) -> Self {
        GmTensor {
            data: Arc::new(Mutex::new(vec![E::from_f32(0.0); len])),
            offset: 0,
            len,
        }
    }

    pub fn from_vec(data: Vec<E>) -> Self {
        let len = data.len();
        GmTensor {
            data: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-view starting `elem_offset` elements into this view.
    pub fn at(&self, elem_offset: usize) -> GmTensor<E> {
        assert!(
            elem_offset <= self.len,
            "sub-view offset {} exceeds view length {}",
            elem_offset,
            self.len
        );
        GmTensor {
            data: Arc::clone(&self.data),
            offset: self.offset + elem_offset,
            len: self.len - elem_offset,
        }
    }

    #[inline]
    pub fn read(&self, idx: usize) -> E {
        assert!(idx < self.len, "read at {} past view of {} elements", idx, self.len);
        self.data.lock().unwrap()[self.offset + idx]
    }

    #[inline]
    pub fn write(&self, idx: usize, value: E) {
        assert!(idx < self.len, "write at {} past view of {} elements", idx, self.len);
        self.data.lock().unwrap()[self.offset + idx] = value;
    }

    /// Run `f` over the view's elements under one lock acquisition.
    pub fn with<R>(&self, f: impl FnOnce(&[E]) -> R) -> R {
        let guard = self.data.lock().unwrap();
        f(&guard[self.offset..self.offset + self.len])
    }

    /// Mutable counterpart of [`Self::with`].
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [E]) -> R) -> R {
        let mut guard = self.data.lock().unwrap();
        f(&mut guard[self.offset..self.offset + self.len])
    }

    /// Copy the view out to a host vector.
    pub fn to_vec(&self) -> Vec<E> {
        self.with(|s| s.to_vec())
    }
}

//! Destination buffers shared between a resource and in-flight reads
//!
//! The resource being populated owns the memory. Pending reads only hold a
//! view, and the reference count keeps the bytes alive until the last read
//! has resolved, so a cancelled request can be dropped at any time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Reference-counted byte storage
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Zero-initialized buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes: Arc::new(Mutex::new(bytes)) }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View of `len` bytes starting at `offset`.
    ///
    /// The range is clamped to the buffer.
    pub fn view(&self, offset: usize, len: usize) -> BufferView {
        let total = self.len();
        let offset = offset.min(total);
        let len = len.min(total - offset);
        BufferView { buffer: self.clone(), offset, len }
    }

    /// View covering the whole buffer
    pub fn whole(&self) -> BufferView {
        self.view(0, usize::MAX)
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Run `f` over the bytes without copying
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.lock())
    }

    /// Take the contents, leaving the buffer empty
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of live handles (views and owners) on this buffer
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}

/// Destination range inside a `SharedBuffer`
#[derive(Clone, Debug)]
pub struct BufferView {
    buffer: SharedBuffer,
    offset: usize,
    len: usize,
}

impl BufferView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Copy `src` into the view.
    ///
    /// Only the valid prefix is copied; if `src` is shorter the remainder is
    /// zero-filled. Returns the number of bytes copied from `src`.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut bytes = self.buffer.lock();
        let end = (self.offset + self.len).min(bytes.len());
        let dest = &mut bytes[self.offset.min(end)..end];
        let copied = src.len().min(dest.len());
        dest[..copied].copy_from_slice(&src[..copied]);
        dest[copied..].fill(0);
        copied
    }

    pub fn fill_zero(&self) {
        self.write(&[]);
    }
}

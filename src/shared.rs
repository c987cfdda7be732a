//! Reference-counted, copy-on-write wrapper over a [`Umem`] region (C2).

use std::sync::Arc;

use crate::umem::Umem;

/// A region of memory that may be shared between multiple buffer descriptors.
///
/// Cloning a `SharedRegion` increments its reference count; dropping the last
/// clone frees the region. Mutating methods copy the underlying buffer out
/// first if the region is currently shared (reference count > 1), so existing
/// holders never observe a write-through — the same contract `Arc::make_mut`
/// already provides, which is why the reference count here just is the
/// `Arc`'s strong count rather than a hand-rolled atomic.
#[derive(Debug, Clone)]
pub struct SharedRegion {
    inner: Arc<Umem>,
}

impl SharedRegion {
    /// Allocates a new, uniquely-owned region of `size` zeroed bytes.
    pub fn alloc(size: usize) -> Self {
        Self {
            inner: Arc::new(Umem::alloc(size)),
        }
    }

    /// Wraps an existing [`Umem`] as a uniquely-owned shared region.
    pub fn from_umem(umem: Umem) -> Self {
        Self {
            inner: Arc::new(umem),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }

    /// Number of outstanding handles to this region, this one included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True if this handle is the sole owner of the region.
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Returns a mutable view of the region, copying the underlying buffer
    /// first if it is currently shared with another handle.
    pub fn make_mut(&mut self) -> &mut Umem {
        Arc::make_mut(&mut self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_storage_until_mutated() {
        let mut a = SharedRegion::alloc(4);
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        assert!(!a.is_unique());

        a.make_mut().as_mut_slice()[0] = 0xff;
        assert_eq!(a.as_slice()[0], 0xff);
        assert_eq!(b.as_slice()[0], 0, "b must not observe a's write");
        assert_eq!(a.ref_count(), 1, "copy-on-write detaches a from b");
    }

    #[test]
    fn unique_region_mutates_in_place() {
        let mut region = SharedRegion::alloc(4);
        assert!(region.is_unique());
        region.make_mut().as_mut_slice()[0] = 1;
        assert_eq!(region.as_slice()[0], 1);
    }
}

//! Typed descriptor heaps
//!
//! A [`DescriptorAllocator`] owns one backend descriptor heap and hands out
//! slot indices from it. The heap kind is a type parameter, so a render-target
//! slot can never be written into a shader-resource heap.

use crate::backend::{
    BackendError, DescriptorHeapDescriptor, DescriptorHeapHandle, DescriptorHeapKind,
    DescriptorView, GraphicsBackend,
};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use thiserror::Error;

/// Descriptor allocation errors
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Descriptor heap capacity must be non-zero")]
    ZeroCapacity,
    #[error("{heap} descriptor heap exhausted (capacity {capacity})")]
    Exhausted { heap: &'static str, capacity: u32 },
    #[error("Descriptor index {index} of the {heap} heap is not allocated")]
    NotAllocated { heap: &'static str, index: u32 },
    #[error("Cannot reserve {count} contiguous {heap} descriptors, {available} left")]
    ReserveFailed {
        heap: &'static str,
        count: u32,
        available: u32,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

mod sealed {
    pub trait Sealed {}
}

/// Marker for a descriptor heap flavour
pub trait DescriptorKind: sealed::Sealed + 'static {
    const KIND: DescriptorHeapKind;
    const NAME: &'static str;
}

/// Heap kind markers
pub mod kind {
    use super::{sealed::Sealed, DescriptorKind};
    use crate::backend::DescriptorHeapKind;

    /// Shader resource and unordered access views
    #[derive(Debug)]
    pub struct ShaderResource;
    #[derive(Debug)]
    pub struct RenderTarget;
    #[derive(Debug)]
    pub struct DepthStencil;
    #[derive(Debug)]
    pub struct Sampler;

    impl Sealed for ShaderResource {}
    impl Sealed for RenderTarget {}
    impl Sealed for DepthStencil {}
    impl Sealed for Sampler {}

    impl DescriptorKind for ShaderResource {
        const KIND: DescriptorHeapKind = DescriptorHeapKind::ShaderResource;
        const NAME: &'static str = "shader resource";
    }

    impl DescriptorKind for RenderTarget {
        const KIND: DescriptorHeapKind = DescriptorHeapKind::RenderTarget;
        const NAME: &'static str = "render target";
    }

    impl DescriptorKind for DepthStencil {
        const KIND: DescriptorHeapKind = DescriptorHeapKind::DepthStencil;
        const NAME: &'static str = "depth stencil";
    }

    impl DescriptorKind for Sampler {
        const KIND: DescriptorHeapKind = DescriptorHeapKind::Sampler;
        const NAME: &'static str = "sampler";
    }
}

/// Index into a descriptor heap of kind `K`
pub struct DescriptorSlot<K> {
    index: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> DescriptorSlot<K> {
    /// Sentinel for "no descriptor". Freeing it is a no-op.
    pub const UNALLOCATED: Self = Self {
        index: u32::MAX,
        _kind: PhantomData,
    };

    fn new(index: u32) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_unallocated(&self) -> bool {
        self.index == u32::MAX
    }
}

impl<K> Clone for DescriptorSlot<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for DescriptorSlot<K> {}

impl<K> PartialEq for DescriptorSlot<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<K> Eq for DescriptorSlot<K> {}

impl<K> fmt::Debug for DescriptorSlot<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unallocated() {
            write!(f, "DescriptorSlot(unallocated)")
        } else {
            write!(f, "DescriptorSlot({})", self.index)
        }
    }
}

/// Fixed-capacity pool of slots in one descriptor heap.
///
/// Freed indices are reused last-freed-first. Fresh indices are handed out in
/// increasing order once the free list is empty.
pub struct DescriptorAllocator<K: DescriptorKind> {
    heap: DescriptorHeapHandle,
    capacity: u32,
    shader_visible: bool,
    /// First index never handed out
    next_unused: u32,
    /// Free list of recyclable indices (LIFO stack)
    free_list: Vec<u32>,
    live: Vec<bool>,
    live_count: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K: DescriptorKind> DescriptorAllocator<K> {
    /// Create the backing heap and an empty pool over it.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self, DescriptorError> {
        if capacity == 0 {
            return Err(DescriptorError::ZeroCapacity);
        }
        let heap = backend.create_descriptor_heap(&DescriptorHeapDescriptor {
            label: Some(format!("{} heap", K::NAME)),
            kind: K::KIND,
            capacity,
            shader_visible,
        })?;
        log::debug!(
            "Created {} descriptor heap ({} slots, shader visible: {})",
            K::NAME,
            capacity,
            shader_visible
        );
        Ok(Self {
            heap,
            capacity,
            shader_visible,
            next_unused: 0,
            free_list: Vec::new(),
            live: vec![false; capacity as usize],
            live_count: 0,
            _kind: PhantomData,
        })
    }

    /// Take a free slot.
    pub fn allocate(&mut self) -> Result<DescriptorSlot<K>, DescriptorError> {
        let index = if let Some(index) = self.free_list.pop() {
            index
        } else if self.next_unused < self.capacity {
            let index = self.next_unused;
            self.next_unused += 1;
            index
        } else {
            return Err(DescriptorError::Exhausted {
                heap: K::NAME,
                capacity: self.capacity,
            });
        };
        self.live[index as usize] = true;
        self.live_count += 1;
        Ok(DescriptorSlot::new(index))
    }

    /// Return a slot to the pool.
    pub fn free(&mut self, slot: DescriptorSlot<K>) -> Result<(), DescriptorError> {
        if slot.is_unallocated() {
            return Ok(());
        }
        let index = slot.index();
        if !self.is_live(index) {
            return Err(DescriptorError::NotAllocated {
                heap: K::NAME,
                index,
            });
        }
        self.live[index as usize] = false;
        self.live_count -= 1;
        self.free_list.push(index);
        Ok(())
    }

    /// Take `count` contiguous slots that have never been handed out.
    ///
    /// The range stays live for the lifetime of the allocator.
    pub fn reserve(&mut self, count: u32) -> Result<Range<u32>, DescriptorError> {
        let available = self.capacity - self.next_unused;
        if count > available {
            return Err(DescriptorError::ReserveFailed {
                heap: K::NAME,
                count,
                available,
            });
        }
        let start = self.next_unused;
        self.next_unused += count;
        for index in start..self.next_unused {
            self.live[index as usize] = true;
        }
        self.live_count += count;
        Ok(start..self.next_unused)
    }

    /// Write a view into a live slot.
    pub fn write<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        slot: DescriptorSlot<K>,
        view: DescriptorView,
    ) -> Result<(), DescriptorError> {
        if !self.is_live(slot.index()) {
            return Err(DescriptorError::NotAllocated {
                heap: K::NAME,
                index: slot.index(),
            });
        }
        backend.write_descriptor(self.heap, slot.index(), view)?;
        Ok(())
    }

    /// Clear the heap entry and return the slot to the pool.
    pub fn release<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        slot: DescriptorSlot<K>,
    ) -> Result<(), DescriptorError> {
        if slot.is_unallocated() {
            return Ok(());
        }
        self.free(slot)?;
        backend.clear_descriptor(self.heap, slot.index())?;
        Ok(())
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.live.get(index as usize).copied().unwrap_or(false)
    }

    pub fn heap(&self) -> DescriptorHeapHandle {
        self.heap
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn live_count(&self) -> u32 {
        self.live_count
    }

    pub fn shader_visible(&self) -> bool {
        self.shader_visible
    }
}

#[cfg(test)]
mod tests {
    use super::kind::{RenderTarget, ShaderResource};
    use super::*;
    use crate::backend::HeadlessBackend;
    use rstest::rstest;
    use std::collections::HashSet;

    fn allocator(capacity: u32) -> (HeadlessBackend, DescriptorAllocator<ShaderResource>) {
        let mut backend = HeadlessBackend::new(8, 8);
        let allocator = DescriptorAllocator::new(&mut backend, capacity, true).unwrap();
        (backend, allocator)
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut backend = HeadlessBackend::new(8, 8);
        let result = DescriptorAllocator::<RenderTarget>::new(&mut backend, 0, false);
        assert!(matches!(result, Err(DescriptorError::ZeroCapacity)));
    }

    #[test]
    fn freed_index_is_reused_first() {
        let (_backend, mut allocator) = allocator(4);
        let slots: Vec<_> = (0..4).map(|_| allocator.allocate().unwrap()).collect();
        let indices: HashSet<u32> = slots.iter().map(|s| s.index()).collect();
        assert_eq!(indices.len(), 4);
        assert!(indices.iter().all(|i| *i < 4));

        allocator.free(slots[2]).unwrap();
        assert_eq!(allocator.allocate().unwrap().index(), 2);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let (_backend, mut allocator) = allocator(2);
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        assert!(matches!(
            allocator.allocate(),
            Err(DescriptorError::Exhausted { capacity: 2, .. })
        ));
    }

    #[test]
    fn double_free_is_rejected() {
        let (_backend, mut allocator) = allocator(4);
        let slot = allocator.allocate().unwrap();
        allocator.free(slot).unwrap();
        assert!(matches!(
            allocator.free(slot),
            Err(DescriptorError::NotAllocated { index: 0, .. })
        ));
        allocator.free(DescriptorSlot::UNALLOCATED).unwrap();
        assert_eq!(allocator.live_count(), 0);
    }

    #[rstest]
    #[case::free_nothing(8, &[])]
    #[case::free_evens(8, &[0, 2, 4, 6])]
    #[case::free_all(5, &[0, 1, 2, 3, 4])]
    #[case::free_last(3, &[2])]
    fn live_indices_stay_disjoint(#[case] capacity: u32, #[case] to_free: &[usize]) {
        let (_backend, mut allocator) = allocator(capacity);
        let mut live: Vec<DescriptorSlot<ShaderResource>> =
            (0..capacity).map(|_| allocator.allocate().unwrap()).collect();

        let mut freed = Vec::new();
        for &i in to_free.iter().rev() {
            let slot = live.remove(i);
            allocator.free(slot).unwrap();
            freed.push(slot.index());
        }

        for _ in 0..freed.len() {
            let slot = allocator.allocate().unwrap();
            assert!(slot.index() < capacity);
            assert!(!live.contains(&slot));
            live.push(slot);
        }

        let unique: HashSet<u32> = live.iter().map(|s| s.index()).collect();
        assert_eq!(unique.len(), live.len());
        assert_eq!(allocator.live_count(), capacity);
    }

    #[test]
    fn reserved_range_is_contiguous_and_never_reallocated() {
        let (_backend, mut allocator) = allocator(8);
        let first = allocator.allocate().unwrap();
        let reserved = allocator.reserve(4).unwrap();
        assert_eq!(reserved, 1..5);

        allocator.free(first).unwrap();
        let mut handed_out = Vec::new();
        while let Ok(slot) = allocator.allocate() {
            handed_out.push(slot.index());
        }
        assert_eq!(handed_out, vec![0, 5, 6, 7]);
        assert!(matches!(
            allocator.reserve(1),
            Err(DescriptorError::ReserveFailed { available: 0, .. })
        ));
    }

    #[test]
    fn writes_require_a_live_slot() {
        let (mut backend, mut allocator) = allocator(2);
        let slot = allocator.allocate().unwrap();
        let sampler = backend
            .create_sampler(&crate::backend::SamplerDescriptor::default())
            .unwrap();
        allocator
            .write(&mut backend, slot, DescriptorView::Sampler(sampler))
            .unwrap();
        assert_eq!(
            backend.descriptor(allocator.heap(), slot.index()),
            Some(DescriptorView::Sampler(sampler))
        );

        allocator.release(&mut backend, slot).unwrap();
        assert_eq!(backend.descriptor(allocator.heap(), slot.index()), None);
        assert!(allocator
            .write(&mut backend, slot, DescriptorView::Sampler(sampler))
            .is_err());
    }
}

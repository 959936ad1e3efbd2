//! A descriptor ring living in DMA-coherent memory.
//!
//! The device reads and writes ring slots behind the driver's back, so the ring never lends out
//! a `&T` or `&mut T` to a slot. Every access is a volatile copy of a whole descriptor,
//! and callers order those copies against the device with explicit fences.

use core::ptr::{self, NonNull};
use core::mem::size_of;
use core::sync::atomic::{fence, Ordering};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use nic_buffers::DmaMapper;

/// Descriptor rings must be 128-byte aligned.
pub const RING_ALIGNMENT: usize = 128;

/// A fixed-capacity circular array of descriptors shared with the device.
pub struct DescriptorRing<T: Copy + Default> {
    base: NonNull<T>,
    capacity: u16,
    phys_addr: u64,
    layout: Layout,
}

// The ring is only touched through volatile copies, so moving it between threads is fine
// as long as the descriptor type itself can be sent.
unsafe impl<T: Copy + Default + Send> Send for DescriptorRing<T> {}

impl<T: Copy + Default> DescriptorRing<T> {
    /// Allocates a zeroed ring of `capacity` descriptors and maps it for device access.
    ///
    /// # Arguments
    /// * `capacity`: number of descriptors in the ring, fixed for the ring's lifetime.
    /// * `dma`: the mapping service that provides the ring's physical address.
    pub fn new(capacity: u16, dma: &dyn DmaMapper) -> Result<DescriptorRing<T>, &'static str> {
        if capacity == 0 {
            return Err("DescriptorRing::new(): capacity must be non-zero");
        }
        let size_in_bytes = capacity as usize * size_of::<T>();
        let layout = Layout::from_size_align(size_in_bytes, RING_ALIGNMENT)
            .map_err(|_e| "DescriptorRing::new(): invalid ring layout")?;

        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) } as *mut T;
        let base = NonNull::new(raw).ok_or("DescriptorRing::new(): out of memory for descriptor ring")?;

        let phys_addr = match dma.map_coherent(base.as_ptr() as usize, size_in_bytes) {
            Ok(paddr) => paddr,
            Err(e) => {
                error!("DescriptorRing::new(): couldn't map {}-byte ring for the device: {}", size_in_bytes, e);
                // SAFETY: allocated just above with the same layout.
                unsafe { dealloc(base.as_ptr() as *mut u8, layout) };
                return Err(e);
            }
        };

        let mut ring = DescriptorRing { base, capacity, phys_addr, layout };
        ring.clear();
        Ok(ring)
    }

    /// The number of descriptors in the ring.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// The physical address of the first descriptor, as programmed into the base address registers.
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// The length of the ring in bytes, as programmed into the length register.
    pub fn size_in_bytes(&self) -> usize {
        self.layout.size()
    }

    /// Returns a copy of the descriptor at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn read(&self, index: u16) -> T {
        assert!(index < self.capacity, "DescriptorRing::read(): index out of bounds");
        // SAFETY: index is in bounds and the memory stays allocated for the lifetime of `self`.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(index as usize)) }
    }

    /// Overwrites the descriptor at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn write(&mut self, index: u16, desc: T) {
        assert!(index < self.capacity, "DescriptorRing::write(): index out of bounds");
        // SAFETY: index is in bounds and the memory stays allocated for the lifetime of `self`.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(index as usize), desc) }
    }

    /// Resets every descriptor to its default (all-zero) value.
    pub fn clear(&mut self) {
        for i in 0..self.capacity {
            self.write(i, T::default());
        }
        fence(Ordering::SeqCst);
    }

    /// Returns the index that follows `index`, wrapping around at the end of the ring.
    pub fn next_index(&self, index: u16) -> u16 {
        if index + 1 == self.capacity { 0 } else { index + 1 }
    }

    /// Releases the device's mapping of the ring. The memory itself is freed on drop.
    pub fn unmap(&self, dma: &dyn DmaMapper) {
        dma.unmap_coherent(self.phys_addr, self.size_in_bytes());
    }
}

impl<T: Copy + Default> Drop for DescriptorRing<T> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new()` with this exact layout.
        unsafe { dealloc(self.base.as_ptr() as *mut u8, self.layout) };
    }
}

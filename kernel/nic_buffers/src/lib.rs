//! Defines buffers that are used to send and receive packets,
//! and the allocation and DMA mapping services a NIC driver borrows from its environment.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;
extern crate mpmc;

use core::fmt;
use core::ops::{Deref, DerefMut};
use alloc::vec::Vec;
use alloc::vec;


bitflags! {
    /// Offloads that a packet asks the NIC to perform on transmit.
    #[derive(Default)]
    pub struct TxOffloadFlags: u8 {
        /// Insert the IPv4 header checksum.
        const IP_CSUM   = 1 << 0;
        /// Insert the TCP checksum.
        const TCP_CSUM  = 1 << 1;
        /// Insert the UDP checksum.
        const UDP_CSUM  = 1 << 2;
        /// Segment this TCP packet into `mss`-sized frames.
        const TSO       = 1 << 3;
    }
}

bitflags! {
    /// Checksum verdicts that the NIC reported for a received frame.
    #[derive(Default)]
    pub struct RxChecksum: u8 {
        /// The IPv4 header checksum was checked by hardware.
        const IP_CHECKED = 1 << 0;
        /// The IPv4 header checksum was correct.
        const IP_VALID   = 1 << 1;
        /// The TCP/UDP checksum, including the pseudo-header, was correct.
        const L4_VALID   = 1 << 2;
    }
}

/// The offload request attached to a packet that is about to be transmitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOffload {
    pub flags: TxOffloadFlags,
    /// Target segment size when `TSO` is requested.
    pub mss: u16,
    /// VLAN tag the NIC should insert.
    pub vlan_tag: Option<u16>,
}


/// A buffer that stores a packet, or a piece of an Ethernet frame.
/// Auto-dereferences into a byte slice that covers its current length.
pub struct PacketBuffer {
    data: Vec<u8>,
    length: usize,
    /// Offloads requested for this packet, only used on transmit.
    pub offload: TxOffload,
    /// Flow hash chosen by the stack, used to pick a transmit queue.
    pub flow_hash: Option<u32>,
}

impl PacketBuffer {
    /// Creates a new zeroed PacketBuffer with the specified size in bytes.
    /// Its length starts out equal to its capacity.
    pub fn new(size_in_bytes: usize) -> PacketBuffer {
        PacketBuffer {
            data: vec![0; size_in_bytes],
            length: size_in_bytes,
            offload: TxOffload::default(),
            flow_hash: None,
        }
    }

    /// Creates a new PacketBuffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> PacketBuffer {
        PacketBuffer {
            data: bytes.to_vec(),
            length: bytes.len(),
            offload: TxOffload::default(),
            flow_hash: None,
        }
    }

    /// The virtual address of the first byte of this buffer.
    pub fn start_address(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: usize) -> Result<(), &'static str> {
        if length > self.data.len() {
            Err("PacketBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }

    /// Returns this buffer to the state of a fresh allocation, without touching its contents.
    pub fn reset(&mut self) {
        self.length = self.data.len();
        self.offload = TxOffload::default();
        self.flow_hash = None;
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..self.length]
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..self.length]
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PacketBuffer {{ vaddr: {:#X}, length: {}, capacity: {}, offload: {:?} }}",
            self.start_address(), self.length, self.data.len(), self.offload)
    }
}


/// One physically-contiguous piece of a buffer, as seen by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSegment {
    pub phys_addr: u64,
    pub length: usize,
}

/// The device-visible view of a mapped buffer.
/// Must be handed back to the same [`DmaMapper`] that created it.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaMapping {
    pub segments: Vec<DmaSegment>,
}

impl DmaMapping {
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

/// The DMA mapping service of the platform.
pub trait DmaMapper: Send + Sync {
    /// Maps the current contents of `buffer` for device access, split into as many segments as needed.
    fn map(&self, buffer: &PacketBuffer) -> Result<DmaMapping, &'static str>;

    /// Releases a mapping created by `map`.
    fn unmap(&self, mapping: DmaMapping);

    /// Maps a long-lived, physically contiguous region (e.g., a descriptor ring) and returns its physical address.
    fn map_coherent(&self, virt_addr: usize, size_in_bytes: usize) -> Result<u64, &'static str>;

    /// Releases a region mapped by `map_coherent`.
    fn unmap_coherent(&self, phys_addr: u64, size_in_bytes: usize);
}

/// The packet buffer allocator of the platform.
/// Both functions may be invoked from interrupt context and must not block.
pub trait BufferAllocator: Send + Sync {
    /// Returns a buffer whose length is `size_in_bytes`, or `None` if memory is exhausted.
    fn alloc(&self, size_in_bytes: usize) -> Option<PacketBuffer>;

    /// Takes back a buffer obtained from `alloc` (or any buffer the driver was handed).
    fn free(&self, buffer: PacketBuffer);
}


/// A pool of pre-allocated, equally-sized buffers that are handed out to the NIC driver
/// and returned to the pool when freed.
pub struct BufferPool {
    pool: mpmc::Queue<PacketBuffer>,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool and fills it with `num_buffers` buffers of `buffer_size` bytes.
    ///
    /// # Arguments
    /// * `num_buffers`: number of buffers that are initially added to the pool
    /// * `buffer_size`: size of each buffer in bytes
    pub fn new(num_buffers: usize, buffer_size: usize) -> Result<BufferPool, &'static str> {
        let pool = mpmc::Queue::with_capacity(num_buffers);
        for _i in 0..num_buffers {
            if pool.push(PacketBuffer::new(buffer_size)).is_err() {
                // if the queue is full, it returns an Err containing the object trying to be pushed
                error!("BufferPool::new(): pool is full, cannot add buffer {}!", _i);
                return Err("nic buffer pool is full");
            }
        }
        Ok(BufferPool { pool, buffer_size })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl BufferAllocator for BufferPool {
    fn alloc(&self, size_in_bytes: usize) -> Option<PacketBuffer> {
        if size_in_bytes > self.buffer_size {
            return Some(PacketBuffer::new(size_in_bytes));
        }
        let mut buffer = match self.pool.pop() {
            Some(buf) => buf,
            None => {
                warn!("NIC buffer pool was empty... reallocating! This means that no task is returning the accumulated received frames.");
                PacketBuffer::new(self.buffer_size)
            }
        };
        buffer.reset();
        // cannot fail, the buffer is at least as big as requested
        let _ = buffer.set_length(size_in_bytes);
        Some(buffer)
    }

    fn free(&self, buffer: PacketBuffer) {
        if buffer.capacity() != self.buffer_size {
            // oversized one-off allocation, just drop it
            return;
        }
        if let Err(_e) = self.pool.push(buffer) {
            error!("NIC: couldn't return freed PacketBuffer to pool, buf capacity: {}", _e.capacity());
        }
    }
}


/// A network (e.g., Ethernet) frame that has been received by the NIC.
///
/// A single frame can span multiple buffers, one per receive descriptor the device used.
#[derive(Debug)]
pub struct ReceivedFrame {
    pub buffers: Vec<PacketBuffer>,
    /// Total number of bytes across all `buffers`.
    pub length: usize,
    /// Receive-side scaling hash, if the device computed one.
    pub rss_hash: Option<u32>,
    /// VLAN tag that the device stripped from the frame.
    pub vlan_tag: Option<u16>,
    pub checksum: RxChecksum,
    /// Packet type bits the device reported (IPv4/IPv6, TCP/UDP, ...).
    pub packet_info: u32,
}

impl ReceivedFrame {
    /// Creates a frame from its buffers with no offload metadata.
    pub fn new(buffers: Vec<PacketBuffer>) -> ReceivedFrame {
        let length = buffers.iter().map(|b| b.length()).sum();
        ReceivedFrame {
            buffers,
            length,
            rss_hash: None,
            vlan_tag: None,
            checksum: RxChecksum::empty(),
            packet_info: 0,
        }
    }

    /// The number of receive descriptors this frame occupied.
    pub fn descriptor_count(&self) -> usize {
        self.buffers.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_is_bounded_by_capacity() {
        let mut buf = PacketBuffer::new(64);
        assert_eq!(buf.length(), 64);
        assert!(buf.set_length(32).is_ok());
        assert_eq!(buf.len(), 32);
        assert!(buf.set_length(65).is_err());
        assert_eq!(buf.length(), 32);
    }

    #[test]
    fn pool_reuses_freed_buffers() {
        let pool = BufferPool::new(2, 2048).unwrap();
        let a = pool.alloc(100).unwrap();
        assert_eq!(a.length(), 100);
        assert_eq!(a.capacity(), 2048);
        let addr = a.start_address();
        pool.free(a);

        let b = pool.alloc(2048).unwrap();
        let c = pool.alloc(2048).unwrap();
        assert!(b.start_address() == addr || c.start_address() == addr);
    }

    #[test]
    fn empty_pool_falls_back_to_allocation() {
        let pool = BufferPool::new(1, 512).unwrap();
        let a = pool.alloc(512).unwrap();
        let b = pool.alloc(512).unwrap();
        assert_ne!(a.start_address(), b.start_address());
    }

    #[test]
    fn received_frame_sums_buffer_lengths() {
        let frame = ReceivedFrame::new(alloc::vec![PacketBuffer::new(1500), PacketBuffer::new(500)]);
        assert_eq!(frame.length, 2000);
        assert_eq!(frame.descriptor_count(), 2);
        assert!(frame.rss_hash.is_none());
    }
}

//! A simulated 82599 for the driver's tests: a register file that records every write,
//! identity DMA, a buffer allocator that keeps count, host and LRO collectors,
//! and a device model that consumes and produces descriptors through the programmed rings.

extern crate std;

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use intel_ethernet::descriptors::*;
use nic_buffers::{BufferAllocator, DmaMapper, DmaMapping, DmaSegment, PacketBuffer, ReceivedFrame};
use network_interface_card::{HostStack, LroHandler};
use crate::config::IxgbeConfig;
use crate::regs::{self, RegisterIo, REG_READ_FAILED};
use crate::IxgbeNic;


pub const SIM_MAC: [u8; 6] = [0x00, 0x1B, 0x21, 0xAA, 0xBB, 0xCC];

/// A register file. Reads return the last value written (or set), except EICR, which clears on read.
pub struct RecordingRegisters {
    values: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
    failed: AtomicBool,
}

impl RecordingRegisters {
    pub fn new() -> RecordingRegisters {
        let mut values = BTreeMap::new();
        values.insert(regs::STATUS, regs::STATUS_LINK_UP);
        values.insert(regs::RAL0, u32::from_le_bytes([SIM_MAC[0], SIM_MAC[1], SIM_MAC[2], SIM_MAC[3]]));
        values.insert(regs::RAH0, u32::from_le_bytes([SIM_MAC[4], SIM_MAC[5], 0, 0x80]));
        RecordingRegisters {
            values: Mutex::new(values),
            writes: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
        }
    }

    /// Changes a register the way the device would, without logging a driver write.
    pub fn set(&self, offset: usize, value: u32) {
        self.values.lock().insert(offset, value);
    }

    pub fn value(&self, offset: usize) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Latches interrupt causes into EICR.
    pub fn raise_eicr(&self, causes: u32) {
        let mut values = self.values.lock();
        *values.entry(regs::EICR).or_insert(0) |= causes;
    }

    /// From now on every read returns all ones, like a device that fell off the bus.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes.lock().iter().filter(|(o, _)| *o == offset).map(|(_, v)| *v).collect()
    }

    pub fn last_write(&self, offset: usize) -> Option<u32> {
        self.writes.lock().iter().rev().find(|(o, _)| *o == offset).map(|(_, v)| *v)
    }

    pub fn clear_log(&self) {
        self.writes.lock().clear();
    }
}

impl RegisterIo for RecordingRegisters {
    fn read32(&self, offset: usize) -> u32 {
        if self.failed.load(Ordering::SeqCst) {
            return REG_READ_FAILED;
        }
        let mut values = self.values.lock();
        if offset == regs::EICR {
            return values.remove(&offset).unwrap_or(0);
        }
        values.get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));
        self.values.lock().insert(offset, value);
    }
}


/// DMA where physical addresses equal virtual ones. Buffers are split into segments of at most `max_segment` bytes.
pub struct IdentityDma {
    max_segment: AtomicUsize,
    fail_maps: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    coherent: Mutex<BTreeSet<u64>>,
}

impl IdentityDma {
    pub fn new(max_segment: usize) -> IdentityDma {
        IdentityDma {
            max_segment: AtomicUsize::new(max_segment),
            fail_maps: AtomicUsize::new(0),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
            coherent: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn set_max_segment(&self, max_segment: usize) {
        self.max_segment.store(max_segment, Ordering::SeqCst);
    }

    /// Makes the next `n` calls to `map` fail.
    pub fn fail_next_maps(&self, n: usize) {
        self.fail_maps.store(n, Ordering::SeqCst);
    }

    /// Streaming mappings that have not been unmapped yet.
    pub fn outstanding_maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst) - self.unmaps.load(Ordering::SeqCst)
    }

    /// Rings that are still mapped.
    pub fn mapped_rings(&self) -> usize {
        self.coherent.lock().len()
    }
}

impl DmaMapper for IdentityDma {
    fn map(&self, buffer: &PacketBuffer) -> Result<DmaMapping, &'static str> {
        let failed = self.fail_maps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err("simulated mapping failure");
        }
        let max_segment = self.max_segment.load(Ordering::SeqCst);
        let start = buffer.start_address() as u64;
        let mut segments = Vec::new();
        let mut offset = 0;
        while offset < buffer.length() {
            let length = core::cmp::min(max_segment, buffer.length() - offset);
            segments.push(DmaSegment { phys_addr: start + offset as u64, length });
            offset += length;
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        Ok(DmaMapping { segments })
    }

    fn unmap(&self, _mapping: DmaMapping) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
    }

    fn map_coherent(&self, virt_addr: usize, _size_in_bytes: usize) -> Result<u64, &'static str> {
        self.coherent.lock().insert(virt_addr as u64);
        Ok(virt_addr as u64)
    }

    fn unmap_coherent(&self, phys_addr: u64, _size_in_bytes: usize) {
        self.coherent.lock().remove(&phys_addr);
    }
}


/// Hands out heap buffers and remembers which ones are outstanding.
pub struct CountingAllocator {
    outstanding: Mutex<BTreeSet<usize>>,
    double_frees: AtomicUsize,
    fail: AtomicBool,
}

impl CountingAllocator {
    pub fn new() -> CountingAllocator {
        CountingAllocator {
            outstanding: Mutex::new(BTreeSet::new()),
            double_frees: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Allocates a buffer holding a copy of `bytes`.
    pub fn packet(&self, bytes: &[u8]) -> PacketBuffer {
        let mut buffer = PacketBuffer::new(bytes.len());
        buffer.copy_from_slice(bytes);
        self.outstanding.lock().insert(buffer.start_address());
        buffer
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Frees that did not match an outstanding allocation.
    pub fn double_frees(&self) -> usize {
        self.double_frees.load(Ordering::SeqCst)
    }
}

impl BufferAllocator for CountingAllocator {
    fn alloc(&self, size_in_bytes: usize) -> Option<PacketBuffer> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        let buffer = PacketBuffer::new(size_in_bytes);
        self.outstanding.lock().insert(buffer.start_address());
        Some(buffer)
    }

    fn free(&self, buffer: PacketBuffer) {
        if !self.outstanding.lock().remove(&buffer.start_address()) {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
        }
    }
}


/// A host stack that keeps every frame it is given.
#[derive(Default)]
pub struct CollectingHost {
    frames: Mutex<Vec<(u8, ReceivedFrame)>>,
}

impl CollectingHost {
    pub fn count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn take(&self) -> Vec<(u8, ReceivedFrame)> {
        core::mem::take(&mut *self.frames.lock())
    }

    /// Returns every collected frame's buffers to `allocator`.
    pub fn release_all(&self, allocator: &dyn BufferAllocator) {
        for (_, frame) in self.take() {
            for buffer in frame.buffers {
                allocator.free(buffer);
            }
        }
    }
}

impl HostStack for CollectingHost {
    fn deliver(&self, queue_id: u8, frame: ReceivedFrame) {
        self.frames.lock().push((queue_id, frame));
    }
}


/// An LRO engine that holds on to every frame it accepts until the next flush.
#[derive(Default)]
pub struct FakeLro {
    held: Mutex<Vec<(u8, ReceivedFrame)>>,
    refuse: AtomicBool,
    merged: AtomicUsize,
    flushes: AtomicUsize,
}

impl FakeLro {
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn merged(&self) -> usize {
        self.merged.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl LroHandler for FakeLro {
    fn try_merge(&self, queue_id: u8, frame: ReceivedFrame) -> Result<(), ReceivedFrame> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(frame);
        }
        self.merged.fetch_add(1, Ordering::SeqCst);
        self.held.lock().push((queue_id, frame));
        Ok(())
    }

    fn flush(&self, queue_id: u8, host: &dyn HostStack) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let mut held = self.held.lock();
        let (flushed, kept): (Vec<_>, Vec<_>) = held.drain(..).partition(|(q, _)| *q == queue_id);
        *held = kept;
        drop(held);
        for (q, frame) in flushed {
            host.deliver(q, frame);
        }
    }
}


/// The parts of a received frame the device reports in the writeback descriptor.
#[derive(Clone, Copy, Default)]
pub struct RxMeta {
    /// Status and error bits besides DD and EOP.
    pub status: u32,
    pub packet_info: u32,
    pub rss_hash: u32,
    pub vlan_tag: u16,
}

/// The device side of the rings: walks them through the programmed base, head and tail registers.
pub struct SimDevice {
    regs: Arc<RecordingRegisters>,
}

impl SimDevice {
    pub fn new(regs: Arc<RecordingRegisters>) -> SimDevice {
        SimDevice { regs }
    }

    fn ring_base(&self, low: usize, high: usize) -> usize {
        (self.regs.value(low) as u64 | (self.regs.value(high) as u64) << 32) as usize
    }

    /// Fetches every descriptor up to the transmit tail and marks those that asked for
    /// a status report as done. Returns the number of descriptors fetched.
    pub fn complete_tx(&self, queue: usize) -> usize {
        self.complete_tx_descriptors(queue, usize::MAX)
    }

    /// Like [`complete_tx()`](Self::complete_tx), but stops after `limit` descriptors.
    pub fn complete_tx_descriptors(&self, queue: usize, limit: usize) -> usize {
        let base = self.ring_base(regs::tdbal(queue), regs::tdbah(queue)) as *mut AdvancedTxDescriptor;
        let len = self.regs.value(regs::tdlen(queue)) / 16;
        let tail = self.regs.value(regs::tdt(queue));
        let mut head = self.regs.value(regs::tdh(queue));
        let mut fetched = 0;
        while head != tail && fetched < limit {
            // SAFETY: the driver programmed this ring and keeps it alive while the device is enabled.
            unsafe {
                let slot = base.add(head as usize);
                let mut desc = ptr::read_volatile(slot);
                if desc.report_status() {
                    desc.mark_done();
                    ptr::write_volatile(slot, desc);
                }
            }
            head = (head + 1) % len;
            fetched += 1;
        }
        self.regs.set(regs::tdh(queue), head);
        fetched
    }

    /// Descriptors the driver has posted to the receive ring and the device has not used yet.
    pub fn rx_available(&self, queue: usize) -> usize {
        let len = self.regs.value(regs::rdlen(queue)) / 16;
        let head = self.regs.value(regs::rdh(queue));
        let tail = self.regs.value(regs::rdt(queue));
        ((tail + len - head) % len) as usize
    }

    /// Receives a single-descriptor frame. Returns false if no buffer was posted.
    pub fn receive_frame(&self, queue: usize, data: &[u8], meta: RxMeta) -> bool {
        self.receive_chain(queue, &[data], meta)
    }

    /// Receives a frame spread over one descriptor per chunk. `meta` goes into the last descriptor.
    /// Returns false, without writing anything, if not enough buffers were posted.
    pub fn receive_chain(&self, queue: usize, chunks: &[&[u8]], meta: RxMeta) -> bool {
        if self.rx_available(queue) < chunks.len() {
            return false;
        }
        let base = self.ring_base(regs::rdbal(queue), regs::rdbah(queue)) as *mut AdvancedRxDescriptor;
        let len = self.regs.value(regs::rdlen(queue)) / 16;
        let mut head = self.regs.value(regs::rdh(queue));

        for (i, chunk) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            // SAFETY: the slot lies between head and tail, so it holds a buffer the driver posted,
            // and the identity mapping makes its address directly usable.
            unsafe {
                let slot = base.add(head as usize);
                let posted = ptr::read_volatile(slot);
                let buffer = posted.packet_buffer_address() as *mut u8;
                ptr::copy_nonoverlapping(chunk.as_ptr(), buffer, chunk.len());
                let (status, packet_info, rss_hash, vlan_tag) = if last {
                    (RXD_STAT_DD | RXD_STAT_EOP | meta.status, meta.packet_info, meta.rss_hash, meta.vlan_tag)
                } else {
                    (RXD_STAT_DD, 0, 0, 0)
                };
                let writeback = AdvancedRxDescriptor::writeback(packet_info, rss_hash, status, chunk.len() as u16, vlan_tag);
                ptr::write_volatile(slot, writeback);
            }
            head = (head + 1) % len;
        }
        self.regs.set(regs::rdh(queue), head);
        true
    }
}


/// A device plus all of its collaborators.
pub struct Harness {
    pub nic: Arc<IxgbeNic>,
    pub regs: Arc<RecordingRegisters>,
    pub dma: Arc<IdentityDma>,
    pub allocator: Arc<CountingAllocator>,
    pub host: Arc<CollectingHost>,
    pub lro: Arc<FakeLro>,
    pub device: SimDevice,
}

/// A small configuration that keeps the tests readable: 8-descriptor rings, no watchdog timer.
pub fn small_config(num_queues: u8) -> IxgbeConfig {
    IxgbeConfig {
        num_queues,
        num_tx_descs: 8,
        num_rx_descs: 8,
        tx_max_segments: 4,
        rx_refill_batch: 4,
        msix_vectors: num_queues as usize,
        watchdog_period: None,
        hang_threshold: 3,
        ..Default::default()
    }
}

pub fn harness(config: IxgbeConfig) -> Harness {
    let regs = Arc::new(RecordingRegisters::new());
    let dma = Arc::new(IdentityDma::new(4096));
    let allocator = Arc::new(CountingAllocator::new());
    let host = Arc::new(CollectingHost::default());
    let lro = Arc::new(FakeLro::default());
    let nic = IxgbeNic::new(
        config,
        regs.clone(),
        dma.clone(),
        allocator.clone(),
        host.clone(),
        Some(lro.clone()),
    ).expect("simulated device should come up");
    Harness { nic, device: SimDevice::new(regs.clone()), regs, dma, allocator, host, lro }
}

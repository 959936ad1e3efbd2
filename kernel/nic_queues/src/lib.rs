//! Per-queue state shared by the NIC drivers: descriptor rings, the shadow tables that track
//! which buffer belongs to which descriptor slot, and the software cursors into each ring.
//!
//! Drivers own one [`TxQueue`] and one [`RxQueue`] per hardware queue and keep each behind its own lock.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate intel_ethernet;
extern crate nic_buffers;

pub mod ring;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor};
use nic_buffers::{PacketBuffer, DmaMapping};
pub use ring::DescriptorRing;


/// Descriptors that are never handed to software for new packets, so that a full ring
/// always leaves room for one context descriptor and tail never catches up to head.
pub const TX_RESERVED_DESCRIPTORS: u16 = 2;

/// Value of [`TxQueue::busy`] once the watchdog has declared the queue hung.
/// Cleanup passes leave it in place until a completion is seen.
pub const TX_QUEUE_HUNG: u32 = 0x8000_0000;


/// A trait for accessing the registers that control one receive queue.
pub trait RxQueueRegisters {
    fn update_rdbal(&mut self, value: u32);
    fn update_rdbah(&mut self, value: u32);
    fn update_rdlen(&mut self, value: u32);
    fn update_rdh(&mut self, value: u32);
    fn update_rdt(&mut self, value: u32);
}

/// A trait for accessing the registers that control one transmit queue.
pub trait TxQueueRegisters {
    fn update_tdbal(&mut self, value: u32);
    fn update_tdbah(&mut self, value: u32);
    fn update_tdlen(&mut self, value: u32);
    fn update_tdh(&mut self, value: u32);
    fn update_tdt(&mut self, value: u32);
}


/// Tracking entry for one transmit descriptor slot.
///
/// Only the first slot of a packet's descriptor group carries the packet and its mapping;
/// `eop` then names the slot whose done bit signals completion of the whole group.
#[derive(Debug, Default)]
pub struct TxSlot {
    pub buffer: Option<PacketBuffer>,
    pub mapping: Option<DmaMapping>,
    pub eop: Option<u16>,
}

impl TxSlot {
    pub fn is_empty(&self) -> bool {
        self.buffer.is_none() && self.eop.is_none()
    }
}

/// Tracking entry for one receive descriptor slot.
#[derive(Debug, Default)]
pub struct RxSlot {
    pub buffer: Option<PacketBuffer>,
    pub mapping: Option<DmaMapping>,
}


/// A struct that holds all information for one transmit queue.
/// There should be one such object per queue.
pub struct TxQueue<S: TxQueueRegisters, T: TxDescriptor> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    /// Registers for this transmit queue
    pub regs: S,
    /// Transmit descriptors
    pub tx_descs: DescriptorRing<T>,
    /// One tracking entry per descriptor, indexed the same way as `tx_descs`.
    pub tx_bufs: Vec<TxSlot>,
    /// Next slot software will fill.
    pub next_avail: u16,
    /// Next slot software expects the device to finish.
    pub next_clean: u16,
    /// Descriptors between `next_clean` and `next_avail`.
    pub in_flight: u16,
    /// Progress counter for hang detection: zero while completions flow,
    /// incremented by every cleanup pass that finds outstanding work but frees nothing.
    pub busy: u32,
    /// Bytes queued since the last moderation pass.
    pub bytes: u64,
    /// Packets queued since the last moderation pass.
    pub packets: u64,
    /// Packets accepted while the ring was full, placed on the ring in order as descriptors free up.
    pub backlog: VecDeque<PacketBuffer>,
}

impl<S: TxQueueRegisters, T: TxDescriptor> TxQueue<S, T> {
    /// Wraps an already programmed ring.
    pub fn new(id: u8, regs: S, tx_descs: DescriptorRing<T>) -> TxQueue<S, T> {
        let mut tx_bufs = Vec::with_capacity(tx_descs.capacity() as usize);
        tx_bufs.resize_with(tx_descs.capacity() as usize, TxSlot::default);
        TxQueue {
            id,
            regs,
            tx_descs,
            tx_bufs,
            next_avail: 0,
            next_clean: 0,
            in_flight: 0,
            busy: 0,
            bytes: 0,
            packets: 0,
            backlog: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.tx_descs.capacity()
    }

    /// Descriptors software may still fill, after setting aside the reserve.
    pub fn available(&self) -> u16 {
        self.capacity().saturating_sub(self.in_flight + TX_RESERVED_DESCRIPTORS)
    }

    pub fn next_index(&self, index: u16) -> u16 {
        self.tx_descs.next_index(index)
    }

    /// Updates the queue tail descriptor in the tdt register
    pub fn update_tdt(&mut self, val: u16) {
        self.regs.update_tdt(val as u32)
    }

    /// Returns and resets the traffic seen since the last call, as `(bytes, packets)`.
    pub fn take_traffic(&mut self) -> (u64, u64) {
        let traffic = (self.bytes, self.packets);
        self.bytes = 0;
        self.packets = 0;
        traffic
    }
}


/// A struct that holds all information for one receive queue.
/// There should be one such object per queue.
pub struct RxQueue<S: RxQueueRegisters, T: RxDescriptor> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    /// Registers for this receive queue
    pub regs: S,
    /// Receive descriptors
    pub rx_descs: DescriptorRing<T>,
    /// One tracking entry per descriptor, indexed the same way as `rx_descs`.
    pub rx_bufs: Vec<RxSlot>,
    /// Size of the buffers posted to the device.
    pub rx_buffer_size: u16,
    /// Next slot to examine for a completed descriptor.
    pub next_check: u16,
    /// Next slot to refill. Slots in `[next_check, next_refresh)` are owned by the device.
    pub next_refresh: u16,
    /// Buffers of a frame that spans several descriptors and has not seen its end yet.
    pub partial_frame: Vec<PacketBuffer>,
    /// Set while skipping the remaining descriptors of an errored frame.
    pub discarding: bool,
    /// Bytes received since the last moderation pass.
    pub bytes: u64,
    /// Packets received since the last moderation pass.
    pub packets: u64,
}

impl<S: RxQueueRegisters, T: RxDescriptor> RxQueue<S, T> {
    /// Wraps an already programmed ring. No buffers are posted yet.
    pub fn new(id: u8, regs: S, rx_descs: DescriptorRing<T>, rx_buffer_size: u16) -> RxQueue<S, T> {
        let mut rx_bufs = Vec::with_capacity(rx_descs.capacity() as usize);
        rx_bufs.resize_with(rx_descs.capacity() as usize, RxSlot::default);
        RxQueue {
            id,
            regs,
            rx_descs,
            rx_bufs,
            rx_buffer_size,
            next_check: 0,
            next_refresh: 0,
            partial_frame: Vec::new(),
            discarding: false,
            bytes: 0,
            packets: 0,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.rx_descs.capacity()
    }

    /// The number of descriptors currently owned by the device.
    pub fn posted(&self) -> u16 {
        if self.next_refresh >= self.next_check {
            self.next_refresh - self.next_check
        } else {
            self.capacity() - self.next_check + self.next_refresh
        }
    }

    pub fn next_index(&self, index: u16) -> u16 {
        self.rx_descs.next_index(index)
    }

    /// Updates the queue tail descriptor in the rdt register
    pub fn update_rdt(&mut self, val: u16) {
        self.regs.update_rdt(val as u32)
    }

    /// Returns and resets the traffic seen since the last call, as `(bytes, packets)`.
    pub fn take_traffic(&mut self) -> (u64, u64) {
        let traffic = (self.bytes, self.packets);
        self.bytes = 0;
        self.packets = 0;
        traffic
    }
}

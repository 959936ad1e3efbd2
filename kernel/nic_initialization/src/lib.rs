//! Functions that are used in a NIC initialization procedure.
//!
//! They include allocating the receive and transmit descriptor rings, programming each queue's
//! base, length, head and tail registers, repopulating a queue after a reset, and releasing it at teardown.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate intel_ethernet;
extern crate nic_buffers;
extern crate nic_queues;

use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor};
use nic_buffers::{BufferAllocator, DmaMapper};
use nic_queues::{DescriptorRing, RxQueue, RxQueueRegisters, TxQueue, TxQueueRegisters};


/// The smallest ring the device accepts.
pub const MIN_DESCRIPTORS: u16 = 8;
/// The largest ring the device accepts.
pub const MAX_DESCRIPTORS: u16 = 4096;

/// Checks that `num_desc` is a ring size the device accepts.
/// The ring length in bytes must be a multiple of 128, i.e., 8 descriptors of 16 bytes.
pub fn validate_descriptor_count(num_desc: u16) -> Result<(), &'static str> {
    if num_desc < MIN_DESCRIPTORS || num_desc > MAX_DESCRIPTORS {
        return Err("number of descriptors must be between 8 and 4096");
    }
    if num_desc % 8 != 0 {
        return Err("number of descriptors must be a multiple of 8");
    }
    Ok(())
}

/// Writes the physical address and length of the rx descs ring, and zeroes head and tail.
fn program_rx_ring<T: RxDescriptor, S: RxQueueRegisters>(rx_descs: &DescriptorRing<T>, rxq_regs: &mut S) {
    let rx_desc_phys_addr_lower  = rx_descs.phys_addr() as u32;
    let rx_desc_phys_addr_higher = (rx_descs.phys_addr() >> 32) as u32;

    rxq_regs.update_rdbal(rx_desc_phys_addr_lower);
    rxq_regs.update_rdbah(rx_desc_phys_addr_higher);
    rxq_regs.update_rdlen(rx_descs.size_in_bytes() as u32);
    rxq_regs.update_rdh(0);
    rxq_regs.update_rdt(0);
}

/// Writes the physical address and length of the tx descs ring, and zeroes head and tail.
fn program_tx_ring<T: TxDescriptor, S: TxQueueRegisters>(tx_descs: &DescriptorRing<T>, txq_regs: &mut S) {
    let tx_desc_phys_addr_lower  = tx_descs.phys_addr() as u32;
    let tx_desc_phys_addr_higher = (tx_descs.phys_addr() >> 32) as u32;

    txq_regs.update_tdbal(tx_desc_phys_addr_lower);
    txq_regs.update_tdbah(tx_desc_phys_addr_higher);
    txq_regs.update_tdlen(tx_descs.size_in_bytes() as u32);
    // both 0 initially because there are no tx requests yet
    txq_regs.update_tdh(0);
    txq_regs.update_tdt(0);
}

/// Steps to create and initialize a receive descriptor queue.
/// No buffers are posted; the driver fills the ring with its first refill pass.
///
/// # Arguments
/// * `id`: the queue number
/// * `num_desc`: number of descriptors in the queue
/// * `rx_buffer_size`: size in bytes of the buffers the driver will post
/// * `dma`: mapping service for the descriptor ring
/// * `rxq_regs`: registers needed to set up a receive queue
pub fn init_rx_queue<T: RxDescriptor, S: RxQueueRegisters>(
    id: u8,
    num_desc: u16,
    rx_buffer_size: u16,
    dma: &dyn DmaMapper,
    mut rxq_regs: S,
) -> Result<RxQueue<S, T>, &'static str> {
    validate_descriptor_count(num_desc)?;
    let rx_descs = DescriptorRing::<T>::new(num_desc, dma)?;
    program_rx_ring(&rx_descs, &mut rxq_regs);
    debug!("nic_initialization::init_rx_queue(): queue {}, phys_addr of rx_desc: {:#X}", id, rx_descs.phys_addr());
    Ok(RxQueue::new(id, rxq_regs, rx_descs, rx_buffer_size))
}

/// Steps to create and initialize a transmit descriptor queue
///
/// # Arguments
/// * `id`: the queue number
/// * `num_desc`: number of descriptors in the queue
/// * `dma`: mapping service for the descriptor ring
/// * `txq_regs`: registers needed to set up a transmit queue
pub fn init_tx_queue<T: TxDescriptor, S: TxQueueRegisters>(
    id: u8,
    num_desc: u16,
    dma: &dyn DmaMapper,
    mut txq_regs: S,
) -> Result<TxQueue<S, T>, &'static str> {
    validate_descriptor_count(num_desc)?;
    let tx_descs = DescriptorRing::<T>::new(num_desc, dma)?;
    program_tx_ring(&tx_descs, &mut txq_regs);
    debug!("nic_initialization::init_tx_queue(): queue {}, phys_addr of tx_desc: {:#X}", id, tx_descs.phys_addr());
    Ok(TxQueue::new(id, txq_regs, tx_descs))
}

/// Returns every buffer the receive queue holds, including a partially assembled frame,
/// clears its ring and reprograms its registers. The ring itself is reused.
///
/// The device must no longer be fetching from this queue.
pub fn reset_rx_queue<T: RxDescriptor, S: RxQueueRegisters>(
    rxq: &mut RxQueue<S, T>,
    dma: &dyn DmaMapper,
    allocator: &dyn BufferAllocator,
) -> usize {
    let mut released = 0;
    for slot in rxq.rx_bufs.iter_mut() {
        if let Some(mapping) = slot.mapping.take() {
            dma.unmap(mapping);
        }
        if let Some(buffer) = slot.buffer.take() {
            allocator.free(buffer);
            released += 1;
        }
    }
    for buffer in rxq.partial_frame.drain(..) {
        allocator.free(buffer);
        released += 1;
    }
    rxq.discarding = false;
    rxq.next_check = 0;
    rxq.next_refresh = 0;
    rxq.bytes = 0;
    rxq.packets = 0;
    rxq.rx_descs.clear();
    program_rx_ring(&rxq.rx_descs, &mut rxq.regs);
    released
}

/// Returns every buffer still tracked by the transmit queue (including its backlog), clears its ring,
/// resets its cursors and reprograms its registers. The ring itself is reused.
///
/// The device must no longer be fetching from this queue.
pub fn reset_tx_queue<T: TxDescriptor, S: TxQueueRegisters>(
    txq: &mut TxQueue<S, T>,
    dma: &dyn DmaMapper,
    allocator: &dyn BufferAllocator,
) -> usize {
    let mut released = 0;
    for slot in txq.tx_bufs.iter_mut() {
        if let Some(mapping) = slot.mapping.take() {
            dma.unmap(mapping);
        }
        if let Some(buffer) = slot.buffer.take() {
            allocator.free(buffer);
            released += 1;
        }
        slot.eop = None;
    }
    for buffer in txq.backlog.drain(..) {
        allocator.free(buffer);
        released += 1;
    }
    txq.next_avail = 0;
    txq.next_clean = 0;
    txq.in_flight = 0;
    txq.busy = 0;
    txq.bytes = 0;
    txq.packets = 0;
    txq.tx_descs.clear();
    program_tx_ring(&txq.tx_descs, &mut txq.regs);
    released
}

/// Releases all buffers of a receive queue and the device's mapping of its ring.
/// The ring memory is freed when the queue is dropped.
pub fn release_rx_queue<T: RxDescriptor, S: RxQueueRegisters>(
    rxq: &mut RxQueue<S, T>,
    dma: &dyn DmaMapper,
    allocator: &dyn BufferAllocator,
) {
    let _released = reset_rx_queue(rxq, dma, allocator);
    rxq.rx_descs.unmap(dma);
    debug!("nic_initialization::release_rx_queue(): queue {} released {} buffers", rxq.id, _released);
}

/// Releases all buffers of a transmit queue and the device's mapping of its ring.
/// The ring memory is freed when the queue is dropped.
pub fn release_tx_queue<T: TxDescriptor, S: TxQueueRegisters>(
    txq: &mut TxQueue<S, T>,
    dma: &dyn DmaMapper,
    allocator: &dyn BufferAllocator,
) {
    let _released = reset_tx_queue(txq, dma, allocator);
    txq.tx_descs.unmap(dma);
    debug!("nic_initialization::release_tx_queue(): queue {} released {} buffers", txq.id, _released);
}

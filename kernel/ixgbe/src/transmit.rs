//! The transmit path: turning a packet into descriptors, ringing the doorbell,
//! and reclaiming the buffers of packets the device has finished sending.

use core::sync::atomic::{fence, Ordering};
use intel_ethernet::descriptors::*;
use nic_buffers::{BufferAllocator, DmaMapper, PacketBuffer};
use nic_queues::{TxQueue, TxSlot, TX_QUEUE_HUNG};
use network_interface_card::TxError;
use crate::DriverCounters;
use crate::offload;
use crate::queue_registers::IxgbeTxQueueRegisters;

/// A transmit queue of the ixgbe device.
pub type IxgbeTxQueue = TxQueue<IxgbeTxQueueRegisters, AdvancedTxDescriptor>;

/// The collaborators and settings the transmit path works with.
pub struct TxEnv<'a> {
    pub dma: &'a dyn DmaMapper,
    pub allocator: &'a dyn BufferAllocator,
    pub counters: &'a DriverCounters,
    pub tso_threshold: usize,
    pub max_segments: usize,
}


/// Places `packet` on the ring and hands it to the device.
///
/// Either every descriptor of the packet is written and the tail register is bumped once,
/// or nothing in the ring changes.
pub fn submit(txq: &mut IxgbeTxQueue, mut packet: PacketBuffer, env: &TxEnv) -> Result<(), TxError> {
    let ctx = offload::prepare(&mut packet, env.tso_threshold);

    let mapping = match env.dma.map(&packet) {
        Ok(m) => m,
        Err(_e) => {
            warn!("ixgbe: tx queue {}: couldn't map packet for DMA: {}", txq.id, _e);
            env.counters.tx_dma_setup_failed.fetch_add(1, Ordering::Relaxed);
            env.allocator.free(packet);
            return Err(TxError::DmaSetupFailed);
        }
    };
    // a segment longer than one descriptor can describe is spread over several
    let ndata: usize = mapping.segments.iter().map(|seg| descriptors_for(seg.length)).sum();
    if ndata == 0 || ndata > env.max_segments {
        debug!("ixgbe: tx queue {}: packet needs {} data descriptors, dropping it", txq.id, ndata);
        env.dma.unmap(mapping);
        env.allocator.free(packet);
        return if ndata == 0 {
            env.counters.tx_dma_setup_failed.fetch_add(1, Ordering::Relaxed);
            Err(TxError::DmaSetupFailed)
        } else {
            Err(TxError::TooManySegments)
        };
    }

    let needed = ndata as u16 + ctx.descriptors_needed();
    if needed > txq.available() {
        env.dma.unmap(mapping);
        env.counters.tx_busy.fetch_add(1, Ordering::Relaxed);
        return Err(TxError::Busy(packet));
    }

    let first = txq.next_avail;
    let mut i = first;
    if let Some(context) = ctx.descriptor {
        txq.tx_descs.write(i, context);
        i = txq.next_index(i);
    }

    let mut last = i;
    let mut written = 0;
    for seg in mapping.segments.iter() {
        let mut offset = 0;
        while offset < seg.length {
            let chunk = core::cmp::min(seg.length - offset, ADVTXD_MAX_DATA_PER_TXD);
            let mut cmd_type_len = ADVTXD_DTYP_DATA | ADVTXD_DCMD_IFCS | ADVTXD_DCMD_DEXT | ctx.cmd | chunk as u32;
            written += 1;
            if written == ndata {
                cmd_type_len |= ADVTXD_DCMD_EOP | ADVTXD_DCMD_RS;
            }
            txq.tx_descs.write(i, AdvancedTxDescriptor::data(seg.phys_addr + offset as u64, cmd_type_len, ctx.olinfo));
            last = i;
            i = txq.next_index(i);
            offset += chunk;
        }
    }

    txq.bytes += packet.length() as u64;
    txq.packets += 1;
    if ctx.tso {
        env.counters.tso_packets.fetch_add(1, Ordering::Relaxed);
    }
    txq.tx_bufs[first as usize] = TxSlot {
        buffer: Some(packet),
        mapping: Some(mapping),
        eop: Some(last),
    };
    txq.next_avail = i;
    txq.in_flight += needed;

    // descriptors must be visible to the device before it sees the new tail
    fence(Ordering::Release);
    txq.update_tdt(txq.next_avail);
    Ok(())
}

/// Transmits `packet` like [`submit()`], but instead of rejecting it for lack of descriptors,
/// holds it in the queue's backlog as long as fewer than `limit` packets are waiting there.
///
/// Packets already in the backlog go first, so the queue's order is kept.
pub fn enqueue(txq: &mut IxgbeTxQueue, packet: PacketBuffer, limit: usize, env: &TxEnv) -> Result<(), TxError> {
    if !txq.backlog.is_empty() {
        drain_backlog(txq, env);
    }
    let packet = if txq.backlog.is_empty() {
        match submit(txq, packet, env) {
            Err(TxError::Busy(packet)) => packet,
            other => return other,
        }
    } else {
        packet
    };
    if txq.backlog.len() >= limit {
        return Err(TxError::Busy(packet));
    }
    txq.backlog.push_back(packet);
    env.counters.tx_backlogged.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Moves backlogged packets onto the ring until it fills up again.
/// Returns the number of packets placed on the ring.
pub fn drain_backlog(txq: &mut IxgbeTxQueue, env: &TxEnv) -> usize {
    let mut sent = 0;
    while let Some(packet) = txq.backlog.pop_front() {
        match submit(txq, packet, env) {
            Ok(()) => sent += 1,
            Err(TxError::Busy(packet)) => {
                txq.backlog.push_front(packet);
                break;
            }
            // already released and counted by submit
            Err(_e) => debug!("ixgbe: tx queue {}: dropped backlogged packet: {:?}", txq.id, _e),
        }
    }
    sent
}

/// The number of data descriptors a DMA segment of `length` bytes takes up.
fn descriptors_for(length: usize) -> usize {
    (length + ADVTXD_MAX_DATA_PER_TXD - 1) / ADVTXD_MAX_DATA_PER_TXD
}

/// Frees the buffers of every packet the device has finished with, in ring order,
/// and returns the number of packets completed.
///
/// Stops at the first packet whose last descriptor is not yet done, so a packet's
/// descriptors are always released together.
pub fn reclaim(txq: &mut IxgbeTxQueue, env: &TxEnv) -> usize {
    let mut completed = 0;

    while txq.in_flight > 0 {
        let first = txq.next_clean;
        let eop = match txq.tx_bufs[first as usize].eop {
            Some(eop) => eop,
            None => {
                error!("ixgbe: tx queue {}: slot {} has outstanding work but no end of packet", txq.id, first);
                break;
            }
        };
        if !txq.tx_descs.read(eop).descriptor_done() {
            break;
        }
        // nothing of the completed group may be touched before the done bit was seen
        fence(Ordering::Acquire);

        let mut idx = first;
        loop {
            let slot = &mut txq.tx_bufs[idx as usize];
            if let Some(mapping) = slot.mapping.take() {
                env.dma.unmap(mapping);
            }
            if let Some(buffer) = slot.buffer.take() {
                env.allocator.free(buffer);
            }
            slot.eop = None;
            txq.in_flight -= 1;
            let done = idx == eop;
            idx = txq.next_index(idx);
            if done {
                break;
            }
        }
        txq.next_clean = idx;
        completed += 1;
    }

    if completed > 0 || txq.in_flight == 0 {
        txq.busy = 0;
    } else if txq.busy != TX_QUEUE_HUNG {
        txq.busy = core::cmp::min(txq.busy + 1, TX_QUEUE_HUNG - 1);
    }
    completed
}

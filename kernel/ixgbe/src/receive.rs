//! The receive path: keeping the ring stocked with buffers and harvesting the frames
//! the device wrote into them.

use core::sync::atomic::{fence, Ordering};
use alloc::vec::Vec;
use intel_ethernet::descriptors::*;
use nic_buffers::{BufferAllocator, DmaMapper, PacketBuffer, ReceivedFrame, RxChecksum};
use nic_queues::RxQueue;
use network_interface_card::{deliver_or_merge, HostStack, LroHandler};
use crate::DriverCounters;
use crate::config::IxgbeConfig;
use crate::queue_registers::IxgbeRxQueueRegisters;

/// A receive queue of the ixgbe device.
pub type IxgbeRxQueue = RxQueue<IxgbeRxQueueRegisters, AdvancedRxDescriptor>;

/// The collaborators and settings the receive path works with.
pub struct RxEnv<'a> {
    pub dma: &'a dyn DmaMapper,
    pub allocator: &'a dyn BufferAllocator,
    pub host: &'a dyn HostStack,
    /// Only present when LRO is enabled.
    pub lro: Option<&'a dyn LroHandler>,
    pub counters: &'a DriverCounters,
    pub config: &'a IxgbeConfig,
}


/// Posts up to `limit` buffers into the slots between `next_refresh` and `next_check`,
/// then writes the new tail once. Returns the number of descriptors posted.
///
/// A slot that still holds its buffer (recycled after a copy or an error) is re-posted as is.
/// On allocation or mapping failure the remaining slots stay empty until the next call.
pub fn refill(rxq: &mut IxgbeRxQueue, limit: usize, env: &RxEnv) -> usize {
    let mut posted = 0;

    while posted < limit && rxq.next_index(rxq.next_refresh) != rxq.next_check {
        let idx = rxq.next_refresh;
        let recycled = rxq.rx_bufs[idx as usize].mapping.as_ref()
            .and_then(|m| m.segments.first())
            .map(|seg| seg.phys_addr);

        let phys_addr = match recycled {
            Some(paddr) => paddr,
            None => {
                let buffer = match env.allocator.alloc(rxq.rx_buffer_size as usize) {
                    Some(b) => b,
                    None => {
                        env.counters.rx_alloc_failed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                };
                let mapping = match env.dma.map(&buffer) {
                    Ok(m) if m.num_segments() == 1 => m,
                    Ok(m) => {
                        env.dma.unmap(m);
                        env.counters.rx_dma_map_failed.fetch_add(1, Ordering::Relaxed);
                        env.allocator.free(buffer);
                        break;
                    }
                    Err(_e) => {
                        debug!("ixgbe: rx queue {}: couldn't map receive buffer: {}", rxq.id, _e);
                        env.counters.rx_dma_map_failed.fetch_add(1, Ordering::Relaxed);
                        env.allocator.free(buffer);
                        break;
                    }
                };
                let paddr = mapping.segments[0].phys_addr;
                let slot = &mut rxq.rx_bufs[idx as usize];
                slot.buffer = Some(buffer);
                slot.mapping = Some(mapping);
                paddr
            }
        };

        rxq.rx_descs.write(idx, AdvancedRxDescriptor::new_read(phys_addr));
        rxq.next_refresh = rxq.next_index(idx);
        posted += 1;
    }

    if posted > 0 {
        fence(Ordering::Release);
        rxq.update_rdt(rxq.next_refresh);
    }
    posted
}

/// Delivers up to `budget` completed frames to the host stack (or LRO).
///
/// Returns the number of frames delivered and whether completed descriptors were
/// left behind because the budget ran out.
pub fn poll(rxq: &mut IxgbeRxQueue, budget: usize, env: &RxEnv) -> (usize, bool) {
    let config = env.config;
    let mut processed = 0;
    let mut delivered = 0;
    let mut consumed = 0;

    while processed < budget && rxq.next_check != rxq.next_refresh {
        let idx = rxq.next_check;
        if !rxq.rx_descs.read(idx).descriptor_done() {
            break;
        }
        // the rest of the descriptor is only valid once DD was observed
        fence(Ordering::Acquire);
        let desc = rxq.rx_descs.read(idx);
        let eop = desc.end_of_packet();
        let length = desc.length() as usize;

        let mut finished: Option<Vec<PacketBuffer>> = None;

        if desc.frame_error() || rxq.discarding || length > rxq.rx_buffer_size as usize {
            if !rxq.discarding {
                env.counters.rx_drops.fetch_add(1, Ordering::Relaxed);
                trace!("ixgbe: rx queue {}: dropping errored frame at {}, status {:#X}", rxq.id, idx, desc.status_error());
            }
            for buffer in rxq.partial_frame.drain(..) {
                env.allocator.free(buffer);
            }
            rxq.discarding = !eop;
            if eop {
                processed += 1;
            }
        } else if eop && rxq.partial_frame.is_empty() && length <= config.rx_copy_threshold {
            match copy_small_frame(rxq, idx, length, env.allocator) {
                Some(small) => finished = Some(alloc::vec![small]),
                None => {
                    env.counters.rx_alloc_failed.fetch_add(1, Ordering::Relaxed);
                    env.counters.rx_drops.fetch_add(1, Ordering::Relaxed);
                    processed += 1;
                }
            }
        } else {
            let slot = &mut rxq.rx_bufs[idx as usize];
            match (slot.buffer.take(), slot.mapping.take()) {
                (Some(mut buffer), Some(mapping)) => {
                    env.dma.unmap(mapping);
                    match buffer.set_length(length) {
                        Ok(()) => {
                            rxq.partial_frame.push(buffer);
                            if eop {
                                finished = Some(core::mem::take(&mut rxq.partial_frame));
                            }
                        }
                        Err(_e) => {
                            warn!("ixgbe: rx queue {}: {}-byte completion at {} overflows its buffer: {}", rxq.id, length, idx, _e);
                            env.allocator.free(buffer);
                            discard_frame(rxq, eop, env);
                            if eop {
                                processed += 1;
                            }
                        }
                    }
                }
                (buffer, mapping) => {
                    error!("ixgbe: rx queue {}: completed descriptor {} has no posted buffer", rxq.id, idx);
                    if let Some(m) = mapping {
                        env.dma.unmap(m);
                    }
                    if let Some(b) = buffer {
                        env.allocator.free(b);
                    }
                    discard_frame(rxq, eop, env);
                    if eop {
                        processed += 1;
                    }
                }
            }
        }

        if let Some(buffers) = finished {
            let frame = build_frame(buffers, &desc, config);
            rxq.bytes += frame.length as u64;
            rxq.packets += 1;
            hand_off(rxq.id, frame, env);
            delivered += 1;
            processed += 1;
        }

        rxq.next_check = rxq.next_index(idx);
        consumed += 1;
        if consumed >= config.rx_refill_batch {
            refill(rxq, consumed, env);
            consumed = 0;
        }
    }

    let capacity = rxq.capacity() as usize;
    refill(rxq, capacity, env);
    if let Some(lro) = env.lro {
        lro.flush(rxq.id, env.host);
    }

    let more_work = processed >= budget
        && rxq.next_check != rxq.next_refresh
        && rxq.rx_descs.read(rxq.next_check).descriptor_done();
    (delivered, more_work)
}

/// Drops the frame being assembled; if `eop` is false, the rest of it is skipped as it arrives.
fn discard_frame(rxq: &mut IxgbeRxQueue, eop: bool, env: &RxEnv) {
    for b in rxq.partial_frame.drain(..) {
        env.allocator.free(b);
    }
    rxq.discarding = !eop;
    env.counters.rx_drops.fetch_add(1, Ordering::Relaxed);
}

/// Copies a small frame out of its receive buffer, leaving the buffer in its slot for re-posting.
fn copy_small_frame(rxq: &IxgbeRxQueue, idx: u16, length: usize, allocator: &dyn BufferAllocator) -> Option<PacketBuffer> {
    let source = rxq.rx_bufs[idx as usize].buffer.as_ref()?;
    let mut small = allocator.alloc(length)?;
    if small.set_length(length).is_err() || source.len() < length {
        allocator.free(small);
        return None;
    }
    small[..length].copy_from_slice(&source[..length]);
    Some(small)
}

/// Attaches the offload results of the frame's last descriptor to the frame.
fn build_frame(buffers: Vec<PacketBuffer>, last: &AdvancedRxDescriptor, config: &IxgbeConfig) -> ReceivedFrame {
    let mut frame = ReceivedFrame::new(buffers);
    let staterr = last.status_error();

    if config.rx_checksum_offload {
        let mut checksum = RxChecksum::empty();
        if staterr & RXD_STAT_IPCS != 0 {
            checksum |= RxChecksum::IP_CHECKED;
            if staterr & RXDADV_ERR_IPE == 0 {
                checksum |= RxChecksum::IP_VALID;
            }
        }
        if staterr & RXD_STAT_L4CS != 0 && staterr & RXDADV_ERR_TCPE == 0 {
            checksum |= RxChecksum::L4_VALID;
        }
        frame.checksum = checksum;
    }
    if last.rss_type() != 0 {
        frame.rss_hash = Some(last.rss_hash());
    }
    if config.hw_vlan_strip && staterr & RXD_STAT_VP != 0 {
        frame.vlan_tag = Some(last.vlan_tag());
    }
    frame.packet_info = last.packet_info();
    frame
}

/// Returns true if the frame is a TCP segment the LRO engine may coalesce.
fn lro_eligible(frame: &ReceivedFrame, config: &IxgbeConfig) -> bool {
    let info = frame.packet_info;
    let ip = info & (RXDADV_PKTTYPE_IPV4 | RXDADV_PKTTYPE_IPV4_EX | RXDADV_PKTTYPE_IPV6) != 0;
    let tcp = info & RXDADV_PKTTYPE_TCP != 0;
    ip && tcp
        && frame.checksum.contains(RxChecksum::L4_VALID)
        && frame.descriptor_count() <= config.lro_max_descriptors
}

fn hand_off(queue_id: u8, frame: ReceivedFrame, env: &RxEnv) {
    let lro = match env.lro {
        Some(lro) if env.config.lro_enabled && lro_eligible(&frame, env.config) => Some(lro),
        _ => None,
    };
    deliver_or_merge(queue_id, frame, lro, env.host);
}

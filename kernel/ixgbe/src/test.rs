//! Whole-driver tests against the simulated device in [`crate::sim`].

extern crate std;

use std::thread;
use std::time::{Duration, Instant};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use intel_ethernet::descriptors::*;
use nic_buffers::{BufferAllocator, BufferPool, TxOffload, TxOffloadFlags};
use network_interface_card::{NetworkInterfaceCard, TxError};
use nic_queues::TX_QUEUE_HUNG;
use crate::config::{IxgbeConfig, ModerationConfig};
use crate::offload::tests::tcp4_frame;
use crate::regs;
use crate::sim::*;
use crate::{VectorState, WatchdogOutcome};


fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Receive buffers posted on a fresh 8-descriptor ring.
const POSTED: usize = 7;

impl Harness {
    fn send(&self, queue: u8, len: usize) -> Result<(), TxError> {
        self.nic.submit(queue, self.allocator.packet(&vec![0x5A; len]))
    }

    fn in_flight(&self, queue: usize) -> u16 {
        self.nic.queues[queue].tx.lock().in_flight
    }

    fn check_conservation(&self) {
        for q in &self.nic.queues {
            let txq = q.tx.lock();
            assert_eq!(txq.in_flight + txq.available() + nic_queues::TX_RESERVED_DESCRIPTORS, txq.capacity());
        }
    }
}


#[test]
fn basic_round_trip() {
    let h = harness(small_config(1));
    assert_eq!(h.allocator.outstanding(), POSTED);

    h.send(0, 64).unwrap();
    assert_eq!(h.in_flight(0), 1);
    assert_eq!(h.regs.last_write(regs::tdt(0)), Some(1));

    // nothing completed yet
    assert_eq!(h.nic.reclaim(0), Ok(0));
    assert_eq!(h.in_flight(0), 1);

    assert_eq!(h.device.complete_tx(0), 1);
    assert_eq!(h.nic.reclaim(0), Ok(1));
    assert_eq!(h.in_flight(0), 0);
    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.allocator.double_frees(), 0);
    h.check_conservation();
}

#[test]
fn busy_rejection_leaves_ring_untouched() {
    let h = harness(small_config(1));
    for _ in 0..6 {
        h.send(0, 64).unwrap();
    }
    h.check_conservation();

    let descs_before: Vec<_> = {
        let txq = h.nic.queues[0].tx.lock();
        (0..8).map(|i| txq.tx_descs.read(i)).collect()
    };
    let tail_writes = h.regs.writes_to(regs::tdt(0)).len();

    let rejected = h.send(0, 64);
    match rejected {
        Err(TxError::Busy(packet)) => {
            assert_eq!(packet.length(), 64);
            h.allocator.free(packet);
        }
        other => panic!("expected Busy, got {:?}", other),
    }

    let txq = h.nic.queues[0].tx.lock();
    let descs_after: Vec<_> = (0..8).map(|i| txq.tx_descs.read(i)).collect();
    assert_eq!(descs_before, descs_after);
    assert_eq!(txq.in_flight, 6);
    assert_eq!(txq.next_avail, 6);
    assert_eq!(txq.next_clean, 0);
    drop(txq);
    assert_eq!(h.regs.writes_to(regs::tdt(0)).len(), tail_writes);
    assert_eq!(h.nic.counters().tx_busy, 1);
}

#[test]
fn full_ring_holds_packets_in_the_backlog() {
    let h = harness(small_config(1));
    for _ in 0..8 {
        h.nic.enqueue(0, h.allocator.packet(&[0x11; 64])).unwrap();
    }
    assert_eq!(h.in_flight(0), 6);
    assert_eq!(h.nic.queues[0].tx.lock().backlog.len(), 2);
    assert_eq!(h.nic.counters().tx_backlogged, 2);

    // the interrupt's reclaim pass moves the backlog onto the freed descriptors
    h.device.complete_tx(0);
    h.nic.handle_queue_interrupt(0);
    assert_eq!(h.in_flight(0), 2);
    assert!(h.nic.queues[0].tx.lock().backlog.is_empty());
    assert_eq!(h.regs.last_write(regs::tdt(0)), Some(0));
    assert_eq!(h.allocator.outstanding(), POSTED + 2);
    h.check_conservation();
}

#[test]
fn deferred_task_drains_the_backlog() {
    let h = harness(small_config(1));
    for _ in 0..7 {
        h.nic.enqueue(0, h.allocator.packet(&[0x22; 64])).unwrap();
    }
    assert_eq!(h.nic.queues[0].tx.lock().backlog.len(), 1);

    h.device.complete_tx(0);
    assert!(h.nic.schedule(0));
    assert!(wait_for(|| h.nic.queues[0].tx.lock().backlog.is_empty()));
    assert_eq!(h.in_flight(0), 1);
    assert_eq!(h.nic.queue_state(0), Some(VectorState::Armed));
}

#[test]
fn full_backlog_rejects_and_shutdown_releases_it() {
    let h = harness(IxgbeConfig { tx_backlog_limit: 1, ..small_config(1) });
    for _ in 0..7 {
        h.nic.enqueue(0, h.allocator.packet(&[0x33; 64])).unwrap();
    }
    match h.nic.enqueue(0, h.allocator.packet(&[0x33; 80])) {
        Err(TxError::Busy(packet)) => {
            assert_eq!(packet.length(), 80);
            h.allocator.free(packet);
        }
        other => panic!("expected Busy, got {:?}", other),
    }
    assert_eq!(h.nic.counters().tx_backlogged, 1);

    h.nic.shutdown().unwrap();
    assert_eq!(h.allocator.outstanding(), 0);
    assert_eq!(h.allocator.double_frees(), 0);
    assert_eq!(h.dma.outstanding_maps(), 0);
}

#[test]
fn zero_backlog_limit_behaves_like_submit() {
    let h = harness(IxgbeConfig { tx_backlog_limit: 0, ..small_config(1) });
    for _ in 0..6 {
        h.nic.enqueue(0, h.allocator.packet(&[0x44; 64])).unwrap();
    }
    assert!(matches!(h.nic.enqueue(0, h.allocator.packet(&[0x44; 64])), Err(TxError::Busy(_))));
    assert_eq!(h.nic.counters().tx_backlogged, 0);
}

#[test]
fn multi_segment_packet_is_reclaimed_all_or_none() {
    let h = harness(small_config(1));
    h.dma.set_max_segment(100);
    h.send(0, 250).unwrap();
    assert_eq!(h.in_flight(0), 3);
    {
        let txq = h.nic.queues[0].tx.lock();
        assert!(!txq.tx_descs.read(0).end_of_packet());
        assert!(!txq.tx_descs.read(1).end_of_packet());
        assert!(txq.tx_descs.read(2).end_of_packet());
        assert_eq!(txq.tx_bufs[0].eop, Some(2));
    }

    // the device has fetched the first two descriptors, which never get a done bit
    h.device.complete_tx_descriptors(0, 2);
    assert_eq!(h.nic.reclaim(0), Ok(0));
    assert_eq!(h.in_flight(0), 3);
    assert_eq!(h.allocator.outstanding(), POSTED + 1);

    h.device.complete_tx(0);
    assert_eq!(h.nic.reclaim(0), Ok(1));
    assert_eq!(h.in_flight(0), 0);
    assert!(h.nic.queues[0].tx.lock().tx_bufs.iter().all(|s| s.is_empty()));
    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.dma.outstanding_maps(), POSTED);
}

#[test]
fn budgeted_receive() {
    let h = harness(IxgbeConfig { num_rx_descs: 16, ..small_config(1) });
    for i in 0..10u8 {
        assert!(h.device.receive_frame(0, &[i; 200], RxMeta::default()));
    }

    assert_eq!(h.nic.poll(0, 4), Ok((4, true)));
    assert_eq!(h.host.count(), 4);
    assert_eq!(h.nic.poll(0, 4), Ok((4, true)));
    assert_eq!(h.nic.poll(0, 4), Ok((2, false)));
    assert_eq!(h.nic.poll(0, 4), Ok((0, false)));

    let frames = h.host.take();
    assert_eq!(frames.len(), 10);
    for (i, (queue, frame)) in frames.iter().enumerate() {
        assert_eq!(*queue, 0);
        assert_eq!(frame.length, 200);
        assert!(frame.buffers[0].iter().all(|&b| b == i as u8));
    }
    // the ring was topped up again
    assert_eq!(h.device.rx_available(0), 15);
}

#[test]
fn interrupt_defers_to_task_until_drained() {
    let config = IxgbeConfig { num_rx_descs: 16, rx_process_limit: 4, ..small_config(1) };
    let h = harness(config);
    assert_eq!(h.nic.queue_state(0), Some(VectorState::Armed));
    for _ in 0..10 {
        assert!(h.device.receive_frame(0, &[0xEE; 300], RxMeta::default()));
    }
    h.regs.clear_log();

    h.nic.handle_queue_interrupt(0);
    // the vector was masked first
    assert_eq!(h.regs.writes_to(regs::eimc_ex(0)).first(), Some(&1));

    let task = &h.nic.deferred.get().unwrap()[0];
    assert!(wait_for(|| task.runs() >= 2 && h.nic.queue_state(0) == Some(VectorState::Armed)));
    assert_eq!(h.host.count(), 10);
    assert_eq!(h.regs.last_write(regs::eims_ex(0)), Some(1));
}

#[test]
fn interrupt_with_little_work_rearms_directly() {
    let h = harness(small_config(1));
    assert!(h.device.receive_frame(0, &[1; 300], RxMeta::default()));
    h.nic.handle_queue_interrupt(0);
    assert_eq!(h.host.count(), 1);
    assert_eq!(h.nic.queue_state(0), Some(VectorState::Armed));
    assert_eq!(h.nic.deferred.get().unwrap()[0].runs(), 0);
}

#[test]
fn moderation_interval_is_written_at_arm() {
    let h = harness(small_config(1));
    assert_eq!(h.regs.last_write(regs::eitr(0)), Some(regs::eitr_value(500)));

    // (1476 + 24) / 2
    for _ in 0..2 {
        assert!(h.device.receive_frame(0, &[0; 1476], RxMeta::default()));
    }
    h.nic.handle_queue_interrupt(0);
    assert_eq!(h.regs.last_write(regs::eitr(0)), Some(regs::eitr_value(750)));
    assert_eq!(h.nic.queues[0].irq.current_itr(), 750);

    // with moderation off the interval stays put
    h.nic.reconfigure_moderation(ModerationConfig { enabled: false, ..Default::default() }).unwrap();
    h.regs.clear_log();
    assert!(h.device.receive_frame(0, &[0; 200], RxMeta::default()));
    h.nic.handle_queue_interrupt(0);
    assert!(h.regs.writes_to(regs::eitr(0)).is_empty());

    let bad = ModerationConfig { min_interval: 0, ..Default::default() };
    assert!(h.nic.reconfigure_moderation(bad).is_err());
    assert!(!h.nic.moderation().enabled);
}

#[test]
fn hung_queue_is_deactivated_and_recovers_on_completion() {
    let h = harness(small_config(2));
    h.send(0, 64).unwrap();

    for tick in 1..=3u32 {
        assert_eq!(h.nic.reclaim(0), Ok(0));
        let outcome = h.nic.watchdog_tick();
        // the queue with work left gets its interrupt raised again
        assert_eq!(outcome, WatchdogOutcome::Rearmed(1));
        if tick < 3 {
            assert!(h.nic.is_queue_active(0), "queue went inactive after {} ticks", tick);
        }
    }
    assert!(!h.nic.is_queue_active(0));
    assert!(h.nic.is_queue_active(1));
    assert_eq!(h.nic.queues[0].tx.lock().busy, TX_QUEUE_HUNG);
    assert_eq!(h.nic.counters().hung_observations, 1);
    assert_eq!(h.regs.last_write(regs::eics_ex(0)), Some(1));

    // flow 0 now lands on the other queue
    assert_eq!(h.nic.select_queue(Some(0)), 1);

    // another tick does not count the same hang twice
    h.nic.reclaim(0).unwrap();
    h.nic.watchdog_tick();
    assert_eq!(h.nic.counters().hung_observations, 1);

    h.device.complete_tx(0);
    assert_eq!(h.nic.reclaim(0), Ok(1));
    assert!(h.nic.is_queue_active(0));
    assert_eq!(h.nic.queues[0].tx.lock().busy, 0);
    assert_eq!(h.nic.select_queue(Some(0)), 0);
    assert_eq!(h.nic.watchdog_tick(), WatchdogOutcome::Healthy);
}

#[test]
fn all_queues_hung_resets_the_device() {
    let h = harness(small_config(1));
    h.send(0, 64).unwrap();
    h.send(0, 128).unwrap();
    for _ in 0..3 {
        h.nic.reclaim(0).unwrap();
    }
    assert_eq!(h.nic.watchdog_tick(), WatchdogOutcome::Reset);
    assert_eq!(h.nic.counters().watchdog_resets, 1);

    assert_eq!(h.in_flight(0), 0);
    assert!(h.nic.is_queue_active(0));
    assert_eq!(h.nic.queues[0].tx.lock().busy, 0);
    // the tx buffers were released and the rx ring repopulated
    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.device.rx_available(0), POSTED);
    assert_eq!(h.regs.value(regs::tdt(0)), 0);
    assert_eq!(h.nic.queue_state(0), Some(VectorState::Armed));

    // the rings still work
    h.send(0, 64).unwrap();
    h.device.complete_tx(0);
    assert_eq!(h.nic.reclaim(0), Ok(1));
    h.check_conservation();
}

#[test]
fn link_down_holds_off_reset_until_link_returns() {
    let h = harness(small_config(1));
    h.nic.set_link_state(false);
    h.send(0, 64).unwrap();
    for _ in 0..5 {
        h.nic.reclaim(0).unwrap();
        assert_eq!(h.nic.watchdog_tick(), WatchdogOutcome::Rearmed(1));
    }
    assert!(!h.nic.is_queue_active(0));
    assert_eq!(h.nic.counters().watchdog_resets, 0);

    h.nic.set_link_state(true);
    assert!(h.nic.is_queue_active(0));
    assert_eq!(h.nic.queues[0].tx.lock().busy, 0);
    assert_eq!(h.in_flight(0), 1);
}

#[test]
fn repeated_link_up_report_does_not_hide_a_hang() {
    let h = harness(small_config(1));
    assert!(h.nic.link_up());
    h.send(0, 64).unwrap();
    for _ in 0..2 {
        h.nic.reclaim(0).unwrap();
    }
    h.nic.set_link_state(true);
    assert_eq!(h.nic.queues[0].tx.lock().busy, 2);

    h.nic.reclaim(0).unwrap();
    assert_eq!(h.nic.watchdog_tick(), WatchdogOutcome::Reset);
    assert_eq!(h.nic.counters().watchdog_resets, 1);
}

#[test]
fn random_traffic_conserves_descriptors_and_buffers() {
    let h = harness(small_config(1));
    h.dma.set_max_segment(512);
    let mut seed: u32 = 0x1234_5678;
    let mut next = move || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
        (seed >> 16) as usize
    };

    let mut accepted = 0;
    let mut completed = 0;
    for _ in 0..500 {
        match next() % 3 {
            0 | 1 => {
                let len = 60 + next() % 1400;
                match h.send(0, len) {
                    Ok(()) => accepted += 1,
                    Err(TxError::Busy(packet)) => h.allocator.free(packet),
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            }
            _ => {
                h.device.complete_tx_descriptors(0, next() % 5);
                completed += h.nic.reclaim(0).unwrap();
            }
        }
        h.check_conservation();
    }
    h.device.complete_tx(0);
    completed += h.nic.reclaim(0).unwrap();

    assert_eq!(accepted, completed);
    assert_eq!(h.in_flight(0), 0);
    assert_eq!(h.allocator.double_frees(), 0);
    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.dma.outstanding_maps(), POSTED);
}

#[test]
fn transmit_runs_alongside_interrupts_and_deferred_receive() {
    const PACKETS: usize = 200;
    let config = IxgbeConfig { num_rx_descs: 16, rx_process_limit: 2, ..small_config(1) };
    let h = harness(config);
    let sent_all = AtomicBool::new(false);
    let injected = AtomicUsize::new(0);

    thread::scope(|s| {
        s.spawn(|| {
            let mut sent = 0;
            while sent < PACKETS {
                match h.send(0, 60 + (sent * 7) % 1400) {
                    Ok(()) => sent += 1,
                    Err(TxError::Busy(packet)) => {
                        h.allocator.free(packet);
                        thread::yield_now();
                    }
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            }
            sent_all.store(true, Ordering::Release);
        });
        s.spawn(|| {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut round = 0usize;
            while !sent_all.load(Ordering::Acquire) {
                assert!(Instant::now() < deadline, "transmitter made no progress");
                h.device.complete_tx(0);
                if round % 4 == 0 {
                    for _ in 0..3 {
                        if h.device.receive_frame(0, &[0xA5; 300], RxMeta::default()) {
                            injected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                if h.nic.queue_state(0) == Some(VectorState::Armed) {
                    h.nic.handle_queue_interrupt(0);
                }
                round += 1;
                thread::yield_now();
            }
        });
    });

    let task = &h.nic.deferred.get().unwrap()[0];
    let injected = injected.load(Ordering::Relaxed);
    assert!(wait_for(|| {
        h.device.complete_tx(0);
        if h.nic.queue_state(0) == Some(VectorState::Armed) {
            h.nic.handle_queue_interrupt(0);
        }
        h.in_flight(0) == 0 && h.host.count() == injected && task.runs() > 0
    }));
    h.check_conservation();

    h.host.release_all(&*h.allocator);
    assert_eq!(h.allocator.outstanding(), 15);
    assert_eq!(h.device.rx_available(0), 15);
    assert_eq!(h.allocator.double_frees(), 0);
    assert_eq!(h.dma.outstanding_maps(), 15);
}

#[test]
fn pooled_buffers_all_return_to_the_pool() {
    const BUFFERS: usize = 32;
    let pool = Arc::new(BufferPool::new(BUFFERS, 2048).unwrap());
    let drain = |pool: &BufferPool| -> BTreeSet<usize> {
        let buffers: Vec<_> = (0..BUFFERS).map(|_| pool.alloc(2048).unwrap()).collect();
        let addresses = buffers.iter().map(|b| b.start_address()).collect();
        for b in buffers {
            pool.free(b);
        }
        addresses
    };
    let before = drain(&pool);
    assert_eq!(before.len(), BUFFERS);

    let regs = Arc::new(RecordingRegisters::new());
    let host = Arc::new(CollectingHost::default());
    let nic = crate::IxgbeNic::new(
        small_config(1),
        regs.clone(),
        Arc::new(IdentityDma::new(4096)),
        pool.clone(),
        host.clone(),
        None,
    ).unwrap();
    let device = SimDevice::new(regs);

    for _ in 0..3 {
        assert!(device.receive_frame(0, &[0x5C; 300], RxMeta::default()));
    }
    // copied into a pool buffer of its own
    assert!(device.receive_frame(0, &[0x5D; 64], RxMeta::default()));
    assert_eq!(nic.poll(0, 16), Ok((4, false)));
    nic.submit(0, pool.alloc(64).unwrap()).unwrap();
    device.complete_tx(0);
    assert_eq!(nic.reclaim(0), Ok(1));

    host.release_all(&*pool);
    nic.shutdown().unwrap();
    assert_eq!(drain(&pool), before);
}

#[test]
fn tso_packet_uses_context_descriptor() {
    let h = harness(small_config(1));
    let mut packet = h.allocator.packet(&tcp4_frame(3000, false));
    packet.offload = TxOffload { flags: TxOffloadFlags::TSO | TxOffloadFlags::TCP_CSUM, mss: 1448, vlan_tag: None };
    h.nic.submit(0, packet).unwrap();

    assert_eq!(h.in_flight(0), 2);
    let txq = h.nic.queues[0].tx.lock();
    let context = txq.tx_descs.read(0);
    let data = txq.tx_descs.read(1);
    assert!(context.is_context());
    assert_eq!(context.mss_l4len_idx() >> ADVTXD_MSS_SHIFT, 1448);
    assert!(data.cmd_type_len() & ADVTXD_DCMD_TSE != 0);
    assert_eq!(data.olinfo_status() >> ADVTXD_PAYLEN_SHIFT, 3000);
    assert_eq!(txq.tx_bufs[0].eop, Some(1));
    drop(txq);
    assert_eq!(h.nic.counters().tso_packets, 1);

    h.device.complete_tx(0);
    assert_eq!(h.nic.reclaim(0), Ok(1));
    h.check_conservation();
}

#[test]
fn dma_failure_drops_packet() {
    let h = harness(small_config(1));
    h.dma.fail_next_maps(1);
    assert!(matches!(h.send(0, 64), Err(TxError::DmaSetupFailed)));
    assert_eq!(h.nic.counters().tx_dma_setup_failed, 1);
    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.in_flight(0), 0);
}

#[test]
fn errored_frames_are_dropped_and_buffers_reused() {
    let h = harness(small_config(1));
    let errored = RxMeta { status: RXDADV_ERR_CE, ..Default::default() };
    assert!(h.device.receive_frame(0, &[0; 300], errored));
    // a multi-descriptor frame whose last descriptor carries the error
    assert!(h.device.receive_chain(0, &[&[1; 300], &[2; 300], &[3; 100]], errored));
    assert!(h.device.receive_frame(0, &[4; 300], RxMeta::default()));

    assert_eq!(h.nic.poll(0, 16), Ok((1, false)));
    assert_eq!(h.nic.counters().rx_drops, 2);
    let frames = h.host.take();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].1.buffers[0].iter().all(|&b| b == 4));
    h.allocator.free(frames.into_iter().next().unwrap().1.buffers.into_iter().next().unwrap());

    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.allocator.double_frees(), 0);
    assert_eq!(h.device.rx_available(0), POSTED);
}

#[test]
fn completion_longer_than_its_buffer_is_discarded() {
    let h = harness(small_config(1));
    // slot 0 ends up holding a buffer shorter than what the device writes into it
    let posted = {
        let mut rxq = h.nic.queues[0].rx.lock();
        let short = h.allocator.packet(&[0; 100]);
        rxq.rx_bufs[0].buffer.replace(short).unwrap()
    };
    assert!(h.device.receive_frame(0, &[5; 300], RxMeta::default()));
    assert!(h.device.receive_frame(0, &[6; 300], RxMeta::default()));

    assert_eq!(h.nic.poll(0, 16), Ok((1, false)));
    assert_eq!(h.nic.counters().rx_drops, 1);
    let frames = h.host.take();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].1.buffers[0].iter().all(|&b| b == 6));

    h.allocator.free(posted);
    for (_, frame) in frames {
        for buffer in frame.buffers {
            h.allocator.free(buffer);
        }
    }
    assert_eq!(h.allocator.outstanding(), POSTED);
    assert_eq!(h.allocator.double_frees(), 0);
    assert_eq!(h.device.rx_available(0), POSTED);
}

#[test]
fn frame_spanning_descriptors_is_delivered_whole() {
    let h = harness(small_config(1));
    let meta = RxMeta { status: RXD_STAT_VP, vlan_tag: 42, rss_hash: 0xFEED, packet_info: 0x1 };
    assert!(h.device.receive_chain(0, &[&[1; 2048], &[2; 2048], &[3; 500]], meta));
    assert_eq!(h.nic.poll(0, 16), Ok((1, false)));

    let (_, frame) = h.host.take().pop().unwrap();
    assert_eq!(frame.descriptor_count(), 3);
    assert_eq!(frame.length, 2048 * 2 + 500);
    assert_eq!(frame.vlan_tag, Some(42));
    assert_eq!(frame.rss_hash, Some(0xFEED));
    assert!(frame.buffers[2].iter().all(|&b| b == 3));
    for buffer in frame.buffers {
        h.allocator.free(buffer);
    }
    assert_eq!(h.allocator.outstanding(), POSTED);
}

#[test]
fn small_frames_are_copied_and_receive_buffers_stay_posted() {
    let h = harness(small_config(1));
    let maps_before = h.dma.outstanding_maps();
    assert!(h.device.receive_frame(0, &[9; 64], RxMeta::default()));
    assert_eq!(h.nic.poll(0, 16), Ok((1, false)));

    let (_, frame) = h.host.take().pop().unwrap();
    assert_eq!(frame.length, 64);
    assert_eq!(frame.buffers[0].capacity(), 64);
    // the large buffer was never unmapped
    assert_eq!(h.dma.outstanding_maps(), maps_before);
    assert_eq!(h.allocator.outstanding(), POSTED + 1);
}

#[test]
fn refill_survives_allocation_failure() {
    let h = harness(small_config(1));
    h.allocator.set_fail(true);
    for _ in 0..3 {
        assert!(h.device.receive_frame(0, &[7; 300], RxMeta::default()));
    }
    assert_eq!(h.nic.poll(0, 16), Ok((3, false)));
    assert_eq!(h.device.rx_available(0), POSTED - 3);
    assert!(h.nic.counters().rx_alloc_failed > 0);

    h.allocator.set_fail(false);
    assert_eq!(h.nic.refill(0, 16), Ok(3));
    assert_eq!(h.device.rx_available(0), POSTED);
}

#[test]
fn tcp_frames_go_through_lro() {
    let h = harness(IxgbeConfig { lro_enabled: true, ..small_config(1) });
    let tcp = RxMeta {
        status: RXD_STAT_IPCS | RXD_STAT_L4CS,
        packet_info: RXDADV_PKTTYPE_IPV4 | RXDADV_PKTTYPE_TCP,
        ..Default::default()
    };
    assert!(h.device.receive_frame(0, &[0; 400], tcp));
    assert!(h.device.receive_frame(0, &[0; 400], RxMeta { status: RXD_STAT_IPCS | RXD_STAT_L4CS | RXDADV_ERR_TCPE, ..tcp }));
    assert_eq!(h.nic.poll(0, 16), Ok((2, false)));
    assert_eq!(h.lro.merged(), 1);
    assert_eq!(h.lro.flushes(), 1);
    // both reach the host: one directly, one when LRO was flushed
    assert_eq!(h.host.count(), 2);

    h.lro.set_refuse(true);
    assert!(h.device.receive_frame(0, &[0; 400], tcp));
    assert_eq!(h.nic.poll(0, 16), Ok((1, false)));
    assert_eq!(h.lro.merged(), 1);
    assert_eq!(h.host.count(), 3);
}

#[test]
fn legacy_interrupt_services_signalled_queues() {
    let h = harness(IxgbeConfig { msix_vectors: 1, ..small_config(2) });
    assert_eq!(h.regs.value(regs::GPIE), 0);
    assert_eq!(h.nic.deferred.get().unwrap().len(), 1);
    assert_eq!(h.nic.queues[1].irq.itr_index(), 0);

    assert!(h.device.receive_frame(1, &[3; 300], RxMeta::default()));
    h.regs.raise_eicr(1 << 1);
    assert!(h.nic.handle_legacy_interrupt());
    let frames = h.host.take();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 1);
    assert_eq!(h.nic.queue_state(0), Some(VectorState::Armed));
    assert_eq!(h.nic.queue_state(1), Some(VectorState::Armed));

    // EICR was cleared by the read
    assert!(!h.nic.handle_legacy_interrupt());
    assert_eq!(h.nic.counters().spurious_interrupts, 1);
}

#[test]
fn msix_setup_routes_every_queue() {
    let h = harness(small_config(2));
    assert_eq!(h.regs.value(regs::GPIE), regs::GPIE_MSIX_MODE | regs::GPIE_OCD | regs::GPIE_PBA_SUPPORT);
    // queue 0 rx/tx in bytes 0 and 1, queue 1 rx/tx in bytes 2 and 3, all to their own vector
    assert_eq!(h.regs.value(regs::ivar(0)), 0x8181_8080);
    assert_eq!(h.regs.value(regs::EIAC), 0b11);
    assert_eq!(h.nic.deferred.get().unwrap().len(), 2);
    assert_eq!(h.nic.mac_address(), SIM_MAC);
    assert!(h.regs.value(regs::rxdctl(0)) & regs::RXDCTL_ENABLE != 0);
    assert!(h.regs.value(regs::txdctl(1)) & regs::TXDCTL_ENABLE != 0);
}

#[test]
fn send_packet_follows_the_flow_hash() {
    let h = harness(small_config(2));
    let mut packet = h.allocator.packet(&[0; 64]);
    packet.flow_hash = Some(3);
    h.nic.send_packet(packet).unwrap();
    assert_eq!(h.in_flight(0), 0);
    assert_eq!(h.in_flight(1), 1);

    h.device.complete_tx(1);
    h.nic.poll_receive().unwrap();
    assert_eq!(h.in_flight(1), 0);
}

#[test]
fn failed_device_stops_all_processing() {
    let h = harness(small_config(1));
    h.send(0, 64).unwrap();
    h.regs.fail();
    assert_eq!(h.nic.watchdog_tick(), WatchdogOutcome::DeviceFailed);
    assert!(h.nic.device_failed());
    assert!(h.regs.writes_to(regs::EIMC).len() >= 2);

    assert!(matches!(h.send(0, 64), Err(TxError::Offline(_))));
    assert!(h.nic.poll_receive().is_err());
    assert!(h.nic.reinit().is_err());
    assert!(!h.nic.handle_legacy_interrupt());
}

#[test]
fn fatal_eicr_read_is_detected_by_the_legacy_handler() {
    let h = harness(IxgbeConfig { msix_vectors: 1, ..small_config(2) });
    h.regs.fail();
    assert!(!h.nic.handle_legacy_interrupt());
    assert!(h.nic.device_failed());
}

#[test]
fn shutdown_releases_everything_once() {
    let config = IxgbeConfig { watchdog_period: Some(Duration::from_millis(5)), ..small_config(2) };
    let h = harness(config);
    h.send(0, 64).unwrap();
    h.send(1, 100).unwrap();
    assert!(h.device.receive_frame(1, &[0; 300], RxMeta::default()));
    // let the watchdog run at least once
    assert!(wait_for(|| h.nic.watchdog.get().unwrap().runs() > 0));

    h.nic.shutdown().unwrap();
    assert!(!h.nic.is_online());
    assert_eq!(h.allocator.outstanding(), 0);
    assert_eq!(h.allocator.double_frees(), 0);
    assert_eq!(h.dma.outstanding_maps(), 0);
    assert_eq!(h.dma.mapped_rings(), 0);
    assert_eq!(h.regs.value(regs::txdctl(0)) & regs::TXDCTL_ENABLE, 0);

    assert!(h.nic.shutdown().is_ok());
    assert_eq!(h.nic.watchdog_tick(), WatchdogOutcome::Offline);
    // the released rings are never repopulated
    assert!(h.nic.poll(1, 16).is_err());
    assert!(h.nic.refill(1, 16).is_err());
    assert!(h.nic.poll_receive().is_err());
    assert_eq!(h.allocator.outstanding(), 0);
    assert!(matches!(h.send(0, 64), Err(TxError::Offline(_))));
    assert!(h.nic.reinit().is_err());
}

#[test]
fn invalid_configuration_is_rejected() {
    let regs = alloc::sync::Arc::new(RecordingRegisters::new());
    let result = crate::IxgbeNic::new(
        IxgbeConfig { num_tx_descs: 12, ..small_config(1) },
        regs.clone(),
        alloc::sync::Arc::new(IdentityDma::new(4096)),
        alloc::sync::Arc::new(CountingAllocator::new()),
        alloc::sync::Arc::new(CollectingHost::default()),
        None,
    );
    assert!(result.is_err());

    regs.fail();
    let result = crate::IxgbeNic::new(
        small_config(1),
        regs,
        alloc::sync::Arc::new(IdentityDma::new(4096)),
        alloc::sync::Arc::new(CountingAllocator::new()),
        alloc::sync::Arc::new(CollectingHost::default()),
        None,
    );
    assert!(result.is_err());
}

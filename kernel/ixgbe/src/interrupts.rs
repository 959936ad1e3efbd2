//! Per-queue interrupt state, adaptive interrupt moderation, and the handlers that
//! the platform's interrupt entry points and the deferred workers call into.
//!
//! Every queue moves between three states:
//! * `Armed`: its cause is unmasked and the next interrupt will be delivered,
//! * `DisabledProcessing`: an interrupt fired, the cause is masked and the rings are being serviced,
//! * `DisabledIdle`: servicing ran out of budget, the cause stays masked and a deferred task
//!   will continue draining the rings.
//!
//! The interrupt handler ends its pass through [`QueueInterrupt::finish()`]. The deferred task
//! only ever re-arms a queue that was handed to it in `DisabledIdle`, so it never re-opens
//! a queue an interrupt handler is still servicing.
//! A state change and the mask write that goes with it happen under the queue's transition lock,
//! so the recorded state always matches the device's mask once the lock is released.

use core::cmp::min;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use alloc::sync::Weak;
use spin::Mutex;
use deferred_interrupt_tasks::DeferredTask;
use crate::config::ModerationConfig;
use crate::regs::{self, RegisterIo, REG_READ_FAILED};
use crate::{IxgbeNic, IxgbeQueue};


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VectorState {
    Armed = 0,
    DisabledProcessing = 1,
    DisabledIdle = 2,
}

impl VectorState {
    fn from_u8(value: u8) -> VectorState {
        match value {
            0 => VectorState::Armed,
            1 => VectorState::DisabledProcessing,
            _ => VectorState::DisabledIdle,
        }
    }
}


/// The interrupt side of one queue pair.
pub struct QueueInterrupt {
    queue: u8,
    /// This queue's bit in the EIMS/EIMC/EICS registers.
    mask_bit: u64,
    /// Which EITR register throttles this queue.
    itr_index: usize,
    state: AtomicU8,
    /// Held across every state change together with its mask register write.
    transition: Mutex<()>,
    /// Interval to program at the next arm, zero if unchanged.
    pending_itr: AtomicU32,
    current_itr: AtomicU32,
}

impl QueueInterrupt {
    /// # Arguments
    /// * `queue`: the queue number, which is also the queue's interrupt cause bit.
    /// * `msix`: whether the queue has its own vector (and thus its own throttle register).
    /// * `initial_itr`: the interval programmed before any traffic has been seen.
    pub fn new(queue: u8, msix: bool, initial_itr: u32) -> QueueInterrupt {
        QueueInterrupt {
            queue,
            mask_bit: 1u64 << queue,
            itr_index: if msix { queue as usize } else { 0 },
            state: AtomicU8::new(VectorState::DisabledIdle as u8),
            transition: Mutex::new(()),
            pending_itr: AtomicU32::new(0),
            current_itr: AtomicU32::new(initial_itr),
        }
    }

    pub fn state(&self) -> VectorState {
        VectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: VectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn mask_bit(&self) -> u64 {
        self.mask_bit
    }

    pub fn itr_index(&self) -> usize {
        self.itr_index
    }

    /// The interval most recently written to the throttle register.
    pub fn current_itr(&self) -> u32 {
        self.current_itr.load(Ordering::Acquire)
    }

    /// The interval that will be written at the next arm, if it changed.
    pub fn pending_itr(&self) -> Option<u32> {
        match self.pending_itr.load(Ordering::Acquire) {
            0 => None,
            itr => Some(itr),
        }
    }

    pub fn clear_pending_itr(&self) {
        self.pending_itr.store(0, Ordering::Release);
    }

    /// Programs `interval` immediately. Only used while the queue is masked during setup.
    pub fn program_itr(&self, regs: &dyn RegisterIo, interval: u32) {
        self.pending_itr.store(0, Ordering::Release);
        self.current_itr.store(interval, Ordering::Release);
        regs.write32(regs::eitr(self.itr_index), regs::eitr_value(interval));
    }

    /// Masks this queue's interrupt cause.
    pub fn disarm(&self, regs: &dyn RegisterIo) {
        let _transition = self.transition.lock();
        self.disarm_locked(regs);
    }

    /// Masks this queue's interrupt cause if it is `Armed`, claiming the queue for the caller.
    /// Returns false, without touching the mask, if another context owns the queue.
    pub fn try_disarm(&self, regs: &dyn RegisterIo) -> bool {
        let _transition = self.transition.lock();
        if self.state() != VectorState::Armed {
            return false;
        }
        self.disarm_locked(regs);
        true
    }

    fn disarm_locked(&self, regs: &dyn RegisterIo) {
        regs::write_vector_mask(regs, regs::eimc_ex, self.mask_bit);
        self.set_state(VectorState::DisabledProcessing);
    }

    /// Unmasks this queue's interrupt cause, first writing a newly computed throttle interval.
    pub fn arm(&self, regs: &dyn RegisterIo) {
        let _transition = self.transition.lock();
        self.arm_locked(regs);
    }

    /// Arms the queue only if it is in state `from`. Returns true if it was armed.
    pub fn arm_if(&self, regs: &dyn RegisterIo, from: VectorState) -> bool {
        let _transition = self.transition.lock();
        if self.state() != from {
            return false;
        }
        self.arm_locked(regs);
        true
    }

    fn arm_locked(&self, regs: &dyn RegisterIo) {
        let itr = self.pending_itr.swap(0, Ordering::AcqRel);
        if itr != 0 {
            self.current_itr.store(itr, Ordering::Release);
            regs.write32(regs::eitr(self.itr_index), regs::eitr_value(itr));
        }
        self.set_state(VectorState::Armed);
        regs::write_vector_mask(regs, regs::eims_ex, self.mask_bit);
    }

    /// Leaves the cause masked and hands the queue to its deferred task.
    pub fn defer(&self, task: &DeferredTask) {
        {
            let _transition = self.transition.lock();
            self.set_state(VectorState::DisabledIdle);
        }
        if !task.schedule() {
            trace!("ixgbe: queue {} was already scheduled", self.queue);
        }
    }

    /// Ends an interrupt servicing pass: re-arms if the rings are drained,
    /// otherwise keeps the cause masked and schedules `task`.
    /// Without a task the queue is re-armed, so the next interrupt picks up the remaining work.
    pub fn finish(&self, regs: &dyn RegisterIo, more_work: bool, task: Option<&DeferredTask>) {
        match task {
            Some(task) if more_work => self.defer(task),
            _ => self.arm(regs),
        }
    }

    /// Computes a new throttle interval from the traffic since the last pass
    /// and stores it for the next arm.
    ///
    /// # Arguments
    /// * `tx`: `(bytes, packets)` sent since the last pass.
    /// * `rx`: `(bytes, packets)` received since the last pass.
    pub fn update_moderation(&self, config: &ModerationConfig, tx: (u64, u64), rx: (u64, u64)) {
        if !config.enabled {
            return;
        }
        if let Some(itr) = compute_itr(config, tx, rx) {
            if itr != self.current_itr() {
                self.pending_itr.store(itr, Ordering::Release);
            }
        }
    }
}


/// The adaptive moderation function: maps the average frame size seen since the last pass
/// to a throttle interval within `[min_interval, max_interval]`.
///
/// Returns `None` if no traffic was seen, in which case the interval is left as is.
pub fn compute_itr(config: &ModerationConfig, tx: (u64, u64), rx: (u64, u64)) -> Option<u32> {
    let bytes = tx.0.saturating_add(rx.0);
    let packets = tx.1.saturating_add(rx.1);
    if packets == 0 {
        return None;
    }
    let average = (bytes / packets).saturating_add(config.frame_overhead as u64);
    let average = min(average, config.size_cap as u64) as u32;

    let in_mid_band = average > config.mid_band.start && average < config.mid_band.end;
    let interval = if in_mid_band {
        average / config.mid_divisor
    } else {
        average / config.edge_divisor
    };
    Some(interval.clamp(config.min_interval, config.max_interval))
}


/// What a deferred task services: one queue, or every queue of a device in legacy mode.
pub(crate) struct DeferredWork {
    pub(crate) nic: Weak<IxgbeNic>,
    pub(crate) queue: Option<u8>,
}

/// The action of every deferred queue task.
pub(crate) fn deferred_queue_work(work: &DeferredWork) -> Result<(), &'static str> {
    let nic = work.nic.upgrade().ok_or("ixgbe device was dropped")?;
    match work.queue {
        Some(queue) => nic.service_deferred(queue),
        None => nic.service_deferred_shared(),
    }
    Ok(())
}


impl IxgbeNic {
    /// Returns true if interrupt and deferred processing should do anything at all.
    fn processing_allowed(&self) -> bool {
        self.is_online() && !self.device_failed()
    }

    /// The deferred task that continues draining `queue`.
    fn deferred_task(&self, queue: u8) -> Option<&DeferredTask> {
        let tasks = self.deferred.get()?;
        if self.config.msix_mode() {
            tasks.get(queue as usize)
        } else {
            tasks.first()
        }
    }

    /// Reclaims finished transmissions (refilling the ring from the backlog) and receives
    /// up to one budget of frames on `queue`, then feeds the traffic seen into moderation.
    ///
    /// Returns true if received frames were left behind.
    pub(crate) fn service_queue(&self, queue: &IxgbeQueue) -> bool {
        self.reclaim_queue(queue);
        let tx_traffic = queue.tx.lock().take_traffic();

        let (more_work, rx_traffic) = {
            let mut rxq = queue.rx.lock();
            let (_delivered, more_work) = crate::receive::poll(&mut rxq, self.config.rx_process_limit, &self.rx_env());
            (more_work, rxq.take_traffic())
        };

        let moderation = self.moderation.read();
        queue.irq.update_moderation(&moderation, tx_traffic, rx_traffic);
        more_work
    }

    /// Entry point for the MSI-X vector of `queue`.
    pub fn handle_queue_interrupt(&self, queue: u8) {
        let q = match self.queues.get(queue as usize) {
            Some(q) => q,
            None => {
                warn!("ixgbe: interrupt for nonexistent queue {}", queue);
                return;
            }
        };
        if !self.processing_allowed() {
            return;
        }
        q.irq.disarm(&*self.regs);
        let more_work = self.service_queue(q);
        q.irq.finish(&*self.regs, more_work, self.deferred_task(queue));
    }

    /// Entry point for the single shared interrupt used when there are not enough MSI-X vectors.
    ///
    /// Returns true if the interrupt was caused by this device.
    pub fn handle_legacy_interrupt(&self) -> bool {
        if !self.processing_allowed() {
            return false;
        }
        // reading clears the causes
        let cause = self.regs.read32(regs::EICR);
        if cause == REG_READ_FAILED {
            self.mark_fatal("EICR read returned all ones");
            return false;
        }
        if cause & regs::EICR_RTX_QUEUE == 0 {
            self.counters.spurious_interrupts.fetch_add(1, Ordering::Relaxed);
            for q in &self.queues {
                q.irq.arm_if(&*self.regs, VectorState::Armed);
            }
            return false;
        }

        // queues the shared deferred task is draining stay with it
        let mut claimed: u64 = 0;
        for q in &self.queues {
            if q.irq.try_disarm(&*self.regs) {
                claimed |= q.irq.mask_bit();
            }
        }
        let mut more_work = false;
        let mut unclaimed_work = false;
        for q in self.queues.iter().filter(|q| cause & (1 << q.id) != 0) {
            if claimed & q.irq.mask_bit() != 0 {
                more_work |= self.service_queue(q);
            } else {
                unclaimed_work = true;
            }
        }
        self.finish_claimed(claimed, more_work);
        if unclaimed_work {
            self.schedule(0);
        }
        true
    }

    /// Ends a legacy-mode interrupt pass over the queues in `claimed`.
    fn finish_claimed(&self, claimed: u64, more_work: bool) {
        let task = self.deferred_task(0);
        for q in self.queues.iter().filter(|q| claimed & q.irq.mask_bit() != 0) {
            q.irq.finish(&*self.regs, more_work, task);
        }
    }

    /// Deferred continuation for one queue in MSI-X mode.
    pub(crate) fn service_deferred(&self, queue: u8) {
        let q = match self.queues.get(queue as usize) {
            Some(q) => q,
            None => return,
        };
        if !self.processing_allowed() {
            return;
        }
        let more_work = self.service_queue(q);
        if more_work {
            // a pending run is enough, another schedule would be a no-op
            if q.irq.state() == VectorState::DisabledIdle {
                self.schedule(queue);
            }
        } else {
            q.irq.arm_if(&*self.regs, VectorState::DisabledIdle);
        }
    }

    /// Deferred continuation for all queues in legacy mode.
    pub(crate) fn service_deferred_shared(&self) {
        if !self.processing_allowed() {
            return;
        }
        let mut more_work = false;
        for q in &self.queues {
            more_work |= self.service_queue(q);
        }
        if more_work {
            self.schedule(0);
            return;
        }
        // only queues handed over by the interrupt handler are re-armed here
        for q in &self.queues {
            q.irq.arm_if(&*self.regs, VectorState::DisabledIdle);
        }
    }

    /// Re-arms every queue.
    pub(crate) fn arm_all(&self) {
        for q in &self.queues {
            q.irq.arm(&*self.regs);
        }
    }

    /// Masks every interrupt cause of the device.
    pub(crate) fn mask_all_interrupts(&self) {
        self.regs.write32(regs::EIMC, regs::DISABLE_INTERRUPTS);
        regs::write_vector_mask(&*self.regs, regs::eimc_ex, u64::MAX);
    }
}

//! A driver core for the Intel 82599 (ixgbe) 10 GbE NIC.
//!
//! The device is represented by an [`IxgbeNic`], which owns one transmit ring and one receive ring
//! per queue pair, the interrupt state of every queue, and the deferred tasks and watchdog timer
//! that keep the queues moving. Register accesses, DMA mappings, buffer allocation and the host
//! networking stack are collaborators handed in at construction.
//!
//! Each queue's transmit and receive rings sit behind their own lock.
//! A device-wide control lock serializes configuration transitions (reinit, shutdown, link changes)
//! and is always taken before any queue lock; a queue's tx lock is taken before its rx lock.
//! Packet processing never takes the control lock, it only reads atomics.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate spin;
extern crate bit_field;
extern crate volatile;
extern crate zerocopy;
extern crate intel_ethernet;
extern crate nic_buffers;
extern crate nic_queues;
extern crate nic_initialization;
extern crate network_interface_card;
extern crate deferred_interrupt_tasks;

pub mod regs;
pub mod queue_registers;
pub mod config;
pub mod offload;
pub mod transmit;
pub mod receive;
pub mod interrupts;
pub mod watchdog;
#[cfg(test)]
mod sim;
#[cfg(test)]
mod test;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use alloc::{
    format,
    sync::Arc,
    vec::Vec,
};
use spin::{Mutex, Once, RwLock};
use deferred_interrupt_tasks::{register_deferred_task, register_periodic_task, DeferredTask};
use nic_buffers::{BufferAllocator, DmaMapper, PacketBuffer};
use nic_initialization::{init_rx_queue, init_tx_queue, release_rx_queue, release_tx_queue, reset_rx_queue, reset_tx_queue};
use network_interface_card::{HostStack, LroHandler, NetworkInterfaceCard, TxError};
use config::{IxgbeConfig, ModerationConfig};
use interrupts::{deferred_queue_work, DeferredWork, QueueInterrupt};
use queue_registers::{IxgbeRxQueueRegisters, IxgbeTxQueueRegisters};
use receive::{IxgbeRxQueue, RxEnv};
use regs::{IvarCause, RegisterIo, REG_READ_FAILED};
use transmit::{IxgbeTxQueue, TxEnv};
use watchdog::watchdog_task;

pub use interrupts::VectorState;
pub use watchdog::WatchdogOutcome;

// one bit per queue in `active_queues` and in the extended interrupt mask registers
const_assert!(regs::IXGBE_MAX_MSIX_VECTORS <= u64::BITS as usize);


/// Driver-wide event counters, updated without locks from every context.
#[derive(Default)]
pub struct DriverCounters {
    /// Received frames discarded because of errors or a failed small-frame copy.
    pub rx_drops: AtomicU64,
    pub rx_alloc_failed: AtomicU64,
    pub rx_dma_map_failed: AtomicU64,
    pub tx_dma_setup_failed: AtomicU64,
    /// Submissions rejected for lack of free descriptors.
    pub tx_busy: AtomicU64,
    /// Packets held in a queue's backlog because its ring was full.
    pub tx_backlogged: AtomicU64,
    pub tso_packets: AtomicU64,
    /// Times the watchdog found a queue hung.
    pub hung_observations: AtomicU64,
    /// Device reinitializations triggered by the watchdog.
    pub watchdog_resets: AtomicU64,
    pub spurious_interrupts: AtomicU64,
}

/// A point-in-time copy of [`DriverCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_drops: u64,
    pub rx_alloc_failed: u64,
    pub rx_dma_map_failed: u64,
    pub tx_dma_setup_failed: u64,
    pub tx_busy: u64,
    pub tx_backlogged: u64,
    pub tso_packets: u64,
    pub hung_observations: u64,
    pub watchdog_resets: u64,
    pub spurious_interrupts: u64,
}

impl DriverCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_drops: self.rx_drops.load(Ordering::Relaxed),
            rx_alloc_failed: self.rx_alloc_failed.load(Ordering::Relaxed),
            rx_dma_map_failed: self.rx_dma_map_failed.load(Ordering::Relaxed),
            tx_dma_setup_failed: self.tx_dma_setup_failed.load(Ordering::Relaxed),
            tx_busy: self.tx_busy.load(Ordering::Relaxed),
            tx_backlogged: self.tx_backlogged.load(Ordering::Relaxed),
            tso_packets: self.tso_packets.load(Ordering::Relaxed),
            hung_observations: self.hung_observations.load(Ordering::Relaxed),
            watchdog_resets: self.watchdog_resets.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
        }
    }
}


/// One queue pair and its interrupt state.
pub struct IxgbeQueue {
    pub id: u8,
    pub tx: Mutex<IxgbeTxQueue>,
    pub rx: Mutex<IxgbeRxQueue>,
    pub irq: QueueInterrupt,
}

/// Device-wide state guarded by the control lock.
struct ControlState {
    interrupts_enabled: bool,
    shut_down: bool,
}


/// A struct representing an ixgbe network interface card.
pub struct IxgbeNic {
    regs: Arc<dyn RegisterIo>,
    config: IxgbeConfig,
    queues: Vec<IxgbeQueue>,
    dma: Arc<dyn DmaMapper>,
    allocator: Arc<dyn BufferAllocator>,
    host: Arc<dyn HostStack>,
    lro: Option<Arc<dyn LroHandler>>,
    /// The only configuration that may change after creation.
    moderation: RwLock<ModerationConfig>,
    control: Mutex<ControlState>,
    /// Cleared at shutdown.
    online: AtomicBool,
    /// Latched once the device stops responding.
    fatal: AtomicBool,
    link_up: AtomicBool,
    /// Bit `n` is set if queue `n` may be picked for transmission.
    active_queues: AtomicU64,
    counters: DriverCounters,
    /// One task per queue in MSI-X mode, a single shared one otherwise.
    deferred: Once<Vec<DeferredTask>>,
    watchdog: Once<DeferredTask>,
    mac_addr: [u8; 6],
}

impl IxgbeNic {
    /// Brings up an ixgbe device: creates and programs every ring, posts receive buffers,
    /// routes queue interrupts, starts the deferred tasks and the watchdog, and enables interrupts.
    ///
    /// # Arguments
    /// * `config`: the device configuration, checked with [`IxgbeConfig::validate()`].
    /// * `regs`: the device's register space.
    /// * `dma`: maps rings and packet buffers for device access.
    /// * `allocator`: provides receive buffers and takes back every buffer the driver releases.
    /// * `host`: receives every frame.
    /// * `lro`: optional LRO engine, only used if `config.lro_enabled` is set.
    pub fn new(
        config: IxgbeConfig,
        regs: Arc<dyn RegisterIo>,
        dma: Arc<dyn DmaMapper>,
        allocator: Arc<dyn BufferAllocator>,
        host: Arc<dyn HostStack>,
        lro: Option<Arc<dyn LroHandler>>,
    ) -> Result<Arc<IxgbeNic>, &'static str> {
        config.validate()?;

        let status = regs.read32(regs::STATUS);
        if status == REG_READ_FAILED {
            error!("ixgbe: device is not responding, STATUS reads {:#X}", status);
            return Err("ixgbe: device is not responding");
        }

        // nothing may fire until the rings are set up
        regs.write32(regs::EIMC, regs::DISABLE_INTERRUPTS);
        regs::write_vector_mask(&*regs, regs::eimc_ex, u64::MAX);

        let queues = Self::create_queues(&config, &regs, &*dma, &*allocator)?;
        let mac_addr = Self::read_mac_address(&*regs);
        let num_queues = queues.len();

        let nic = Arc::new(IxgbeNic {
            moderation: RwLock::new(config.moderation.clone()),
            control: Mutex::new(ControlState { interrupts_enabled: false, shut_down: false }),
            online: AtomicBool::new(true),
            fatal: AtomicBool::new(false),
            link_up: AtomicBool::new(status & regs::STATUS_LINK_UP != 0),
            active_queues: AtomicU64::new(queue_mask(num_queues)),
            counters: DriverCounters::default(),
            deferred: Once::new(),
            watchdog: Once::new(),
            regs,
            config,
            queues,
            dma,
            allocator,
            host,
            lro,
            mac_addr,
        });

        if let Err(e) = nic.start() {
            let _ = nic.shutdown();
            return Err(e);
        }
        info!("ixgbe: device up with {} queues ({} mode), MAC {:02X?}",
            num_queues, if nic.config.msix_mode() { "MSI-X" } else { "legacy" }, nic.mac_addr);
        Ok(nic)
    }

    /// Creates every queue pair. On failure, the rings created so far are released.
    fn create_queues(
        config: &IxgbeConfig,
        regs: &Arc<dyn RegisterIo>,
        dma: &dyn DmaMapper,
        allocator: &dyn BufferAllocator,
    ) -> Result<Vec<IxgbeQueue>, &'static str> {
        let mut queues: Vec<IxgbeQueue> = Vec::with_capacity(config.num_queues as usize);
        for id in 0..config.num_queues {
            match Self::create_queue(id, config, regs, dma) {
                Ok(q) => queues.push(q),
                Err(e) => {
                    error!("ixgbe: couldn't create queue {}: {}", id, e);
                    for q in queues.iter() {
                        release_tx_queue(&mut q.tx.lock(), dma, allocator);
                        release_rx_queue(&mut q.rx.lock(), dma, allocator);
                    }
                    return Err(e);
                }
            }
        }
        Ok(queues)
    }

    fn create_queue(id: u8, config: &IxgbeConfig, regs: &Arc<dyn RegisterIo>, dma: &dyn DmaMapper) -> Result<IxgbeQueue, &'static str> {
        let mut rxq_regs = IxgbeRxQueueRegisters::new(id, Arc::clone(regs));
        rxq_regs.configure_buffers(config.rx_buffer_size);
        let mut rxq: IxgbeRxQueue = init_rx_queue(id, config.num_rx_descs, config.rx_buffer_size, dma, rxq_regs)?;

        let txq_regs = IxgbeTxQueueRegisters::new(id, Arc::clone(regs));
        let mut txq: IxgbeTxQueue = match init_tx_queue(id, config.num_tx_descs, dma, txq_regs) {
            Ok(txq) => txq,
            Err(e) => {
                rxq.rx_descs.unmap(dma);
                return Err(e);
            }
        };

        txq.regs.set_enabled(true);
        rxq.regs.set_enabled(true, config.hw_vlan_strip);

        Ok(IxgbeQueue {
            id,
            tx: Mutex::new(txq),
            rx: Mutex::new(rxq),
            irq: QueueInterrupt::new(id, config.msix_mode(), config.moderation.initial_interval),
        })
    }

    /// Reads the MAC address the device was configured with from the first receive address entry.
    fn read_mac_address(regs: &dyn RegisterIo) -> [u8; 6] {
        let low = regs.read32(regs::RAL0);
        let high = regs.read32(regs::RAH0);
        [
            low as u8,
            (low >> 8) as u8,
            (low >> 16) as u8,
            (low >> 24) as u8,
            high as u8,
            (high >> 8) as u8,
        ]
    }

    /// Everything after the rings exist: buffers, vectors, tasks, and finally interrupts.
    fn start(self: &Arc<Self>) -> Result<(), &'static str> {
        for q in &self.queues {
            let mut rxq = q.rx.lock();
            let capacity = rxq.capacity() as usize;
            let posted = receive::refill(&mut rxq, capacity, &self.rx_env());
            if posted == 0 {
                warn!("ixgbe: rx queue {} started without any receive buffers", q.id);
            }
        }

        self.configure_interrupts();
        self.spawn_tasks()?;

        let mut control = self.control.lock();
        control.interrupts_enabled = true;
        self.arm_all();
        Ok(())
    }

    /// Routes every queue's causes to its vector and programs the initial throttle interval.
    fn configure_interrupts(&self) {
        let msix = self.config.msix_mode();
        let initial_itr = self.moderation.read().initial_interval;
        for q in &self.queues {
            regs::set_ivar(&*self.regs, q.id, q.id, IvarCause::Rx);
            regs::set_ivar(&*self.regs, q.id, q.id, IvarCause::Tx);
            q.irq.program_itr(&*self.regs, initial_itr);
        }
        if msix {
            self.regs.write32(regs::GPIE, regs::GPIE_MSIX_MODE | regs::GPIE_OCD | regs::GPIE_PBA_SUPPORT);
            // queue causes clear themselves when their vector fires
            self.regs.write32(regs::EIAC, queue_mask(self.queues.len()) as u32 & regs::EICR_RTX_QUEUE);
        } else {
            self.regs.write32(regs::GPIE, 0);
        }
    }

    fn spawn_tasks(self: &Arc<Self>) -> Result<(), &'static str> {
        let msix = self.config.msix_mode();
        let count = if msix { self.queues.len() } else { 1 };
        let mut tasks = Vec::with_capacity(count);
        for i in 0..count {
            let work = DeferredWork {
                nic: Arc::downgrade(self),
                queue: if msix { Some(i as u8) } else { None },
            };
            let task = register_deferred_task(deferred_queue_work, work, Some(format!("ixgbe_queue_{}", i)))
                .map_err(|_e| {
                    error!("ixgbe: couldn't spawn deferred task for queue {}: {:?}", i, _e);
                    "ixgbe: couldn't spawn deferred queue task"
                })?;
            tasks.push(task);
        }
        self.deferred.call_once(|| tasks);

        if let Some(period) = self.config.watchdog_period {
            let task = register_periodic_task(period, watchdog_task, Arc::downgrade(self), Some("ixgbe_watchdog"))
                .map_err(|_e| {
                    error!("ixgbe: couldn't spawn watchdog: {:?}", _e);
                    "ixgbe: couldn't spawn watchdog task"
                })?;
            self.watchdog.call_once(|| task);
        }
        Ok(())
    }

    pub(crate) fn tx_env(&self) -> TxEnv<'_> {
        TxEnv {
            dma: &*self.dma,
            allocator: &*self.allocator,
            counters: &self.counters,
            tso_threshold: self.config.tso_threshold,
            max_segments: self.config.tx_max_segments,
        }
    }

    pub(crate) fn rx_env(&self) -> RxEnv<'_> {
        RxEnv {
            dma: &*self.dma,
            allocator: &*self.allocator,
            host: &*self.host,
            lro: if self.config.lro_enabled { self.lro.as_deref() } else { None },
            counters: &self.counters,
            config: &self.config,
        }
    }

    fn queue(&self, queue: u8) -> Result<&IxgbeQueue, &'static str> {
        self.queues.get(queue as usize).ok_or("ixgbe: queue index out of range")
    }

    /// Queues `packet` for transmission on `queue`.
    ///
    /// Never blocks on anything but the queue's tx lock. A `Busy` packet may be resubmitted
    /// once the queue's completions have been reclaimed.
    pub fn submit(&self, queue: u8, packet: PacketBuffer) -> Result<(), TxError> {
        let q = match self.queues.get(queue as usize) {
            Some(q) => q,
            None => return Err(TxError::Offline(packet)),
        };
        // checked under the queue lock, since shutdown releases the ring under it
        let mut txq = q.tx.lock();
        if !self.is_online() || self.device_failed() {
            return Err(TxError::Offline(packet));
        }
        transmit::submit(&mut txq, packet, &self.tx_env())
    }

    /// Queues `packet` for transmission on `queue`, holding it in the queue's backlog if the ring is full.
    ///
    /// Backlogged packets are placed on the ring by the next pass that reclaims completions.
    /// `Busy` is only returned once the backlog is full as well.
    pub fn enqueue(&self, queue: u8, packet: PacketBuffer) -> Result<(), TxError> {
        let q = match self.queues.get(queue as usize) {
            Some(q) => q,
            None => return Err(TxError::Offline(packet)),
        };
        let mut txq = q.tx.lock();
        if !self.is_online() || self.device_failed() {
            return Err(TxError::Offline(packet));
        }
        transmit::enqueue(&mut txq, packet, self.config.tx_backlog_limit, &self.tx_env())
    }

    /// Frees the buffers of every packet `queue` has finished sending and returns their number.
    /// The freed descriptors are then used for the queue's backlog.
    pub fn reclaim(&self, queue: u8) -> Result<usize, &'static str> {
        let q = self.queue(queue)?;
        let completed = self.reclaim_queue(q);
        Ok(completed)
    }

    /// Reclaims completions on `q` and moves its backlog onto the freed descriptors.
    pub(crate) fn reclaim_queue(&self, q: &IxgbeQueue) -> usize {
        let mut txq = q.tx.lock();
        let env = self.tx_env();
        let completed = transmit::reclaim(&mut txq, &env);
        if completed > 0 {
            self.activate_queue(q.id);
            if self.is_online() && !self.device_failed() {
                transmit::drain_backlog(&mut txq, &env);
            }
        }
        completed
    }

    /// Delivers up to `budget` received frames from `queue`.
    /// Returns the number delivered and whether more completed frames are waiting.
    pub fn poll(&self, queue: u8, budget: usize) -> Result<(usize, bool), &'static str> {
        let q = self.queue(queue)?;
        let mut rxq = q.rx.lock();
        if !self.is_online() || self.device_failed() {
            return Err("ixgbe: device is offline");
        }
        Ok(receive::poll(&mut rxq, budget, &self.rx_env()))
    }

    /// Posts up to `limit` receive buffers to `queue`.
    pub fn refill(&self, queue: u8, limit: usize) -> Result<usize, &'static str> {
        let q = self.queue(queue)?;
        let mut rxq = q.rx.lock();
        if !self.is_online() || self.device_failed() {
            return Err("ixgbe: device is offline");
        }
        Ok(receive::refill(&mut rxq, limit, &self.rx_env()))
    }

    /// Schedules the deferred task that drains `queue`.
    /// Returns false if a run was already pending or there is no task.
    pub fn schedule(&self, queue: u8) -> bool {
        let tasks = match self.deferred.get() {
            Some(tasks) => tasks,
            None => return false,
        };
        let task = if self.config.msix_mode() { tasks.get(queue as usize) } else { tasks.first() };
        task.map_or(false, |t| t.schedule())
    }

    /// Tears down and repopulates every ring without reallocating them, then re-enables all queues.
    pub fn reinit(&self) -> Result<(), &'static str> {
        let control = self.control.lock();
        if control.shut_down {
            return Err("ixgbe: device is shut down");
        }
        if self.device_failed() {
            return Err("ixgbe: device has failed");
        }
        self.reinit_locked(&control);
        Ok(())
    }

    /// The body of [`reinit()`](Self::reinit), for callers already holding the control lock.
    fn reinit_locked(&self, control: &ControlState) {
        self.mask_all_interrupts();
        let initial_itr = self.moderation.read().initial_interval;
        let (dma, allocator) = (&*self.dma, &*self.allocator);

        for q in &self.queues {
            {
                let mut txq = q.tx.lock();
                txq.regs.set_enabled(false);
                let _released = reset_tx_queue(&mut txq, dma, allocator);
                txq.regs.set_enabled(true);
                debug!("ixgbe: reinit released {} tx buffers on queue {}", _released, q.id);
            }
            {
                let mut rxq = q.rx.lock();
                rxq.regs.set_enabled(false, self.config.hw_vlan_strip);
                reset_rx_queue(&mut rxq, dma, allocator);
                rxq.regs.configure_buffers(self.config.rx_buffer_size);
                rxq.regs.set_enabled(true, self.config.hw_vlan_strip);
                let capacity = rxq.capacity() as usize;
                receive::refill(&mut rxq, capacity, &self.rx_env());
            }
            q.irq.program_itr(&*self.regs, initial_itr);
        }

        self.active_queues.store(queue_mask(self.queues.len()), Ordering::Release);
        if control.interrupts_enabled {
            self.arm_all();
        }
        info!("ixgbe: device reinitialized");
    }

    /// Stops the device: masks interrupts, waits for the deferred tasks and the watchdog to exit,
    /// then releases every buffer and unmaps every ring.
    ///
    /// Calling it again does nothing. It must not be called from the device's own deferred tasks
    /// or watchdog, since it waits for them.
    pub fn shutdown(&self) -> Result<(), &'static str> {
        {
            let mut control = self.control.lock();
            if control.shut_down {
                return Ok(());
            }
            control.shut_down = true;
            control.interrupts_enabled = false;
            self.online.store(false, Ordering::Release);
            self.mask_all_interrupts();
        }

        // the tasks may be waiting on the control lock, so join them only after releasing it
        let mut result = Ok(());
        if let Some(task) = self.watchdog.get() {
            if let Err(e) = task.shutdown() {
                result = Err(e);
            }
        }
        for task in self.deferred.get().into_iter().flatten() {
            if let Err(e) = task.shutdown() {
                result = Err(e);
            }
        }

        let (dma, allocator) = (&*self.dma, &*self.allocator);
        for q in &self.queues {
            let mut txq = q.tx.lock();
            txq.regs.set_enabled(false);
            release_tx_queue(&mut txq, dma, allocator);
            let mut rxq = q.rx.lock();
            rxq.regs.set_enabled(false, false);
            release_rx_queue(&mut rxq, dma, allocator);
        }
        self.active_queues.store(0, Ordering::Release);
        info!("ixgbe: device shut down");
        result
    }

    /// Called by the link management layer whenever the link goes up or down.
    ///
    /// A transition from down to up clears every queue's progress counter and re-activates all queues.
    /// Reporting the state the link is already in changes nothing.
    pub fn set_link_state(&self, up: bool) {
        let _control = self.control.lock();
        let was_up = self.link_up.swap(up, Ordering::AcqRel);
        if was_up == up {
            return;
        }
        if up {
            for q in &self.queues {
                q.tx.lock().busy = 0;
            }
            self.active_queues.store(queue_mask(self.queues.len()), Ordering::Release);
        }
        info!("ixgbe: link is {}", if up { "up" } else { "down" });
    }

    /// Replaces the interrupt moderation parameters.
    ///
    /// Disabling moderation leaves the currently programmed intervals in place.
    pub fn reconfigure_moderation(&self, moderation: ModerationConfig) -> Result<(), &'static str> {
        moderation.validate()?;
        let _control = self.control.lock();
        if !moderation.enabled {
            for q in &self.queues {
                q.irq.clear_pending_itr();
            }
        }
        *self.moderation.write() = moderation;
        Ok(())
    }

    /// Latches the device-fatal state: all processing stops and interrupts are masked.
    pub(crate) fn mark_fatal(&self, reason: &'static str) {
        if self.fatal.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("ixgbe: device failed ({}), stopping all queue processing", reason);
        self.mask_all_interrupts();
    }

    pub(crate) fn activate_queue(&self, queue: u8) {
        self.active_queues.fetch_or(1u64 << queue, Ordering::AcqRel);
    }

    /// Picks the transmit queue for a packet: the flow's queue if it is active,
    /// otherwise the lowest-numbered active queue, otherwise the flow's queue anyway.
    pub fn select_queue(&self, flow_hash: Option<u32>) -> u8 {
        let preferred = (flow_hash.unwrap_or(0) % self.queues.len() as u32) as u8;
        let active = self.active_queues.load(Ordering::Acquire);
        if active & (1u64 << preferred) != 0 {
            preferred
        } else if active != 0 {
            active.trailing_zeros() as u8
        } else {
            preferred
        }
    }

    /// Returns true if the device has stopped responding.
    pub fn device_failed(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Returns false once the device has been shut down.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_queue_active(&self, queue: u8) -> bool {
        (queue as usize) < self.queues.len() && self.active_queues.load(Ordering::Acquire) & (1u64 << queue) != 0
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn config(&self) -> &IxgbeConfig {
        &self.config
    }

    pub fn moderation(&self) -> ModerationConfig {
        self.moderation.read().clone()
    }

    pub fn queue_state(&self, queue: u8) -> Option<VectorState> {
        self.queues.get(queue as usize).map(|q| q.irq.state())
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

impl NetworkInterfaceCard for IxgbeNic {
    fn send_packet(&self, packet: PacketBuffer) -> Result<(), TxError> {
        let queue = self.select_queue(packet.flow_hash);
        self.enqueue(queue, packet)
    }

    /// Services every queue once without touching interrupt state.
    fn poll_receive(&self) -> Result<(), &'static str> {
        if !self.is_online() || self.device_failed() {
            return Err("ixgbe: device is offline");
        }
        for q in &self.queues {
            self.reclaim_queue(q);
            let mut rxq = q.rx.lock();
            if !self.is_online() {
                return Err("ixgbe: device is offline");
            }
            receive::poll(&mut rxq, self.config.rx_process_limit, &self.rx_env());
        }
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac_addr
    }
}

/// The bitmask with one bit set for each of `num_queues` queues.
fn queue_mask(num_queues: usize) -> u64 {
    if num_queues >= 64 { u64::MAX } else { (1u64 << num_queues) - 1 }
}

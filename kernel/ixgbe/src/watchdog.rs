//! The liveness monitor: a periodic audit of transmit progress on every queue.

use core::sync::atomic::Ordering;
use alloc::sync::Weak;
use nic_queues::TX_QUEUE_HUNG;
use crate::regs::{self, REG_READ_FAILED};
use crate::IxgbeNic;


/// The result of one watchdog pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// No queue has outstanding work.
    Healthy,
    /// The queues in the mask had outstanding work and their interrupts were re-raised.
    Rearmed(u64),
    /// Every queue was hung and the device was reinitialized.
    Reset,
    /// The device stopped responding; nothing was done.
    DeviceFailed,
    /// The device is shut down.
    Offline,
}


impl IxgbeNic {
    /// Runs one pass of the watchdog.
    ///
    /// A queue whose cleanup has made no progress for `hang_threshold` passes is marked hung and
    /// taken out of queue selection. If every queue is hung (and the link is up) the device is
    /// reinitialized. Otherwise every queue with outstanding work gets its interrupt re-raised,
    /// so that a lost interrupt cannot stall it.
    pub fn watchdog_tick(&self) -> WatchdogOutcome {
        if self.device_failed() {
            return WatchdogOutcome::DeviceFailed;
        }
        let control = self.control.lock();
        if control.shut_down {
            return WatchdogOutcome::Offline;
        }

        if self.regs.read32(regs::STATUS) == REG_READ_FAILED {
            drop(control);
            self.mark_fatal("STATUS read returned all ones");
            return WatchdogOutcome::DeviceFailed;
        }

        let link_up = self.link_up.load(Ordering::Acquire);
        let mut hung = 0;
        let mut rearm: u64 = 0;
        for q in &self.queues {
            let mut txq = q.tx.lock();
            if txq.busy == TX_QUEUE_HUNG || txq.busy >= self.config.hang_threshold {
                if txq.busy != TX_QUEUE_HUNG {
                    warn!("ixgbe: tx queue {} is hung: {} in flight, next_clean {}, next_avail {}",
                        q.id, txq.in_flight, txq.next_clean, txq.next_avail);
                    txq.busy = TX_QUEUE_HUNG;
                    self.counters.hung_observations.fetch_add(1, Ordering::Relaxed);
                }
                self.active_queues.fetch_and(!(1u64 << q.id), Ordering::AcqRel);
                hung += 1;
            }
            if txq.in_flight > 0 {
                rearm |= q.irq.mask_bit();
            }
        }

        if hung == self.queues.len() && link_up {
            warn!("ixgbe: all {} queues are hung, reinitializing the device", hung);
            self.counters.watchdog_resets.fetch_add(1, Ordering::Relaxed);
            self.reinit_locked(&control);
            return WatchdogOutcome::Reset;
        }

        if rearm != 0 {
            regs::write_vector_mask(&*self.regs, regs::eics_ex, rearm);
            WatchdogOutcome::Rearmed(rearm)
        } else {
            WatchdogOutcome::Healthy
        }
    }
}

/// The action of the periodic watchdog task.
pub(crate) fn watchdog_task(nic: &Weak<IxgbeNic>) -> Result<WatchdogOutcome, &'static str> {
    let nic = nic.upgrade().ok_or("ixgbe device was dropped")?;
    Ok(nic.watchdog_tick())
}

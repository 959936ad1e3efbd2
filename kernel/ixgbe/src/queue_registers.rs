//! Structs which provide access to the registers of one ixgbe receive or transmit queue.
//! They implement the `RxQueueRegisters` and `TxQueueRegisters` traits, which lets
//! the shared queue initialization code program them.

use alloc::sync::Arc;
use nic_queues::{RxQueueRegisters, TxQueueRegisters};
use crate::regs::{self, RegisterIo};


/// Struct that stores the queue number of one ixgbe receive queue
/// as well as a shared reference to the device's register space.
pub struct IxgbeRxQueueRegisters {
    queue: usize,
    regs: Arc<dyn RegisterIo>,
}

impl IxgbeRxQueueRegisters {
    pub fn new(queue: u8, regs: Arc<dyn RegisterIo>) -> IxgbeRxQueueRegisters {
        IxgbeRxQueueRegisters { queue: queue as usize, regs }
    }

    /// Sets the receive buffer size and selects the advanced one-buffer descriptor format.
    pub fn configure_buffers(&mut self, rx_buffer_size: u16) {
        let bsizepkt = (rx_buffer_size as u32 >> regs::SRRCTL_BSIZEPKT_SHIFT) & regs::SRRCTL_BSIZEPKT_MASK;
        self.regs.write32(
            regs::srrctl(self.queue),
            bsizepkt | regs::SRRCTL_DESCTYPE_ADV_1BUFFER | regs::SRRCTL_DROP_EN,
        );
    }

    /// Enables or disables the queue, optionally with VLAN tag stripping.
    pub fn set_enabled(&mut self, enable: bool, vlan_strip: bool) {
        let reg = regs::rxdctl(self.queue);
        let mut value = self.regs.read32(reg) & !(regs::RXDCTL_ENABLE | regs::RXDCTL_VME);
        if enable {
            value |= regs::RXDCTL_ENABLE;
            if vlan_strip {
                value |= regs::RXDCTL_VME;
            }
        }
        self.regs.write32(reg, value);
    }
}

impl RxQueueRegisters for IxgbeRxQueueRegisters {
    fn update_rdbal(&mut self, value: u32) {
        self.regs.write32(regs::rdbal(self.queue), value)
    }
    fn update_rdbah(&mut self, value: u32) {
        self.regs.write32(regs::rdbah(self.queue), value)
    }
    fn update_rdlen(&mut self, value: u32) {
        self.regs.write32(regs::rdlen(self.queue), value)
    }
    fn update_rdh(&mut self, value: u32) {
        self.regs.write32(regs::rdh(self.queue), value)
    }
    fn update_rdt(&mut self, value: u32) {
        self.regs.write32(regs::rdt(self.queue), value)
    }
}


/// Struct that stores the queue number of one ixgbe transmit queue
/// as well as a shared reference to the device's register space.
pub struct IxgbeTxQueueRegisters {
    queue: usize,
    regs: Arc<dyn RegisterIo>,
}

impl IxgbeTxQueueRegisters {
    pub fn new(queue: u8, regs: Arc<dyn RegisterIo>) -> IxgbeTxQueueRegisters {
        IxgbeTxQueueRegisters { queue: queue as usize, regs }
    }

    /// Enables or disables the queue. The prefetch thresholds are always programmed.
    pub fn set_enabled(&mut self, enable: bool) {
        let mut value = regs::TXDCTL_PTHRESH | regs::TXDCTL_HTHRESH | regs::TXDCTL_WTHRESH;
        if enable {
            value |= regs::TXDCTL_ENABLE;
        }
        self.regs.write32(regs::txdctl(self.queue), value);
    }
}

impl TxQueueRegisters for IxgbeTxQueueRegisters {
    fn update_tdbal(&mut self, value: u32) {
        self.regs.write32(regs::tdbal(self.queue), value)
    }
    fn update_tdbah(&mut self, value: u32) {
        self.regs.write32(regs::tdbah(self.queue), value)
    }
    fn update_tdlen(&mut self, value: u32) {
        self.regs.write32(regs::tdlen(self.queue), value)
    }
    fn update_tdh(&mut self, value: u32) {
        self.regs.write32(regs::tdh(self.queue), value)
    }
    fn update_tdt(&mut self, value: u32) {
        self.regs.write32(regs::tdt(self.queue), value)
    }
}

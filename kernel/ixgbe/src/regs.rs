//! Register offsets of the 82599 device and the values that are written to them,
//! along with the [`RegisterIo`] abstraction that all register accesses go through.
//!
//! Only the registers that the ring engine, the interrupt controller and the watchdog touch are listed.
//! Offsets are in bytes from the start of BAR0.

use bit_field::BitField;
use volatile::Volatile;


/// Ordered, uncached 32-bit access to the device's register space.
///
/// Implementations must not cache device state: every `read32` reaches the device
/// and every `write32` is posted to it in program order.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}


/// The memory-mapped register space of a real device.
pub struct MmioRegisters {
    base: usize,
    size_in_bytes: usize,
}

impl MmioRegisters {
    /// Wraps an already mapped register region.
    ///
    /// # Safety
    /// `base` must point to `size_in_bytes` bytes of device memory that is mapped uncached
    /// and stays mapped for the lifetime of the returned object.
    pub unsafe fn new(base: *mut u8, size_in_bytes: usize) -> MmioRegisters {
        MmioRegisters { base: base as usize, size_in_bytes }
    }

    fn register(&self, offset: usize) -> Option<*mut Volatile<u32>> {
        if offset % 4 != 0 || offset + 4 > self.size_in_bytes {
            error!("ixgbe: register offset {:#X} is outside of the mapped region", offset);
            return None;
        }
        Some((self.base + offset) as *mut Volatile<u32>)
    }
}

impl RegisterIo for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        match self.register(offset) {
            // SAFETY: the offset was bounds-checked against the region given to `new()`.
            Some(reg) => unsafe { (*reg).read() },
            // looks like a removed device to the caller
            None => REG_READ_FAILED,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        if let Some(reg) = self.register(offset) {
            // SAFETY: the offset was bounds-checked against the region given to `new()`.
            unsafe { (*reg).write(value) }
        }
    }
}

/// The value every register read returns once the device has dropped off the bus.
pub const REG_READ_FAILED:              u32 = 0xFFFF_FFFF;


/* General registers */
/// Device Control Register
pub const CTRL:                         usize = 0x0;
/// Device Status Register
pub const STATUS:                       usize = 0x8;
/// Extended Interrupt Cause Register (clear on read)
pub const EICR:                         usize = 0x800;
/// Extended Interrupt Cause Set Register
pub const EICS:                         usize = 0x808;
/// Extended Interrupt Auto Clear Register
pub const EIAC:                         usize = 0x810;
/// Extended Interrupt Mask Set/Read Register
pub const EIMS:                         usize = 0x880;
/// Extended Interrupt Mask Clear Register
pub const EIMC:                         usize = 0x888;
/// General Purpose Interrupt Enable
pub const GPIE:                         usize = 0x898;
/// Receive Address Low, first entry
pub const RAL0:                         usize = 0xA200;
/// Receive Address High, first entry
pub const RAH0:                         usize = 0xA204;

/// Extended Interrupt Throttle Register of vector `n`.
/// The first 24 live in the general block, the rest in a separate one.
pub fn eitr(n: usize) -> usize {
    if n <= 23 { 0x820 + 4 * n } else { 0x12300 + 4 * (n - 24) }
}

/// Interrupt Vector Allocation Register `n`, covering queues `2n` and `2n + 1`.
pub fn ivar(n: usize) -> usize {
    0x900 + 4 * n
}

/// Extended Interrupt Cause Set register for vectors `32n .. 32n + 31`.
pub fn eics_ex(n: usize) -> usize {
    0xA90 + 4 * n
}

/// Extended Interrupt Mask Set register for vectors `32n .. 32n + 31`.
pub fn eims_ex(n: usize) -> usize {
    0xAA0 + 4 * n
}

/// Extended Interrupt Mask Clear register for vectors `32n .. 32n + 31`.
pub fn eimc_ex(n: usize) -> usize {
    0xAB0 + 4 * n
}


/* Per-queue registers */
/// Offset where the receive queue registers start for the first 64 rx queues
pub const RX_REGS_1:                    usize = 0x1000;
/// Offset where the receive queue registers start for the second set of 64 rx queues
pub const RX_REGS_2:                    usize = 0xD000;
/// Offset where the transmit queue registers start
pub const TX_REGS:                      usize = 0x6000;
/// Number of bytes between the register sets of consecutive queues
pub const QUEUE_REGS_DIST:              usize = 0x40;

fn rx_queue_base(queue: usize) -> usize {
    if queue < 64 {
        RX_REGS_1 + QUEUE_REGS_DIST * queue
    } else {
        RX_REGS_2 + QUEUE_REGS_DIST * (queue - 64)
    }
}

fn tx_queue_base(queue: usize) -> usize {
    TX_REGS + QUEUE_REGS_DIST * queue
}

/// Receive Descriptor Base Address Low
pub fn rdbal(queue: usize) -> usize { rx_queue_base(queue) }
/// Receive Descriptor Base Address High
pub fn rdbah(queue: usize) -> usize { rx_queue_base(queue) + 0x4 }
/// Receive Descriptor Length
pub fn rdlen(queue: usize) -> usize { rx_queue_base(queue) + 0x8 }
/// Receive Descriptor Head
pub fn rdh(queue: usize) -> usize { rx_queue_base(queue) + 0x10 }
/// Split Receive Control Register
pub fn srrctl(queue: usize) -> usize { rx_queue_base(queue) + 0x14 }
/// Receive Descriptor Tail
pub fn rdt(queue: usize) -> usize { rx_queue_base(queue) + 0x18 }
/// Receive Descriptor Control
pub fn rxdctl(queue: usize) -> usize { rx_queue_base(queue) + 0x28 }

/// Transmit Descriptor Base Address Low
pub fn tdbal(queue: usize) -> usize { tx_queue_base(queue) }
/// Transmit Descriptor Base Address High
pub fn tdbah(queue: usize) -> usize { tx_queue_base(queue) + 0x4 }
/// Transmit Descriptor Length
pub fn tdlen(queue: usize) -> usize { tx_queue_base(queue) + 0x8 }
/// Transmit Descriptor Head
pub fn tdh(queue: usize) -> usize { tx_queue_base(queue) + 0x10 }
/// Transmit Descriptor Tail
pub fn tdt(queue: usize) -> usize { tx_queue_base(queue) + 0x18 }
/// Transmit Descriptor Control
pub fn txdctl(queue: usize) -> usize { tx_queue_base(queue) + 0x28 }


/* STATUS */
pub const STATUS_LINK_UP:               u32 = 1 << 7;

/* Queue control */
/// Enable a receive queue
pub const RXDCTL_ENABLE:                u32 = 1 << 25;
/// Strip the VLAN tag of received frames into the descriptor
pub const RXDCTL_VME:                   u32 = 1 << 30;
/// Enable a transmit queue
pub const TXDCTL_ENABLE:                u32 = 1 << 25;
/// Tx descriptor pre-fetch threshold (value taken from DPDK)
pub const TXDCTL_PTHRESH:               u32 = 36;
/// Tx descriptor host threshold (value taken from DPDK)
pub const TXDCTL_HTHRESH:               u32 = 8 << 8;
/// Tx descriptor write-back threshold (value taken from DPDK)
pub const TXDCTL_WTHRESH:               u32 = 4 << 16;

/* SRRCTL */
/// Receive buffer size is written in 1 KiB units
pub const SRRCTL_BSIZEPKT_SHIFT:        u32 = 10;
pub const SRRCTL_BSIZEPKT_MASK:         u32 = 0x1F;
pub const SRRCTL_DESCTYPE_ADV_1BUFFER:  u32 = 1 << 25;
/// Drop packets when no descriptors are available instead of stalling the whole port
pub const SRRCTL_DROP_EN:               u32 = 1 << 28;

/* Interrupt registers */
pub const DISABLE_INTERRUPTS:           u32 = 0x7FFF_FFFF;
/// Receive/transmit queue causes in EICR for non-MSI-X operation
pub const EICR_RTX_QUEUE:               u32 = 0xFFFF;
/// MSI-X Mode
pub const GPIE_MSIX_MODE:               u32 = 1 << 4;
/// Other Clear Disable: other causes are cleared by reading EICR, not by the vector's assertion
pub const GPIE_OCD:                     u32 = 1 << 5;
/// Should be set in MSIX mode and cleared in legacy/msi mode
pub const GPIE_PBA_SUPPORT:             u32 = 1 << 31;
/// The interval bits of an EITR value
pub const EITR_ITR_INTERVAL_MASK:       u32 = 0x0FF8;
/// Write the interval without resetting the ITR counter
pub const EITR_CNT_WDIS:                u32 = 1 << 31;
/// Marks an IVAR entry valid
pub const IVAR_ALLOC_VAL:               u32 = 0x80;

/// The number of msi-x vectors this device can have.
pub const IXGBE_MAX_MSIX_VECTORS:       usize = 64;
/// The number of queues that have an EICR cause bit without MSI-X.
pub const IXGBE_MAX_LEGACY_QUEUES:      usize = 16;


/// Which direction of a queue an IVAR entry routes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IvarCause {
    Rx = 0,
    Tx = 1,
}

/// Routes the `cause` of `queue` to interrupt `vector`.
///
/// Each IVAR register holds four 8-bit entries: rx and tx of an even queue, then rx and tx of the next odd queue.
pub fn set_ivar(regs: &dyn RegisterIo, queue: u8, vector: u8, cause: IvarCause) {
    let reg = ivar(queue as usize >> 1);
    let index = 16 * (queue & 1) + 8 * cause as u8;
    let mut value = regs.read32(reg);
    value.set_bits(index..index + 8, (vector as u32 & 0x3F) | IVAR_ALLOC_VAL);
    regs.write32(reg, value);
}

/// Writes a 64-bit vector mask to one of the pairs of extended interrupt registers
/// (`eims_ex`, `eimc_ex` or `eics_ex`), skipping a half that has no bits set.
pub fn write_vector_mask(regs: &dyn RegisterIo, register: fn(usize) -> usize, mask: u64) {
    let low = mask as u32;
    let high = (mask >> 32) as u32;
    if low != 0 {
        regs.write32(register(0), low);
    }
    if high != 0 {
        regs.write32(register(1), high);
    }
}

/// Converts a throttle interval into the value written to an EITR register.
pub fn eitr_value(interval: u32) -> u32 {
    (interval & EITR_ITR_INTERVAL_MASK) | EITR_CNT_WDIS
}

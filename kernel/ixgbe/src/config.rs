//! Driver configuration, fixed when the device is created.
//!
//! Only the interrupt moderation parameters can be changed afterwards,
//! through [`IxgbeNic::reconfigure_moderation()`](crate::IxgbeNic::reconfigure_moderation).

use core::ops::Range;
use core::time::Duration;
use nic_initialization::validate_descriptor_count;
use crate::regs::{EITR_ITR_INTERVAL_MASK, IXGBE_MAX_LEGACY_QUEUES, IXGBE_MAX_MSIX_VECTORS};


/// Default number of descriptors per ring.
pub const DEFAULT_NUM_DESCS:            u16 = 1024;
pub const DEFAULT_RX_BUFFER_SIZE:       u16 = 2048;
pub const DEFAULT_RX_PROCESS_LIMIT:     usize = 256;
pub const DEFAULT_RX_REFILL_BATCH:      usize = 8;
pub const DEFAULT_RX_COPY_THRESHOLD:    usize = 160;
pub const DEFAULT_TSO_THRESHOLD:        usize = 2048;
pub const DEFAULT_TX_MAX_SEGMENTS:      usize = 32;
pub const DEFAULT_TX_BACKLOG_LIMIT:     usize = 256;
pub const DEFAULT_LRO_MAX_DESCRIPTORS:  usize = 16;
pub const DEFAULT_HANG_THRESHOLD:       u32 = 10;
pub const DEFAULT_WATCHDOG_PERIOD:      Duration = Duration::from_secs(1);


/// Parameters of the adaptive interrupt moderation algorithm.
///
/// The band and divisor defaults are empirically tuned values; they bound
/// correctness only through `min_interval` and `max_interval`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModerationConfig {
    pub enabled: bool,
    /// Lower bound of any computed interval.
    pub min_interval: u32,
    /// Upper bound of any computed interval.
    pub max_interval: u32,
    /// Interval programmed before any traffic has been seen.
    pub initial_interval: u32,
    /// Bytes added to the average packet size for preamble, framing and CRC.
    pub frame_overhead: u32,
    /// Cap applied to the average packet size before dividing.
    pub size_cap: u32,
    /// Average sizes strictly inside this range use `mid_divisor`.
    pub mid_band: Range<u32>,
    pub mid_divisor: u32,
    /// Divisor for averages outside of `mid_band`.
    pub edge_divisor: u32,
}

impl Default for ModerationConfig {
    fn default() -> ModerationConfig {
        ModerationConfig {
            enabled: true,
            min_interval: 8,
            max_interval: EITR_ITR_INTERVAL_MASK,
            initial_interval: 500,
            frame_overhead: 24,
            size_cap: 3000,
            mid_band: 300..1200,
            mid_divisor: 3,
            edge_divisor: 2,
        }
    }
}

impl ModerationConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.min_interval == 0 || self.min_interval > self.max_interval {
            return Err("moderation interval bounds must satisfy 0 < min <= max");
        }
        if self.max_interval > EITR_ITR_INTERVAL_MASK {
            return Err("moderation maximum interval does not fit in the EITR register");
        }
        if self.initial_interval < self.min_interval || self.initial_interval > self.max_interval {
            return Err("initial moderation interval must lie within [min, max]");
        }
        if self.mid_divisor == 0 || self.edge_divisor == 0 {
            return Err("moderation divisors must be non-zero");
        }
        if self.mid_band.start >= self.mid_band.end {
            return Err("moderation mid band is empty");
        }
        Ok(())
    }
}


/// The configuration of one ixgbe device.
#[derive(Clone, Debug)]
pub struct IxgbeConfig {
    /// Number of queue pairs (one tx and one rx ring each).
    pub num_queues: u8,
    pub num_tx_descs: u16,
    pub num_rx_descs: u16,
    /// Size of each receive buffer, a multiple of 1 KiB.
    pub rx_buffer_size: u16,
    /// Maximum number of packets one receive pass processes.
    pub rx_process_limit: usize,
    /// Number of consumed receive descriptors after which a pass refills the ring.
    pub rx_refill_batch: usize,
    /// Single-descriptor frames up to this size are copied into a small buffer.
    pub rx_copy_threshold: usize,
    /// Packets flagged for TSO are only segmented by hardware above this size.
    pub tso_threshold: usize,
    /// Maximum number of data descriptors of one transmitted packet.
    pub tx_max_segments: usize,
    /// Packets each queue holds back while its ring is full. Zero turns the backlog off.
    pub tx_backlog_limit: usize,
    pub lro_enabled: bool,
    /// Frames spanning more descriptors than this bypass LRO.
    pub lro_max_descriptors: usize,
    pub hw_vlan_strip: bool,
    pub rx_checksum_offload: bool,
    /// Number of MSI-X vectors the platform granted.
    /// Fewer than `num_queues` puts the device in legacy shared-vector mode.
    pub msix_vectors: usize,
    pub moderation: ModerationConfig,
    /// How often the watchdog runs. `None` means the embedder calls
    /// [`IxgbeNic::watchdog_tick()`](crate::IxgbeNic::watchdog_tick) itself.
    pub watchdog_period: Option<Duration>,
    /// Consecutive cleanup passes without progress after which a queue is hung.
    pub hang_threshold: u32,
}

impl Default for IxgbeConfig {
    fn default() -> IxgbeConfig {
        IxgbeConfig {
            num_queues: 1,
            num_tx_descs: DEFAULT_NUM_DESCS,
            num_rx_descs: DEFAULT_NUM_DESCS,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            rx_process_limit: DEFAULT_RX_PROCESS_LIMIT,
            rx_refill_batch: DEFAULT_RX_REFILL_BATCH,
            rx_copy_threshold: DEFAULT_RX_COPY_THRESHOLD,
            tso_threshold: DEFAULT_TSO_THRESHOLD,
            tx_max_segments: DEFAULT_TX_MAX_SEGMENTS,
            tx_backlog_limit: DEFAULT_TX_BACKLOG_LIMIT,
            lro_enabled: false,
            lro_max_descriptors: DEFAULT_LRO_MAX_DESCRIPTORS,
            hw_vlan_strip: true,
            rx_checksum_offload: true,
            msix_vectors: 1,
            moderation: ModerationConfig::default(),
            watchdog_period: Some(DEFAULT_WATCHDOG_PERIOD),
            hang_threshold: DEFAULT_HANG_THRESHOLD,
        }
    }
}

impl IxgbeConfig {
    /// Returns true if every queue gets its own MSI-X vector.
    pub fn msix_mode(&self) -> bool {
        self.msix_vectors >= self.num_queues as usize
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_queues == 0 || self.num_queues as usize > IXGBE_MAX_MSIX_VECTORS {
            return Err("number of queues must be between 1 and 64");
        }
        if !self.msix_mode() && self.num_queues as usize > IXGBE_MAX_LEGACY_QUEUES {
            return Err("at most 16 queues can share the legacy interrupt");
        }
        validate_descriptor_count(self.num_tx_descs)?;
        validate_descriptor_count(self.num_rx_descs)?;
        if self.rx_buffer_size < 1024 || self.rx_buffer_size % 1024 != 0 {
            return Err("receive buffer size must be a non-zero multiple of 1 KiB");
        }
        if self.rx_process_limit == 0 {
            return Err("receive process limit must be non-zero");
        }
        if self.rx_refill_batch == 0 {
            return Err("receive refill batch must be non-zero");
        }
        if self.rx_copy_threshold > self.rx_buffer_size as usize {
            return Err("receive copy threshold exceeds the receive buffer size");
        }
        // a packet's data descriptors and its context descriptor must fit next to the reserve
        if self.tx_max_segments == 0 || self.tx_max_segments + 1 > self.num_tx_descs as usize - 2 {
            return Err("maximum transmit segments must be non-zero and fit in the transmit ring");
        }
        if self.hang_threshold == 0 {
            return Err("hang threshold must be non-zero");
        }
        if matches!(self.watchdog_period, Some(p) if p.is_zero()) {
            return Err("watchdog period must be non-zero");
        }
        self.moderation.validate()
    }
}

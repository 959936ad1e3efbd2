//! Advanced transmit and receive descriptors (section 7.1.6 and 7.2.3 of the 82599 datasheet).
//!
//! Descriptors are plain 16-byte values. The rings that hold them are shared with the device,
//! so drivers copy a descriptor out of the ring, inspect the copy, and write a whole new value back;
//! nothing in this module hands out a reference into device-visible memory.

use core::fmt;
use core::mem::size_of;
use bit_field::BitField;
use zerocopy::{AsBytes, FromBytes};


/// A trait for functionalities that all receive descriptors must support.
pub trait RxDescriptor: Copy + Default {
    /// Builds a descriptor in read format that points the device at a receive buffer.
    /// The status bits are cleared as a side effect.
    ///
    /// # Arguments
    /// * `packet_buffer_address`: starting physical address of the receive buffer.
    fn new_read(packet_buffer_address: u64) -> Self;

    /// Returns true if the device has written a received packet (or piece of one) into this descriptor.
    fn descriptor_done(&self) -> bool;

    /// Returns true if the descriptor's packet buffer is the last in a frame.
    fn end_of_packet(&self) -> bool;

    /// The number of bytes the device posted to the packet buffer.
    fn length(&self) -> u16;
}

/// A trait for functionalities that all transmit descriptors must support.
pub trait TxDescriptor: Copy + Default {
    /// Returns true if the device has finished with this descriptor.
    /// Only descriptors written with the Report Status command are ever marked done.
    fn descriptor_done(&self) -> bool;

    /// Returns true if software asked the device to report completion of this descriptor.
    fn report_status(&self) -> bool;
}


/// Advanced Transmit Descriptor used by the ixgbe driver.
///
/// The same 16 bytes are interpreted three ways:
/// * data (read) format: buffer address, then `CMD_TYPE_LEN` and `OLINFO_STATUS`,
/// * context format: `VLAN_MACIP_LENS` and `SEQNUM_SEED`, then `TYPE_TUCMD_MLHL` and `MSS_L4LEN_IDX`,
/// * writeback format: only the `DD` status bit in the upper word is meaningful.
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
#[repr(C)]
pub struct AdvancedTxDescriptor {
    pub lower: u64,
    pub upper: u64,
}
const_assert_eq!(size_of::<AdvancedTxDescriptor>(), 16);

impl AdvancedTxDescriptor {
    /// Builds a data descriptor for one DMA segment.
    ///
    /// # Arguments
    /// * `buffer_addr`: physical address of the segment.
    /// * `cmd_type_len`: command, descriptor type and segment length (`ADVTXD_DCMD_*`, `ADVTXD_DTYP_DATA`).
    /// * `olinfo_status`: checksum insertion options and the payload length of the whole packet.
    pub fn data(buffer_addr: u64, cmd_type_len: u32, olinfo_status: u32) -> AdvancedTxDescriptor {
        let mut upper = 0u64;
        upper.set_bits(0..32, cmd_type_len as u64);
        upper.set_bits(32..64, olinfo_status as u64);
        AdvancedTxDescriptor { lower: buffer_addr, upper }
    }

    /// Builds a context descriptor that configures checksum, segmentation and VLAN insertion
    /// for the data descriptors that follow it.
    pub fn context(vlan_macip_lens: u32, type_tucmd_mlhl: u32, mss_l4len_idx: u32) -> AdvancedTxDescriptor {
        let mut lower = 0u64;
        lower.set_bits(0..32, vlan_macip_lens as u64);
        // SEQNUM_SEED (bits 32..64) is only used for IPsec and stays zero.
        let mut upper = 0u64;
        upper.set_bits(0..32, type_tucmd_mlhl as u64);
        upper.set_bits(32..64, mss_l4len_idx as u64);
        AdvancedTxDescriptor { lower, upper }
    }

    /// Data format: physical address of the segment.
    pub fn buffer_address(&self) -> u64 {
        self.lower
    }

    /// Data format: command, descriptor type and segment length.
    pub fn cmd_type_len(&self) -> u32 {
        self.upper.get_bits(0..32) as u32
    }

    /// Data format: offload options and payload length.
    pub fn olinfo_status(&self) -> u32 {
        self.upper.get_bits(32..64) as u32
    }

    /// Data format: the number of bytes in this segment.
    pub fn data_length(&self) -> u16 {
        self.upper.get_bits(0..16) as u16
    }

    /// Returns true if this descriptor is in context format.
    pub fn is_context(&self) -> bool {
        (self.cmd_type_len() & ADVTXD_DTYP_MASK) == ADVTXD_DTYP_CTXT
    }

    /// Returns true if this is the last data descriptor of a packet.
    pub fn end_of_packet(&self) -> bool {
        !self.is_context() && (self.cmd_type_len() & ADVTXD_DCMD_EOP) != 0
    }

    /// Context format: VLAN tag, MAC header length and IP header length.
    pub fn vlan_macip_lens(&self) -> u32 {
        self.lower.get_bits(0..32) as u32
    }

    /// Context format: descriptor type and L3/L4 checksum commands.
    pub fn type_tucmd_mlhl(&self) -> u32 {
        self.upper.get_bits(0..32) as u32
    }

    /// Context format: maximum segment size and L4 header length.
    pub fn mss_l4len_idx(&self) -> u32 {
        self.upper.get_bits(32..64) as u32
    }

    /// Writeback format: the value the device leaves behind once it has fetched the descriptor.
    pub fn mark_done(&mut self) {
        self.upper.set_bit(32, true);
    }
}

impl TxDescriptor for AdvancedTxDescriptor {
    fn descriptor_done(&self) -> bool {
        (self.olinfo_status() & ADVTXD_STAT_DD) != 0
    }

    fn report_status(&self) -> bool {
        !self.is_context() && (self.cmd_type_len() & ADVTXD_DCMD_RS) != 0
    }
}

impl fmt::Debug for AdvancedTxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{lower: {:#X}, cmd_type_len: {:#X}, olinfo_status: {:#X}}}",
            self.lower, self.cmd_type_len(), self.olinfo_status())
    }
}


/// Advanced Receive Descriptor used by the ixgbe driver.
///
/// It has 2 modes: Read and Write Back. There is one receive descriptor per receive buffer
/// that is converted between these 2 modes.
/// Read contains the addresses that the driver writes.
/// Write Back contains information the hardware writes on receiving a packet.
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, AsBytes)]
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// Read: packet buffer address. Write Back: packet info (low) and RSS hash (high).
    pub lower: u64,
    /// Read: header buffer address. Write Back: extended status/error, packet length, VLAN tag.
    pub upper: u64,
}
const_assert_eq!(size_of::<AdvancedRxDescriptor>(), 16);

impl AdvancedRxDescriptor {
    /// Builds a descriptor in write back format, as the device would store it.
    pub fn writeback(packet_info: u32, rss_hash: u32, status_error: u32, length: u16, vlan_tag: u16) -> AdvancedRxDescriptor {
        let mut lower = 0u64;
        lower.set_bits(0..32, packet_info as u64);
        lower.set_bits(32..64, rss_hash as u64);
        let mut upper = 0u64;
        upper.set_bits(0..32, status_error as u64);
        upper.set_bits(32..48, length as u64);
        upper.set_bits(48..64, vlan_tag as u64);
        AdvancedRxDescriptor { lower, upper }
    }

    /// Read mode: the packet buffer address given to the device.
    pub fn packet_buffer_address(&self) -> u64 {
        self.lower
    }

    /// Write Back mode: packet type and RSS type bits.
    pub fn packet_info(&self) -> u32 {
        self.lower.get_bits(0..32) as u32
    }

    /// Write Back mode: the packet type that was used for the Receive Side Scaling hash function.
    /// Zero means no hash was computed.
    pub fn rss_type(&self) -> u8 {
        self.lower.get_bits(0..4) as u8
    }

    /// Write Back mode: the Receive Side Scaling hash.
    pub fn rss_hash(&self) -> u32 {
        self.lower.get_bits(32..64) as u32
    }

    /// Write Back mode: status bits (`RXD_STAT_*`) in the low bits and errors (`RXDADV_ERR_*`) in the high bits.
    pub fn status_error(&self) -> u32 {
        self.upper.get_bits(0..32) as u32
    }

    /// Write Back mode: if the VLAN header is stripped from the packet, then the 16 bits of the VLAN tag are posted here.
    pub fn vlan_tag(&self) -> u16 {
        self.upper.get_bits(48..64) as u16
    }

    /// Returns true if the device reported a CRC, length, or other framing error.
    pub fn frame_error(&self) -> bool {
        (self.status_error() & RXDADV_ERR_FRAME_ERR_MASK) != 0
    }
}

impl RxDescriptor for AdvancedRxDescriptor {
    fn new_read(packet_buffer_address: u64) -> AdvancedRxDescriptor {
        // no header split, so the header buffer address (and with it the DD bit) stays zero
        AdvancedRxDescriptor { lower: packet_buffer_address, upper: 0 }
    }

    fn descriptor_done(&self) -> bool {
        (self.status_error() & RXD_STAT_DD) != 0
    }

    fn end_of_packet(&self) -> bool {
        (self.status_error() & RXD_STAT_EOP) != 0
    }

    fn length(&self) -> u16 {
        self.upper.get_bits(32..48) as u16
    }
}

impl fmt::Debug for AdvancedRxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{Packet buffer address / info: {:#X}, status/length/vlan: {:#X}}}",
            self.lower, self.upper)
    }
}


/* Advanced transmit descriptor: CMD_TYPE_LEN */
/// Data buffer length mask
pub const ADVTXD_DTALEN_MASK:           u32 = 0x0000_FFFF;
/// The most bytes a single data descriptor can point to
pub const ADVTXD_MAX_DATA_PER_TXD:      usize = ADVTXD_DTALEN_MASK as usize;
/// Descriptor type mask
pub const ADVTXD_DTYP_MASK:             u32 = 0x00F0_0000;
/// Descriptor type: context
pub const ADVTXD_DTYP_CTXT:             u32 = 0x2 << 20;
/// Descriptor type: data
pub const ADVTXD_DTYP_DATA:             u32 = 0x3 << 20;
/// Tx Command: End of Packet
pub const ADVTXD_DCMD_EOP:              u32 = 1 << 24;
/// Tx Command: Insert FCS
pub const ADVTXD_DCMD_IFCS:             u32 = 1 << 25;
/// Tx Command: Report Status
pub const ADVTXD_DCMD_RS:               u32 = 1 << 27;
/// Tx Command: Descriptor extension (advanced format)
pub const ADVTXD_DCMD_DEXT:             u32 = 1 << 29;
/// Tx Command: VLAN Packet Enable
pub const ADVTXD_DCMD_VLE:              u32 = 1 << 30;
/// Tx Command: TCP Segmentation Enable
pub const ADVTXD_DCMD_TSE:              u32 = 1 << 31;

/* Advanced transmit descriptor: OLINFO_STATUS */
/// Tx Status: descriptor done
pub const ADVTXD_STAT_DD:               u32 = 1 << 0;
/// Insert IP checksum
pub const ADVTXD_POPTS_IXSM:            u32 = 1 << 8;
/// Insert TCP/UDP checksum
pub const ADVTXD_POPTS_TXSM:            u32 = 1 << 9;
pub const ADVTXD_PAYLEN_SHIFT:          u32 = 14;

/* Advanced context descriptor */
pub const ADVTXD_MACLEN_SHIFT:          u32 = 9;
pub const ADVTXD_VLAN_SHIFT:            u32 = 16;
pub const ADVTXD_TUCMD_IPV6:            u32 = 0 << 10;
pub const ADVTXD_TUCMD_IPV4:            u32 = 1 << 10;
pub const ADVTXD_TUCMD_L4T_UDP:         u32 = 0 << 11;
pub const ADVTXD_TUCMD_L4T_TCP:         u32 = 1 << 11;
pub const ADVTXD_L4LEN_SHIFT:           u32 = 8;
pub const ADVTXD_MSS_SHIFT:             u32 = 16;

/* Receive descriptor status bits */
/// Rx Status: descriptor done
pub const RXD_STAT_DD:                  u32 = 1 << 0;
/// Rx Status: end of packet
pub const RXD_STAT_EOP:                 u32 = 1 << 1;
/// Rx Status: VLAN tag stripped into the descriptor
pub const RXD_STAT_VP:                  u32 = 1 << 3;
/// Rx Status: UDP checksum computed
pub const RXD_STAT_UDPCS:               u32 = 1 << 4;
/// Rx Status: L4 (TCP/UDP) checksum computed
pub const RXD_STAT_L4CS:                u32 = 1 << 5;
/// Rx Status: IPv4 checksum computed
pub const RXD_STAT_IPCS:                u32 = 1 << 6;

/* Receive descriptor error bits */
pub const RXDADV_ERR_CE:                u32 = 1 << 24;
pub const RXDADV_ERR_LE:                u32 = 1 << 25;
pub const RXDADV_ERR_PE:                u32 = 1 << 27;
pub const RXDADV_ERR_OSE:               u32 = 1 << 28;
pub const RXDADV_ERR_USE:               u32 = 1 << 29;
/// L4 checksum error
pub const RXDADV_ERR_TCPE:              u32 = 1 << 30;
/// IPv4 checksum error
pub const RXDADV_ERR_IPE:               u32 = 1 << 31;
/// Errors that make the whole frame unusable
pub const RXDADV_ERR_FRAME_ERR_MASK:    u32 = RXDADV_ERR_CE | RXDADV_ERR_LE | RXDADV_ERR_PE | RXDADV_ERR_OSE | RXDADV_ERR_USE;

/* Receive descriptor packet type bits (packet info word) */
pub const RXDADV_PKTTYPE_IPV4:          u32 = 0x0000_0010;
pub const RXDADV_PKTTYPE_IPV4_EX:       u32 = 0x0000_0020;
pub const RXDADV_PKTTYPE_IPV6:          u32 = 0x0000_0040;
pub const RXDADV_PKTTYPE_TCP:           u32 = 0x0000_0100;
pub const RXDADV_PKTTYPE_UDP:           u32 = 0x0000_0200;

//! Transmit offload setup: checksum insertion, VLAN tag insertion and TCP segmentation.
//!
//! The offload a packet asks for is turned into an optional context descriptor plus the
//! command and option bits every data descriptor of that packet carries.
//! For TSO the IP and TCP headers are also adjusted in place, since the device computes
//! payload checksums itself but expects a pre-seeded pseudo-header sum.

use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use intel_ethernet::descriptors::*;
use nic_buffers::{PacketBuffer, TxOffloadFlags};


const ETHERTYPE_IPV4:   u16 = 0x0800;
const ETHERTYPE_IPV6:   u16 = 0x86DD;
const ETHERTYPE_VLAN:   u16 = 0x8100;
const IPPROTO_TCP:      u8 = 6;
const IPPROTO_UDP:      u8 = 17;

const ETHER_HDR_LEN:    usize = 14;
const VLAN_ENCAP_LEN:   usize = 4;

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct EthernetHeader {
    dst: [u8; 6],
    src: [u8; 6],
    ethertype: U16<NetworkEndian>,
}

/// The 802.1Q tag that follows the source address of a tagged frame.
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct VlanHeader {
    tpid: U16<NetworkEndian>,
    tci: U16<NetworkEndian>,
    ethertype: U16<NetworkEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct Ipv4Header {
    version_ihl: u8,
    tos: u8,
    total_len: U16<NetworkEndian>,
    id: U16<NetworkEndian>,
    frag_off: U16<NetworkEndian>,
    ttl: u8,
    protocol: u8,
    checksum: U16<NetworkEndian>,
    src: [u8; 4],
    dst: [u8; 4],
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct Ipv6Header {
    vtc_flow: U32<NetworkEndian>,
    payload_len: U16<NetworkEndian>,
    next_header: u8,
    hop_limit: u8,
    src: [u8; 16],
    dst: [u8; 16],
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct TcpHeader {
    src_port: U16<NetworkEndian>,
    dst_port: U16<NetworkEndian>,
    seq: U32<NetworkEndian>,
    ack: U32<NetworkEndian>,
    data_offset: u8,
    flags: u8,
    window: U16<NetworkEndian>,
    checksum: U16<NetworkEndian>,
    urgent: U16<NetworkEndian>,
}

const_assert_eq!(core::mem::size_of::<EthernetHeader>(), ETHER_HDR_LEN);
const_assert_eq!(core::mem::size_of::<Ipv4Header>(), 20);
const_assert_eq!(core::mem::size_of::<Ipv6Header>(), 40);
const_assert_eq!(core::mem::size_of::<TcpHeader>(), 20);


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum L3 {
    Ipv4,
    Ipv6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum L4 {
    Tcp,
    Udp,
    Other,
}

/// Where the headers of a packet are and what they contain.
#[derive(Clone, Copy, Debug)]
struct HeaderLayout {
    ehdrlen: usize,
    l3: L3,
    ip_hlen: usize,
    l4: L4,
}

/// Locates the L2, L3 and L4 headers. Returns `None` for anything but IPv4/IPv6 over Ethernet.
fn parse_headers(frame: &[u8]) -> Option<HeaderLayout> {
    let (eth, _) = LayoutVerified::<_, EthernetHeader>::new_unaligned_from_prefix(frame)?;
    let (ehdrlen, ethertype) = if eth.ethertype.get() == ETHERTYPE_VLAN {
        let (vlan, _) = LayoutVerified::<_, VlanHeader>::new_unaligned_from_prefix(frame.get(ETHER_HDR_LEN - 2..)?)?;
        (ETHER_HDR_LEN + VLAN_ENCAP_LEN, vlan.ethertype.get())
    } else {
        (ETHER_HDR_LEN, eth.ethertype.get())
    };

    let l3_bytes = frame.get(ehdrlen..)?;
    let (l3, ip_hlen, protocol) = match ethertype {
        ETHERTYPE_IPV4 => {
            let (ip, _) = LayoutVerified::<_, Ipv4Header>::new_unaligned_from_prefix(l3_bytes)?;
            let ip_hlen = ((ip.version_ihl & 0x0F) as usize) << 2;
            if ip_hlen < core::mem::size_of::<Ipv4Header>() || ip_hlen > l3_bytes.len() {
                return None;
            }
            (L3::Ipv4, ip_hlen, ip.protocol)
        }
        ETHERTYPE_IPV6 => {
            let (ip, _) = LayoutVerified::<_, Ipv6Header>::new_unaligned_from_prefix(l3_bytes)?;
            (L3::Ipv6, core::mem::size_of::<Ipv6Header>(), ip.next_header)
        }
        _ => return None,
    };
    let l4 = match protocol {
        IPPROTO_TCP => L4::Tcp,
        IPPROTO_UDP => L4::Udp,
        _ => L4::Other,
    };
    Some(HeaderLayout { ehdrlen, l3, ip_hlen, l4 })
}

/// The ones' complement sum of the length-less TCP pseudo-header, folded but not complemented.
fn pseudo_header_sum(src: &[u8], dst: &[u8], protocol: u8) -> u16 {
    let mut sum: u32 = protocol as u32;
    for word in src.chunks(2).chain(dst.chunks(2)) {
        sum += u16::from_be_bytes([word[0], *word.get(1).unwrap_or(&0)]) as u32;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}


/// How the descriptors of one packet are built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxContext {
    /// Context descriptor that must precede the data descriptors.
    pub descriptor: Option<AdvancedTxDescriptor>,
    /// Extra command bits for every data descriptor (`VLE`, `TSE`).
    pub cmd: u32,
    /// Option bits and payload length for every data descriptor.
    pub olinfo: u32,
    /// True if the device will segment this packet.
    pub tso: bool,
}

impl TxContext {
    /// The number of ring slots the context takes up.
    pub fn descriptors_needed(&self) -> u16 {
        self.descriptor.is_some() as u16
    }
}

/// Works out the offload context of `packet` and applies the header changes TSO needs.
///
/// The header changes are idempotent, so a packet that is handed back to its sender
/// after this call can be submitted again unchanged.
pub fn prepare(packet: &mut PacketBuffer, tso_threshold: usize) -> TxContext {
    let offload = packet.offload;
    let total_len = packet.length();
    let mut ctx = TxContext {
        olinfo: (total_len as u32) << ADVTXD_PAYLEN_SHIFT,
        ..Default::default()
    };

    let mut vlan_macip_lens = 0;
    if let Some(tag) = offload.vlan_tag {
        ctx.cmd |= ADVTXD_DCMD_VLE;
        vlan_macip_lens |= (tag as u32) << ADVTXD_VLAN_SHIFT;
    }

    if offload.flags.contains(TxOffloadFlags::TSO) && total_len > tso_threshold && offload.mss != 0 {
        if let Some(tso) = tso_setup(packet, offload.mss, vlan_macip_lens) {
            return TxContext { cmd: ctx.cmd | tso.cmd, ..tso };
        }
        debug!("ixgbe: packet of {} bytes is not eligible for TSO, using checksum offload", total_len);
    }

    let csum_flags = TxOffloadFlags::IP_CSUM | TxOffloadFlags::TCP_CSUM | TxOffloadFlags::UDP_CSUM;
    if !offload.flags.intersects(csum_flags) && offload.vlan_tag.is_none() {
        return ctx;
    }

    let mut type_tucmd = ADVTXD_DCMD_DEXT | ADVTXD_DTYP_CTXT;
    match parse_headers(packet) {
        Some(layout) => {
            vlan_macip_lens |= ((layout.ehdrlen as u32) << ADVTXD_MACLEN_SHIFT) | layout.ip_hlen as u32;
            if layout.l3 == L3::Ipv4 {
                type_tucmd |= ADVTXD_TUCMD_IPV4;
                if offload.flags.contains(TxOffloadFlags::IP_CSUM) {
                    ctx.olinfo |= ADVTXD_POPTS_IXSM;
                }
            } else {
                type_tucmd |= ADVTXD_TUCMD_IPV6;
            }
            match layout.l4 {
                L4::Tcp if offload.flags.contains(TxOffloadFlags::TCP_CSUM) => {
                    type_tucmd |= ADVTXD_TUCMD_L4T_TCP;
                    ctx.olinfo |= ADVTXD_POPTS_TXSM;
                }
                L4::Udp if offload.flags.contains(TxOffloadFlags::UDP_CSUM) => {
                    type_tucmd |= ADVTXD_TUCMD_L4T_UDP;
                    ctx.olinfo |= ADVTXD_POPTS_TXSM;
                }
                _ => { }
            }
        }
        None if offload.vlan_tag.is_some() => {
            // still insert the tag, just without any checksums
            vlan_macip_lens |= (ETHER_HDR_LEN as u32) << ADVTXD_MACLEN_SHIFT;
        }
        None => {
            debug!("ixgbe: checksum offload requested for a packet with unknown headers");
            return ctx;
        }
    }

    ctx.descriptor = Some(AdvancedTxDescriptor::context(vlan_macip_lens, type_tucmd, 0));
    ctx
}

/// Prepares a TCP packet for segmentation by the device.
/// Returns `None` if the packet is not TCP over IPv4 or IPv6, leaving it untouched.
fn tso_setup(packet: &mut PacketBuffer, mss: u16, vlan_bits: u32) -> Option<TxContext> {
    let layout = parse_headers(packet)?;
    if layout.l4 != L4::Tcp {
        return None;
    }
    let total_len = packet.length();
    let l4_offset = layout.ehdrlen + layout.ip_hlen;

    // every check happens before the first header byte is rewritten
    let tcp_hlen = {
        let (tcp, _) = LayoutVerified::<_, TcpHeader>::new_unaligned_from_prefix(packet.get(l4_offset..)?)?;
        ((tcp.data_offset >> 4) as usize) << 2
    };
    if tcp_hlen < core::mem::size_of::<TcpHeader>() {
        return None;
    }
    let hdrlen = l4_offset + tcp_hlen;
    if hdrlen >= total_len {
        return None;
    }
    let paylen = (total_len - hdrlen) as u32;

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    let addr_len = {
        let l3_bytes = packet.get_mut(layout.ehdrlen..)?;
        match layout.l3 {
            L3::Ipv4 => {
                let (mut ip, _) = LayoutVerified::<_, Ipv4Header>::new_unaligned_from_prefix(l3_bytes)?;
                ip.total_len.set(0);
                ip.checksum.set(0);
                src[..4].copy_from_slice(&ip.src);
                dst[..4].copy_from_slice(&ip.dst);
                4
            }
            L3::Ipv6 => {
                let (mut ip, _) = LayoutVerified::<_, Ipv6Header>::new_unaligned_from_prefix(l3_bytes)?;
                ip.payload_len.set(0);
                src = ip.src;
                dst = ip.dst;
                16
            }
        }
    };

    let (mut tcp, _) = LayoutVerified::<_, TcpHeader>::new_unaligned_from_prefix(packet.get_mut(l4_offset..)?)?;
    tcp.checksum.set(pseudo_header_sum(&src[..addr_len], &dst[..addr_len], IPPROTO_TCP));

    let vlan_macip_lens = vlan_bits | ((layout.ehdrlen as u32) << ADVTXD_MACLEN_SHIFT) | layout.ip_hlen as u32;
    let mut type_tucmd = ADVTXD_DCMD_DEXT | ADVTXD_DTYP_CTXT | ADVTXD_TUCMD_L4T_TCP;
    let mut olinfo = ADVTXD_POPTS_TXSM | (paylen << ADVTXD_PAYLEN_SHIFT);
    if layout.l3 == L3::Ipv4 {
        type_tucmd |= ADVTXD_TUCMD_IPV4;
        olinfo |= ADVTXD_POPTS_IXSM;
    }
    let mss_l4len_idx = ((mss as u32) << ADVTXD_MSS_SHIFT) | ((tcp_hlen as u32) << ADVTXD_L4LEN_SHIFT);

    Some(TxContext {
        descriptor: Some(AdvancedTxDescriptor::context(vlan_macip_lens, type_tucmd, mss_l4len_idx)),
        cmd: ADVTXD_DCMD_TSE,
        olinfo,
        tso: true,
    })
}

//! The boundary between a NIC driver and the rest of the system:
//! the [`NetworkInterfaceCard`] trait the driver implements, and the
//! [`HostStack`] and [`LroHandler`] collaborators the driver hands received frames to.

#![no_std]

#[macro_use] extern crate log;
extern crate nic_buffers;

use core::fmt;
use nic_buffers::{PacketBuffer, ReceivedFrame};


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement.
///
/// Drivers synchronize internally, so every function takes `&self` and may be
/// called concurrently from several contexts.
pub trait NetworkInterfaceCard {
    /// Queues the given `packet` for transmission and returns without waiting for the hardware.
    ///
    /// On failure the packet is either handed back inside the error (`Busy`, `Offline`)
    /// or has already been released by the driver.
    fn send_packet(&self, packet: PacketBuffer) -> Result<(), TxError>;

    /// Poll the NIC for received frames and transmit completions.
    /// Can be used as an alternative to interrupts, or as a supplement to interrupts.
    fn poll_receive(&self) -> Result<(), &'static str>;

    /// Returns the MAC address that this NIC is configured with.
    fn mac_address(&self) -> [u8; 6];
}


/// The reasons a packet could not be queued for transmission.
pub enum TxError {
    /// Not enough free descriptors; retry after the next completion.
    Busy(PacketBuffer),
    /// The packet could not be mapped for DMA and was released.
    DmaSetupFailed,
    /// The packet needs more DMA segments than a single transmission allows and was released.
    TooManySegments,
    /// The device has failed or has been shut down.
    Offline(PacketBuffer),
}

impl TxError {
    /// Returns the packet to the caller if the driver did not consume it.
    pub fn into_packet(self) -> Option<PacketBuffer> {
        match self {
            TxError::Busy(packet) | TxError::Offline(packet) => Some(packet),
            TxError::DmaSetupFailed | TxError::TooManySegments => None,
        }
    }

    /// Returns true if the same packet may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::Busy(_))
    }
}

impl fmt::Debug for TxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxError::Busy(p)         => write!(f, "Busy(length: {})", p.length()),
            TxError::DmaSetupFailed  => write!(f, "DmaSetupFailed"),
            TxError::TooManySegments => write!(f, "TooManySegments"),
            TxError::Offline(p)      => write!(f, "Offline(length: {})", p.length()),
        }
    }
}


/// The host networking stack, which takes ownership of every frame the driver receives.
///
/// Invoked from interrupt and deferred contexts, so it must not block.
pub trait HostStack: Send + Sync {
    fn deliver(&self, queue_id: u8, frame: ReceivedFrame);
}

/// A software Large Receive Offload engine that merges consecutive TCP segments of the same flow.
pub trait LroHandler: Send + Sync {
    /// Offers a frame for merging. Returns the frame back if it was not taken.
    fn try_merge(&self, queue_id: u8, frame: ReceivedFrame) -> Result<(), ReceivedFrame>;

    /// Hands every frame still being merged for `queue_id` to `host`.
    fn flush(&self, queue_id: u8, host: &dyn HostStack);
}

/// Offers `frame` to the LRO engine, if any, and otherwise delivers it to the host stack.
pub fn deliver_or_merge(queue_id: u8, frame: ReceivedFrame, lro: Option<&dyn LroHandler>, host: &dyn HostStack) {
    let frame = match lro {
        Some(lro) => match lro.try_merge(queue_id, frame) {
            Ok(()) => return,
            Err(frame) => frame,
        },
        None => frame,
    };
    trace!("network_interface_card: delivering {}-byte frame from queue {}", frame.length, queue_id);
    host.deliver(queue_id, frame);
}


#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::sync::Mutex;
    use std::vec::Vec;

    #[derive(Default)]
    struct Collector(Mutex<Vec<(u8, usize)>>);

    impl HostStack for Collector {
        fn deliver(&self, queue_id: u8, frame: ReceivedFrame) {
            self.0.lock().unwrap().push((queue_id, frame.length));
        }
    }

    /// Takes only frames longer than 100 bytes.
    #[derive(Default)]
    struct PickyLro(Mutex<Vec<ReceivedFrame>>);

    impl LroHandler for PickyLro {
        fn try_merge(&self, _queue_id: u8, frame: ReceivedFrame) -> Result<(), ReceivedFrame> {
            if frame.length > 100 {
                self.0.lock().unwrap().push(frame);
                Ok(())
            } else {
                Err(frame)
            }
        }
        fn flush(&self, queue_id: u8, host: &dyn HostStack) {
            for frame in self.0.lock().unwrap().drain(..) {
                host.deliver(queue_id, frame);
            }
        }
    }

    fn frame(len: usize) -> ReceivedFrame {
        ReceivedFrame::new(alloc_vec(len))
    }

    fn alloc_vec(len: usize) -> Vec<PacketBuffer> {
        let mut v = Vec::new();
        v.push(PacketBuffer::new(len));
        v
    }

    #[test]
    fn declined_frames_reach_the_host() {
        let host = Collector::default();
        let lro = PickyLro::default();
        deliver_or_merge(2, frame(60), Some(&lro), &host);
        deliver_or_merge(2, frame(1500), Some(&lro), &host);
        assert_eq!(*host.0.lock().unwrap(), [(2, 60)]);

        lro.flush(2, &host);
        assert_eq!(*host.0.lock().unwrap(), [(2, 60), (2, 1500)]);
    }

    #[test]
    fn without_lro_every_frame_is_delivered() {
        let host = Collector::default();
        deliver_or_merge(0, frame(1500), None, &host);
        assert_eq!(host.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn busy_hands_the_packet_back() {
        let err = TxError::Busy(PacketBuffer::new(64));
        assert!(err.is_retryable());
        assert_eq!(err.into_packet().map(|p| p.length()), Some(64));
        assert!(TxError::DmaSetupFailed.into_packet().is_none());
        assert!(!TxError::Offline(PacketBuffer::new(1)).is_retryable());
    }
}

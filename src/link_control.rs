use std::cmp::min;
use std::time::Duration;

use anyhow::bail;
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::buf_ext::BufExt;
use crate::frame::Frame;

/// Parameters that both peers must agree on before DATA can flow
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LinkParameters {
    pub packet_size: u16,
    pub window_size: u8,
    pub baud_rate: u32,
}

impl LinkParameters {
    /// start bit + 8 data bits + parity + stop bit
    const BITS_PER_BYTE: u64 = 11;

    /// element-wise minimum
    pub fn min(&self, other: &LinkParameters) -> LinkParameters {
        LinkParameters {
            packet_size: min(self.packet_size, other.packet_size),
            window_size: min(self.window_size, other.window_size),
            baud_rate: min(self.baud_rate, other.baud_rate),
        }
    }

    /// Time it takes to put `num_bytes` on the wire at this link's baud rate
    pub fn transmit_duration(&self, num_bytes: usize) -> Duration {
        let bits = num_bytes as u64 * Self::BITS_PER_BYTE;
        Duration::from_micros(bits * 1_000_000 / (self.baud_rate.max(1) as u64))
    }

    /// The maximum number of payload bytes accepted by a sender and not yet acknowledged
    pub fn max_unacked_bytes(&self) -> usize {
        self.packet_size as usize * self.window_size as usize
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct LinkControlFlags: u8 {
        /// The sender has received the receiver's link parameters
        const PEER_SEEN = 0b0000_0001;
        /// The sender is closing the stream
        const CLOSING   = 0b0000_0010;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LinkControlMessage {
    pub flags: LinkControlFlags,
    pub params: LinkParameters,
}

impl LinkControlMessage {
    pub const PROTOCOL_VERSION: u8 = 1;

    pub const SERIALIZED_LEN: usize =
        std::mem::size_of::<u8>()         // version
        + std::mem::size_of::<u8>()       // flags
        + std::mem::size_of::<u16>()      // packet size
        + std::mem::size_of::<u8>()       // window size
        + std::mem::size_of::<u32>();     // baud rate

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.params.packet_size);
        buf.put_u8(self.params.window_size);
        buf.put_u32(self.params.baud_rate);
    }

    pub fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<LinkControlMessage> {
        let version = buf.checked_get_u8()?;
        if version != Self::PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        // unknown flags are ignored to allow for backwards compatible extensions
        let flags = LinkControlFlags::from_bits_truncate(buf.checked_get_u8()?);
        let packet_size = buf.checked_get_u16()?;
        let window_size = buf.checked_get_u8()?;
        let baud_rate = buf.checked_get_u32()?;

        if packet_size == 0 || window_size == 0 || baud_rate == 0 {
            bail!("link parameters must be positive: packet size {}, window size {}, baud rate {}", packet_size, window_size, baud_rate);
        }

        Ok(LinkControlMessage {
            flags,
            params: LinkParameters {
                packet_size,
                window_size,
                baud_rate,
            }
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        Frame::link_control(buf.freeze())
    }
}

/// What happened as a consequence of a peer's link control message
#[derive(Debug, Default, Eq, PartialEq)]
pub struct PeerLinkControlOutcome {
    /// set exactly once: when parameters were negotiated by this message
    pub newly_negotiated: Option<LinkParameters>,
    /// the peer has not seen our parameters yet and should get an LCTRL frame
    pub reply: bool,
    pub peer_closing: bool,
}

/// Negotiation of link parameters. Both sides send their local parameters, and both use the
///  element-wise minimum of their own and the peer's parameters. The result is frozen, i.e. later
///  LCTRL frames with different values do not change it.
pub struct LinkControlNegotiator {
    local: LinkParameters,
    peer: Option<LinkParameters>,
    negotiated: Option<LinkParameters>,
    scheduled: bool,
}

impl LinkControlNegotiator {
    pub fn new(local: LinkParameters) -> LinkControlNegotiator {
        LinkControlNegotiator {
            local,
            peer: None,
            negotiated: None,
            scheduled: false,
        }
    }

    /// Requests sending an LCTRL frame. Returns `false` if one is already scheduled.
    pub fn schedule(&mut self) -> bool {
        !std::mem::replace(&mut self.scheduled, true)
    }

    /// Returns the scheduled LCTRL message (if any), clearing the request
    pub fn take_scheduled(&mut self) -> Option<LinkControlMessage> {
        if std::mem::replace(&mut self.scheduled, false) {
            Some(self.local_message(false))
        }
        else {
            None
        }
    }

    pub fn local_message(&self, closing: bool) -> LinkControlMessage {
        let mut flags = LinkControlFlags::empty();
        if self.peer.is_some() {
            flags |= LinkControlFlags::PEER_SEEN;
        }
        if closing {
            flags |= LinkControlFlags::CLOSING;
        }

        LinkControlMessage {
            flags,
            params: self.local,
        }
    }

    pub fn on_peer_link_control(&mut self, msg: &LinkControlMessage) -> PeerLinkControlOutcome {
        let mut outcome = PeerLinkControlOutcome::default();

        if msg.flags.contains(LinkControlFlags::CLOSING) {
            debug!("peer is closing the link");
            outcome.peer_closing = true;
            return outcome;
        }

        match self.peer {
            None => {
                let negotiated = self.local.min(&msg.params);
                info!("negotiated link parameters {:?} (local {:?}, peer {:?})", negotiated, self.local, msg.params);
                self.peer = Some(msg.params);
                self.negotiated = Some(negotiated);
                outcome.newly_negotiated = Some(negotiated);
            }
            Some(peer) if peer != msg.params => {
                warn!("peer sent link parameters {:?} different from previously negotiated {:?} - ignoring", msg.params, peer);
            }
            Some(_) => {}
        }

        outcome.reply = !msg.flags.contains(LinkControlFlags::PEER_SEEN);
        outcome
    }

    pub fn local(&self) -> LinkParameters {
        self.local
    }

    pub fn negotiated(&self) -> Option<LinkParameters> {
        self.negotiated
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated.is_some()
    }

    /// the negotiated parameters, or the local parameters while negotiation is pending
    pub fn effective(&self) -> LinkParameters {
        self.negotiated.unwrap_or(self.local)
    }
}

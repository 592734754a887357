//! SLAP (Serial Link Async Protocol) turns a raw, non-blocking and potentially lossy duplex
//!  byte channel (typically a UART) into a reliable, ordered, flow-controlled byte stream.
//!
//! ## Design goals
//!
//! * Point-to-point over a single physical duplex channel, with no dedicated client or server.
//!   Both sides run the same state machine
//! * The abstraction is a *byte stream* with the same push / pull contract as the raw link
//!   beneath it: `push` accepts as many bytes as fit and never blocks, `pull` returns whatever
//!   is available, waiting up to a timeout
//! * Byte-exact, in-order delivery despite drops, corruption, duplication and reordering on the
//!   wire
//!   * every frame carries a CRC; frames failing it are dropped silently
//!   * DATA frames are numbered (16 bit, wrapping) and acknowledged cumulatively. Unacknowledged
//!     frames are re-sent on timeout with exponential backoff
//!   * a receiver that sees a gap sends a NACK to trigger a fast retransmit
//! * Flow control by a sliding window: there are never more than `window_size` frames of at
//!   most `packet_size` bytes outstanding
//! * Packet size, window size and baud rate are negotiated at startup: both sides announce their
//!   local values, and the element-wise minimum is used. Parameters are frozen once negotiated
//! * I/O readiness callbacks and retransmission timers race against each other; all state
//!   mutation is serialized through a single link-scoped lock that is never held across an
//!   `.await` or while calling into the raw link's readiness futures
//! * The engine does not own the physical device. Raw link, timer service and I/O dispatcher are
//!   injected, so the engine runs (and is tested) over an in-memory link
//!
//! ## Wire format
//!
//! Frames are delimited and byte-stuffed SLIP style:
//!
//! ```ascii
//! frame   := END stuffed(content) END
//!              END = 0xC0, ESC = 0xDB; 0xC0 -> ESC 0xDC, 0xDB -> ESC 0xDD
//!
//! content (all numbers in network byte order (BE)):
//!  0: kind (u8)
//!     * 0 DATA
//!     * 1 ACK
//!     * 2 NACK
//!     * 3 LCTRL (link control)
//!  1: sequence number (u16) - meaningful for DATA only
//!  3: ack (u16) - the last sequence number received in order. Piggybacked on DATA frames
//!  5: payload length (u16)
//!  7: payload
//!  *: CRC-16/IBM-3740 (u16) over everything from 'kind' up to the end of the payload
//! ```
//!
//! ## Link control
//!
//! The payload of an LCTRL frame is
//!
//! ```ascii
//! 0: protocol version (u8)
//! 1: flags (u8)
//!    * bit 0: PEER_SEEN - the sender has already received the receiver's link parameters
//!    * bit 1: CLOSING - the sender shuts the stream down
//! 2: packet size (u16)
//! 4: window size (u8)
//! 5: baud rate (u32)
//! ```
//!
//! LCTRL frames are re-sent periodically until the peer's parameters were observed. An LCTRL
//!  without PEER_SEEN is always answered, so a lost reply does not stall negotiation.

pub mod buf_ext;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod frame_codec;
pub mod link_control;
pub mod link_controller;
mod link_state;
pub mod loopback;
pub mod raw_link;
pub mod receive_reassembler;
pub mod sequence;
pub mod slap_stream;
pub mod timer;
pub mod window_sender;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}

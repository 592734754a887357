use std::cmp::min;

use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::sequence::SeqNum;

#[derive(Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The frame was the expected one. Its payload and all frames that became contiguous by it
    ///  were appended to the application buffer.
    Delivered { num_bytes: usize },
    /// The frame is in the receive window but ahead of a gap
    Buffered,
    /// The frame was received before
    Duplicate,
    OutOfWindow,
    /// The frame is the expected one, but the application buffer is full. It is dropped, and the
    ///  sender is asked to re-send it once the application made room (see
    ///  [ReceiveReassembler::take_reopened]).
    Rejected,
}

/// Receive side of the sliding window: it tracks the next expected sequence number, buffers
///  frames that arrive ahead of a gap, and appends contiguous payload to the application buffer.
pub struct ReceiveReassembler {
    expected: SeqNum,
    window_size: u16,
    out_of_order: FxHashMap<SeqNum, Bytes>,

    app_buffer: BytesMut,
    max_app_bytes: usize,

    /// the value of `expected` for which a NACK was sent - there is one NACK per gap
    nacked_at: Option<SeqNum>,
    /// payload size of the most recent frame that was rejected for lack of buffer space
    rejected_len: Option<usize>,
}

impl ReceiveReassembler {
    pub fn new(window_size: u8, max_app_bytes: usize) -> ReceiveReassembler {
        ReceiveReassembler {
            expected: SeqNum::ZERO,
            window_size: window_size as u16,
            out_of_order: FxHashMap::default(),
            app_buffer: BytesMut::new(),
            max_app_bytes,
            nacked_at: None,
            rejected_len: None,
        }
    }

    pub fn set_window_size(&mut self, window_size: u8) {
        self.window_size = window_size as u16;
    }

    pub fn on_frame(&mut self, seq: SeqNum, payload: Bytes) -> ReceiveOutcome {
        let offset = seq.distance_from(self.expected);

        if offset == 0 {
            if self.app_buffer.len() + payload.len() > self.max_app_bytes {
                debug!("application buffer is full - dropping DATA #{}", seq);
                self.rejected_len = Some(payload.len());
                return ReceiveOutcome::Rejected;
            }

            self.rejected_len = None;
            let mut num_bytes = self.deliver(payload);
            num_bytes += self.drain_contiguous();
            return ReceiveOutcome::Delivered { num_bytes };
        }

        if offset < self.window_size {
            if self.out_of_order.contains_key(&seq) {
                trace!("DATA #{} is already buffered", seq);
                return ReceiveOutcome::Duplicate;
            }
            trace!("buffering DATA #{} out of order, expecting #{}", seq, self.expected);
            self.out_of_order.insert(seq, payload);
            return ReceiveOutcome::Buffered;
        }

        // a frame from the previous window is a retransmission of something that was delivered
        //  already, but whose ack did not make it to the sender
        if self.expected.distance_from(seq) <= self.window_size {
            trace!("duplicate DATA #{}, expecting #{}", seq, self.expected);
            ReceiveOutcome::Duplicate
        }
        else {
            debug!("DATA #{} is outside the receive window (expecting #{}) - dropping", seq, self.expected);
            ReceiveOutcome::OutOfWindow
        }
    }

    fn deliver(&mut self, payload: Bytes) -> usize {
        trace!("delivering DATA #{} with {} bytes", self.expected, payload.len());
        self.app_buffer.extend_from_slice(&payload);
        self.expected = self.expected.next();
        payload.len()
    }

    /// Moves buffered frames to the application buffer as long as they are contiguous and fit
    fn drain_contiguous(&mut self) -> usize {
        let mut num_bytes = 0;
        while let Some(len) = self.out_of_order.get(&self.expected).map(|p| p.len()) {
            if self.app_buffer.len() + len > self.max_app_bytes {
                break;
            }
            if let Some(payload) = self.out_of_order.remove(&self.expected) {
                num_bytes += self.deliver(payload);
            }
        }
        num_bytes
    }

    /// true if there is a gap that was not NACKed yet. The NACK is for the last in-order
    ///  position, i.e. the frame after it is missing.
    pub fn should_nack(&mut self) -> bool {
        if self.out_of_order.is_empty() || self.nacked_at == Some(self.expected) {
            return false;
        }
        self.nacked_at = Some(self.expected);
        true
    }

    /// The sequence number of the last frame that was received in order. This is what is
    ///  acknowledged.
    pub fn last_in_order(&self) -> SeqNum {
        self.expected.prev()
    }

    pub fn expected(&self) -> SeqNum {
        self.expected
    }

    /// Moves up to `buf.len()` bytes to `buf`, returning the number of bytes
    pub fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = min(buf.len(), self.app_buffer.len());
        self.app_buffer.copy_to_slice(&mut buf[..n]);
        if n > 0 {
            self.drain_contiguous();
        }
        n
    }

    /// true (once) if a frame was rejected for lack of buffer space, and taking data made room
    ///  for it
    pub fn take_reopened(&mut self) -> bool {
        match self.rejected_len {
            Some(len) if self.app_buffer.len() + len <= self.max_app_bytes => {
                debug!("application buffer has room again");
                self.rejected_len = None;
                true
            }
            _ => false,
        }
    }

    /// Number of bytes that can be taken
    pub fn available(&self) -> usize {
        self.app_buffer.len()
    }

    pub fn num_out_of_order(&self) -> usize {
        self.out_of_order.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(b: u8, len: usize) -> Bytes {
        Bytes::from(vec![b; len])
    }

    fn take_all(reassembler: &mut ReceiveReassembler) -> Vec<u8> {
        let mut buf = vec![0u8; reassembler.available()];
        let n = reassembler.take(&mut buf);
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_in_order() {
        let mut reassembler = ReceiveReassembler::new(4, 1000);
        assert_eq!(reassembler.last_in_order(), SeqNum::from_raw(u16::MAX));

        assert_eq!(reassembler.on_frame(SeqNum::from_raw(0), payload(1, 3)), ReceiveOutcome::Delivered { num_bytes: 3 });
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(1), payload(2, 2)), ReceiveOutcome::Delivered { num_bytes: 2 });
        assert_eq!(reassembler.last_in_order(), SeqNum::from_raw(1));
        assert_eq!(take_all(&mut reassembler), vec![1, 1, 1, 2, 2]);
        assert!(!reassembler.should_nack());
    }

    #[test]
    fn test_reorder_and_gap_fill() {
        let mut reassembler = ReceiveReassembler::new(4, 1000);

        assert_eq!(reassembler.on_frame(SeqNum::from_raw(2), payload(3, 1)), ReceiveOutcome::Buffered);
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(1), payload(2, 1)), ReceiveOutcome::Buffered);
        assert_eq!(reassembler.available(), 0);
        assert!(reassembler.should_nack());
        assert!(!reassembler.should_nack());

        assert_eq!(reassembler.on_frame(SeqNum::from_raw(0), payload(1, 1)), ReceiveOutcome::Delivered { num_bytes: 3 });
        assert_eq!(reassembler.num_out_of_order(), 0);
        assert_eq!(take_all(&mut reassembler), vec![1, 2, 3]);
        assert_eq!(reassembler.last_in_order(), SeqNum::from_raw(2));
    }

    #[test]
    fn test_nack_once_per_gap() {
        let mut reassembler = ReceiveReassembler::new(4, 1000);
        reassembler.on_frame(SeqNum::from_raw(1), payload(0, 1));
        assert!(reassembler.should_nack());
        reassembler.on_frame(SeqNum::from_raw(2), payload(0, 1));
        assert!(!reassembler.should_nack());

        reassembler.on_frame(SeqNum::from_raw(0), payload(0, 1));
        reassembler.on_frame(SeqNum::from_raw(4), payload(0, 1));
        assert!(reassembler.should_nack());
    }

    #[rstest]
    #[case::already_delivered(1, ReceiveOutcome::Duplicate)]
    #[case::oldest_in_previous_window(u16::MAX, ReceiveOutcome::Duplicate)]
    #[case::before_previous_window(u16::MAX - 1, ReceiveOutcome::OutOfWindow)]
    #[case::just_beyond_window(7, ReceiveOutcome::OutOfWindow)]
    #[case::far_ahead(1000, ReceiveOutcome::OutOfWindow)]
    #[case::far_behind(30000, ReceiveOutcome::OutOfWindow)]
    fn test_outside_window(#[case] seq: u16, #[case] expected: ReceiveOutcome) {
        let mut reassembler = ReceiveReassembler::new(4, 1000);
        for s in 0..3 {
            reassembler.on_frame(SeqNum::from_raw(s), payload(0, 1));
        }

        assert_eq!(reassembler.on_frame(SeqNum::from_raw(seq), payload(9, 1)), expected);
        assert_eq!(reassembler.available(), 3);
        assert_eq!(reassembler.num_out_of_order(), 0);
    }

    #[test]
    fn test_duplicate_out_of_order() {
        let mut reassembler = ReceiveReassembler::new(4, 1000);
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(2), payload(3, 1)), ReceiveOutcome::Buffered);
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(2), payload(3, 1)), ReceiveOutcome::Duplicate);
        assert_eq!(reassembler.num_out_of_order(), 1);
    }

    #[test]
    fn test_wrap_around() {
        let mut reassembler = ReceiveReassembler::new(4, 1000);
        reassembler.expected = SeqNum::from_raw(u16::MAX);

        assert_eq!(reassembler.on_frame(SeqNum::from_raw(0), payload(2, 1)), ReceiveOutcome::Buffered);
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(u16::MAX), payload(1, 1)), ReceiveOutcome::Delivered { num_bytes: 2 });
        assert_eq!(reassembler.last_in_order(), SeqNum::from_raw(0));
    }

    #[test]
    fn test_app_buffer_limit() {
        let mut reassembler = ReceiveReassembler::new(4, 10);
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(0), payload(1, 8)), ReceiveOutcome::Delivered { num_bytes: 8 });
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(1), payload(2, 8)), ReceiveOutcome::Rejected);
        assert_eq!(reassembler.last_in_order(), SeqNum::from_raw(0));

        // buffered frames wait until there is room
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(2), payload(3, 2)), ReceiveOutcome::Buffered);

        let mut buf = [0u8; 8];
        assert_eq!(reassembler.take(&mut buf[..1]), 1);
        assert!(!reassembler.take_reopened());
        assert_eq!(reassembler.take(&mut buf), 7);
        assert!(reassembler.take_reopened());
        assert!(!reassembler.take_reopened());
        assert_eq!(reassembler.on_frame(SeqNum::from_raw(1), payload(2, 8)), ReceiveOutcome::Delivered { num_bytes: 10 });
        assert_eq!(take_all(&mut reassembler), vec![2, 2, 2, 2, 2, 2, 2, 2, 3, 3]);
    }

    #[test]
    fn test_take_partial() {
        let mut reassembler = ReceiveReassembler::new(4, 1000);
        reassembler.on_frame(SeqNum::from_raw(0), Bytes::from_static(b"AAAAABBBBBCCCCCDDDDD"));

        let mut buf = [0u8; 12];
        assert_eq!(reassembler.take(&mut buf), 12);
        assert_eq!(&buf, b"AAAAABBBBBCC");
        let mut buf = [0u8; 8];
        assert_eq!(reassembler.take(&mut buf), 8);
        assert_eq!(&buf, b"CCCDDDDD");
        assert_eq!(reassembler.take(&mut buf), 0);
    }
}

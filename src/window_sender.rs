use std::cmp::min;
use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::SlapConfig;
use crate::frame::Frame;
use crate::link_control::LinkParameters;
use crate::sequence::SeqNum;

struct OutstandingFrame {
    seq: SeqNum,
    payload: Bytes,
    sent_at: Instant,
    retries: u32,
    timeout: Duration,
}

#[derive(Debug, Eq, PartialEq)]
pub enum TimeoutOutcome {
    /// The frame was acknowledged in the meantime
    NotOutstanding,
    Resend {
        frame: Frame,
        timeout: Duration,
    },
    /// The frame was re-sent `retries` times without being acknowledged
    LinkDead {
        retries: u32,
    },
}

/// Send side of the sliding window.
///
/// Bytes accepted from the application are held in an 'unsent' buffer until there is a free slot
///  in the window, at which point they are cut into DATA frames of at most `packet_size` bytes.
///  Sent frames stay in the window until they are acknowledged (cumulatively), and they are
///  re-sent with exponential backoff when their timer expires.
///
/// The sender has no timers of its own: it returns the timeout for each frame it hands out, and
///  the owner arms a timer and calls [WindowSender::on_timeout] when it fires.
pub struct WindowSender {
    params: LinkParameters,
    negotiated: bool,

    base_timeout: Duration,
    max_timeout: Duration,
    max_retries: u32,
    initial_timeout: Duration,

    next_seq: SeqNum,
    window: VecDeque<OutstandingFrame>,
    outstanding_bytes: usize,
    unsent: BytesMut,
}

impl WindowSender {
    pub fn new(config: &SlapConfig) -> WindowSender {
        let params = config.local_link_parameters();
        let mut result = WindowSender {
            params,
            negotiated: false,
            base_timeout: config.base_retransmit_timeout,
            max_timeout: config.max_retransmit_timeout,
            max_retries: config.max_retries,
            initial_timeout: config.base_retransmit_timeout,
            next_seq: SeqNum::ZERO,
            window: VecDeque::with_capacity(params.window_size as usize),
            outstanding_bytes: 0,
            unsent: BytesMut::with_capacity(params.max_unacked_bytes()),
        };
        result.initial_timeout = result.calc_initial_timeout();
        result
    }

    /// The base timeout plus the time for a full window of frames to go back and forth
    fn calc_initial_timeout(&self) -> Duration {
        let window_bytes = self.params.window_size as usize * (self.params.packet_size as usize + Frame::OVERHEAD);
        let round_trip = 2 * self.params.transmit_duration(window_bytes);
        min(self.base_timeout + round_trip, self.max_timeout)
    }

    /// Switches to negotiated parameters, enabling DATA frames to be sent
    pub fn set_parameters(&mut self, params: LinkParameters) {
        self.params = params;
        self.negotiated = true;
        self.initial_timeout = self.calc_initial_timeout();
        debug!("send window: {} frames of up to {} bytes, initial retransmit timeout {:?}", params.window_size, params.packet_size, self.initial_timeout);
    }

    pub fn initial_timeout(&self) -> Duration {
        self.initial_timeout
    }

    /// Number of bytes that can currently be accepted
    pub fn capacity(&self) -> usize {
        self.params.max_unacked_bytes()
            .saturating_sub(self.unsent.len() + self.outstanding_bytes)
    }

    /// Accepts as many bytes as there is capacity for, returning the number of bytes accepted
    pub fn accept(&mut self, data: &[u8]) -> usize {
        let n = min(self.capacity(), data.len());
        self.unsent.extend_from_slice(&data[..n]);
        trace!("accepted {} of {} bytes, {} unsent", n, data.len(), self.unsent.len());
        n
    }

    /// Cuts the next DATA frame from unsent data if the window has room for it, returning the
    ///  frame and its retransmission timeout
    pub fn next_frame(&mut self, ack: SeqNum, now: Instant) -> Option<(Frame, Duration)> {
        if !self.negotiated || self.unsent.is_empty() || self.window.len() >= self.params.window_size as usize {
            return None;
        }

        let len = min(self.unsent.len(), self.params.packet_size as usize);
        let payload = self.unsent.split_to(len).freeze();
        let seq = self.next_seq;
        self.next_seq = seq.next();

        self.outstanding_bytes += payload.len();
        self.window.push_back(OutstandingFrame {
            seq,
            payload: payload.clone(),
            sent_at: now,
            retries: 0,
            timeout: self.initial_timeout,
        });

        trace!("sending DATA #{} with {} bytes", seq, len);
        Some((Frame::data(seq, ack, payload), self.initial_timeout))
    }

    /// Cumulative acknowledgement of everything up to and including `ack`. Returns the sequence
    ///  numbers of retired frames, which is empty for an ack that does not refer to an outstanding
    ///  frame (e.g. a duplicate).
    pub fn on_ack(&mut self, ack: SeqNum, now: Instant) -> Vec<SeqNum> {
        let base = match self.window.front() {
            Some(f) => f.seq,
            None => return Vec::new(),
        };

        let num_acked = ack.distance_from(base) as usize + 1;
        if num_acked > self.window.len() {
            trace!("ack #{} does not refer to an outstanding frame (window starts at #{}) - ignoring", ack, base);
            return Vec::new();
        }

        let mut retired = Vec::with_capacity(num_acked);
        for f in self.window.drain(..num_acked) {
            trace!("frame #{} acknowledged after {:?}", f.seq, now.saturating_duration_since(f.sent_at));
            self.outstanding_bytes -= f.payload.len();
            retired.push(f.seq);
        }

        // progress: the link works, so frames still in the window start over
        for f in self.window.iter_mut() {
            f.retries = 0;
            f.timeout = self.initial_timeout;
        }

        retired
    }

    /// An explicit ACK for the position just before the window means the peer is alive but did
    ///  not accept the next frame, e.g. because its application buffer is full. Retry counters
    ///  start over, timeouts keep their backoff. Returns true if the ack was of that kind.
    pub fn on_duplicate_ack(&mut self, ack: SeqNum) -> bool {
        match self.window.front() {
            Some(f) if f.seq.prev() == ack => {}
            _ => return false,
        }
        trace!("duplicate ack #{} - peer is alive, resetting retries", ack);
        for f in self.window.iter_mut() {
            f.retries = 0;
        }
        true
    }

    /// A NACK acknowledges everything up to `nack` and signals that the frame after it is
    ///  missing, triggering a resend of that frame without waiting for its timer.
    pub fn on_nack(&mut self, nack: SeqNum, ack: SeqNum, now: Instant) -> (Vec<SeqNum>, Option<(Frame, Duration)>) {
        let retired = self.on_ack(nack, now);

        let missing = nack.next();
        let resend = self.window.iter_mut()
            .find(|f| f.seq == missing)
            .map(|f| {
                debug!("NACK for #{} - fast retransmit", f.seq);
                f.sent_at = now;
                (Frame::data(f.seq, ack, f.payload.clone()), f.timeout)
            });

        (retired, resend)
    }

    pub fn on_timeout(&mut self, seq: SeqNum, ack: SeqNum, now: Instant) -> TimeoutOutcome {
        let max_retries = self.max_retries;
        let max_timeout = self.max_timeout;

        let Some(f) = self.window.iter_mut().find(|f| f.seq == seq) else {
            return TimeoutOutcome::NotOutstanding;
        };

        if f.retries >= max_retries {
            return TimeoutOutcome::LinkDead { retries: f.retries };
        }

        f.retries += 1;
        f.timeout = min(2 * f.timeout, max_timeout);
        f.sent_at = now;
        debug!("retransmitting #{} (retry {}), next timeout {:?}", f.seq, f.retries, f.timeout);

        TimeoutOutcome::Resend {
            frame: Frame::data(f.seq, ack, f.payload.clone()),
            timeout: f.timeout,
        }
    }

    /// Drops all outstanding and unsent data
    pub fn clear(&mut self) {
        self.window.clear();
        self.outstanding_bytes = 0;
        self.unsent.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    pub fn outstanding_seqs(&self) -> impl Iterator<Item = SeqNum> + '_ {
        self.window.iter().map(|f| f.seq)
    }

    /// true if all accepted data was sent and acknowledged
    pub fn is_idle(&self) -> bool {
        self.window.is_empty() && self.unsent.is_empty()
    }
}

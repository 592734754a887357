use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::SlapConfig;
use crate::error::{SlapError, SlapResult};
use crate::frame::{Frame, FrameKind};
use crate::frame_codec::FrameCodec;
use crate::link_control::{LinkControlFlags, LinkControlMessage, LinkControlNegotiator, LinkParameters};
use crate::raw_link::{LinkStatus, RawLink};
use crate::receive_reassembler::{ReceiveOutcome, ReceiveReassembler};
use crate::sequence::SeqNum;
use crate::timer::{TimerHandle, TimerService};
use crate::window_sender::{TimeoutOutcome, WindowSender};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    /// Waiting for the peer's link parameters. Data can be pushed, but is not sent yet.
    Negotiating,
    Open,
    /// Closed locally or by the peer. Data that was received before can still be pulled.
    Closed,
    /// The raw link failed, or the peer stopped acknowledging
    Dead,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Dead)
    }
}

/// Timer expirations are routed back into the link state as events. The epoch identifies the
///  arming of a timer, so an expiration for a timer that was cancelled or re-armed is recognized
///  and ignored.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TimerEvent {
    Retransmit { seq: SeqNum, epoch: u64 },
    LinkControl { epoch: u64 },
}

pub(crate) type TimerEventSink = Arc<dyn Fn(TimerEvent) + Send + Sync>;

#[derive(Debug)]
pub(crate) enum LinkEvent<'a> {
    BytesReceived(&'a [u8]),
    Timer(TimerEvent),
    EndOfStream,
    LinkFailure(std::io::ErrorKind),
    SinkWritable,
    ScheduleLinkControl,
    Close,
}

/// The complete protocol state of a single link, without any locking or I/O of its own. The
///  owner serializes access, calls [LinkState::flush] after every mutation, and handles the
///  'wake' and 'sink blocked' signals.
pub(crate) struct LinkState {
    status: StreamState,
    dead_reason: Option<String>,

    codec: FrameCodec,
    negotiator: LinkControlNegotiator,
    sender: WindowSender,
    receiver: ReceiveReassembler,
    link_control_interval: Duration,

    /// the stream was closed by the application rather than by the peer
    closed_locally: bool,
    close_retries: u32,
    close_retries_left: u32,

    /// encoded frames waiting to be pushed to the raw link
    outbound: VecDeque<Bytes>,
    /// the front frame of `outbound` was pushed partially, so nothing may go before it
    front_partial: bool,

    timer_service: Arc<dyn TimerService>,
    on_timer: TimerEventSink,
    retransmit_timers: FxHashMap<SeqNum, (u64, TimerHandle)>,
    link_control_timer: Option<(u64, TimerHandle)>,
    next_epoch: u64,

    wake_pending: bool,
    sink_blocked: bool,
}

impl LinkState {
    pub fn new(config: &SlapConfig, timer_service: Arc<dyn TimerService>, on_timer: TimerEventSink) -> LinkState {
        let local = config.local_link_parameters();
        LinkState {
            status: StreamState::Negotiating,
            dead_reason: None,
            codec: FrameCodec::new(Self::max_frame_payload(&local)),
            negotiator: LinkControlNegotiator::new(local),
            sender: WindowSender::new(config),
            receiver: ReceiveReassembler::new(local.window_size, config.max_buffered_receive_bytes),
            link_control_interval: config.link_control_interval,
            closed_locally: false,
            close_retries: config.close_retries,
            close_retries_left: 0,
            outbound: VecDeque::new(),
            front_partial: false,
            timer_service,
            on_timer,
            retransmit_timers: FxHashMap::default(),
            link_control_timer: None,
            next_epoch: 0,
            wake_pending: false,
            sink_blocked: false,
        }
    }

    /// LCTRL frames must be decodable regardless of packet size
    fn max_frame_payload(params: &LinkParameters) -> usize {
        (params.packet_size as usize).max(LinkControlMessage::SERIALIZED_LEN)
    }

    pub fn status(&self) -> StreamState {
        self.status
    }

    pub fn link_parameters(&self) -> Option<LinkParameters> {
        self.negotiator.negotiated()
    }

    pub fn available(&self) -> usize {
        self.receiver.available()
    }

    pub fn handle(&mut self, event: LinkEvent) {
        trace!("handling {:?} in state {:?}", event, self.status);
        match event {
            LinkEvent::BytesReceived(raw) => self.on_bytes_received(raw),
            LinkEvent::Timer(TimerEvent::Retransmit { seq, epoch }) => self.on_retransmit_timer(seq, epoch),
            LinkEvent::Timer(TimerEvent::LinkControl { epoch }) => self.on_link_control_timer(epoch),
            LinkEvent::EndOfStream => self.on_peer_closed("end of stream on raw link", false),
            LinkEvent::LinkFailure(kind) => self.die(format!("raw link failed: {:?}", kind)),
            LinkEvent::SinkWritable => self.sink_blocked = false,
            LinkEvent::ScheduleLinkControl => self.schedule_link_control(),
            LinkEvent::Close => self.close(),
        }
    }

    /// Accepts as many bytes for sending as the window allows
    pub fn push(&mut self, data: &[u8]) -> SlapResult<usize> {
        match self.status {
            StreamState::Closed => return Err(SlapError::Closed),
            StreamState::Dead => return Err(self.dead_error()),
            _ => {}
        }

        let n = self.sender.accept(data);
        self.pump();
        Ok(n)
    }

    /// Takes received data. `None` means there is none yet and the stream is not terminal.
    pub fn take(&mut self, buf: &mut [u8]) -> SlapResult<Option<usize>> {
        if self.status == StreamState::Dead {
            return Err(self.dead_error());
        }
        if self.receiver.available() > 0 || buf.is_empty() {
            let last_in_order = self.receiver.last_in_order();
            let n = self.receiver.take(buf);
            self.after_take(last_in_order);
            return Ok(Some(n));
        }
        if self.status == StreamState::Closed {
            return Err(SlapError::Closed);
        }
        Ok(None)
    }

    /// Taking data can make room for frames that were dropped or held back for lack of buffer
    ///  space, and the sender should know without waiting for its next retransmission
    fn after_take(&mut self, prev_last_in_order: SeqNum) {
        if self.status != StreamState::Open {
            return;
        }
        if self.receiver.take_reopened() {
            self.enqueue_back(&Frame::nack(self.receiver.last_in_order()));
        }
        else if self.receiver.last_in_order() != prev_last_in_order {
            self.enqueue_back(&Frame::ack(self.receiver.last_in_order()));
        }
    }

    /// Number of bytes `push` would accept right now
    pub fn send_capacity(&self) -> SlapResult<usize> {
        match self.status {
            StreamState::Closed => Err(SlapError::Closed),
            StreamState::Dead => Err(self.dead_error()),
            _ => Ok(self.sender.capacity()),
        }
    }

    /// The error that `pull` returns once all data was taken, if the stream is terminal
    pub fn terminal_error(&self) -> Option<SlapError> {
        match self.status {
            StreamState::Closed => Some(SlapError::Closed),
            StreamState::Dead => Some(self.dead_error()),
            _ => None,
        }
    }

    fn dead_error(&self) -> SlapError {
        SlapError::LinkDead(self.dead_reason.clone().unwrap_or_default())
    }

    /// Sends an LCTRL frame, re-sending it periodically until the peer's parameters arrive. This
    ///  is a no-op while periodic re-sending is active.
    fn schedule_link_control(&mut self) {
        if self.status.is_terminal() || self.link_control_timer.is_some() {
            return;
        }
        if self.negotiator.schedule() {
            self.pump();
        }
    }

    fn close(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        debug!("closing stream");

        self.enqueue_closing();
        self.terminate(StreamState::Closed);

        // re-sent until the peer confirms
        self.closed_locally = true;
        self.close_retries_left = self.close_retries;
        if self.close_retries_left > 0 {
            self.arm_link_control_timer();
        }
    }

    fn enqueue_closing(&mut self) {
        let msg = self.negotiator.local_message(true);
        self.enqueue_back(&msg.to_frame());
    }

    fn resend_closing(&mut self) {
        if self.status != StreamState::Closed || self.close_retries_left == 0 {
            return;
        }
        self.close_retries_left -= 1;
        debug!("no close confirmation from peer - re-sending closing link control frame ({} more)", self.close_retries_left);
        self.enqueue_closing();
        if self.close_retries_left > 0 {
            self.arm_link_control_timer();
        }
    }

    fn stop_closing_resends(&mut self) {
        self.close_retries_left = 0;
        if let Some((_, handle)) = self.link_control_timer.take() {
            self.timer_service.cancel(handle);
        }
    }

    /// `confirm` answers the peer's closing frame, so the peer can stop re-sending it
    fn on_peer_closed(&mut self, reason: &str, confirm: bool) {
        if self.status.is_terminal() {
            return;
        }
        info!("peer closed the stream: {}", reason);
        self.outbound.clear();
        self.front_partial = false;
        self.terminate(StreamState::Closed);
        if confirm {
            self.enqueue_closing();
        }
    }

    fn die(&mut self, reason: String) {
        if self.status == StreamState::Dead {
            return;
        }
        error!("link is dead: {}", reason);
        self.dead_reason = Some(reason);
        self.outbound.clear();
        self.front_partial = false;
        self.terminate(StreamState::Dead);
    }

    fn terminate(&mut self, status: StreamState) {
        self.status = status;
        self.sender.clear();
        self.cancel_all_timers();
        self.wake_pending = true;
    }

    fn cancel_all_timers(&mut self) {
        for (_, (_, handle)) in self.retransmit_timers.drain() {
            self.timer_service.cancel(handle);
        }
        if let Some((_, handle)) = self.link_control_timer.take() {
            self.timer_service.cancel(handle);
        }
    }

    fn on_bytes_received(&mut self, raw: &[u8]) {
        match self.status {
            StreamState::Dead => {
                trace!("ignoring {} bytes received on a dead stream", raw.len());
                return;
            }
            StreamState::Closed => {
                self.on_bytes_received_after_close(raw);
                return;
            }
            _ => {}
        }

        let now = Instant::now();
        let mut ack_required = false;
        let mut rejected = false;

        for frame in self.codec.decode(raw) {
            trace!("received frame {:?}", frame);
            match frame.kind {
                FrameKind::Data => {
                    self.on_ack(frame.ack, now);
                    let outcome = self.receiver.on_frame(frame.seq, frame.payload);
                    match outcome {
                        ReceiveOutcome::Delivered { .. } => {
                            self.wake_pending = true;
                            ack_required = true;
                        }
                        ReceiveOutcome::Rejected => {
                            ack_required = true;
                            rejected = true;
                        }
                        ReceiveOutcome::Buffered | ReceiveOutcome::Duplicate | ReceiveOutcome::OutOfWindow => {
                            ack_required = true;
                        }
                    }
                }
                FrameKind::Ack => {
                    if !self.on_ack(frame.ack, now) {
                        self.sender.on_duplicate_ack(frame.ack);
                    }
                }
                FrameKind::Nack => {
                    self.on_nack(frame.ack, now);
                }
                FrameKind::LinkControl => {
                    self.on_link_control_frame(frame.payload);
                    if self.status.is_terminal() {
                        return;
                    }
                }
            }
            if self.status == StreamState::Dead {
                return;
            }
        }

        let nack = ack_required && self.receiver.should_nack();
        let data_sent = self.pump();

        if nack {
            self.enqueue_back(&Frame::nack(self.receiver.last_in_order()));
        }
        else if ack_required && (rejected || !data_sent) {
            // DATA frames carry the ack already, but only an explicit ACK keeps the sender of a
            //  rejected frame from giving up
            self.enqueue_back(&Frame::ack(self.receiver.last_in_order()));
        }
    }

    /// A closed stream does not process frames any more, but it tells the peer about the close
    ///  until the peer confirms it
    fn on_bytes_received_after_close(&mut self, raw: &[u8]) {
        let mut peer_closing = false;
        let mut other_frames = false;
        for frame in self.codec.decode(raw) {
            if frame.kind == FrameKind::LinkControl && Self::is_closing(&frame.payload) {
                peer_closing = true;
            }
            else {
                other_frames = true;
            }
        }

        if self.closed_locally {
            if peer_closing {
                debug!("peer confirmed close");
                self.stop_closing_resends();
            }
            else if other_frames {
                trace!("peer is not aware of the close yet - answering with closing link control frame");
                self.enqueue_closing();
            }
        }
        else if peer_closing {
            // our confirmation was lost
            self.enqueue_closing();
        }
    }

    fn is_closing(payload: &Bytes) -> bool {
        LinkControlMessage::deser(&mut payload.clone())
            .map(|msg| msg.flags.contains(LinkControlFlags::CLOSING))
            .unwrap_or(false)
    }

    /// Returns true if frames were retired, which makes room in the send window
    fn on_ack(&mut self, ack: SeqNum, now: Instant) -> bool {
        let retired = self.sender.on_ack(ack, now);
        self.cancel_retransmit_timers(&retired);
        self.on_frames_retired(&retired)
    }

    fn on_frames_retired(&mut self, retired: &[SeqNum]) -> bool {
        if retired.is_empty() {
            return false;
        }
        self.wake_pending = true;
        true
    }

    fn on_nack(&mut self, nack: SeqNum, now: Instant) {
        let (retired, resend) = self.sender.on_nack(nack, self.receiver.last_in_order(), now);
        self.cancel_retransmit_timers(&retired);
        self.on_frames_retired(&retired);
        if let Some((frame, timeout)) = resend {
            self.arm_retransmit_timer(frame.seq, timeout);
            self.enqueue_back(&frame);
        }
    }

    fn cancel_retransmit_timers(&mut self, seqs: &[SeqNum]) {
        for seq in seqs {
            if let Some((_, handle)) = self.retransmit_timers.remove(seq) {
                self.timer_service.cancel(handle);
            }
        }
    }

    fn on_link_control_frame(&mut self, payload: Bytes) {
        let msg = match LinkControlMessage::deser(&mut payload.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping invalid link control frame: {}", e);
                return;
            }
        };
        debug!("received link control {:?}", msg);

        let outcome = self.negotiator.on_peer_link_control(&msg);
        if outcome.peer_closing {
            self.on_peer_closed("closing link control frame", true);
            return;
        }

        if let Some(params) = outcome.newly_negotiated {
            self.sender.set_parameters(params);
            self.receiver.set_window_size(params.window_size);
            self.codec.set_max_payload_len(Self::max_frame_payload(&params));
            self.status = StreamState::Open;
            self.wake_pending = true;

            if let Some((_, handle)) = self.link_control_timer.take() {
                self.timer_service.cancel(handle);
            }
        }

        if outcome.reply {
            self.negotiator.schedule();
        }
    }

    fn on_retransmit_timer(&mut self, seq: SeqNum, epoch: u64) {
        match self.retransmit_timers.get(&seq) {
            Some((e, _)) if *e == epoch => {
                self.retransmit_timers.remove(&seq);
            }
            _ => {
                trace!("stale retransmit timer for #{} - ignoring", seq);
                return;
            }
        }
        if self.status.is_terminal() {
            return;
        }

        match self.sender.on_timeout(seq, self.receiver.last_in_order(), Instant::now()) {
            TimeoutOutcome::NotOutstanding => {}
            TimeoutOutcome::Resend { frame, timeout } => {
                self.arm_retransmit_timer(frame.seq, timeout);
                self.enqueue_back(&frame);
            }
            TimeoutOutcome::LinkDead { retries } => {
                self.die(format!("frame #{} was not acknowledged after {} retries", seq, retries));
            }
        }
    }

    fn on_link_control_timer(&mut self, epoch: u64) {
        match self.link_control_timer {
            Some((e, _)) if e == epoch => self.link_control_timer = None,
            _ => return,
        }
        if self.closed_locally {
            self.resend_closing();
            return;
        }
        if !self.status.is_terminal() && !self.negotiator.is_negotiated() {
            debug!("no link control frame from peer yet - re-sending");
            self.schedule_link_control();
        }
    }

    fn new_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn arm_retransmit_timer(&mut self, seq: SeqNum, timeout: Duration) {
        let epoch = self.new_epoch();
        let sink = self.on_timer.clone();
        let handle = self.timer_service.schedule(timeout, Box::new(move || sink(TimerEvent::Retransmit { seq, epoch })));
        if let Some((_, prev)) = self.retransmit_timers.insert(seq, (epoch, handle)) {
            self.timer_service.cancel(prev);
        }
    }

    fn arm_link_control_timer(&mut self) {
        if self.link_control_timer.is_some() {
            return;
        }
        let epoch = self.new_epoch();
        let sink = self.on_timer.clone();
        let handle = self.timer_service.schedule(self.link_control_interval, Box::new(move || sink(TimerEvent::LinkControl { epoch })));
        self.link_control_timer = Some((epoch, handle));
    }

    /// Moves pending frames to the outbound queue: a scheduled LCTRL frame ahead of everything
    ///  else, and DATA frames as far as the window allows. Returns true if DATA frames were added.
    fn pump(&mut self) -> bool {
        if let Some(msg) = self.negotiator.take_scheduled() {
            trace!("sending link control {:?}", msg);
            self.enqueue_front(&msg.to_frame());
            if !self.negotiator.is_negotiated() {
                self.arm_link_control_timer();
            }
        }

        if self.status != StreamState::Open {
            return false;
        }

        let mut data_sent = false;
        let now = Instant::now();
        while let Some((frame, timeout)) = self.sender.next_frame(self.receiver.last_in_order(), now) {
            self.arm_retransmit_timer(frame.seq, timeout);
            self.enqueue_back(&frame);
            data_sent = true;
        }
        data_sent
    }

    fn enqueue_back(&mut self, frame: &Frame) {
        self.outbound.push_back(self.codec.encode(frame));
    }

    fn enqueue_front(&mut self, frame: &Frame) {
        let encoded = self.codec.encode(frame);
        if self.front_partial {
            self.outbound.insert(1, encoded);
        }
        else {
            self.outbound.push_front(encoded);
        }
    }

    /// Pushes queued frames to the raw link until it would block
    pub fn flush(&mut self, raw_link: &dyn RawLink) {
        if self.sink_blocked {
            return;
        }

        while let Some(front) = self.outbound.front_mut() {
            match raw_link.push(front) {
                LinkStatus::Ready(n) if n >= front.len() => {
                    self.outbound.pop_front();
                    self.front_partial = false;
                }
                LinkStatus::Ready(0) | LinkStatus::WouldBlock => {
                    trace!("raw link would block with {} frames queued", self.outbound.len());
                    self.sink_blocked = true;
                    return;
                }
                LinkStatus::Ready(n) => {
                    front.advance(n);
                    self.front_partial = true;
                }
                LinkStatus::EndOfStream => {
                    self.on_peer_closed("end of stream on raw link", false);
                    return;
                }
                LinkStatus::Failed(kind) if self.status == StreamState::Closed => {
                    // e.g. a closing frame re-sent after the raw link was shut down
                    debug!("raw link failed after close: {:?} - dropping {} queued frames", kind, self.outbound.len());
                    self.outbound.clear();
                    self.front_partial = false;
                    self.stop_closing_resends();
                    return;
                }
                LinkStatus::Failed(kind) => {
                    self.die(format!("raw link failed: {:?}", kind));
                    return;
                }
            }
        }
    }

    pub fn take_wake_pending(&mut self) -> bool {
        std::mem::take(&mut self.wake_pending)
    }

    pub fn is_sink_blocked(&self) -> bool {
        self.sink_blocked
    }

    #[cfg(test)]
    fn num_armed_timers(&self) -> usize {
        self.retransmit_timers.len() + self.link_control_timer.iter().count()
    }
}

impl Drop for LinkState {
    fn drop(&mut self) {
        self.cancel_all_timers();
    }
}

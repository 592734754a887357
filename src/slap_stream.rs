use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::config::SlapConfig;
use crate::error::{SlapError, SlapResult};
use crate::link_control::LinkParameters;
use crate::link_controller::LinkListener;
use crate::link_state::{LinkEvent, LinkState, TimerEvent, TimerEventSink};
pub use crate::link_state::StreamState;
use crate::raw_link::RawLink;
use crate::timer::TimerService;

struct LinkShared {
    raw_link: Arc<dyn RawLink>,
    runtime: Handle,
    state: Mutex<LinkState>,
    /// signalled when data arrives, when the send window gets room, when negotiation completes
    ///  and when the stream terminates
    state_changed: Notify,
    sink_waiter_active: AtomicBool,
}

impl LinkShared {
    /// Runs a state transition under the link's lock, pushing resulting frames to the raw link.
    ///  Waiters are woken after the lock is released.
    fn with_state<R>(self: &Arc<Self>, f: impl FnOnce(&mut LinkState) -> R) -> R {
        let (result, wake, sink_blocked) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut state);
            state.flush(self.raw_link.as_ref());
            (result, state.take_wake_pending(), state.is_sink_blocked())
        };

        if wake {
            self.state_changed.notify_waiters();
        }
        if sink_blocked {
            self.spawn_sink_waiter();
        }
        result
    }

    fn spawn_sink_waiter(self: &Arc<Self>) {
        if self.sink_waiter_active.swap(true, Ordering::AcqRel) {
            return;
        }

        trace!("waiting for raw link to become writable");
        let weak = Arc::downgrade(self);
        let raw_link = self.raw_link.clone();
        self.runtime.spawn(async move {
            raw_link.sink_ready().await;
            if let Some(shared) = weak.upgrade() {
                shared.sink_waiter_active.store(false, Ordering::Release);
                shared.with_state(|s| s.handle(LinkEvent::SinkWritable));
            }
        });
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365*24*3600))
}

/// A reliable, ordered byte stream on top of a [RawLink].
///
/// `push` never blocks and `pull` waits for data asynchronously. Incoming bytes are fed to the
///  stream through its [LinkListener] implementation, typically by a
///  [crate::link_controller::LinkController].
///
/// Cloning a stream gives another handle to the same stream.
#[derive(Clone)]
pub struct SlapStream {
    shared: Arc<LinkShared>,
}

impl SlapStream {
    /// Creates a stream and starts link parameter negotiation. This must be called inside a
    ///  tokio runtime.
    pub fn new(raw_link: Arc<dyn RawLink>, timer_service: Arc<dyn TimerService>, config: SlapConfig) -> anyhow::Result<SlapStream> {
        config.validate()?;
        let runtime = Handle::try_current()?;

        let shared = Arc::new_cyclic(|weak: &Weak<LinkShared>| {
            let weak = weak.clone();
            let on_timer: TimerEventSink = Arc::new(move |event: TimerEvent| {
                if let Some(shared) = weak.upgrade() {
                    shared.with_state(|s| s.handle(LinkEvent::Timer(event)));
                }
            });

            LinkShared {
                raw_link,
                runtime,
                state: Mutex::new(LinkState::new(&config, timer_service, on_timer)),
                state_changed: Notify::new(),
                sink_waiter_active: AtomicBool::new(false),
            }
        });

        let result = SlapStream { shared };
        result.schedule_link_control_packet();
        Ok(result)
    }

    /// Accepts as many bytes as the send window has room for, returning their number. This may be
    ///  less than `buf.len()`, including zero.
    pub fn push(&self, buf: &[u8]) -> SlapResult<usize> {
        self.shared.with_state(|s| s.push(buf))
    }

    /// Pulls up to `buf.len()` received bytes, waiting up to `timeout` for data to arrive. A
    ///  timeout of zero checks without waiting.
    ///
    /// After the stream was closed, data received before is still returned; `Closed` is returned
    ///  once it was consumed.
    pub async fn pull(&self, buf: &mut [u8], timeout: Duration) -> SlapResult<usize> {
        let deadline = deadline_after(timeout);

        loop {
            // register for notification *before* checking, so a wakeup in between is not lost
            let notified = self.shared.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.shared.with_state(|s| s.take(buf)).transpose() {
                return result;
            }
            if timeout.is_zero() {
                return Err(SlapError::TimedOut);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(SlapError::TimedOut);
            }
        }
    }

    /// Waits until `push` would accept at least one byte, returning the number of bytes it would
    ///  accept. Send window space becomes available when the peer acknowledges frames.
    pub async fn wait_writable(&self, timeout: Duration) -> SlapResult<usize> {
        let deadline = deadline_after(timeout);

        loop {
            let notified = self.shared.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let capacity = self.shared.with_state(|s| s.send_capacity())?;
            if capacity > 0 {
                return Ok(capacity);
            }
            if timeout.is_zero() {
                return Err(SlapError::TimedOut);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(SlapError::TimedOut);
            }
        }
    }

    /// Waits for link parameter negotiation to complete, returning the negotiated parameters
    pub async fn wait_negotiated(&self, timeout: Duration) -> SlapResult<LinkParameters> {
        let deadline = deadline_after(timeout);

        loop {
            let notified = self.shared.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = self.shared.with_state(|s| match (s.terminal_error(), s.link_parameters()) {
                (Some(e @ SlapError::LinkDead(_)), _) => Some(Err(e)),
                (_, Some(params)) => Some(Ok(params)),
                (Some(e), None) => Some(Err(e)),
                (None, None) => None,
            });
            if let Some(result) = outcome {
                return result;
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(SlapError::TimedOut);
            }
        }
    }

    /// Closes the stream and notifies the peer, re-sending the notification a few times until the
    ///  peer confirms it. Pending `pull` calls return (with `Closed` unless there is data), pending
    ///  retransmissions are cancelled. Idempotent.
    pub fn close(&self) {
        debug!("closing SLAP stream");
        self.shared.with_state(|s| s.handle(LinkEvent::Close));
    }

    /// Sends our link parameters to the peer, ahead of any pending data. This happens when the
    ///  stream is created, so there is usually no need to call it explicitly.
    pub fn schedule_link_control_packet(&self) {
        self.shared.with_state(|s| s.handle(LinkEvent::ScheduleLinkControl));
    }

    pub fn state(&self) -> StreamState {
        self.shared.with_state(|s| s.status())
    }

    pub fn link_parameters(&self) -> Option<LinkParameters> {
        self.shared.with_state(|s| s.link_parameters())
    }

    pub fn is_negotiated(&self) -> bool {
        self.link_parameters().is_some()
    }

    /// Number of received bytes that can be pulled without waiting
    pub fn available(&self) -> usize {
        self.shared.with_state(|s| s.available())
    }

    /// Flushes queued frames after the raw link signalled it can accept data again. Streams
    ///  detect this on their own, but an external dispatcher may know earlier.
    pub fn on_sink_writable(&self) {
        self.shared.with_state(|s| s.handle(LinkEvent::SinkWritable));
    }
}

impl LinkListener for SlapStream {
    fn on_bytes_received(&self, bytes: &[u8]) {
        self.shared.with_state(|s| s.handle(LinkEvent::BytesReceived(bytes)));
    }

    fn on_end_of_stream(&self) {
        self.shared.with_state(|s| s.handle(LinkEvent::EndOfStream));
    }

    fn on_link_failure(&self, kind: std::io::ErrorKind) {
        self.shared.with_state(|s| s.handle(LinkEvent::LinkFailure(kind)));
    }
}

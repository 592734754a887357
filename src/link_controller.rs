use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::dispatch::{ExitListener, IoDispatch, ReadListener, StreamId};
use crate::raw_link::{LinkStatus, RawLink};

/// Receives everything a [LinkController] reads from its raw link
#[cfg_attr(test, automock)]
pub trait LinkListener: Send + Sync + 'static {
    fn on_bytes_received(&self, bytes: &[u8]);

    /// The raw link signalled end-of-stream. There will be no further callbacks.
    fn on_end_of_stream(&self);

    /// Reading from the raw link failed. There will be no further callbacks.
    fn on_link_failure(&self, kind: std::io::ErrorKind);
}

/// A read callback pulls at most this many chunks of `read_buffer_size` before handing control
///  back to the dispatcher, so a continuously fed link does not monopolize it
const MAX_READS_PER_CALLBACK: usize = 4;

struct ControllerInner {
    raw_link: Arc<dyn RawLink>,
    listener: Arc<dyn LinkListener>,
    dispatch: Arc<dyn IoDispatch>,
    read_buffer_size: usize,
    stream_id: Mutex<Option<StreamId>>,
    started: AtomicBool,
    exited: watch::Sender<bool>,
}

impl ControllerInner {
    fn stream_id(&self) -> Option<StreamId> {
        *self.stream_id.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadListener for ControllerInner {
    fn read_callback(&self) {
        let mut received = BytesMut::new();
        let mut buf = vec![0u8; self.read_buffer_size];

        let mut num_reads = 0;
        let terminal = loop {
            if num_reads == MAX_READS_PER_CALLBACK {
                trace!("read limit per callback reached - yielding to the dispatcher");
                break None;
            }
            num_reads += 1;

            match self.raw_link.pull(&mut buf) {
                LinkStatus::Ready(0) | LinkStatus::WouldBlock => break None,
                LinkStatus::Ready(n) => received.extend_from_slice(&buf[..n]),
                status => break Some(status),
            }
        };

        // everything that was read in one go is handed over together so acknowledgements can be
        //  batched
        if !received.is_empty() {
            trace!("read {} bytes from raw link", received.len());
            self.listener.on_bytes_received(&received);
        }

        match terminal {
            Some(LinkStatus::EndOfStream) => {
                debug!("end of stream on raw link");
                self.listener.on_end_of_stream();
            }
            Some(LinkStatus::Failed(kind)) => {
                error!("reading from raw link failed: {:?}", kind);
                self.listener.on_link_failure(kind);
            }
            _ => {
                if let Some(id) = self.stream_id() {
                    if let Err(e) = self.dispatch.enable_read_callback(id) {
                        // the stream was stopped concurrently
                        debug!("not re-enabling read callback: {}", e);
                    }
                }
            }
        }
    }
}

impl ExitListener for ControllerInner {
    fn exit_callback(&self) {
        debug!("link controller exiting - closing raw link");
        self.raw_link.close();
        self.exited.send_replace(true);
    }
}

/// Glue between a dispatcher and a [LinkListener] (usually a [crate::slap_stream::SlapStream]):
///  it registers the raw link with the dispatcher, reads whatever the raw link has when the
///  dispatcher signals readiness, and re-enables its read subscription afterwards.
pub struct LinkController {
    inner: Arc<ControllerInner>,
}

impl LinkController {
    pub fn new(raw_link: Arc<dyn RawLink>, listener: Arc<dyn LinkListener>, dispatch: Arc<dyn IoDispatch>, read_buffer_size: usize) -> LinkController {
        LinkController {
            inner: Arc::new(ControllerInner {
                raw_link,
                listener,
                dispatch,
                read_buffer_size: read_buffer_size.max(1),
                stream_id: Mutex::new(None),
                started: AtomicBool::new(false),
                exited: watch::Sender::new(false),
            }),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut stream_id = self.inner.stream_id.lock().unwrap_or_else(PoisonError::into_inner);
        if stream_id.is_some() {
            bail!("link controller was already started");
        }
        if *self.inner.exited.borrow() {
            bail!("link controller was stopped and can not be restarted");
        }

        let id = self.inner.dispatch.start_stream(self.inner.raw_link.clone(), self.inner.clone(), self.inner.clone())?;
        *stream_id = Some(id);
        self.inner.started.store(true, Ordering::Release);
        drop(stream_id);

        self.inner.dispatch.enable_read_callback(id)?;
        debug!("link controller started on stream {}", id);
        Ok(())
    }

    /// Stops reading; the raw link is closed once the dispatcher is done with it
    pub fn stop(&self) -> anyhow::Result<()> {
        let id = self.inner.stream_id.lock().unwrap_or_else(PoisonError::into_inner).take();
        match id {
            Some(id) => self.inner.dispatch.stop_stream(id),
            None => {
                warn!("stopping a link controller that is not running");
                Ok(())
            }
        }
    }

    /// Waits until the controller has exited after `stop`. Returns immediately if the controller
    ///  was never started.
    pub async fn join(&self) {
        if !self.inner.started.load(Ordering::Acquire) {
            return;
        }
        let mut exited = self.inner.exited.subscribe();
        let _ = exited.wait_for(|e| *e).await;
    }

    pub fn has_exited(&self) -> bool {
        *self.inner.exited.borrow()
    }
}

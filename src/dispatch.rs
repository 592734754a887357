use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::raw_link::RawLink;

/// Called (on the dispatcher's context) when the raw link has data. The read subscription is
///  disabled at that point, and it is the listener's responsibility to re-enable it.
pub trait ReadListener: Send + Sync + 'static {
    fn read_callback(&self);
}

/// Called exactly once after a stream was stopped
pub trait ExitListener: Send + Sync + 'static {
    fn exit_callback(&self);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivers readiness events of raw links to listeners. Streams start with their read
///  subscription disabled.
#[cfg_attr(test, automock)]
pub trait IoDispatch: Send + Sync + 'static {
    fn start_stream(&self, link: Arc<dyn RawLink>, read_listener: Arc<dyn ReadListener>, exit_listener: Arc<dyn ExitListener>) -> anyhow::Result<StreamId>;

    /// Transition of the read subscription from 'disabled' to 'enabled'
    fn enable_read_callback(&self, id: StreamId) -> anyhow::Result<()>;

    fn stop_stream(&self, id: StreamId) -> anyhow::Result<()>;
}

struct DispatchedStream {
    read_enabled: Arc<watch::Sender<bool>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A dispatcher with one tokio task per stream
pub struct TokioDispatch {
    runtime: Handle,
    next_id: AtomicU64,
    streams: Mutex<FxHashMap<StreamId, DispatchedStream>>,
}

impl TokioDispatch {
    pub fn new(runtime: Handle) -> TokioDispatch {
        TokioDispatch {
            runtime,
            next_id: AtomicU64::new(0),
            streams: Default::default(),
        }
    }

    pub fn num_streams(&self) -> usize {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn run_stream(
        id: StreamId,
        link: Arc<dyn RawLink>,
        read_listener: Arc<dyn ReadListener>,
        exit_listener: Arc<dyn ExitListener>,
        read_enabled: Arc<watch::Sender<bool>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut read_enabled_receiver = read_enabled.subscribe();

        loop {
            select! {
                _ = stop.wait_for(|s| *s) => {
                    break;
                }
                _ = async {
                    // NB: the sender is owned by this task, so waiting can not fail
                    let _ = read_enabled_receiver.wait_for(|e| *e).await;
                    link.source_ready().await;
                } => {
                    trace!("stream {}: raw link is readable", id);
                    read_enabled.send_replace(false);
                    read_listener.read_callback();
                }
            }
        }

        debug!("stream {} stopped", id);
        exit_listener.exit_callback();
    }
}

impl IoDispatch for TokioDispatch {
    fn start_stream(&self, link: Arc<dyn RawLink>, read_listener: Arc<dyn ReadListener>, exit_listener: Arc<dyn ExitListener>) -> anyhow::Result<StreamId> {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let read_enabled = Arc::new(watch::Sender::new(false));
        let (stop, stop_receiver) = watch::channel(false);

        let task = self.runtime.spawn(Self::run_stream(id, link, read_listener, exit_listener, read_enabled.clone(), stop_receiver));

        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(id, DispatchedStream { read_enabled, stop, task });
        debug!("started stream {}", id);
        Ok(id)
    }

    fn enable_read_callback(&self, id: StreamId) -> anyhow::Result<()> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.get(&id)
            .ok_or_else(|| anyhow!("enabling read callback for unknown stream {}", id))?;
        stream.read_enabled.send_replace(true);
        Ok(())
    }

    fn stop_stream(&self, id: StreamId) -> anyhow::Result<()> {
        let stream = self.streams.lock().unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| anyhow!("stopping unknown stream {}", id))?;
        stream.stop.send_replace(true);
        Ok(())
    }
}

impl Drop for TokioDispatch {
    fn drop(&mut self) {
        // stopping rather than aborting, so exit callbacks are called
        for (_, stream) in self.streams.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            stream.stop.send_replace(true);
            drop(stream.task);
        }
    }
}

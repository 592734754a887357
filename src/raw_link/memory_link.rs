use std::cmp::min;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tracing::trace;

use crate::raw_link::{LinkStatus, RawLink};

/// Simulated line noise, applied to each `push` on a [MemoryLink]
#[derive(Debug, Clone, Copy)]
pub struct LinkImpairment {
    /// probability that the pushed bytes are silently dropped
    pub drop_probability: f64,
    /// probability that a single random byte of the pushed bytes is flipped
    pub corrupt_probability: f64,
    /// probability that the pushed bytes arrive twice
    pub duplicate_probability: f64,
    /// probability that the pushed bytes are held back and arrive after those of the next push
    pub reorder_probability: f64,
    pub seed: u64,
}

impl LinkImpairment {
    pub fn none() -> LinkImpairment {
        LinkImpairment {
            drop_probability: 0.0,
            corrupt_probability: 0.0,
            duplicate_probability: 0.0,
            reorder_probability: 0.0,
            seed: 0,
        }
    }
}

struct Impairer {
    config: LinkImpairment,
    rng: StdRng,
    /// bytes of an earlier push, waiting to be delivered after the next one
    held_back: Option<Vec<u8>>,
}

impl Impairer {
    fn new(config: LinkImpairment) -> Impairer {
        Impairer {
            config,
            rng: StdRng::seed_from_u64(config.seed),
            held_back: None,
        }
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen_bool(probability.min(1.0))
    }

    /// Returns the chunks to deliver, in order, for data that was pushed
    fn apply(&mut self, mut data: Vec<u8>) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }
        if self.roll(self.config.drop_probability) {
            trace!("memory link: dropping {} bytes", data.len());
            return Vec::new();
        }
        if self.roll(self.config.corrupt_probability) {
            let idx = self.rng.gen_range(0..data.len());
            let mask = self.rng.gen_range(1..=255u8);
            trace!("memory link: corrupting byte {} of {}", idx, data.len());
            data[idx] ^= mask;
        }

        let mut result = Vec::with_capacity(3);
        if self.held_back.is_none() && self.roll(self.config.reorder_probability) {
            trace!("memory link: holding back {} bytes", data.len());
            self.held_back = Some(data);
            return result;
        }
        if self.roll(self.config.duplicate_probability) {
            trace!("memory link: duplicating {} bytes", data.len());
            result.push(data.clone());
        }
        result.push(data);
        if let Some(held_back) = self.held_back.take() {
            result.push(held_back);
        }
        result
    }
}

/// One direction of a [MemoryLink] pair
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
}

impl Pipe {
    fn new(capacity: usize) -> Pipe {
        Pipe {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn buf(&self) -> std::sync::MutexGuard<'_, VecDeque<u8>> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }
}

/// An in-memory duplex link with bounded buffers in both directions, optionally dropping,
///  corrupting, duplicating or reordering data. Duplicated and released held-back bytes may
///  exceed the buffer's capacity.
///
/// Readiness uses `Notify` permits, so a readiness signal that arrives while nobody is waiting is
///  not lost.
pub struct MemoryLink {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    impairer: Mutex<Impairer>,
}

impl MemoryLink {
    /// Two connected ends, each buffering up to `capacity` bytes in flight towards it
    pub fn pair(capacity: usize) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        Self::pair_with_impairment(capacity, LinkImpairment::none())
    }

    /// Both directions get the same impairment probabilities, but independent random sequences
    pub fn pair_with_impairment(capacity: usize, impairment: LinkImpairment) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        let a_to_b = Arc::new(Pipe::new(capacity));
        let b_to_a = Arc::new(Pipe::new(capacity));

        let a = MemoryLink {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            impairer: Mutex::new(Impairer::new(impairment)),
        };
        let b = MemoryLink {
            incoming: a_to_b,
            outgoing: b_to_a,
            impairer: Mutex::new(Impairer::new(LinkImpairment {
                seed: impairment.seed.wrapping_add(1),
                ..impairment
            })),
        };
        (Arc::new(a), Arc::new(b))
    }

    /// Changes impairment of data pushed from this end at runtime
    pub fn set_impairment(&self, impairment: LinkImpairment) {
        *self.impairer.lock().unwrap_or_else(PoisonError::into_inner) = Impairer::new(impairment);
    }

    /// Number of bytes pushed from this end that the peer did not pull yet
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.buf().len()
    }
}

#[async_trait]
impl RawLink for MemoryLink {
    fn pull(&self, buf: &mut [u8]) -> LinkStatus {
        let mut incoming = self.incoming.buf();
        if incoming.is_empty() {
            return if self.incoming.is_closed() {
                LinkStatus::EndOfStream
            }
            else {
                LinkStatus::WouldBlock
            };
        }

        let n = min(buf.len(), incoming.len());
        for (dst, src) in buf.iter_mut().zip(incoming.drain(..n)) {
            *dst = src;
        }
        drop(incoming);

        self.incoming.writable.notify_one();
        LinkStatus::Ready(n)
    }

    fn push(&self, buf: &[u8]) -> LinkStatus {
        if self.outgoing.is_closed() {
            return LinkStatus::Failed(std::io::ErrorKind::BrokenPipe);
        }

        let mut outgoing = self.outgoing.buf();
        let room = self.outgoing.capacity - outgoing.len();
        if room == 0 {
            return LinkStatus::WouldBlock;
        }

        let n = min(room, buf.len());
        let chunks = self.impairer.lock().unwrap_or_else(PoisonError::into_inner)
            .apply(buf[..n].to_vec());
        let delivered = !chunks.is_empty();
        for chunk in chunks {
            outgoing.extend(chunk);
        }
        drop(outgoing);

        if delivered {
            self.outgoing.readable.notify_one();
        }
        LinkStatus::Ready(n)
    }

    async fn source_ready(&self) {
        loop {
            if !self.incoming.buf().is_empty() || self.incoming.is_closed() {
                return;
            }
            self.incoming.readable.notified().await;
        }
    }

    async fn sink_ready(&self) {
        loop {
            if self.outgoing.buf().len() < self.outgoing.capacity || self.outgoing.is_closed() {
                return;
            }
            self.outgoing.writable.notified().await;
        }
    }

    fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
    }
}

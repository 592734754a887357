use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

pub mod memory_link;

/// Outcome of a non-blocking operation on a raw link
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkStatus {
    /// The given number of bytes were transferred. For a pull, zero means there was nothing to
    ///  read; for a push, zero means nothing could be written right now.
    Ready(usize),
    WouldBlock,
    /// The peer closed its end. Only returned once all buffered data was pulled.
    EndOfStream,
    Failed(std::io::ErrorKind),
}

/// A non-blocking duplex byte channel, typically a UART. The channel may drop or corrupt bytes.
///
/// This is an abstraction over the physical device, introduced to facilitate running and testing
///  the protocol without one. Opening and configuring the device is the implementation's
///  business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RawLink: Send + Sync + 'static {
    /// Reads available bytes into `buf` without blocking
    fn pull(&self, buf: &mut [u8]) -> LinkStatus;

    /// Writes as much of `buf` as possible without blocking
    fn push(&self, buf: &[u8]) -> LinkStatus;

    /// Completes when a `pull` is likely to return data, end-of-stream or an error
    async fn source_ready(&self);

    /// Completes when a `push` is likely to accept data
    async fn sink_ready(&self);

    fn close(&self);
}

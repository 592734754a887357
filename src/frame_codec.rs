use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::frame::Frame;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Converts between runs of raw bytes and frames.
///
/// Frames are delimited by END bytes on both sides, with END and ESC inside a frame escaped.
///  Decoding is incremental: a frame can be split across any number of reads, and the codec
///  keeps the partial frame until the rest arrives.
pub struct FrameCodec {
    max_payload_len: usize,
    partial: BytesMut,
    in_escape: bool,
    /// set after a protocol violation in the current frame: everything up to the next END is
    ///  discarded
    discarding: bool,
}

impl FrameCodec {
    pub fn new(max_payload_len: usize) -> FrameCodec {
        FrameCodec {
            max_payload_len,
            partial: BytesMut::with_capacity(max_payload_len + Frame::OVERHEAD),
            in_escape: false,
            discarding: false,
        }
    }

    /// Maximum *stuffed* content length of a frame that can still be valid
    fn max_content_len(&self) -> usize {
        self.max_payload_len + Frame::OVERHEAD
    }

    pub fn set_max_payload_len(&mut self, max_payload_len: usize) {
        self.max_payload_len = max_payload_len;
    }

    pub fn encode(&self, frame: &Frame) -> Bytes {
        let mut content = BytesMut::with_capacity(frame.serialized_len());
        frame.ser(&mut content);

        // worst case: every byte escaped, plus delimiters
        let mut buf = BytesMut::with_capacity(2*content.len() + 2);
        buf.put_u8(END);
        for &b in content.iter() {
            match b {
                END => {
                    buf.put_u8(ESC);
                    buf.put_u8(ESC_END);
                }
                ESC => {
                    buf.put_u8(ESC);
                    buf.put_u8(ESC_ESC);
                }
                b => buf.put_u8(b),
            }
        }
        buf.put_u8(END);
        buf.freeze()
    }

    /// Consumes raw bytes, returning all frames completed by them. Invalid frames are logged and
    ///  dropped.
    pub fn decode(&mut self, raw: &[u8]) -> Vec<Frame> {
        let mut result = Vec::new();

        for &b in raw {
            if b == END {
                self.on_end(&mut result);
                continue;
            }
            if self.discarding {
                continue;
            }

            let unstuffed = if self.in_escape {
                self.in_escape = false;
                match b {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    other => {
                        debug!("invalid escape sequence {:#04x} - discarding frame", other);
                        self.discard();
                        continue;
                    }
                }
            }
            else if b == ESC {
                self.in_escape = true;
                continue;
            }
            else {
                b
            };

            if self.partial.len() >= self.max_content_len() {
                debug!("frame exceeds maximum length of {} bytes - discarding up to next delimiter", self.max_content_len());
                self.discard();
                continue;
            }
            self.partial.put_u8(unstuffed);
        }

        result
    }

    fn on_end(&mut self, result: &mut Vec<Frame>) {
        let was_discarding = self.discarding;
        let dangling_escape = self.in_escape;
        self.discarding = false;
        self.in_escape = false;

        if was_discarding {
            self.partial.clear();
            return;
        }
        if self.partial.is_empty() {
            // back-to-back delimiters between frames, or line noise resync
            return;
        }
        if dangling_escape {
            debug!("frame ends with a dangling escape byte - dropping");
            self.partial.clear();
            return;
        }

        match Frame::deser(&self.partial, self.max_payload_len) {
            Ok(frame) => {
                trace!("decoded frame {:?}", frame);
                result.push(frame);
            }
            Err(e) => {
                debug!("dropping invalid frame of {} bytes: {}", self.partial.len(), e);
            }
        }
        self.partial.clear();
    }

    fn discard(&mut self) {
        self.partial.clear();
        self.in_escape = false;
        self.discarding = true;
    }

    /// Number of bytes of a partially received frame
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.in_escape = false;
        self.discarding = false;
    }
}

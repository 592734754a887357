use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buf_ext::BufExt;
use crate::sequence::SeqNum;

const CRC: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Ack = 1,
    Nack = 2,
    LinkControl = 3,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u16);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x?}", self.0)
    }
}
impl Checksum {
    pub fn of(content: &[u8]) -> Checksum {
        Checksum(CRC.checksum(content))
    }
}

/// A single frame as it is exchanged between peers, before SLIP framing is applied.
///
/// `ack` carries the sequence number of the last DATA frame the sender received in order. It is
///  piggybacked on DATA frames and is the whole point of ACK / NACK frames. For LCTRL frames it
///  is unused and sent as zero.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub payload: Bytes,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{{seq:{}, ack:{}, len:{}}}", self.kind, self.seq, self.ack, self.payload.len())
    }
}

impl Frame {
    /// kind + seq + ack + len
    pub const HEADER_LEN: usize = 7;
    pub const CHECKSUM_LEN: usize = 2;
    pub const OVERHEAD: usize = Self::HEADER_LEN + Self::CHECKSUM_LEN;

    pub fn data(seq: SeqNum, ack: SeqNum, payload: Bytes) -> Frame {
        Frame { kind: FrameKind::Data, seq, ack, payload }
    }

    pub fn ack(ack: SeqNum) -> Frame {
        Frame { kind: FrameKind::Ack, seq: SeqNum::ZERO, ack, payload: Bytes::new() }
    }

    pub fn nack(ack: SeqNum) -> Frame {
        Frame { kind: FrameKind::Nack, seq: SeqNum::ZERO, ack, payload: Bytes::new() }
    }

    pub fn link_control(payload: Bytes) -> Frame {
        Frame { kind: FrameKind::LinkControl, seq: SeqNum::ZERO, ack: SeqNum::ZERO, payload }
    }

    pub fn serialized_len(&self) -> usize {
        Self::OVERHEAD + self.payload.len()
    }

    /// Writes the frame's content including checksum. Payload length is bounded by the
    ///  negotiated packet size which is far below `u16::MAX`.
    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(self.kind.into());
        buf.put_u16(self.seq.to_raw());
        buf.put_u16(self.ack.to_raw());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        let checksum = Checksum::of(&buf[start..]);
        buf.put_u16(checksum.0);
    }

    /// Parses the (un-stuffed) content of a single frame, verifying its checksum and length
    pub fn deser(content: &[u8], max_payload_len: usize) -> anyhow::Result<Frame> {
        if content.len() < Self::OVERHEAD {
            bail!("frame of {} bytes is too short", content.len());
        }

        let (covered, mut checksum_buf) = content.split_at(content.len() - Self::CHECKSUM_LEN);
        let transmitted = Checksum(checksum_buf.checked_get_u16()?);
        let actual = Checksum::of(covered);
        if transmitted != actual {
            bail!("checksum mismatch: transmitted {:?}, actual {:?}", transmitted, actual);
        }

        let mut buf = covered;
        let kind = FrameKind::try_from_primitive(buf.checked_get_u8()?)?;
        let seq = SeqNum::from_raw(buf.checked_get_u16()?);
        let ack = SeqNum::from_raw(buf.checked_get_u16()?);
        let len = buf.checked_get_u16()? as usize;

        if len != buf.len() {
            bail!("length field {} is inconsistent with actual payload length {}", len, buf.len());
        }
        if len > max_payload_len {
            bail!("payload length {} exceeds the maximum of {}", len, max_payload_len);
        }

        Ok(Frame {
            kind,
            seq,
            ack,
            payload: buf.checked_split_to(len)?,
        })
    }
}

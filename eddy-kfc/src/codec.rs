//! ## eddy-kfc::codec
//! **KFC wire format**
//!
//! ```text
//!  0      2      3      4          8                16               24
//!  +------+------+------+----------+----------------+----------------+---------
//!  | 4B46 | kind |flags |  length  |   channel id   |    group id    | payload
//!  +------+------+------+----------+----------------+----------------+---------
//! ```
//!
//! All fields big-endian. `length` counts payload bytes only.

use bytes::{Buf, Bytes};
use eddy_core::collections::hash_code;
use eddy_io::{Codec, Decoded, Input, OutputSink, ProtocolError};

pub const MAGIC: u16 = 0x4B46;
pub const HEADER_LEN: usize = 24;

/// Stable id of a group name on the wire.
pub fn group_id(name: &str) -> u64 {
    hash_code(name.as_bytes(), 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Request),
            2 => Ok(PacketKind::Response),
            other => Err(ProtocolError::Malformed(format!("unknown packet kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KfcPacket {
    pub kind: PacketKind,
    pub flags: u8,
    pub channel: u64,
    pub group: u64,
    pub payload: Bytes,
}

impl KfcPacket {
    pub fn request(group: u64, channel: u64, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Request,
            flags: 0,
            channel,
            group,
            payload,
        }
    }

    /// Response to `self` carrying `payload`.
    pub fn respond(&self, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Response,
            flags: 0,
            channel: self.channel,
            group: self.group,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KfcCodec {
    max_payload: usize,
}

impl KfcCodec {
    pub fn new(max_packet: usize) -> Self {
        Self {
            max_payload: max_packet.saturating_sub(HEADER_LEN),
        }
    }
}

impl Codec for KfcCodec {
    type Packet = KfcPacket;

    fn decode(&self, input: &mut Input<'_>) -> Decoded<KfcPacket> {
        if input.len() < HEADER_LEN {
            return Decoded::NeedMore(HEADER_LEN - input.len());
        }
        let mut header = &input.peek()[..HEADER_LEN];
        let magic = header.get_u16();
        if magic != MAGIC {
            return Decoded::Error(ProtocolError::Malformed(format!("bad magic {magic:#06x}")));
        }
        let kind = match PacketKind::try_from(header.get_u8()) {
            Ok(kind) => kind,
            Err(e) => return Decoded::Error(e),
        };
        let flags = header.get_u8();
        let len = header.get_u32() as usize;
        let channel = header.get_u64();
        let group = header.get_u64();
        if len > self.max_payload {
            return Decoded::Error(ProtocolError::FrameTooLarge {
                size: len + HEADER_LEN,
                limit: self.max_payload + HEADER_LEN,
            });
        }
        if input.len() < HEADER_LEN + len {
            return Decoded::NeedMore(HEADER_LEN + len - input.len());
        }
        input.skip(HEADER_LEN);
        Decoded::Packet(KfcPacket {
            kind,
            flags,
            channel,
            group,
            payload: input.take(len),
        })
    }

    fn encode(&self, packet: &KfcPacket, out: &mut OutputSink<'_>) -> Result<(), ProtocolError> {
        if packet.payload.len() > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: packet.payload.len() + HEADER_LEN,
                limit: self.max_payload + HEADER_LEN,
            });
        }
        out.put_u16(MAGIC)?;
        out.put_u8(packet.kind as u8)?;
        out.put_u8(packet.flags)?;
        out.put_u32(packet.payload.len() as u32)?;
        out.put_u64(packet.channel)?;
        out.put_u64(packet.group)?;
        out.put(&packet.payload)?;
        Ok(())
    }

    fn session_id(&self, packet: &KfcPacket) -> Option<u64> {
        (packet.channel != 0).then_some(packet.channel)
    }
}

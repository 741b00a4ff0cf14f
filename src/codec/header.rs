//! Message framing.
//!
//! A [`HeaderMode`] is the byte-level convention marking message
//! boundaries inside a stream. The numeric representations are wire
//! contracts: peers negotiate a mode number out of band and both ends
//! must produce bit-identical headers.
//!
//! Fixed-width modes carry a 1/2/4-byte length prefix in either byte
//! order. The plain variants count the header's own bytes in the
//! encoded length ("inclusive"); the `E`-variants exclude them, so a
//! receiver can read the header in isolation before knowing the full
//! frame size. `DwordMask` packs an application byte into the top 8
//! bits of an inclusive 4-byte little-endian header. `Raw` has no
//! boundary at all, and `LineSplit` delimits on `\n`.

use crate::base::neterror::NetError;
use bytes::{BufMut, BytesMut};

/// Framing mode. Numeric values are stable wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HeaderMode {
    /// 2-byte little-endian length, header bytes included.
    #[default]
    WordLsb = 0,
    /// 2-byte big-endian length, header bytes included.
    WordMsb = 1,
    /// 4-byte little-endian length, header bytes included.
    DwordLsb = 2,
    /// 4-byte big-endian length, header bytes included.
    DwordMsb = 3,
    /// 1-byte length, header byte included.
    ByteLsb = 4,
    /// 1-byte length, header byte included (big-endian is identical
    /// at one byte; kept as a distinct wire id).
    ByteMsb = 5,
    /// 2-byte little-endian length, header bytes excluded.
    EwordLsb = 6,
    /// 2-byte big-endian length, header bytes excluded.
    EwordMsb = 7,
    /// 4-byte little-endian length, header bytes excluded.
    EdwordLsb = 8,
    /// 4-byte big-endian length, header bytes excluded.
    EdwordMsb = 9,
    /// 1-byte length, header byte excluded.
    EbyteLsb = 10,
    /// 1-byte length, header byte excluded.
    EbyteMsb = 11,
    /// 4-byte little-endian inclusive length in the low 24 bits, an
    /// application mask byte in the high 8.
    DwordMask = 12,
    /// No framing: the buffered run is one message.
    Raw = 13,
    /// Newline-delimited; the delimiter is not part of the payload.
    LineSplit = 14,
}

/// Shape of one decoded frame at the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub header_len: usize,
    pub payload_len: usize,
    /// Delimiter bytes following the payload (`LineSplit` only).
    pub trailer_len: usize,
    /// Application byte recovered from a `DwordMask` header.
    pub mask: u8,
}

impl FrameInfo {
    /// Total bytes the frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.header_len + self.payload_len + self.trailer_len
    }
}

impl HeaderMode {
    /// Decode a wire identifier.
    pub fn from_u8(value: u8) -> Option<HeaderMode> {
        use HeaderMode::*;
        Some(match value {
            0 => WordLsb,
            1 => WordMsb,
            2 => DwordLsb,
            3 => DwordMsb,
            4 => ByteLsb,
            5 => ByteMsb,
            6 => EwordLsb,
            7 => EwordMsb,
            8 => EdwordLsb,
            9 => EdwordMsb,
            10 => EbyteLsb,
            11 => EbyteMsb,
            12 => DwordMask,
            13 => Raw,
            14 => LineSplit,
            _ => return None,
        })
    }

    /// Wire identifier.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Length-prefix width in bytes (0 for `Raw` and `LineSplit`).
    pub fn header_len(self) -> usize {
        use HeaderMode::*;
        match self {
            ByteLsb | ByteMsb | EbyteLsb | EbyteMsb => 1,
            WordLsb | WordMsb | EwordLsb | EwordMsb => 2,
            DwordLsb | DwordMsb | EdwordLsb | EdwordMsb | DwordMask => 4,
            Raw | LineSplit => 0,
        }
    }

    /// Whether the encoded length excludes the header's own bytes.
    pub fn excludes_self(self) -> bool {
        use HeaderMode::*;
        matches!(self, EwordLsb | EwordMsb | EdwordLsb | EdwordMsb | EbyteLsb | EbyteMsb)
    }

    /// Append the header for a `payload_len`-byte message to `out`.
    ///
    /// Fails with [`NetError::BadHeader`] when the length cannot be
    /// represented in the mode's width.
    pub fn encode_into(
        self,
        payload_len: usize,
        mask: u8,
        out: &mut BytesMut,
    ) -> Result<(), NetError> {
        use HeaderMode::*;
        let value = if self.excludes_self() {
            payload_len
        } else {
            payload_len + self.header_len()
        };
        match self {
            ByteLsb | ByteMsb | EbyteLsb | EbyteMsb => {
                if value > u8::MAX as usize {
                    return Err(NetError::BadHeader);
                }
                out.put_u8(value as u8);
            }
            WordLsb | EwordLsb => {
                if value > u16::MAX as usize {
                    return Err(NetError::BadHeader);
                }
                out.put_u16_le(value as u16);
            }
            WordMsb | EwordMsb => {
                if value > u16::MAX as usize {
                    return Err(NetError::BadHeader);
                }
                out.put_u16(value as u16);
            }
            DwordLsb | EdwordLsb => {
                if value > u32::MAX as usize {
                    return Err(NetError::BadHeader);
                }
                out.put_u32_le(value as u32);
            }
            DwordMsb | EdwordMsb => {
                if value > u32::MAX as usize {
                    return Err(NetError::BadHeader);
                }
                out.put_u32(value as u32);
            }
            DwordMask => {
                if value > 0x00ff_ffff {
                    return Err(NetError::BadHeader);
                }
                out.put_u32_le(value as u32 | (u32::from(mask) << 24));
            }
            Raw | LineSplit => {}
        }
        Ok(())
    }

    /// Append the frame trailer, if the mode has one.
    pub fn encode_trailer(self, out: &mut BytesMut) {
        if self == HeaderMode::LineSplit {
            out.put_u8(b'\n');
        }
    }

    /// Inspect the front of `buf` for one complete frame.
    ///
    /// `maxsize` is the per-message payload ceiling (0 disables the
    /// check for headered modes; `Raw` uses it as the message bound).
    /// Error precedence: not-enough-data for an incomplete header,
    /// then impossible lengths, then the ceiling, then not-enough-data
    /// for an incomplete body.
    pub fn peek(self, buf: &[u8], maxsize: usize) -> Result<FrameInfo, NetError> {
        use HeaderMode::*;
        match self {
            Raw => {
                if buf.is_empty() {
                    return Err(NetError::NotEnoughData);
                }
                let len = if maxsize > 0 { buf.len().min(maxsize) } else { buf.len() };
                Ok(FrameInfo { header_len: 0, payload_len: len, trailer_len: 0, mask: 0 })
            }
            LineSplit => match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if maxsize > 0 && pos > maxsize {
                        return Err(NetError::OverLimit);
                    }
                    Ok(FrameInfo { header_len: 0, payload_len: pos, trailer_len: 1, mask: 0 })
                }
                None => {
                    if maxsize > 0 && buf.len() > maxsize {
                        return Err(NetError::OverLimit);
                    }
                    Err(NetError::NotEnoughData)
                }
            },
            _ => {
                let header_len = self.header_len();
                if buf.len() < header_len {
                    return Err(NetError::NotEnoughData);
                }
                let (value, mask) = self.decode_value(buf);
                let payload_len = if self.excludes_self() {
                    value
                } else {
                    // An inclusive length smaller than its own header
                    // is impossible on a well-formed stream.
                    if value < header_len {
                        return Err(NetError::BadHeader);
                    }
                    value - header_len
                };
                if maxsize > 0 && payload_len > maxsize {
                    return Err(NetError::OverLimit);
                }
                if buf.len() < header_len + payload_len {
                    return Err(NetError::NotEnoughData);
                }
                Ok(FrameInfo { header_len, payload_len, trailer_len: 0, mask })
            }
        }
    }

    fn decode_value(self, buf: &[u8]) -> (usize, u8) {
        use HeaderMode::*;
        match self {
            ByteLsb | ByteMsb | EbyteLsb | EbyteMsb => (buf[0] as usize, 0),
            WordLsb | EwordLsb => (u16::from_le_bytes([buf[0], buf[1]]) as usize, 0),
            WordMsb | EwordMsb => (u16::from_be_bytes([buf[0], buf[1]]) as usize, 0),
            DwordLsb | EdwordLsb => {
                (u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize, 0)
            }
            DwordMsb | EdwordMsb => {
                (u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize, 0)
            }
            DwordMask => {
                let raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                ((raw & 0x00ff_ffff) as usize, (raw >> 24) as u8)
            }
            Raw | LineSplit => (0, 0),
        }
    }
}

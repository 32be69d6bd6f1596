//! Token-stream decompressor.
//!
//! The stream is a run of sequences, each: a token byte whose high nibble
//! is the literal length and whose low nibble is the match length minus
//! [`MIN_MATCH`]; a nibble of 15 continues into extension bytes where each
//! `0xFF` adds 255 and the first other value terminates. Literals follow
//! the token, then a 16-bit little-endian backreference offset, then the
//! match extension bytes. The final sequence ends after its literals with
//! no offset.

use super::{copy_match, CodecOutput, TagCodec};
use crate::{error::Error, format::tag};

const NIBBLE_EXT: u32 = 15;
const MIN_MATCH: u32 = 4;

enum State {
    Token,
    LiteralExt { token: u8, literal_len: u32 },
    Literals { token: u8, remaining: u32 },
    OffsetLo { token: u8 },
    OffsetHi { token: u8, lo: u8 },
    MatchExt { offset: u16, match_len: u32 },
}

pub struct LzCodec {
    tag_id: u32,
    state: State,
}

impl LzCodec {
    pub const fn new() -> Self {
        Self::with_tag_id(tag::LZ_PROG)
    }

    pub const fn with_tag_id(tag_id: u32) -> Self {
        LzCodec {
            tag_id,
            state: State::Token,
        }
    }

    fn enter_literals(
        &mut self,
        out: &mut dyn CodecOutput,
        token: u8,
        literal_len: u32,
        data: &mut &[u8],
    ) -> Result<(), Error> {
        if literal_len == 0 {
            self.state = State::OffsetLo { token };
        } else {
            self.state = State::Literals {
                token,
                remaining: literal_len,
            };
            self.drain_literals(out, data)?;
        }
        Ok(())
    }

    fn drain_literals(
        &mut self,
        out: &mut dyn CodecOutput,
        data: &mut &[u8],
    ) -> Result<(), Error> {
        if let State::Literals { token, remaining } = self.state {
            let n = (remaining as usize).min(data.len());
            out.push(&data[..n])?;
            *data = &data[n..];
            let left = remaining - n as u32;
            self.state = if left == 0 {
                State::OffsetLo { token }
            } else {
                State::Literals {
                    token,
                    remaining: left,
                }
            };
        }
        Ok(())
    }

    fn enter_match(
        &mut self,
        out: &mut dyn CodecOutput,
        offset: u16,
        code: u32,
    ) -> Result<(), Error> {
        if code == NIBBLE_EXT {
            self.state = State::MatchExt {
                offset,
                match_len: NIBBLE_EXT,
            };
            Ok(())
        } else {
            self.execute_match(out, offset, code + MIN_MATCH)
        }
    }

    fn execute_match(
        &mut self,
        out: &mut dyn CodecOutput,
        offset: u16,
        length: u32,
    ) -> Result<(), Error> {
        if offset == 0 {
            return Err(Error::CompressionData);
        }
        copy_match(out, offset as u32, length)?;
        self.state = State::Token;
        Ok(())
    }
}

impl Default for LzCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TagCodec for LzCodec {
    fn tag_id(&self) -> u32 {
        self.tag_id
    }

    fn reset(&mut self) {
        self.state = State::Token;
    }

    fn decompress(&mut self, out: &mut dyn CodecOutput, data: &[u8]) -> Result<(), Error> {
        let mut data = data;
        while !data.is_empty() {
            match self.state {
                State::Token => {
                    let token = data[0];
                    data = &data[1..];
                    let literal_len = (token >> 4) as u32;
                    if literal_len == NIBBLE_EXT {
                        self.state = State::LiteralExt { token, literal_len };
                    } else {
                        self.enter_literals(out, token, literal_len, &mut data)?;
                    }
                }
                State::LiteralExt { token, literal_len } => {
                    let byte = data[0];
                    data = &data[1..];
                    let literal_len = literal_len
                        .checked_add(byte as u32)
                        .ok_or(Error::CompressionData)?;
                    if byte == 0xFF {
                        self.state = State::LiteralExt { token, literal_len };
                    } else {
                        self.enter_literals(out, token, literal_len, &mut data)?;
                    }
                }
                State::Literals { .. } => self.drain_literals(out, &mut data)?,
                State::OffsetLo { token } => {
                    let lo = data[0];
                    data = &data[1..];
                    self.state = State::OffsetHi { token, lo };
                }
                State::OffsetHi { token, lo } => {
                    let offset = u16::from_le_bytes([lo, data[0]]);
                    data = &data[1..];
                    self.enter_match(out, offset, (token & 0x0F) as u32)?;
                }
                State::MatchExt { offset, match_len } => {
                    let byte = data[0];
                    data = &data[1..];
                    let match_len = match_len
                        .checked_add(byte as u32)
                        .ok_or(Error::CompressionData)?;
                    if byte == 0xFF {
                        self.state = State::MatchExt { offset, match_len };
                    } else {
                        self.execute_match(out, offset, match_len + MIN_MATCH)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut dyn CodecOutput) -> Result<(), Error> {
        // A stream may only end at a sequence boundary or right after the
        // final sequence's literals.
        match self.state {
            State::Token | State::OffsetLo { .. } => {
                self.state = State::Token;
                Ok(())
            }
            _ => {
                self.state = State::Token;
                Err(Error::CompressionState)
            }
        }
    }
}

/// Greedy hash-chain compressor producing the token stream above. Test and
/// host-tool support; never runs on a device.
#[cfg(any(test, feature = "builder"))]
pub fn compress(input: &[u8]) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;

    const WINDOW: usize = u16::MAX as usize;

    fn push_len(out: &mut Vec<u8>, mut len: u32) {
        len -= NIBBLE_EXT;
        while len >= 255 {
            out.push(0xFF);
            len -= 255;
        }
        out.push(len as u8);
    }

    let mut out = Vec::new();
    let mut head: [usize; 1 << 12] = [usize::MAX; 1 << 12];
    let hash = |window: &[u8]| -> usize {
        let word = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);
        (word.wrapping_mul(2654435761) >> 20) as usize
    };

    let mut literal_start = 0;
    let mut pos = 0;
    while pos + MIN_MATCH as usize <= input.len() {
        let slot = hash(&input[pos..]);
        let candidate = head[slot];
        head[slot] = pos;

        let mut match_len = 0;
        if candidate != usize::MAX && pos - candidate <= WINDOW {
            while pos + match_len < input.len()
                && input[candidate + match_len] == input[pos + match_len]
            {
                match_len += 1;
            }
        }

        if match_len >= MIN_MATCH as usize {
            let literal_len = (pos - literal_start) as u32;
            let match_code = match_len as u32 - MIN_MATCH;
            let token = (literal_len.min(NIBBLE_EXT) as u8) << 4
                | match_code.min(NIBBLE_EXT) as u8;
            out.push(token);
            if literal_len >= NIBBLE_EXT {
                push_len(&mut out, literal_len);
            }
            out.extend_from_slice(&input[literal_start..pos]);
            out.extend_from_slice(&((pos - candidate) as u16).to_le_bytes());
            if match_code >= NIBBLE_EXT {
                push_len(&mut out, match_code);
            }
            pos += match_len;
            literal_start = pos;
        } else {
            pos += 1;
        }
    }

    // Final literal-only sequence.
    let literal_len = (input.len() - literal_start) as u32;
    let token = (literal_len.min(NIBBLE_EXT) as u8) << 4;
    out.push(token);
    if literal_len >= NIBBLE_EXT {
        push_len(&mut out, literal_len);
    }
    out.extend_from_slice(&input[literal_start..]);
    out
}

//! Block-framed decompressor.
//!
//! The stream is a run of framed blocks: `0x01, u16le len, bytes` for a
//! literal run, `0x02, u16le distance, u16le len` for a backreference into
//! the last [`WINDOW`] bytes of output, and a single `0x00` end mark that
//! must terminate the stream. Bytes after the end mark are malformed.

use super::{copy_match, CodecOutput, TagCodec};
use crate::{error::Error, format::tag};

/// Largest backreference distance a block may use.
pub const WINDOW: u32 = 2048;

const BLOCK_END: u8 = 0x00;
const BLOCK_LITERAL: u8 = 0x01;
const BLOCK_MATCH: u8 = 0x02;

enum State {
    BlockType,
    LiteralLenLo,
    LiteralLenHi { lo: u8 },
    Literals { remaining: u16 },
    MatchDistLo,
    MatchDistHi { lo: u8 },
    MatchLenLo { distance: u16 },
    MatchLenHi { distance: u16, lo: u8 },
    Finished,
}

pub struct BlockCodec {
    tag_id: u32,
    state: State,
}

impl BlockCodec {
    pub const fn new() -> Self {
        Self::with_tag_id(tag::BLOCK_PROG)
    }

    pub const fn with_tag_id(tag_id: u32) -> Self {
        BlockCodec {
            tag_id,
            state: State::BlockType,
        }
    }
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TagCodec for BlockCodec {
    fn tag_id(&self) -> u32 {
        self.tag_id
    }

    fn reset(&mut self) {
        self.state = State::BlockType;
    }

    fn decompress(&mut self, out: &mut dyn CodecOutput, data: &[u8]) -> Result<(), Error> {
        let mut data = data;
        while !data.is_empty() {
            match self.state {
                State::BlockType => {
                    let block = data[0];
                    data = &data[1..];
                    self.state = match block {
                        BLOCK_END => State::Finished,
                        BLOCK_LITERAL => State::LiteralLenLo,
                        BLOCK_MATCH => State::MatchDistLo,
                        _ => return Err(Error::CompressionData),
                    };
                }
                State::LiteralLenLo => {
                    self.state = State::LiteralLenHi { lo: data[0] };
                    data = &data[1..];
                }
                State::LiteralLenHi { lo } => {
                    let len = u16::from_le_bytes([lo, data[0]]);
                    data = &data[1..];
                    if len == 0 {
                        return Err(Error::CompressionData);
                    }
                    self.state = State::Literals { remaining: len };
                }
                State::Literals { remaining } => {
                    let n = (remaining as usize).min(data.len());
                    out.push(&data[..n])?;
                    data = &data[n..];
                    let left = remaining - n as u16;
                    self.state = if left == 0 {
                        State::BlockType
                    } else {
                        State::Literals { remaining: left }
                    };
                }
                State::MatchDistLo => {
                    self.state = State::MatchDistHi { lo: data[0] };
                    data = &data[1..];
                }
                State::MatchDistHi { lo } => {
                    let distance = u16::from_le_bytes([lo, data[0]]);
                    data = &data[1..];
                    if distance == 0 {
                        return Err(Error::CompressionData);
                    }
                    if distance as u32 > WINDOW {
                        return Err(Error::CompressionMem);
                    }
                    self.state = State::MatchLenLo { distance };
                }
                State::MatchLenLo { distance } => {
                    self.state = State::MatchLenHi {
                        distance,
                        lo: data[0],
                    };
                    data = &data[1..];
                }
                State::MatchLenHi { distance, lo } => {
                    let len = u16::from_le_bytes([lo, data[0]]);
                    data = &data[1..];
                    if len == 0 {
                        return Err(Error::CompressionData);
                    }
                    copy_match(out, distance as u32, len as u32)?;
                    self.state = State::BlockType;
                }
                State::Finished => return Err(Error::CompressionDataLen),
            }
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut dyn CodecOutput) -> Result<(), Error> {
        let finished = matches!(self.state, State::Finished);
        self.state = State::BlockType;
        if finished {
            Ok(())
        } else {
            Err(Error::CompressionState)
        }
    }
}

/// Greedy compressor for the block format. Test and host-tool support.
#[cfg(any(test, feature = "builder"))]
pub fn compress(input: &[u8]) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;

    const MIN_MATCH: usize = 4;

    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut pos = 0;

    let mut flush_literals = |out: &mut Vec<u8>, from: usize, to: usize, input: &[u8]| {
        let mut from = from;
        while from < to {
            let run = (to - from).min(u16::MAX as usize);
            out.push(BLOCK_LITERAL);
            out.extend_from_slice(&(run as u16).to_le_bytes());
            out.extend_from_slice(&input[from..from + run]);
            from += run;
        }
    };

    while pos + MIN_MATCH <= input.len() {
        let window_start = pos.saturating_sub(WINDOW as usize);
        let mut best = (0usize, 0usize);
        for candidate in window_start..pos {
            let mut len = 0;
            while pos + len < input.len()
                && len < u16::MAX as usize
                && input[candidate + len] == input[pos + len]
            {
                len += 1;
            }
            if len > best.1 {
                best = (candidate, len);
            }
        }
        if best.1 >= MIN_MATCH {
            flush_literals(&mut out, literal_start, pos, input);
            out.push(BLOCK_MATCH);
            out.extend_from_slice(&((pos - best.0) as u16).to_le_bytes());
            out.extend_from_slice(&(best.1 as u16).to_le_bytes());
            pos += best.1;
            literal_start = pos;
        } else {
            pos += 1;
        }
    }
    flush_literals(&mut out, literal_start, input.len(), input);
    out.push(BLOCK_END);
    out
}

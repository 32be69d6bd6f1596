//! Pluggable decompressors for compressed programming tags.
//!
//! A codec owns the decompression state for one tag id. The parser feeds it
//! raw payload bytes in whatever pieces the stream delivers; the codec
//! pushes decompressed output into a [`CodecOutput`], which routes it
//! through the same word-aligned, withhold-filtered programming path plain
//! Prog tags use. Backreferences into already-produced output go through
//! [`CodecOutput::read_back`], so a match may reach into bytes still in the
//! write buffer, withheld bytes, or committed flash.

use crate::{
    error::Error,
    platform::Sink,
    withhold::Withheld,
    writer::ProgWriter,
};

mod block;
mod lz;

pub use block::BlockCodec;
pub use lz::LzCodec;

#[cfg(any(test, feature = "builder"))]
pub use block::compress as block_compress;
#[cfg(any(test, feature = "builder"))]
pub use lz::compress as lz_compress;

/// Destination for decompressed bytes.
pub trait CodecOutput {
    fn push(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Reads `out.len()` already-produced bytes starting `distance`
    /// positions behind the output cursor.
    fn read_back(&mut self, distance: u32, out: &mut [u8]) -> Result<(), Error>;
}

/// One registered decompressor.
pub trait TagCodec {
    /// Tag id this codec claims.
    fn tag_id(&self) -> u32;

    /// Called when a tag with this codec's id starts.
    fn reset(&mut self);

    /// Consumes the next run of compressed payload bytes. `data` is never
    /// empty and may split the compressed stream at any byte.
    fn decompress(&mut self, out: &mut dyn CodecOutput, data: &[u8]) -> Result<(), Error>;

    /// Called when the tag's payload is exhausted. Fails if the compressed
    /// stream was cut mid-sequence.
    fn finish(&mut self, out: &mut dyn CodecOutput) -> Result<(), Error>;
}

/// [`CodecOutput`] over the parser's programming path.
pub(crate) struct WriterOutput<'a, S: Sink> {
    pub writer: &'a mut ProgWriter,
    pub withheld: &'a mut Withheld,
    pub sink: &'a mut S,
}

impl<S: Sink> CodecOutput for WriterOutput<'_, S> {
    fn push(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.push(self.withheld, self.sink, data)
    }

    fn read_back(&mut self, distance: u32, out: &mut [u8]) -> Result<(), Error> {
        self.writer.read_back(self.withheld, self.sink, distance, out)
    }
}

/// Copies a backreference one byte at a time so a match may overlap its own
/// output.
fn copy_match(out: &mut dyn CodecOutput, distance: u32, length: u32) -> Result<(), Error> {
    let mut byte = [0u8; 1];
    for _ in 0..length {
        out.read_back(distance, &mut byte)?;
        out.push(&byte)?;
    }
    Ok(())
}

//! Word-aligned programming path.
//!
//! Every byte a programming tag produces goes through one [`ProgWriter`]:
//! it buffers up to a word, filters full words through the withheld
//! regions, and hands aligned runs to the sink. Codec tags use the same
//! writer, so decompressed output obeys the same alignment and withhold
//! rules as plain data.

use crate::{
    error::Error,
    format::{FLASH_ERASE_VALUE, WRITE_ALIGNMENT},
    platform::Sink,
    withhold::Withheld,
};

/// Where the current tag's bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Application,
    /// Addresses are offsets into the Bootloader tag's data.
    Bootloader,
    /// Secure-element payloads stage through the bootloader path, offsets
    /// relative to the tag's data. No reset vector to withhold.
    SecureElement,
    /// Addresses are offsets into the Metadata tag.
    Metadata,
}

const STAGING: usize = 64;

pub(crate) struct ProgWriter {
    target: Target,
    address: u32,
    pending: [u8; WRITE_ALIGNMENT],
    pending_len: usize,
}

impl ProgWriter {
    pub const fn new() -> Self {
        ProgWriter {
            target: Target::Application,
            address: 0,
            pending: [0; WRITE_ALIGNMENT],
            pending_len: 0,
        }
    }

    /// Starts a new run at `address`. The previous tag must have been
    /// finished with [`finish`](Self::finish) first.
    pub fn begin(&mut self, target: Target, address: u32) -> Result<(), Error> {
        debug_assert_eq!(self.pending_len, 0);
        if address as usize % WRITE_ALIGNMENT != 0 {
            return Err(Error::Alignment);
        }
        self.target = target;
        self.address = address;
        Ok(())
    }

    /// Address the next pushed byte lands at.
    pub fn position(&self) -> u32 {
        self.address.wrapping_add(self.pending_len as u32)
    }

    pub fn push<S: Sink>(
        &mut self,
        withheld: &mut Withheld,
        sink: &mut S,
        mut data: &[u8],
    ) -> Result<(), Error> {
        if self.pending_len > 0 {
            while self.pending_len < WRITE_ALIGNMENT && !data.is_empty() {
                self.pending[self.pending_len] = data[0];
                self.pending_len += 1;
                data = &data[1..];
            }
            if self.pending_len < WRITE_ALIGNMENT {
                return Ok(());
            }
            let mut word = self.pending;
            self.pending_len = 0;
            self.write_aligned(withheld, sink, &mut word)?;
        }

        let whole = data.len() & !(WRITE_ALIGNMENT - 1);
        let mut offset = 0;
        let mut staging = [0u8; STAGING];
        while offset < whole {
            let n = (whole - offset).min(STAGING);
            staging[..n].copy_from_slice(&data[offset..offset + n]);
            self.write_aligned(withheld, sink, &mut staging[..n])?;
            offset += n;
        }

        self.pending[..data.len() - whole].copy_from_slice(&data[whole..]);
        self.pending_len = data.len() - whole;
        Ok(())
    }

    /// Pads a trailing partial word with the erase value and writes it out.
    /// Called once when a programming tag ends.
    pub fn finish<S: Sink>(&mut self, withheld: &mut Withheld, sink: &mut S) -> Result<(), Error> {
        if self.pending_len == 0 {
            return Ok(());
        }
        for byte in &mut self.pending[self.pending_len..] {
            *byte = FLASH_ERASE_VALUE;
        }
        self.pending_len = 0;
        let mut word = self.pending;
        self.write_aligned(withheld, sink, &mut word)
    }

    /// Already-produced output byte `distance` positions behind the write
    /// cursor, for codec backreferences. Served from the pending word, the
    /// withheld captures, or committed flash, in that order.
    pub fn read_back<S: Sink>(
        &mut self,
        withheld: &Withheld,
        sink: &mut S,
        distance: u32,
        out: &mut [u8],
    ) -> Result<(), Error> {
        // Backreferences only make sense on the application path.
        if self.target != Target::Application {
            return Err(Error::CompressionData);
        }
        let start = self
            .position()
            .checked_sub(distance)
            .ok_or(Error::CompressionData)?;
        for (i, byte) in out.iter_mut().enumerate() {
            let pos = start.wrapping_add(i as u32);
            *byte = if pos >= self.address {
                self.pending[(pos - self.address) as usize]
            } else if let Some(b) = withheld.read_application(pos) {
                b
            } else {
                let mut one = [0u8; 1];
                sink.read_application(pos, &mut one)?;
                one[0]
            };
        }
        Ok(())
    }

    fn write_aligned<S: Sink>(
        &mut self,
        withheld: &mut Withheld,
        sink: &mut S,
        data: &mut [u8],
    ) -> Result<(), Error> {
        match self.target {
            Target::Application => {
                withheld.filter_application(self.address, data);
                sink.write_application(self.address, data)?;
            }
            Target::Bootloader => {
                withheld.filter_bootloader(self.address, data);
                sink.write_bootloader(self.address, data)?;
            }
            Target::SecureElement => sink.write_bootloader(self.address, data)?,
            Target::Metadata => sink.write_metadata(self.address, data)?,
        }
        self.address = self
            .address
            .checked_add(data.len() as u32)
            .ok_or(Error::Alignment)?;
        Ok(())
    }
}

//! Withheld program-counter regions.
//!
//! The bytes that make a freshly written image bootable (the application's
//! vector table head, the staged bootloader's reset vector) are not allowed
//! to reach flash until the whole image has been verified. Writes through
//! the programming path are filtered here: bytes overlapping a withheld
//! region are captured, and the erase value is written in their place.
//! After verification succeeds the captured bytes are flushed, the word
//! that arms the application last.

use crate::{
    error::SinkError,
    format::FLASH_ERASE_VALUE,
    platform::{MemoryLayout, Sink},
};

/// Length of the withheld head of the application vector table: the reset
/// vector word plus the following interrupt vectors.
pub(crate) const APP_VECTORS_LEN: usize = 24;

struct Region<const N: usize> {
    start: u32,
    buf: [u8; N],
    captured: bool,
}

impl<const N: usize> Region<N> {
    const fn new(start: u32) -> Self {
        Region {
            start,
            buf: [FLASH_ERASE_VALUE; N],
            captured: false,
        }
    }

    /// Captures the part of `data` (being written at `address`) that falls
    /// inside this region and blanks it out in place.
    fn filter(&mut self, address: u32, data: &mut [u8]) {
        let end = address as u64 + data.len() as u64;
        let region_end = self.start as u64 + N as u64;
        if (address as u64) >= region_end || end <= self.start as u64 {
            return;
        }
        for (i, byte) in data.iter_mut().enumerate() {
            let pos = address as u64 + i as u64;
            if pos >= self.start as u64 && pos < region_end {
                self.buf[(pos - self.start as u64) as usize] = *byte;
                *byte = FLASH_ERASE_VALUE;
                self.captured = true;
            }
        }
    }

    /// True byte at `pos` if it was captured here.
    fn read(&self, pos: u32) -> Option<u8> {
        if self.captured && pos >= self.start && (pos as u64) < self.start as u64 + N as u64 {
            Some(self.buf[(pos - self.start) as usize])
        } else {
            None
        }
    }
}

/// All withheld regions of one parse session.
pub(crate) struct Withheld {
    /// Head of the application vector table, absolute addresses.
    app: Region<APP_VECTORS_LEN>,
    /// Reset vector of a bootloader staged in the upgrade slot, absolute.
    upgrade: Region<4>,
    /// Reset vector inside a Bootloader tag, tag-relative offsets.
    bootloader: Region<4>,
}

impl Withheld {
    pub fn new(layout: &MemoryLayout) -> Self {
        Withheld {
            app: Region::new(layout.start_of_app_space + 4),
            upgrade: Region::new(layout.upgrade_location + 4),
            bootloader: Region::new(4),
        }
    }

    pub fn filter_application(&mut self, address: u32, data: &mut [u8]) {
        self.app.filter(address, data);
        self.upgrade.filter(address, data);
    }

    pub fn filter_bootloader(&mut self, offset: u32, data: &mut [u8]) {
        self.bootloader.filter(offset, data);
    }

    /// True application-space byte at `pos`, if withheld.
    pub fn read_application(&self, pos: u32) -> Option<u8> {
        self.app.read(pos).or_else(|| self.upgrade.read(pos))
    }

    /// Writes every captured region out. Ordering arms the device last:
    /// the staged bootloader's vector, then the application vector tail,
    /// and only then the word the boot sequence keys off.
    pub fn flush<S: Sink>(&mut self, sink: &mut S) -> Result<(), SinkError> {
        if self.bootloader.captured {
            sink.write_bootloader(self.bootloader.start, &self.bootloader.buf)?;
        }
        if self.upgrade.captured {
            sink.write_application(self.upgrade.start, &self.upgrade.buf)?;
        }
        if self.app.captured {
            sink.write_application(self.app.start + 4, &self.app.buf[4..])?;
            sink.write_application(self.app.start, &self.app.buf[..4])?;
        }
        Ok(())
    }
}

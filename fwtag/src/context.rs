//! Per-session context shared between the parser and its caller.

use crate::format::{AppData, ImageContents};

/// Parser policy, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParserConfig {
    /// Reject images whose header does not declare a signature, and images
    /// that declare one but end without it.
    pub require_signature: bool,
    /// Reject images whose payload tags are not wrapped in an encrypted
    /// container.
    pub require_encryption: bool,
    /// Skip over tag ids the parser does not know instead of failing.
    /// Unknown tags are still covered by the CRC and the signature digest.
    pub allow_custom_tags: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            require_signature: true,
            require_encryption: false,
            allow_custom_tags: false,
        }
    }
}

/// What one image turned out to contain, and how far the session got.
///
/// `instructions` is set by the caller before the first chunk: only the
/// named components are written to the sink, everything else is parsed and
/// verified but discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageProperties {
    /// Components the caller wants applied.
    pub instructions: ImageContents,
    /// Components the image carries, filled in as their tags arrive.
    pub contents: ImageContents,
    /// Decoded Application descriptor, once its tag has been seen.
    pub application: Option<AppData>,
    /// Version a Bootloader tag declared.
    pub bootloader_version: u32,
    /// Payload size of the Bootloader tag, without the version and base
    /// address words.
    pub bootloader_upgrade_size: u32,
    /// Version a SecureElement tag declared.
    pub se_version: u32,
    /// The image's authenticity has been established: its signature
    /// verified, or its CRC checked on a session that does not require
    /// signatures.
    pub verified: bool,
    /// The End tag was reached and every finalize step succeeded.
    pub completed: bool,
}

impl ImageProperties {
    pub fn new(instructions: ImageContents) -> Self {
        ImageProperties {
            instructions,
            contents: ImageContents::empty(),
            application: None,
            bootloader_version: 0,
            bootloader_upgrade_size: 0,
            se_version: 0,
            verified: false,
            completed: false,
        }
    }
}

impl Default for ImageProperties {
    fn default() -> Self {
        Self::new(ImageContents::all())
    }
}

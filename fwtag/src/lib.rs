//! Streaming firmware tag-container parsing and secure-boot verification.
//!
//! An image is a flat stream of length-prefixed tags carrying application,
//! bootloader, secure-element and metadata payloads, optionally compressed
//! or wrapped in an AES-CTR container, authenticated by an ECDSA-P256
//! signature and a file CRC. [`Parser`] consumes the stream in chunks of
//! any size, writes payloads through a caller [`Sink`] while withholding
//! the bytes that would make the image bootable, and releases them only
//! after verification succeeds.
//!
//! Crypto primitives, device versions, keys and flash layout come in
//! through the [`Crypto`] and [`Board`] traits, so the crate stays
//! `no_std` and free of any particular implementation.

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "builder"))]
extern crate alloc;

#[cfg(any(test, feature = "builder"))]
mod builder;
pub mod codec;
mod context;
mod error;
mod format;
mod parser;
mod platform;
mod reassembler;
mod version;
mod withhold;
mod writer;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "builder"))]
pub use builder::ImageBuilder;
pub use context::{ImageProperties, ParserConfig};
pub use error::{Error, SinkError};
pub use format::{
    tag, AppData, Certificate, Comparator, Connective, ImageContents, Subject, TagHeader,
    VersionStatement, CERTIFICATE_STRUCT_VERSION, COMPATIBILITY_MAJOR_VERSION,
    ENCRYPTION_MODE_AES_CTR, FLASH_ERASE_VALUE, TAG_HEADER_SIZE, TYPE_ENCRYPTED, TYPE_SIGNED,
    WRITE_ALIGNMENT,
};
pub use parser::{Parser, Status};
pub use platform::{
    AesCtr, Board, CertificateAnchor, Crypto, MemoryLayout, PublicKey, Sha256, Sink, VerifyResult,
};
pub use version::RollbackSlots;

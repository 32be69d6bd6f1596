//! Trait seams to the hardware the engine runs on.
//!
//! The parser never implements a crypto primitive, touches a flash register
//! or reads a version word itself; everything physical comes in through
//! [`Crypto`], [`Board`] and [`Sink`].

use crate::{
    error::SinkError,
    format::{AppData, ImageContents},
};

/// Outcome of a signature verification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum VerifyResult {
    // The values are arbitrary, but chosen to be different by more than one
    // bit to make glitching attacks more difficult.
    Valid = 0xA11D_900D,
    Invalid = 0xBAD5_16ED,
}

/// An uncompressed ECDSA-P256 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[..32]);
        y.copy_from_slice(&bytes[32..]);
        PublicKey { x, y }
    }
}

/// Trust anchor for the Certificate tag: the CA key certificates must be
/// signed with, and the lowest certificate version still accepted.
#[derive(Debug, Clone, Copy)]
pub struct CertificateAnchor {
    pub min_version: u32,
    pub key: PublicKey,
}

/// Streaming SHA-256 state.
pub trait Sha256 {
    fn update(&mut self, data: &[u8]);
    fn finalize(self) -> [u8; 32];
}

/// Streaming AES-CTR-128 state. Decrypts (or encrypts; CTR is symmetric)
/// in place, keeping its keystream position across calls.
pub trait AesCtr {
    fn apply(&mut self, data: &mut [u8]);
}

/// Factory for the opaque crypto primitives the engine consumes.
pub trait Crypto {
    type Sha: Sha256;
    type Cipher: AesCtr;

    fn sha256(&self) -> Self::Sha;

    /// Build a cipher whose counter block is `nonce || u32be(1)`.
    fn aes_ctr(&self, key: &[u8; 16], nonce: &[u8; 12]) -> Self::Cipher;

    fn verify_p256(
        &self,
        digest: &[u8; 32],
        r: &[u8; 32],
        s: &[u8; 32],
        key: &PublicKey,
    ) -> VerifyResult;
}

/// Flash layout the engine needs to place withheld regions and sanity-check
/// bootloader upgrades.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// First address of application flash. The application's reset vector
    /// word lives at `start_of_app_space + 4`.
    pub start_of_app_space: u32,
    /// Address a Bootloader tag must declare as its base.
    pub bootloader_base: u32,
    /// Staging location for bootloader upgrades; its reset vector word is
    /// withheld like the application's.
    pub upgrade_location: u32,
}

/// Device state and policy: running versions, trust anchors, anti-rollback
/// slots, and the acceptance hooks.
pub trait Board {
    fn memory_layout(&self) -> MemoryLayout;

    /// Version of the currently flashed application. `None` when no
    /// application is present or its properties are unreadable; a
    /// version-dependency statement on the application then folds as false
    /// instead of erroring.
    fn application_version(&self) -> Option<u32>;

    fn bootloader_version(&self) -> u32;

    /// `None` when the device has no secure element.
    fn secure_element_version(&self) -> Option<u32> {
        None
    }

    /// Pre-provisioned key the final Signature tag is verified with when no
    /// certificate was accepted.
    fn root_key(&self) -> &PublicKey;

    /// Second root key tried when the first rejects the signature.
    fn fallback_key(&self) -> Option<&PublicKey> {
        None
    }

    /// Anchor for Certificate tags. `None` means certificates are not
    /// accepted on this device.
    fn certificate_anchor(&self) -> Option<&CertificateAnchor> {
        None
    }

    /// Key for EncryptionData containers. `None` means encrypted images
    /// cannot be processed.
    fn decryption_key(&self) -> Option<&[u8; 16]> {
        None
    }

    /// Highest application version recorded in the anti-rollback slots.
    fn highest_seen_version(&self) -> Option<u32>;

    /// Whether `version` could be recorded: it already is, or a free slot
    /// remains.
    fn can_remember_version(&self, version: u32) -> bool;

    /// Record `version` in the anti-rollback slots. Returns false when the
    /// slot set is full.
    fn remember_version(&mut self, version: u32) -> bool;

    /// Application-specific acceptance veto, called once with the decoded
    /// Application record. Returning false fails the parse with
    /// [`Rejected`](crate::Error::Rejected).
    fn accept_application(&self, app: &AppData) -> bool {
        let _ = app;
        true
    }

    /// Same-version self-upgrade policy: skip the version-dependency gate at
    /// finalize. The default reproduces the stock rule: if the image
    /// carries a bootloader or secure-element upgrade whose declared version
    /// equals the one already running, an earlier stage of this multi-stage
    /// upgrade has already been applied and the gate was evaluated then.
    fn version_gate_bypass(&self, props: &crate::ImageProperties) -> bool {
        if props.contents.contains(ImageContents::BOOTLOADER)
            && self.bootloader_version() == props.bootloader_version
        {
            return true;
        }
        if props.contents.contains(ImageContents::SECURE_ELEMENT)
            && self.secure_element_version() == Some(props.se_version)
        {
            return true;
        }
        false
    }
}

/// Caller-supplied write sink. Offsets handed to `write_bootloader` and
/// `write_metadata` are tag-relative; `write_application` addresses are
/// absolute flash addresses.
pub trait Sink {
    fn write_application(&mut self, address: u32, data: &[u8]) -> Result<(), SinkError>;

    /// Receives Bootloader tag data, and SecureElement tag data on devices
    /// that stage secure-element upgrades through the same slot.
    fn write_bootloader(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError>;

    fn write_metadata(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError>;

    /// Erase the target range before an EraseProg tag's data is written.
    fn erase_application_range(&mut self, address: u32, length: u32) -> Result<(), SinkError>;

    /// Read back already-committed application bytes for codec
    /// backtracking.
    fn read_application(&mut self, address: u32, out: &mut [u8]) -> Result<(), SinkError>;
}

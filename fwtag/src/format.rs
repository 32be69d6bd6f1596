//! Wire format of the tag container.
//!
//! A container is a flat stream of tags, each `u32le tag_id, u32le length,
//! payload[length]`. The first tag must be [`tag::HEADER`]; the last tag is
//! [`tag::END`] carrying a CRC-32 over every preceding wire byte.

use crate::error::Error;

/// Tag identifiers.
pub mod tag {
    pub const HEADER: u32 = 0x5AFE_0001;
    pub const APPLICATION: u32 = 0x5AFE_0010;
    pub const BOOTLOADER: u32 = 0x5AFE_0020;
    pub const SECURE_ELEMENT: u32 = 0x5AFE_0030;
    pub const METADATA: u32 = 0x5AFE_0040;
    pub const PROG: u32 = 0x5AFE_0050;
    pub const ERASE_PROG: u32 = 0x5AFE_0051;
    pub const VERSION_DEPENDENCY: u32 = 0x5AFE_0060;
    pub const ENCRYPTION_INIT: u32 = 0x5AFE_0070;
    pub const ENCRYPTION_DATA: u32 = 0x5AFE_0071;
    pub const CERTIFICATE: u32 = 0x5AFE_0080;
    pub const SIGNATURE_ECDSA_P256: u32 = 0x5AFE_0081;
    pub const END: u32 = 0x5AFE_00F0;

    /// Default id of the token-stream compressed programming tag.
    pub const LZ_PROG: u32 = 0x5AFE_0150;
    /// Default id of the block-compressed programming tag.
    pub const BLOCK_PROG: u32 = 0x5AFE_0151;
}

/// Size of a tag header on the wire.
pub const TAG_HEADER_SIZE: usize = 8;

/// Major container version this parser understands, stored in the top byte
/// of the Header tag's version word.
pub const COMPATIBILITY_MAJOR_VERSION: u32 = 0x0300_0000;
pub const VERSION_MAJOR_MASK: u32 = 0xFF00_0000;

/// Header tag type-flags bit: payload tags are wrapped in an encrypted
/// container.
pub const TYPE_ENCRYPTED: u32 = 1 << 0;
/// Header tag type-flags bit: the container carries an ECDSA-P256 signature.
pub const TYPE_SIGNED: u32 = 1 << 8;

/// Cipher selector carried in the EncryptionInit tag. AES-CTR-128 is the
/// only mode defined.
pub const ENCRYPTION_MODE_AES_CTR: u32 = 1;

/// Certificate record layout version understood by this parser.
pub const CERTIFICATE_STRUCT_VERSION: u32 = 1;

/// Value flash erases to; also the fill for word-alignment padding and for
/// withheld bytes handed to the sink before verification.
pub const FLASH_ERASE_VALUE: u8 = 0xFF;

/// Word size all sink writes are aligned to.
pub const WRITE_ALIGNMENT: usize = 4;

/// CRC-32/ISO-HDLC over a stream followed by its own little-endian CRC
/// always finalizes to this constant.
pub const CRC32_RESIDUE: u32 = 0x2144_DF1C;

pub const fn u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub const fn u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// A tag header as read off the wire. Immutable once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TagHeader {
    pub tag_id: u32,
    pub length: u32,
}

impl TagHeader {
    pub fn decode(buf: &[u8; TAG_HEADER_SIZE]) -> Self {
        TagHeader {
            tag_id: u32_le(buf, 0),
            length: u32_le(buf, 4),
        }
    }
}

/// Fixed application descriptor carried by the Application tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppData {
    pub app_type: u32,
    pub version: u32,
    pub capabilities: u32,
    pub product_id: [u8; 16],
}

impl AppData {
    pub const SIZE: usize = 28;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut product_id = [0u8; 16];
        product_id.copy_from_slice(&buf[12..28]);
        AppData {
            app_type: u32_le(buf, 0),
            version: u32_le(buf, 4),
            capabilities: u32_le(buf, 8),
            product_id,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.app_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.capabilities.to_le_bytes());
        buf[12..28].copy_from_slice(&self.product_id);
        buf
    }
}

/// Certificate record carried by the Certificate tag. The first
/// [`Certificate::SIGNED_SIZE`] bytes are covered by its own signature.
#[derive(Clone)]
pub struct Certificate {
    pub struct_version: u32,
    pub key: [u8; 64],
    pub version: u32,
    pub signature: [u8; 64],
}

impl Certificate {
    pub const SIZE: usize = 136;
    /// struct_version + key + version.
    pub const SIGNED_SIZE: usize = 72;

    pub const fn empty() -> Self {
        Certificate {
            struct_version: 0,
            key: [0; 64],
            version: 0,
            signature: [0; 64],
        }
    }

    /// The portion covered by the certificate signature, serialized exactly
    /// as it appears on the wire.
    pub fn signed_bytes(&self) -> [u8; Self::SIGNED_SIZE] {
        let mut buf = [0u8; Self::SIGNED_SIZE];
        buf[0..4].copy_from_slice(&self.struct_version.to_le_bytes());
        buf[4..68].copy_from_slice(&self.key);
        buf[68..72].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..72].copy_from_slice(&self.signed_bytes());
        buf[72..136].copy_from_slice(&self.signature);
        buf
    }
}

/// Which components an image carries, and which of them the caller wants
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageContents(u32);

bitflags::bitflags! {
    impl ImageContents: u32 {
        const APPLICATION = 1 << 0;
        const BOOTLOADER = 1 << 1;
        const SECURE_ELEMENT = 1 << 2;
    }
}

/// Subject of a version-dependency statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Subject {
    Application,
    Bootloader,
    SecureElement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Comparator {
    Lt,
    Leq,
    Eq,
    Geq,
    Gt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Connective {
    And,
    Or,
}

/// One statement of a VersionDependency tag.
///
/// Wire layout (8 bytes): `subject u8, statement u8, reserved u16,
/// version u32le`. The statement byte packs the comparator in bits 0..=2,
/// its negate bit in bit 3, the connective in bit 4 and the connective
/// negate bit in bit 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VersionStatement {
    pub subject: Subject,
    pub comparator: Comparator,
    pub comparator_negate: bool,
    pub connective: Connective,
    pub connective_negate: bool,
    pub version: u32,
}

impl VersionStatement {
    pub const SIZE: usize = 8;

    const COMPARATOR_MASK: u8 = 0b0000_0111;
    const COMPARATOR_NEGATE: u8 = 1 << 3;
    const CONNECTIVE_OR: u8 = 1 << 4;
    const CONNECTIVE_NEGATE: u8 = 1 << 5;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self, Error> {
        let subject = match buf[0] {
            0 => Subject::Application,
            1 => Subject::Bootloader,
            2 => Subject::SecureElement,
            _ => return Err(Error::UnexpectedTag),
        };
        let statement = buf[1];
        let comparator = match statement & Self::COMPARATOR_MASK {
            0 => Comparator::Lt,
            1 => Comparator::Leq,
            2 => Comparator::Eq,
            3 => Comparator::Geq,
            4 => Comparator::Gt,
            _ => return Err(Error::UnexpectedTag),
        };
        Ok(VersionStatement {
            subject,
            comparator,
            comparator_negate: statement & Self::COMPARATOR_NEGATE != 0,
            connective: if statement & Self::CONNECTIVE_OR != 0 {
                Connective::Or
            } else {
                Connective::And
            },
            connective_negate: statement & Self::CONNECTIVE_NEGATE != 0,
            version: u32_le(buf, 4),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut statement = match self.comparator {
            Comparator::Lt => 0,
            Comparator::Leq => 1,
            Comparator::Eq => 2,
            Comparator::Geq => 3,
            Comparator::Gt => 4,
        };
        if self.comparator_negate {
            statement |= Self::COMPARATOR_NEGATE;
        }
        if self.connective == Connective::Or {
            statement |= Self::CONNECTIVE_OR;
        }
        if self.connective_negate {
            statement |= Self::CONNECTIVE_NEGATE;
        }
        let mut buf = [0u8; Self::SIZE];
        buf[0] = match self.subject {
            Subject::Application => 0,
            Subject::Bootloader => 1,
            Subject::SecureElement => 2,
        };
        buf[1] = statement;
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf
    }
}

//! Streaming tag-container parser.
//!
//! One [`Parser`] is one verification session. The caller feeds the image
//! in chunks of any size; the parser reassembles tags, keeps the running
//! CRC and signature digest, peels the encrypted container, routes payload
//! bytes to the sink, and finalizes at the End tag. Any error latches the
//! session; the only recovery is a new parser and a re-stream.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

use crate::{
    codec::{TagCodec, WriterOutput},
    context::{ImageProperties, ParserConfig},
    error::Error,
    format::{
        tag, u32_le, AppData, Certificate, ImageContents, TagHeader, VersionStatement,
        CERTIFICATE_STRUCT_VERSION, COMPATIBILITY_MAJOR_VERSION, CRC32_RESIDUE,
        ENCRYPTION_MODE_AES_CTR, TAG_HEADER_SIZE, TYPE_ENCRYPTED, TYPE_SIGNED,
        VERSION_MAJOR_MASK, WRITE_ALIGNMENT,
    },
    platform::{AesCtr, Board, Crypto, MemoryLayout, PublicKey, Sha256, Sink, VerifyResult},
    reassembler::{Control, Reassembler},
    version::VersionFold,
    withhold::Withheld,
    writer::{ProgWriter, Target},
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Scratch for payload streaming; bounds a single sink write.
const SCRATCH: usize = 256;

/// Progress of a session after a chunk has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// The chunk was consumed; more of the image is expected.
    InProgress,
    /// The End tag was reached and the image finalized. Any bytes after it
    /// were ignored.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CertPart {
    StructVersion,
    Key,
    Version,
    Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FileHeader,
    FileHeaderBody,
    Idle,
    Application,
    BootloaderInfo { length: u32 },
    BootloaderData { remaining: u32 },
    SecureElementInfo { length: u32 },
    SecureElementData { remaining: u32 },
    /// Metadata payloads and skipped custom tags; `writing` decides whether
    /// the bytes reach the sink.
    RawData { remaining: u32 },
    ProgAddress { erase: bool, data_len: u32 },
    ProgData { remaining: u32 },
    CodecAddress { index: usize, data_len: u32 },
    CodecData { index: usize, remaining: u32 },
    VersionDependency { remaining: u32 },
    EncryptionInit,
    Certificate { part: CertPart },
    Signature,
    End,
    Done,
    Failed,
}

enum OuterHeader {
    Available,
    Starved,
    Ended(TagHeader),
}

enum DataRun {
    Starved(u32),
    More(u32),
    Done,
}

pub struct Parser<C: Crypto> {
    crypto: C,
    config: ParserConfig,
    layout: MemoryLayout,
    state: State,
    reassembler: Reassembler,
    writer: ProgWriter,
    withheld: Withheld,
    fold: VersionFold,
    crc: Option<Digest<'static, u32>>,
    sha: Option<C::Sha>,
    cipher: Option<C::Cipher>,
    file_encrypted: bool,
    in_container: bool,
    container_remaining: u32,
    outer_header: [u8; TAG_HEADER_SIZE],
    outer_header_len: usize,
    cert: Certificate,
    cert_key: Option<PublicKey>,
    got_signature: bool,
    writing: bool,
}

impl<C: Crypto> Parser<C> {
    pub fn new(crypto: C, config: ParserConfig, layout: MemoryLayout) -> Result<Self, Error> {
        if layout.start_of_app_space as usize % WRITE_ALIGNMENT != 0
            || layout.bootloader_base as usize % WRITE_ALIGNMENT != 0
            || layout.upgrade_location as usize % WRITE_ALIGNMENT != 0
        {
            return Err(Error::Init);
        }
        let sha = crypto.sha256();
        Ok(Parser {
            crypto,
            config,
            state: State::FileHeader,
            reassembler: Reassembler::new(),
            writer: ProgWriter::new(),
            withheld: Withheld::new(&layout),
            fold: VersionFold::new(),
            layout,
            crc: Some(CRC32.digest()),
            sha: Some(sha),
            cipher: None,
            file_encrypted: false,
            in_container: false,
            container_remaining: 0,
            outer_header: [0; TAG_HEADER_SIZE],
            outer_header_len: 0,
            cert: Certificate::empty(),
            cert_key: None,
            got_signature: false,
            writing: false,
        })
    }

    /// Consumes one chunk of the image. Returns [`Status::Done`] once the
    /// End tag has been processed; after that (or after any error) the
    /// session is finished and further calls fail with
    /// [`Error::EndOfStream`].
    pub fn parse<B: Board, S: Sink>(
        &mut self,
        props: &mut ImageProperties,
        board: &mut B,
        sink: &mut S,
        codecs: &mut [&mut dyn TagCodec],
        chunk: &[u8],
    ) -> Result<Status, Error> {
        if matches!(self.state, State::Done | State::Failed) {
            return Err(Error::EndOfStream);
        }
        let mut input = chunk;
        loop {
            match self.step(props, board, sink, codecs, &mut input) {
                Ok(Control::Parsed) => {
                    if matches!(self.state, State::Done) {
                        return Ok(Status::Done);
                    }
                }
                Ok(Control::Starved) => return Ok(Status::InProgress),
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }
    }

    fn step<B: Board, S: Sink>(
        &mut self,
        props: &mut ImageProperties,
        board: &mut B,
        sink: &mut S,
        codecs: &mut [&mut dyn TagCodec],
        input: &mut &[u8],
    ) -> Result<Control, Error> {
        match self.state {
            State::FileHeader => {
                let mut raw = [0u8; TAG_HEADER_SIZE];
                if self.pull_wire(input, &mut raw, false, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let header = TagHeader::decode(&raw);
                if header.tag_id != tag::HEADER || header.length != 8 {
                    return Err(Error::FileType);
                }
                self.sha_header(&raw, header.tag_id);
                self.state = State::FileHeaderBody;
                Ok(Control::Parsed)
            }
            State::FileHeaderBody => {
                let mut raw = [0u8; 8];
                if self.pull_wire(input, &mut raw, true, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let version = u32_le(&raw, 0);
                let flags = u32_le(&raw, 4);
                if version & VERSION_MAJOR_MASK != COMPATIBILITY_MAJOR_VERSION {
                    return Err(Error::VersionMismatch);
                }
                self.file_encrypted = flags & TYPE_ENCRYPTED != 0;
                let signed = flags & TYPE_SIGNED != 0;
                if self.config.require_signature && !signed {
                    return Err(Error::FileType);
                }
                if self.config.require_encryption && !self.file_encrypted {
                    return Err(Error::FileType);
                }
                self.state = State::Idle;
                Ok(Control::Parsed)
            }
            State::Idle => {
                let mut raw = [0u8; TAG_HEADER_SIZE];
                if self.in_container {
                    if self.container_remaining == 0 && self.reassembler.buffered() == 0 {
                        // A tag boundary coinciding with the container end:
                        // either another container follows or the plaintext
                        // trailer begins.
                        match self.refill_container(input)? {
                            OuterHeader::Starved => return Ok(Control::Starved),
                            OuterHeader::Available => {}
                            OuterHeader::Ended(header) => {
                                self.in_container = false;
                                let raw = self.outer_header;
                                self.sha_header(&raw, header.tag_id);
                                return self.dispatch(props, board, codecs, header);
                            }
                        }
                    }
                    if self.pull_data(input, &mut raw, true)? == Control::Starved {
                        return Ok(Control::Starved);
                    }
                    // Ciphertext was absorbed at intake; nothing more to
                    // hash for an inner header.
                    let header = TagHeader::decode(&raw);
                    self.dispatch(props, board, codecs, header)
                } else {
                    if self.pull_wire(input, &mut raw, false, false)? == Control::Starved {
                        return Ok(Control::Starved);
                    }
                    let header = TagHeader::decode(&raw);
                    self.sha_header(&raw, header.tag_id);
                    self.dispatch(props, board, codecs, header)
                }
            }
            State::Application => {
                let mut raw = [0u8; AppData::SIZE];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let app = AppData::decode(&raw);
                props.contents |= ImageContents::APPLICATION;
                if props.instructions.contains(ImageContents::APPLICATION) {
                    if !board.accept_application(&app) {
                        return Err(Error::Rejected);
                    }
                    if let Some(highest) = board.highest_seen_version() {
                        if app.version < highest {
                            return Err(Error::Rejected);
                        }
                    }
                    if !board.can_remember_version(app.version) {
                        return Err(Error::Rejected);
                    }
                }
                props.application = Some(app);
                self.state = State::Idle;
                Ok(Control::Parsed)
            }
            State::BootloaderInfo { length } => {
                let mut raw = [0u8; 8];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let version = u32_le(&raw, 0);
                let base = u32_le(&raw, 4);
                if base != self.layout.bootloader_base {
                    return Err(Error::UnexpectedTag);
                }
                props.contents |= ImageContents::BOOTLOADER;
                props.bootloader_version = version;
                props.bootloader_upgrade_size = length - 8;
                self.writing = props.instructions.contains(ImageContents::BOOTLOADER);
                if self.writing {
                    self.writer.begin(Target::Bootloader, 0)?;
                }
                self.state = State::BootloaderData {
                    remaining: length - 8,
                };
                Ok(Control::Parsed)
            }
            State::BootloaderData { remaining } => {
                match self.stream_to_writer(input, sink, remaining)? {
                    DataRun::Done => {
                        self.state = State::Idle;
                        Ok(Control::Parsed)
                    }
                    DataRun::More(left) => {
                        self.state = State::BootloaderData { remaining: left };
                        Ok(Control::Parsed)
                    }
                    DataRun::Starved(left) => {
                        self.state = State::BootloaderData { remaining: left };
                        Ok(Control::Starved)
                    }
                }
            }
            State::SecureElementInfo { length } => {
                let mut raw = [0u8; 4];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                props.contents |= ImageContents::SECURE_ELEMENT;
                props.se_version = u32_le(&raw, 0);
                self.writing = props.instructions.contains(ImageContents::SECURE_ELEMENT);
                if self.writing {
                    self.writer.begin(Target::SecureElement, 0)?;
                }
                self.state = State::SecureElementData {
                    remaining: length - 4,
                };
                Ok(Control::Parsed)
            }
            State::SecureElementData { remaining } => {
                match self.stream_to_writer(input, sink, remaining)? {
                    DataRun::Done => {
                        self.state = State::Idle;
                        Ok(Control::Parsed)
                    }
                    DataRun::More(left) => {
                        self.state = State::SecureElementData { remaining: left };
                        Ok(Control::Parsed)
                    }
                    DataRun::Starved(left) => {
                        self.state = State::SecureElementData { remaining: left };
                        Ok(Control::Starved)
                    }
                }
            }
            State::RawData { remaining } => {
                match self.stream_to_writer(input, sink, remaining)? {
                    DataRun::Done => {
                        self.state = State::Idle;
                        Ok(Control::Parsed)
                    }
                    DataRun::More(left) => {
                        self.state = State::RawData { remaining: left };
                        Ok(Control::Parsed)
                    }
                    DataRun::Starved(left) => {
                        self.state = State::RawData { remaining: left };
                        Ok(Control::Starved)
                    }
                }
            }
            State::ProgAddress { erase, data_len } => {
                let mut raw = [0u8; 4];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let address = u32_le(&raw, 0);
                self.writing = props.instructions.contains(ImageContents::APPLICATION);
                if self.writing {
                    if erase && data_len > 0 {
                        sink.erase_application_range(address, data_len)?;
                    }
                    self.writer.begin(Target::Application, address)?;
                }
                self.state = State::ProgData {
                    remaining: data_len,
                };
                Ok(Control::Parsed)
            }
            State::ProgData { remaining } => {
                match self.stream_to_writer(input, sink, remaining)? {
                    DataRun::Done => {
                        self.state = State::Idle;
                        Ok(Control::Parsed)
                    }
                    DataRun::More(left) => {
                        self.state = State::ProgData { remaining: left };
                        Ok(Control::Parsed)
                    }
                    DataRun::Starved(left) => {
                        self.state = State::ProgData { remaining: left };
                        Ok(Control::Starved)
                    }
                }
            }
            State::CodecAddress { index, data_len } => {
                let mut raw = [0u8; 4];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let address = u32_le(&raw, 0);
                self.writing = props.instructions.contains(ImageContents::APPLICATION);
                codecs[index].reset();
                if self.writing {
                    self.writer.begin(Target::Application, address)?;
                }
                self.state = State::CodecData {
                    index,
                    remaining: data_len,
                };
                Ok(Control::Parsed)
            }
            State::CodecData { index, remaining } => {
                if remaining == 0 {
                    if self.writing {
                        let Parser {
                            writer, withheld, ..
                        } = self;
                        let mut out = WriterOutput {
                            writer,
                            withheld,
                            sink: &mut *sink,
                        };
                        codecs[index].finish(&mut out)?;
                        self.finish_tag(sink)?;
                    }
                    self.state = State::Idle;
                    return Ok(Control::Parsed);
                }
                let mut scratch = [0u8; SCRATCH];
                let n = self.take_data(input, &mut scratch, remaining as usize)?;
                if n == 0 {
                    return Ok(Control::Starved);
                }
                if self.writing {
                    let Parser {
                        writer, withheld, ..
                    } = self;
                    let mut out = WriterOutput {
                        writer,
                        withheld,
                        sink: &mut *sink,
                    };
                    codecs[index].decompress(&mut out, &scratch[..n])?;
                }
                self.state = State::CodecData {
                    index,
                    remaining: remaining - n as u32,
                };
                Ok(Control::Parsed)
            }
            State::VersionDependency { remaining } => {
                let mut raw = [0u8; VersionStatement::SIZE];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let statement = VersionStatement::decode(&raw)?;
                self.fold.apply(board, &statement)?;
                let left = remaining - VersionStatement::SIZE as u32;
                self.state = if left == 0 {
                    State::Idle
                } else {
                    State::VersionDependency { remaining: left }
                };
                Ok(Control::Parsed)
            }
            State::EncryptionInit => {
                let mut raw = [0u8; 16];
                if self.pull_data(input, &mut raw, true)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                if u32_le(&raw, 0) != ENCRYPTION_MODE_AES_CTR {
                    return Err(Error::UnexpectedTag);
                }
                let key = board.decryption_key().ok_or(Error::DecryptionKey)?;
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&raw[4..16]);
                self.cipher = Some(self.crypto.aes_ctr(key, &nonce));
                self.state = State::Idle;
                Ok(Control::Parsed)
            }
            State::Certificate { part } => self.step_certificate(board, input, part),
            State::Signature => {
                let mut raw = [0u8; 64];
                if self.pull_wire(input, &mut raw, false, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let sha = self.sha.take().ok_or(Error::UnexpectedTag)?;
                let digest = sha.finalize();
                let mut r = [0u8; 32];
                let mut s = [0u8; 32];
                r.copy_from_slice(&raw[..32]);
                s.copy_from_slice(&raw[32..]);
                let valid = match &self.cert_key {
                    Some(key) => {
                        self.crypto.verify_p256(&digest, &r, &s, key) == VerifyResult::Valid
                    }
                    None => {
                        self.crypto.verify_p256(&digest, &r, &s, board.root_key())
                            == VerifyResult::Valid
                            || board.fallback_key().is_some_and(|key| {
                                self.crypto.verify_p256(&digest, &r, &s, key)
                                    == VerifyResult::Valid
                            })
                    }
                };
                if !valid {
                    return Err(Error::SignatureRejected);
                }
                props.verified = true;
                self.got_signature = true;
                self.state = State::Idle;
                Ok(Control::Parsed)
            }
            State::End => {
                let mut raw = [0u8; 4];
                if self.pull_wire(input, &mut raw, false, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                let crc = self.crc.take().ok_or(Error::EndOfStream)?;
                if crc.finalize() != CRC32_RESIDUE {
                    return Err(Error::CrcMismatch);
                }
                if !self.config.require_signature {
                    props.verified = true;
                }
                if !self.fold.satisfied() && !board.version_gate_bypass(props) {
                    return Err(Error::VersionMismatch);
                }
                if props.instructions.contains(ImageContents::APPLICATION)
                    && props.contents.contains(ImageContents::APPLICATION)
                {
                    if let Some(app) = &props.application {
                        if !board.remember_version(app.version) {
                            return Err(Error::Rejected);
                        }
                    }
                }
                self.withheld.flush(sink)?;
                props.completed = true;
                self.state = State::Done;
                Ok(Control::Parsed)
            }
            State::Done | State::Failed => Err(Error::EndOfStream),
        }
    }

    fn step_certificate<B: Board>(
        &mut self,
        board: &mut B,
        input: &mut &[u8],
        part: CertPart,
    ) -> Result<Control, Error> {
        match part {
            CertPart::StructVersion => {
                let mut raw = [0u8; 4];
                if self.pull_wire(input, &mut raw, true, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                self.cert.struct_version = u32_le(&raw, 0);
                if self.cert.struct_version != CERTIFICATE_STRUCT_VERSION {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::Certificate {
                    part: CertPart::Key,
                };
            }
            CertPart::Key => {
                let mut raw = [0u8; 64];
                if self.pull_wire(input, &mut raw, true, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                self.cert.key = raw;
                self.state = State::Certificate {
                    part: CertPart::Version,
                };
            }
            CertPart::Version => {
                let mut raw = [0u8; 4];
                if self.pull_wire(input, &mut raw, true, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                self.cert.version = u32_le(&raw, 0);
                self.state = State::Certificate {
                    part: CertPart::Signature,
                };
            }
            CertPart::Signature => {
                let mut raw = [0u8; 64];
                if self.pull_wire(input, &mut raw, true, false)? == Control::Starved {
                    return Ok(Control::Starved);
                }
                self.cert.signature = raw;
                let anchor = *board.certificate_anchor().ok_or(Error::UnexpectedTag)?;
                if self.cert.version < anchor.min_version {
                    return Err(Error::SignatureRejected);
                }
                let mut sha = self.crypto.sha256();
                sha.update(&self.cert.signed_bytes());
                let digest = sha.finalize();
                let mut r = [0u8; 32];
                let mut s = [0u8; 32];
                r.copy_from_slice(&self.cert.signature[..32]);
                s.copy_from_slice(&self.cert.signature[32..]);
                if self.crypto.verify_p256(&digest, &r, &s, &anchor.key) != VerifyResult::Valid {
                    return Err(Error::SignatureRejected);
                }
                self.cert_key = Some(PublicKey::from_bytes(&self.cert.key));
                self.state = State::Idle;
            }
        }
        Ok(Control::Parsed)
    }

    fn dispatch<B: Board>(
        &mut self,
        props: &mut ImageProperties,
        board: &B,
        codecs: &mut [&mut dyn TagCodec],
        header: TagHeader,
    ) -> Result<Control, Error> {
        if self.got_signature && header.tag_id != tag::END {
            return Err(Error::UnexpectedTag);
        }
        // Outside the container of an encrypted image only the encryption
        // tags and the plaintext trailer are legal.
        if self.file_encrypted && !self.in_container {
            match header.tag_id {
                tag::ENCRYPTION_INIT
                | tag::ENCRYPTION_DATA
                | tag::CERTIFICATE
                | tag::SIGNATURE_ECDSA_P256
                | tag::END => {}
                _ => return Err(Error::UnexpectedTag),
            }
        }
        self.writing = false;
        match header.tag_id {
            tag::HEADER => Err(Error::UnexpectedTag),
            tag::APPLICATION => {
                if header.length as usize != AppData::SIZE {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::Application;
                Ok(Control::Parsed)
            }
            tag::BOOTLOADER => {
                if header.length < 8 {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::BootloaderInfo {
                    length: header.length,
                };
                Ok(Control::Parsed)
            }
            tag::SECURE_ELEMENT => {
                if header.length < 4 {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::SecureElementInfo {
                    length: header.length,
                };
                Ok(Control::Parsed)
            }
            tag::METADATA => {
                self.writing = true;
                self.writer.begin(Target::Metadata, 0)?;
                self.state = State::RawData {
                    remaining: header.length,
                };
                Ok(Control::Parsed)
            }
            tag::PROG | tag::ERASE_PROG => {
                if header.length < 4 {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::ProgAddress {
                    erase: header.tag_id == tag::ERASE_PROG,
                    data_len: header.length - 4,
                };
                Ok(Control::Parsed)
            }
            tag::VERSION_DEPENDENCY => {
                if header.length == 0 || header.length as usize % VersionStatement::SIZE != 0 {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::VersionDependency {
                    remaining: header.length,
                };
                Ok(Control::Parsed)
            }
            tag::ENCRYPTION_INIT => {
                if !self.file_encrypted || self.in_container || header.length != 16 {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::EncryptionInit;
                Ok(Control::Parsed)
            }
            tag::ENCRYPTION_DATA => {
                if !self.file_encrypted || self.in_container {
                    return Err(Error::UnexpectedTag);
                }
                if self.cipher.is_none() {
                    return Err(Error::DecryptionKey);
                }
                self.in_container = true;
                self.container_remaining = header.length;
                self.state = State::Idle;
                Ok(Control::Parsed)
            }
            tag::CERTIFICATE => {
                if self.in_container
                    || header.length as usize != Certificate::SIZE
                    || self.cert_key.is_some()
                {
                    return Err(Error::UnexpectedTag);
                }
                if board.certificate_anchor().is_none() {
                    return Err(Error::UnexpectedTag);
                }
                self.cert = Certificate::empty();
                self.state = State::Certificate {
                    part: CertPart::StructVersion,
                };
                Ok(Control::Parsed)
            }
            tag::SIGNATURE_ECDSA_P256 => {
                if self.in_container || header.length != 64 {
                    return Err(Error::UnexpectedTag);
                }
                self.state = State::Signature;
                Ok(Control::Parsed)
            }
            tag::END => {
                if self.in_container || header.length != 4 {
                    return Err(Error::UnexpectedTag);
                }
                if self.config.require_signature && !self.got_signature {
                    return Err(Error::SignatureRejected);
                }
                self.state = State::End;
                Ok(Control::Parsed)
            }
            _ => {
                if let Some(index) = codecs.iter().position(|c| c.tag_id() == header.tag_id) {
                    if header.length < 4 {
                        return Err(Error::UnexpectedTag);
                    }
                    self.state = State::CodecAddress {
                        index,
                        data_len: header.length - 4,
                    };
                    return Ok(Control::Parsed);
                }
                if self.config.allow_custom_tags {
                    // Skipped, but still part of the CRC and the digest.
                    self.state = State::RawData {
                        remaining: header.length,
                    };
                    Ok(Control::Parsed)
                } else if self.in_container {
                    // An unknown id in decrypted bytes usually means the
                    // wrong key turned the stream to garbage.
                    Err(Error::DecryptionKey)
                } else {
                    Err(Error::UnknownTag)
                }
            }
        }
    }

    /// Reads the next plaintext tag header between containers. Consecutive
    /// EncryptionData tags refill the container transparently; any other id
    /// ends the encrypted run.
    fn refill_container(&mut self, input: &mut &[u8]) -> Result<OuterHeader, Error> {
        loop {
            while self.outer_header_len < TAG_HEADER_SIZE {
                if input.is_empty() {
                    return Ok(OuterHeader::Starved);
                }
                let byte = [input[0]];
                if let Some(crc) = self.crc.as_mut() {
                    crc.update(&byte);
                }
                self.outer_header[self.outer_header_len] = byte[0];
                self.outer_header_len += 1;
                *input = &input[1..];
            }
            let header = TagHeader::decode(&self.outer_header);
            self.outer_header_len = 0;
            if header.tag_id == tag::ENCRYPTION_DATA {
                if let Some(sha) = self.sha.as_mut() {
                    sha.update(&self.outer_header);
                }
                self.container_remaining = header.length;
                if self.container_remaining > 0 {
                    return Ok(OuterHeader::Available);
                }
            } else {
                return Ok(OuterHeader::Ended(header));
            }
        }
    }

    /// Fixed-size read straight off the wire: CRC always, digest when
    /// `sha_on`, in-place decryption when `decrypt`.
    fn pull_wire(
        &mut self,
        input: &mut &[u8],
        out: &mut [u8],
        sha_on: bool,
        decrypt: bool,
    ) -> Result<Control, Error> {
        let Parser {
            reassembler,
            crc,
            sha,
            cipher,
            ..
        } = self;
        reassembler.pull(input, out, |bytes| {
            if let Some(crc) = crc.as_mut() {
                crc.update(bytes);
            }
            if sha_on {
                if let Some(sha) = sha.as_mut() {
                    sha.update(bytes);
                }
            }
            if decrypt {
                if let Some(cipher) = cipher.as_mut() {
                    cipher.apply(bytes);
                }
            }
        })
    }

    /// Fixed-size read of logical payload bytes, crossing container
    /// boundaries when the image is encrypted.
    fn pull_data(
        &mut self,
        input: &mut &[u8],
        out: &mut [u8],
        sha_on: bool,
    ) -> Result<Control, Error> {
        if !self.in_container {
            return self.pull_wire(input, out, sha_on, false);
        }
        loop {
            if self.container_remaining == 0 {
                match self.refill_container(input)? {
                    OuterHeader::Starved => return Ok(Control::Starved),
                    OuterHeader::Ended(_) => return Err(Error::UnexpectedTag),
                    OuterHeader::Available => {}
                }
            }
            let chunk = *input;
            let cap = (self.container_remaining as usize).min(chunk.len());
            let mut limited = &chunk[..cap];
            let control = self.pull_wire(&mut limited, out, sha_on, true)?;
            let consumed = cap - limited.len();
            *input = &chunk[consumed..];
            self.container_remaining -= consumed as u32;
            match control {
                Control::Parsed => return Ok(Control::Parsed),
                Control::Starved => {
                    if input.is_empty() {
                        return Ok(Control::Starved);
                    }
                    // The container ran out but the chunk continues; the
                    // next EncryptionData header must follow.
                }
            }
        }
    }

    /// Streaming read of logical payload bytes. Returns 0 only when the
    /// chunk is exhausted.
    fn take_data(
        &mut self,
        input: &mut &[u8],
        scratch: &mut [u8],
        max: usize,
    ) -> Result<usize, Error> {
        if !self.in_container {
            let Parser {
                reassembler,
                crc,
                sha,
                ..
            } = self;
            return Ok(reassembler.take(input, scratch, max, |bytes| {
                if let Some(crc) = crc.as_mut() {
                    crc.update(bytes);
                }
                if let Some(sha) = sha.as_mut() {
                    sha.update(bytes);
                }
            }));
        }
        loop {
            if self.container_remaining == 0 {
                match self.refill_container(input)? {
                    OuterHeader::Starved => return Ok(0),
                    OuterHeader::Ended(_) => return Err(Error::UnexpectedTag),
                    OuterHeader::Available => {}
                }
            }
            let chunk = *input;
            let cap = (self.container_remaining as usize).min(chunk.len());
            let mut limited = &chunk[..cap];
            let n = {
                let Parser {
                    reassembler,
                    crc,
                    sha,
                    cipher,
                    ..
                } = self;
                reassembler.take(&mut limited, scratch, max, |bytes| {
                    if let Some(crc) = crc.as_mut() {
                        crc.update(bytes);
                    }
                    if let Some(sha) = sha.as_mut() {
                        sha.update(bytes);
                    }
                    if let Some(cipher) = cipher.as_mut() {
                        cipher.apply(bytes);
                    }
                })
            };
            let consumed = cap - limited.len();
            *input = &chunk[consumed..];
            self.container_remaining -= consumed as u32;
            if n > 0 {
                return Ok(n);
            }
            if input.is_empty() {
                return Ok(0);
            }
        }
    }

    fn stream_to_writer<S: Sink>(
        &mut self,
        input: &mut &[u8],
        sink: &mut S,
        remaining: u32,
    ) -> Result<DataRun, Error> {
        if remaining == 0 {
            self.finish_tag(sink)?;
            return Ok(DataRun::Done);
        }
        let mut scratch = [0u8; SCRATCH];
        let n = self.take_data(input, &mut scratch, remaining as usize)?;
        if n == 0 {
            return Ok(DataRun::Starved(remaining));
        }
        if self.writing {
            let Parser {
                writer, withheld, ..
            } = self;
            writer.push(withheld, sink, &scratch[..n])?;
        }
        Ok(DataRun::More(remaining - n as u32))
    }

    fn finish_tag<S: Sink>(&mut self, sink: &mut S) -> Result<(), Error> {
        if !self.writing {
            return Ok(());
        }
        let Parser {
            writer, withheld, ..
        } = self;
        writer.finish(withheld, sink)
    }

    fn sha_header(&mut self, raw: &[u8; TAG_HEADER_SIZE], tag_id: u32) {
        // The signature digest covers every wire byte except the Signature
        // and End tags themselves.
        if tag_id == tag::SIGNATURE_ECDSA_P256 || tag_id == tag::END {
            return;
        }
        if let Some(sha) = self.sha.as_mut() {
            sha.update(raw);
        }
    }
}

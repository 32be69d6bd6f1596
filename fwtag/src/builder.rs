//! Host-side image assembly.
//!
//! Builds the same wire format the parser consumes. Crypto is injected as
//! closures so the builder itself stays free of key handling: the signer
//! receives every digest-covered byte, the cipher receives the serialized
//! body tags.

use alloc::vec::Vec;

use crate::format::{
    tag, AppData, Certificate, VersionStatement, COMPATIBILITY_MAJOR_VERSION,
    ENCRYPTION_MODE_AES_CTR, TYPE_ENCRYPTED, TYPE_SIGNED,
};

use crc::{Crc, CRC_32_ISO_HDLC};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub struct ImageBuilder {
    version: u32,
    encrypted: bool,
    tags: Vec<(u32, Vec<u8>)>,
}

fn push_tag(out: &mut Vec<u8>, tag_id: u32, payload: &[u8]) {
    out.extend_from_slice(&tag_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            version: COMPATIBILITY_MAJOR_VERSION,
            encrypted: false,
            tags: Vec::new(),
        }
    }

    /// Overrides the container version word, e.g. to build an image a
    /// parser must reject.
    pub fn container_version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    pub fn application(&mut self, app: &AppData) -> &mut Self {
        self.tags.push((tag::APPLICATION, app.encode().to_vec()));
        self
    }

    pub fn bootloader(&mut self, version: u32, base_address: u32, data: &[u8]) -> &mut Self {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&version.to_le_bytes());
        payload.extend_from_slice(&base_address.to_le_bytes());
        payload.extend_from_slice(data);
        self.tags.push((tag::BOOTLOADER, payload));
        self
    }

    pub fn secure_element(&mut self, version: u32, data: &[u8]) -> &mut Self {
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&version.to_le_bytes());
        payload.extend_from_slice(data);
        self.tags.push((tag::SECURE_ELEMENT, payload));
        self
    }

    pub fn metadata(&mut self, data: &[u8]) -> &mut Self {
        self.tags.push((tag::METADATA, data.to_vec()));
        self
    }

    pub fn prog(&mut self, address: u32, data: &[u8]) -> &mut Self {
        self.prog_tag(tag::PROG, address, data)
    }

    pub fn erase_prog(&mut self, address: u32, data: &[u8]) -> &mut Self {
        self.prog_tag(tag::ERASE_PROG, address, data)
    }

    /// Compressed programming tag: `data` is the already-compressed stream
    /// for whatever codec claims `tag_id`.
    pub fn codec_prog(&mut self, tag_id: u32, address: u32, data: &[u8]) -> &mut Self {
        self.prog_tag(tag_id, address, data)
    }

    fn prog_tag(&mut self, tag_id: u32, address: u32, data: &[u8]) -> &mut Self {
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(data);
        self.tags.push((tag_id, payload));
        self
    }

    pub fn version_dependency(&mut self, statements: &[VersionStatement]) -> &mut Self {
        let mut payload = Vec::with_capacity(statements.len() * VersionStatement::SIZE);
        for statement in statements {
            payload.extend_from_slice(&statement.encode());
        }
        self.tags.push((tag::VERSION_DEPENDENCY, payload));
        self
    }

    pub fn custom(&mut self, tag_id: u32, data: &[u8]) -> &mut Self {
        self.tags.push((tag_id, data.to_vec()));
        self
    }

    pub fn certificate(&mut self, cert: &Certificate) -> &mut Self {
        self.tags.push((tag::CERTIFICATE, cert.encode().to_vec()));
        self
    }

    /// Wraps every tag added so far in an encrypted container: one
    /// EncryptionInit tag, then the serialized and enciphered tags split
    /// into EncryptionData tags of at most `container_size` bytes. Tags
    /// added afterwards (certificate, signature) stay plaintext.
    pub fn encrypt(
        &mut self,
        nonce: &[u8; 12],
        mut cipher: impl FnMut(&mut [u8]),
        container_size: usize,
    ) -> &mut Self {
        let mut body = Vec::new();
        for (tag_id, payload) in self.tags.drain(..) {
            push_tag(&mut body, tag_id, &payload);
        }
        cipher(&mut body);

        let mut init = Vec::with_capacity(16);
        init.extend_from_slice(&ENCRYPTION_MODE_AES_CTR.to_le_bytes());
        init.extend_from_slice(nonce);
        self.tags.push((tag::ENCRYPTION_INIT, init));
        for chunk in body.chunks(container_size.max(1)) {
            self.tags.push((tag::ENCRYPTION_DATA, chunk.to_vec()));
        }
        self.encrypted = true;
        self
    }

    /// Serializes without a signature. Only parsers configured to not
    /// require one will accept the result.
    pub fn build(&self) -> Vec<u8> {
        let mut out = self.assemble(false);
        Self::append_end(&mut out);
        out
    }

    /// Serializes with a Signature tag. `sign` receives every
    /// digest-covered byte (the whole image up to the Signature tag) and
    /// returns the raw `r || s` signature.
    pub fn build_signed(&self, sign: impl FnOnce(&[u8]) -> [u8; 64]) -> Vec<u8> {
        let mut out = self.assemble(true);
        let signature = sign(&out);
        push_tag(&mut out, tag::SIGNATURE_ECDSA_P256, &signature);
        Self::append_end(&mut out);
        out
    }

    fn assemble(&self, signed: bool) -> Vec<u8> {
        let mut flags = 0;
        if self.encrypted {
            flags |= TYPE_ENCRYPTED;
        }
        if signed {
            flags |= TYPE_SIGNED;
        }
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&self.version.to_le_bytes());
        header.extend_from_slice(&flags.to_le_bytes());

        let mut out = Vec::new();
        push_tag(&mut out, tag::HEADER, &header);
        for (tag_id, payload) in &self.tags {
            push_tag(&mut out, *tag_id, payload);
        }
        out
    }

    fn append_end(out: &mut Vec<u8>) {
        out.extend_from_slice(&tag::END.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());
        let crc = CRC32.checksum(out);
        out.extend_from_slice(&crc.to_le_bytes());
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

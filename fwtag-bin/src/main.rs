use {
    aes::Aes128,
    cipher::{KeyIvInit, StreamCipher},
    colored::Colorize,
    ctr::Ctr32BE,
    fwtag::{
        codec, tag, AppData, Board, CertificateAnchor, ImageContents, ImageProperties,
        MemoryLayout, ParserConfig, PublicKey, RollbackSlots, Sink, SinkError, Status, TagHeader,
        VerifyResult,
    },
    p256::{
        ecdsa::{
            signature::hazmat::{PrehashSigner, PrehashVerifier},
            Signature, SigningKey, VerifyingKey,
        },
        EncodedPoint, FieldBytes,
    },
    sha2::Digest,
    std::{ffi::OsString, io::Write},
};

mod args;

#[cfg(test)]
mod tests;

fn main() -> std::process::ExitCode {
    main_args(
        std::env::args_os(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .into()
}

fn main_args<I, T>(args: I, stdout: impl Write, mut stderr: impl Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match run(args, stdout) {
        Ok(()) => ExitCode(0),
        Err(Error::Args(e @ args::Error::Cli(_))) => {
            // Clap already does the "error: {}" formatting.
            writeln!(stderr, "{e}").expect("write error to stderr");
            ExitCode(1)
        }
        Err(e) => {
            writeln!(stderr, "{} {e}", "error:".bold().red()).expect("write error to stderr");
            ExitCode(1)
        }
    }
}

fn run<I, T>(args: I, mut stdout: impl Write) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match args::args(args)? {
        args::Args::Dump { input } => {
            let image = std::fs::read(input).map_err(Error::ReadInputFile)?;
            dump(&image, &mut stdout)?;
        }
        args::Args::Create {
            secret,
            application,
            bootloader,
            metadata,
            compress,
            encryption,
            container_size,
            output,
        } => {
            let mut builder = fwtag::ImageBuilder::new();
            let mut layout = MemoryLayout {
                start_of_app_space: 0x8000,
                bootloader_base: 0,
                upgrade_location: 0x4_0000,
            };
            if let Some(app) = &application {
                let data = std::fs::read(&app.path).map_err(Error::ReadInputFile)?;
                layout.start_of_app_space = app.address;
                builder.application(&app.descriptor);
                match compress {
                    None => builder.prog(app.address, &data),
                    Some(args::Compression::Lz) => {
                        builder.codec_prog(tag::LZ_PROG, app.address, &codec::lz_compress(&data))
                    }
                    Some(args::Compression::Block) => builder.codec_prog(
                        tag::BLOCK_PROG,
                        app.address,
                        &codec::block_compress(&data),
                    ),
                };
            }
            if let Some(boot) = &bootloader {
                let data = std::fs::read(&boot.path).map_err(Error::ReadInputFile)?;
                layout.bootloader_base = boot.base;
                builder.bootloader(boot.version, boot.base, &data);
            }
            if let Some(path) = &metadata {
                let data = std::fs::read(path).map_err(Error::ReadInputFile)?;
                builder.metadata(&data);
            }
            if let Some(enc) = encryption {
                builder.encrypt(&enc.nonce, ctr_cipher(enc.key, enc.nonce), container_size);
            }
            let (image, pubkey) = match secret {
                Some(raw) => {
                    let key =
                        SigningKey::from_slice(&raw).map_err(|_| Error::InvalidSecretScalar)?;
                    let image = builder.build_signed(|covered| {
                        let digest: [u8; 32] = sha2::Sha256::digest(covered).into();
                        let signature: Signature =
                            key.sign_prehash(&digest).expect("p256 prehash signing");
                        signature.to_bytes().into()
                    });
                    let point = key.verifying_key().to_encoded_point(false);
                    let mut pubkey = [0u8; 64];
                    pubkey[..32].copy_from_slice(point.x().ok_or(Error::InvalidSecretScalar)?);
                    pubkey[32..].copy_from_slice(point.y().ok_or(Error::InvalidSecretScalar)?);
                    (image, Some(pubkey))
                }
                None => (builder.build(), None),
            };

            // Sanity check that the engine accepts what was just assembled.
            let (props, _) = verify_image(
                &image,
                VerifyParams {
                    pubkey,
                    require_signature: pubkey.is_some(),
                    allow_custom_tags: false,
                    decryption_key: encryption.map(|e| e.key),
                    layout,
                },
            )
            .map_err(|e| match e {
                Error::Fwtag(e) => Error::SanityCheck(e),
                e => e,
            })?;
            debug_assert!(props.completed);

            std::fs::write(&output, &image).map_err(Error::WriteOutputFile)?;
        }
        args::Args::Verify {
            input,
            pubkey,
            allow_unsigned,
            allow_custom_tags,
            decryption_key,
            layout,
            extract_application,
        } => {
            let image = std::fs::read(input).map_err(Error::ReadInputFile)?;
            let (props, sink) = verify_image(
                &image,
                VerifyParams {
                    pubkey,
                    require_signature: pubkey.is_some() && !allow_unsigned,
                    allow_custom_tags,
                    decryption_key,
                    layout,
                },
            )?;

            let verdict = |ok: bool| if ok { "yes" } else { "no" };
            writeln!(&mut stdout, "{:12} {}", "verified".bold(), verdict(props.verified))
                .map_err(Error::Stdout)?;
            let mut contents = Vec::new();
            if props.contents.contains(ImageContents::APPLICATION) {
                contents.push("application");
            }
            if props.contents.contains(ImageContents::BOOTLOADER) {
                contents.push("bootloader");
            }
            if props.contents.contains(ImageContents::SECURE_ELEMENT) {
                contents.push("secure-element");
            }
            writeln!(
                &mut stdout,
                "{:12} {}",
                "contents".bold(),
                if contents.is_empty() {
                    "none".to_string()
                } else {
                    contents.join(" ")
                },
            )
            .map_err(Error::Stdout)?;
            if let Some(app) = &props.application {
                writeln!(
                    &mut stdout,
                    "{:12} type {} version {} product-id {}",
                    "application".bold(),
                    app.app_type,
                    app.version,
                    hex::encode(app.product_id),
                )
                .map_err(Error::Stdout)?;
            }
            if !sink.app.is_empty() {
                writeln!(
                    &mut stdout,
                    "{:12} {}",
                    "app-size".bold(),
                    humansize::format_size(sink.app.len(), humansize::BINARY),
                )
                .map_err(Error::Stdout)?;
            }
            if props.contents.contains(ImageContents::BOOTLOADER) {
                writeln!(
                    &mut stdout,
                    "{:12} version {} ({})",
                    "bootloader".bold(),
                    props.bootloader_version,
                    humansize::format_size(props.bootloader_upgrade_size, humansize::BINARY),
                )
                .map_err(Error::Stdout)?;
            }
            if props.contents.contains(ImageContents::SECURE_ELEMENT) {
                writeln!(
                    &mut stdout,
                    "{:12} version {}",
                    "secure-elem".bold(),
                    props.se_version,
                )
                .map_err(Error::Stdout)?;
            }

            if let Some(path) = extract_application {
                std::fs::write(path, &sink.app).map_err(Error::WriteOutputFile)?;
            }
        }
    }
    Ok(())
}

struct VerifyParams {
    /// `None` accepts unsigned images only.
    pubkey: Option<[u8; 64]>,
    require_signature: bool,
    allow_custom_tags: bool,
    decryption_key: Option<[u8; 16]>,
    layout: MemoryLayout,
}

fn verify_image(
    image: &[u8],
    params: VerifyParams,
) -> Result<(ImageProperties, CaptureSink), Error> {
    let config = ParserConfig {
        require_signature: params.require_signature,
        require_encryption: false,
        allow_custom_tags: params.allow_custom_tags,
    };
    let mut board = CliBoard {
        layout: params.layout,
        root: PublicKey::from_bytes(&params.pubkey.unwrap_or([0; 64])),
        decryption_key: params.decryption_key,
        slots: RollbackSlots::new(),
    };
    let mut parser = fwtag::Parser::new(P256Crypto, config, params.layout)?;
    let mut props = ImageProperties::default();
    let mut sink = CaptureSink::new(params.layout.start_of_app_space);
    let mut lz = codec::LzCodec::new();
    let mut block = codec::BlockCodec::new();
    let mut codecs: [&mut dyn codec::TagCodec; 2] = [&mut lz, &mut block];
    for chunk in image.chunks(4096) {
        if parser.parse(&mut props, &mut board, &mut sink, &mut codecs, chunk)? == Status::Done {
            break;
        }
    }
    if !props.completed {
        return Err(Error::Truncated);
    }
    Ok((props, sink))
}

fn dump(image: &[u8], stdout: &mut impl Write) -> Result<(), Error> {
    let mut offset = 0usize;
    while offset < image.len() {
        let raw: &[u8; 8] = image
            .get(offset..offset + 8)
            .ok_or(Error::TruncatedTag)?
            .try_into()
            .expect("8 bytes");
        let header = TagHeader::decode(raw);
        offset += 8;
        let payload = image
            .get(offset..offset + header.length as usize)
            .ok_or(Error::TruncatedTag)?;
        offset += header.length as usize;
        dump_tag(header, payload, stdout)?;
        if header.tag_id == tag::END {
            break;
        }
    }
    Ok(())
}

fn dump_tag(header: TagHeader, payload: &[u8], stdout: &mut impl Write) -> Result<(), Error> {
    let size = humansize::format_size(header.length, humansize::BINARY);
    match header.tag_id {
        tag::HEADER if payload.len() == 8 => {
            let version = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            let flags = u32::from_le_bytes(payload[4..8].try_into().expect("4 bytes"));
            let mut notes = Vec::new();
            if flags & fwtag::TYPE_SIGNED != 0 {
                notes.push("signed");
            }
            if flags & fwtag::TYPE_ENCRYPTED != 0 {
                notes.push("encrypted");
            }
            writeln!(
                stdout,
                "{:12} version {version:08x} {}",
                "header".bold(),
                notes.join(" "),
            )
        }
        tag::APPLICATION if payload.len() == AppData::SIZE => {
            let app = AppData::decode(payload.try_into().expect("descriptor size"));
            writeln!(
                stdout,
                "{:12} type {} version {} product-id {}",
                "application".bold(),
                app.app_type,
                app.version,
                hex::encode(app.product_id),
            )
        }
        tag::BOOTLOADER if payload.len() >= 8 => {
            let version = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            let base = u32::from_le_bytes(payload[4..8].try_into().expect("4 bytes"));
            writeln!(
                stdout,
                "{:12} version {version} base 0x{base:x} ({})",
                "bootloader".bold(),
                humansize::format_size(payload.len() - 8, humansize::BINARY),
            )
        }
        tag::SECURE_ELEMENT if payload.len() >= 4 => {
            let version = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            writeln!(
                stdout,
                "{:12} version {version} ({})",
                "secure-elem".bold(),
                humansize::format_size(payload.len() - 4, humansize::BINARY),
            )
        }
        tag::METADATA => writeln!(stdout, "{:12} {size}", "metadata".bold()),
        tag::PROG | tag::ERASE_PROG | tag::LZ_PROG | tag::BLOCK_PROG if payload.len() >= 4 => {
            let name = match header.tag_id {
                tag::PROG => "prog",
                tag::ERASE_PROG => "erase-prog",
                tag::LZ_PROG => "lz-prog",
                _ => "block-prog",
            };
            let address = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            writeln!(
                stdout,
                "{:12} address 0x{address:x} ({})",
                name.bold(),
                humansize::format_size(payload.len() - 4, humansize::BINARY),
            )
        }
        tag::VERSION_DEPENDENCY => writeln!(
            stdout,
            "{:12} {} statements",
            "version-dep".bold(),
            payload.len() / 8,
        ),
        tag::ENCRYPTION_INIT if payload.len() == 16 => {
            let mode = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            writeln!(
                stdout,
                "{:12} mode {mode} nonce {}",
                "encryption".bold(),
                hex::encode(&payload[4..16]),
            )
        }
        tag::ENCRYPTION_DATA => writeln!(stdout, "{:12} {size}", "enc-data".bold()),
        tag::CERTIFICATE if payload.len() == 136 => {
            let version = u32::from_le_bytes(payload[68..72].try_into().expect("4 bytes"));
            writeln!(
                stdout,
                "{:12} version {version} key {}",
                "certificate".bold(),
                hex::encode(&payload[4..36]),
            )
            .and_then(|()| {
                writeln!(stdout, "{} {}", " ".repeat(12), hex::encode(&payload[36..68]))
            })
        }
        tag::SIGNATURE_ECDSA_P256 if payload.len() == 64 => writeln!(
            stdout,
            "{:12} {}",
            "signature".bold(),
            hex::encode(&payload[..32]),
        )
        .and_then(|()| writeln!(stdout, "{} {}", " ".repeat(12), hex::encode(&payload[32..]))),
        tag::END if payload.len() == 4 => {
            let crc = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
            writeln!(stdout, "{:12} crc {crc:08x}", "end".bold())
        }
        id => writeln!(stdout, "{:12} {size}", format!("0x{id:08x}").bold()),
    }
    .map_err(Error::Stdout)
}

fn ctr_iv(nonce: &[u8; 12]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..12].copy_from_slice(nonce);
    iv[15] = 1;
    iv
}

fn ctr_cipher(key: [u8; 16], nonce: [u8; 12]) -> impl FnMut(&mut [u8]) {
    let mut cipher = Ctr32BE::<Aes128>::new((&key).into(), (&ctr_iv(&nonce)).into());
    move |data: &mut [u8]| cipher.apply_keystream(data)
}

struct P256Crypto;

struct P256Sha(sha2::Sha256);

impl fwtag::Sha256 for P256Sha {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self) -> [u8; 32] {
        Digest::finalize(self.0).into()
    }
}

struct P256Cipher(Ctr32BE<Aes128>);

impl fwtag::AesCtr for P256Cipher {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

impl fwtag::Crypto for P256Crypto {
    type Sha = P256Sha;
    type Cipher = P256Cipher;

    fn sha256(&self) -> P256Sha {
        P256Sha(sha2::Sha256::new())
    }

    fn aes_ctr(&self, key: &[u8; 16], nonce: &[u8; 12]) -> P256Cipher {
        P256Cipher(Ctr32BE::new(key.into(), (&ctr_iv(nonce)).into()))
    }

    fn verify_p256(
        &self,
        digest: &[u8; 32],
        r: &[u8; 32],
        s: &[u8; 32],
        key: &PublicKey,
    ) -> VerifyResult {
        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&key.x),
            FieldBytes::from_slice(&key.y),
            false,
        );
        let Ok(vkey) = VerifyingKey::from_encoded_point(&point) else {
            return VerifyResult::Invalid;
        };
        let Ok(sig) = Signature::from_scalars(FieldBytes::from(*r), FieldBytes::from(*s)) else {
            return VerifyResult::Invalid;
        };
        match vkey.verify_prehash(digest, &sig) {
            Ok(()) => VerifyResult::Valid,
            Err(_) => VerifyResult::Invalid,
        }
    }
}

/// Host-side stand-in for a device: no running firmware, empty anti-rollback
/// slots, keys straight from the command line.
struct CliBoard {
    layout: MemoryLayout,
    root: PublicKey,
    decryption_key: Option<[u8; 16]>,
    slots: RollbackSlots<8>,
}

impl Board for CliBoard {
    fn memory_layout(&self) -> MemoryLayout {
        self.layout
    }
    fn application_version(&self) -> Option<u32> {
        None
    }
    fn bootloader_version(&self) -> u32 {
        0
    }
    fn root_key(&self) -> &PublicKey {
        &self.root
    }
    fn certificate_anchor(&self) -> Option<&CertificateAnchor> {
        None
    }
    fn decryption_key(&self) -> Option<&[u8; 16]> {
        self.decryption_key.as_ref()
    }
    fn highest_seen_version(&self) -> Option<u32> {
        self.slots.highest()
    }
    fn can_remember_version(&self, version: u32) -> bool {
        self.slots.can_remember(version)
    }
    fn remember_version(&mut self, version: u32) -> bool {
        self.slots.remember(version)
    }
}

/// Collects everything the engine writes, application flash rebased to
/// offset zero.
struct CaptureSink {
    base: u32,
    app: Vec<u8>,
    boot: Vec<u8>,
    meta: Vec<u8>,
}

impl CaptureSink {
    fn new(base: u32) -> Self {
        CaptureSink {
            base,
            app: Vec::new(),
            boot: Vec::new(),
            meta: Vec::new(),
        }
    }

    fn write(region: &mut Vec<u8>, offset: usize, data: &[u8]) {
        if region.len() < offset + data.len() {
            region.resize(offset + data.len(), fwtag::FLASH_ERASE_VALUE);
        }
        region[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Sink for CaptureSink {
    fn write_application(&mut self, address: u32, data: &[u8]) -> Result<(), SinkError> {
        let offset = address.checked_sub(self.base).ok_or(SinkError)? as usize;
        Self::write(&mut self.app, offset, data);
        Ok(())
    }
    fn write_bootloader(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError> {
        Self::write(&mut self.boot, offset as usize, data);
        Ok(())
    }
    fn write_metadata(&mut self, offset: u32, data: &[u8]) -> Result<(), SinkError> {
        Self::write(&mut self.meta, offset as usize, data);
        Ok(())
    }
    fn erase_application_range(&mut self, _address: u32, _length: u32) -> Result<(), SinkError> {
        Ok(())
    }
    fn read_application(&mut self, address: u32, out: &mut [u8]) -> Result<(), SinkError> {
        let offset = address.checked_sub(self.base).ok_or(SinkError)? as usize;
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self
                .app
                .get(offset + i)
                .copied()
                .unwrap_or(fwtag::FLASH_ERASE_VALUE);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitCode(u8);

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        code.0.into()
    }
}

#[derive(Debug)]
enum Error {
    Args(args::Error),
    Fwtag(fwtag::Error),
    InvalidSecretScalar,
    ReadInputFile(std::io::Error),
    SanityCheck(fwtag::Error),
    Stdout(std::io::Error),
    Truncated,
    TruncatedTag,
    WriteOutputFile(std::io::Error),
}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl From<fwtag::Error> for Error {
    fn from(e: fwtag::Error) -> Self {
        Error::Fwtag(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Args(e) => write!(f, "{e}"),
            Error::Fwtag(e) => write!(f, "{e}"),
            Error::InvalidSecretScalar => write!(f, "secret key is not a valid P-256 scalar"),
            Error::ReadInputFile(e) => write!(f, "failed to read input file: {e}"),
            Error::SanityCheck(e) => write!(
                f,
                "assembled image does not verify: {e}; this is a bug, please report it"
            ),
            Error::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
            Error::Truncated => write!(f, "image ends before its End tag"),
            Error::TruncatedTag => write!(f, "tag extends past the end of the file"),
            Error::WriteOutputFile(e) => write!(f, "failed to write to output file: {e}"),
        }
    }
}

impl std::error::Error for Error {}

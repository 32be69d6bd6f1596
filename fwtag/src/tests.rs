use super::*;

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use p256::{
    ecdsa::{
        signature::hazmat::{PrehashSigner, PrehashVerifier},
        Signature, SigningKey, VerifyingKey,
    },
    EncodedPoint, FieldBytes,
};
use sha2::Digest;

const APP_BASE: u32 = 0x8000;
const UPGRADE_BASE: u32 = 0x4_0000;
const AES_KEY: [u8; 16] = [0x5A; 16];
const NONCE: [u8; 12] = [0x21; 12];

// Host-side implementations of the crypto and board seams.

struct HostCrypto;

struct HostSha(sha2::Sha256);

impl crate::Sha256 for HostSha {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn finalize(self) -> [u8; 32] {
        Digest::finalize(self.0).into()
    }
}

struct HostCipher(Ctr32BE<Aes128>);

impl AesCtr for HostCipher {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

impl Crypto for HostCrypto {
    type Sha = HostSha;
    type Cipher = HostCipher;

    fn sha256(&self) -> HostSha {
        HostSha(sha2::Sha256::new())
    }

    fn aes_ctr(&self, key: &[u8; 16], nonce: &[u8; 12]) -> HostCipher {
        HostCipher(Ctr32BE::new(key.into(), (&ctr_iv(nonce)).into()))
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

fn ctr_iv(nonce: &[u8; 12]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..12].copy_from_slice(nonce);
    iv[15] = 1;
    iv
}

struct TestBoard {
    layout: MemoryLayout,
    app_version: Option<u32>,
    boot_version: u32,
    se_version: Option<u32>,
    root: PublicKey,
    fallback: Option<PublicKey>,
    anchor: Option<CertificateAnchor>,
    dec_key: Option<[u8; 16]>,
    slots: RollbackSlots<8>,
}

impl TestBoard {
    fn new(root: PublicKey) -> Self {
        TestBoard {
            layout: MemoryLayout {
                start_of_app_space: APP_BASE,
                bootloader_base: 0,
                upgrade_location: UPGRADE_BASE,
            },
            app_version: None,
            boot_version: 1,
            se_version: None,
            root,
            fallback: None,
            anchor: None,
            dec_key: Some(AES_KEY),
            slots: RollbackSlots::new(),
        }
    }
}

impl Board for TestBoard {
    fn memory_layout(&self) -> MemoryLayout {
        self.layout
    }
    fn application_version(&self) -> Option<u32> {
        self.app_version
    }
    fn bootloader_version(&self) -> u32 {
        self.boot_version
    }
    fn secure_element_version(&self) -> Option<u32> {
        self.se_version
    }
    fn root_key(&self) -> &PublicKey {
        &self.root
    }
    fn fallback_key(&self) -> Option<&PublicKey> {
        self.fallback.as_ref()
    }
    fn certificate_anchor(&self) -> Option<&CertificateAnchor> {
        self.anchor.as_ref()
    }
    fn decryption_key(&self) -> Option<&[u8; 16]> {
        self.dec_key.as_ref()
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

#[derive(Debug, Default)]
struct MemSink {
    app: Vec<u8>,
    boot: Vec<u8>,
    meta: Vec<u8>,
    erased: Vec<(u32, u32)>,
}

impl MemSink {
    fn write(region: &mut Vec<u8>, offset: usize, data: &[u8]) {
        if region.len() < offset + data.len() {
            region.resize(offset + data.len(), FLASH_ERASE_VALUE);
        }
        region[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Sink for MemSink {
    fn write_application(&mut self, address: u32, data: &[u8]) -> Result<(), SinkError> {
        let offset = address.checked_sub(APP_BASE).ok_or(SinkError)? as usize;
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
    fn erase_application_range(&mut self, address: u32, length: u32) -> Result<(), SinkError> {
        self.erased.push((address, length));
        Ok(())
    }
    fn read_application(&mut self, address: u32, out: &mut [u8]) -> Result<(), SinkError> {
        let offset = address.checked_sub(APP_BASE).ok_or(SinkError)? as usize;
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.app.get(offset + i).copied().unwrap_or(FLASH_ERASE_VALUE);
        }
        Ok(())
    }
}

// Fixtures.

fn keypair(seed: u8) -> (SigningKey, PublicKey) {
    let key = SigningKey::from_slice(&[seed; 32]).unwrap();
    let point = key.verifying_key().to_encoded_point(false);
    let mut public = PublicKey {
        x: [0; 32],
        y: [0; 32],
    };
    public.x.copy_from_slice(point.x().unwrap());
    public.y.copy_from_slice(point.y().unwrap());
    (key, public)
}

fn sign_with(key: &SigningKey, covered: &[u8]) -> [u8; 64] {
    let digest: [u8; 32] = sha2::Sha256::digest(covered).into();
    let sig: Signature = key.sign_prehash(&digest).unwrap();
    sig.to_bytes().into()
}

fn encryptor() -> impl FnMut(&mut [u8]) {
    let mut cipher = Ctr32BE::<Aes128>::new((&AES_KEY).into(), (&ctr_iv(&NONCE)).into());
    move |data: &mut [u8]| cipher.apply_keystream(data)
}

fn descriptor(version: u32) -> AppData {
    AppData {
        app_type: 1,
        version,
        capabilities: 0,
        product_id: [7; 16],
    }
}

fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x1234_5678u32;
    (0..len)
        .map(|i| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            if (i / 192) % 2 == 0 {
                (i % 9) as u8
            } else {
                (state >> 16) as u8
            }
        })
        .collect()
}

fn unsigned_config() -> ParserConfig {
    ParserConfig {
        require_signature: false,
        ..ParserConfig::default()
    }
}

fn parse_all(
    image: &[u8],
    chunk_size: usize,
    config: ParserConfig,
    board: &mut TestBoard,
    instructions: ImageContents,
) -> Result<(ImageProperties, MemSink), Error> {
    let mut parser = Parser::new(HostCrypto, config, board.layout).unwrap();
    let mut props = ImageProperties::new(instructions);
    let mut sink = MemSink::default();
    let mut lz = codec::LzCodec::new();
    let mut block = codec::BlockCodec::new();
    let mut codecs: [&mut dyn codec::TagCodec; 2] = [&mut lz, &mut block];
    for chunk in image.chunks(chunk_size.max(1)) {
        if parser.parse(&mut props, board, &mut sink, &mut codecs, chunk)? == Status::Done {
            break;
        }
    }
    Ok((props, sink))
}

#[test]
fn unsigned_image_programs_and_completes() {
    let data = payload(64);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(3)).prog(APP_BASE, &data);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let (props, sink) =
        parse_all(&image, 19, unsigned_config(), &mut board, ImageContents::all()).unwrap();

    assert!(props.verified);
    assert!(props.completed);
    assert_eq!(props.application.unwrap().version, 3);
    assert_eq!(props.contents, ImageContents::APPLICATION);
    assert_eq!(sink.app, data);
    assert_eq!(board.slots.highest(), Some(3));
}

#[test]
fn chunking_is_invariant() {
    let data = payload(1024);
    let mut builder = ImageBuilder::new();
    builder
        .application(&descriptor(2))
        .prog(APP_BASE, &data)
        .metadata(b"release notes");
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut reference = None;
    for chunk_size in [1, 3, 7, 64, 1 << 20] {
        let mut board = TestBoard::new(root);
        let (props, sink) = parse_all(
            &image,
            chunk_size,
            unsigned_config(),
            &mut board,
            ImageContents::all(),
        )
        .unwrap();
        assert!(props.completed, "chunk size {chunk_size}");
        let outcome = (props, sink.app, sink.meta);
        match &reference {
            None => reference = Some(outcome),
            Some(expected) => assert_eq!(*expected, outcome, "chunk size {chunk_size}"),
        }
    }
}

#[test]
fn withheld_bytes_stay_blank_until_the_end_tag() {
    let data = payload(64);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(1)).prog(APP_BASE, &data);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);

    // Drop the End tag (8-byte header plus the CRC word).
    let truncated = &image[..image.len() - 12];
    let (props, sink) = parse_all(
        truncated,
        33,
        unsigned_config(),
        &mut board,
        ImageContents::all(),
    )
    .unwrap();

    assert!(!props.completed);
    assert!(!props.verified);
    // The vector table head never reached flash.
    assert_eq!(&sink.app[..4], &data[..4]);
    assert_eq!(&sink.app[4..28], &[FLASH_ERASE_VALUE; 24]);
    assert_eq!(&sink.app[28..], &data[28..]);
    assert_eq!(board.slots.highest(), None);
}

#[test]
fn signed_image_verifies_against_the_root_key() {
    let data = payload(128);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(5)).prog(APP_BASE, &data);

    let (signing, root) = keypair(0x11);
    let image = builder.build_signed(|covered| sign_with(&signing, covered));

    let mut board = TestBoard::new(root);
    let (props, sink) = parse_all(
        &image,
        41,
        ParserConfig::default(),
        &mut board,
        ImageContents::all(),
    )
    .unwrap();
    assert!(props.verified);
    assert!(props.completed);
    assert_eq!(sink.app, data);
}

#[test]
fn tampered_payload_is_rejected_before_the_end() {
    let data = payload(128);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(5)).prog(APP_BASE, &data);

    let (signing, root) = keypair(0x11);
    let mut image = builder.build_signed(|covered| sign_with(&signing, covered));
    // Flip one payload byte deep inside the Prog tag.
    let index = image.len() - 100;
    image[index] ^= 0x80;

    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(
            &image,
            64,
            ParserConfig::default(),
            &mut board,
            ImageContents::all()
        )
        .unwrap_err(),
        Error::SignatureRejected
    );
}

#[test]
fn wrong_root_key_rejects_but_fallback_rescues() {
    let data = payload(32);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(1)).prog(APP_BASE, &data);
    let (signing, real) = keypair(0x11);
    let (_, other) = keypair(0x22);
    let image = builder.build_signed(|covered| sign_with(&signing, covered));

    let mut board = TestBoard::new(other);
    assert_eq!(
        parse_all(
            &image,
            64,
            ParserConfig::default(),
            &mut board,
            ImageContents::all()
        )
        .unwrap_err(),
        Error::SignatureRejected
    );

    let mut board = TestBoard::new(other);
    board.fallback = Some(real);
    let (props, _) = parse_all(
        &image,
        64,
        ParserConfig::default(),
        &mut board,
        ImageContents::all(),
    )
    .unwrap();
    assert!(props.verified);
}

#[test]
fn corrupted_crc_fails_on_unsigned_images() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(32));
    let mut image = builder.build();
    let last = image.len() - 1;
    image[last] ^= 0xFF;

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::CrcMismatch
    );
}

#[test]
fn unsigned_header_is_rejected_when_signatures_are_required() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(16));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(
            &image,
            64,
            ParserConfig::default(),
            &mut board,
            ImageContents::all()
        )
        .unwrap_err(),
        Error::FileType
    );
}

#[test]
fn wrong_major_version_is_rejected() {
    let mut builder = ImageBuilder::new();
    builder.container_version(0x0200_0000).prog(APP_BASE, &payload(16));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::VersionMismatch
    );
}

#[test]
fn errors_latch_the_session() {
    let mut builder = ImageBuilder::new();
    builder.container_version(0x0200_0000).prog(APP_BASE, &payload(16));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let mut parser = Parser::new(HostCrypto, unsigned_config(), board.layout).unwrap();
    let mut props = ImageProperties::default();
    let mut sink = MemSink::default();
    let mut codecs: [&mut dyn codec::TagCodec; 0] = [];
    assert_eq!(
        parser.parse(&mut props, &mut board, &mut sink, &mut codecs, &image),
        Err(Error::VersionMismatch)
    );
    assert_eq!(
        parser.parse(&mut props, &mut board, &mut sink, &mut codecs, &image),
        Err(Error::EndOfStream)
    );
}

#[test]
fn encrypted_image_round_trips_across_container_splits() {
    let data = payload(600);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(4)).prog(APP_BASE, &data);
    // A small container size forces inner tags to span EncryptionData
    // boundaries.
    builder.encrypt(&NONCE, encryptor(), 13);

    let (signing, root) = keypair(0x11);
    let image = builder.build_signed(|covered| sign_with(&signing, covered));

    for chunk_size in [5, 64, 1 << 20] {
        let mut board = TestBoard::new(root);
        let (props, sink) = parse_all(
            &image,
            chunk_size,
            ParserConfig::default(),
            &mut board,
            ImageContents::all(),
        )
        .unwrap();
        assert!(props.verified, "chunk size {chunk_size}");
        assert!(props.completed, "chunk size {chunk_size}");
        assert_eq!(sink.app, data, "chunk size {chunk_size}");
    }
}

#[test]
fn encrypted_image_without_a_key_is_rejected() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(64));
    builder.encrypt(&NONCE, encryptor(), 256);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    board.dec_key = None;
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::DecryptionKey
    );
}

#[test]
fn wrong_decryption_key_is_detected_inside_the_container() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(64));
    builder.encrypt(&NONCE, encryptor(), 256);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    board.dec_key = Some([0xA5; 16]);
    // Decrypting with the wrong key turns the inner tag ids to garbage.
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::DecryptionKey
    );
}

#[test]
fn plaintext_image_is_rejected_when_encryption_is_required() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(16));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let config = ParserConfig {
        require_signature: false,
        require_encryption: true,
        ..ParserConfig::default()
    };
    assert_eq!(
        parse_all(&image, 64, config, &mut board, ImageContents::all()).unwrap_err(),
        Error::FileType
    );
}

#[test]
fn version_dependency_gates_the_image() {
    fn range_image() -> Vec<u8> {
        let mut builder = ImageBuilder::new();
        builder.version_dependency(&[
            VersionStatement {
                subject: Subject::Application,
                comparator: Comparator::Geq,
                comparator_negate: false,
                connective: Connective::And,
                connective_negate: false,
                version: 5,
            },
            VersionStatement {
                subject: Subject::Application,
                comparator: Comparator::Lt,
                comparator_negate: false,
                connective: Connective::And,
                connective_negate: false,
                version: 10,
            },
        ]);
        builder.prog(APP_BASE, &payload(16));
        builder.build()
    }

    let (_, root) = keypair(0x11);
    let image = range_image();
    for running in 5..10 {
        let mut board = TestBoard::new(root);
        board.app_version = Some(running);
        let (props, _) =
            parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap();
        assert!(props.completed, "running version {running}");
    }
    for running in [4, 10, 11] {
        let mut board = TestBoard::new(root);
        board.app_version = Some(running);
        assert_eq!(
            parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all())
                .unwrap_err(),
            Error::VersionMismatch,
            "running version {running}"
        );
    }
}

#[test]
fn same_version_bootloader_bypasses_the_gate() {
    let mut builder = ImageBuilder::new();
    builder.version_dependency(&[VersionStatement {
        subject: Subject::Application,
        comparator: Comparator::Geq,
        comparator_negate: false,
        connective: Connective::And,
        connective_negate: false,
        version: 99,
    }]);
    builder.bootloader(1, 0, &payload(32));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    board.app_version = Some(1);
    // The carried bootloader version equals the running one, so the failed
    // dependency does not block this stage of the upgrade.
    let (props, sink) =
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap();
    assert!(props.completed);
    assert_eq!(props.bootloader_version, 1);
    assert_eq!(sink.boot, payload(32));
}

#[test]
fn bootloader_base_address_must_match_the_layout() {
    let mut builder = ImageBuilder::new();
    builder.bootloader(2, 0x2000, &payload(32));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::UnexpectedTag
    );
}

#[test]
fn rollback_to_an_older_application_is_rejected() {
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(6)).prog(APP_BASE, &payload(16));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    board.slots.remember(7);
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::Rejected
    );
}

#[test]
fn full_rollback_slots_reject_a_new_version() {
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(100)).prog(APP_BASE, &payload(16));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    for version in 1..=8 {
        board.slots.remember(version);
    }
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::Rejected
    );
}

#[test]
fn lz_codec_tag_programs_the_decompressed_image() {
    let data = payload(10 * 1024);
    let compressed = codec::lz_compress(&data);
    assert!(compressed.len() < data.len());

    let mut builder = ImageBuilder::new();
    builder
        .application(&descriptor(1))
        .codec_prog(tag::LZ_PROG, APP_BASE, &compressed);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    for chunk_size in [9, 256, 1 << 20] {
        let mut board = TestBoard::new(root);
        let (props, sink) =
            parse_all(&image, chunk_size, unsigned_config(), &mut board, ImageContents::all())
                .unwrap();
        assert!(props.completed, "chunk size {chunk_size}");
        assert_eq!(sink.app, data, "chunk size {chunk_size}");
    }
}

#[test]
fn block_codec_tag_programs_the_decompressed_image() {
    let data = payload(8 * 1024);
    let compressed = codec::block_compress(&data);

    let mut builder = ImageBuilder::new();
    builder
        .application(&descriptor(1))
        .codec_prog(tag::BLOCK_PROG, APP_BASE, &compressed);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let (props, sink) =
        parse_all(&image, 77, unsigned_config(), &mut board, ImageContents::all()).unwrap();
    assert!(props.completed);
    assert_eq!(sink.app, data);
}

#[test]
fn certificate_chain_extends_trust_to_a_delegated_key() {
    let (ca_key, ca_public) = keypair(0x31);
    let (delegated_key, delegated_public) = keypair(0x32);

    let mut cert = Certificate::empty();
    cert.struct_version = CERTIFICATE_STRUCT_VERSION;
    cert.key[..32].copy_from_slice(&delegated_public.x);
    cert.key[32..].copy_from_slice(&delegated_public.y);
    cert.version = 3;
    cert.signature = sign_with(&ca_key, &cert.signed_bytes());

    let data = payload(64);
    let mut builder = ImageBuilder::new();
    builder.application(&descriptor(1)).prog(APP_BASE, &data);
    builder.certificate(&cert);
    let image = builder.build_signed(|covered| sign_with(&delegated_key, covered));

    // The root key differs from the delegated key, so only the certificate
    // chain can make this image verify.
    let (_, unrelated_root) = keypair(0x33);
    let mut board = TestBoard::new(unrelated_root);
    board.anchor = Some(CertificateAnchor {
        min_version: 2,
        key: ca_public,
    });
    let (props, sink) = parse_all(
        &image,
        21,
        ParserConfig::default(),
        &mut board,
        ImageContents::all(),
    )
    .unwrap();
    assert!(props.verified);
    assert_eq!(sink.app, data);

    // Without the anchor the certificate is not accepted at all.
    let mut board = TestBoard::new(unrelated_root);
    assert_eq!(
        parse_all(
            &image,
            21,
            ParserConfig::default(),
            &mut board,
            ImageContents::all()
        )
        .unwrap_err(),
        Error::UnexpectedTag
    );
}

#[test]
fn outdated_certificates_are_rejected() {
    let (ca_key, ca_public) = keypair(0x31);
    let (delegated_key, delegated_public) = keypair(0x32);

    let mut cert = Certificate::empty();
    cert.struct_version = CERTIFICATE_STRUCT_VERSION;
    cert.key[..32].copy_from_slice(&delegated_public.x);
    cert.key[32..].copy_from_slice(&delegated_public.y);
    cert.version = 1;
    cert.signature = sign_with(&ca_key, &cert.signed_bytes());

    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(16));
    builder.certificate(&cert);
    let image = builder.build_signed(|covered| sign_with(&delegated_key, covered));

    let (_, root) = keypair(0x33);
    let mut board = TestBoard::new(root);
    board.anchor = Some(CertificateAnchor {
        min_version: 2,
        key: ca_public,
    });
    assert_eq!(
        parse_all(
            &image,
            64,
            ParserConfig::default(),
            &mut board,
            ImageContents::all()
        )
        .unwrap_err(),
        Error::SignatureRejected
    );
}

#[test]
fn unknown_tags_are_skipped_only_when_allowed() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE, &payload(16));
    builder.custom(0x5AFE_0999, b"vendor blob");
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::UnknownTag
    );

    let mut board = TestBoard::new(root);
    let config = ParserConfig {
        require_signature: false,
        allow_custom_tags: true,
        ..ParserConfig::default()
    };
    let (props, _) = parse_all(&image, 64, config, &mut board, ImageContents::all()).unwrap();
    assert!(props.completed);
}

#[test]
fn instructions_gate_what_reaches_the_sink() {
    let data = payload(64);
    let mut builder = ImageBuilder::new();
    builder
        .application(&descriptor(9))
        .prog(APP_BASE, &data)
        .bootloader(4, 0, &payload(32));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let (props, sink) = parse_all(
        &image,
        64,
        unsigned_config(),
        &mut board,
        ImageContents::BOOTLOADER,
    )
    .unwrap();
    assert!(props.completed);
    // The application payload was parsed and checked but never written,
    // and its version was not recorded.
    assert!(sink.app.is_empty());
    assert_eq!(sink.boot, payload(32));
    assert_eq!(board.slots.highest(), None);
    assert!(props.contents.contains(ImageContents::APPLICATION));
}

#[test]
fn erase_prog_erases_before_writing() {
    let data = payload(40);
    let mut builder = ImageBuilder::new();
    builder.erase_prog(APP_BASE + 0x100, &data);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let (props, sink) =
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap();
    assert!(props.completed);
    assert_eq!(sink.erased, vec![(APP_BASE + 0x100, 40)]);
    assert_eq!(&sink.app[0x100..0x128], &data[..]);
}

#[test]
fn secure_element_payload_is_staged() {
    let data = payload(24);
    let mut builder = ImageBuilder::new();
    builder.secure_element(2, &data);
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    board.se_version = Some(1);
    let (props, sink) =
        parse_all(&image, 10, unsigned_config(), &mut board, ImageContents::all()).unwrap();
    assert!(props.completed);
    assert_eq!(props.se_version, 2);
    assert!(props.contents.contains(ImageContents::SECURE_ELEMENT));
    assert_eq!(sink.boot, data);
}

#[test]
fn metadata_reaches_the_sink() {
    let mut builder = ImageBuilder::new();
    builder.metadata(b"build 1234");
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    let (props, sink) =
        parse_all(&image, 4, unsigned_config(), &mut board, ImageContents::all()).unwrap();
    assert!(props.completed);
    assert_eq!(&sink.meta[..10], b"build 1234");
}

#[test]
fn misaligned_prog_address_is_rejected() {
    let mut builder = ImageBuilder::new();
    builder.prog(APP_BASE + 2, &payload(8));
    let image = builder.build();

    let (_, root) = keypair(0x11);
    let mut board = TestBoard::new(root);
    assert_eq!(
        parse_all(&image, 64, unsigned_config(), &mut board, ImageContents::all()).unwrap_err(),
        Error::Alignment
    );
}

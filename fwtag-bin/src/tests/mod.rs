use {crate::ExitCode, std::io::Write};

/// Dump the tags of a signed image.
#[test]
fn dump_signed_image() {
    let (secret, _) = keypair(0x11);
    let payload = create_file(&payload_bytes(256));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "--application-version",
        "3",
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());

    let output = test(["dump", "-i", image.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    // One line per tag, in wire order.
    assert!(output.stdout.contains("header"));
    assert!(output.stdout.contains("signed"));
    assert!(output.stdout.contains("application"));
    assert!(output.stdout.contains("version 3"));
    assert!(output.stdout.contains("prog"));
    assert!(output.stdout.contains("signature"));
    assert!(output.stdout.contains("end"));
    assert!(output.stderr.is_empty());
}

/// Create a signed image and verify it with the matching public key.
#[test]
fn create_then_verify_round_trip() {
    let (secret, pubkey) = keypair(0x11);
    let payload = create_file(&payload_bytes(1024));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--pubkey",
        &pubkey,
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("verified"));
    assert!(output.stdout.contains("yes"));
    assert!(output.stdout.contains("application"));
    assert!(output.stderr.is_empty());
}

/// A flipped payload byte must fail verification.
#[test]
fn verify_rejects_tampered_image() {
    let (secret, pubkey) = keypair(0x11);
    let payload = create_file(&payload_bytes(1024));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let mut bytes = std::fs::read(image.path()).unwrap();
    let index = bytes.len() / 2;
    bytes[index] ^= 0x01;
    let tampered = create_file(&bytes);

    let output = test([
        "verify",
        "-i",
        tampered.path().to_str().unwrap(),
        "--pubkey",
        &pubkey,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("signature rejected"));
}

/// The wrong public key must fail verification.
#[test]
fn verify_rejects_wrong_pubkey() {
    let (secret, _) = keypair(0x11);
    let (_, other_pubkey) = keypair(0x22);
    let payload = create_file(&payload_bytes(64));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--pubkey",
        &other_pubkey,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("signature rejected"));
}

/// Unsigned images need --allow-unsigned; a bare verify demands a pubkey.
#[test]
fn unsigned_image_needs_allow_unsigned() {
    let payload = create_file(&payload_bytes(64));
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--application",
        payload.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test(["verify", "-i", image.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("public key is required"));

    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--allow-unsigned",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("verified"));
}

/// Encrypted create and verify round trip; the dump shows only the
/// container, not the payload tags.
#[test]
fn encrypted_round_trip() {
    let (secret, pubkey) = keypair(0x11);
    let payload = create_file(&payload_bytes(2048));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let key = "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";
    let nonce = "212121212121212121212121";
    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "--encryption-key",
        key,
        "--nonce",
        nonce,
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test(["dump", "-i", image.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("encrypted"));
    assert!(output.stdout.contains("encryption"));
    assert!(output.stdout.contains("enc-data"));
    assert!(!output.stdout.contains("prog"));

    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--pubkey",
        &pubkey,
        "--encryption-key",
        key,
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("verified"));

    // Without the key the container cannot be opened.
    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--pubkey",
        &pubkey,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("decryption key"));
}

/// A compressed image extracts to exactly the original payload.
#[test]
fn compressed_image_extracts_identical_payload() {
    let payload_data = b"abcd".repeat(1024);
    let (secret, pubkey) = keypair(0x11);
    let payload = create_file(&payload_data);
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let extracted = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "--compress",
        "lz",
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    // The compressed image is smaller than its payload.
    assert!(std::fs::metadata(image.path()).unwrap().len() < payload_data.len() as u64);

    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--pubkey",
        &pubkey,
        "--extract-application",
        extracted.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert_eq!(std::fs::read(extracted.path()).unwrap(), payload_data);
}

/// Attempt to specify the secret both in the config file and on the CLI.
#[test]
fn secret_in_config_and_cli() {
    let (secret, _) = keypair(0x11);
    let payload = create_file(&payload_bytes(64));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let config_file = create_file(
        format!(
            r#"
            secret = "{}"
            "#,
            secret_pem.path().to_str().unwrap(),
        )
        .as_bytes(),
    );

    let output = test([
        "create",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--config",
        config_file.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output
        .stderr
        .contains("secret specified in both config and cli"));
}

/// Sign with a secret key loaded from config.
#[test]
fn create_with_secret_from_config() {
    let (secret, pubkey) = keypair(0x11);
    let payload = create_file(&payload_bytes(64));
    let secret_pem = secret_pem(&secret);
    let image = tempfile::NamedTempFile::new().unwrap();
    let config_file = create_file(
        format!(
            r#"
            secret = "{}"
            "#,
            secret_pem.path().to_str().unwrap(),
        )
        .as_bytes(),
    );

    let output = test([
        "create",
        "--config",
        config_file.path().to_str().unwrap(),
        "--application",
        payload.path().to_str().unwrap(),
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test([
        "verify",
        "-i",
        image.path().to_str().unwrap(),
        "--pubkey",
        &pubkey,
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("verified"));
}

/// Encrypting without a nonce is an argument error.
#[test]
fn encryption_key_without_nonce() {
    let payload = create_file(&payload_bytes(64));
    let image = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "create",
        "--application",
        payload.path().to_str().unwrap(),
        "--encryption-key",
        "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a",
        "-o",
        image.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("--nonce"));
}

fn test<const N: usize>(args: [&str; N]) -> Output {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = crate::main_args(
        std::iter::once("fwtag").chain(args),
        &mut stdout,
        &mut stderr,
    );
    println!("* args: {:?}", args);
    println!("* exit_code: {:?}", exit_code);
    println!("* stdout:\n{}", String::from_utf8_lossy(&stdout));
    println!("* stderr:\n{}", String::from_utf8_lossy(&stderr));
    Output {
        exit_code,
        stdout: String::from_utf8(stdout).unwrap(),
        stderr: String::from_utf8(stderr).unwrap(),
    }
}

#[derive(Debug)]
struct Output {
    exit_code: ExitCode,
    stdout: String,
    stderr: String,
}

fn create_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file
}

fn keypair(seed: u8) -> ([u8; 32], String) {
    let secret = [seed; 32];
    let key = p256::ecdsa::SigningKey::from_slice(&secret).unwrap();
    let point = key.verifying_key().to_encoded_point(false);
    let pubkey = format!(
        "{}{}",
        hex::encode(point.x().unwrap()),
        hex::encode(point.y().unwrap()),
    );
    (secret, pubkey)
}

/// Minimal SEC1 EC private key: SEQUENCE { version 1, privateKey }.
fn secret_pem(secret: &[u8; 32]) -> tempfile::NamedTempFile {
    let mut der = vec![0x30, 0x25, 0x02, 0x01, 0x01, 0x04, 0x20];
    der.extend_from_slice(secret);
    create_file(pem::encode(&pem::Pem::new("EC PRIVATE KEY", der)).as_bytes())
}

fn payload_bytes(len: usize) -> Vec<u8> {
    let mut state = 0x1234_5678u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect()
}

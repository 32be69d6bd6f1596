//! Command line arguments.

use std::path::PathBuf;

#[derive(clap::Parser)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the tags of an image file.
    Dump {
        /// The image file.
        #[clap(short, long)]
        input: PathBuf,
    },
    /// Assemble (and optionally sign and encrypt) an image file.
    Create {
        /// Path to PEM-encoded secret key. Omit to build an unsigned image.
        #[clap(long)]
        secret: Option<PathBuf>,
        /// Path to config file.
        #[clap(long, short)]
        config: Option<PathBuf>,
        /// Application payload file.
        #[clap(long)]
        application: Option<PathBuf>,
        /// Flash address the application payload is programmed to.
        #[clap(long, value_parser = parse_address, default_value = "0x8000")]
        application_address: u32,
        /// Version written in the application descriptor.
        #[clap(long, default_value_t = 1)]
        application_version: u32,
        /// Type word written in the application descriptor.
        #[clap(long, default_value_t = 0)]
        application_type: u32,
        /// Product id written in the application descriptor, 16 bytes of hex.
        #[clap(long)]
        product_id: Option<String>,
        /// Bootloader payload file.
        #[clap(long)]
        bootloader: Option<PathBuf>,
        /// Version written in the bootloader tag.
        #[clap(long, default_value_t = 0)]
        bootloader_version: u32,
        /// Base address written in the bootloader tag.
        #[clap(long, value_parser = parse_address, default_value = "0x0")]
        bootloader_base: u32,
        /// Metadata payload file.
        #[clap(long)]
        metadata: Option<PathBuf>,
        /// Compress the application payload. Valid values are "lz" and
        /// "block".
        #[clap(long)]
        compress: Option<String>,
        /// AES-128 key for the encrypted container, 16 bytes of hex.
        #[clap(long)]
        encryption_key: Option<String>,
        /// CTR nonce for the encrypted container, 12 bytes of hex.
        #[clap(long)]
        nonce: Option<String>,
        /// Payload size of each EncryptionData tag.
        #[clap(long, default_value_t = 1024)]
        container_size: u32,
        /// Path to write the image file.
        #[clap(short, long)]
        output: PathBuf,
    },
    /// Stream an image file through the verification engine.
    Verify {
        /// The image file.
        #[clap(short, long)]
        input: PathBuf,
        /// Public key the signature must verify against, 64 or 65 bytes of
        /// hex (raw x || y or uncompressed SEC1).
        #[clap(long)]
        pubkey: Option<String>,
        /// Path to config file.
        #[clap(long, short)]
        config: Option<PathBuf>,
        /// Accept images whose header does not declare a signature.
        #[clap(long)]
        allow_unsigned: bool,
        /// Skip over unknown tag ids instead of failing.
        #[clap(long)]
        allow_custom_tags: bool,
        /// AES-128 key for encrypted images, 16 bytes of hex.
        #[clap(long)]
        encryption_key: Option<String>,
        /// Start of application flash.
        #[clap(long, value_parser = parse_address, default_value = "0x8000")]
        application_base: u32,
        /// Base address bootloader tags must declare.
        #[clap(long, value_parser = parse_address, default_value = "0x0")]
        bootloader_base: u32,
        /// Staging location for bootloader upgrades.
        #[clap(long, value_parser = parse_address, default_value = "0x40000")]
        upgrade_location: u32,
        /// Write the reconstructed application flash contents to a file.
        #[clap(long)]
        extract_application: Option<PathBuf>,
    },
}

pub fn parse_address(s: &str) -> Result<u32, String> {
    let (digits, radix) = match s.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

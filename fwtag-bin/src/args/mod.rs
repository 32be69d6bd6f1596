use {clap::Parser, sec1::der::Decode, std::path::PathBuf};

mod cli;
mod config;

pub use config::Error as ConfigError;

/// Program arguments loaded from the CLI and config file.
#[derive(Debug, Clone)]
pub enum Args {
    /// List the tags of an image to stdout.
    Dump { input: PathBuf },
    /// Assemble an image file.
    Create {
        secret: Option<[u8; 32]>,
        application: Option<ApplicationInput>,
        bootloader: Option<BootloaderInput>,
        metadata: Option<PathBuf>,
        compress: Option<Compression>,
        encryption: Option<Encryption>,
        container_size: usize,
        output: PathBuf,
    },
    /// Verify an image file.
    Verify {
        input: PathBuf,
        pubkey: Option<[u8; 64]>,
        allow_unsigned: bool,
        allow_custom_tags: bool,
        decryption_key: Option<[u8; 16]>,
        layout: fwtag::MemoryLayout,
        extract_application: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct ApplicationInput {
    pub path: PathBuf,
    pub address: u32,
    pub descriptor: fwtag::AppData,
}

#[derive(Debug, Clone)]
pub struct BootloaderInput {
    pub path: PathBuf,
    pub version: u32,
    pub base: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Encryption {
    pub key: [u8; 16],
    pub nonce: [u8; 12],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Lz,
    Block,
}

pub fn args<I, T>(args: I) -> Result<Args, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Args::try_parse_from(args).map_err(Error::Cli)?;
    match cli.command {
        cli::Command::Dump { input } => Ok(Args::Dump { input }),
        cli::Command::Create {
            secret,
            config,
            application,
            application_address,
            application_version,
            application_type,
            product_id,
            bootloader,
            bootloader_version,
            bootloader_base,
            metadata,
            compress,
            encryption_key,
            nonce,
            container_size,
            output,
        } => {
            let config = config.map(|c| config::Config::load(&c)).transpose()?;
            let secret = reconcile(
                secret,
                config.as_ref().and_then(|c| c.secret.clone()),
                Error::SecretInConfigAndCli,
            )?;
            let encryption_key = reconcile(
                encryption_key,
                config.as_ref().and_then(|c| c.encryption_key.clone()),
                Error::EncryptionKeyInConfigAndCli,
            )?;

            let secret = secret.map(|path| load_secret(&path)).transpose()?;
            let application = application
                .map(|path| {
                    Ok::<_, Error>(ApplicationInput {
                        path,
                        address: application_address,
                        descriptor: fwtag::AppData {
                            app_type: application_type,
                            version: application_version,
                            capabilities: 0,
                            product_id: match product_id {
                                Some(hex) => fixed_hex(&hex)?,
                                None => [0; 16],
                            },
                        },
                    })
                })
                .transpose()?;
            let bootloader = bootloader.map(|path| BootloaderInput {
                path,
                version: bootloader_version,
                base: bootloader_base,
            });
            if compress.is_some() && application.is_none() {
                return Err(Error::CompressWithoutApplication);
            }
            let compress = compress
                .map(|c| match c.as_str() {
                    "lz" => Ok(Compression::Lz),
                    "block" => Ok(Compression::Block),
                    _ => Err(Error::InvalidCompression(c)),
                })
                .transpose()?;
            let encryption = encryption_key
                .map(|key| {
                    Ok::<_, Error>(Encryption {
                        key: fixed_hex(&key)?,
                        nonce: fixed_hex(&nonce.ok_or(Error::NonceMissing)?)?,
                    })
                })
                .transpose()?;
            Ok(Args::Create {
                secret,
                application,
                bootloader,
                metadata,
                compress,
                encryption,
                container_size: container_size.max(1) as usize,
                output,
            })
        }
        cli::Command::Verify {
            input,
            pubkey,
            config,
            allow_unsigned,
            allow_custom_tags,
            encryption_key,
            application_base,
            bootloader_base,
            upgrade_location,
            extract_application,
        } => {
            let config = config.map(|c| config::Config::load(&c)).transpose()?;
            let pubkey = reconcile(
                pubkey,
                config.as_ref().and_then(|c| c.pubkey.clone()),
                Error::PubkeyInConfigAndCli,
            )?;
            let encryption_key = reconcile(
                encryption_key,
                config.as_ref().and_then(|c| c.encryption_key.clone()),
                Error::EncryptionKeyInConfigAndCli,
            )?;

            let pubkey = pubkey.map(|hex| parse_pubkey(&hex)).transpose()?;
            if pubkey.is_none() && !allow_unsigned {
                return Err(Error::PubkeyMissing);
            }
            let decryption_key = encryption_key.map(|key| fixed_hex(&key)).transpose()?;
            Ok(Args::Verify {
                input,
                pubkey,
                allow_unsigned,
                allow_custom_tags,
                decryption_key,
                layout: fwtag::MemoryLayout {
                    start_of_app_space: application_base,
                    bootloader_base,
                    upgrade_location,
                },
                extract_application,
            })
        }
    }
}

/// Errors if `value` is specified both on the CLI and in the config file.
fn reconcile<V>(cli: Option<V>, config: Option<V>, both: Error) -> Result<Option<V>, Error> {
    match (cli, config) {
        (None, None) => Ok(None),
        (None, Some(value)) => Ok(Some(value)),
        (Some(value), None) => Ok(Some(value)),
        (Some(_), Some(_)) => Err(both),
    }
}

fn load_secret(path: &std::path::Path) -> Result<[u8; 32], Error> {
    let pem = std::fs::read(path).map_err(Error::ReadPemFile)?;
    let key = pem::parse(pem)?;
    if key.tag() != "EC PRIVATE KEY" {
        return Err(Error::InvalidPemTag(key.tag().to_string()));
    }
    let secret = sec1::EcPrivateKey::from_der(key.contents())
        .map_err(Error::ParseDerContent)?
        .private_key;
    secret.try_into().map_err(|_| Error::InvalidSecretKey)
}

fn parse_pubkey(hex: &str) -> Result<[u8; 64], Error> {
    let bytes = hex::decode(hex).map_err(|_| Error::InvalidPubkeyHex)?;
    // Raw x || y, or uncompressed SEC1 with its 0x04 prefix.
    let raw = match bytes.len() {
        64 => bytes.as_slice(),
        65 if bytes[0] == 0x04 => &bytes[1..],
        _ => return Err(Error::InvalidPubkey),
    };
    let mut pubkey = [0u8; 64];
    pubkey.copy_from_slice(raw);
    Ok(pubkey)
}

fn fixed_hex<const N: usize>(hex: &str) -> Result<[u8; N], Error> {
    hex::decode(hex)
        .map_err(|_| Error::InvalidKeyHex(hex.to_string()))?
        .try_into()
        .map_err(|_| Error::InvalidKeyHex(hex.to_string()))
}

#[derive(Debug)]
pub enum Error {
    Cli(clap::Error),
    CompressWithoutApplication,
    Config(ConfigError),
    EncryptionKeyInConfigAndCli,
    InvalidCompression(String),
    InvalidKeyHex(String),
    InvalidPemTag(String),
    InvalidPubkey,
    InvalidPubkeyHex,
    InvalidSecretKey,
    NonceMissing,
    ParseDerContent(sec1::der::Error),
    ParsePemFile(pem::PemError),
    PubkeyInConfigAndCli,
    PubkeyMissing,
    ReadPemFile(std::io::Error),
    SecretInConfigAndCli,
}

impl From<pem::PemError> for Error {
    fn from(e: pem::PemError) -> Self {
        Error::ParsePemFile(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::CompressWithoutApplication => {
                write!(f, "--compress requires an --application payload")
            }
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::EncryptionKeyInConfigAndCli => {
                write!(f, "encryption key specified in both config and cli")
            }
            Error::InvalidCompression(c) => {
                write!(f, r#"user specified invalid compression: "{c}""#)
            }
            Error::InvalidKeyHex(hex) => {
                write!(f, r#"invalid or wrongly sized hex value: "{hex}""#)
            }
            Error::InvalidPemTag(tag) => {
                write!(f, r#"invalid PEM tag: "{tag}", expected "EC PRIVATE KEY""#)
            }
            Error::InvalidPubkey => {
                write!(f, "public key must be 64 raw bytes or 65 SEC1 bytes of hex")
            }
            Error::InvalidPubkeyHex => write!(f, "user specified invalid public key hex"),
            Error::InvalidSecretKey => write!(f, "secret key is not 32 bytes"),
            Error::NonceMissing => {
                write!(f, "--nonce must be specified together with the encryption key")
            }
            Error::ParseDerContent(e) => {
                write!(f, "failed to parse DER content inside PEM file: {e}")
            }
            Error::ParsePemFile(e) => write!(f, "invalid PEM file: {e}"),
            Error::PubkeyInConfigAndCli => write!(f, "pubkey specified in both config and cli"),
            Error::PubkeyMissing => {
                write!(f, "a public key is required unless --allow-unsigned is set")
            }
            Error::ReadPemFile(e) => write!(f, "failed to read PEM file: {e}"),
            Error::SecretInConfigAndCli => write!(f, "secret specified in both config and cli"),
        }
    }
}

impl std::error::Error for Error {}

/// Parse errors.
///
/// Any error is terminal for the session: the parser latches into its error
/// state and every later [`parse`](crate::Parser::parse) call returns
/// [`Error::EndOfStream`]. Recovery is a fresh context and a re-stream from
/// the start of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The parser was asked to continue after reaching its terminal state.
    EndOfStream,
    /// A tag claimed an indivisible unit larger than the carry buffer.
    BufferOverflow,
    /// Tag id not part of the format and not registered as a codec tag.
    UnknownTag,
    /// A known tag arrived in a state where it is not legal.
    UnexpectedTag,
    /// The container Header tag was missing or its type flags are
    /// incompatible with this parser's requirements.
    FileType,
    /// Container major version, or a version-dependency gate, failed.
    VersionMismatch,
    /// Running CRC-32 did not match the End tag.
    CrcMismatch,
    /// Signature or certificate verification failed.
    SignatureRejected,
    /// No decryption key available, or garbage inside an encrypted
    /// container (most likely the wrong key).
    DecryptionKey,
    /// A codec finished a tag in a state other than a clean end of stream.
    CompressionState,
    /// A codec encountered malformed compressed data.
    CompressionData,
    /// A codec exceeded its fixed working set.
    CompressionMem,
    /// Compressed data disagreed with the tag length.
    CompressionDataLen,
    /// The board's application acceptance policy, or anti-rollback
    /// protection, vetoed the image.
    Rejected,
    /// A programming address was not word-aligned, or address arithmetic
    /// wrapped.
    Alignment,
    /// The write sink reported a failure.
    Storage,
    /// The parser context was constructed with an unusable configuration.
    Init,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "parser already finished"),
            Self::BufferOverflow => write!(f, "carry buffer overflow"),
            Self::UnknownTag => write!(f, "unknown tag id"),
            Self::UnexpectedTag => write!(f, "tag not legal in this state"),
            Self::FileType => write!(f, "container type not accepted"),
            Self::VersionMismatch => write!(f, "version check failed"),
            Self::CrcMismatch => write!(f, "file CRC mismatch"),
            Self::SignatureRejected => write!(f, "signature rejected"),
            Self::DecryptionKey => write!(f, "decryption key missing or wrong"),
            Self::CompressionState => write!(f, "decompressor ended mid-stream"),
            Self::CompressionData => write!(f, "malformed compressed data"),
            Self::CompressionMem => write!(f, "decompressor working set exceeded"),
            Self::CompressionDataLen => write!(f, "compressed data length mismatch"),
            Self::Rejected => write!(f, "image rejected by policy"),
            Self::Alignment => write!(f, "unaligned or wrapping address"),
            Self::Storage => write!(f, "sink write failed"),
            Self::Init => write!(f, "invalid parser configuration"),
        }
    }
}

/// Failure reported by a [`Sink`](crate::Sink) callback. Always fatal for
/// the parse session; the engine performs no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SinkError;

impl From<SinkError> for Error {
    fn from(_: SinkError) -> Self {
        Error::Storage
    }
}

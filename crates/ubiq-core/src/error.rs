use thiserror::Error;

/// Errors surfaced by the library.
///
/// Transport failures carry the request URL and whatever the server said;
/// everything produced locally (formatting, header parsing, tag checks,
/// key unwrapping) gets its own variant so callers can distinguish "the
/// server rejected me" from "this ciphertext is bad".
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A required credential field is empty or absent.
    #[error("credentials not set: missing {0}")]
    CredentialsMissing(&'static str),

    /// The configuration file exists but could not be parsed.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Non-2xx response from the server, or no response at all
    /// (`status == 0` for connection-level failures).
    #[error("HTTP {status} from {url}: {reason}")]
    Transport {
        url: String,
        status: u16,
        reason: String,
        body: String,
    },

    /// RSA unwrap failure, cipher initialization failure or AEAD tag
    /// mismatch. Also covers responses that are not the JSON we expect.
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// Structured input contains a character outside the input alphabet
    /// and the passthrough set.
    #[error("invalid input string character(s)")]
    InvalidInputCharacter,

    /// Structured input outside the dataset's length bounds, or an
    /// unstructured ciphertext truncated below the tag length.
    #[error("{0}")]
    InvalidLength(String),

    /// Unstructured ciphertext header with an unknown version or
    /// reserved flag bits set.
    #[error("invalid encryption header: {0}")]
    InvalidHeader(String),

    /// An encryption session was used more times than the server allowed.
    #[error("maximum key uses exceeded")]
    QuotaExceeded,

    /// Session misuse: `begin()` while a piece is already in progress,
    /// or `update()`/`end()` without one.
    #[error("{0}")]
    IllegalState(&'static str),

    /// The server named an algorithm (or rule type) this client does not
    /// implement.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl Error {
    pub(crate) fn length(len: usize, min: usize, max: usize) -> Self {
        Error::InvalidLength(format!(
            "invalid input len ({len}) min: {min} max: {max}"
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

/// Errors surfaced by the encrypted OOXML container codec.
///
/// The taxonomy is deliberately coarse: cryptographic failures collapse into
/// [`OffcryptoError::InvalidPassword`] / [`OffcryptoError::IntegrityFailure`]
/// without distinguishing the internal cause, so the error itself cannot be
/// used as a padding/verifier oracle.
#[derive(Debug, Error)]
pub enum OffcryptoError {
    #[error("invalid password")]
    InvalidPassword,
    #[error("data integrity check failed")]
    IntegrityFailure,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed encryption envelope: {0}")]
    MalformedEnvelope(String),
    #[error("input is not an encrypted OOXML package")]
    NotEncryptedPackage,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Sealing failed")]
    SealFailed,

    #[error("Sealed data too short")]
    Truncated,

    #[error("Opening failed: wrong key, purpose or tampered data")]
    OpenFailed,
}

/// Why a download handle could not be resolved.
///
/// The variants exist for logging only. Callers facing the network must
/// collapse all of them into a plain "not found".
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandleError {
    #[error("Handle is not valid base64")]
    Encoding,

    #[error("Handle is too short")]
    Truncated,

    #[error("Handle failed authentication")]
    Authentication,

    #[error("Handle payload is not a blob id")]
    Payload,

    #[error("Handle could not be sealed")]
    Seal,
}

impl From<CryptoError> for HandleError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SealFailed => HandleError::Seal,
            CryptoError::Truncated => HandleError::Truncated,
            CryptoError::OpenFailed => HandleError::Authentication,
        }
    }
}

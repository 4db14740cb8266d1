use {
    crate::store::StoreError,
    hyper::StatusCode,
    imgvault_sdk::crypto::CryptoError,
    tracing::{error, warn},
};

pub const DECRYPTION_FAILED_MESSAGE: &str = "Decryption failed. Check your key.";

/// Failures surfaced to API callers. The display text is safe to return.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Image not found")]
    NotFound,
    #[error("{}", DECRYPTION_FAILED_MESSAGE)]
    DecryptionFailed,
    #[error("Storage is temporarily unavailable")]
    StorageUnavailable,
    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::DecryptionFailed => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Logs the error at a level matching its severity.
    pub fn log(&self) {
        match self {
            Self::InvalidInput(message) => warn!(%message, "rejected request"),
            Self::NotFound => warn!("image not found"),
            Self::DecryptionFailed => warn!("decryption failed"),
            Self::StorageUnavailable => error!("storage unavailable"),
            Self::Internal(err) => error!(?err, "internal error"),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Abandoned => Self::StorageUnavailable,
            err @ (StoreError::Corrupted(_) | StoreError::Io(_)) => Self::Internal(err.into()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeyInput => Self::invalid_input("Encryption key is required"),
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
            // Tag and padding never get checked; the stored record itself is broken.
            CryptoError::MalformedCiphertext => Self::Internal(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, imgvault_protocol::ImageId};

    #[test]
    fn status_codes() {
        assert_eq!(
            Error::invalid_input("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::from(CryptoError::DecryptionFailed).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::StorageUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::from(CryptoError::MalformedCiphertext).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::from(StoreError::Corrupted(ImageId::from_sequence(1))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::from(StoreError::NotFound).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::from(StoreError::Abandoned).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn messages_hide_internals() {
        let err = Error::from(StoreError::Io(anyhow::anyhow!("disk /var/x exploded")));
        assert_eq!(err.to_string(), "Internal server error");
        assert_eq!(
            Error::DecryptionFailed.to_string(),
            "Decryption failed. Check your key."
        );
    }
}

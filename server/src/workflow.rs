//! Upload and decrypt workflows.
//!
//! Each workflow walks through a fixed sequence of stages. The current stage
//! is recorded on the request span, so a failure in the logs says where it
//! happened without ever logging the key or the image.

use {
    crate::{
        error::Error,
        store::{CommitGate, NewImage, RecordStore, StoreError, StoreStatus},
    },
    derivative::Derivative,
    derive_more::Display,
    imgvault_protocol::{ImageId, ImageMetadata, Passphrase},
    imgvault_sdk::crypto::{Cipher, CryptoError, derive_key},
    std::{fmt, sync::Arc, time::Duration},
    tokio::{
        task::{block_in_place, spawn_blocking},
        time::timeout,
    },
    tracing::{Span, debug, error, field, info, instrument, warn},
    zeroize::Zeroizing,
};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
pub const DEFAULT_FILE_NAME: &str = "image";
const MAX_FILE_NAME_CHARS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UploadStage {
    Received,
    Deriving,
    Encrypting,
    Persisting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DecryptStage {
    Requested,
    Loading,
    Deriving,
    Decrypting,
    Done,
}

/// Tracks the stage of a running workflow on the current span.
struct Progress<S> {
    stage: S,
}

impl<S: Copy + fmt::Display> Progress<S> {
    fn new(stage: S) -> Self {
        Span::current().record("stage", field::display(stage));
        Self { stage }
    }

    fn advance(&mut self, stage: S) {
        self.stage = stage;
        Span::current().record("stage", field::display(stage));
        debug!(%stage, "workflow stage");
    }

    fn fail(&self, err: Error) -> Error {
        let span = Span::current();
        span.record("stage", "Failed");
        span.record("failed_at", field::display(self.stage));
        err
    }
}

/// A received upload, before validation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Upload {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    #[derivative(Debug = "ignore")]
    pub content: Zeroizing<Vec<u8>>,
    pub key: Option<Passphrase>,
}

/// Plaintext of a stored image. Only ever held in memory.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DecryptedImage {
    pub metadata: ImageMetadata,
    #[derivative(Debug = "ignore")]
    pub content: Zeroizing<Vec<u8>>,
}

#[derive(Clone)]
pub struct ImageService {
    store: Arc<dyn RecordStore>,
    storage_timeout: Duration,
}

impl fmt::Debug for ImageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageService")
            .field("storage_timeout", &self.storage_timeout)
            .finish_non_exhaustive()
    }
}

fn parse_id(id: &str) -> Result<ImageId, Error> {
    id.parse().map_err(|_| Error::invalid_input("Invalid image id"))
}

/// Keeps the last path component and drops control characters.
#[must_use]
pub fn sanitize_file_name(name: Option<&str>) -> String {
    let name = name
        .unwrap_or_default()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        DEFAULT_FILE_NAME.to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Declared types end up in a response header, so anything odd is replaced.
#[must_use]
pub fn sanitize_mime_type(mime_type: Option<&str>) -> String {
    match mime_type.map(str::trim) {
        Some(value)
            if value.contains('/')
                && value.len() <= MAX_FILE_NAME_CHARS
                && value.bytes().all(|b| b.is_ascii_graphic() || b == b' ') =>
        {
            value.to_owned()
        }
        _ => DEFAULT_MIME_TYPE.to_owned(),
    }
}

impl ImageService {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, storage_timeout: Duration) -> Self {
        Self {
            store,
            storage_timeout,
        }
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> Result<T, StoreError> + Send + 'static,
    {
        self.with_gated_store(move |store, _| f(store)).await
    }

    /// Runs a store operation on the blocking pool.
    ///
    /// The operation keeps running when the timeout fires. It gets a
    /// [`CommitGate`] that is abandoned at that point, so a write that has not
    /// been published yet is rolled back instead. If publishing has already
    /// started, the result is awaited past the timeout.
    async fn with_gated_store<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore, &CommitGate) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let gate = CommitGate::default();
        let task_gate = gate.clone();
        let mut task = spawn_blocking(move || f(&*store, &task_gate));
        let joined = match timeout(self.storage_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => {
                warn!(timeout = ?self.storage_timeout, "storage operation timed out");
                return Err(Error::StorageUnavailable);
            }
            Err(_) => {
                debug!("storage operation timed out while publishing, waiting for it");
                task.await
            }
        };
        match joined {
            Ok(result) => Ok(result?),
            Err(err) => {
                error!(?err, "storage task failed");
                Err(Error::StorageUnavailable)
            }
        }
    }

    /// Encrypts and stores an image. Returns the new record's metadata.
    #[instrument(skip_all, fields(stage = field::Empty, failed_at = field::Empty))]
    pub async fn upload(&self, upload: Upload) -> Result<ImageMetadata, Error> {
        let mut progress = Progress::new(UploadStage::Received);
        let result = self.run_upload(upload, &mut progress).await;
        result.map_err(|err| progress.fail(err))
    }

    async fn run_upload(
        &self,
        upload: Upload,
        progress: &mut Progress<UploadStage>,
    ) -> Result<ImageMetadata, Error> {
        let Upload {
            file_name,
            mime_type,
            content,
            key,
        } = upload;
        let key = key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::invalid_input("Encryption key is required"))?;
        key.ensure_min_length()
            .map_err(|err| Error::invalid_input(err.to_string()))?;
        if content.is_empty() {
            return Err(Error::invalid_input("Please select an image file"));
        }
        let image = NewImage {
            original_name: sanitize_file_name(file_name.as_deref()),
            mime_type: sanitize_mime_type(mime_type.as_deref()),
            size: u64::try_from(content.len()).map_err(|err| Error::Internal(err.into()))?,
        };

        progress.advance(UploadStage::Deriving);
        let key = derive_key(&key)?;

        progress.advance(UploadStage::Encrypting);
        let encrypted = block_in_place(|| Cipher::new(&key).encrypt(&content));
        drop(content);

        progress.advance(UploadStage::Persisting);
        let metadata = self
            .with_gated_store(move |store, gate| store.create(image, &encrypted, gate))
            .await?;

        progress.advance(UploadStage::Done);
        info!(id = %metadata.id, size = metadata.size, "image stored");
        Ok(metadata)
    }

    /// Decrypts a stored image with a key supplied by the caller.
    #[instrument(skip_all, fields(%id, stage = field::Empty, failed_at = field::Empty))]
    pub async fn decrypt(&self, id: &str, key: Passphrase) -> Result<DecryptedImage, Error> {
        let mut progress = Progress::new(DecryptStage::Requested);
        let result = self.run_decrypt(id, key, &mut progress).await;
        result.map_err(|err| progress.fail(err))
    }

    async fn run_decrypt(
        &self,
        id: &str,
        key: Passphrase,
        progress: &mut Progress<DecryptStage>,
    ) -> Result<DecryptedImage, Error> {
        let id = parse_id(id)?;
        if key.is_empty() {
            return Err(Error::invalid_input("Encryption key is required"));
        }

        progress.advance(DecryptStage::Loading);
        let record = self.with_store(move |store| store.get(&id)).await?;

        progress.advance(DecryptStage::Deriving);
        let key = derive_key(&key)?;

        progress.advance(DecryptStage::Decrypting);
        let content =
            block_in_place(|| Cipher::new(&key).decrypt(&record.encrypted)).map_err(|err| {
                if err == CryptoError::MalformedCiphertext {
                    error!(%id, "stored ciphertext has an invalid length");
                }
                Error::from(err)
            })?;

        progress.advance(DecryptStage::Done);
        Ok(DecryptedImage {
            metadata: record.metadata,
            content,
        })
    }

    pub async fn list(&self) -> Result<Vec<ImageMetadata>, Error> {
        self.with_store(|store| store.list()).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let id = parse_id(id)?;
        self.with_store(move |store| store.delete(&id)).await?;
        info!(%id, "image deleted");
        Ok(())
    }

    pub async fn status(&self) -> Result<StoreStatus, Error> {
        self.with_store(|store| store.status()).await
    }
}

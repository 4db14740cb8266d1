//! Image records: metadata in a `sled` tree, encrypted blobs in [`Storage`].
//!
//! A record becomes visible only when its metadata is inserted, which happens
//! after its blob is fully written. Deletion removes the metadata first, so a
//! crash at any point leaves at worst an orphan blob, never a record whose
//! blob is missing.

use {
    crate::storage::Storage,
    anyhow::Context as _,
    chrono::Utc,
    fs_err::create_dir_all,
    imgvault_protocol::{ImageId, ImageMetadata, encoding},
    imgvault_sdk::crypto::{BLOCK_SIZE, EncryptedImage},
    serde::{Deserialize, Serialize},
    std::{
        borrow::Cow,
        collections::HashSet,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicU8, Ordering},
        },
    },
    tracing::{info, warn},
};

const IMAGES_TREE: &str = "images";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("image not found")]
    NotFound,
    #[error("stored image {0} is corrupted")]
    Corrupted(ImageId),
    #[error("write abandoned by the caller")]
    Abandoned,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Io(err.into())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Io(err.into())
    }
}

/// Metadata supplied by the uploader. Id and upload date are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct ImageRecord {
    pub metadata: ImageMetadata,
    pub encrypted: EncryptedImage,
}

/// On-disk blob format. The variant index doubles as a format version.
#[derive(Serialize, Deserialize)]
enum StoredBlob<'a> {
    V1(Cow<'a, EncryptedImage>),
}

const PENDING: u8 = 0;
const PUBLISHING: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides whether a write that outlived its caller may still become visible.
///
/// Exactly one of [`CommitGate::publish`] and [`CommitGate::abandon`] succeeds.
#[derive(Debug, Clone, Default)]
pub struct CommitGate(Arc<AtomicU8>);

impl CommitGate {
    /// Called by the store right before the record becomes visible.
    /// Returns `false` if the caller has already given up.
    #[must_use]
    pub fn publish(&self) -> bool {
        self.transition(PUBLISHING)
    }

    /// Called by the caller when it stops waiting. Returns `false` if the
    /// record is already being published.
    #[must_use]
    pub fn abandon(&self) -> bool {
        self.transition(ABANDONED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Operations the workflows need from persistent storage.
///
/// Implementations must make `create`, `get` and `delete` atomic per record.
pub trait RecordStore: Send + Sync + 'static {
    /// Must not make the record visible unless `gate.publish()` succeeds.
    fn create(
        &self,
        image: NewImage,
        encrypted: &EncryptedImage,
        gate: &CommitGate,
    ) -> Result<ImageMetadata, StoreError>;

    /// Newest first.
    fn list(&self) -> Result<Vec<ImageMetadata>, StoreError>;

    fn get(&self, id: &ImageId) -> Result<ImageRecord, StoreError>;

    fn delete(&self, id: &ImageId) -> Result<(), StoreError>;

    fn status(&self) -> Result<StoreStatus, StoreError>;
}

#[derive(Debug)]
pub struct ImageStore {
    root: PathBuf,
    db: sled::Db,
    images: sled::Tree,
    blobs: Storage,
    #[cfg(test)]
    fail_metadata_insert: std::sync::atomic::AtomicBool,
}

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub records: usize,
    pub blobs: usize,
    /// Records whose blob file is gone.
    pub missing_blobs: Vec<ImageId>,
    /// Records whose metadata or blob can't be decoded.
    pub corrupted: Vec<ImageId>,
    /// Metadata entries whose key isn't a valid id.
    pub invalid_keys: usize,
    /// Blobs without a record, left behind by an interrupted upload or delete.
    pub orphaned_blobs: Vec<ImageId>,
    pub removed: usize,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing_blobs.is_empty()
            && self.corrupted.is_empty()
            && self.invalid_keys == 0
            && self.orphaned_blobs.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreStatus {
    pub image_count: u64,
    pub available_space: u64,
}

fn decode_metadata(id: &ImageId, value: &[u8]) -> Result<ImageMetadata, StoreError> {
    let metadata: ImageMetadata =
        encoding::deserialize(value).map_err(|_| StoreError::Corrupted(*id))?;
    if metadata.id != *id {
        return Err(StoreError::Corrupted(*id));
    }
    Ok(metadata)
}

fn decode_blob(id: &ImageId, data: &[u8]) -> Result<EncryptedImage, StoreError> {
    let StoredBlob::V1(encrypted) =
        encoding::deserialize(data).map_err(|_| StoreError::Corrupted(*id))?;
    Ok(encrypted.into_owned())
}

impl ImageStore {
    /// Opens or creates a store under `root`.
    ///
    /// The metadata database is locked for the lifetime of the store, so only
    /// one process can use a root at a time.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        create_dir_all(root)?;
        let db = sled::open(root.join("metadata")).with_context(|| {
            format!(
                "failed to open metadata database in {} (is another instance running?)",
                root.display()
            )
        })?;
        let images = db.open_tree(IMAGES_TREE)?;
        let blob_root = root.join("blobs");
        create_dir_all(&blob_root)?;
        let blobs = Storage::new(blob_root)?;
        let stale = blobs.clean_tmp()?;
        if stale > 0 {
            info!(stale, "removed temp files left by interrupted uploads");
        }
        Ok(Self {
            root: root.to_owned(),
            db,
            images,
            blobs,
            #[cfg(test)]
            fail_metadata_insert: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn insert_metadata(&self, metadata: &ImageMetadata) -> Result<(), StoreError> {
        let value = encoding::serialize(metadata)?;
        self.images.insert(metadata.id.as_bytes(), value)?;
        #[cfg(test)]
        if self.fail_metadata_insert.load(Ordering::Relaxed) {
            return Err(StoreError::Io(anyhow::anyhow!("metadata flush failed")));
        }
        self.db.flush()?;
        Ok(())
    }

    /// Cross-checks metadata against blobs. With `fix`, removes records that
    /// can't be decrypted anymore and orphaned blobs.
    ///
    /// Must not run while another writer uses the store: a blob written just
    /// before its metadata would be reported as orphaned.
    pub fn check_integrity(&self, fix: bool) -> anyhow::Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let mut known = HashSet::new();
        let mut broken_keys = Vec::new();

        for pair in self.images.iter() {
            let (key, value) = pair?;
            report.records = report.records.saturating_add(1);
            let Ok(id) = ImageId::from_bytes(&key) else {
                report.invalid_keys = report.invalid_keys.saturating_add(1);
                broken_keys.push(key);
                continue;
            };
            known.insert(id);
            if decode_metadata(&id, &value).is_err() {
                report.corrupted.push(id);
                continue;
            }
            match self.blobs.read(&id)? {
                None => report.missing_blobs.push(id),
                Some(data) => {
                    let valid = decode_blob(&id, &data).is_ok_and(|encrypted| {
                        !encrypted.ciphertext.is_empty()
                            && encrypted.ciphertext.len() % BLOCK_SIZE == 0
                    });
                    if !valid {
                        report.corrupted.push(id);
                    }
                }
            }
        }

        let blob_ids = self.blobs.ids()?;
        report.blobs = blob_ids.len();
        report.orphaned_blobs = blob_ids
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();

        if fix {
            for key in broken_keys {
                self.images.remove(key)?;
                report.removed = report.removed.saturating_add(1);
            }
            for id in report.missing_blobs.iter().chain(&report.corrupted) {
                self.images.remove(id.as_bytes())?;
                self.blobs.remove(id)?;
                report.removed = report.removed.saturating_add(1);
            }
            for id in &report.orphaned_blobs {
                self.blobs.remove(id)?;
                report.removed = report.removed.saturating_add(1);
            }
            self.db.flush()?;
        }
        Ok(report)
    }
}

impl RecordStore for ImageStore {
    fn create(
        &self,
        image: NewImage,
        encrypted: &EncryptedImage,
        gate: &CommitGate,
    ) -> Result<ImageMetadata, StoreError> {
        let id = ImageId::from_sequence(self.db.generate_id()?);
        let metadata = ImageMetadata {
            id,
            original_name: image.original_name,
            mime_type: image.mime_type,
            size: image.size,
            upload_date: Utc::now(),
        };
        let mut file = self.blobs.create_file()?;
        encoding::serialize_into(&mut file, &StoredBlob::V1(Cow::Borrowed(encrypted)))?;
        self.blobs.commit_file(file, &id)?;

        let published = if gate.publish() {
            self.insert_metadata(&metadata)
        } else {
            Err(StoreError::Abandoned)
        };
        if let Err(err) = published {
            // Undo both halves; the record must not become visible.
            if let Err(err) = self.images.remove(id.as_bytes()) {
                warn!(?err, %id, "failed to roll back metadata");
            }
            if let Err(err) = self.blobs.remove(&id) {
                warn!(?err, %id, "failed to roll back blob, left as orphan");
            }
            return Err(err);
        }
        Ok(metadata)
    }

    fn list(&self) -> Result<Vec<ImageMetadata>, StoreError> {
        let mut images = Vec::new();
        for pair in self.images.iter() {
            let (key, value) = pair?;
            let decoded = ImageId::from_bytes(&key)
                .map_err(|err| StoreError::Io(err.into()))
                .and_then(|id| decode_metadata(&id, &value));
            match decoded {
                Ok(metadata) => images.push(metadata),
                Err(err) => warn!(?err, "skipping unreadable image metadata"),
            }
        }
        images.sort_by(|a, b| {
            b.upload_date
                .cmp(&a.upload_date)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(images)
    }

    fn get(&self, id: &ImageId) -> Result<ImageRecord, StoreError> {
        let value = self
            .images
            .get(id.as_bytes())?
            .ok_or(StoreError::NotFound)?;
        let metadata = decode_metadata(id, &value)?;
        let Some(data) = self.blobs.read(id)? else {
            // A concurrent delete removes metadata before the blob.
            return if self.images.contains_key(id.as_bytes())? {
                Err(StoreError::Corrupted(*id))
            } else {
                Err(StoreError::NotFound)
            };
        };
        Ok(ImageRecord {
            metadata,
            encrypted: decode_blob(id, &data)?,
        })
    }

    fn delete(&self, id: &ImageId) -> Result<(), StoreError> {
        if self.images.remove(id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound);
        }
        self.db.flush()?;
        match self.blobs.remove(id) {
            Ok(true) => {}
            Ok(false) => warn!(%id, "deleted image had no blob"),
            Err(err) => warn!(?err, %id, "failed to remove blob, left as orphan"),
        }
        Ok(())
    }

    fn status(&self) -> Result<StoreStatus, StoreError> {
        Ok(StoreStatus {
            image_count: u64::try_from(self.images.len()).context("invalid record count")?,
            available_space: fs2::available_space(&self.root)
                .context("failed to query available space")?,
        })
    }
}

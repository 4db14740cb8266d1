use {
    anyhow::{Result, bail},
    fs_err::{File, create_dir_all, read_dir, remove_file, rename},
    imgvault_protocol::ImageId,
    std::{
        io::{ErrorKind, Read, Write},
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
    tracing::{debug, warn},
};

/// Blob area: one file per record, holding the encoded IV, tag and ciphertext.
///
/// Files only appear at their final path through a rename, so a reader either
/// sees a complete blob or no blob.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    tmp: PathBuf,
}

fn storage_paths(root: &Path, id: &ImageId) -> (PathBuf, PathBuf) {
    let name = id.to_string();
    let (first, rest) = name.split_at(2);
    let dir = root.join(first).join(rest.get(..2).unwrap_or_default());
    let file_path = dir.join(&name);
    (dir, file_path)
}

impl Storage {
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.try_exists()? {
            bail!("blob storage root doesn't exist: {}", root.display());
        }

        let tmp = root.join("tmp");
        create_dir_all(&tmp)?;

        Ok(Self { root, tmp })
    }

    /// Deletes temp files left over from interrupted writes.
    pub fn clean_tmp(&self) -> Result<usize> {
        let mut removed = 0_usize;
        for entry in read_dir(&self.tmp)? {
            let path = entry?.path();
            match remove_file(&path) {
                Ok(()) => removed = removed.saturating_add(1),
                Err(err) => warn!(?err, "failed to remove stale temp file"),
            }
        }
        Ok(removed)
    }

    pub fn create_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.tmp)?)
    }

    pub fn commit_file(&self, mut file: NamedTempFile, id: &ImageId) -> Result<()> {
        file.flush()?;
        file.as_file().sync_all()?;
        let (dir, new_file_path) = storage_paths(&self.root, id);
        create_dir_all(dir)?;
        let (_, old_path) = file.keep()?;
        if let Err(err) = rename(&old_path, new_file_path) {
            let _ = remove_file(&old_path);
            return Err(err.into());
        }
        Ok(())
    }

    /// Writes a complete blob. Nothing is visible at the final path until the
    /// data is on disk.
    #[cfg(test)]
    pub fn write(&self, id: &ImageId, data: &[u8]) -> Result<()> {
        let mut file = self.create_file()?;
        file.write_all(data)?;
        self.commit_file(file, id)
    }

    /// Returns `None` if there is no blob for `id`.
    pub fn read(&self, id: &ImageId) -> Result<Option<Vec<u8>>> {
        let (_, path) = storage_paths(&self.root, id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Returns `false` if there was no blob for `id`.
    pub fn remove(&self, id: &ImageId) -> Result<bool> {
        let (_, path) = storage_paths(&self.root, id);
        match remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Ids of all committed blobs. Files that don't look like blobs are skipped.
    pub fn ids(&self) -> Result<Vec<ImageId>> {
        let mut ids = Vec::new();
        for shard in read_dir(&self.root)? {
            let shard = shard?;
            if shard.path() == self.tmp || !shard.file_type()?.is_dir() {
                continue;
            }
            for subshard in read_dir(shard.path())? {
                let subshard = subshard?;
                if !subshard.file_type()?.is_dir() {
                    continue;
                }
                for file in read_dir(subshard.path())? {
                    let file = file?;
                    match file.file_name().to_str().map(str::parse::<ImageId>) {
                        Some(Ok(id)) => ids.push(id),
                        _ => debug!(path = ?file.path(), "skipping unexpected file in blob storage"),
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, tempfile::TempDir};

    #[test]
    fn basic() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().into()).unwrap();
        let id = ImageId::from_sequence(1);
        assert_eq!(storage.read(&id).unwrap(), None);

        storage.write(&id, b"ok\n").unwrap();
        assert_eq!(storage.read(&id).unwrap().unwrap(), b"ok\n");
        assert_eq!(storage.ids().unwrap(), vec![id]);

        assert!(storage.remove(&id).unwrap());
        assert!(!storage.remove(&id).unwrap());
        assert_eq!(storage.read(&id).unwrap(), None);
        assert!(storage.ids().unwrap().is_empty());
    }

    #[test]
    fn sharded_layout() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().into()).unwrap();
        let id: ImageId = "abcdef000000000000000001".parse().unwrap();
        storage.write(&id, b"x").unwrap();
        assert!(
            dir.path()
                .join("ab")
                .join("cd")
                .join("abcdef000000000000000001")
                .is_file()
        );
    }

    #[test]
    fn uncommitted_file_is_invisible_and_cleaned() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().into()).unwrap();
        let mut file = storage.create_file().unwrap();
        file.write_all(b"partial").unwrap();
        let (_, _path) = file.keep().unwrap();

        assert!(storage.ids().unwrap().is_empty());
        assert_eq!(storage.clean_tmp().unwrap(), 1);
        assert_eq!(storage.clean_tmp().unwrap(), 0);
    }

    #[test]
    fn missing_root() {
        let dir = TempDir::new().unwrap();
        Storage::new(dir.path().join("nope")).unwrap_err();
    }
}

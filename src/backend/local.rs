//! Storage element over a local directory tree.
//!
//! SURL paths are resolved below a root directory and TURLs are `file://`
//! URLs. Pins, uploads and space reservations are tracked in memory only.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{BackendError, FileMetaData, SpaceReservation, StorageBackend, TransferUrl};
use crate::job::{SrmUser, Surl};

#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
    capacity: Option<u64>,
    uploads: Mutex<HashMap<String, PathBuf>>,
    pins: Mutex<HashMap<String, PathBuf>>,
    reservations: Mutex<HashMap<String, u64>>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capacity: None,
            uploads: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Limits the total size of outstanding space reservations.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of pins currently held.
    pub fn pin_count(&self) -> usize {
        lock(&self.pins).len()
    }

    /// Number of prepared uploads not yet completed or aborted.
    pub fn upload_count(&self) -> usize {
        lock(&self.uploads).len()
    }

    /// Maps a SURL to a path under the root, rejecting `..` components.
    pub fn resolve(&self, surl: &Surl) -> Result<PathBuf, BackendError> {
        let mut path = self.root.clone();
        for component in Path::new(surl.path()).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(BackendError::InvalidPath(format!(
                        "{} escapes the storage root",
                        surl
                    )))
                }
            }
        }
        Ok(path)
    }

    fn turl(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    async fn existing_file(&self, surl: &Surl) -> Result<PathBuf, BackendError> {
        let path = self.resolve(surl)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(surl, e))?;
        if metadata.is_dir() {
            return Err(BackendError::InvalidPath(format!("{} is a directory", surl)));
        }
        Ok(path)
    }
}

fn io_error(surl: &Surl, e: io::Error) -> BackendError {
    match e.kind() {
        io::ErrorKind::NotFound => BackendError::InvalidPath(format!("{}: no such file", surl)),
        io::ErrorKind::PermissionDenied => BackendError::AuthorizationDenied(surl.to_string()),
        io::ErrorKind::AlreadyExists => BackendError::AlreadyExists(surl.to_string()),
        _ => BackendError::Internal(format!("{}: {}", surl, e)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn prepare_to_get(
        &self,
        _user: &SrmUser,
        surl: &Surl,
        _protocols: &[String],
    ) -> Result<TransferUrl, BackendError> {
        let path = self.existing_file(surl).await?;
        Ok(TransferUrl {
            turl: Self::turl(&path),
            file_id: Uuid::new_v4().to_string(),
        })
    }

    async fn prepare_to_put(
        &self,
        _user: &SrmUser,
        surl: &Surl,
        _size: Option<u64>,
        overwrite: bool,
        _protocols: &[String],
    ) -> Result<TransferUrl, BackendError> {
        let path = self.resolve(surl)?;
        if !overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BackendError::AlreadyExists(surl.to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(surl, e))?;
        }

        let file_id = Uuid::new_v4().to_string();
        lock(&self.uploads).insert(file_id.clone(), path.clone());
        debug!(surl = %surl, file_id = %file_id, "Prepared upload");
        Ok(TransferUrl {
            turl: Self::turl(&path),
            file_id,
        })
    }

    async fn put_done(
        &self,
        _user: &SrmUser,
        surl: &Surl,
        file_id: &str,
    ) -> Result<(), BackendError> {
        let path = lock(&self.uploads)
            .get(file_id)
            .cloned()
            .ok_or_else(|| BackendError::InvalidPath(format!("no upload {} for {}", file_id, surl)))?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BackendError::InvalidPath(format!("{} was not written", surl)));
        }
        lock(&self.uploads).remove(file_id);
        Ok(())
    }

    async fn abort_put(
        &self,
        _user: &SrmUser,
        surl: &Surl,
        file_id: &str,
    ) -> Result<(), BackendError> {
        let Some(path) = lock(&self.uploads).remove(file_id) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(surl, e)),
        }
    }

    async fn pin(
        &self,
        _user: &SrmUser,
        surl: &Surl,
        _lifetime: Duration,
    ) -> Result<String, BackendError> {
        let path = self.existing_file(surl).await?;
        let pin_id = Uuid::new_v4().to_string();
        lock(&self.pins).insert(pin_id.clone(), path);
        Ok(pin_id)
    }

    async fn unpin(&self, _user: &SrmUser, surl: &Surl, pin_id: &str) -> Result<(), BackendError> {
        lock(&self.pins)
            .remove(pin_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::InvalidPath(format!("no pin {} for {}", pin_id, surl)))
    }

    async fn remove(&self, _user: &SrmUser, surl: &Surl) -> Result<(), BackendError> {
        let path = self.existing_file(surl).await?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(surl, e))
    }

    async fn list_directory(
        &self,
        _user: &SrmUser,
        surl: &Surl,
        depth: u32,
    ) -> Result<Vec<FileMetaData>, BackendError> {
        let path = self.resolve(surl)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(surl, e))?;
        if !metadata.is_dir() {
            return Ok(vec![FileMetaData {
                surl: surl.to_string(),
                size: metadata.len(),
                is_directory: false,
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            }]);
        }

        let base = surl.as_str().trim_end_matches('/').to_string();
        let max_depth = depth.max(1) as usize;
        let walk_surl = surl.clone();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&path).min_depth(1).max_depth(max_depth).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    e.into_io_error()
                        .map(|io| io_error(&walk_surl, io))
                        .unwrap_or_else(|| BackendError::Internal("directory loop".to_string()))
                })?;
                let metadata = entry.metadata().map_err(|e| {
                    BackendError::Internal(format!("{}: {}", entry.path().display(), e))
                })?;
                let relative = entry
                    .path()
                    .strip_prefix(&path)
                    .map_err(|e| BackendError::Internal(e.to_string()))?;
                entries.push(FileMetaData {
                    surl: format!("{}/{}", base, relative.display()),
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    is_directory: metadata.is_dir(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
            Ok::<_, BackendError>(entries)
        })
        .await
        .map_err(|e| BackendError::Internal(format!("listing task failed: {}", e)))?
    }

    async fn copy(
        &self,
        _user: &SrmUser,
        source: &Surl,
        destination: &Surl,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        let from = self.existing_file(source).await?;
        let to = self.resolve(destination)?;
        if !overwrite && tokio::fs::try_exists(&to).await.unwrap_or(false) {
            return Err(BackendError::AlreadyExists(destination.to_string()));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(destination, e))?;
        }
        let bytes = tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| io_error(destination, e))?;
        debug!(source = %source, destination = %destination, bytes, "Copied file");
        Ok(())
    }

    async fn reserve_space(
        &self,
        user: &SrmUser,
        size: u64,
        _lifetime: Duration,
        description: Option<&str>,
    ) -> Result<SpaceReservation, BackendError> {
        let mut reservations = lock(&self.reservations);
        if let Some(capacity) = self.capacity {
            let reserved: u64 = reservations.values().sum();
            if reserved.saturating_add(size) > capacity {
                return Err(BackendError::NoSpace(format!(
                    "{} bytes requested, {} of {} reserved",
                    size, reserved, capacity
                )));
            }
        }
        let token = Uuid::new_v4().to_string();
        reservations.insert(token.clone(), size);
        info!(user = %user, token = %token, size, description = description.unwrap_or(""), "Reserved space");
        Ok(SpaceReservation { token, size })
    }

    async fn release_space(&self, _user: &SrmUser, token: &str) -> Result<(), BackendError> {
        lock(&self.reservations)
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| BackendError::InvalidPath(format!("no space reservation {}", token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surl(path: &str) -> Surl {
        Surl::parse(&format!("srm://localhost:8443{}", path)).unwrap()
    }

    fn user() -> SrmUser {
        SrmUser::new("tester")
    }

    #[tokio::test]
    async fn test_prepare_to_get() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.dat"), b"payload").unwrap();
        let storage = LocalStorage::new(dir.path());

        let turl = storage.prepare_to_get(&user(), &surl("/a.dat"), &[]).await.unwrap();
        assert!(turl.turl.starts_with("file://"));
        assert!(turl.turl.ends_with("a.dat"));

        let missing = storage.prepare_to_get(&user(), &surl("/b.dat"), &[]).await;
        assert!(matches!(missing, Err(BackendError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_put_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let target = surl("/new/dir/file");

        let turl = storage
            .prepare_to_put(&user(), &target, Some(4), false, &[])
            .await
            .unwrap();
        assert!(dir.path().join("new/dir").is_dir());

        let not_written = storage.put_done(&user(), &target, &turl.file_id).await;
        assert!(matches!(not_written, Err(BackendError::InvalidPath(_))));

        let turl = storage
            .prepare_to_put(&user(), &target, Some(4), false, &[])
            .await
            .unwrap();
        std::fs::write(dir.path().join("new/dir/file"), b"data").unwrap();
        storage.put_done(&user(), &target, &turl.file_id).await.unwrap();

        let exists = storage.prepare_to_put(&user(), &target, None, false, &[]).await;
        assert!(matches!(exists, Err(BackendError::AlreadyExists(_))));
        assert!(storage.prepare_to_put(&user(), &target, None, true, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_abort_put_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let target = surl("/partial");
        let turl = storage.prepare_to_put(&user(), &target, None, false, &[]).await.unwrap();
        std::fs::write(dir.path().join("partial"), b"half").unwrap();

        storage.abort_put(&user(), &target, &turl.file_id).await.unwrap();
        assert!(!dir.path().join("partial").exists());
    }

    #[test]
    fn test_resolve_rejects_parent_components() {
        let storage = LocalStorage::new("/srv/srm");
        assert!(matches!(
            storage.resolve(&surl("/../etc/passwd")),
            Err(BackendError::InvalidPath(_))
        ));
        assert_eq!(
            storage.resolve(&surl("/data/./f")).unwrap(),
            PathBuf::from("/srv/srm/data/f")
        );
    }

    #[tokio::test]
    async fn test_list_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        std::fs::write(dir.path().join("d/one"), b"1").unwrap();
        std::fs::write(dir.path().join("d/sub/two"), b"22").unwrap();
        let storage = LocalStorage::new(dir.path());

        let shallow = storage.list_directory(&user(), &surl("/d"), 1).await.unwrap();
        let names: Vec<_> = shallow.iter().map(|e| e.surl.as_str()).collect();
        assert_eq!(names, vec!["srm://localhost:8443/d/one", "srm://localhost:8443/d/sub"]);
        assert!(shallow[1].is_directory);

        let deep = storage.list_directory(&user(), &surl("/d"), 2).await.unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.iter().any(|e| e.surl.ends_with("/d/sub/two") && e.size == 2));

        let file = storage.list_directory(&user(), &surl("/d/one"), 1).await.unwrap();
        assert_eq!(file.len(), 1);
        assert!(!file[0].is_directory);
    }

    #[tokio::test]
    async fn test_copy_and_pin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src"), b"abc").unwrap();
        let storage = LocalStorage::new(dir.path());

        storage
            .copy(&user(), &surl("/src"), &surl("/out/dst"), false)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("out/dst")).unwrap(), b"abc");
        let again = storage.copy(&user(), &surl("/src"), &surl("/out/dst"), false).await;
        assert!(matches!(again, Err(BackendError::AlreadyExists(_))));

        let pin = storage
            .pin(&user(), &surl("/src"), Duration::from_secs(60))
            .await
            .unwrap();
        storage.unpin(&user(), &surl("/src"), &pin).await.unwrap();
        assert!(storage.unpin(&user(), &surl("/src"), &pin).await.is_err());
    }

    #[tokio::test]
    async fn test_reservation_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).with_capacity(100);

        let first = storage
            .reserve_space(&user(), 60, Duration::from_secs(60), Some("run"))
            .await
            .unwrap();
        let second = storage
            .reserve_space(&user(), 60, Duration::from_secs(60), None)
            .await;
        assert!(matches!(second, Err(BackendError::NoSpace(_))));

        storage.release_space(&user(), &first.token).await.unwrap();
        assert!(storage
            .reserve_space(&user(), 60, Duration::from_secs(60), None)
            .await
            .is_ok());
    }
}

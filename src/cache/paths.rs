//! Storage tier layout and file placement
//!
//! Two roots back the local store: the support directory for permanent files
//! and the cache directory for reclaimable ones. Stored files live under a
//! `resources/` subtree and are named `<resourceId>.<uuid>.<ext>`.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{FetchError, FetchResult};
use crate::resource::StoragePriority;

const RESOURCES_SUBDIR: &str = "resources";
const MAX_NAME_ATTEMPTS: u32 = 8;

/// Roots of the two storage tiers.
#[derive(Debug, Clone)]
pub struct StorageRoots {
    pub support_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl StorageRoots {
    pub fn new(support_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            support_dir: support_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn root_for(&self, storage: StoragePriority) -> &Path {
        match storage {
            StoragePriority::Permanent => &self.support_dir,
            StoragePriority::Cached => &self.cache_dir,
        }
    }

    /// The resources subtree of a tier.
    pub fn resources_dir(&self, storage: StoragePriority) -> PathBuf {
        self.root_for(storage).join(RESOURCES_SUBDIR)
    }

    /// Scratch space for in-flight transfers.
    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }
}

/// File extension taken from a mirror location's path, if any.
pub fn extension_for_location(location: &str) -> Option<String> {
    let parsed = url::Url::parse(location).ok()?;
    let last = parsed.path_segments()?.last()?.to_string();
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(ext.to_string())
}

/// Unique target path for a resource inside `resources_dir`.
///
/// The name embeds the resource id plus a random suffix; an exact collision
/// gets a counter appended, bounded at a handful of attempts.
pub fn unique_target_path(
    resources_dir: &Path,
    resource_id: &str,
    extension: Option<&str>,
) -> FetchResult<PathBuf> {
    let suffix = Uuid::new_v4();
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let mut name = if attempt == 0 {
            format!("{resource_id}.{suffix}")
        } else {
            format!("{resource_id}.{suffix}-{attempt}")
        };
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        let candidate = resources_dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(FetchError::CannotGenerateLocalPath(resource_id.to_string()))
}

/// Move `from` to `to` atomically, falling back to copy + remove when the
/// rename crosses filesystems. `to` must not exist.
pub async fn move_file(from: &Path, to: &Path) -> FetchResult<()> {
    if to.exists() {
        return Err(FetchError::FileAlreadyExists(to.to_path_buf()));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|_| FetchError::CannotCreateDirectory(parent.to_path_buf()))?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(
                "Rename {:?} -> {:?} failed ({}), copying instead",
                from,
                to,
                rename_err
            );
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| FetchError::CannotMoveFile {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                    reason: e.to_string(),
                })?;
            let _ = tokio::fs::remove_file(from).await;
            Ok(())
        }
    }
}

/// Mark a stored file as excluded from backups where the filesystem supports
/// extended attributes.
#[cfg(unix)]
pub fn exclude_from_backup(path: &Path) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let Ok(attr) = CString::new("user.fetchkit.no-backup") else {
        return;
    };
    let value = b"1";
    // best effort; not every filesystem carries xattrs
    unsafe {
        #[cfg(target_os = "macos")]
        libc::setxattr(
            c_path.as_ptr(),
            attr.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
            0,
        );
        #[cfg(not(target_os = "macos"))]
        libc::setxattr(
            c_path.as_ptr(),
            attr.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        );
    }
}

#[cfg(not(unix))]
pub fn exclude_from_backup(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_map_tiers() {
        let roots = StorageRoots::new("/support", "/cache");
        assert_eq!(
            roots.resources_dir(StoragePriority::Permanent),
            PathBuf::from("/support/resources")
        );
        assert_eq!(
            roots.resources_dir(StoragePriority::Cached),
            PathBuf::from("/cache/resources")
        );
    }

    #[test]
    fn test_extension_for_location() {
        assert_eq!(
            extension_for_location("http://host/files/image.png").as_deref(),
            Some("png")
        );
        assert_eq!(
            extension_for_location("https://host/a/b/archive.tar.gz").as_deref(),
            Some("gz")
        );
        assert_eq!(extension_for_location("http://host/files/noext"), None);
        assert_eq!(extension_for_location("not a url"), None);
    }

    #[test]
    fn test_unique_target_embeds_resource_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = unique_target_path(dir.path(), "r1", Some("png")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("r1."));
        assert!(name.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_move_file_rename() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.tmp");
        let to = dir.path().join("sub/b.bin");
        tokio::fs::write(&from, b"payload").await.unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_file_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.tmp");
        let to = dir.path().join("b.bin");
        tokio::fs::write(&from, b"new").await.unwrap();
        tokio::fs::write(&to, b"old").await.unwrap();

        assert!(matches!(
            move_file(&from, &to).await,
            Err(FetchError::FileAlreadyExists(_))
        ));
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"old");
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use flowrelay_contracts::protocol::MediaKind;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{flatten_error, RelayError};

/// SHA-256 over `kind || 0x00 || mime || 0x00 || bytes`. The mime type is
/// trimmed and lowercased first, so `Image/PNG` and `image/png` share an entry
/// while the same bytes sent as two different types do not.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(kind: MediaKind, mime_type: &str, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(mime_type.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaCacheEntry {
    pub content_hash: ContentHash,
    pub remote_uri: String,
    pub remote_handle: RemoteHandle,
    pub media_kind: MediaKind,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Remote file store the cache uploads into.
pub trait UploadApi: Send + Sync {
    fn upload(&self, bytes: &[u8], mime_type: &str, display_name: &str) -> Result<RemoteHandle>;
    /// Cheap existence check; any error means the handle is stale.
    fn resolve(&self, handle: &RemoteHandle) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(RemoteHandle),
    Stale(MediaCacheEntry),
    Miss,
}

/// Process-wide upload dedup keyed by [`ContentHash`].
///
/// The entry map lock is held across the whole check-then-upload sequence, so
/// concurrent requests for the same bytes wait for the first upload instead of
/// racing it.
pub struct MediaUploadCache {
    uploader: Arc<dyn UploadApi>,
    entries: Mutex<HashMap<ContentHash, MediaCacheEntry>>,
}

impl MediaUploadCache {
    pub fn new(uploader: Arc<dyn UploadApi>) -> Self {
        Self {
            uploader,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_upload(
        &self,
        bytes: &[u8],
        kind: MediaKind,
        mime_type: &str,
    ) -> Result<RemoteHandle, RelayError> {
        let hash = ContentHash::compute(kind, mime_type, bytes);
        let mut entries = self.lock();

        match self.lookup(&mut entries, &hash) {
            Lookup::Fresh(handle) => {
                debug!(content_hash = %hash.short(), handle = %handle.name, "media cache hit");
                return Ok(handle);
            }
            Lookup::Stale(entry) => {
                info!(
                    content_hash = %hash.short(),
                    handle = %entry.remote_handle.name,
                    "evicted stale media upload"
                );
            }
            Lookup::Miss => {}
        }

        let display_name = format!("{kind}-{}", hash.short());
        let handle = self
            .uploader
            .upload(bytes, mime_type, &display_name)
            .map_err(|err| RelayError::Upload(flatten_error(&err, 512)))?;
        info!(
            content_hash = %hash.short(),
            handle = %handle.name,
            bytes = bytes.len(),
            "uploaded media"
        );
        entries.insert(
            hash,
            MediaCacheEntry {
                content_hash: hash,
                remote_uri: handle.uri.clone(),
                remote_handle: handle.clone(),
                media_kind: kind,
                mime_type: mime_type.to_string(),
                uploaded_at: Utc::now(),
            },
        );
        Ok(handle)
    }

    /// Resolves a cached entry against the remote store. A stale entry is
    /// removed before this returns.
    fn lookup(
        &self,
        entries: &mut HashMap<ContentHash, MediaCacheEntry>,
        hash: &ContentHash,
    ) -> Lookup {
        let Some(entry) = entries.get(hash) else {
            return Lookup::Miss;
        };
        match self.check_handle(entry) {
            Ok(()) => Lookup::Fresh(entry.remote_handle.clone()),
            Err(err) => {
                warn!(content_hash = %hash.short(), reason = %err, "cached media handle is stale");
                entries.remove(hash).map(Lookup::Stale).unwrap_or(Lookup::Miss)
            }
        }
    }

    fn check_handle(&self, entry: &MediaCacheEntry) -> Result<(), RelayError> {
        self.uploader
            .resolve(&entry.remote_handle)
            .map_err(|err| RelayError::StaleHandle {
                handle: entry.remote_handle.name.clone(),
                reason: flatten_error(&err, 256),
            })
    }

    /// Drops every entry without touching the remote store.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, kind: MediaKind, mime_type: &str, bytes: &[u8]) -> bool {
        self.lock()
            .contains_key(&ContentHash::compute(kind, mime_type, bytes))
    }

    pub fn entries(&self) -> Vec<MediaCacheEntry> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContentHash, MediaCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use anyhow::{bail, Result};
    use flowrelay_contracts::protocol::MediaKind;

    use super::{ContentHash, MediaUploadCache, RemoteHandle, UploadApi};
    use crate::error::RelayError;

    #[derive(Default)]
    pub(crate) struct FakeUploads {
        pub uploads: AtomicUsize,
        pub resolves: AtomicUsize,
        pub expired: Mutex<HashSet<String>>,
        pub fail_uploads: bool,
        pub panic_on: Option<&'static [u8]>,
    }

    impl FakeUploads {
        pub(crate) fn expire(&self, name: &str) {
            if let Ok(mut expired) = self.expired.lock() {
                expired.insert(name.to_string());
            }
        }
    }

    impl UploadApi for FakeUploads {
        fn upload(
            &self,
            bytes: &[u8],
            mime_type: &str,
            display_name: &str,
        ) -> Result<RemoteHandle> {
            if self.panic_on == Some(bytes) {
                panic!("upload client blew up");
            }
            if self.fail_uploads {
                bail!("quota exceeded");
            }
            let idx = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteHandle {
                name: format!("files/{display_name}-{idx}"),
                uri: format!("https://files.test/{display_name}-{idx}"),
                mime_type: mime_type.to_string(),
            })
        }

        fn resolve(&self, handle: &RemoteHandle) -> Result<()> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            let expired = self
                .expired
                .lock()
                .map(|set| set.contains(&handle.name))
                .unwrap_or(false);
            if expired {
                bail!("404 file not found");
            }
            Ok(())
        }
    }

    #[test]
    fn identical_bytes_upload_once() -> anyhow::Result<()> {
        let fake = Arc::new(FakeUploads::default());
        let cache = MediaUploadCache::new(fake.clone());

        let first = cache.get_or_upload(b"wav-bytes", MediaKind::Audio, "audio/webm")?;
        let second = cache.get_or_upload(b"wav-bytes", MediaKind::Audio, "audio/webm")?;

        assert_eq!(first, second);
        assert_eq!(fake.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(fake.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn clear_forces_fresh_upload() -> anyhow::Result<()> {
        let fake = Arc::new(FakeUploads::default());
        let cache = MediaUploadCache::new(fake.clone());

        let first = cache.get_or_upload(b"png", MediaKind::Image, "image/png")?;
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
        let second = cache.get_or_upload(b"png", MediaKind::Image, "image/png")?;

        assert_ne!(first, second);
        assert_eq!(fake.uploads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn stale_handle_is_evicted_and_reuploaded() -> anyhow::Result<()> {
        let fake = Arc::new(FakeUploads::default());
        let cache = MediaUploadCache::new(fake.clone());

        let first = cache.get_or_upload(b"png", MediaKind::Image, "image/png")?;
        fake.expire(&first.name);
        let second = cache.get_or_upload(b"png", MediaKind::Image, "image/png")?;

        assert_ne!(first.name, second.name);
        assert_eq!(fake.uploads.load(Ordering::SeqCst), 2);
        let entries = cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remote_handle, second);
        assert_eq!(entries[0].remote_uri, second.uri);
        Ok(())
    }

    #[test]
    fn media_kind_is_part_of_the_key() -> anyhow::Result<()> {
        assert_ne!(
            ContentHash::compute(MediaKind::Audio, "application/octet-stream", b"same"),
            ContentHash::compute(MediaKind::Image, "application/octet-stream", b"same")
        );
        let fake = Arc::new(FakeUploads::default());
        let cache = MediaUploadCache::new(fake.clone());
        cache.get_or_upload(b"same", MediaKind::Audio, "audio/webm")?;
        cache.get_or_upload(b"same", MediaKind::Image, "image/png")?;
        assert_eq!(fake.uploads.load(Ordering::SeqCst), 2);
        assert!(cache.contains(MediaKind::Audio, "audio/webm", b"same"));
        assert!(cache.contains(MediaKind::Image, "image/png", b"same"));
        Ok(())
    }

    #[test]
    fn mime_type_is_part_of_the_key() -> anyhow::Result<()> {
        let fake = Arc::new(FakeUploads::default());
        let cache = MediaUploadCache::new(fake.clone());

        let png = cache.get_or_upload(b"pixels", MediaKind::Image, "image/png")?;
        let jpeg = cache.get_or_upload(b"pixels", MediaKind::Image, "image/jpeg")?;
        let png_again = cache.get_or_upload(b"pixels", MediaKind::Image, " Image/PNG ")?;

        assert_eq!(fake.uploads.load(Ordering::SeqCst), 2);
        assert_ne!(png.name, jpeg.name);
        assert_eq!(png.mime_type, "image/png");
        assert_eq!(jpeg.mime_type, "image/jpeg");
        assert_eq!(png_again, png);
        assert_eq!(cache.len(), 2);
        Ok(())
    }

    #[test]
    fn cache_keeps_working_after_an_upload_panics() -> anyhow::Result<()> {
        let fake = Arc::new(FakeUploads {
            panic_on: Some(&b"boom"[..]),
            ..FakeUploads::default()
        });
        let cache = Arc::new(MediaUploadCache::new(fake.clone()));
        let kept = cache.get_or_upload(b"kept", MediaKind::Audio, "audio/webm")?;

        let panicking = Arc::clone(&cache);
        let joined = thread::spawn(move || {
            let _ = panicking.get_or_upload(b"boom", MediaKind::Audio, "audio/webm");
        })
        .join();
        assert!(joined.is_err());
        assert!(cache.entries.is_poisoned());

        assert_eq!(cache.get_or_upload(b"kept", MediaKind::Audio, "audio/webm")?, kept);
        assert!(!cache.contains(MediaKind::Audio, "audio/webm", b"boom"));
        let fresh = cache.get_or_upload(b"fresh", MediaKind::Image, "image/png")?;
        assert_eq!(cache.len(), 2);
        assert_ne!(fresh.name, kept.name);
        assert_eq!(fake.uploads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn failed_upload_leaves_no_entry() {
        let fake = Arc::new(FakeUploads {
            fail_uploads: true,
            ..FakeUploads::default()
        });
        let cache = MediaUploadCache::new(fake);
        let err = cache.get_or_upload(b"x", MediaKind::Image, "image/png");
        assert!(matches!(err, Err(RelayError::Upload(message)) if message.contains("quota exceeded")));
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_callers_converge_on_one_upload() {
        let fake = Arc::new(FakeUploads::default());
        let cache = Arc::new(MediaUploadCache::new(fake.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache
                        .get_or_upload(b"shared", MediaKind::Audio, "audio/webm")
                        .map(|handle| handle.name)
                        .ok()
                })
            })
            .collect();
        let names: HashSet<Option<String>> = handles
            .into_iter()
            .map(|handle| handle.join().ok().flatten())
            .collect();

        assert_eq!(names.len(), 1);
        assert!(names.iter().all(Option::is_some));
        assert_eq!(fake.uploads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hash_hex_is_stable() {
        let hash = ContentHash::compute(MediaKind::Image, "image/png", b"abc");
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(hash.to_hex(), hash.to_string());
        assert!(hash.to_hex().starts_with(&hash.short()));
    }
}

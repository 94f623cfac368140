//! Playlists and the shared audio-file cache behind them.
//!
//! Every playlist entry is an [`AudioFileHandle`] acquired from one [`AudioFileCache`], so the
//! same path in several playlists shares one [`AudioFile`]. The file object lives exactly as
//! long as some handle to it does.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::audio_file::AudioFile;
use crate::component::ComponentId;
use crate::playback::PlaybackController;
use crate::sync::lock;

struct CacheEntry {
    file: Arc<AudioFile>,
    refs: usize,
}

/// Reference-counted map from path to [`AudioFile`].
#[derive(Default)]
pub struct AudioFileCache {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl AudioFileCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a reference to `path`, creating the file object on first use.
    pub fn acquire(self: &Arc<Self>, path: impl AsRef<Path>) -> AudioFileHandle {
        let path = path.as_ref();
        let mut entries = lock(&self.entries);
        let entry = entries.entry(path.to_path_buf()).or_insert_with(|| {
            tracing::trace!(path = ?path, "audio file created");
            CacheEntry {
                file: Arc::new(AudioFile::new(path.to_path_buf())),
                refs: 0,
            }
        });
        entry.refs += 1;
        AudioFileHandle {
            cache: self.clone(),
            file: entry.file.clone(),
        }
    }

    fn release(&self, path: &Path) {
        let removed = {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.get_mut(path) else {
                tracing::error!(path = ?path, "release of an audio file that is not cached");
                debug_assert!(false, "audio file released more often than acquired");
                return;
            };
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(path)
            } else {
                None
            }
        };
        if removed.is_some() {
            tracing::trace!(path = ?path, "audio file destroyed");
        }
    }

    /// Files currently cached.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ref_count(&self, path: impl AsRef<Path>) -> usize {
        lock(&self.entries)
            .get(path.as_ref())
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    /// Release the private decoder state `owner` left on any cached file.
    pub fn cleanup_private_data(&self, owner: ComponentId) -> usize {
        let entries = lock(&self.entries);
        let released = entries
            .values()
            .filter(|e| e.file.release_private_data(owner))
            .count();
        if released > 0 {
            tracing::debug!(%owner, released, "released private audio-file data");
        }
        released
    }
}

/// Counted reference to a cached [`AudioFile`]. Cloning acquires another reference.
pub struct AudioFileHandle {
    cache: Arc<AudioFileCache>,
    file: Arc<AudioFile>,
}

impl AudioFileHandle {
    pub fn file(&self) -> &Arc<AudioFile> {
        &self.file
    }
}

impl Deref for AudioFileHandle {
    type Target = AudioFile;

    fn deref(&self) -> &AudioFile {
        &self.file
    }
}

impl Clone for AudioFileHandle {
    fn clone(&self) -> Self {
        self.cache.acquire(self.file.path())
    }
}

impl Drop for AudioFileHandle {
    fn drop(&mut self) {
        self.cache.release(self.file.path());
    }
}

impl std::fmt::Debug for AudioFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AudioFileHandle").field(&self.file.path()).finish()
    }
}

/// Receives mutations of the playing playlist while its member lock is held.
pub trait PlaylistObserver: Send + Sync {
    fn on_insert(&self, pos: usize, len_after: usize);
    fn on_erase(&self, pos: usize, len_after: usize);
    fn on_clear(&self);
}

/// Identifies a playlist for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlaylistId(u64);

/// Ordered list of audio files.
pub struct Playlist {
    id: PlaylistId,
    name: Mutex<String>,
    members: Mutex<Vec<AudioFileHandle>>,
    observer: Mutex<Option<Weak<dyn PlaylistObserver>>>,
    cache: Arc<AudioFileCache>,
}

impl Playlist {
    pub fn new(cache: Arc<AudioFileCache>, name: impl Into<String>) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: PlaylistId(NEXT.fetch_add(1, Ordering::Relaxed)),
            name: Mutex::new(name.into()),
            members: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            cache,
        })
    }

    pub fn id(&self) -> PlaylistId {
        self.id
    }

    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *lock(&self.name) = name.into();
    }

    /// Make this the playing playlist of `controller`.
    pub fn activate(self: &Arc<Self>, controller: &PlaybackController) {
        controller.set_playlist(Some(self.clone()));
    }

    pub(crate) fn set_observer(&self, observer: Option<Weak<dyn PlaylistObserver>>) {
        *lock(&self.observer) = observer;
    }

    fn observer(&self) -> Option<Arc<dyn PlaylistObserver>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    /// Member lock; the fill loop reads entries through this.
    pub(crate) fn members(&self) -> MutexGuard<'_, Vec<AudioFileHandle>> {
        lock(&self.members)
    }

    pub fn add(&self, path: impl AsRef<Path>) {
        self.insert(usize::MAX, path);
    }

    /// Insert at `pos` (clamped to the end). Returns the index used.
    pub fn insert(&self, pos: usize, path: impl AsRef<Path>) -> usize {
        let handle = self.cache.acquire(path);
        let mut members = self.members();
        let pos = pos.min(members.len());
        members.insert(pos, handle);
        if let Some(observer) = self.observer() {
            observer.on_insert(pos, members.len());
        }
        pos
    }

    /// Remove the entry at `pos`. Out-of-range positions are ignored.
    pub fn erase(&self, pos: usize) -> bool {
        let removed = {
            let mut members = self.members();
            if pos >= members.len() {
                return false;
            }
            let removed = members.remove(pos);
            if let Some(observer) = self.observer() {
                observer.on_erase(pos, members.len());
            }
            removed
        };
        drop(removed);
        true
    }

    pub fn clear(&self) {
        let removed = {
            let mut members = self.members();
            let removed = std::mem::take(&mut *members);
            if let Some(observer) = self.observer() {
                observer.on_clear();
            }
            removed
        };
        drop(removed);
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<AudioFileHandle> {
        self.members().get(index).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.members()
            .iter()
            .map(|h| h.path().to_path_buf())
            .collect()
    }
}

impl Drop for Playlist {
    fn drop(&mut self) {
        tracing::trace!(playlist = self.id.0, "playlist dropped");
    }
}

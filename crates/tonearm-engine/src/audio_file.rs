//! One decodable file path plus the state cached about it.

use std::any::Any;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tonearm_types::AudioTags;

use crate::component::{ComponentId, StreamInput};
use crate::sync::lock;

struct PrivateData {
    owner: ComponentId,
    data: Box<dyn Any + Send>,
}

/// A file known to the engine.
///
/// The OS handle is opened on first use. Total frames and tags are computed once through the
/// stream input that asks first. The private slot holds per-file decoder state for exactly one
/// stream input at a time.
pub struct AudioFile {
    path: PathBuf,
    handle: Mutex<Option<File>>,
    total_frames: Mutex<Option<u64>>,
    tags: Mutex<Option<AudioTags>>,
    private: Mutex<Option<PrivateData>>,
}

impl AudioFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            handle: Mutex::new(None),
            total_frames: Mutex::new(None),
            tags: Mutex::new(None),
            private: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with the open file, opening it first if needed.
    pub fn with_handle<R>(&self, f: impl FnOnce(&mut File) -> std::io::Result<R>) -> Result<R> {
        let mut handle = lock(&self.handle);
        let file = match handle.take() {
            Some(file) => file,
            None => File::open(&self.path)
                .with_context(|| format!("open audio file {:?}", self.path))?,
        };
        let file = handle.insert(file);
        f(file).with_context(|| format!("read audio file {:?}", self.path))
    }

    /// Close the OS handle; the next [`with_handle`](Self::with_handle) reopens it.
    pub fn close_handle(&self) {
        lock(&self.handle).take();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.handle).is_some()
    }

    /// Total frames, computed by `input` on first call.
    pub fn total_frames(&self, input: &mut dyn StreamInput) -> Result<u64> {
        if let Some(total) = *lock(&self.total_frames) {
            return Ok(total);
        }
        let total = input.calc_total_frames(self)?;
        *lock(&self.total_frames) = Some(total);
        Ok(total)
    }

    pub fn cached_total_frames(&self) -> Option<u64> {
        *lock(&self.total_frames)
    }

    /// Tag map, read by `input` on first call.
    pub fn tags(&self, input: &mut dyn StreamInput) -> Result<AudioTags> {
        if let Some(tags) = lock(&self.tags).as_ref() {
            return Ok(tags.clone());
        }
        let tags = input.read_tags(self)?;
        *lock(&self.tags) = Some(tags.clone());
        Ok(tags)
    }

    /// Store private data for `owner`, releasing whatever was stored before (by any owner).
    pub fn set_private_data(&self, owner: ComponentId, data: Box<dyn Any + Send>) {
        let previous = lock(&self.private).replace(PrivateData { owner, data });
        if let Some(previous) = previous
            && previous.owner != owner
        {
            tracing::debug!(
                path = ?self.path,
                previous = %previous.owner,
                %owner,
                "private data ownership transferred"
            );
        }
    }

    /// Borrow the private data if `owner` stored it and it has type `T`.
    pub fn with_private_data<T: 'static, R>(
        &self,
        owner: ComponentId,
        f: impl FnOnce(Option<&mut T>) -> R,
    ) -> R {
        let mut slot = lock(&self.private);
        let data = slot
            .as_mut()
            .filter(|p| p.owner == owner)
            .and_then(|p| p.data.downcast_mut::<T>());
        f(data)
    }

    pub fn private_data_owner(&self) -> Option<ComponentId> {
        lock(&self.private).as_ref().map(|p| p.owner)
    }

    /// Drop the private data if `owner` holds it.
    pub fn release_private_data(&self, owner: ComponentId) -> bool {
        let released = {
            let mut slot = lock(&self.private);
            match slot.as_ref() {
                Some(p) if p.owner == owner => slot.take(),
                _ => None,
            }
        };
        released.is_some()
    }
}

impl std::fmt::Debug for AudioFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFile").field("path", &self.path).finish()
    }
}

//! Reference-counted store of decoded sample and MIDI content.
//!
//! Every live handle holds a strong reference; the cache itself only keeps
//! weak ones. When the last handle goes away the entry is erased and the
//! decoded buffers are freed. Handles are never dropped on the real-time
//! thread: the engine reads them through snapshots that are reclaimed on the
//! control thread.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{DecodedAudio, decode_file, resample_planes};

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset unavailable '{path}': {source}")]
    Unavailable {
        path: PathBuf,
        source: anyhow::Error,
    },
}

/// Samples are keyed by canonical path. MIDI buffers are bucketed by a hash
/// of their notes and told apart by comparing the notes themselves.
#[derive(Default)]
struct CacheInner {
    target_sample_rate: Option<u32>,
    samples: Mutex<HashMap<PathBuf, Weak<SampleData>>>,
    midi: Mutex<HashMap<u64, Vec<Weak<MidiData>>>>,
}

impl CacheInner {
    fn evict_sample(&self, key: &Path) {
        let mut samples = self.samples.lock();
        if samples.get(key).is_some_and(|w| w.strong_count() == 0) {
            samples.remove(key);
        }
    }

    fn evict_midi(&self, key: u64) {
        let mut midi = self.midi.lock();
        if let Some(bucket) = midi.get_mut(&key) {
            bucket.retain(|w| w.strong_count() > 0);
            if bucket.is_empty() {
                midi.remove(&key);
            }
        }
    }
}

/// Shared cache of decoded assets. Cloning the cache is cheap and every clone
/// sees the same entries.
#[derive(Clone, Default)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that resamples every decoded file to `sample_rate` at load time.
    pub fn with_target_sample_rate(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                target_sample_rate: Some(sample_rate),
                ..Default::default()
            }),
        }
    }

    pub fn target_sample_rate(&self) -> Option<u32> {
        self.inner.target_sample_rate
    }

    /// Return the cached asset for `path`, decoding it on a miss.
    ///
    /// Decoding is slow and allocates; call this from the control thread or a
    /// deferred job, never from the audio callback.
    pub fn load(&self, path: &Path) -> Result<SampleAsset, AssetError> {
        let key = cache_key(path);

        if let Some(asset) = self.lookup(&key) {
            debug!(path = %path.display(), refs = asset.ref_count(), "asset cache hit");
            return Ok(asset);
        }

        let decoded = decode_file(path)
            .and_then(|audio| self.conform(audio))
            .map_err(|source| {
                warn!(path = %path.display(), "asset unavailable: {source:#}");
                AssetError::Unavailable {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        Ok(self.insert_decoded(key, path, decoded))
    }

    /// Decode several files in parallel. Results keep the order of `paths`.
    pub fn preload(&self, paths: &[PathBuf]) -> Vec<Result<SampleAsset, AssetError>> {
        let results: Vec<_> = paths.par_iter().map(|path| self.load(path)).collect();
        let loaded = results.iter().filter(|r| r.is_ok()).count();
        info!(requested = paths.len(), loaded, "preloaded assets");
        results
    }

    /// Register already decoded audio under `path`, e.g. a freshly recorded take.
    pub fn insert(&self, path: &Path, audio: DecodedAudio) -> anyhow::Result<SampleAsset> {
        let audio = self.conform(audio)?;
        Ok(self.insert_decoded(cache_key(path), path, audio))
    }

    /// Drop one reference. The entry is erased when no clip refers to it any more.
    pub fn release(&self, asset: SampleAsset) {
        debug!(path = %asset.path().display(), refs = asset.ref_count() - 1, "asset released");
        drop(asset);
    }

    /// Intern a MIDI note buffer. Identical note content shares one asset.
    pub fn insert_midi(&self, name: &str, mut notes: Vec<MidiNote>) -> MidiAsset {
        notes.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.intern_midi(midi_hash(&notes), name, notes)
    }

    fn intern_midi(&self, key: u64, name: &str, notes: Vec<MidiNote>) -> MidiAsset {
        let mut midi = self.inner.midi.lock();
        let bucket = midi.entry(key).or_default();
        // Dropping the last handle evicts, which takes this lock again, so
        // upgraded handles are only released after unlocking.
        let live: Vec<Arc<MidiData>> = bucket.iter().filter_map(Weak::upgrade).collect();
        let asset = match live.iter().find(|data| data.notes == notes) {
            Some(existing) => MidiAsset(existing.clone()),
            None => {
                let data = Arc::new(MidiData {
                    key,
                    name: name.to_string(),
                    notes,
                    cache: Arc::downgrade(&self.inner),
                });
                bucket.push(Arc::downgrade(&data));
                MidiAsset(data)
            }
        };
        drop(midi);
        drop(live);
        asset
    }

    pub fn release_midi(&self, asset: MidiAsset) {
        drop(asset);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lookup(&cache_key(path)).is_some()
    }

    /// Number of live sample entries.
    pub fn len(&self) -> usize {
        self.inner
            .samples
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn midi_len(&self) -> usize {
        self.inner
            .midi
            .lock()
            .values()
            .flatten()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn lookup(&self, key: &Path) -> Option<SampleAsset> {
        self.inner
            .samples
            .lock()
            .get(key)
            .and_then(Weak::upgrade)
            .map(SampleAsset)
    }

    fn conform(&self, mut audio: DecodedAudio) -> anyhow::Result<DecodedAudio> {
        if let Some(target) = self.inner.target_sample_rate
            && target != audio.sample_rate
        {
            audio.planes = resample_planes(&audio.planes, audio.sample_rate, target)?;
            audio.sample_rate = target;
        }
        Ok(audio)
    }

    fn insert_decoded(&self, key: PathBuf, path: &Path, audio: DecodedAudio) -> SampleAsset {
        let data = Arc::new(SampleData {
            key: key.clone(),
            path: path.to_path_buf(),
            sample_rate: audio.sample_rate,
            frames: audio.frames(),
            planes: audio.planes,
            cache: Arc::downgrade(&self.inner),
        });

        let mut samples = self.inner.samples.lock();
        // Another thread may have decoded the same file while we were busy.
        if let Some(existing) = samples.get(&key).and_then(Weak::upgrade) {
            drop(samples);
            return SampleAsset(existing);
        }
        samples.insert(key, Arc::downgrade(&data));
        SampleAsset(data)
    }
}

/// Different spellings of the same file share an entry.
fn cache_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn midi_hash(notes: &[MidiNote]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for note in notes {
        note.pitch.hash(&mut hasher);
        note.velocity.hash(&mut hasher);
        note.start.to_bits().hash(&mut hasher);
        note.length.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

struct SampleData {
    key: PathBuf,
    path: PathBuf,
    sample_rate: u32,
    frames: usize,
    planes: Vec<Vec<f32>>,
    cache: Weak<CacheInner>,
}

impl Drop for SampleData {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.evict_sample(&self.key);
        }
    }
}

/// Handle to immutable decoded audio. Clone to add a reference.
#[derive(Clone)]
pub struct SampleAsset(Arc<SampleData>);

impl SampleAsset {
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.0.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.0.planes.len()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.0.frames
    }

    /// Samples of one channel. Out-of-range channels read as an empty slice.
    #[inline]
    pub fn plane(&self, channel: usize) -> &[f32] {
        self.0.planes.get(channel).map_or(&[], Vec::as_slice)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.0.sample_rate == 0 {
            return 0.0;
        }
        self.0.frames as f64 / self.0.sample_rate as f64
    }

    /// Number of live handles to this asset.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &SampleAsset) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for SampleAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleAsset")
            .field("path", &self.0.path)
            .field("frames", &self.0.frames)
            .field("sample_rate", &self.0.sample_rate)
            .field("channels", &self.0.planes.len())
            .finish()
    }
}

/// One note, positioned in beats relative to the start of its buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiNote {
    pub pitch: u8,
    pub velocity: u8,
    pub start: f64,
    pub length: f64,
}

impl MidiNote {
    pub fn end(&self) -> f64 {
        self.start + self.length
    }
}

struct MidiData {
    key: u64,
    name: String,
    notes: Vec<MidiNote>,
    cache: Weak<CacheInner>,
}

impl Drop for MidiData {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.evict_midi(self.key);
        }
    }
}

/// Handle to an immutable note buffer, sorted by note start.
#[derive(Clone)]
pub struct MidiAsset(Arc<MidiData>);

impl MidiAsset {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn notes(&self) -> &[MidiNote] {
        &self.0.notes
    }

    /// Length in beats up to the end of the last sounding note.
    pub fn length_beats(&self) -> f64 {
        self.0.notes.iter().map(MidiNote::end).fold(0.0, f64::max)
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &MidiAsset) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for MidiAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiAsset")
            .field("name", &self.0.name)
            .field("notes", &self.0.notes.len())
            .finish()
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use daw_decode::{MidiAsset, SampleAsset};

/// Flags shared between a clip and every engine snapshot of it, so the audio
/// thread sees (de)activation without waiting for the next snapshot.
#[derive(Debug)]
struct ClipFlags {
    active: AtomicBool,
    content_changed: AtomicBool,
}

impl Default for ClipFlags {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(true),
            content_changed: AtomicBool::new(true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioClip {
    /// `None` when the source could not be decoded; the clip renders silent.
    pub asset: Option<SampleAsset>,
    pub source: PathBuf,
    pub gain: f32,
    /// Fade lengths in beats.
    pub fade_in: f64,
    pub fade_out: f64,
}

#[derive(Debug, Clone)]
pub struct MidiClip {
    pub notes: MidiAsset,
}

#[derive(Debug, Clone)]
pub enum ClipContent {
    Audio(AudioClip),
    Midi(MidiClip),
}

/// A placement of audio or MIDI content on a track, spanning
/// `[min_time, max_time)` in beats.
///
/// Cloning shares the activity flags with the original; use
/// [`Clip::duplicate`] for an independent copy.
#[derive(Debug, Clone)]
pub struct Clip {
    /// Position within the owning track. Reassigned whenever the track reorders.
    pub id: usize,
    pub name: String,
    pub color: u32,
    pub min_time: f64,
    pub max_time: f64,
    /// Where playback starts inside the content: beats for MIDI, source
    /// frames for audio.
    pub start_offset: f64,
    pub content: ClipContent,
    flags: Arc<ClipFlags>,
}

impl Clip {
    fn with_content(name: impl Into<String>, min_time: f64, max_time: f64, content: ClipContent) -> Self {
        Self {
            id: 0,
            name: name.into(),
            color: 0x5b8def,
            min_time,
            max_time,
            start_offset: 0.0,
            content,
            flags: Arc::default(),
        }
    }

    /// An audio clip spanning the whole asset at the given tempo.
    pub fn audio(name: impl Into<String>, asset: SampleAsset, min_time: f64, beat_duration: f64) -> Self {
        let length = asset.duration_secs() / beat_duration;
        let source = asset.path().to_path_buf();
        Self::with_content(
            name,
            min_time,
            min_time + length,
            ClipContent::Audio(AudioClip {
                asset: Some(asset),
                source,
                gain: 1.0,
                fade_in: 0.0,
                fade_out: 0.0,
            }),
        )
    }

    /// An audio clip whose source is missing. It keeps its place on the
    /// timeline and plays silence.
    pub fn unavailable(name: impl Into<String>, source: PathBuf, min_time: f64, max_time: f64) -> Self {
        Self::with_content(
            name,
            min_time,
            max_time,
            ClipContent::Audio(AudioClip {
                asset: None,
                source,
                gain: 1.0,
                fade_in: 0.0,
                fade_out: 0.0,
            }),
        )
    }

    pub fn midi(name: impl Into<String>, notes: MidiAsset, min_time: f64, max_time: f64) -> Self {
        Self::with_content(name, min_time, max_time, ClipContent::Midi(MidiClip { notes }))
    }

    /// Copy with its own activity flags.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.flags = Arc::new(ClipFlags {
            active: AtomicBool::new(self.is_active()),
            content_changed: AtomicBool::new(true),
        });
        copy
    }

    #[inline]
    pub fn length(&self) -> f64 {
        self.max_time - self.min_time
    }

    #[inline]
    pub fn overlaps(&self, other: &Clip) -> bool {
        self.min_time < other.max_time && other.min_time < self.max_time
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags.active.load(Ordering::Relaxed)
    }

    /// Safe to call on a clip the audio thread is reading.
    pub fn set_active(&self, active: bool) {
        self.flags.active.store(active, Ordering::Relaxed);
    }

    pub fn mark_content_changed(&self) {
        self.flags.content_changed.store(true, Ordering::Release);
    }

    /// Consume the "content changed" flag. Used by the display layer.
    pub fn take_content_changed(&self) -> bool {
        self.flags.content_changed.swap(false, Ordering::AcqRel)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.content, ClipContent::Audio(_))
    }

    pub fn is_midi(&self) -> bool {
        matches!(self.content, ClipContent::Midi(_))
    }

    /// How many `start_offset` units one beat of timeline covers.
    pub fn content_units_per_beat(&self, beat_duration: f64) -> f64 {
        match &self.content {
            ClipContent::Audio(audio) => audio
                .asset
                .as_ref()
                .map_or(0.0, |a| beat_duration * a.sample_rate() as f64),
            ClipContent::Midi(_) => 1.0,
        }
    }

    /// Move the left edge right to `new_min`, keeping the content in place.
    pub(crate) fn trim_start_to(&mut self, new_min: f64, beat_duration: f64) {
        let delta = new_min - self.min_time;
        self.min_time = new_min;
        self.start_offset += delta * self.content_units_per_beat(beat_duration);
        self.mark_content_changed();
    }
}

/// Clips compare by value: placement, metadata and the identity of their
/// content. Position ids and activity flags are ignored.
impl PartialEq for Clip {
    fn eq(&self, other: &Self) -> bool {
        let content_eq = match (&self.content, &other.content) {
            (ClipContent::Audio(a), ClipContent::Audio(b)) => {
                let same_asset = match (&a.asset, &b.asset) {
                    (Some(x), Some(y)) => x.ptr_eq(y),
                    (None, None) => true,
                    _ => false,
                };
                same_asset
                    && a.source == b.source
                    && a.gain == b.gain
                    && a.fade_in == b.fade_in
                    && a.fade_out == b.fade_out
            }
            (ClipContent::Midi(a), ClipContent::Midi(b)) => a.notes.ptr_eq(&b.notes),
            _ => false,
        };
        content_eq
            && self.name == other.name
            && self.color == other.color
            && self.min_time == other.min_time
            && self.max_time == other.max_time
            && self.start_offset == other.start_offset
    }
}

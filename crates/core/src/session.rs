use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use daw_decode::{AssetCache, AssetError, MidiNote, SampleAsset};
use daw_engine::{
    AudioBackend, AudioBridge, BridgeError, Clock, CpalBackend, DeviceInfo, EngineHandle, EngineShared, NullBackend,
    RecordedTake, StreamFormat, TransportError, TransportState,
};
use daw_jobs::{DeferredJobQueue, JobHandle};
use daw_transport::{Clip, ClipContent, ClipKey, Track, TrackId};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::history::{Change, Command, CommandHistory, CommandKind};
use crate::time::{MusicalPosition, TimeContext, TimeSignature};

#[derive(Debug, Error)]
pub enum EditError {
    #[error("no such track: {0}")]
    NoTrack(TrackId),
    #[error("{track} has no clip at index {index}")]
    NoClip { track: TrackId, index: usize },
    #[error("clip would have no length")]
    EmptyClip,
    #[error("{track} clip {index} is not an audio clip")]
    NotAudio { track: TrackId, index: usize },
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// A clip addressed by position. Positions change whenever a track is
/// reordered, so refs must be re-resolved after every edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipRef {
    pub track: TrackId,
    pub index: usize,
}

impl ClipRef {
    pub fn new(track: TrackId, index: usize) -> Self {
        Self { track, index }
    }
}

/// What changed on the engine side since the last [`Session::poll`].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SessionEvents {
    pub playhead: Option<f64>,
    pub clips_deleted: bool,
    pub dropped_record_frames: u64,
    /// The audio device failed. The stream has been closed and the
    /// transport stopped; a take in progress was kept.
    pub device_failed: bool,
}

fn clip_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip".to_string())
}

/// Everything mutated under the edit lock.
struct EditState {
    tracks: Vec<Track>,
    history: CommandHistory,
    engine: EngineHandle,
    next_track_id: u64,
    min_clip_length: f64,
}

impl EditState {
    fn beat_duration(&self) -> f64 {
        self.engine.shared().beat_duration()
    }

    fn track_index(&self, id: TrackId) -> Result<usize, EditError> {
        self.tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or(EditError::NoTrack(id))
    }

    fn track_mut(&mut self, id: TrackId) -> Result<&mut Track, EditError> {
        let index = self.track_index(id)?;
        Ok(&mut self.tracks[index])
    }

    fn clip_total(&self) -> usize {
        self.tracks.iter().map(Track::clip_count).sum()
    }

    fn publish(&mut self) {
        self.engine.publish_tracks(self.tracks.clone());
        self.engine.collect();
    }

    fn note_removals(&self, expected: usize, actual: usize) {
        if actual < expected {
            self.engine.shared().mark_clips_deleted();
        }
    }

    fn commit(&mut self, kind: CommandKind, changes: Vec<Change>) {
        debug!(command = kind.label(), changes = changes.len(), "edit");
        self.history.push(Command::new(kind, changes));
        self.publish();
    }

    /// Run `edit` on one track and capture its clips before and after.
    fn edit_track<R>(
        &mut self,
        id: TrackId,
        edit: impl FnOnce(&mut Track, f64) -> Result<R, EditError>,
    ) -> Result<(R, Change), EditError> {
        let beat_duration = self.beat_duration();
        let track = self.track_mut(id)?;
        let before = track.snapshot_clips();
        let result = edit(track, beat_duration)?;
        let after = track.snapshot_clips();
        Ok((result, Change::Clips { track: id, before, after }))
    }

    fn add_track(&mut self, name: &str) -> TrackId {
        let id = TrackId(self.next_track_id);
        self.next_track_id += 1;
        let track = Track::new(id, name);
        let index = self.tracks.len();
        self.tracks.push(track.clone());
        self.commit(CommandKind::AddTrack(id), vec![Change::TrackAdded { index, track }]);
        id
    }

    fn delete_track(&mut self, id: TrackId) -> Result<(), EditError> {
        let index = self.track_index(id)?;
        let track = self.tracks.remove(index);
        self.note_removals(track.clip_count(), 0);
        self.commit(CommandKind::DeleteTrack(id), vec![Change::TrackRemoved { index, track }]);
        Ok(())
    }

    fn add_clip(&mut self, id: TrackId, clip: Clip) -> Result<usize, EditError> {
        if !(clip.length() > 0.0) {
            return Err(EditError::EmptyClip);
        }
        let (index, change) = self.edit_track(id, |track, bd| track.insert_clip(clip, bd).ok_or(EditError::EmptyClip))?;
        if let Change::Clips { before, after, .. } = &change {
            self.note_removals(before.len() + 1, after.len());
        }
        self.commit(CommandKind::AddClip { track: id, index }, vec![change]);
        Ok(index)
    }

    fn move_clip(&mut self, clip: ClipRef, delta: f64, to: Option<TrackId>) -> Result<usize, EditError> {
        let missing = EditError::NoClip {
            track: clip.track,
            index: clip.index,
        };
        let to = to.unwrap_or(clip.track);
        let before_total = self.clip_total();

        if to == clip.track {
            let ((index, realized), change) = self.edit_track(clip.track, |track, bd| {
                let start = track.clip(clip.index).ok_or(missing)?.min_time;
                let index = track.move_clip(clip.index, delta, bd).ok_or(EditError::EmptyClip)?;
                let realized = track.clip(index).map_or(0.0, |c| c.min_time - start);
                Ok((index, realized))
            })?;
            self.note_removals(before_total, self.clip_total());
            let kind = CommandKind::MoveClip {
                from: clip.track,
                to,
                index,
                inverse_delta: -realized,
            };
            self.commit(kind, vec![change]);
            return Ok(index);
        }

        self.track_index(to)?;
        let (mut moved, removed) = self.edit_track(clip.track, |track, _| track.remove_clip(clip.index).ok_or(missing))?;
        let realized = delta.max(-moved.min_time);
        moved.min_time += realized;
        moved.max_time += realized;
        moved.mark_content_changed();
        let (index, inserted) = self.edit_track(to, |track, bd| track.insert_clip(moved, bd).ok_or(EditError::EmptyClip))?;

        self.note_removals(before_total, self.clip_total());
        let kind = CommandKind::MoveClip {
            from: clip.track,
            to,
            index,
            inverse_delta: -realized,
        };
        self.commit(kind, vec![removed, inserted]);
        Ok(index)
    }

    fn resize_clip(&mut self, clip: ClipRef, delta: f64, left_side: bool) -> Result<f64, EditError> {
        let min_length = self.min_clip_length;
        let before_total = self.clip_total();
        let (realized, change) = self.edit_track(clip.track, |track, bd| {
            track
                .resize_clip(clip.index, delta, min_length, left_side, bd)
                .ok_or(EditError::NoClip {
                    track: clip.track,
                    index: clip.index,
                })
        })?;
        self.note_removals(before_total, self.clip_total());
        let kind = CommandKind::ResizeClip {
            track: clip.track,
            index: clip.index,
            inverse_delta: -realized,
            left_side,
        };
        self.commit(kind, vec![change]);
        Ok(realized)
    }

    fn delete_clip(&mut self, clip: ClipRef) -> Result<Clip, EditError> {
        let (removed, change) = self.edit_track(clip.track, |track, _| {
            track.remove_clip(clip.index).ok_or(EditError::NoClip {
                track: clip.track,
                index: clip.index,
            })
        })?;
        self.engine.shared().mark_clips_deleted();
        self.commit(
            CommandKind::DeleteClip {
                track: clip.track,
                clip: removed.clone(),
            },
            vec![change],
        );
        Ok(removed)
    }

    /// Group a selection by track and resolve positions to pool keys, so
    /// later edits in the same batch cannot shift them.
    fn resolve_selection(&self, clips: &[ClipRef]) -> Result<BTreeMap<TrackId, Vec<ClipKey>>, EditError> {
        let mut grouped: BTreeMap<TrackId, Vec<ClipKey>> = BTreeMap::new();
        for clip in clips {
            let track = &self.tracks[self.track_index(clip.track)?];
            let key = track.key_at(clip.index).ok_or(EditError::NoClip {
                track: clip.track,
                index: clip.index,
            })?;
            let keys = grouped.entry(clip.track).or_default();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(grouped)
    }

    fn move_clips(&mut self, clips: &[ClipRef], delta: f64) -> Result<usize, EditError> {
        let grouped = self.resolve_selection(clips)?;
        // Keep the selection's spacing when it hits beat zero.
        let earliest = grouped
            .iter()
            .flat_map(|(id, keys)| {
                let track = self.tracks.iter().find(|t| t.id == *id);
                keys.iter()
                    .filter_map(move |&key| track.and_then(|t| t.clip_by_key(key)))
                    .map(|c| c.min_time)
            })
            .fold(f64::INFINITY, f64::min);
        let delta = if earliest.is_finite() { delta.max(-earliest) } else { delta };

        let before_total = self.clip_total();
        let mut changes = Vec::with_capacity(grouped.len());
        let mut count = 0;
        for (id, mut keys) in grouped {
            let (moved, change) = self.edit_track(id, |track, bd| {
                // Lead with the clip furthest in the direction of travel.
                let start = |key: &ClipKey| track.clip_by_key(*key).map_or(0.0, |c| c.min_time);
                keys.sort_by(|a, b| start(a).total_cmp(&start(b)));
                if delta > 0.0 {
                    keys.reverse();
                }
                let mut moved = 0;
                for key in keys {
                    if let Some(index) = track.index_of(key)
                        && track.move_clip(index, delta, bd).is_some()
                    {
                        moved += 1;
                    }
                }
                Ok(moved)
            })?;
            count += moved;
            changes.push(change);
        }
        self.note_removals(before_total, self.clip_total());
        self.commit(
            CommandKind::MoveClips {
                count,
                inverse_delta: -delta,
            },
            changes,
        );
        Ok(count)
    }

    fn delete_clips(&mut self, clips: &[ClipRef]) -> Result<usize, EditError> {
        let grouped = self.resolve_selection(clips)?;
        let mut changes = Vec::with_capacity(grouped.len());
        let mut deleted = Vec::new();
        for (id, keys) in grouped {
            let (removed, change) = self.edit_track(id, |track, _| {
                let mut indices: Vec<usize> = keys.into_iter().filter_map(|key| track.index_of(key)).collect();
                indices.sort_unstable();
                Ok(indices
                    .into_iter()
                    .rev()
                    .filter_map(|index| track.remove_clip(index))
                    .collect::<Vec<_>>())
            })?;
            deleted.extend(removed.into_iter().map(|clip| (id, clip)));
            changes.push(change);
        }
        let count = deleted.len();
        if count > 0 {
            self.engine.shared().mark_clips_deleted();
        }
        self.commit(CommandKind::DeleteClips { clips: deleted }, changes);
        Ok(count)
    }

    fn edit_clip(&mut self, clip: ClipRef, edit: impl FnOnce(&mut Clip) -> Result<(), EditError>) -> Result<(), EditError> {
        let ((), change) = self.edit_track(clip.track, |track, _| {
            let target = track.clip_mut(clip.index).ok_or(EditError::NoClip {
                track: clip.track,
                index: clip.index,
            })?;
            edit(target)?;
            target.mark_content_changed();
            Ok(())
        })?;
        self.commit(
            CommandKind::EditClip {
                track: clip.track,
                index: clip.index,
            },
            vec![change],
        );
        Ok(())
    }

    fn import_take(&mut self, take: &RecordedTake, asset: SampleAsset) -> Result<Vec<TrackId>, EditError> {
        let armed: Vec<TrackId> = self.tracks.iter().filter(|t| t.armed).map(|t| t.id).collect();
        if armed.is_empty() {
            warn!(path = %take.path.display(), "no armed track, take kept on disk only");
            return Ok(armed);
        }

        let before_total = self.clip_total();
        let name = clip_name(&take.path);
        let mut changes = Vec::with_capacity(armed.len());
        for &id in &armed {
            let clip = Clip::audio(name.clone(), asset.clone(), take.start_beat, self.beat_duration());
            let ((), change) = self.edit_track(id, |track, bd| {
                track.insert_clip(clip, bd).map(|_| ()).ok_or(EditError::EmptyClip)
            })?;
            changes.push(change);
        }
        self.note_removals(before_total + armed.len(), self.clip_total());
        self.commit(
            CommandKind::ImportTake {
                path: take.path.clone(),
                tracks: armed.clone(),
            },
            changes,
        );
        Ok(armed)
    }

    fn revert(&mut self, change: &Change) {
        match change {
            Change::Clips { track, before, .. } => {
                if let Some(track) = self.tracks.iter_mut().find(|t| t.id == *track) {
                    track.replace_clips(before.clone());
                }
            }
            Change::TrackAdded { track, .. } => self.tracks.retain(|t| t.id != track.id),
            Change::TrackRemoved { index, track } => {
                let index = (*index).min(self.tracks.len());
                self.tracks.insert(index, track.clone());
            }
        }
    }

    fn reapply(&mut self, change: &Change) {
        match change {
            Change::Clips { track, after, .. } => {
                if let Some(track) = self.tracks.iter_mut().find(|t| t.id == *track) {
                    track.replace_clips(after.clone());
                }
            }
            Change::TrackAdded { index, track } => {
                let index = (*index).min(self.tracks.len());
                self.tracks.insert(index, track.clone());
            }
            Change::TrackRemoved { track, .. } => self.tracks.retain(|t| t.id != track.id),
        }
    }

    fn undo(&mut self) -> Option<CommandKind> {
        let command = self.history.undo()?.clone();
        let before_total = self.clip_total();
        for change in command.changes.iter().rev() {
            self.revert(change);
        }
        self.note_removals(before_total, self.clip_total());
        self.publish();
        debug!(command = command.kind.label(), "undo");
        Some(command.kind)
    }

    fn redo(&mut self) -> Option<CommandKind> {
        let command = self.history.redo()?.clone();
        let before_total = self.clip_total();
        for change in &command.changes {
            self.reapply(change);
        }
        self.note_removals(before_total, self.clip_total());
        self.publish();
        debug!(command = command.kind.label(), "redo");
        Some(command.kind)
    }
}

/// The engine context: tracks, history, transport, assets, background jobs
/// and the audio device, shared by every caller through `&self`.
///
/// Edits and transport changes are serialized by one lock. The audio thread
/// never takes it; it reads the snapshot published after each edit.
pub struct Session {
    state: Arc<Mutex<EditState>>,
    shared: Arc<EngineShared>,
    assets: AssetCache,
    jobs: DeferredJobQueue,
    bridge: Mutex<AudioBridge>,
    time: Arc<Mutex<TimeContext>>,
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig, backend: Box<dyn AudioBackend>) -> anyhow::Result<Self> {
        let mut engine = EngineHandle::new(config.bpm, config.record_dir.clone());
        let shared = engine.shared().clone();

        let time = Arc::new(Mutex::new(TimeContext::new(engine.bpm(), TimeSignature::default(), 100.0)));
        let listener_time = time.clone();
        engine.on_bpm_change(move |bpm| listener_time.lock().bpm = bpm);

        let state = EditState {
            tracks: Vec::new(),
            history: CommandHistory::new(config.history_capacity),
            engine,
            next_track_id: 1,
            min_clip_length: config.min_clip_length.max(0.0),
        };

        info!(bpm = config.bpm, sample_rate = config.sample_rate, backend = backend.name(), "session created");
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            shared,
            assets: AssetCache::with_target_sample_rate(config.sample_rate),
            jobs: DeferredJobQueue::new(config.job_queue_capacity)?,
            bridge: Mutex::new(AudioBridge::new(backend, config.stream_request())),
            time,
            config,
        })
    }

    /// Session on the system's audio hardware.
    pub fn with_default_device(config: SessionConfig) -> anyhow::Result<Self> {
        Self::new(config, Box::new(CpalBackend::new()))
    }

    /// Session on a device-less backend clocked in real time.
    pub fn headless(config: SessionConfig) -> anyhow::Result<Self> {
        Self::new(config, Box::new(NullBackend::new(Clock::Realtime)))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    pub fn engine(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    // Tracks

    pub fn add_track(&self, name: &str) -> TrackId {
        self.state.lock().add_track(name)
    }

    pub fn delete_track(&self, id: TrackId) -> Result<(), EditError> {
        self.state.lock().delete_track(id)
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.state.lock().tracks.iter().map(|t| t.id).collect()
    }

    /// A copy of one track as currently edited.
    pub fn track(&self, id: TrackId) -> Option<Track> {
        self.state.lock().tracks.iter().find(|t| t.id == id).cloned()
    }

    pub fn with_tracks<R>(&self, f: impl FnOnce(&[Track]) -> R) -> R {
        f(&self.state.lock().tracks)
    }

    fn update_track(&self, id: TrackId, update: impl FnOnce(&mut Track)) -> Result<(), EditError> {
        let mut state = self.state.lock();
        update(state.track_mut(id)?);
        state.publish();
        Ok(())
    }

    pub fn set_track_volume(&self, id: TrackId, volume: f32) -> Result<(), EditError> {
        self.update_track(id, |t| t.volume = volume.max(0.0))
    }

    pub fn set_track_pan(&self, id: TrackId, pan: f32) -> Result<(), EditError> {
        self.update_track(id, |t| t.pan = pan.clamp(-1.0, 1.0))
    }

    pub fn set_track_muted(&self, id: TrackId, muted: bool) -> Result<(), EditError> {
        self.update_track(id, |t| t.muted = muted)
    }

    pub fn set_track_solo(&self, id: TrackId, solo: bool) -> Result<(), EditError> {
        self.update_track(id, |t| t.solo = solo)
    }

    pub fn set_track_armed(&self, id: TrackId, armed: bool) -> Result<(), EditError> {
        self.update_track(id, |t| t.armed = armed)
    }

    pub fn set_track_monitor(&self, id: TrackId, monitor: bool) -> Result<(), EditError> {
        self.update_track(id, |t| t.monitor = monitor)
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.shared.set_master_gain(gain);
    }

    // Clips

    /// Decode (or reuse) `path` and place it at `at` beats. Decoding happens
    /// on the calling thread before the edit lock is taken.
    pub fn add_clip_from_file(&self, track: TrackId, path: &Path, at: f64) -> Result<usize, EditError> {
        let asset = self.assets.load(path)?;
        let mut state = self.state.lock();
        let clip = Clip::audio(clip_name(path), asset, at.max(0.0), state.beat_duration());
        state.add_clip(track, clip)
    }

    /// Like [`add_clip_from_file`](Self::add_clip_from_file), but decodes on
    /// the job worker and applies the edit when done.
    pub fn add_clip_from_file_deferred(
        &self,
        track: TrackId,
        path: PathBuf,
        at: f64,
        on_done: impl FnOnce(Result<usize, EditError>) + Send + 'static,
    ) -> JobHandle {
        let state = self.state.clone();
        let assets = self.assets.clone();
        self.jobs.enqueue(move |ctx| {
            if ctx.is_cancelled() {
                return;
            }
            let result = assets.load(&path).map_err(EditError::from).and_then(|asset| {
                let mut state = state.lock();
                let clip = Clip::audio(clip_name(&path), asset, at.max(0.0), state.beat_duration());
                state.add_clip(track, clip)
            });
            if let Err(err) = &result {
                warn!(path = %path.display(), "deferred load failed: {err}");
            }
            on_done(result);
        })
    }

    /// Decode many files in parallel so later `add_clip_from_file` calls hit
    /// the cache. Assets stay cached while the returned handles live.
    pub fn preload(&self, paths: &[PathBuf]) -> Vec<Result<SampleAsset, AssetError>> {
        self.assets.preload(paths)
    }

    /// Keep a clip whose source is unavailable. It plays silence.
    pub fn add_placeholder_clip(&self, track: TrackId, path: PathBuf, at: f64, length: f64) -> Result<usize, EditError> {
        let at = at.max(0.0);
        let clip = Clip::unavailable(clip_name(&path), path, at, at + length);
        self.state.lock().add_clip(track, clip)
    }

    pub fn add_midi_clip(&self, track: TrackId, name: &str, notes: Vec<MidiNote>, at: f64) -> Result<usize, EditError> {
        let asset = self.assets.insert_midi(name, notes);
        let at = at.max(0.0);
        let length = asset.length_beats().max(self.config.min_clip_length);
        let clip = Clip::midi(name, asset, at, at + length);
        self.state.lock().add_clip(track, clip)
    }

    /// Move a clip by `delta` beats, optionally onto another track. Returns
    /// its new index.
    pub fn move_clip(&self, clip: ClipRef, delta: f64, to: Option<TrackId>) -> Result<usize, EditError> {
        self.state.lock().move_clip(clip, delta, to)
    }

    /// Move one edge of a clip. Returns the delta actually applied.
    pub fn resize_clip(&self, clip: ClipRef, delta: f64, left_side: bool) -> Result<f64, EditError> {
        self.state.lock().resize_clip(clip, delta, left_side)
    }

    pub fn delete_clip(&self, clip: ClipRef) -> Result<Clip, EditError> {
        self.state.lock().delete_clip(clip)
    }

    /// Move a selection spanning any number of tracks as one undoable edit.
    pub fn move_clips(&self, clips: &[ClipRef], delta: f64) -> Result<usize, EditError> {
        self.state.lock().move_clips(clips, delta)
    }

    pub fn delete_clips(&self, clips: &[ClipRef]) -> Result<usize, EditError> {
        self.state.lock().delete_clips(clips)
    }

    /// Takes effect on the audio thread immediately; not recorded in history.
    pub fn set_clip_active(&self, clip: ClipRef, active: bool) -> Result<(), EditError> {
        let state = self.state.lock();
        let track = &state.tracks[state.track_index(clip.track)?];
        let target = track.clip(clip.index).ok_or(EditError::NoClip {
            track: clip.track,
            index: clip.index,
        })?;
        target.set_active(active);
        Ok(())
    }

    pub fn set_clip_gain(&self, clip: ClipRef, gain: f32) -> Result<(), EditError> {
        self.state.lock().edit_clip(clip, |target| match &mut target.content {
            ClipContent::Audio(audio) => {
                audio.gain = gain.max(0.0);
                Ok(())
            }
            ClipContent::Midi(_) => Err(EditError::NotAudio {
                track: clip.track,
                index: clip.index,
            }),
        })
    }

    /// Fade lengths in beats, clamped to fit inside the clip together.
    pub fn set_clip_fades(&self, clip: ClipRef, fade_in: f64, fade_out: f64) -> Result<(), EditError> {
        self.state.lock().edit_clip(clip, |target| {
            let length = target.length();
            match &mut target.content {
                ClipContent::Audio(audio) => {
                    audio.fade_in = fade_in.clamp(0.0, length);
                    audio.fade_out = fade_out.clamp(0.0, length - audio.fade_in);
                    Ok(())
                }
                ClipContent::Midi(_) => Err(EditError::NotAudio {
                    track: clip.track,
                    index: clip.index,
                }),
            }
        })
    }

    pub fn rename_clip(&self, clip: ClipRef, name: &str) -> Result<(), EditError> {
        self.state.lock().edit_clip(clip, |target| {
            target.name = name.to_string();
            Ok(())
        })
    }

    // History

    pub fn undo(&self) -> Option<CommandKind> {
        self.state.lock().undo()
    }

    pub fn redo(&self) -> Option<CommandKind> {
        self.state.lock().redo()
    }

    pub fn can_undo(&self) -> bool {
        self.state.lock().history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.state.lock().history.can_redo()
    }

    // Transport

    pub fn play(&self) -> Result<(), EditError> {
        Ok(self.state.lock().engine.play()?)
    }

    /// Stop playback or recording. A finished take is imported onto every
    /// armed track.
    pub fn stop(&self) -> Result<Option<RecordedTake>, EditError> {
        let mut state = self.state.lock();
        let take = state.engine.stop()?;
        self.finish_take(&mut state, take)
    }

    pub fn record(&self) -> Result<(), EditError> {
        Ok(self.state.lock().engine.record()?)
    }

    pub fn stop_record(&self) -> Result<Option<RecordedTake>, EditError> {
        let mut state = self.state.lock();
        let take = state.engine.stop_record()?;
        self.finish_take(&mut state, take)
    }

    fn finish_take(&self, state: &mut EditState, take: Option<RecordedTake>) -> Result<Option<RecordedTake>, EditError> {
        let Some(take) = take else {
            return Ok(None);
        };
        if take.frames == 0 {
            warn!(path = %take.path.display(), "empty take discarded");
            return Ok(Some(take));
        }
        let asset = self.assets.load(&take.path)?;
        state.import_take(&take, asset)?;
        Ok(Some(take))
    }

    pub fn seek(&self, beats: f64) {
        self.state.lock().engine.seek(beats);
    }

    pub fn rewind(&self) {
        self.seek(0.0);
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.state.lock().engine.set_bpm(bpm);
    }

    pub fn bpm(&self) -> f64 {
        self.shared.bpm()
    }

    pub fn playhead(&self) -> f64 {
        self.shared.playhead_pos()
    }

    pub fn transport_state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.is_playing()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.is_recording()
    }

    pub fn time_context(&self) -> TimeContext {
        *self.time.lock()
    }

    pub fn format_position(&self, beats: f64) -> MusicalPosition {
        self.time.lock().format_position(beats)
    }

    /// Consume engine notifications and free track snapshots the audio
    /// thread has released. Call regularly from the control thread.
    pub fn poll(&self) -> SessionEvents {
        let mut state = self.state.lock();
        state.engine.collect();
        let device_failed = self.bridge.lock().has_failed();
        if device_failed {
            self.recover_from_device_failure(&mut state);
        }
        drop(state);

        SessionEvents {
            playhead: self
                .shared
                .take_playhead_updated()
                .then(|| self.shared.playhead_pos()),
            clips_deleted: self.shared.take_deleted_clips(),
            dropped_record_frames: self.shared.take_dropped_record_frames(),
            device_failed,
        }
    }

    /// Close the dead stream first so stopping a recording does not wait on
    /// buffers that will never come.
    fn recover_from_device_failure(&self, state: &mut EditState) {
        {
            let mut bridge = self.bridge.lock();
            error!(backend = bridge.backend_name(), "audio device failed, stopping transport");
            bridge.stop(&state.engine);
        }
        let kept = match state.engine.stop() {
            Ok(take) => self.finish_take(state, take),
            Err(err) => Err(err.into()),
        };
        match kept {
            Ok(Some(take)) => info!(path = %take.path.display(), "take kept after device failure"),
            Ok(None) => {}
            Err(err) => warn!(%err, "take lost after device failure"),
        }
    }

    // Jobs

    pub fn wait_for_job(&self, job: JobHandle, timeout: Duration) -> bool {
        self.jobs.wait(job, timeout)
    }

    pub fn wait_for_jobs(&self) {
        self.jobs.wait_all();
    }

    // Device

    pub fn devices(&self) -> Result<Vec<DeviceInfo>, EditError> {
        Ok(self.bridge.lock().devices()?)
    }

    /// Open the configured devices and start streaming.
    pub fn start_device(&self) -> Result<StreamFormat, EditError> {
        let mut state = self.state.lock();
        let mut bridge = self.bridge.lock();
        bridge.open(self.config.input_device.as_deref(), self.config.output_device.as_deref())?;
        Ok(bridge.start(&mut state.engine)?)
    }

    /// Stop the transport (keeping any take) and close the stream.
    pub fn stop_device(&self) -> Result<Option<RecordedTake>, EditError> {
        let take = self.stop()?;
        let state = self.state.lock();
        self.bridge.lock().stop(&state.engine);
        Ok(take)
    }

    pub fn is_device_open(&self) -> bool {
        self.shared.is_device_open()
    }

    /// Render the timeline offline to a 32-bit float WAV file.
    pub fn bounce(&self, path: &Path) -> anyhow::Result<()> {
        let tracks = self.state.lock().tracks.clone();
        let buffer = daw_render::render_timeline(&tracks, self.bpm(), self.config.sample_rate, 2)?;
        daw_render::write_wav(&buffer, path)?;
        info!(path = %path.display(), frames = buffer.frames(), "bounced");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.state.lock();
        self.bridge.lock().stop(&state.engine);
    }
}

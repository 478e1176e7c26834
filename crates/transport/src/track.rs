use tracing::trace;

use crate::{Clip, ClipKey, ClipPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    /// Clips are always sorted by min_time and non-overlapping once an edit
    /// method returns.
    order: Vec<ClipKey>,
    pool: ClipPool,
    pub volume: f32,
    /// -1.0 (left) ..= 1.0 (right)
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
    /// Record-armed tracks receive takes when recording stops.
    pub armed: bool,
    /// Pass live input through to the output while armed.
    pub monitor: bool,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            order: Vec::new(),
            pool: ClipPool::default(),
            volume: 1.0,
            pan: 0.0,
            muted: false,
            solo: false,
            armed: false,
            monitor: false,
        }
    }

    /// Clips in timeline order.
    pub fn clips(&self) -> impl ExactSizeIterator<Item = &Clip> + '_ {
        ClipIter {
            keys: self.order.iter(),
            pool: &self.pool,
        }
    }

    pub fn clip_count(&self) -> usize {
        self.order.len()
    }

    pub fn clip(&self, index: usize) -> Option<&Clip> {
        self.pool.get(*self.order.get(index)?)
    }

    /// Mutable access for metadata edits (name, gain, fades). Changing the
    /// placement through this reference requires a call to [`Track::update`].
    pub fn clip_mut(&mut self, index: usize) -> Option<&mut Clip> {
        self.pool.get_mut(*self.order.get(index)?)
    }

    pub fn key_at(&self, index: usize) -> Option<ClipKey> {
        self.order.get(index).copied()
    }

    pub fn clip_by_key(&self, key: ClipKey) -> Option<&Clip> {
        self.pool.get(key)
    }

    /// Current position of a clip, or `None` if it has been destroyed.
    pub fn index_of(&self, key: ClipKey) -> Option<usize> {
        self.pool.get(key).map(|clip| clip.id)
    }

    /// Clips intersecting `[start, end)`, found by binary search.
    pub fn clips_in_range(&self, start: f64, end: f64) -> impl Iterator<Item = &Clip> + '_ {
        let first = self
            .order
            .partition_point(|&key| self.pool.get(key).is_some_and(|c| c.max_time <= start));
        self.order[first..]
            .iter()
            .filter_map(|&key| self.pool.get(key))
            .take_while(move |clip| clip.min_time < end)
    }

    pub fn end_time(&self) -> f64 {
        self.clips().map(|c| c.max_time).fold(0.0, f64::max)
    }

    /// Clones of every clip, in timeline order.
    pub fn snapshot_clips(&self) -> Vec<Clip> {
        self.clips().cloned().collect()
    }

    /// Add a clip and resolve overlaps in its favour. Returns its position.
    pub fn insert_clip(&mut self, clip: Clip, beat_duration: f64) -> Option<usize> {
        let key = self.pool.insert(clip);
        self.order.push(key);
        self.update(Some(key), beat_duration);
        self.index_of(key)
    }

    pub fn remove_clip(&mut self, index: usize) -> Option<Clip> {
        if index >= self.order.len() {
            return None;
        }
        let key = self.order.remove(index);
        let clip = self.pool.remove(key);
        self.reassign_ids();
        clip
    }

    /// Replace the whole clip list with clips already known to be valid.
    pub fn replace_clips(&mut self, clips: Vec<Clip>) {
        self.pool.clear();
        self.order.clear();
        for clip in clips {
            let key = self.pool.insert(clip);
            self.order.push(key);
        }
        self.sort();
        self.reassign_ids();
    }

    pub fn clear_clips(&mut self) {
        self.pool.clear();
        self.order.clear();
    }

    /// Shift a clip by `delta` beats (never before zero). Returns its new position.
    pub fn move_clip(&mut self, index: usize, delta: f64, beat_duration: f64) -> Option<usize> {
        let key = self.key_at(index)?;
        let clip = self.pool.get_mut(key)?;
        let delta = delta.max(-clip.min_time);
        clip.min_time += delta;
        clip.max_time += delta;
        self.update(Some(key), beat_duration);
        self.index_of(key)
    }

    /// Move one edge of a clip by `delta` beats.
    ///
    /// The clip never shrinks below `min_length`. Moving the left edge slides
    /// the content offset by the same amount; the offset cannot go negative,
    /// so the edge may move less than requested. Returns the realised delta.
    pub fn resize_clip(
        &mut self,
        index: usize,
        delta: f64,
        min_length: f64,
        left_side: bool,
        beat_duration: f64,
    ) -> Option<f64> {
        let key = self.key_at(index)?;
        let clip = self.pool.get_mut(key)?;
        let min_length = min_length.max(0.0);

        let realized = if left_side {
            let target = if delta > 0.0 {
                (clip.min_time + delta).min((clip.max_time - min_length).max(clip.min_time))
            } else {
                (clip.min_time + delta).max(0.0)
            };
            let mut moved = target - clip.min_time;
            let units = clip.content_units_per_beat(beat_duration);
            if units > 0.0 && clip.start_offset + moved * units < 0.0 {
                moved = -clip.start_offset / units;
            }
            clip.min_time += moved;
            clip.start_offset = (clip.start_offset + moved * units).max(0.0);
            moved
        } else {
            let target = if delta < 0.0 {
                (clip.max_time + delta).max((clip.min_time + min_length).min(clip.max_time))
            } else {
                clip.max_time + delta
            };
            let moved = target - clip.max_time;
            clip.max_time = target;
            moved
        };

        if realized != 0.0 {
            clip.mark_content_changed();
        }
        self.update(Some(key), beat_duration);
        Some(realized)
    }

    /// Restore ordering and the non-overlap invariant after an edit.
    ///
    /// The edited clip wins every conflict: clips starting at or before it
    /// are cut at its start, clips starting inside it are pushed to its end,
    /// and clips left with no length are destroyed. Without an edited clip,
    /// residual overlaps are cut in favour of the later clip. Ids are
    /// reassigned to positions. Returns the number of destroyed clips.
    pub fn update(&mut self, edited: Option<ClipKey>, beat_duration: f64) -> usize {
        self.sort();

        let edited = edited.and_then(|key| {
            self.pool
                .get(key)
                .map(|clip| (key, clip.min_time, clip.max_time))
        });

        match edited {
            Some((edited_key, start, end)) => {
                for &key in &self.order {
                    if key == edited_key {
                        continue;
                    }
                    let Some(clip) = self.pool.get_mut(key) else {
                        continue;
                    };
                    if clip.min_time <= start {
                        if clip.max_time > start {
                            clip.max_time = start;
                            clip.mark_content_changed();
                        }
                    } else if clip.min_time < end {
                        clip.trim_start_to(end, beat_duration);
                    }
                }
            }
            None => {
                for i in 1..self.order.len() {
                    let Some(next_start) = self.pool.get(self.order[i]).map(|c| c.min_time) else {
                        continue;
                    };
                    if let Some(prev) = self.pool.get_mut(self.order[i - 1])
                        && prev.max_time > next_start
                    {
                        prev.max_time = next_start;
                        prev.mark_content_changed();
                    }
                }
            }
        }

        let mut removed = 0;
        let pool = &mut self.pool;
        self.order.retain(|&key| {
            let covered = pool.get(key).is_none_or(|c| c.min_time >= c.max_time);
            if covered {
                pool.remove(key);
                removed += 1;
            }
            !covered
        });

        self.sort();
        self.reassign_ids();
        if removed > 0 {
            trace!(track = %self.id, removed, "clips fully covered");
        }
        removed
    }

    fn sort(&mut self) {
        let pool = &self.pool;
        self.order.sort_by(|&a, &b| {
            let a = pool.get(a).map_or(f64::INFINITY, |c| c.min_time);
            let b = pool.get(b).map_or(f64::INFINITY, |c| c.min_time);
            a.total_cmp(&b)
        });
    }

    fn reassign_ids(&mut self) {
        for (position, &key) in self.order.iter().enumerate() {
            if let Some(clip) = self.pool.get_mut(key) {
                clip.id = position;
            }
        }
    }
}

struct ClipIter<'a> {
    keys: std::slice::Iter<'a, ClipKey>,
    pool: &'a ClipPool,
}

impl<'a> Iterator for ClipIter<'a> {
    type Item = &'a Clip;

    fn next(&mut self) -> Option<Self::Item> {
        // Every key in the order list is live.
        self.keys.by_ref().find_map(|&key| self.pool.get(key))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.keys.size_hint()
    }
}

impl ExactSizeIterator for ClipIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use daw_decode::{AssetCache, MidiNote};
    use std::path::PathBuf;

    const BEAT: f64 = 0.5; // 120 BPM

    fn clip(name: &str, min: f64, max: f64) -> Clip {
        Clip::unavailable(name, PathBuf::from(format!("{name}.wav")), min, max)
    }

    fn midi_clip(cache: &AssetCache, name: &str, min: f64, max: f64) -> Clip {
        let notes = cache.insert_midi(
            name,
            vec![MidiNote { pitch: 60, velocity: 100, start: 0.0, length: max - min }],
        );
        Clip::midi(name, notes, min, max)
    }

    fn spans(track: &Track) -> Vec<(f64, f64)> {
        track.clips().map(|c| (c.min_time, c.max_time)).collect()
    }

    fn assert_no_overlap(track: &Track) {
        let clips: Vec<&Clip> = track.clips().collect();
        for (i, a) in clips.iter().enumerate() {
            assert_eq!(a.id, i, "ids are positions");
            assert!(a.min_time < a.max_time, "zero-length clip survived");
            for b in &clips[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", (a.min_time, a.max_time), (b.min_time, b.max_time));
                assert!(a.min_time <= b.min_time, "clips out of order");
            }
        }
    }

    #[test]
    fn resize_then_insert_truncates_older_clip() {
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(clip("a", 0.0, 10.0), BEAT);

        let realized = track.resize_clip(0, 5.0, 0.25, false, BEAT).unwrap();
        assert_eq!(realized, 5.0);
        assert_eq!(spans(&track), vec![(0.0, 15.0)]);

        let index = track.insert_clip(clip("b", 12.0, 20.0), BEAT).unwrap();
        assert_eq!(index, 1);
        assert_eq!(spans(&track), vec![(0.0, 12.0), (12.0, 20.0)]);
    }

    #[test]
    fn later_clips_are_pushed_to_edited_end() {
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(clip("a", 4.0, 8.0), BEAT);
        track.insert_clip(clip("b", 2.0, 5.0), BEAT);
        assert_eq!(spans(&track), vec![(2.0, 5.0), (5.0, 8.0)]);
    }

    #[test]
    fn same_start_loses_to_edited_clip() {
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(clip("a", 0.0, 4.0), BEAT);
        track.insert_clip(clip("b", 0.0, 2.0), BEAT);
        assert_eq!(spans(&track), vec![(0.0, 2.0)]);
        assert_eq!(track.clip(0).unwrap().name, "b");
    }

    #[test]
    fn fully_covered_clips_are_destroyed() {
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(clip("a", 1.0, 2.0), BEAT);
        track.insert_clip(clip("b", 3.0, 4.0), BEAT);
        let key = track.key_at(0).unwrap();

        track.insert_clip(clip("c", 0.0, 5.0), BEAT);
        assert_eq!(spans(&track), vec![(0.0, 5.0)]);
        assert!(track.clip_by_key(key).is_none(), "stale key must not resolve");
    }

    #[test]
    fn pushed_midi_clip_keeps_content_in_place() {
        let cache = AssetCache::new();
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(midi_clip(&cache, "late", 4.0, 8.0), BEAT);
        track.insert_clip(clip("early", 0.0, 6.0), BEAT);

        let late = track.clip(1).unwrap();
        assert_eq!((late.min_time, late.max_time), (6.0, 8.0));
        assert_eq!(late.start_offset, 2.0);
    }

    #[test]
    fn left_resize_slides_offset_and_clamps_at_zero() {
        let cache = AssetCache::new();
        let mut track = Track::new(TrackId(1), "t");
        let mut c = midi_clip(&cache, "m", 4.0, 8.0);
        c.start_offset = 1.0;
        track.insert_clip(c, BEAT);

        // Only one beat of content is hidden, so the edge stops after one beat.
        let realized = track.resize_clip(0, -3.0, 0.25, true, BEAT).unwrap();
        assert_eq!(realized, -1.0);
        let clip = track.clip(0).unwrap();
        assert_eq!((clip.min_time, clip.max_time), (3.0, 8.0));
        assert_eq!(clip.start_offset, 0.0);

        let realized = track.resize_clip(0, 2.0, 0.25, true, BEAT).unwrap();
        assert_eq!(realized, 2.0);
        let clip = track.clip(0).unwrap();
        assert_eq!(clip.min_time, 5.0);
        assert_eq!(clip.start_offset, 2.0);
    }

    #[test]
    fn resize_respects_min_length() {
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(clip("a", 0.0, 2.0), BEAT);

        let realized = track.resize_clip(0, -10.0, 0.5, false, BEAT).unwrap();
        assert_eq!(realized, -1.5);
        assert_eq!(spans(&track), vec![(0.0, 0.5)]);

        let realized = track.resize_clip(0, 10.0, 0.5, true, BEAT).unwrap();
        assert_eq!(realized, 0.0);
        assert_eq!(spans(&track), vec![(0.0, 0.5)]);
    }

    #[test]
    fn move_reorders_and_reassigns_ids() {
        let mut track = Track::new(TrackId(1), "t");
        track.insert_clip(clip("a", 0.0, 1.0), BEAT);
        track.insert_clip(clip("b", 2.0, 3.0), BEAT);
        let key = track.key_at(0).unwrap();

        let index = track.move_clip(0, 4.0, BEAT).unwrap();
        assert_eq!(index, 1);
        assert_eq!(track.index_of(key), Some(1));
        assert_eq!(track.clip(0).unwrap().name, "b");

        // Cannot move before the timeline start.
        let index = track.move_clip(1, -100.0, BEAT).unwrap();
        assert_eq!(track.clip(index).unwrap().min_time, 0.0);
    }

    #[test]
    fn range_query_uses_sorted_order() {
        let mut track = Track::new(TrackId(1), "t");
        for i in 0..100 {
            let start = i as f64 * 2.0;
            track.insert_clip(clip(&i.to_string(), start, start + 1.0), BEAT);
        }
        let names: Vec<&str> = track.clips_in_range(10.5, 15.0).map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["5", "6", "7"]);
        assert_eq!(track.clips_in_range(1.0, 2.0).count(), 0);
    }

    #[test]
    fn update_without_edited_clip_repairs_overlaps() {
        let mut track = Track::new(TrackId(1), "t");
        track.replace_clips(vec![clip("a", 0.0, 5.0), clip("b", 3.0, 6.0), clip("c", 3.0, 4.0)]);
        track.update(None, BEAT);
        assert_no_overlap(&track);
    }

    #[test]
    fn random_edits_never_overlap() {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut track = Track::new(TrackId(1), "t");

        for step in 0..2000 {
            let count = track.clip_count();
            match rng.u8(0..4) {
                0 => {
                    let start = rng.f64() * 64.0;
                    let length = 0.25 + rng.f64() * 8.0;
                    track.insert_clip(clip(&step.to_string(), start, start + length), BEAT);
                }
                1 if count > 0 => {
                    let delta = rng.f64() * 16.0 - 8.0;
                    track.move_clip(rng.usize(0..count), delta, BEAT);
                }
                2 if count > 0 => {
                    let delta = rng.f64() * 8.0 - 4.0;
                    track.resize_clip(rng.usize(0..count), delta, 0.25, rng.bool(), BEAT);
                }
                3 if count > 0 => {
                    track.remove_clip(rng.usize(0..count));
                }
                _ => {}
            }
            assert_no_overlap(&track);
        }
    }
}

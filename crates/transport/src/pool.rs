//! Per-track clip storage with generation-checked keys.

use crate::Clip;

/// Stable handle to a clip inside its track's pool. A key stays valid across
/// edits to other clips and is rejected once its clip has been destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipKey {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    clip: Option<Clip>,
}

#[derive(Debug, Clone, Default)]
pub struct ClipPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ClipPool {
    pub fn insert(&mut self, clip: Clip) -> ClipKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.clip = Some(clip);
            return ClipKey {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            clip: Some(clip),
        });
        ClipKey {
            index,
            generation: 0,
        }
    }

    pub fn remove(&mut self, key: ClipKey) -> Option<Clip> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let clip = slot.clip.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(clip)
    }

    #[inline]
    pub fn get(&self, key: ClipKey) -> Option<&Clip> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.clip.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, key: ClipKey) -> Option<&mut Clip> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.clip.as_mut())
    }

    pub fn contains(&self, key: ClipKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.clip.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn clip(name: &str) -> Clip {
        Clip::unavailable(name, PathBuf::from("x.wav"), 0.0, 1.0)
    }

    #[test]
    fn stale_key_is_rejected_after_slot_reuse() {
        let mut pool = ClipPool::default();
        let a = pool.insert(clip("a"));
        assert_eq!(pool.remove(a).map(|c| c.name), Some("a".to_string()));

        let b = pool.insert(clip("b"));
        assert_eq!(a.index, b.index, "slot is reused");
        assert!(pool.get(a).is_none());
        assert!(pool.remove(a).is_none());
        assert_eq!(pool.get(b).map(|c| c.name.as_str()), Some("b"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn keys_survive_edits_to_other_clips() {
        let mut pool = ClipPool::default();
        let a = pool.insert(clip("a"));
        let b = pool.insert(clip("b"));
        pool.remove(a);
        pool.insert(clip("c"));
        pool.get_mut(b).unwrap().min_time = 0.5;
        assert_eq!(pool.get(b).unwrap().min_time, 0.5);
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut pool = ClipPool::default();
        let keys: Vec<_> = (0..4).map(|i| pool.insert(clip(&i.to_string()))).collect();
        pool.clear();
        assert!(pool.is_empty());
        assert!(keys.iter().all(|&k| !pool.contains(k)));
    }
}

//! Content addressable caches for derived objects.
//!
//! Derived objects (render passes, framebuffers, pipelines, descriptor sets) are keyed by a
//! structural hash of their description instead of by the pointer identity of their inputs. Each
//! cache entry holds one counted reference to every [`Destructible`] it was built from. Those
//! references are released when the entry is removed, never implicitly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::objects::{Destructible, ObjectId};

/// Hashes a description's raw bytes. Different descriptions with equal bytes are by definition
/// the same cache key.
pub fn structural_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// A value evicted from a cache together with the dependency references its entry held.
///
/// The caller must release every returned dependency, usually through
/// [`crate::renderer::destruction::DestructionQueue::release_object`].
pub struct Removed<V> {
    pub value: V,
    pub deps: Vec<Arc<Destructible>>,
}

struct CacheEntry<V> {
    value: V,
    deps: Box<[Arc<Destructible>]>,
}

struct CacheState<V> {
    entries: HashMap<u64, CacheEntry<V>>,
    by_object: HashMap<ObjectId, Vec<u64>>,
}

pub struct ContentCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> ContentCache<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                by_object: HashMap::new(),
            }),
        }
    }

    /// Looks up `hash` and runs `factory` on a miss.
    ///
    /// The cache lock is held across the factory call so concurrent lookups of the same key run
    /// the factory exactly once. The factory must not call back into the same cache.
    ///
    /// Every call takes one reference on each dependency and flags it as used by
    /// `submission_id`. On a miss that reference becomes the entry's edge, released by
    /// [`Self::remove`]. On a hit it belongs to the caller, who releases it once the use has
    /// been recorded.
    pub fn get_or_create<E>(
        &self,
        hash: u64,
        submission_id: u64,
        deps: &[Arc<Destructible>],
        factory: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let mut state = self.state.lock();

        for dep in deps {
            dep.flag_for_submission(submission_id);
        }

        if let Some(entry) = state.entries.get(&hash) {
            for dep in deps {
                dep.add_ref();
            }
            return Ok(entry.value.clone());
        }

        let value = factory()?;
        for dep in deps {
            dep.add_ref();
            state.by_object.entry(dep.get_id()).or_default().push(hash);
        }
        state.entries.insert(hash, CacheEntry {
            value: value.clone(),
            deps: deps.to_vec().into_boxed_slice(),
        });

        Ok(value)
    }

    pub fn get(&self, hash: u64) -> Option<V> {
        self.state.lock().entries.get(&hash).map(|entry| entry.value.clone())
    }

    pub fn remove(&self, hash: u64) -> Option<Removed<V>> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(&hash)?;
        for dep in entry.deps.iter() {
            Self::unlink(&mut state.by_object, dep.get_id(), hash);
        }
        Some(Removed {
            value: entry.value,
            deps: entry.deps.into_vec(),
        })
    }

    /// Removes every entry depending on `object` and returns them for release.
    ///
    /// Called when an object is about to go away so that no cache entry outlives an input it was
    /// built from.
    pub fn detach_object(&self, object: ObjectId) -> Vec<Removed<V>> {
        let mut state = self.state.lock();
        let hashes = match state.by_object.remove(&object) {
            Some(hashes) => hashes,
            None => return Vec::new(),
        };

        let mut removed = Vec::with_capacity(hashes.len());
        for hash in hashes {
            // Entries can appear under multiple dependency ids, skip ones already taken.
            if let Some(entry) = state.entries.remove(&hash) {
                for dep in entry.deps.iter() {
                    if dep.get_id() != object {
                        Self::unlink(&mut state.by_object, dep.get_id(), hash);
                    }
                }
                removed.push(Removed {
                    value: entry.value,
                    deps: entry.deps.into_vec(),
                });
            }
        }
        removed
    }

    /// Removes all entries, returning them for release.
    pub fn clear(&self) -> Vec<Removed<V>> {
        let mut state = self.state.lock();
        state.by_object.clear();
        state.entries.drain()
            .map(|(_, entry)| Removed {
                value: entry.value,
                deps: entry.deps.into_vec(),
            })
            .collect()
    }

    pub fn get_entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn unlink(by_object: &mut HashMap<ObjectId, Vec<u64>>, id: ObjectId, hash: u64) {
        if let Some(hashes) = by_object.get_mut(&id) {
            hashes.retain(|&h| h != hash);
            if hashes.is_empty() {
                by_object.remove(&id);
            }
        }
    }
}

assert_impl_all!(ContentCache<u64>: Send, Sync);

#[cfg(test)]
mod test {
    use std::convert::Infallible;

    use ash::vk::Handle;

    use super::*;
    use crate::objects::ObjectKind;

    fn dep(raw: u64) -> Arc<Destructible> {
        Destructible::new(ObjectKind::Buffer(ash::vk::Buffer::from_raw(raw)))
    }

    fn ok(value: u64) -> Result<u64, Infallible> {
        Ok(value)
    }

    #[test]
    fn factory_runs_once_per_key() {
        let cache = ContentCache::new();
        let a = dep(0x10);

        let mut runs = 0;
        for _ in 0..3 {
            let value = cache.get_or_create(7, 1, &[a.clone()], || {
                runs += 1;
                ok(42)
            }).unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(runs, 1);
        assert_eq!(cache.get_entry_count(), 1);
        // One reference per call, one per miss and two owned by the caller.
        assert_eq!(a.get_ref_count(), 3);
    }

    #[test]
    fn every_call_takes_one_reference_per_dependency()  {
        let cache = ContentCache::new();
        let a = dep(0x10);
        let b = dep(0x11);

        cache.get_or_create(7, 1, &[a.clone(), b.clone()], || ok(1)).unwrap();
        assert_eq!(a.get_ref_count(), 1);
        assert_eq!(b.get_ref_count(), 1);

        // The hit's reference belongs to the caller.
        cache.get_or_create(7, 2, &[a.clone(), b.clone()], || ok(1)).unwrap();
        assert_eq!(a.get_ref_count(), 2);
        a.release_ref();
        b.release_ref();

        let removed = cache.remove(7).unwrap();
        assert_eq!(removed.deps.len(), 2);
        for dep in &removed.deps {
            dep.release_ref();
        }
        assert_eq!(a.get_ref_count(), 0);
        assert_eq!(b.get_ref_count(), 0);
    }

    #[test]
    fn lookups_flag_dependencies_for_submission() {
        let cache = ContentCache::new();
        let a = dep(0x10);

        cache.get_or_create(7, 3, &[a.clone()], || ok(1)).unwrap();
        assert_eq!(a.get_last_submission(), 3);

        cache.get_or_create(7, 9, &[a.clone()], || ok(1)).unwrap();
        assert_eq!(a.get_last_submission(), 9);
    }

    #[test]
    fn failed_factory_inserts_nothing() {
        let cache: ContentCache<u64> = ContentCache::new();
        let a = dep(0x10);

        let result = cache.get_or_create(7, 1, &[a.clone()], || Err("no memory"));
        assert_eq!(result, Err("no memory"));
        assert_eq!(cache.get_entry_count(), 0);
        assert_eq!(a.get_ref_count(), 0);
    }

    #[test]
    fn detach_removes_all_entries_of_an_object() {
        let cache = ContentCache::new();
        let a = dep(0x10);
        let b = dep(0x11);

        cache.get_or_create(1, 1, &[a.clone(), b.clone()], || ok(100)).unwrap();
        cache.get_or_create(2, 1, &[a.clone()], || ok(200)).unwrap();
        cache.get_or_create(3, 1, &[b.clone()], || ok(300)).unwrap();

        let mut removed = cache.detach_object(a.get_id());
        removed.sort_by_key(|r| r.value);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].value, 100);
        assert_eq!(removed[1].value, 200);
        assert_eq!(cache.get_entry_count(), 1);
        assert_eq!(cache.get(3), Some(300));

        // The surviving entry's reverse index must still work.
        let removed = cache.detach_object(b.get_id());
        assert_eq!(removed.len(), 1);
        assert_eq!(cache.get_entry_count(), 0);
    }
}

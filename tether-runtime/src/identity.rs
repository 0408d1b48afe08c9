//! # Identity Cache
//!
//! Maps (object identity, handle flavor) to the live handle word for that
//! pair, so creating a handle for an object that already has one returns the
//! existing word instead of minting a new one. Native code relies on this:
//! two handles to the same object compare equal as integers.
//!
//! Deref handles for one object under different layouts are distinct
//! flavors, so each gets its own word. Layouts compare by content, not by
//! name: a packed and a naturally aligned `P` are different views.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::layout::LayoutDescriptor;
use crate::tag::HandleWord;

/// Which kind of handle a cache entry stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Opaque handle.
    Opaque,
    /// Deref handle under this exact layout.
    Deref(Arc<LayoutDescriptor>),
}

/// Identity-keyed handle cache.
#[derive(Debug)]
pub struct IdentityCache<I> {
    entries: HashMap<(I, Flavor), HandleWord>,
}

impl<I: Hash + Eq> IdentityCache<I> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The cached word for an identity and flavor, if any.
    pub fn lookup(&self, identity: &I, flavor: &Flavor) -> Option<HandleWord>
    where
        I: Clone,
    {
        self.entries
            .get(&(identity.clone(), flavor.clone()))
            .copied()
    }

    /// Record the word for an identity and flavor.
    ///
    /// Returns the previous word if one was cached.
    pub fn insert(&mut self, identity: I, flavor: Flavor, word: HandleWord) -> Option<HandleWord> {
        self.entries.insert((identity, flavor), word)
    }

    /// Drop the entry for an identity and flavor, but only if it still maps
    /// to `word`. Entries minted without caching must not evict the cached
    /// handle of the same object.
    pub fn remove_if(&mut self, identity: &I, flavor: &Flavor, word: HandleWord) -> bool
    where
        I: Clone,
    {
        let key = (identity.clone(), flavor.clone());
        match self.entries.get(&key) {
            Some(&cached) if cached == word => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<I: Hash + Eq> Default for IdentityCache<I> {
    fn default() -> Self {
        Self::new()
    }
}

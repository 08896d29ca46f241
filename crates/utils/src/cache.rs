/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    borrow::Borrow,
    hash::Hash,
    time::{Duration, Instant},
};

/// Concurrent cache whose entries carry an absolute expiry instant.
/// Expired entries are treated as absent and evicted lazily on access.
pub struct CacheWithTtl<K: Eq + Hash, V: Clone> {
    cache: quick_cache::sync::Cache<K, (V, Instant)>,
}

impl<K: Eq + Hash, V: Clone> CacheWithTtl<K, V> {
    pub fn new(capacity: usize) -> Self {
        CacheWithTtl {
            cache: quick_cache::sync::Cache::new(capacity),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Q: Hash + Eq + ?Sized,
        K: Borrow<Q>,
    {
        match self.cache.get(key) {
            Some((value, valid_until)) if valid_until > Instant::now() => Some(value),
            Some(_) => {
                self.cache.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert_with_expiry(&self, key: K, value: V, valid_until: Instant) {
        self.cache.insert(key, (value, valid_until));
    }

    pub fn insert(&self, key: K, value: V, expires_in: Duration) {
        self.insert_with_expiry(key, value, Instant::now() + expires_in);
    }

    pub fn remove<Q>(&self, key: &Q)
    where
        Q: Hash + Eq + ?Sized,
        K: Borrow<Q>,
    {
        self.cache.remove(key);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

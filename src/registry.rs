// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A fixed-bucket hashtable mapping connection handles to [`Connection`]s,
//! matching the distilled spec's `HASHTABLE_SIZE = 1024` bucket count
//! (itself carried from the original C server's `defs.h`).

use crate::connection::Connection;

/// Default number of buckets, matching `HASHTABLE_SIZE` in the original
/// implementation this server's design is grounded on. [`ServerConfig`](crate::server::ServerConfig)
/// can override this per deployment.
pub const BUCKETS: usize = 1024;

/// Handle-keyed connection table. Buckets are `Vec`-backed collision
/// chains; with enough buckets for the expected connection count, chains
/// stay short.
pub struct Registry {
    buckets: Vec<Vec<(usize, Connection)>>,
}

impl Registry {
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Registry { buckets: (0..buckets).map(|_| Vec::new()).collect() }
    }

    fn bucket_of(&self, handle: usize) -> usize {
        handle % self.buckets.len()
    }

    pub fn insert(&mut self, handle: usize, conn: Connection) {
        let bucket = self.bucket_of(handle);
        debug_assert!(!self.buckets[bucket].iter().any(|(h, _)| *h == handle));
        self.buckets[bucket].push((handle, conn));
    }

    pub fn get(&self, handle: usize) -> Option<&Connection> {
        self.buckets[self.bucket_of(handle)].iter().find(|(h, _)| *h == handle).map(|(_, c)| c)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut Connection> {
        let bucket = self.bucket_of(handle);
        self.buckets[bucket].iter_mut().find(|(h, _)| *h == handle).map(|(_, c)| c)
    }

    pub fn remove(&mut self, handle: usize) -> Option<Connection> {
        let bucket = self.bucket_of(handle);
        let idx = self.buckets[bucket].iter().position(|(h, _)| *h == handle)?;
        Some(self.buckets[bucket].swap_remove(idx).1)
    }

    pub fn contains(&self, handle: usize) -> bool {
        self.buckets[self.bucket_of(handle)].iter().any(|(h, _)| *h == handle)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> impl Iterator<Item = usize> + '_ {
        self.buckets.iter().flat_map(|b| b.iter().map(|(h, _)| *h))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(BUCKETS)
    }
}

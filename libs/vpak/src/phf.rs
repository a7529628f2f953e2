// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// A minimal perfect hash over a static key set.
///
/// Construction distributes the n keys into n candidate buckets with the
/// unseeded hash, then resolves buckets largest-first: a bucket with
/// collisions searches for a seed under which all of its keys land on
/// distinct free slots; a singleton bucket is assigned the next free slot
/// directly, with the slot index encoded as a negative seed. Lookup is two
/// hashes and one table read, and maps the key set bijectively onto
/// `[0, n)`.
#[derive(Default)]
pub struct PerfectHasher {
    seeds: Vec<i32>,
}

/// Seeded FNV-1a. This function is part of the pack format: the seed table
/// on disk is only meaningful against exactly this hash.
pub(crate) fn hash_key(key: &[u8], seed: u32) -> u32 {
    let mut hash = 0x811c_9dc5_u32 ^ seed.wrapping_mul(0x9e37_79b9);
    for &byte in key {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

impl PerfectHasher {
    pub fn from_seeds(seeds: Vec<i32>) -> Self {
        Self { seeds }
    }

    pub fn seeds(&self) -> &[i32] {
        &self.seeds
    }

    /// Builds the seed table for `keys`. Keys must be distinct.
    ///
    /// # Panics
    ///
    /// Panics if no seed below `i32::MAX` resolves a bucket, which for
    /// distinct keys has vanishing probability.
    pub fn build<K: AsRef<[u8]>>(keys: &[K]) -> Self {
        let n = keys.len();
        if n == 0 {
            return Self::default();
        }

        // Distribute the keys into their unseeded buckets.
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (key_index, key) in keys.iter().enumerate() {
            let bucket = (hash_key(key.as_ref(), 0) as usize) % n;
            buckets[bucket].push(key_index);
        }

        // Resolve the most collided buckets first, while slots are free.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&bucket| core::cmp::Reverse(buckets[bucket].len()));

        let mut seeds = vec![0i32; n];
        let mut occupied = vec![false; n];
        let mut scratch: Vec<usize> = Vec::new();
        let mut next_free = 0usize;

        for &bucket_index in &order {
            let bucket = &buckets[bucket_index];
            match bucket.len() {
                0 => break,
                1 => {
                    // Singleton: take the next free slot and encode its
                    // index as a negative seed.
                    while occupied[next_free] {
                        next_free += 1;
                    }
                    occupied[next_free] = true;
                    seeds[bucket_index] =
                        -i32::try_from(next_free).expect("seed table overflow") - 1;
                }
                _ => {
                    let mut seed = 1u32;
                    loop {
                        assert!(seed < i32::MAX as u32, "failed to build perfect hash");

                        scratch.clear();
                        let mut complete = true;
                        for &key_index in bucket {
                            let slot = (hash_key(keys[key_index].as_ref(), seed) as usize) % n;
                            if occupied[slot] || scratch.contains(&slot) {
                                complete = false;
                                break;
                            }
                            scratch.push(slot);
                        }

                        if complete {
                            for &slot in &scratch {
                                occupied[slot] = true;
                            }
                            seeds[bucket_index] = i32::try_from(seed).expect("seed fits i32");
                            break;
                        }
                        seed += 1;
                    }
                }
            }
        }

        Self { seeds }
    }

    /// Maps a key from the construction set to its slot in `[0, n)`.
    ///
    /// Keys outside the construction set return an arbitrary slot; the
    /// caller disambiguates by comparing the stored name.
    pub fn hash(&self, key: &[u8]) -> u32 {
        let n = self.seeds.len();
        debug_assert!(n != 0, "lookup in an empty perfect hash");
        let seed = self.seeds[(hash_key(key, 0) as usize) % n];
        if seed < 0 {
            (-(i64::from(seed)) - 1) as u32
        } else {
            hash_key(key, seed.cast_unsigned()) % (n as u32)
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

impl fmt::Debug for PerfectHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfectHasher")
            .field("len", &self.seeds.len())
            .finish()
    }
}

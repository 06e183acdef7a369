//! Memory-hard epoch hash: seed derivation, cache and dataset generation and
//! the hashimoto mixing loop.
//!
//! Caches and datasets are sequences of 32-bit words. Their byte form is the
//! little-endian encoding of those words; how words sit on disk is the dump
//! layer's business.

use super::sizes::{CACHE_SIZES, DATASET_SIZES};
use crate::types::{keccak256, keccak512};
use rayon::prelude::*;
use tracing::{debug, info};

pub const DATASET_INIT_BYTES: u64 = 1 << 30;
pub const DATASET_GROWTH_BYTES: u64 = 1 << 23;
pub const CACHE_INIT_BYTES: u64 = 1 << 24;
pub const CACHE_GROWTH_BYTES: u64 = 1 << 17;
pub const EPOCH_LENGTH: u64 = 30_000;
pub const MIX_BYTES: u64 = 128;
pub const HASH_BYTES: u64 = 64;
pub const HASH_WORDS: usize = 16;
pub const DATASET_PARENTS: u32 = 256;
pub const CACHE_ROUNDS: usize = 3;
pub const LOOP_ACCESSES: u32 = 64;
pub const ALGORITHM_REVISION: u32 = 23;
/// Epochs covered by the size tables. The lookahead stops here.
pub const MAX_EPOCH: u64 = CACHE_SIZES.len() as u64;

/// Test-mode sizes, small enough to generate in milliseconds.
pub const TEST_CACHE_BYTES: u64 = 1024;
pub const TEST_DATASET_BYTES: u64 = 32 * 1024;

/// Random access to a word sequence, whether heap allocated or mapped.
pub trait WordSource: Sync {
    fn word(&self, index: usize) -> u32;
    fn word_len(&self) -> usize;
}

impl WordSource for [u32] {
    fn word(&self, index: usize) -> u32 {
        self[index]
    }

    fn word_len(&self) -> usize {
        self.len()
    }
}

impl WordSource for Vec<u32> {
    fn word(&self, index: usize) -> u32 {
        self[index]
    }

    fn word_len(&self) -> usize {
        self.len()
    }
}

#[inline]
fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(0x0100_0193) ^ b
}

fn le_words(bytes: &[u8], out: &mut [u32]) {
    for (w, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

fn is_probable_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    const BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    for p in BASES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mul = |a: u64, b: u64| ((a as u128 * b as u128) % n as u128) as u64;
    let pow = |mut base: u64, mut exp: u64| {
        let mut acc = 1u64;
        base %= n;
        while exp > 0 {
            if exp & 1 == 1 {
                acc = mul(acc, base);
            }
            base = mul(base, base);
            exp >>= 1;
        }
        acc
    };
    let (mut d, mut s) = (n - 1, 0u32);
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }
    'witness: for a in BASES {
        let mut x = pow(a, d);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul(x, x);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Largest cache size below the linear growth bound whose row count is prime.
pub fn calc_cache_size(epoch: u64) -> u64 {
    let mut size = CACHE_INIT_BYTES + CACHE_GROWTH_BYTES * epoch - HASH_BYTES;
    while !is_probable_prime(size / HASH_BYTES) {
        size -= 2 * HASH_BYTES;
    }
    size
}

/// Largest dataset size below the linear growth bound whose row count is prime.
pub fn calc_dataset_size(epoch: u64) -> u64 {
    let mut size = DATASET_INIT_BYTES + DATASET_GROWTH_BYTES * epoch - MIX_BYTES;
    while !is_probable_prime(size / MIX_BYTES) {
        size -= 2 * MIX_BYTES;
    }
    size
}

pub fn cache_size(block: u64) -> u64 {
    let epoch = block / EPOCH_LENGTH;
    match CACHE_SIZES.get(epoch as usize) {
        Some(size) => *size,
        None => calc_cache_size(epoch),
    }
}

pub fn dataset_size(block: u64) -> u64 {
    let epoch = block / EPOCH_LENGTH;
    match DATASET_SIZES.get(epoch as usize) {
        Some(size) => *size,
        None => calc_dataset_size(epoch),
    }
}

/// Seed of the epoch containing `block`: keccak256 applied once per elapsed
/// epoch to 32 zero bytes.
pub fn seed_hash(block: u64) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for _ in 0..block / EPOCH_LENGTH {
        seed = keccak256(&seed);
    }
    seed
}

/// Build the verification cache of `size` bytes: a sequential keccak512
/// chain, then `CACHE_ROUNDS` passes of RandMemoHash.
pub fn generate_cache(size: u64, epoch: u64, seed: &[u8; 32]) -> Vec<u32> {
    let started = std::time::Instant::now();
    let size = size as usize;
    let hb = HASH_BYTES as usize;
    let rows = size / hb;
    let mut cache = vec![0u8; rows * hb];

    cache[..hb].copy_from_slice(&keccak512(seed));
    for offset in (hb..cache.len()).step_by(hb) {
        let next = keccak512(&cache[offset - hb..offset]);
        cache[offset..offset + hb].copy_from_slice(&next);
    }

    let mut temp = [0u8; 64];
    for _ in 0..CACHE_ROUNDS {
        for j in 0..rows {
            let src = ((j + rows - 1) % rows) * hb;
            let dst = j * hb;
            let first = u32::from_le_bytes([cache[dst], cache[dst + 1], cache[dst + 2], cache[dst + 3]]);
            let xor = (first as usize % rows) * hb;
            for k in 0..hb {
                temp[k] = cache[src + k] ^ cache[xor + k];
            }
            cache[dst..dst + hb].copy_from_slice(&keccak512(&temp));
        }
    }

    let mut words = vec![0u32; cache.len() / 4];
    le_words(&cache, &mut words);
    debug!(target: "pow", epoch, bytes = size, elapsed = ?started.elapsed(), "generated epoch cache");
    words
}

/// One 64-byte dataset item, derived from `DATASET_PARENTS` pseudo-randomly
/// chosen cache rows.
pub fn generate_dataset_item<W: WordSource + ?Sized>(cache: &W, index: u32) -> [u32; HASH_WORDS] {
    let rows = (cache.word_len() / HASH_WORDS) as u32;
    let base = ((index % rows) as usize) * HASH_WORDS;

    let mut mix = [0u8; 64];
    mix[..4].copy_from_slice(&(cache.word(base) ^ index).to_le_bytes());
    for i in 1..HASH_WORDS {
        mix[i * 4..i * 4 + 4].copy_from_slice(&cache.word(base + i).to_le_bytes());
    }
    let mix = keccak512(&mix);

    let mut int_mix = [0u32; HASH_WORDS];
    le_words(&mix, &mut int_mix);
    for i in 0..DATASET_PARENTS {
        let parent = fnv(index ^ i, int_mix[i as usize % HASH_WORDS]) % rows;
        let off = parent as usize * HASH_WORDS;
        for (j, w) in int_mix.iter_mut().enumerate() {
            *w = fnv(*w, cache.word(off + j));
        }
    }

    let mut out = [0u8; 64];
    for (i, w) in int_mix.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    let out = keccak512(&out);
    let mut item = [0u32; HASH_WORDS];
    le_words(&out, &mut item);
    item
}

/// Expand a cache into the full dataset of `size` bytes. Items are
/// independent and computed in parallel.
pub fn generate_dataset<W: WordSource + ?Sized>(size: u64, epoch: u64, cache: &W) -> Vec<u32> {
    let started = std::time::Instant::now();
    let mut dataset = vec![0u32; (size / 4) as usize];
    let items = dataset.len() / HASH_WORDS;
    dataset
        .par_chunks_mut(HASH_WORDS)
        .enumerate()
        .for_each(|(index, chunk)| {
            let item = generate_dataset_item(cache, index as u32);
            chunk.copy_from_slice(&item[..chunk.len()]);
        });
    info!(target: "pow", epoch, items, elapsed = ?started.elapsed(), "generated epoch dataset");
    dataset
}

fn hashimoto<F>(hash: &[u8; 32], nonce: u64, size: u64, lookup: F) -> ([u8; 32], [u8; 32])
where
    F: Fn(u32) -> [u32; HASH_WORDS],
{
    let rows = (size / MIX_BYTES) as u32;

    let mut seed_input = [0u8; 40];
    seed_input[..32].copy_from_slice(hash);
    seed_input[32..].copy_from_slice(&nonce.to_le_bytes());
    let seed = keccak512(&seed_input);
    let seed_head = u32::from_le_bytes([seed[0], seed[1], seed[2], seed[3]]);

    const MIX_WORDS: usize = (MIX_BYTES / 4) as usize;
    let mut seed_words = [0u32; HASH_WORDS];
    le_words(&seed, &mut seed_words);
    let mut mix = [0u32; MIX_WORDS];
    for (i, w) in mix.iter_mut().enumerate() {
        *w = seed_words[i % HASH_WORDS];
    }

    let mut temp = [0u32; MIX_WORDS];
    let per_mix = (MIX_BYTES / HASH_BYTES) as u32;
    for i in 0..LOOP_ACCESSES {
        let parent = fnv(i ^ seed_head, mix[i as usize % MIX_WORDS]) % rows;
        for j in 0..per_mix {
            let item = lookup(per_mix * parent + j);
            let off = j as usize * HASH_WORDS;
            temp[off..off + HASH_WORDS].copy_from_slice(&item);
        }
        for (m, t) in mix.iter_mut().zip(temp.iter()) {
            *m = fnv(*m, *t);
        }
    }

    let mut digest = [0u8; 32];
    for i in (0..MIX_WORDS).step_by(4) {
        let folded = fnv(fnv(fnv(mix[i], mix[i + 1]), mix[i + 2]), mix[i + 3]);
        digest[i..i + 4].copy_from_slice(&folded.to_le_bytes());
    }

    let mut final_input = [0u8; 96];
    final_input[..64].copy_from_slice(&seed);
    final_input[64..].copy_from_slice(&digest);
    (digest, keccak256(&final_input))
}

/// Hash using only the cache, recomputing dataset items on demand.
pub fn hashimoto_light<W: WordSource + ?Sized>(size: u64, cache: &W, hash: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
    hashimoto(hash, nonce, size, |index| generate_dataset_item(cache, index))
}

/// Hash against a fully generated dataset.
pub fn hashimoto_full<W: WordSource + ?Sized>(dataset: &W, hash: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
    let size = (dataset.word_len() * 4) as u64;
    hashimoto(hash, nonce, size, |index| {
        let off = index as usize * HASH_WORDS;
        let mut item = [0u32; HASH_WORDS];
        for (j, w) in item.iter_mut().enumerate() {
            *w = dataset.word(off + j);
        }
        item
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_prime_rows() {
        assert_eq!(calc_cache_size(0), 16_776_896);
        assert_eq!(calc_dataset_size(0), 1_073_739_904);
        assert_eq!(calc_cache_size(1), 16_907_456);
        assert_eq!(calc_dataset_size(1), 1_082_130_304);
        assert!(is_probable_prime(calc_cache_size(700) / HASH_BYTES));
        assert_eq!(cache_size(EPOCH_LENGTH - 1), cache_size(0));
    }

    #[test]
    fn tables_match_the_growth_formula() {
        for epoch in [0u64, 1, 2, 511, 1024, MAX_EPOCH - 1] {
            assert_eq!(CACHE_SIZES[epoch as usize], calc_cache_size(epoch));
            assert_eq!(DATASET_SIZES[epoch as usize], calc_dataset_size(epoch));
        }
        assert_eq!(dataset_size((MAX_EPOCH - 1) * EPOCH_LENGTH), 18_245_220_736);
        assert_eq!(cache_size(MAX_EPOCH * EPOCH_LENGTH), calc_cache_size(MAX_EPOCH));
    }

    #[test]
    fn miller_rabin_agrees_with_small_primes() {
        let primes: Vec<u64> = (0..100).filter(|n| is_probable_prime(*n)).collect();
        assert_eq!(
            primes,
            vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97]
        );
        assert!(!is_probable_prime(3_215_031_751)); // strong pseudoprime to bases 2,3,5,7
    }

    #[test]
    fn seed_hash_chains_per_epoch() {
        assert_eq!(seed_hash(0), [0u8; 32]);
        assert_eq!(seed_hash(EPOCH_LENGTH - 1), [0u8; 32]);
        assert_eq!(seed_hash(EPOCH_LENGTH), keccak256(&[0u8; 32]));
        assert_eq!(seed_hash(2 * EPOCH_LENGTH + 5), keccak256(&keccak256(&[0u8; 32])));
    }

    #[test]
    fn cache_and_dataset_are_deterministic() {
        let seed = seed_hash(0);
        let a = generate_cache(TEST_CACHE_BYTES, 0, &seed);
        let b = generate_cache(TEST_CACHE_BYTES, 0, &seed);
        assert_eq!(a, b);
        assert_eq!(a.len(), (TEST_CACHE_BYTES / 4) as usize);

        let d1 = generate_dataset(TEST_DATASET_BYTES, 0, &a);
        let d2 = generate_dataset(TEST_DATASET_BYTES, 0, &b);
        assert_eq!(d1, d2);
        assert_eq!(&d1[..HASH_WORDS], &generate_dataset_item(&a, 0)[..]);

        let other = generate_cache(TEST_CACHE_BYTES, 1, &seed_hash(EPOCH_LENGTH));
        assert_ne!(a, other);
    }

    #[test]
    fn light_and_full_hashing_agree() {
        let cache = generate_cache(TEST_CACHE_BYTES, 0, &seed_hash(0));
        let dataset = generate_dataset(TEST_DATASET_BYTES, 0, &cache);
        let hash = [0x5au8; 32];
        for nonce in [0u64, 1, 0xdead_beef] {
            let light = hashimoto_light(TEST_DATASET_BYTES, &cache, &hash, nonce);
            let full = hashimoto_full(&dataset, &hash, nonce);
            assert_eq!(light, full);
        }
        assert_ne!(
            hashimoto_full(&dataset, &hash, 1).1,
            hashimoto_full(&dataset, &hash, 2).1
        );
    }
}

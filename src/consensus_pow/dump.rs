//! On-disk cache and dataset dumps.
//!
//! A dump is the two magic words `0xbaddcafe 0xfee1dead` followed by the
//! payload words, all in host byte order. Big-endian hosts append `.be` to
//! the file name so dumps from differently ordered machines never mix.
//! Files are produced under a temporary name and renamed into place once
//! complete.

use super::algorithm::{seed_hash, WordSource, ALGORITHM_REVISION, EPOCH_LENGTH};
use crate::errors::PowError;
use memmap2::{Mmap, MmapMut};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::trace;

pub const DUMP_MAGIC: [u32; 2] = [0xbadd_cafe, 0xfee1_dead];
const MAGIC_BYTES: usize = DUMP_MAGIC.len() * 4;

/// Word storage backing a cache or dataset.
pub enum Words {
    Heap(Vec<u32>),
    Mapped(Mmap),
}

impl Words {
    pub fn len(&self) -> usize {
        match self {
            Words::Heap(v) => v.len(),
            Words::Mapped(m) => (m.len() - MAGIC_BYTES) / 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Words::Mapped(_))
    }

    pub fn to_vec(&self) -> Vec<u32> {
        (0..self.len()).map(|i| self.word(i)).collect()
    }
}

impl WordSource for Words {
    #[inline]
    fn word(&self, index: usize) -> u32 {
        match self {
            Words::Heap(v) => v[index],
            Words::Mapped(m) => {
                let off = MAGIC_BYTES + index * 4;
                u32::from_ne_bytes([m[off], m[off + 1], m[off + 2], m[off + 3]])
            }
        }
    }

    fn word_len(&self) -> usize {
        self.len()
    }
}

fn endian_suffix() -> &'static str {
    if cfg!(target_endian = "big") {
        ".be"
    } else {
        ""
    }
}

/// `<kind>-R<rev>-<first 8 seed bytes hex><.be>`
pub fn dump_name(kind: &str, seed: &[u8; 32]) -> String {
    format!(
        "{}-R{}-{}{}",
        kind,
        ALGORITHM_REVISION,
        hex::encode(&seed[..8]),
        endian_suffix()
    )
}

pub fn dump_path(dir: &Path, kind: &str, epoch: u64) -> PathBuf {
    dir.join(dump_name(kind, &seed_hash(epoch * EPOCH_LENGTH + 1)))
}

/// Map an existing dump read-only, rejecting it when the magic is wrong.
pub fn memory_map(path: &Path) -> Result<Words, PowError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() < MAGIC_BYTES || (mmap.len() - MAGIC_BYTES) % 4 != 0 {
        return Err(PowError::DumpTruncated { len: mmap.len() });
    }
    for (i, magic) in DUMP_MAGIC.iter().enumerate() {
        let word = u32::from_ne_bytes([mmap[i * 4], mmap[i * 4 + 1], mmap[i * 4 + 2], mmap[i * 4 + 3]]);
        if word != *magic {
            return Err(PowError::InvalidDumpMagic);
        }
    }
    Ok(Words::Mapped(mmap))
}

/// Write `words` into a fresh dump at `path` and map the result.
pub fn memory_map_and_generate(path: &Path, words: &[u32]) -> Result<Words, PowError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{}", rand::random::<u32>()));
    let temp = PathBuf::from(temp);
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        file.set_len((MAGIC_BYTES + words.len() * 4) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        for (i, magic) in DUMP_MAGIC.iter().enumerate() {
            mmap[i * 4..i * 4 + 4].copy_from_slice(&magic.to_ne_bytes());
        }
        for (chunk, word) in mmap[MAGIC_BYTES..].chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        mmap.flush()?;
    }
    fs::rename(&temp, path)?;
    memory_map(path)
}

/// Remove dumps of epochs more than `limit` behind `epoch`.
pub fn remove_stale(dir: &Path, kind: &str, epoch: u64, limit: usize) {
    let Some(mut ep) = epoch.checked_sub(limit as u64) else {
        return;
    };
    loop {
        let path = dump_path(dir, kind, ep);
        if fs::remove_file(&path).is_ok() {
            trace!(target: "pow", kind, epoch = ep, "removed stale dump");
        }
        if ep == 0 {
            break;
        }
        ep -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_carries_revision_and_seed_prefix() {
        let name = dump_name("cache", &[0u8; 32]);
        if cfg!(target_endian = "little") {
            assert_eq!(name, "cache-R23-0000000000000000");
        }
        let later = dump_path(Path::new("/x"), "full", 1);
        assert!(later.to_string_lossy().starts_with("/x/full-R23-"));
    }

    #[test]
    fn generated_dump_maps_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache-test");
        let words: Vec<u32> = (0..64).collect();
        let mapped = memory_map_and_generate(&path, &words).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.to_vec(), words);
        assert_eq!(memory_map(&path).unwrap().word(10), 10);
    }

    #[test]
    fn corrupted_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache-bad");
        memory_map_and_generate(&path, &[1, 2, 3]).unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[0] ^= 0xff;
        fs::write(&path, &raw).unwrap();
        assert!(matches!(memory_map(&path), Err(PowError::InvalidDumpMagic)));

        fs::write(&path, [0u8; 3]).unwrap();
        assert!(matches!(memory_map(&path), Err(PowError::DumpTruncated { .. })));
    }

    #[test]
    fn stale_dumps_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        for ep in 0..4 {
            fs::write(dump_path(dir.path(), "cache", ep), b"x").unwrap();
        }
        remove_stale(dir.path(), "cache", 3, 2);
        assert!(!dump_path(dir.path(), "cache", 0).exists());
        assert!(!dump_path(dir.path(), "cache", 1).exists());
        assert!(dump_path(dir.path(), "cache", 2).exists());
        assert!(dump_path(dir.path(), "cache", 3).exists());
    }
}

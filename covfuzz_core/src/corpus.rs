use crate::harness::CoverageSignature;
use crate::input::Input;
use rand::Rng;
use rand_core::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// Reading an initial seed file or directory failed.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// Key under which a seed is stored.
///
/// Literal seeds supplied at session start live under `Sentinel` keys, which
/// can never collide with a signature reported by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeedKey {
    Sentinel(u32),
    Coverage(CoverageSignature),
}

impl fmt::Display for SeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedKey::Sentinel(n) => write!(f, "sentinel#{n}"),
            SeedKey::Coverage(sig) => write!(f, "cov:{sig:#018x}"),
        }
    }
}

/// A retention store of fuzz inputs keyed by the coverage they produced.
///
/// Keys are unique and the first writer wins: an insert under a key that is
/// already present leaves the stored seed untouched. Entries are never
/// removed, so `len` never decreases over the lifetime of a corpus.
///
/// # Type Parameters
/// * `I`: The type of input stored in the corpus, which must implement the [`Input`] trait.
pub trait Corpus<I: Input> {
    /// Stores `input` under `key` unless the key is taken (or the corpus is
    /// full). Returns whether the input was stored.
    fn try_insert(&mut self, key: SeedKey, input: I) -> bool;

    /// Picks a stored seed uniformly at random, or `None` when empty.
    fn pick_random(&self, rng: &mut dyn RngCore) -> Option<&I>;

    fn get(&self, key: &SeedKey) -> Option<&I>;

    fn contains(&self, key: &SeedKey) -> bool {
        self.get(key).is_some()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory, signature-indexed [`Corpus`].
///
/// Seeds are kept in insertion order in a `Vec` with a `HashMap` from key to
/// index, so both insertion and uniform selection are O(1) and selection
/// order does not depend on hash iteration order.
///
/// An optional capacity bounds the number of coverage-keyed seeds. Once it
/// is reached new signatures are rejected; nothing is evicted.
#[derive(Debug)]
pub struct InMemorySeedCorpus<I: Input> {
    entries: Vec<(SeedKey, I)>,
    index: HashMap<SeedKey, usize>,
    coverage_entries: usize,
    max_coverage_entries: Option<usize>,
}

impl<I: Input> InMemorySeedCorpus<I> {
    /// Creates a new, empty, unbounded corpus.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            coverage_entries: 0,
            max_coverage_entries: None,
        }
    }

    pub fn with_capacity_limit(max_coverage_entries: Option<usize>) -> Self {
        Self {
            max_coverage_entries,
            ..Self::new()
        }
    }

    /// Number of seeds stored under coverage signatures (excludes literals).
    pub fn coverage_len(&self) -> usize {
        self.coverage_entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &SeedKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    fn is_full(&self) -> bool {
        self.max_coverage_entries
            .is_some_and(|max| self.coverage_entries >= max)
    }
}

impl<I: Input> Default for InMemorySeedCorpus<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Input> Corpus<I> for InMemorySeedCorpus<I> {
    fn try_insert(&mut self, key: SeedKey, input: I) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        if let SeedKey::Coverage(_) = key {
            if self.is_full() {
                return false;
            }
            self.coverage_entries += 1;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push((key, input));
        true
    }

    fn pick_random(&self, rng: &mut dyn RngCore) -> Option<&I> {
        if self.entries.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.entries.len());
        self.entries.get(index).map(|(_, input)| input)
    }

    fn get(&self, key: &SeedKey) -> Option<&I> {
        self.index
            .get(key)
            .and_then(|&index| self.entries.get(index))
            .map(|(_, input)| input)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Reads raw seed buffers from files and directories.
///
/// Each path can point to either an individual seed file or a directory; for
/// directories only the files directly inside are read (no recursion) and
/// hidden files are skipped. Directory entries are read in file-name order
/// so the resulting seed order is stable across runs.
pub fn read_seed_files(seed_paths: &[PathBuf]) -> Result<Vec<(PathBuf, Vec<u8>)>, CorpusError> {
    let mut seeds = Vec::new();
    for path_buf in seed_paths {
        let path_ref = path_buf.as_path();
        if path_ref.is_file() {
            seeds.push((path_buf.clone(), read_seed(path_ref)?));
        } else if path_ref.is_dir() {
            let mut files = Vec::new();
            for entry_result in fs::read_dir(path_ref).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to read seed directory {:?}: {}",
                    path_ref, e
                ))
            })? {
                let entry = entry_result.map_err(|e| {
                    CorpusError::Io(format!("Error reading entry in {:?}: {}", path_ref, e))
                })?;
                let file_path_in_dir = entry.path();
                let hidden = file_path_in_dir
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
                if file_path_in_dir.is_file() && !hidden {
                    files.push(file_path_in_dir);
                }
            }
            files.sort();
            for file in files {
                let data = read_seed(&file)?;
                seeds.push((file, data));
            }
        } else {
            return Err(CorpusError::Io(format!(
                "Seed path {:?} is neither a file nor a directory",
                path_ref
            )));
        }
    }
    Ok(seeds)
}

fn read_seed(path: &Path) -> Result<Vec<u8>, CorpusError> {
    fs::read(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn first_writer_wins() {
        let mut corpus: InMemorySeedCorpus<Vec<u8>> = InMemorySeedCorpus::new();
        assert!(corpus.is_empty());

        assert!(corpus.try_insert(SeedKey::Coverage(42), vec![1]));
        assert!(!corpus.try_insert(SeedKey::Coverage(42), vec![2]));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get(&SeedKey::Coverage(42)), Some(&vec![1]));
        assert!(corpus.contains(&SeedKey::Coverage(42)));
        assert!(!corpus.contains(&SeedKey::Coverage(99)));
    }

    #[test]
    fn sentinel_keys_do_not_collide_with_signatures() {
        let mut corpus: InMemorySeedCorpus<Vec<u8>> = InMemorySeedCorpus::new();
        assert!(corpus.try_insert(SeedKey::Sentinel(0), b"literal".to_vec()));
        assert!(corpus.try_insert(SeedKey::Coverage(0), b"covered".to_vec()));
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.coverage_len(), 1);
        assert_eq!(
            corpus.keys().copied().collect::<Vec<_>>(),
            vec![SeedKey::Sentinel(0), SeedKey::Coverage(0)]
        );
    }

    #[test]
    fn cardinality_never_decreases() {
        let mut corpus: InMemorySeedCorpus<Vec<u8>> = InMemorySeedCorpus::new();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut last_len = 0;
        let mut seen = HashSet::new();
        for i in 0..500u64 {
            let sig = rng.random_range(0..64u64);
            let inserted = corpus.try_insert(SeedKey::Coverage(sig), vec![i as u8]);
            assert_eq!(inserted, seen.insert(sig));
            assert!(corpus.len() >= last_len);
            last_len = corpus.len();
        }
        assert_eq!(corpus.len(), seen.len());
    }

    #[test]
    fn capacity_limit_rejects_new_signatures_but_not_literals() {
        let mut corpus: InMemorySeedCorpus<Vec<u8>> =
            InMemorySeedCorpus::with_capacity_limit(Some(2));
        assert!(corpus.try_insert(SeedKey::Coverage(1), vec![1]));
        assert!(corpus.try_insert(SeedKey::Coverage(2), vec![2]));
        assert!(!corpus.try_insert(SeedKey::Coverage(3), vec![3]));
        assert!(corpus.try_insert(SeedKey::Sentinel(0), vec![0]));
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.coverage_len(), 2);
        assert_eq!(corpus.get(&SeedKey::Coverage(1)), Some(&vec![1]));
    }

    #[test]
    fn pick_random_behavior() {
        let mut corpus: InMemorySeedCorpus<Vec<u8>> = InMemorySeedCorpus::new();
        let mut rng = ChaCha8Rng::from_seed([42; 32]);
        assert!(corpus.pick_random(&mut rng).is_none());

        corpus.try_insert(SeedKey::Coverage(1), vec![b'A']);
        corpus.try_insert(SeedKey::Coverage(2), vec![b'B']);
        corpus.try_insert(SeedKey::Sentinel(0), vec![b'C']);

        let mut picked = HashSet::new();
        for _ in 0..100 {
            let input = corpus
                .pick_random(&mut rng)
                .expect("pick_random failed on non-empty corpus");
            picked.insert(input.clone());
        }
        assert_eq!(picked.len(), 3, "All seeds should be picked");
    }

    #[test]
    fn pick_random_is_deterministic_for_a_seed() {
        let mut corpus: InMemorySeedCorpus<Vec<u8>> = InMemorySeedCorpus::new();
        for sig in 0..10u64 {
            corpus.try_insert(SeedKey::Coverage(sig * 7919), vec![sig as u8]);
        }
        let draw = || {
            let mut rng = ChaCha8Rng::seed_from_u64(5);
            (0..20)
                .map(|_| corpus.pick_random(&mut rng).cloned())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(), draw());
    }

    #[test]
    fn read_seed_files_from_files_and_dirs() -> Result<(), CorpusError> {
        let temp_dir = tempdir().unwrap();
        let seed1_p = temp_dir.path().join("s1.bin");
        let seed2_p = temp_dir.path().join("s2.txt");
        fs::write(&seed1_p, [1, 2]).unwrap();
        fs::write(&seed2_p, [3, 4, 5]).unwrap();
        let seed_d = temp_dir.path().join("s_dir");
        fs::create_dir(&seed_d).unwrap();
        fs::write(seed_d.join("b.dat"), [7]).unwrap();
        fs::write(seed_d.join("a.dat"), [6]).unwrap();
        fs::write(seed_d.join(".hidden"), [9]).unwrap();
        fs::create_dir(seed_d.join("nested")).unwrap();

        let paths = vec![seed1_p.clone(), seed_d.clone(), seed2_p.clone()];
        let seeds = read_seed_files(&paths)?;
        let data: Vec<Vec<u8>> = seeds.into_iter().map(|(_, d)| d).collect();
        assert_eq!(data, vec![vec![1, 2], vec![6], vec![7], vec![3, 4, 5]]);
        temp_dir.close().unwrap();
        Ok(())
    }

    #[test]
    fn read_seed_files_rejects_missing_path() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("nope");
        match read_seed_files(&[missing]) {
            Err(CorpusError::Io(msg)) => assert!(msg.contains("neither a file nor a directory")),
            other => panic!("Expected Io error, got {other:?}"),
        }
    }
}

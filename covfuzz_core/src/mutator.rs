use crate::input::{Input, latin1_encode};
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Matches one markup tag such as `<p>`, `</p>` or `<a href="x">`.
const TAG_PATTERN: &str = "<[^>]*>";

/// Printable ASCII range used by `add_invalid_char`.
const PRINTABLE_MIN: u8 = 32;
const PRINTABLE_MAX: u8 = 126;

pub const DEFAULT_INSERT_TAG_P: f64 = 0.3;
pub const DEFAULT_DELETE_TAG_P: f64 = 0.3;
pub const DEFAULT_ADD_INVALID_CHAR_P: f64 = 0.5;

#[derive(Error, Debug)]
pub enum MutatorError {
    #[error("Mutation probability '{name}' must be within [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("Invalid tag pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// A `Mutator` transforms an existing `Input` into a new candidate input.
///
/// Implementations draw every random decision from `rng`, so the same
/// generator state and input always produce the same output.
pub trait Mutator<I: Input, R: Rng + ?Sized> {
    fn mutate(&mut self, input: &I, rng: &mut R) -> Result<I, MutatorError>;
}

/// Firing probabilities of the three markup operators.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationProbabilities {
    #[serde(default = "default_insert_tag_p")]
    pub insert_tag_p: f64,
    #[serde(default = "default_delete_tag_p")]
    pub delete_tag_p: f64,
    #[serde(default = "default_add_invalid_char_p")]
    pub add_invalid_char_p: f64,
}

fn default_insert_tag_p() -> f64 {
    DEFAULT_INSERT_TAG_P
}
fn default_delete_tag_p() -> f64 {
    DEFAULT_DELETE_TAG_P
}
fn default_add_invalid_char_p() -> f64 {
    DEFAULT_ADD_INVALID_CHAR_P
}

impl Default for MutationProbabilities {
    fn default() -> Self {
        Self {
            insert_tag_p: DEFAULT_INSERT_TAG_P,
            delete_tag_p: DEFAULT_DELETE_TAG_P,
            add_invalid_char_p: DEFAULT_ADD_INVALID_CHAR_P,
        }
    }
}

impl MutationProbabilities {
    pub fn validate(&self) -> Result<(), MutatorError> {
        for (name, value) in [
            ("insert-tag-p", self.insert_tag_p),
            ("delete-tag-p", self.delete_tag_p),
            ("add-invalid-char-p", self.add_invalid_char_p),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MutatorError::InvalidProbability { name, value });
            }
        }
        Ok(())
    }
}

/// Structure-aware mutator for markup-like text.
///
/// The input bytes are read as Latin-1 text and three operators run in a
/// fixed order, each gated by its own probability:
/// 1. `insert_tag`: copy a tag found in the text to a random position.
/// 2. `delete_tag`: remove the first occurrence of a randomly chosen tag.
/// 3. `add_invalid_char`: insert a random printable ASCII character.
///
/// The result is re-encoded as Latin-1. No length limit is applied here.
#[derive(Debug, Clone)]
pub struct MarkupMutator {
    probabilities: MutationProbabilities,
    tag_pattern: Regex,
}

impl MarkupMutator {
    pub fn new(probabilities: MutationProbabilities) -> Result<Self, MutatorError> {
        probabilities.validate()?;
        Ok(Self {
            probabilities,
            tag_pattern: Regex::new(TAG_PATTERN)?,
        })
    }

    pub fn probabilities(&self) -> MutationProbabilities {
        self.probabilities
    }

    fn find_tags(&self, text: &str) -> Vec<String> {
        self.tag_pattern
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Returns true if a tag was inserted.
    fn insert_tag<R: Rng + ?Sized>(&self, text: &mut String, rng: &mut R) -> bool {
        let tags = self.find_tags(text);
        if tags.is_empty() {
            return false;
        }
        let tag = &tags[rng.random_range(0..tags.len())];
        let position = rng.random_range(0..=text.chars().count());
        insert_str_at_char(text, position, tag);
        true
    }

    /// Returns true if a tag was removed.
    fn delete_tag<R: Rng + ?Sized>(&self, text: &mut String, rng: &mut R) -> bool {
        let tags = self.find_tags(text);
        if tags.is_empty() {
            return false;
        }
        let tag = &tags[rng.random_range(0..tags.len())];
        remove_first(text, tag)
    }

    fn add_invalid_char<R: Rng + ?Sized>(&self, text: &mut String, rng: &mut R) {
        let position = rng.random_range(0..=text.chars().count());
        let code = rng.random_range(PRINTABLE_MIN..=PRINTABLE_MAX);
        insert_char_at(text, position, code);
    }
}

impl<I, R> Mutator<I, R> for MarkupMutator
where
    I: Input + From<Vec<u8>>,
    R: Rng + ?Sized,
{
    fn mutate(&mut self, input: &I, rng: &mut R) -> Result<I, MutatorError> {
        let mut text = input.to_text();

        if rng.random_bool(self.probabilities.insert_tag_p) {
            self.insert_tag(&mut text, rng);
        }
        if rng.random_bool(self.probabilities.delete_tag_p) {
            self.delete_tag(&mut text, rng);
        }
        if rng.random_bool(self.probabilities.add_invalid_char_p) {
            self.add_invalid_char(&mut text, rng);
        }

        Ok(I::from(latin1_encode(&text)))
    }
}

/// Byte offset of the `char_pos`-th character, or `text.len()` past the end.
fn byte_offset(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map_or(text.len(), |(offset, _)| offset)
}

fn insert_str_at_char(text: &mut String, char_pos: usize, insert: &str) {
    let offset = byte_offset(text, char_pos);
    text.insert_str(offset, insert);
}

/// Inserts the character with code `code` before character `char_pos`.
pub fn insert_char_at(text: &mut String, char_pos: usize, code: u8) {
    let offset = byte_offset(text, char_pos);
    text.insert(offset, char::from(code));
}

fn remove_first(text: &mut String, needle: &str) -> bool {
    match text.find(needle) {
        Some(start) => {
            text.replace_range(start..start + needle.len(), "");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::{RngCore, SeedableRng};

    fn only(insert: f64, delete: f64, add: f64) -> MarkupMutator {
        MarkupMutator::new(MutationProbabilities {
            insert_tag_p: insert,
            delete_tag_p: delete,
            add_invalid_char_p: add,
        })
        .unwrap()
    }

    /// Returns `word` from every `next_u32` and zero from every `next_u64`.
    ///
    /// `random_bool(0.0)` consumes a zero `u64` and stays false. Small ranges
    /// are sampled from a `u32` by widening multiply, so `word` maps to
    /// `word * range >> 32`: 0 for `0..=9` and 1 for `32..=126`.
    struct FixedRng {
        word: u32,
    }

    /// `word * 10 >> 32 == 0` and `word * 95 >> 32 == 1`, with neither low
    /// half landing in the resampling zone.
    const POSITION_ZERO_CODE_33: u32 = 45_210_216;

    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            self.word
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dst: &mut [u8]) {
            dst.fill(0);
        }
    }

    #[test]
    fn insert_char_at_front_yields_bang_prefix() {
        let mut text = "<p>hi</p>".to_string();
        insert_char_at(&mut text, 0, 33);
        assert_eq!(text, "!<p>hi</p>");
    }

    #[test]
    fn forced_add_invalid_char_prefixes_bang() {
        let mut mutator = only(0.0, 0.0, 1.0);
        let mut rng = FixedRng {
            word: POSITION_ZERO_CODE_33,
        };
        assert_eq!(rng.random_range(0..=9usize), 0);
        assert_eq!(rng.random_range(PRINTABLE_MIN..=PRINTABLE_MAX), 33);

        let input: Vec<u8> = b"<p>hi</p>".to_vec();
        let out: Vec<u8> = mutator.mutate(&input, &mut rng).unwrap();
        assert_eq!(out, b"!<p>hi</p>".to_vec());
    }

    #[test]
    fn insert_char_at_end_and_past_multibyte_chars() {
        let mut text = "\u{e9}a".to_string();
        insert_char_at(&mut text, 1, b'x');
        assert_eq!(text, "\u{e9}xa");
        insert_char_at(&mut text, 3, b'!');
        assert_eq!(text, "\u{e9}xa!");
    }

    #[test]
    fn add_invalid_char_grows_tag_free_buffer_by_one() {
        let mut mutator = only(1.0, 1.0, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let input: Vec<u8> = b"plain text, no markup".to_vec();

        for _ in 0..100 {
            let out: Vec<u8> = mutator.mutate(&input, &mut rng).unwrap();
            assert_eq!(out.len(), input.len() + 1);
            assert!(out.iter().all(|b| (PRINTABLE_MIN..=PRINTABLE_MAX).contains(b)));
        }
    }

    #[test]
    fn add_invalid_char_fires_on_empty_buffer() {
        let mut mutator = only(0.0, 0.0, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let out: Vec<u8> = mutator.mutate(&Vec::new(), &mut rng).unwrap();
        assert_eq!(out.len(), 1);
        assert!((PRINTABLE_MIN..=PRINTABLE_MAX).contains(&out[0]));
    }

    #[test]
    fn insert_tag_duplicates_an_existing_tag() {
        let mut mutator = only(1.0, 0.0, 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let input: Vec<u8> = b"<b>x</b>".to_vec();

        for _ in 0..50 {
            let out: Vec<u8> = mutator.mutate(&input, &mut rng).unwrap();
            let grew = out.len() - input.len();
            assert!(grew == 3 || grew == 4, "expected <b> or </b> to be copied, grew by {grew}");
        }
    }

    #[test]
    fn delete_tag_removes_first_occurrence() {
        let mut mutator = only(0.0, 1.0, 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let input: Vec<u8> = b"<i>a<i>b".to_vec();
        let out: Vec<u8> = mutator.mutate(&input, &mut rng).unwrap();
        assert_eq!(out, b"a<i>b".to_vec());
    }

    #[test]
    fn tag_operators_are_noops_without_tags() {
        let mut mutator = only(1.0, 1.0, 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for tag_free in [b"1 < 2 and 3".to_vec(), b"x > y".to_vec(), Vec::new()] {
            let out: Vec<u8> = mutator.mutate(&tag_free, &mut rng).unwrap();
            assert_eq!(out, tag_free);
        }
    }

    #[test]
    fn zero_probabilities_return_input_unchanged() {
        let mut mutator = only(0.0, 0.0, 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let input: Vec<u8> = vec![0, 1, 2, 0xFF, b'<', b'>'];
        let out: Vec<u8> = mutator.mutate(&input, &mut rng).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn high_bytes_survive_mutation() {
        let mut mutator = only(1.0, 0.0, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let input: Vec<u8> = vec![0xFE, b'<', b'a', b'>', 0x80];
        let out: Vec<u8> = mutator.mutate(&input, &mut rng).unwrap();
        assert!(out.contains(&0xFE));
        assert!(out.contains(&0x80));
        assert_eq!(out.len(), input.len() + 3 + 1);
    }

    #[test]
    fn same_seed_same_output() {
        let input: Vec<u8> = b"<html><body><p>hello</p></body></html>".to_vec();
        let run = |seed: u64| {
            let mut mutator = MarkupMutator::new(MutationProbabilities::default()).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut current = input.clone();
            let mut outputs = Vec::new();
            for _ in 0..30 {
                current = mutator.mutate(&current, &mut rng).unwrap();
                outputs.push(current.clone());
            }
            outputs
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let err = MarkupMutator::new(MutationProbabilities {
            insert_tag_p: 1.5,
            ..Default::default()
        })
        .unwrap_err();
        match err {
            MutatorError::InvalidProbability { name, value } => {
                assert_eq!(name, "insert-tag-p");
                assert_eq!(value, 1.5);
            }
            other => panic!("Expected InvalidProbability, got {other:?}"),
        }
        assert!(
            MutationProbabilities {
                add_invalid_char_p: -0.1,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            MutationProbabilities {
                delete_tag_p: f64::NAN,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }
}

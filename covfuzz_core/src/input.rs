/// A fuzz input: an owned byte buffer that can also be viewed as text.
///
/// Text views use ISO-8859-1 (Latin-1), so every byte maps to exactly one
/// character and `from_text(to_text(b)) == b` for any buffer.
pub trait Input: Clone + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;

    fn to_text(&self) -> String {
        latin1_decode(self.as_bytes())
    }
}

impl Input for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}

/// Decodes bytes as Latin-1. Never fails.
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encodes text as Latin-1. Characters above U+00FF become `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

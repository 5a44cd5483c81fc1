use super::{CodegenError, CodegenResult, WordOffset};

/// Size of one emission unit in bytes.
pub const WORD_BYTES: usize = 4;

const MIN_GROWTH_WORDS: usize = 64;

/// Growable buffer of 32-bit instruction words.
///
/// Positions handed out by the buffer are word offsets. They stay valid
/// across growth because no raw address is exposed until the owning
/// program is frozen into executable memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeBuffer {
    words: Vec<u32>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn with_capacity(words: usize) -> CodegenResult<Self> {
        let mut buffer = Self::new();
        buffer
            .words
            .try_reserve_exact(words)
            .map_err(|_| CodegenError::OutOfMemory {
                requested_words: words,
            })?;
        Ok(buffer)
    }

    /// Appends `word` and returns the offset it was written at.
    pub fn emit_word(&mut self, word: u32) -> CodegenResult<WordOffset> {
        let at = WordOffset::from_index(self.words.len())?;
        if self.words.len() == self.words.capacity() {
            self.grow()?;
        }
        self.words.push(word);
        Ok(at)
    }

    pub fn emit_words(&mut self, words: &[u32]) -> CodegenResult<WordOffset> {
        let at = self.position();
        for &word in words {
            self.emit_word(word)?;
        }
        Ok(at)
    }

    pub fn read_word(&self, at: WordOffset) -> CodegenResult<u32> {
        self.words
            .get(at.index())
            .copied()
            .ok_or(CodegenError::OffsetOutOfRange {
                offset: at,
                len_words: self.words.len(),
            })
    }

    pub fn patch_word(&mut self, at: WordOffset, word: u32) -> CodegenResult<()> {
        let len_words = self.words.len();
        let slot = self
            .words
            .get_mut(at.index())
            .ok_or(CodegenError::OffsetOutOfRange {
                offset: at,
                len_words,
            })?;
        *slot = word;
        Ok(())
    }

    /// Offset the next emitted word will land at.
    pub fn position(&self) -> WordOffset {
        WordOffset::new(self.words.len() as u32)
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn capacity_words(&self) -> usize {
        self.words.capacity()
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Little-endian byte image, the layout every backend emits in.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len_bytes());
        for word in &self.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub(crate) fn truncate(&mut self, at: WordOffset) {
        self.words.truncate(at.index());
    }

    fn grow(&mut self) -> CodegenResult<()> {
        let additional = self.words.capacity().max(MIN_GROWTH_WORDS);
        self.words
            .try_reserve_exact(additional)
            .map_err(|_| CodegenError::OutOfMemory {
                requested_words: self.words.capacity().saturating_add(additional),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn emit_returns_consecutive_offsets() {
        let mut buffer = CodeBuffer::new();
        let first = buffer.emit_word(0x1111_1111).expect("emit should succeed");
        let second = buffer.emit_word(0x2222_2222).expect("emit should succeed");
        assert_eq!(first, WordOffset::new(0));
        assert_eq!(second, WordOffset::new(1));
        assert_eq!(buffer.position(), WordOffset::new(2));
        assert_eq!(buffer.len_bytes(), 8);
    }

    #[test]
    fn patch_and_read_outside_written_region_fail() {
        let mut buffer = CodeBuffer::new();
        buffer.emit_word(7).expect("emit should succeed");
        let err = buffer
            .read_word(WordOffset::new(1))
            .expect_err("read past end should fail");
        assert!(matches!(err, CodegenError::OffsetOutOfRange { len_words: 1, .. }));
        assert!(buffer.patch_word(WordOffset::new(3), 9).is_err());
        assert_eq!(buffer.read_word(WordOffset::new(0)).expect("read"), 7);
    }

    #[test]
    fn to_bytes_is_little_endian() {
        let mut buffer = CodeBuffer::new();
        buffer.emit_word(0xE9_90_90_90).expect("emit should succeed");
        assert_eq!(buffer.to_bytes(), vec![0x90, 0x90, 0x90, 0xE9]);
    }

    #[test]
    fn growth_from_small_capacity_keeps_every_word() {
        let mut buffer = CodeBuffer::with_capacity(16).expect("reserve should succeed");
        for value in 0..10_000u32 {
            let at = buffer.emit_word(value).expect("emit should succeed");
            assert_eq!(at.get(), value);
        }
        assert_eq!(buffer.len_words(), 10_000);
        for value in (0..10_000u32).step_by(997) {
            assert_eq!(buffer.read_word(WordOffset::new(value)).expect("read"), value);
        }
    }

    proptest! {
        #[test]
        fn emitted_words_read_back_after_growth(
            words in proptest::collection::vec(any::<u32>(), 0..2048),
            capacity in 0usize..32,
        ) {
            let mut buffer = CodeBuffer::with_capacity(capacity).expect("reserve should succeed");
            let mut offsets = Vec::with_capacity(words.len());
            for &word in &words {
                offsets.push(buffer.emit_word(word).expect("emit should succeed"));
            }
            for (expected, at) in words.iter().zip(offsets) {
                prop_assert_eq!(buffer.read_word(at).expect("read"), *expected);
            }
        }

        #[test]
        fn patch_changes_only_the_target_word(
            len in 1usize..256,
            target in any::<prop::sample::Index>(),
            value in any::<u32>(),
        ) {
            let mut buffer = CodeBuffer::new();
            for index in 0..len {
                buffer.emit_word(index as u32).expect("emit should succeed");
            }
            let at = WordOffset::new(target.index(len) as u32);
            buffer.patch_word(at, value).expect("patch should succeed");
            for index in 0..len {
                let read = buffer.read_word(WordOffset::new(index as u32)).expect("read");
                if index == at.index() {
                    prop_assert_eq!(read, value);
                } else {
                    prop_assert_eq!(read, index as u32);
                }
            }
        }
    }
}

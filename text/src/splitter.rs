//! Incremental sentence segmentation for streamed LLM text.

/// Sentence-ending punctuation, Chinese and ASCII.
const SENTENCE_ENDINGS: [char; 9] = ['。', '！', '？', '；', '…', '.', '!', '?', ';'];

/// Secondary split points used when a sentence runs long.
const COMMA_MARKS: [char; 2] = ['，', ','];

/// Maximum chars before splitting at the last comma.
const MAX_SENTENCE_LENGTH: usize = 50;

/// Minimum chars for an emitted sentence.
const MIN_SENTENCE_LENGTH: usize = 2;

/// Splits a streamed string into sentences.
///
/// Feed text chunks as they arrive; complete sentences are returned as
/// soon as a terminator is reached. Over-long spans are split at the last
/// comma. Concatenating every emitted sentence with the final
/// [`flush`](SentenceSplitter::flush) reconstitutes the input, modulo
/// whitespace trimming.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the sentences completed by it.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut sentences = Vec::new();
        while let Some(sentence) = self.try_extract() {
            sentences.push(sentence);
        }
        sentences
    }

    /// Returns the remaining trimmed buffer, if any, and clears it.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            self.buffer.clear();
            return None;
        }
        let rest = rest.to_string();
        self.buffer.clear();
        Some(rest)
    }

    /// Discards the buffer unconditionally.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn try_extract(&mut self) -> Option<String> {
        let mut last_comma: Option<(usize, usize)> = None; // (char pos, byte end)

        let chars: Vec<(usize, usize, char)> = self
            .buffer
            .char_indices()
            .enumerate()
            .map(|(char_pos, (byte_pos, ch))| (char_pos, byte_pos, ch))
            .collect();

        for (char_pos, byte_pos, ch) in chars {
            let byte_end = byte_pos + ch.len_utf8();

            if COMMA_MARKS.contains(&ch) {
                last_comma = Some((char_pos, byte_end));
            }

            if SENTENCE_ENDINGS.contains(&ch) {
                if let Some(sentence) = self.cut(byte_end) {
                    return Some(sentence);
                }
            }

            // Over-long span: fall back to the last comma seen.
            if char_pos >= MAX_SENTENCE_LENGTH {
                if let Some((comma_pos, comma_end)) = last_comma {
                    if comma_pos > 0 {
                        if let Some(sentence) = self.cut(comma_end) {
                            return Some(sentence);
                        }
                    }
                }
            }
        }

        None
    }

    /// Cuts the buffer at `byte_end` if the prefix is long enough.
    fn cut(&mut self, byte_end: usize) -> Option<String> {
        let sentence = self.buffer[..byte_end].trim();
        if sentence.chars().count() < MIN_SENTENCE_LENGTH {
            return None;
        }
        let sentence = sentence.to_string();
        self.buffer.drain(..byte_end);
        Some(sentence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_sentences_across_chunks() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.feed("你好").is_empty());
        assert_eq!(splitter.feed("！我"), vec!["你好！"]);
        assert_eq!(splitter.feed("是小马。"), vec!["我是小马。"]);
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn multiple_sentences_in_one_chunk() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(
            splitter.feed("今天天气不错。我们出去走走吧！好吗？"),
            vec!["今天天气不错。", "我们出去走走吧！", "好吗？"]
        );
    }

    #[test]
    fn short_sentences_are_held_back() {
        let mut splitter = SentenceSplitter::new();
        // A lone terminator is below the minimum length.
        assert!(splitter.feed("。").is_empty());
        assert_eq!(splitter.feed("好。"), vec!["。好。"]);
    }

    #[test]
    fn long_span_splits_at_comma() {
        let mut splitter = SentenceSplitter::new();
        let head = "啊".repeat(30);
        let tail = "哦".repeat(30);
        let sentences = splitter.feed(&format!("{}，{}", head, tail));
        assert_eq!(sentences, vec![format!("{}，", head)]);
        assert_eq!(splitter.flush(), Some(tail));
    }

    #[test]
    fn long_span_without_comma_waits() {
        let mut splitter = SentenceSplitter::new();
        let text = "啊".repeat(80);
        assert!(splitter.feed(&text).is_empty());
        assert_eq!(splitter.flush(), Some(text));
    }

    #[test]
    fn english_punctuation() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(
            splitter.feed("Hello there. How are you?"),
            vec!["Hello there.", "How are you?"]
        );
    }

    #[test]
    fn flush_trims_whitespace() {
        let mut splitter = SentenceSplitter::new();
        splitter.feed("还没说完  ");
        assert_eq!(splitter.flush(), Some("还没说完".to_string()));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn reset_discards_buffer() {
        let mut splitter = SentenceSplitter::new();
        splitter.feed("半句话");
        splitter.reset();
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn reconstruction_property() {
        let input = "我明白你的感受，这确实不容易。慢慢来，我会陪着你！有什么想聊的，随时告诉我；别客气。最后没有结尾";
        let mut splitter = SentenceSplitter::new();

        let mut collected = String::new();
        // Feed in small chunks to exercise buffering.
        let chars: Vec<char> = input.chars().collect();
        for chunk in chars.chunks(3) {
            let chunk: String = chunk.iter().collect();
            for sentence in splitter.feed(&chunk) {
                collected.push_str(&sentence);
            }
        }
        if let Some(rest) = splitter.flush() {
            collected.push_str(&rest);
        }

        assert_eq!(collected, input);
    }
}

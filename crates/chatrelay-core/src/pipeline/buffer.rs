//! Output accumulation for one generation.

use chatrelay_types::llm::Chunk;

const REASONING_OPEN: &str = "<think>\n";
const REASONING_CLOSE: &str = "\n</think>\n\n";

/// Accumulates model chunks into the final text.
///
/// Reasoning deltas are wrapped in a `<think>` block so that clients reading
/// the replay log can tell them apart from the answer. Each write returns the
/// exact text it appended, which is what gets reported as progress; the
/// concatenation of all deltas is the buffer's contents.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
    in_reasoning: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns the text delta, empty if the chunk carried
    /// nothing visible.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> String {
        let mut delta = String::new();

        if let Some(reasoning) = chunk.reasoning.as_deref().filter(|r| !r.is_empty()) {
            if !self.in_reasoning {
                delta.push_str(REASONING_OPEN);
                self.in_reasoning = true;
            }
            delta.push_str(reasoning);
        }

        if !chunk.content.is_empty() {
            if self.in_reasoning {
                delta.push_str(REASONING_CLOSE);
                self.in_reasoning = false;
            }
            delta.push_str(&chunk.content);
        }

        self.text.push_str(&delta);
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// The accumulated text, or `default` if nothing visible was produced.
    /// An unterminated reasoning block is closed.
    pub fn read_with_default(&self, default: &str) -> String {
        if self.is_empty() {
            return default.to_string();
        }
        let mut out = self.text.clone();
        if self.in_reasoning {
            out.push_str(REASONING_CLOSE.trim_end());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasoning(text: &str) -> Chunk {
        Chunk {
            content: String::new(),
            reasoning: Some(text.to_string()),
        }
    }

    #[test]
    fn test_plain_chunks_concatenate() {
        let mut buffer = OutputBuffer::new();
        assert_eq!(buffer.write_chunk(&Chunk::text("Hel")), "Hel");
        assert_eq!(buffer.write_chunk(&Chunk::text("lo")), "lo");
        assert_eq!(buffer.read_with_default("Empty response"), "Hello");
    }

    #[test]
    fn test_empty_buffer_uses_default() {
        let mut buffer = OutputBuffer::new();
        assert_eq!(buffer.write_chunk(&Chunk::text("")), "");
        assert_eq!(buffer.read_with_default("Empty response"), "Empty response");
    }

    #[test]
    fn test_reasoning_is_wrapped() {
        let mut buffer = OutputBuffer::new();
        let mut deltas = String::new();
        deltas.push_str(&buffer.write_chunk(&reasoning("hmm")));
        deltas.push_str(&buffer.write_chunk(&reasoning("...")));
        deltas.push_str(&buffer.write_chunk(&Chunk::text("Answer")));

        assert_eq!(deltas, "<think>\nhmm...\n</think>\n\nAnswer");
        assert_eq!(buffer.read_with_default(""), deltas);
    }

    #[test]
    fn test_unterminated_reasoning_is_closed_on_read() {
        let mut buffer = OutputBuffer::new();
        buffer.write_chunk(&reasoning("thinking"));
        assert_eq!(
            buffer.read_with_default("Empty response"),
            "<think>\nthinking\n</think>"
        );
    }
}

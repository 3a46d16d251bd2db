use serde::{Deserialize, Serialize};

/// One bounded window of input text. Offsets are byte positions into the
/// original (untrimmed) input; `text` is the trimmed slice content.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Hard cut at `chunk_size` chars; the next chunk starts in the overlap
    /// region, backed up to the nearest whitespace or sentence terminator.
    Fixed,
    /// Accumulate whole sentences; overlap is the tail sentences fitting in
    /// `chunk_overlap`.
    Sentence,
    /// Join paragraphs (blank-line separated) up to the size bound.
    Paragraph,
    /// Reserved for topic-boundary splitting; currently sentence-equivalent.
    Semantic,
}

/// Splits long text into overlapping chunks for embedding. Sizes are measured
/// in chars; emitted offsets are byte positions. Chunking never materializes
/// more than one chunk at a time.
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    strategy: ChunkStrategy,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, strategy: ChunkStrategy) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            strategy,
        }
    }

    /// Lazy, finite, non-empty chunk sequence over `text`.
    /// Input no longer than `chunk_size` yields exactly one chunk holding the
    /// trimmed input.
    pub fn chunk<'a>(&self, text: &'a str) -> ChunkStream<'a> {
        let char_count = text.trim().chars().count();
        let state = if char_count <= self.chunk_size {
            StreamState::Single { emitted: false }
        } else {
            match self.strategy {
                ChunkStrategy::Fixed => StreamState::Fixed { pos: 0 },
                ChunkStrategy::Sentence | ChunkStrategy::Semantic => StreamState::Segmented {
                    segments: sentence_segments(text),
                    next_seg: 0,
                },
                ChunkStrategy::Paragraph => StreamState::Segmented {
                    segments: paragraph_segments(text),
                    next_seg: 0,
                },
            }
        };

        ChunkStream {
            text,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            index: 0,
            state,
        }
    }

    /// Convenience for callers that want the whole sequence at once.
    pub fn chunk_all(&self, text: &str) -> Vec<Chunk> {
        self.chunk(text).collect()
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(500, 50, ChunkStrategy::Fixed)
    }
}

enum StreamState {
    Single { emitted: bool },
    Fixed { pos: usize },
    Segmented {
        /// Byte ranges of sentences or paragraphs, in order.
        segments: Vec<(usize, usize)>,
        next_seg: usize,
    },
}

pub struct ChunkStream<'a> {
    text: &'a str,
    chunk_size: usize,
    chunk_overlap: usize,
    index: usize,
    state: StreamState,
}

impl<'a> ChunkStream<'a> {
    fn make_chunk(&mut self, start: usize, end: usize) -> Chunk {
        let chunk = Chunk {
            text: self.text[start..end].trim().to_string(),
            index: self.index,
            start_offset: start,
            end_offset: end,
        };
        self.index += 1;
        chunk
    }

    fn next_fixed(&mut self, pos: usize) -> Option<Chunk> {
        if pos >= self.text.len() {
            return None;
        }
        let end = advance_chars(self.text, pos, self.chunk_size);
        let chunk = self.make_chunk(pos, end);

        let next_pos = if end >= self.text.len() {
            self.text.len()
        } else {
            let overlap_start = retreat_chars(self.text, end, self.chunk_overlap).max(pos);
            let split = find_split_point(self.text, overlap_start, end);
            if split > pos {
                split
            } else {
                end
            }
        };
        self.state = StreamState::Fixed { pos: next_pos };
        Some(chunk)
    }

    fn next_segmented(&mut self) -> Option<Chunk> {
        let (segments, start_seg) = match &self.state {
            StreamState::Segmented { segments, next_seg } => (segments.clone(), *next_seg),
            _ => return None,
        };
        if start_seg >= segments.len() {
            return None;
        }

        // Take the first segment unconditionally, then extend while the char
        // budget holds. An oversized single segment is emitted alone.
        let mut last = start_seg;
        let mut total = seg_chars(self.text, segments[start_seg]);
        while last + 1 < segments.len() {
            let next_len = seg_chars(self.text, segments[last + 1]);
            if total + next_len > self.chunk_size {
                break;
            }
            total += next_len;
            last += 1;
        }

        let chunk = self.make_chunk(segments[start_seg].0, segments[last].1);

        let next_seg = if last + 1 >= segments.len() {
            segments.len()
        } else {
            // Overlap: back up over tail segments that fit the overlap budget.
            let mut carry_start = last + 1;
            let mut carried = 0usize;
            let mut k = last;
            while k > start_seg {
                let len = seg_chars(self.text, segments[k]);
                if carried + len > self.chunk_overlap {
                    break;
                }
                carried += len;
                carry_start = k;
                if k == 0 {
                    break;
                }
                k -= 1;
            }
            carry_start
        };
        self.state = StreamState::Segmented {
            segments,
            next_seg,
        };
        Some(chunk)
    }
}

impl<'a> Iterator for ChunkStream<'a> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        match &mut self.state {
            StreamState::Single { emitted } => {
                if *emitted {
                    return None;
                }
                *emitted = true;
                let trimmed = self.text.trim();
                let start = trimmed.as_ptr() as usize - self.text.as_ptr() as usize;
                Some(Chunk {
                    text: trimmed.to_string(),
                    index: 0,
                    start_offset: start,
                    end_offset: start + trimmed.len(),
                })
            }
            StreamState::Fixed { pos } => {
                let pos = *pos;
                self.next_fixed(pos)
            }
            StreamState::Segmented { .. } => self.next_segmented(),
        }
    }
}

fn seg_chars(text: &str, (start, end): (usize, usize)) -> usize {
    text[start..end].chars().count()
}

/// Byte position `count` chars forward of `from` (clamped to text length).
fn advance_chars(text: &str, from: usize, count: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(count)
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// Byte position `count` chars backward of `from` (clamped to 0).
fn retreat_chars(text: &str, from: usize, count: usize) -> usize {
    let mut positions: Vec<usize> = Vec::with_capacity(count);
    for (i, _) in text[..from].char_indices().rev().take(count) {
        positions.push(i);
    }
    positions.last().copied().unwrap_or(from)
}

/// Last whitespace or sentence terminator in [start, end), returning the byte
/// position just past it (and past one trailing space, so the next chunk does
/// not open with whitespace). Falls back to `end` when no boundary exists.
fn find_split_point(text: &str, start: usize, end: usize) -> usize {
    let region = &text[start..end];
    let mut split = None;
    for (i, c) in region.char_indices() {
        if matches!(c, '\n' | '\r' | '.' | '!' | '?' | ' ') {
            split = Some(start + i + c.len_utf8());
        }
    }
    let mut pos = match split {
        Some(p) => p,
        None => return end,
    };
    if let Some(c) = text[pos..end].chars().next() {
        if c == ' ' || c == '\n' || c == '\r' {
            pos += c.len_utf8();
        }
    }
    pos
}

/// Sentence byte ranges: runs of non-terminator chars plus their terminator
/// run. Trailing text without a terminator forms a final segment, so every
/// non-whitespace char lands in some segment.
fn sentence_segments(text: &str) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut seg_start: Option<usize> = None;
    let mut in_terminator = false;

    for (i, c) in text.char_indices() {
        let is_terminator = matches!(c, '.' | '!' | '?' | '\n');
        match (seg_start, in_terminator, is_terminator) {
            (None, _, _) => {
                if !c.is_whitespace() || is_terminator {
                    seg_start = Some(i);
                    in_terminator = is_terminator;
                }
            }
            (Some(_), false, true) => in_terminator = true,
            (Some(start), true, false) => {
                segments.push((start, i));
                seg_start = if c.is_whitespace() { None } else { Some(i) };
                in_terminator = false;
            }
            _ => {}
        }
    }
    if let Some(start) = seg_start {
        segments.push((start, text.len()));
    }
    segments
}

/// Paragraph byte ranges: maximal runs of non-blank lines.
fn paragraph_segments(text: &str) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut para_start: Option<usize> = None;
    let mut line_start = 0;

    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        if line.trim().is_empty() {
            if let Some(start) = para_start.take() {
                segments.push((start, line_start));
            }
        } else if para_start.is_none() {
            para_start = Some(line_start);
        }
        line_start = line_end;
    }
    if let Some(start) = para_start {
        segments.push((start, text.len()));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn korean_filler(chars: usize) -> String {
        // Sentences of 10 chars each ("가나다라마바사아자. ") to give the
        // splitter realistic boundaries.
        let sentence = "가나다라마바사아. ";
        let sentence_chars = sentence.chars().count();
        let mut out = String::new();
        while out.chars().count() + sentence_chars <= chars {
            out.push_str(sentence);
        }
        while out.chars().count() < chars {
            out.push('가');
        }
        out
    }

    #[test]
    fn short_input_single_chunk() {
        let chunker = TextChunker::new(500, 50, ChunkStrategy::Fixed);
        let chunks: Vec<_> = chunker.chunk("  삼성전자 주가가 급등했다.  ").collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "삼성전자 주가가 급등했다.");
    }

    #[test]
    fn fixed_chunks_respect_size_and_indices() {
        let text = korean_filler(1500);
        let chunker = TextChunker::new(500, 50, ChunkStrategy::Fixed);
        let chunks: Vec<_> = chunker.chunk(&text).collect();

        assert!(
            chunks.len() == 3 || chunks.len() == 4,
            "expected 3 or 4 chunks, got {}",
            chunks.len()
        );
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(chunk.text.chars().count() <= 500);
        }
    }

    #[test]
    fn fixed_chunks_cover_all_content() {
        let text = korean_filler(1234);
        let chunker = TextChunker::new(300, 40, ChunkStrategy::Fixed);
        let chunks: Vec<_> = chunker.chunk(&text).collect();

        let mut covered = vec![false; text.len()];
        for chunk in &chunks {
            for flag in &mut covered[chunk.start_offset..chunk.end_offset] {
                *flag = true;
            }
        }
        for (i, c) in text.char_indices() {
            if !c.is_whitespace() {
                assert!(covered[i], "byte {} ({:?}) not covered", i, c);
            }
        }
    }

    #[test]
    fn sentence_strategy_keeps_sentences_whole() {
        let text = "첫 문장이다. 둘째 문장이다! 셋째 문장인가? 넷째 문장이다.\n다섯째 문장이다. 여섯째 문장이다."
            .repeat(4);
        let chunker = TextChunker::new(60, 20, ChunkStrategy::Sentence);
        let chunks: Vec<_> = chunker.chunk(&text).collect();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Every chunk ends at a sentence boundary or the text end.
            let last = chunk.text.chars().last().unwrap();
            assert!(
                matches!(last, '.' | '!' | '?') || chunk.end_offset == text.len(),
                "chunk ended mid-sentence: {:?}",
                chunk.text
            );
        }
    }

    #[test]
    fn paragraph_strategy_splits_on_blank_lines() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            korean_filler(80),
            korean_filler(80),
            korean_filler(80)
        );
        let chunker = TextChunker::new(100, 20, ChunkStrategy::Paragraph);
        let chunks: Vec<_> = chunker.chunk(&text).collect();
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(!chunk.text.contains("\n\n"));
        }
    }

    #[test]
    fn semantic_matches_sentence_for_now() {
        let text = korean_filler(900);
        let sentence = TextChunker::new(200, 30, ChunkStrategy::Sentence);
        let semantic = TextChunker::new(200, 30, ChunkStrategy::Semantic);
        let a: Vec<_> = sentence.chunk(&text).collect();
        let b: Vec<_> = semantic.chunk(&text).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_emits_one_empty_chunk() {
        let chunker = TextChunker::default();
        let chunks: Vec<_> = chunker.chunk("   ").collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn chunk_indices_are_dense() {
        let text = korean_filler(2000);
        for strategy in [
            ChunkStrategy::Fixed,
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
        ] {
            let chunker = TextChunker::new(400, 50, strategy);
            let chunks: Vec<_> = chunker.chunk(&text).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i);
            }
        }
    }
}

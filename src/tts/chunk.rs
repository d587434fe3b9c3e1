//! Text chunking for incremental TTS synthesis.

/// Split text into chunks of at most `max_len` characters.
///
/// Sentence punctuation (`.`, `!`, `?` followed by whitespace) and newlines
/// are preferred boundaries; adjacent sentences are packed together while
/// they fit. A sentence longer than `max_len` is word-wrapped, and a single
/// word longer than `max_len` becomes its own chunk.
pub fn split_into_chunks(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for segment in sentence_segments(text) {
        let seg_len = segment.chars().count();

        if seg_len > max_len {
            flush(&mut chunks, &mut current, &mut current_len);
            let mut lines = wrap_words(&segment, max_len);
            // Keep the tail open so a following short sentence can join it.
            if let Some(last) = lines.pop() {
                chunks.extend(lines);
                current_len = last.chars().count();
                current = last;
            }
            continue;
        }

        if current.is_empty() {
            current = segment;
            current_len = seg_len;
        } else if current_len + 1 + seg_len <= max_len {
            current.push(' ');
            current.push_str(&segment);
            current_len += 1 + seg_len;
        } else {
            flush(&mut chunks, &mut current, &mut current_len);
            current = segment;
            current_len = seg_len;
        }
    }

    flush(&mut chunks, &mut current, &mut current_len);
    chunks
}

fn flush(chunks: &mut Vec<String>, current: &mut String, current_len: &mut usize) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
    *current_len = 0;
}

/// Break text at sentence ends and newlines; whitespace inside each segment
/// is collapsed and empty segments are dropped.
fn sentence_segments(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            push_segment(&mut segments, &mut current);
            continue;
        }
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary {
            push_segment(&mut segments, &mut current);
        }
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let normalized = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        segments.push(normalized);
    }
    current.clear();
}

/// Greedy word wrap. Words longer than `max_len` are emitted alone.
fn wrap_words(segment: &str, max_len: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut line_len = 0;

    for word in segment.split_whitespace() {
        let word_len = word.chars().count();
        if line.is_empty() {
            line.push_str(word);
            line_len = word_len;
        } else if line_len + 1 + word_len <= max_len {
            line.push(' ');
            line.push_str(word);
            line_len += 1 + word_len;
        } else {
            lines.push(std::mem::take(&mut line));
            line.push_str(word);
            line_len = word_len;
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

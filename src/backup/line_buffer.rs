use bytes::BytesMut;

/// A piece of decoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A complete line, everything before a `\n`.
    Line(String),
    /// Text ended by a `\r` inside a line that is still open. rsync redraws
    /// its progress this way, so these feed progress but are not lines.
    Redraw(String),
}

/// Splits a byte stream into lossily decoded lines on `\n`.
///
/// An unterminated fragment is held until more data arrives or the stream is
/// flushed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
    // Bytes of `pending` already searched for terminators
    scanned: usize,
    // Start of the current `\r` segment within `pending`
    segment_start: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the segments it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Segment> {
        self.pending.extend_from_slice(chunk);

        let mut segments = Vec::new();
        while let Some(offset) = self.pending[self.scanned..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
        {
            let pos = self.scanned + offset;
            if self.pending[pos] == b'\r' {
                if pos > self.segment_start {
                    segments.push(Segment::Redraw(decode(
                        &self.pending[self.segment_start..pos],
                    )));
                }
                self.segment_start = pos + 1;
                self.scanned = pos + 1;
            } else {
                let line = self.pending.split_to(pos + 1);
                segments.push(Segment::Line(decode(&line[..pos])));
                self.scanned = 0;
                self.segment_start = 0;
            }
        }
        self.scanned = self.pending.len();
        segments
    }

    /// Take the unterminated remainder, if any.
    pub fn flush(&mut self) -> Option<String> {
        self.scanned = 0;
        self.segment_start = 0;
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        Some(decode(&rest))
    }
}

/// The text after the last `\r` of a line, i.e. what a terminal would show.
pub fn last_redraw(line: &str) -> &str {
    line.rsplit('\r').next().unwrap_or(line)
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Segment {
        Segment::Line(text.to_string())
    }

    fn redraw(text: &str) -> Segment {
        Segment::Redraw(text.to_string())
    }

    #[test]
    fn holds_fragments_until_completed() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"sending incr").is_empty());
        assert_eq!(
            buf.push(b"emental file list\nfoo/"),
            vec![line("sending incremental file list")]
        );
        assert_eq!(buf.push(b"bar.txt\n"), vec![line("foo/bar.txt")]);
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn flush_returns_unterminated_tail() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"a\nb to-chk=1/2"), vec![line("a")]);
        assert_eq!(buf.flush(), Some("b to-chk=1/2".to_string()));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn only_newline_ends_a_line() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"foo\rbar\n"), vec![redraw("foo"), line("foo\rbar")]);

        // A fragment ending in a carriage return is still held
        assert_eq!(buf.push(b"abc\r"), vec![redraw("abc")]);
        assert_eq!(buf.push(b"def\r\n"), vec![redraw("def"), line("abc\rdef\r")]);
    }

    #[test]
    fn progress_redraws_arrive_before_the_line() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"  1,024  10%\r  2,0"), vec![redraw("  1,024  10%")]);
        assert_eq!(
            buf.push(b"48  20%\r  4,096 100%\n"),
            vec![
                redraw("  2,048  20%"),
                line("  1,024  10%\r  2,048  20%\r  4,096 100%"),
            ]
        );
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn last_redraw_is_the_visible_text() {
        assert_eq!(last_redraw("  10%\r  55%\r 100%"), " 100%");
        assert_eq!(last_redraw("plain"), "plain");
        assert_eq!(last_redraw("trailing\r"), "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"caf\xff\n"), vec![line("caf\u{FFFD}")]);
    }
}

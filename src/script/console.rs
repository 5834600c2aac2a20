use std::collections::VecDeque;

/// Upper bound on retained console lines. The UI is expected to keep its
/// own scrollback; this buffer only serves incremental polling.
const CONSOLE_MAX_LINES: usize = 2000;

/// Append-only buffer of backend output lines with monotonically
/// increasing sequence numbers, so a UI console view can poll for
/// everything after its last-seen cursor.
#[derive(Debug)]
pub struct ConsoleBuffer {
    next_seq: u64,
    lines: VecDeque<(u64, String)>,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self {
            next_seq: 1,
            lines: VecDeque::new(),
        }
    }
}

impl ConsoleBuffer {
    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > CONSOLE_MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines newer than `cursor`, up to `limit`, plus the new cursor.
    /// A zero cursor returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_from_zero_returns_most_recent_lines() {
        let mut buf = ConsoleBuffer::default();
        for i in 0..5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, cursor) = buf.tail_after(0, 2);
        assert_eq!(lines, vec!["line 3", "line 4"]);
        assert_eq!(cursor, 5);
    }

    #[test]
    fn tail_after_cursor_returns_only_newer_lines() {
        let mut buf = ConsoleBuffer::default();
        buf.push_line("a".into());
        buf.push_line("b".into());
        let (_, cursor) = buf.tail_after(0, 10);

        buf.push_line("c".into());
        let (lines, new_cursor) = buf.tail_after(cursor, 10);
        assert_eq!(lines, vec!["c"]);
        assert_eq!(new_cursor, 3);

        let (lines, _) = buf.tail_after(new_cursor, 10);
        assert!(lines.is_empty());
    }

    #[test]
    fn buffer_is_capped() {
        let mut buf = ConsoleBuffer::default();
        for i in 0..(CONSOLE_MAX_LINES + 10) {
            buf.push_line(format!("{i}"));
        }
        assert_eq!(buf.len(), CONSOLE_MAX_LINES);
        // Sequence numbers keep counting past the cap.
        let (lines, _) = buf.tail_after(0, 1);
        assert_eq!(lines, vec![format!("{}", CONSOLE_MAX_LINES + 9)]);
    }
}

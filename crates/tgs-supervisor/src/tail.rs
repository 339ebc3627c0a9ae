use std::collections::VecDeque;

const TAIL_MAX_BYTES: usize = 16 * 1024;
const TAIL_MAX_LINES: usize = 200;

/// Bounded tail of worker output, newest last.
#[derive(Clone, Debug, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl OutputTail {
    pub fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > TAIL_MAX_LINES || self.bytes > TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    /// The last `limit` lines (all retained lines when `None`).
    pub fn lines(&self, limit: Option<usize>) -> Vec<String> {
        let skip = limit.map_or(0, |n| self.lines.len().saturating_sub(n));
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> String {
        self.lines(None).join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

//! Partial-line reassembly for the inbound serial stream.

use std::collections::VecDeque;

/// How many completed lines are retained for diagnostics.
const DEFAULT_WINDOW: usize = 100;

/// Reassembles newline-delimited lines from arbitrarily chunked reads.
///
/// The raw stream is not newline-aligned: a read may end mid-line and the
/// next read continues it. The assembler buffers the trailing fragment,
/// splits completed lines on `\n`, and keeps a bounded trailing window of
/// recent lines; older lines are discarded, not processed further.
#[derive(Debug)]
pub struct LineAssembler {
    partial: String,
    window: VecDeque<String>,
    capacity: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(capacity: usize) -> Self {
        Self {
            partial: String::new(),
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed one raw chunk; returns the lines it completed, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut completed = Vec::new();
        let mut rest = chunk;

        while let Some(idx) = rest.find('\n') {
            self.partial.push_str(&rest[..idx]);
            let line = std::mem::take(&mut self.partial);
            self.window.push_back(line.clone());
            if self.window.len() > self.capacity {
                self.window.pop_front();
            }
            completed.push(line);
            rest = &rest[idx + 1..];
        }

        self.partial.push_str(rest);
        completed
    }

    /// The in-progress fragment awaiting its newline.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// The retained trailing window of completed lines, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.window.iter().map(String::as_str)
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembles_split_line() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.push("FIRMWARE_NAME:Marl").is_empty());
        assert_eq!(assembler.partial(), "FIRMWARE_NAME:Marl");

        let lines = assembler.push("in SOURCE_CODE_URL:https://example.invalid\n");
        assert_eq!(
            lines,
            vec!["FIRMWARE_NAME:Marlin SOURCE_CODE_URL:https://example.invalid"]
        );
        assert_eq!(assembler.partial(), "");
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.push("ok\nok\necho:busy");
        assert_eq!(lines, vec!["ok", "ok"]);
        assert_eq!(assembler.partial(), "echo:busy");

        let lines = assembler.push(" processing\n");
        assert_eq!(lines, vec!["echo:busy processing"]);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut assembler = LineAssembler::with_window(3);
        for i in 0..10 {
            assembler.push(&format!("line-{i}\n"));
        }
        let recent: Vec<&str> = assembler.recent().collect();
        assert_eq!(recent, vec!["line-7", "line-8", "line-9"]);
    }
}

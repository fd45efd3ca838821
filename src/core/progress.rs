//! Incremental parser for the cloning tool's merged stdout/stderr stream.
//!
//! The tool prints progress as dots and percentages, often without a newline
//! for minutes at a time:
//!
//! ```text
//! Restoring /dev/sdb from file: golden.img
//! ......10%......20%......
//! ```
//!
//! The parser is therefore fed raw bytes as they arrive. Log lines are cut at
//! `\n`; percentage markers are recognised as soon as their `%` arrives, even
//! in the middle of an unterminated line.

use std::sync::LazyLock;

use regex::bytes::Regex;

/// A run of one to three digits immediately followed by `%`.
static PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]{1,3})%").expect("percent pattern is valid")
});

/// Longest digit run that can still become part of a future match.
const MAX_DIGITS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Progress(u8),
    Log(String),
}

#[derive(Debug, Default)]
pub struct ProgressParser {
    /// Bytes since the last newline.
    line: Vec<u8>,
    /// Bytes since the last consumed percentage marker.
    scan: Vec<u8>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning events in stream order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for &b in bytes {
            self.push(b, &mut events);
        }
        events
    }

    /// Flush whatever partial line remains once the stream has closed.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        self.scan.clear();
        Self::take_line(&mut self.line)
    }

    fn push(&mut self, b: u8, events: &mut Vec<StreamEvent>) {
        self.scan.push(b);

        if b == b'\n' {
            if let Some(line) = Self::take_line(&mut self.line) {
                events.push(line);
            }
        } else {
            self.line.push(b);
        }

        if let Some(m) = PERCENT.captures(&self.scan) {
            let whole = m.get(0).map_or(self.scan.len(), |w| w.end());
            let pct = m
                .get(1)
                .and_then(|d| std::str::from_utf8(d.as_bytes()).ok())
                .and_then(|d| d.parse::<u16>().ok())
                .unwrap_or(0)
                .min(100) as u8;
            events.push(StreamEvent::Progress(pct));
            self.scan.drain(..whole);
        } else if self.scan.len() > MAX_DIGITS {
            // Only the trailing digits can start a future match.
            let keep_from = self.scan.len() - MAX_DIGITS;
            self.scan.drain(..keep_from);
        }
    }

    fn take_line(line: &mut Vec<u8>) -> Option<StreamEvent> {
        let text = String::from_utf8_lossy(line).trim().to_string();
        line.clear();
        if text.is_empty() {
            None
        } else {
            Some(StreamEvent::Log(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(events: &[StreamEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn logs(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Log(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_percentages_inside_dots() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"....10%....20%....");
        assert_eq!(progress(&events), vec![10, 20]);
        assert!(logs(&events).is_empty());
    }

    #[test]
    fn test_repeated_marker_without_newline() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"5%5%");
        assert_eq!(progress(&events), vec![5, 5]);
    }

    #[test]
    fn test_marker_split_across_feeds() {
        let mut parser = ProgressParser::new();
        let mut events = parser.feed(b"...4");
        events.extend(parser.feed(b"2"));
        assert!(progress(&events).is_empty());
        events.extend(parser.feed(b"%..."));
        assert_eq!(progress(&events), vec![42]);
    }

    #[test]
    fn test_marker_is_not_reemitted() {
        let mut parser = ProgressParser::new();
        let mut events = parser.feed(b"..10%");
        events.extend(parser.feed(b"......"));
        events.extend(parser.feed(b"\n"));
        assert_eq!(progress(&events), vec![10]);
        assert_eq!(logs(&events), vec!["..10%......".to_string()]);
    }

    #[test]
    fn test_clamps_to_hundred() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"999%");
        assert_eq!(progress(&events), vec![100]);
    }

    #[test]
    fn test_four_digit_run_uses_trailing_three() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"1050%");
        assert_eq!(progress(&events), vec![50]);
    }

    #[test]
    fn test_line_flush_keeps_partial_line() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"abc\ndef");
        assert_eq!(logs(&events), vec!["abc".to_string()]);
        assert_eq!(parser.finish(), Some(StreamEvent::Log("def".to_string())));
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn test_partial_line_flushed_by_later_newline() {
        let mut parser = ProgressParser::new();
        let mut events = parser.feed(b"abc\ndef");
        events.extend(parser.feed(b"ghi\n"));
        assert_eq!(logs(&events), vec!["abc".to_string(), "defghi".to_string()]);
    }

    #[test]
    fn test_lines_are_trimmed_and_blank_lines_skipped() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"  Restoring image  \r\n\n\r\nDone\n");
        assert_eq!(
            logs(&events),
            vec!["Restoring image".to_string(), "Done".to_string()]
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"bad \xff byte\n");
        assert_eq!(logs(&events), vec!["bad \u{FFFD} byte".to_string()]);
    }

    #[test]
    fn test_percent_without_digits_is_ignored() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"100 % done, 7%\n");
        assert_eq!(progress(&events), vec![7]);
    }

    #[test]
    fn test_events_preserve_stream_order() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"start\n..50%\nend\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::Log("start".to_string()),
                StreamEvent::Progress(50),
                StreamEvent::Log("..50%".to_string()),
                StreamEvent::Log("end".to_string()),
            ]
        );
    }
}

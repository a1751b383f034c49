use aho_corasick::AhoCorasick;
use std::sync::LazyLock;

pub const MARKER_PREFIX: &str = "[PROGRESS:";
const MARKER_SUFFIX: u8 = b']';
/// Significant digits kept for an unfinished marker; four already exceed the clamp.
const SATURATING_DIGITS: usize = 4;
pub const MAX_PROGRESS: u8 = 100;

static MARKER_FINDER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new([MARKER_PREFIX]).expect("marker prefix is a valid literal pattern")
});

#[derive(Debug, PartialEq, Eq)]
enum MarkerTail {
    Complete { value: u8, len: usize },
    Incomplete,
    Malformed,
}

/// Finds `[PROGRESS:<digits>]` markers in a text stream.
///
/// Scanning is read-only: callers keep the text as received and only consume
/// the progress values. A marker split across fragments is detected because
/// the extractor carries the unfinished tail of the previous fragment, which
/// is never longer than one marker.
#[derive(Debug, Default)]
pub struct MarkerExtractor {
    carry: String,
}

impl MarkerExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans a newly decoded fragment and returns every progress value it
    /// completes, in stream order.
    pub fn scan(&mut self, fragment: &str) -> Vec<u8> {
        if fragment.is_empty() {
            return Vec::new();
        }
        self.carry.push_str(fragment);

        let mut updates = Vec::new();
        let mut pos = 0;
        let mut unfinished_at = None;

        while let Some(found) = MARKER_FINDER.find(&self.carry[pos..]) {
            let start = pos + found.start();
            let digits_start = pos + found.end();
            match parse_marker_tail(&self.carry[digits_start..]) {
                MarkerTail::Complete { value, len } => {
                    updates.push(value);
                    pos = digits_start + len;
                }
                MarkerTail::Incomplete => {
                    unfinished_at = Some(start);
                    break;
                }
                MarkerTail::Malformed => {
                    tracing::debug!(offset = start, "ignoring malformed progress marker");
                    pos = digits_start;
                }
            }
        }

        let keep_from = unfinished_at.unwrap_or_else(|| {
            let keep = partial_prefix_len(&self.carry[pos..]);
            self.carry.len() - keep
        });
        self.carry.drain(..keep_from);
        if unfinished_at.is_some() {
            self.compact_pending_digits();
        }

        updates
    }

    /// Shortens the digit run of a carried marker without changing the value
    /// it will clamp to: leading zeros go, and past four significant digits
    /// the rest cannot matter.
    fn compact_pending_digits(&mut self) {
        let Some(digits) = self.carry.strip_prefix(MARKER_PREFIX) else {
            return;
        };
        if digits.len() <= SATURATING_DIGITS {
            return;
        }
        let significant = digits.trim_start_matches('0');
        let kept = if significant.is_empty() {
            "0"
        } else {
            &significant[..significant.len().min(SATURATING_DIGITS)]
        };
        self.carry = format!("{MARKER_PREFIX}{kept}");
    }

    /// Bytes held back because they may start a marker.
    pub fn carried_len(&self) -> usize {
        self.carry.len()
    }
}

/// Scans a complete text in one pass.
pub fn scan_markers(text: &str) -> Vec<u8> {
    MarkerExtractor::new().scan(text)
}

fn parse_marker_tail(tail: &str) -> MarkerTail {
    let bytes = tail.as_bytes();
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();

    match bytes.get(digits) {
        None => MarkerTail::Incomplete,
        Some(&MARKER_SUFFIX) if digits > 0 => MarkerTail::Complete {
            value: clamp_digits(&tail[..digits]),
            len: digits + 1,
        },
        Some(_) => MarkerTail::Malformed,
    }
}

fn clamp_digits(digits: &str) -> u8 {
    let significant = digits.trim_start_matches('0');
    if significant.len() >= SATURATING_DIGITS {
        return MAX_PROGRESS;
    }
    significant
        .parse::<u16>()
        .map_or(0, |raw| raw.min(u16::from(MAX_PROGRESS)) as u8)
}

/// Length of the longest suffix of `text` that is a proper prefix of the marker.
fn partial_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    (1..MARKER_PREFIX.len())
        .rev()
        .find(|&len| bytes.ends_with(&MARKER_PREFIX.as_bytes()[..len]))
        .unwrap_or(0)
}

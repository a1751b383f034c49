const REPLACEMENT: char = '\u{FFFD}';
const BYTE_ORDER_MARK: char = '\u{FEFF}';

/// Incremental UTF-8 decoder for transport fragments.
///
/// A character split across two fragments is held back until its remaining
/// bytes arrive. Invalid sequences become U+FFFD, one per maximal invalid
/// subpart, so decoding never fails.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
    started: bool,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, fragment: &[u8]) -> String {
        if fragment.is_empty() {
            return String::new();
        }

        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(fragment);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    // from_utf8 guarantees the prefix up to valid_up_to is valid
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match error.error_len() {
                        Some(invalid_len) => {
                            out.push(REPLACEMENT);
                            rest = &after[invalid_len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        self.strip_leading_bom(out)
    }

    /// Flushes whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        self.strip_leading_bom(REPLACEMENT.to_string())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn strip_leading_bom(&mut self, text: String) -> String {
        if self.started || text.is_empty() {
            return text;
        }
        self.started = true;
        match text.strip_prefix(BYTE_ORDER_MARK) {
            Some(stripped) => stripped.to_string(),
            None => text,
        }
    }
}

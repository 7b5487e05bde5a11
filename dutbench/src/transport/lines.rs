//! Turning raw device output into trace lines.

/// Drain buffered bytes into UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - An incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Strip ANSI escape sequences and control characters from one line.
///
/// Tabs are kept. Terminal colour codes (`ESC [ ... letter`) are removed
/// as a whole so they do not leave `[0m` fragments behind.
pub fn clean_line(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\u{1b}' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    for c in chars.by_ref() {
                        if c.is_ascii_alphabetic() {
                            break;
                        }
                    }
                }
            },
            '\t' => out.push(ch),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}

/// Splits a byte stream into cleaned lines.
///
/// Both `\n` and `\r\n` terminate a line; a lone `\r` is dropped. Blank
/// lines are not reported.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending_bytes: Vec<u8>,
    partial: String,
}

impl LineAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every line completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.pending_bytes.extend_from_slice(data);
        let text = drain_utf8_lossy(&mut self.pending_bytes);
        self.partial.push_str(&text);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let raw: String = self.partial.drain(..=pos).collect();
            let line = clean_line(raw.trim_end_matches(['\n', '\r']));
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush whatever is left as a final line (used at end of stream).
    pub fn finish(&mut self) -> Option<String> {
        let mut rest = drain_utf8_lossy(&mut self.pending_bytes);
        rest.insert_str(0, &std::mem::take(&mut self.partial));
        let line = clean_line(rest.trim_end_matches(['\n', '\r']));
        (!line.trim().is_empty()).then_some(line)
    }
}

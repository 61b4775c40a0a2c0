//! Line splitter for the coding CLI's `stream-json` output.
//!
//! Log chunks arrive cut at arbitrary points. Text is buffered until a
//! newline, then each complete line is parsed on its own. Lines that are not
//! a JSON object (diagnostics, or a fragment of a multi-line object) are
//! dropped. Whatever is left at process exit gets one last parse attempt.

use serde_json::Value;

#[derive(Debug, Default)]
pub struct JsonLineBuffer {
    pending: String,
}

impl JsonLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the objects on every line it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.pending.push_str(chunk);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Vec::new();
        };

        let complete: String = self.pending.drain(..=last_newline).collect();
        complete.lines().filter_map(parse_line).collect()
    }

    /// Parse the trailing partial line, if any, and clear the buffer.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.pending);
        parse_line(&rest)
    }
}

fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            tracing::debug!("Dropping non-object CLI output line");
            None
        }
        Err(e) => {
            tracing::debug!("Dropping unparseable CLI output line: {e}");
            None
        }
    }
}

//! Postgres `COPY ... FROM STDIN` text-format encoding
//!
//! Bulk writes stream rows through the COPY protocol in its default text
//! format: tab-separated fields, newline-terminated rows, `\N` for NULL, and
//! backslash escapes for the delimiter characters. The encoding is
//! deliberately dumb pass-through; a payload the backend cannot digest (e.g.
//! a broken JSON document) fails the whole COPY and is isolated later by the
//! per-row fallback.

use sqlx::types::chrono::{DateTime, Utc};

/// Accumulates COPY text-format rows.
#[derive(Debug, Default)]
pub(crate) struct CopyBuffer {
    buf: String,
    row_started: bool,
}

impl CopyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one field to the current row.
    pub fn field(&mut self, value: &str) -> &mut Self {
        self.start_field();
        for ch in value.chars() {
            match ch {
                '\\' => self.buf.push_str("\\\\"),
                '\t' => self.buf.push_str("\\t"),
                '\n' => self.buf.push_str("\\n"),
                '\r' => self.buf.push_str("\\r"),
                _ => self.buf.push(ch),
            }
        }
        self
    }

    /// Appends a NULL field to the current row.
    pub fn null_field(&mut self) -> &mut Self {
        self.start_field();
        self.buf.push_str("\\N");
        self
    }

    /// Appends an optional timestamp field, NULL when absent.
    pub fn timestamp_field(&mut self, value: Option<&DateTime<Utc>>) -> &mut Self {
        match value {
            // TIMESTAMP columns carry no zone; values are stored as UTC.
            Some(ts) => {
                let rendered = ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
                self.field(&rendered)
            }
            None => self.null_field(),
        }
    }

    /// Terminates the current row.
    pub fn end_row(&mut self) -> &mut Self {
        self.buf.push('\n');
        self.row_started = false;
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_bytes()
    }

    fn start_field(&mut self) {
        if self.row_started {
            self.buf.push('\t');
        }
        self.row_started = true;
    }
}

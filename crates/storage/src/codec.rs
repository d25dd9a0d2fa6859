//! Line codec: one record per line, tab-separated, escaped string fields.

use std::path::PathBuf;
use std::str::FromStr;

use crate::{Result, StorageError};

/// Field separator.
pub const SEPARATOR: char = '\t';

/// Marker written for an absent optional value.
pub const NULL: &str = "\\N";

/// Escape a string so it fits in one field.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`].
pub fn unescape(field: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(format!("unknown escape '\\{}'", other)),
            None => return Err("dangling escape at end of field".to_string()),
        }
    }
    Ok(out)
}

/// Builds one record line.
#[derive(Debug, Default)]
pub struct FieldWriter {
    fields: Vec<String>,
}

impl FieldWriter {
    /// Start a record with its type tag.
    pub fn new(tag: &str) -> Self {
        Self {
            fields: vec![tag.to_string()],
        }
    }

    /// Escaped string field.
    pub fn str(&mut self, value: &str) -> &mut Self {
        self.fields.push(escape(value));
        self
    }

    /// Escaped string field, or the null marker.
    pub fn opt_str(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.str(v),
            None => self.raw(NULL),
        }
    }

    /// Path field.
    pub fn path(&mut self, value: &std::path::Path) -> &mut Self {
        self.str(&value.to_string_lossy())
    }

    /// Optional path field.
    pub fn opt_path(&mut self, value: Option<&std::path::Path>) -> &mut Self {
        match value {
            Some(v) => self.path(v),
            None => self.raw(NULL),
        }
    }

    /// Any value with a plain `Display` form (numbers, booleans, states).
    pub fn value(&mut self, value: impl std::fmt::Display) -> &mut Self {
        self.fields.push(value.to_string());
        self
    }

    /// Optional plain value.
    pub fn opt_value(&mut self, value: Option<impl std::fmt::Display>) -> &mut Self {
        match value {
            Some(v) => self.value(v),
            None => self.raw(NULL),
        }
    }

    fn raw(&mut self, field: &str) -> &mut Self {
        self.fields.push(field.to_string());
        self
    }

    /// Finish the line, newline included.
    pub fn finish(&self) -> String {
        let mut line = self.fields.join("\t");
        line.push('\n');
        line
    }
}

/// Reads the fields of one record line in order.
#[derive(Debug)]
pub struct FieldReader<'a> {
    line: usize,
    fields: Vec<&'a str>,
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Split `text` (without newline) found at 1-based `line`.
    pub fn new(line: usize, text: &'a str) -> Self {
        Self {
            line,
            fields: text.split(SEPARATOR).collect(),
            pos: 0,
        }
    }

    /// Line number, for error reporting.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Build a corrupt-record error for this line.
    pub fn corrupt(&self, reason: impl Into<String>) -> StorageError {
        StorageError::CorruptCheckpoint {
            line: self.line,
            reason: reason.into(),
        }
    }

    /// Unread fields left.
    pub fn has_more(&self) -> bool {
        self.pos < self.fields.len()
    }

    /// Fail unless every field was consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.has_more() {
            return Err(self.corrupt(format!(
                "{} unexpected trailing field(s)",
                self.fields.len() - self.pos
            )));
        }
        Ok(())
    }

    /// Next field, unprocessed.
    pub fn next_raw(&mut self) -> Result<&'a str> {
        let field = self
            .fields
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.corrupt(format!("missing field #{}", self.pos + 1)))?;
        self.pos += 1;
        Ok(field)
    }

    /// Next string field.
    pub fn next_str(&mut self) -> Result<String> {
        self.next_opt_str()?
            .ok_or_else(|| self.corrupt(format!("field #{} must not be null", self.pos)))
    }

    /// Next optional string field.
    pub fn next_opt_str(&mut self) -> Result<Option<String>> {
        let raw = self.next_raw()?;
        if raw == NULL {
            return Ok(None);
        }
        unescape(raw)
            .map(Some)
            .map_err(|reason| self.corrupt(format!("field #{}: {}", self.pos, reason)))
    }

    /// Next path field.
    pub fn next_path(&mut self) -> Result<PathBuf> {
        self.next_str().map(PathBuf::from)
    }

    /// Next optional path field.
    pub fn next_opt_path(&mut self) -> Result<Option<PathBuf>> {
        Ok(self.next_opt_str()?.map(PathBuf::from))
    }

    /// Next field parsed with `FromStr`.
    pub fn next_parsed<T>(&mut self) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.next_opt_parsed()?
            .ok_or_else(|| self.corrupt(format!("field #{} must not be null", self.pos)))
    }

    /// Next optional field parsed with `FromStr`.
    pub fn next_opt_parsed<T>(&mut self) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.next_raw()?;
        if raw == NULL {
            return Ok(None);
        }
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| self.corrupt(format!("field #{} '{}': {}", self.pos, raw, e)))
    }
}

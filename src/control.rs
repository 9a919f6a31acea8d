// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Line-oriented `key:value` record primitives.

Both `APKINDEX` and `.PKGINFO` consist of *paragraphs* of `key:value`
lines separated by blank lines. A line starting with a space continues the
previous field. Well-formed input must round-trip through parse + write
byte-for-byte, so values are stored exactly as they appear after the colon,
with continuation lines embedded as `\n `-prefixed segments.
*/

use {
    crate::error::{ApkError, Result},
    std::io::{BufRead, Write},
};

/// A field in a control paragraph.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ControlField {
    name: String,
    value: String,
}

impl ControlField {
    /// Construct an instance from a field name and value.
    pub fn new(name: impl ToString, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// The name of this field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw value, including any embedded continuation line breaks.
    pub fn value_str(&self) -> &str {
        &self.value
    }

    /// Iterate over logical lines in the value, with leading whitespace
    /// stripped from continuations.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.value.lines().map(|line| line.trim_start())
    }

    /// Iterate over whitespace-separated words in the value.
    pub fn iter_words(&self) -> impl Iterator<Item = &str> {
        self.value.split_ascii_whitespace()
    }

    /// Write this field to a writer.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(b":")?;
        writer.write_all(self.value.as_bytes())?;
        writer.write_all(b"\n")
    }
}

/// A paragraph in a control file.
///
/// A paragraph is an ordered series of fields. Field names are compared
/// exactly (APKINDEX keys are case significant: `p` and `P` differ) and a
/// paragraph holds a single occurrence of each name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlParagraph {
    fields: Vec<ControlField>,
}

impl ControlParagraph {
    /// Whether the paragraph contains no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set the value of a field, replacing any previous occurrence.
    pub fn set_field(&mut self, field: ControlField) {
        self.fields.retain(|f| f.name != field.name);
        self.fields.push(field);
    }

    /// Whether a named field is present.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterate over fields in insertion order.
    pub fn iter_fields(&self) -> impl Iterator<Item = &ControlField> {
        self.fields.iter()
    }

    /// Obtain the field with the given name.
    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Obtain the raw string value of the named field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value_str())
    }

    /// Obtain the named field parsed to a [u64].
    pub fn field_u64(&self, name: &str) -> Option<Result<u64>> {
        self.field_str(name)
            .map(|v| v.trim().parse::<u64>().map_err(ApkError::ParseInt))
    }

    /// Obtain the whitespace-separated words of the named field.
    pub fn field_words(&self, name: &str) -> Vec<String> {
        self.field(name)
            .map(|f| f.iter_words().map(|w| w.to_string()).collect())
            .unwrap_or_default()
    }

    /// Serialize the paragraph to a writer.
    ///
    /// A trailing newline is written as part of the final field, but no
    /// blank separator line. Callers serializing multiple paragraphs must
    /// write the separator themselves.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for field in &self.fields {
            field.write(writer)?;
        }

        Ok(())
    }
}

/// Holds parsing state for control files.
///
/// Instances are fed lines of text and periodically emit [ControlParagraph]
/// instances as blank lines complete them.
#[derive(Clone, Debug, Default)]
pub struct ControlFileParser {
    paragraph: ControlParagraph,
    field: Option<String>,
}

impl ControlFileParser {
    /// Write a line to the parser.
    ///
    /// If the line terminates an in-progress paragraph, that paragraph is
    /// returned. Otherwise `Ok(None)` is returned.
    pub fn write_line(&mut self, line: &str) -> Result<Option<ControlParagraph>> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let is_empty_line = line.is_empty();
        let is_continuation = line.starts_with(' ');

        let current_field = self.field.take();

        if is_empty_line {
            if let Some(field) = current_field {
                self.flush_field(field)?;
            }

            return Ok(if self.paragraph.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.paragraph))
            });
        }

        match (current_field, is_continuation) {
            // A new `key:value` line. Flush whatever was on the stack.
            (Some(v), false) => {
                self.flush_field(v)?;
                self.field = Some(line.to_string());
                Ok(None)
            }
            (None, false) => {
                self.field = Some(line.to_string());
                Ok(None)
            }
            // Continuation of the field on the stack. Keep the leading
            // space so serialization reproduces the input bytes.
            (Some(v), true) => {
                self.field = Some(v + "\n" + line);
                Ok(None)
            }
            (None, true) => Err(ApkError::ControlParse(format!(
                "continuation line without a field: '{}'",
                line
            ))),
        }
    }

    /// Finish parsing, consuming self.
    pub fn finish(mut self) -> Result<Option<ControlParagraph>> {
        if let Some(field) = self.field.take() {
            self.flush_field(field)?;
        }

        Ok(if self.paragraph.is_empty() {
            None
        } else {
            Some(self.paragraph)
        })
    }

    fn flush_field(&mut self, v: String) -> Result<()> {
        let (name, value) = v.split_once(':').ok_or_else(|| {
            ApkError::ControlParse(format!("error parsing line '{}': missing colon", v))
        })?;

        self.paragraph.set_field(ControlField::new(name, value));

        Ok(())
    }
}

/// A reader of [ControlParagraph] from a buffered source.
///
/// Instances can be consumed as an iterator, each item being a fully parsed
/// paragraph.
pub struct ControlParagraphReader<R: BufRead> {
    reader: R,
    parser: Option<ControlFileParser>,
}

impl<R: BufRead> ControlParagraphReader<R> {
    /// Create a new instance bound to a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: Some(ControlFileParser::default()),
        }
    }

    fn get_next(&mut self) -> Result<Option<ControlParagraph>> {
        let mut parser = self
            .parser
            .take()
            .ok_or_else(|| ApkError::Internal("paragraph reader used after EOF".to_string()))?;

        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line)?;

            if bytes_read == 0 {
                return parser.finish();
            }

            if let Some(paragraph) = parser.write_line(&line)? {
                self.parser.replace(parser);
                return Ok(Some(paragraph));
            }
        }
    }
}

impl<R: BufRead> Iterator for ControlParagraphReader<R> {
    type Item = Result<ControlParagraph>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parser.is_none() {
            None
        } else {
            match self.get_next() {
                Ok(Some(para)) => Some(Ok(para)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        }
    }
}

//! Learned message grammars and the region store.
//!
//! Templates induced by the oracle at startup are compiled into one header
//! pattern plus one fields pattern per message type. `parse_buffer` uses
//! them to split a buffer into mutable and immutable byte ranges; buffers no
//! pattern recognizes degrade to a single mutable range.

use std::{fs, path::Path};

use libafl_bolts::Error;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

/// One byte span of a decomposition. Non-mutable ranges are structural and
/// the mutation engine leaves them alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: usize,
    pub len: usize,
    pub mutable: bool,
}

impl Range {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// A message template as agreed on by the oracle: a literal header and the
/// field keywords that may appear after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub header: String,
    pub fields: Vec<String>,
}

/// Compiled form of a template.
struct MessagePattern {
    header: Regex,
    fields: Option<Regex>,
}

/// The set of learned patterns for the configured protocol.
pub struct GrammarStore {
    templates: Vec<MessageTemplate>,
    patterns: Vec<MessagePattern>,
}

impl GrammarStore {
    pub fn empty() -> Self {
        Self {
            templates: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn from_templates(templates: Vec<MessageTemplate>) -> Result<Self, Error> {
        let mut patterns = Vec::with_capacity(templates.len());
        for t in &templates {
            let header = Regex::new(&format!("(?-u)^{}", regex::escape(&t.header)))
                .map_err(|e| Error::illegal_argument(format!("Bad header pattern: {e}")))?;
            let fields = if t.fields.is_empty() {
                None
            } else {
                let alt = t
                    .fields
                    .iter()
                    .map(|f| regex::escape(f))
                    .collect::<Vec<_>>()
                    .join("|");
                Some(
                    Regex::new(&format!("(?-u){alt}"))
                        .map_err(|e| Error::illegal_argument(format!("Bad fields pattern: {e}")))?,
                )
            };
            patterns.push(MessagePattern { header, fields });
        }
        Ok(Self {
            templates,
            patterns,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn templates(&self) -> &[MessageTemplate] {
        &self.templates
    }

    /// Header literals of all known message types.
    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|t| t.header.as_str())
    }

    /// Decompose a buffer. The result covers `[0, buf.len())` contiguously;
    /// when no header matches at offset zero the whole buffer is a single
    /// mutable range.
    pub fn parse_buffer(&self, buf: &[u8]) -> Vec<Range> {
        if buf.is_empty() {
            return Vec::new();
        }
        for pat in &self.patterns {
            let Some(m) = pat.header.find(buf) else {
                continue;
            };
            debug_assert_eq!(m.start(), 0);
            let mut ranges = vec![Range {
                start: 0,
                len: m.end(),
                mutable: false,
            }];
            let body = &buf[m.end()..];
            let mut cursor = 0usize;
            if let Some(fields) = &pat.fields {
                for fm in fields.find_iter(body) {
                    if fm.start() > cursor {
                        ranges.push(Range {
                            start: m.end() + cursor,
                            len: fm.start() - cursor,
                            mutable: true,
                        });
                    }
                    ranges.push(Range {
                        start: m.end() + fm.start(),
                        len: fm.end() - fm.start(),
                        mutable: false,
                    });
                    cursor = fm.end();
                }
            }
            if cursor < body.len() {
                ranges.push(Range {
                    start: m.end() + cursor,
                    len: body.len() - cursor,
                    mutable: true,
                });
            }
            return ranges;
        }
        vec![Range {
            start: 0,
            len: buf.len(),
            mutable: true,
        }]
    }

    /// Persist the agreed templates so a later session can resume without
    /// asking the oracle again.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(&self.templates)
            .map_err(|e| Error::serialize(format!("Cannot serialize grammar: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path)?;
        let templates: Vec<MessageTemplate> = serde_json::from_str(&json)
            .map_err(|e| Error::serialize(format!("Cannot parse grammar file: {e}")))?;
        Self::from_templates(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftp_store() -> GrammarStore {
        GrammarStore::from_templates(vec![
            MessageTemplate {
                header: "USER ".into(),
                fields: vec![],
            },
            MessageTemplate {
                header: "PORT ".into(),
                fields: vec![",".into()],
            },
        ])
        .unwrap()
    }

    fn assert_partition(ranges: &[Range], len: usize) {
        let mut cursor = 0;
        for r in ranges {
            assert_eq!(r.start, cursor, "ranges must be contiguous");
            cursor = r.end();
        }
        assert_eq!(cursor, len, "ranges must cover the buffer");
    }

    #[test]
    fn header_becomes_immutable_prefix() {
        let store = ftp_store();
        let buf = b"USER anonymous\r\n";
        let ranges = store.parse_buffer(buf);
        assert_partition(&ranges, buf.len());
        assert_eq!(
            ranges[0],
            Range {
                start: 0,
                len: 5,
                mutable: false
            }
        );
        assert!(ranges[1..].iter().all(|r| r.mutable));
    }

    #[test]
    fn fields_are_structural() {
        let store = ftp_store();
        let buf = b"PORT 127,0,0,1\r\n";
        let ranges = store.parse_buffer(buf);
        assert_partition(&ranges, buf.len());
        let immutable: Vec<_> = ranges.iter().filter(|r| !r.mutable).collect();
        // Header plus the three commas.
        assert_eq!(immutable.len(), 4);
    }

    #[test]
    fn unknown_buffer_degrades_to_one_mutable_range() {
        let store = ftp_store();
        let ranges = store.parse_buffer(b"\x01\x02\x03");
        assert_eq!(
            ranges,
            vec![Range {
                start: 0,
                len: 3,
                mutable: true
            }]
        );
        assert!(store.parse_buffer(b"").is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grammar.json");
        let store = ftp_store();
        store.save(&path).unwrap();
        let loaded = GrammarStore::load(&path).unwrap();
        assert_eq!(loaded.templates(), store.templates());
    }
}

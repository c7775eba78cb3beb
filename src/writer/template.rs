use crate::error::{Error, Result};
use crate::protocol::ProtocolConfig;
use chrono::{DateTime, Utc};

pub const DEFAULT_PREFIX: &str = "data-";
pub const DEFAULT_PATTERN: &str = "{year}-{month}-{day}-{hour}-{minute}-{second}";
pub const DEFAULT_SUFFIX: &str = ".dat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Macro {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Filter,
    Sampling,
    Device,
}

impl Macro {
    fn parse(name: &str) -> Option<Self> {
        let found = match name {
            "year" => Macro::Year,
            "month" => Macro::Month,
            "day" => Macro::Day,
            "hour" => Macro::Hour,
            "minute" => Macro::Minute,
            "second" => Macro::Second,
            "filter" => Macro::Filter,
            "freq" => Macro::Sampling,
            "device" => Macro::Device,
            _ => return None,
        };
        Some(found)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Macro(Macro),
}

// Output file name: `prefix + pattern + suffix`, each part may hold macros.
//
// Macros: `{year} {month} {day} {hour} {minute} {second}` (UTC, zero padded),
// `{filter}` and `{freq}` in Hz, `{device}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl FileNameTemplate {
    pub fn new(prefix: &str, pattern: &str, suffix: &str) -> Result<Self> {
        let source = format!("{prefix}{pattern}{suffix}");
        if source.is_empty() {
            return Err(Error::Config("file name template is empty".to_string()));
        }
        if source.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "file name template must not contain path separators: {source}"
            )));
        }
        let segments = parse_segments(&source)?;
        Ok(Self { source, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render(&self, at: DateTime<Utc>, config: &ProtocolConfig) -> String {
        let mut name = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Macro(Macro::Year) => name.push_str(&at.format("%Y").to_string()),
                Segment::Macro(Macro::Month) => name.push_str(&at.format("%m").to_string()),
                Segment::Macro(Macro::Day) => name.push_str(&at.format("%d").to_string()),
                Segment::Macro(Macro::Hour) => name.push_str(&at.format("%H").to_string()),
                Segment::Macro(Macro::Minute) => name.push_str(&at.format("%M").to_string()),
                Segment::Macro(Macro::Second) => name.push_str(&at.format("%S").to_string()),
                Segment::Macro(Macro::Filter) => {
                    name.push_str(&config.filter_frequency.to_string())
                }
                Segment::Macro(Macro::Sampling) => {
                    name.push_str(&config.sampling_frequency.to_string())
                }
                Segment::Macro(Macro::Device) => name.push_str(&config.device_id),
            }
        }
        name
    }
}

impl Default for FileNameTemplate {
    fn default() -> Self {
        Self {
            source: format!("{DEFAULT_PREFIX}{DEFAULT_PATTERN}{DEFAULT_SUFFIX}"),
            segments: vec![
                Segment::Literal(DEFAULT_PREFIX.to_string()),
                Segment::Macro(Macro::Year),
                Segment::Literal("-".to_string()),
                Segment::Macro(Macro::Month),
                Segment::Literal("-".to_string()),
                Segment::Macro(Macro::Day),
                Segment::Literal("-".to_string()),
                Segment::Macro(Macro::Hour),
                Segment::Literal("-".to_string()),
                Segment::Macro(Macro::Minute),
                Segment::Literal("-".to_string()),
                Segment::Macro(Macro::Second),
                Segment::Literal(DEFAULT_SUFFIX.to_string()),
            ],
        }
    }
}

fn parse_segments(source: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = source;
    while !rest.is_empty() {
        let Some(open) = rest.find(['{', '}']) else {
            segments.push(Segment::Literal(rest.to_string()));
            break;
        };
        if rest[open..].starts_with('}') {
            return Err(Error::Config(format!(
                "unmatched '}}' in file name template: {source}"
            )));
        }
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let Some(len) = rest[open..].find('}') else {
            return Err(Error::Config(format!(
                "unterminated macro in file name template: {source}"
            )));
        };
        let name = &rest[open + 1..open + len];
        let Some(found) = Macro::parse(name) else {
            return Err(Error::Config(format!(
                "unknown file name macro {{{name}}}"
            )));
        };
        segments.push(Segment::Macro(found));
        rest = &rest[open + len + 1..];
    }
    Ok(segments)
}

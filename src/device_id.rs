use crate::error::{Error, Result};
use crate::events::StatusSink;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_DEVICE_ID: &str = "seismoreg";

const MAX_LEN: usize = 64;

// Check one identifier: a single token of ASCII letters, digits, `-`, `_`, `.`.
pub fn parse_device_id(text: &str) -> Result<String> {
    let mut tokens = text.split_whitespace();
    let Some(id) = tokens.next() else {
        return Err(Error::Config("device id is empty".to_string()));
    };
    if tokens.next().is_some() {
        return Err(Error::Config(format!(
            "device id file holds more than one value: {:?}",
            text.trim()
        )));
    }
    if id.len() > MAX_LEN {
        return Err(Error::Config(format!(
            "device id is longer than {MAX_LEN} characters"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(Error::Config(format!(
            "device id {id:?} contains illegal character {bad:?}"
        )));
    }
    if id.chars().all(|c| c == '.') {
        return Err(Error::Config(format!("device id {id:?} is not a name")));
    }
    Ok(id.to_string())
}

// Read the identifier from `path`. Every failure is a WARNING and yields `fallback`.
pub fn load_device_id(path: &Path, fallback: &str, sink: &StatusSink) -> String {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            sink.warning(format!(
                "Device id file {} not found, using {fallback}",
                path.display()
            ));
            return fallback.to_string();
        }
        Err(err) => {
            sink.warning(format!(
                "Reading device id file {} failed ({err}), using {fallback}",
                path.display()
            ));
            return fallback.to_string();
        }
    };
    match parse_device_id(&text) {
        Ok(id) => {
            sink.info(format!("Device id {id} loaded from {}", path.display()));
            id
        }
        Err(err) => {
            sink.warning(format!("{err} in {}, using {fallback}", path.display()));
            fallback.to_string()
        }
    }
}

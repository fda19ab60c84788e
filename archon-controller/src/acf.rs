// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reading and writing ACF configuration payloads.
//!
//! The ACF format is INI with case-sensitive keys and two quirks
//! inherited from the vendor GUI: keys containing `/` are stored with
//! `\` instead, and values containing `,`, `;` or `=` are wrapped in
//! double quotes. Line order inside `[CONFIG]` is significant because
//! line N of the section is written to configuration slot N. Parsing
//! and serializing the same document must round-trip byte-for-byte
//! with what the device itself reports over `RCONFIG`.

use crate::error::ArchonError;

/// One `[NAME]` section with its entries in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcfSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// An ACF document, sections in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcfDocument {
    sections: Vec<AcfSection>,
}

impl AcfDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self, name: &str) -> Option<&AcfSection> {
        self.sections.iter().find(|section| section.name == name)
    }

    /// Appends an empty section and returns it for filling.
    pub fn add_section(&mut self, name: &str) -> &mut AcfSection {
        self.sections.push(AcfSection {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.sections.last_mut().unwrap_or_else(|| unreachable!())
    }

    /// Parses an INI-style document. Keys are kept case-sensitive and
    /// entry order is preserved.
    pub fn parse(text: &str) -> Result<Self, ArchonError> {
        let mut document = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                document.add_section(name.trim());
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ArchonError::Acf(format!("line {line:?} is not KEY=VALUE")))?;
            let section = document
                .sections
                .last_mut()
                .ok_or_else(|| ArchonError::Acf(format!("entry {line:?} before any section")))?;
            section
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(document)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Display for AcfDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Converts one `KEY=VALUE` device line into the form stored in the
/// file: `/` in the key becomes `\` and separator-bearing values are
/// quoted.
pub(crate) fn encode_entry(line: &str) -> Result<(String, String), ArchonError> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| ArchonError::Acf(format!("config line {line:?} is not KEY=VALUE")))?;
    let key = key.replace('/', "\\");
    let value = if value.contains([',', ';', '=']) {
        format!("\"{value}\"")
    } else {
        value.to_string()
    };
    Ok((key, value))
}

/// Converts a stored entry back into the `KEY=VALUE` line sent to the
/// device: the key is upper-cased, `\` reverts to `/` and surrounding
/// quotes are stripped.
pub(crate) fn decode_entry(key: &str, value: &str) -> String {
    let key = key.to_uppercase().replace('\\', "/");
    let value = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value);
    format!("{key}={value}")
}

//! `crypttab` modelling: parse, edit by exact mapping name, render, back up.
//!
//! Lines that are not entries (comments, blanks) and entries we do not touch
//! are written back byte-for-byte.

use crate::error::{AutounlockError, AutounlockResult};
use chrono::Local;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// One line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    pub source: String,
    pub key: Option<String>,
    pub options: Vec<String>,
}

impl CrypttabEntry {
    /// Entry unlocking `name` from `UUID=<uuid>` with a key file.
    pub fn with_keyfile(name: &str, uuid: &str, keyfile: &Path, options: &str) -> Self {
        Self {
            name: name.to_string(),
            source: format!("UUID={uuid}"),
            key: Some(keyfile.display().to_string()),
            options: options
                .split(',')
                .map(str::trim)
                .filter(|opt| !opt.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl fmt::Display for CrypttabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.source)?;
        match (&self.key, self.options.is_empty()) {
            (Some(key), true) => write!(f, " {key}"),
            (Some(key), false) => write!(f, " {key} {}", self.options.join(",")),
            (None, true) => Ok(()),
            (None, false) => write!(f, " none {}", self.options.join(",")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        entry: CrypttabEntry,
        raw: Option<String>,
    },
    Verbatim(String),
}

/// Parsed crypttab document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Crypttab {
    lines: Vec<Line>,
}

impl Crypttab {
    /// Parse a crypttab document. `origin` is only used in error messages.
    pub fn parse(origin: &Path, contents: &str) -> AutounlockResult<Self> {
        let mut lines = Vec::new();
        for (idx, raw) in contents.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Verbatim(raw.to_string()));
                continue;
            }

            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() < 2 || fields.len() > 4 {
                return Err(AutounlockError::Crypttab {
                    path: origin.to_path_buf(),
                    line: idx + 1,
                    reason: format!("expected 2 to 4 fields, found {}", fields.len()),
                });
            }

            let entry = CrypttabEntry {
                name: fields[0].to_string(),
                source: fields[1].to_string(),
                key: fields.get(2).map(|key| key.to_string()),
                options: fields
                    .get(3)
                    .map(|opts| {
                        opts.split(',')
                            .filter(|opt| !opt.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            lines.push(Line::Entry {
                entry,
                raw: Some(raw.to_string()),
            });
        }
        Ok(Self { lines })
    }

    pub fn entries(&self) -> impl Iterator<Item = &CrypttabEntry> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry { entry, .. } => Some(entry),
            Line::Verbatim(_) => None,
        })
    }

    /// Number of entries whose name field is exactly `name`.
    pub fn count_named(&self, name: &str) -> usize {
        self.entries().filter(|entry| entry.name == name).count()
    }

    /// Drop every entry whose name field is exactly `name`; returns how many went.
    pub fn remove_named(&mut self, name: &str) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| match line {
            Line::Entry { entry, .. } => entry.name != name,
            Line::Verbatim(_) => true,
        });
        before - self.lines.len()
    }

    pub fn push(&mut self, entry: CrypttabEntry) {
        self.lines.push(Line::Entry { entry, raw: None });
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry {
                    raw: Some(raw), ..
                } => out.push_str(raw),
                Line::Entry { entry, raw: None } => out.push_str(&entry.to_string()),
                Line::Verbatim(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }
}

/// Read `path`, returning `None` when the file does not exist.
pub fn read_crypttab(path: &Path) -> AutounlockResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AutounlockError::Io(err)),
    }
}

/// Copy `path` to `<path>.backup.<timestamp>` and return the backup location.
pub fn backup_crypttab(path: &Path) -> AutounlockResult<PathBuf> {
    let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
    let base = format!("{}.backup.{stamp}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{suffix}"));
        suffix += 1;
    }

    fs::copy(path, &candidate).map_err(|err| {
        AutounlockError::Provider(format!(
            "failed to back up {} to {}: {err}",
            path.display(),
            candidate.display()
        ))
    })?;
    Ok(candidate)
}

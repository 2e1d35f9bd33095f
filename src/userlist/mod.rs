//! User list ingestion, cleaning and duplicate flagging.
//!
//! A user list arrives as a plain text file (one "name email" pair per line)
//! or as a CSV/spreadsheet with `Name` and `Email` columns. Every source is
//! reduced to the same [`Ulist`]: cleaned, free of exact duplicates, sorted by
//! name, with colliding records cross-referenced through flag tokens.

pub mod clean;
pub mod script;
pub mod source;

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use clean::{clean_email, clean_name, parse_line, NULL_EMAIL};
pub use source::SourceKind;


/// A cleaned user list, sorted by name.
pub type Ulist = Vec<UserRecord>;

#[derive(Debug, Error)]
pub enum UserListError {
    /// The tabular source cannot be interpreted as a user list.
    #[error("unsupported user list {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    /// The file does not exist or cannot be read.
    #[error("could not read user list {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

impl UserListError {
    pub(crate) fn unsupported(path: &Path, reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// One cleaned user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub email: String,
    /// Hyphen-joined collision tokens (`E3`, `N0-N4`, ...); empty when clean.
    pub flags: String,
}

impl UserRecord {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            flags: String::new(),
        }
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Iterate over the individual flag tokens.
    pub fn flag_tokens(&self) -> impl Iterator<Item = &str> {
        self.flags.split('-').filter(|token| !token.is_empty())
    }

    fn push_flag(&mut self, token: &str) {
        if !self.flags.is_empty() {
            self.flags.push('-');
        }
        self.flags.push_str(token);
    }
}

/// A row handed to the renderer and the mail dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub index: usize,
    pub name: String,
    pub email: String,
}

impl Recipient {
    pub fn new(index: usize, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. name: {} | email: {}", self.index, self.name, self.email)
    }
}

/// Which collision is flagged between records that are not exact duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateCheck {
    /// Same cleaned name, different email. Tokens are `E<n>`.
    #[default]
    Name,
    /// Same cleaned email, different name. Tokens are `N<n>`.
    Email,
}

impl DuplicateCheck {
    fn flag_prefix(self) -> char {
        match self {
            DuplicateCheck::Name => 'E',
            DuplicateCheck::Email => 'N',
        }
    }

    fn collides(self, a: &UserRecord, b: &UserRecord) -> bool {
        match self {
            DuplicateCheck::Name => a.name == b.name,
            DuplicateCheck::Email => a.email == b.email,
        }
    }
}

impl FromStr for DuplicateCheck {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(DuplicateCheck::Name),
            "email" => Ok(DuplicateCheck::Email),
            other => Err(format!("invalid duplicate check '{other}', expected one of: name, email")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    pub check: DuplicateCheck,
    /// Transliterate non-Latin names to ASCII before comparing them.
    pub transliterate: bool,
}

/// Clean, de-duplicate, flag and sort raw `(name, email)` rows.
pub fn normalize<I, N, E>(rows: I, check: DuplicateCheck) -> Ulist
where
    I: IntoIterator<Item = (N, E)>,
    N: AsRef<str>,
    E: AsRef<str>,
{
    normalize_with(
        rows,
        NormalizeOptions {
            check,
            transliterate: false,
        },
    )
}

pub fn normalize_with<I, N, E>(rows: I, options: NormalizeOptions) -> Ulist
where
    I: IntoIterator<Item = (N, E)>,
    N: AsRef<str>,
    E: AsRef<str>,
{
    let mut accepted: Ulist = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut flag_index = 0usize;

    for (raw_name, raw_email) in rows {
        let mut name = clean_name(raw_name.as_ref());
        if options.transliterate {
            let spelled = clean_name(&script::latinize(&name));
            name = spelled;
        }
        let email = clean_email(raw_email.as_ref());
        if name.is_empty() || email.is_empty() || email == NULL_EMAIL {
            continue;
        }

        let key = (name, email);
        if seen.contains(&key) {
            continue;
        }

        let mut record = UserRecord::new(key.0.clone(), key.1.clone());
        for existing in accepted.iter_mut() {
            if options.check.collides(existing, &record) {
                let token = format!("{}{}", options.check.flag_prefix(), flag_index);
                existing.push_flag(&token);
                record.push_flag(&token);
                flag_index += 1;
            }
        }

        seen.insert(key);
        accepted.push(record);
    }

    accepted.sort_by(|a, b| a.name.cmp(&b.name));
    accepted
}

/// Load a user list from any supported source.
///
/// A file that cannot be read yields an empty list after logging a
/// diagnostic. A tabular file without `Name`/`Email` columns, or one that
/// cannot be parsed, is an [`UserListError::UnsupportedFormat`].
pub fn load(path: &Path, options: NormalizeOptions) -> std::result::Result<Ulist, UserListError> {
    let kind = SourceKind::detect(path);
    let raw = match kind {
        SourceKind::Text => source::read_text(path).map_err(|err| UserListError::Unreadable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }),
        SourceKind::Csv => source::read_csv(path),
        SourceKind::Spreadsheet if !path.exists() => Err(UserListError::Unreadable {
            path: path.to_path_buf(),
            reason: "file does not exist".to_string(),
        }),
        SourceKind::Spreadsheet => source::read_spreadsheet(path),
    };

    let raw = match raw {
        Ok(rows) => rows,
        Err(err @ UserListError::Unreadable { .. }) => {
            warn!("{err}");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    debug!(rows = raw.len(), ?kind, "read raw user list from {}", path.display());
    let ulist = normalize_with(raw, options);
    if !options.transliterate {
        report_non_latin(&ulist);
    }
    Ok(ulist)
}

/// Partition a list into clean and flagged records.
/// Flagged records are ordered by their flag string so collision groups sit together.
pub fn split_flagged(ulist: &[UserRecord]) -> (Vec<UserRecord>, Vec<UserRecord>) {
    let (mut flagged, clean): (Vec<_>, Vec<_>) =
        ulist.iter().cloned().partition(UserRecord::is_flagged);
    flagged.sort_by(|a, b| a.flags.cmp(&b.flags));
    (clean, flagged)
}

/// Write the review listing, one `"<flags> | <name> <email>"` line per record.
pub fn write_listing(ulist: &[UserRecord], path: &Path) -> Result<()> {
    let mut out = String::new();
    for record in ulist {
        out.push_str(&format!("{} | {} {}\n", record.flags, record.name, record.email));
    }
    fs::write(path, out).with_context(|| format!("failed to write listing {}", path.display()))
}

fn report_non_latin(ulist: &[UserRecord]) {
    for record in ulist {
        if let Some(found) = script::foreign_script(&record.name) {
            warn!(
                "name `{}` uses the {:?} script; make sure the certificate font covers it",
                record.name, found
            );
        }
    }
}

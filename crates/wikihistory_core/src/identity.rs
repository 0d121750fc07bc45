use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

use crate::error::ConfigError;

pub const DEFAULT_EMAIL: &str = "anonymous.contributor@example.org";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorKind {
    Mapped,
    Unwanted,
    Unmapped,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub identity: String,
    pub kind: AuthorKind,
}

/// Username mapping and denylist, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    mapping: BTreeMap<String, String>,
    denylist: BTreeSet<String>,
    default_email: String,
}

impl IdentityTable {
    pub fn new(
        mapping: BTreeMap<String, String>,
        denylist: BTreeSet<String>,
        default_email: &str,
    ) -> Self {
        Self {
            mapping,
            denylist,
            default_email: default_email.to_string(),
        }
    }

    pub fn load(
        usernames: Option<&Path>,
        denylist: Option<&Path>,
        default_email: &str,
    ) -> Result<Self> {
        let mapping = match usernames {
            Some(path) => load_identity_mapping(path)?,
            None => BTreeMap::new(),
        };
        let denylist = match denylist {
            Some(path) => load_denylist(path)?,
            None => BTreeSet::new(),
        };
        Ok(Self::new(mapping, denylist, default_email))
    }

    pub fn mapped_users(&self) -> usize {
        self.mapping.len()
    }

    pub fn denylisted_users(&self) -> usize {
        self.denylist.len()
    }

    pub fn is_denylisted(&self, username: &str) -> bool {
        self.denylist.contains(username)
    }

    pub fn resolve(&self, username: &str) -> Author {
        if let Some(identity) = self.mapping.get(username) {
            return Author {
                identity: identity.clone(),
                kind: AuthorKind::Mapped,
            };
        }
        if self.denylist.contains(username) {
            return Author {
                identity: format!("Unwanted Contributor {username} <{}>", self.default_email),
                kind: AuthorKind::Unwanted,
            };
        }
        if !username.is_empty() {
            return Author {
                identity: format!("{username} <{}>", self.default_email),
                kind: AuthorKind::Unmapped,
            };
        }
        Author {
            identity: format!("Anonymous Contributor <{}>", self.default_email),
            kind: AuthorKind::Anonymous,
        }
    }
}

/// Falls back to `fallback` when there is no comment; a denylisted user always gets the tag.
pub fn commit_message(denylisted: bool, username: &str, comment: &str, fallback: &str) -> String {
    if denylisted {
        return format!("UNWANTED FROM {username}");
    }
    if comment.trim().is_empty() {
        fallback.to_string()
    } else {
        comment.to_string()
    }
}

/// Reads `username<TAB>Name <email>` rows. A missing file is a warning, not an error.
pub fn load_identity_mapping(path: &Path) -> Result<BTreeMap<String, String>> {
    let Some(content) = read_optional(path, "identity table")? else {
        return Ok(BTreeMap::new());
    };
    let mut mapping = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        let row = line.trim();
        if row.is_empty() {
            continue;
        }
        let columns = row.split('\t').collect::<Vec<_>>();
        let valid = columns.len() == 2
            && !columns[0].trim().is_empty()
            && columns[1].contains(" <")
            && columns[1].contains('@')
            && columns[1].contains('>');
        if !valid {
            return Err(ConfigError::IdentityRow {
                path: path.to_path_buf(),
                line: index + 1,
                row: row.to_string(),
            }
            .into());
        }
        mapping.insert(columns[0].trim().to_string(), columns[1].trim().to_string());
    }
    Ok(mapping)
}

pub fn load_denylist(path: &Path) -> Result<BTreeSet<String>> {
    let Some(content) = read_optional(path, "denylist")? else {
        return Ok(BTreeSet::new());
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

fn read_optional(path: &Path, what: &str) -> Result<Option<String>> {
    if !path.exists() {
        warn!("{what} {} not found; continuing without it", path.display());
        return Ok(None);
    }
    fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} {}", path.display()))
        .map(Some)
}

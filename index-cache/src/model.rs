//! The Simple Repository API data model.
//!
//! Field names and `yanked` semantics are preserved bit-exactly because
//! clients (package installers) consume them directly — see spec §6.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Normalizes a project name per PEP 503: lowercase, and runs of `-`, `_`,
/// `.` folded to a single `-`.
pub fn normalize_project_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;

    for c in name.chars() {
        if c == '-' || c == '_' || c == '.' {
            if !out.is_empty() {
                last_was_sep = true;
            }
            continue;
        }

        if last_was_sep {
            out.push('-');
            last_was_sep = false;
        }

        out.extend(c.to_lowercase());
    }

    out
}

/// A normalized project name. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(raw: &str) -> Self {
        Self(normalize_project_name(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ProjectName {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

/// An entry in the top-level project listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectListEntry {
    pub name: ProjectName,
}

/// The yanked marker on a file. Upstream payloads use either a bare boolean
/// or a string in the same field; this tagged variant is the only
/// representation the core ever stores — the raw untyped value never
/// survives past the parser boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Yanked {
    No,
    YesNoReason,
    YesWithReason(String),
}

impl Default for Yanked {
    fn default() -> Self {
        Self::No
    }
}

impl Yanked {
    pub fn is_yanked(&self) -> bool {
        !matches!(self, Self::No)
    }

    /// Returns the explicit reason if present, else the string form of the
    /// yanked marker if it is a non-empty string, else empty.
    pub fn yanked_reason(&self) -> &str {
        match self {
            Self::No => "",
            Self::YesNoReason => "",
            Self::YesWithReason(reason) => reason,
        }
    }
}

/// A specific distributable file (sdist or wheel) for a project version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub requires_python: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub upload_time: Option<String>,
    #[serde(default)]
    pub yanked: Yanked,
    /// PEP 658 core-metadata marker, carried opaquely: present when upstream
    /// advertised a metadata sidecar, hash map when it advertised digests for
    /// it. The core never interprets this field.
    #[serde(default)]
    pub core_metadata: Option<BTreeMap<String, String>>,
}

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};

use crate::error::ConfigError;
use crate::record::FILE_PREFIX;

/// Where replay writes each title, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    repo_root: PathBuf,
    prefix: String,
    mediawiki_ext: String,
    markdown_ext: String,
}

impl OutputLayout {
    pub fn new(
        repo_root: &Path,
        prefix: &str,
        mediawiki_ext: &str,
        markdown_ext: &str,
    ) -> Result<Self, ConfigError> {
        validate_prefix(prefix)?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            prefix: prefix.to_string(),
            mediawiki_ext: mediawiki_ext.trim_start_matches('.').to_string(),
            markdown_ext: markdown_ext.trim_start_matches('.').to_string(),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn mediawiki_ext(&self) -> &str {
        &self.mediawiki_ext
    }

    pub fn markdown_ext(&self) -> &str {
        &self.markdown_ext
    }

    /// Permalink: spaces become `_`, colons are percent encoded.
    pub fn make_url(&self, title: &str) -> String {
        format!(
            "{}{}",
            self.prefix,
            title.replace(' ', "_").replace(':', "%3A")
        )
    }

    /// Spaces, colons and slashes fold to `_` so every page is a flat file under the prefix.
    pub fn make_filename(&self, title: &str, ext: &str) -> String {
        let stem = title.replace([' ', ':', '/'], "_");
        format!("{}{stem}.{ext}", self.prefix)
    }

    pub fn markup_file(&self, title: &str) -> String {
        self.make_filename(title, &self.mediawiki_ext)
    }

    pub fn markdown_file(&self, title: &str) -> String {
        self.make_filename(title, &self.markdown_ext)
    }

    pub fn upload_file(&self, title: &str, filename: Option<&str>) -> Result<String> {
        let name = match filename.and_then(basename) {
            Some(name) => name.to_string(),
            None => make_canonical(title.strip_prefix(FILE_PREFIX).unwrap_or(title)),
        };
        if name.is_empty() || name == "." || name == ".." {
            bail!("cannot derive an upload filename for {title:?}");
        }
        let relative = format!("{}{name}", self.prefix);
        self.validate_scoped_path(&relative)?;
        Ok(relative)
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        let mut out = self.repo_root.clone();
        for segment in relative.split('/') {
            if !segment.is_empty() {
                out.push(segment);
            }
        }
        out
    }

    pub fn validate_scoped_path(&self, relative: &str) -> Result<()> {
        let normalized = normalize_pathbuf(&self.absolute(relative));
        let allowed = normalize_pathbuf(&self.absolute(&self.prefix));
        if normalized.starts_with(&allowed) && normalized != allowed {
            return Ok(());
        }
        bail!(
            "path escapes output prefix: {}\nallowed root: {}",
            display_path(&normalized),
            display_path(&allowed)
        )
    }
}

pub fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let escapes = prefix
        .split('/')
        .any(|segment| segment == ".." || segment == ".");
    if prefix.is_empty() || (prefix.ends_with('/') && !prefix.starts_with('/') && !escapes) {
        return Ok(());
    }
    Err(ConfigError::Prefix(prefix.to_string()))
}

/// Underscores for spaces, first character upper case, the rest lower case.
pub fn make_canonical(name: &str) -> String {
    let name = name.replace(' ', "_");
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn basename(filename: &str) -> Option<&str> {
    filename
        .rsplit(['/', '\\'])
        .find(|segment| !segment.trim().is_empty())
        .map(str::trim)
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::MarkupError;
use crate::markup::{self, Redirect, Rewrite};
use crate::record::{Record, is_file_title};

pub const DEFAULT_IGNORE_PREFIXES: [&str; 5] =
    ["Help:", "MediaWiki:", "Talk:", "User:", "User talk:"];
pub const TEMPLATE_PREFIX: &str = "Template:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotWhitelisted,
    IgnoredPrefix,
    DescriptionPage,
    Template,
    MissingContent,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotWhitelisted => "not_whitelisted",
            Self::IgnoredPrefix => "ignored_prefix",
            Self::DescriptionPage => "description_page",
            Self::Template => "template",
            Self::MissingContent => "missing_content",
        }
    }
}

/// What replay does with one record, decided before any side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Skip(SkipReason),
    File,
    Redirect { redirect: Redirect, rewrite: Rewrite },
    Page(Rewrite),
}

#[derive(Debug, Clone, Default)]
pub struct RoutePolicy {
    whitelist: Option<BTreeSet<String>>,
    ignore_prefixes: Vec<String>,
}

impl RoutePolicy {
    pub fn new(whitelist: Option<BTreeSet<String>>, ignore_prefixes: Vec<String>) -> Self {
        Self {
            whitelist: whitelist.filter(|titles| !titles.is_empty()),
            ignore_prefixes,
        }
    }

    pub fn with_default_prefixes(whitelist: Option<BTreeSet<String>>) -> Self {
        Self::new(
            whitelist,
            DEFAULT_IGNORE_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
        )
    }

    /// Whitelist and namespace exclusions, shared with the collision audit.
    pub fn excludes(&self, title: &str) -> Option<SkipReason> {
        if let Some(whitelist) = &self.whitelist
            && !whitelist.contains(title)
        {
            return Some(SkipReason::NotWhitelisted);
        }
        if self
            .ignore_prefixes
            .iter()
            .any(|prefix| title.starts_with(prefix.as_str()))
        {
            return Some(SkipReason::IgnoredPrefix);
        }
        None
    }

    pub fn route(&self, record: &Record) -> Result<Route, MarkupError> {
        if let Some(reason) = self.excludes(record.title()) {
            return Ok(Route::Skip(reason));
        }
        let revision = match record {
            Record::Upload(upload) if upload.content.is_none() => {
                return Ok(Route::Skip(SkipReason::MissingContent));
            }
            Record::Upload(_) => return Ok(Route::File),
            Record::Revision(revision) => revision,
        };
        if is_file_title(&revision.title) {
            return Ok(Route::Skip(SkipReason::DescriptionPage));
        }
        if revision.title.starts_with(TEMPLATE_PREFIX) {
            return Ok(Route::Skip(SkipReason::Template));
        }
        let Some(content) = &revision.content else {
            return Ok(Route::Skip(SkipReason::MissingContent));
        };

        let rewrite = markup::rewrite(content)?;
        Ok(match markup::detect_redirect(&rewrite.text) {
            Some(redirect) => Route::Redirect { redirect, rewrite },
            None => Route::Page(rewrite),
        })
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::converter::MarkupConverter;
use crate::frontmatter::{FrontMatter, render_page, render_redirect_stub};
use crate::identity::{AuthorKind, IdentityTable, commit_message};
use crate::layout::OutputLayout;
use crate::markup::{Redirect, Rewrite, relativize_wikilinks, with_title_header};
use crate::record::{FileUpload, PageRevision, Record};
use crate::route::{Route, RoutePolicy};
use crate::scm::{Changeset, VersionedHistory};
use crate::store::RevisionStore;

pub const DEFAULT_LAYOUT: &str = "wiki";
const UPLOAD_FALLBACK_MESSAGE: &str = "No comment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Render Markdown next to each markup snapshot.
    pub convert: bool,
    pub default_layout: Option<String>,
    pub prune_empty: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            convert: true,
            default_layout: Some(DEFAULT_LAYOUT.to_string()),
            prune_empty: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub records: u64,
    pub page_commits: u64,
    pub redirect_commits: u64,
    pub file_commits: u64,
    pub unwanted_commits: u64,
    pub empty_changesets: u64,
    pub skipped: BTreeMap<String, u64>,
    pub converter_failures: Vec<String>,
    pub missing_users: BTreeMap<String, u64>,
    pub redirects: usize,
    pub pruned: bool,
}

impl ReplayReport {
    pub fn commits(&self) -> u64 {
        self.page_commits + self.redirect_commits + self.file_commits
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }
}

/// Internal redirects seen so far: source title to target, and target to sources.
#[derive(Debug, Clone, Default)]
pub struct RedirectGraph {
    targets: BTreeMap<String, String>,
    sources: BTreeMap<String, BTreeSet<String>>,
}

impl RedirectGraph {
    pub fn record(&mut self, source: &str, target: &str) {
        self.remove(source);
        self.targets.insert(source.to_string(), target.to_string());
        self.sources
            .entry(target.to_string())
            .or_default()
            .insert(source.to_string());
    }

    pub fn remove(&mut self, source: &str) {
        let Some(target) = self.targets.remove(source) else {
            return;
        };
        if let Some(sources) = self.sources.get_mut(&target) {
            sources.remove(source);
            if sources.is_empty() {
                self.sources.remove(&target);
            }
        }
    }

    pub fn target_of(&self, source: &str) -> Option<&str> {
        self.targets.get(source).map(String::as_str)
    }

    /// Sorted source titles redirecting to `target`.
    pub fn sources_of(&self, target: &str) -> Vec<String> {
        self.sources
            .get(target)
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub struct ReplayEngine<H, C> {
    layout: OutputLayout,
    policy: RoutePolicy,
    identities: IdentityTable,
    history: H,
    converter: C,
    options: ReplayOptions,
    redirects: RedirectGraph,
    committed_hashes: HashMap<String, String>,
    report: ReplayReport,
}

impl<H: VersionedHistory, C: MarkupConverter> ReplayEngine<H, C> {
    pub fn new(
        layout: OutputLayout,
        policy: RoutePolicy,
        identities: IdentityTable,
        history: H,
        converter: C,
        options: ReplayOptions,
    ) -> Self {
        Self {
            layout,
            policy,
            identities,
            history,
            converter,
            options,
            redirects: RedirectGraph::default(),
            committed_hashes: HashMap::new(),
            report: ReplayReport::default(),
        }
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn converter(&self) -> &C {
        &self.converter
    }

    pub fn redirects(&self) -> &RedirectGraph {
        &self.redirects
    }

    pub fn report(&self) -> &ReplayReport {
        &self.report
    }

    /// Replays every stored record in chronological order, then finishes the run.
    pub fn run(&mut self, store: &RevisionStore) -> Result<ReplayReport> {
        store.for_each_chronological(|record| self.apply(record))?;
        self.finish()
    }

    pub fn apply(&mut self, record: Record) -> Result<()> {
        self.report.records += 1;
        let route = self.policy.route(&record).with_context(|| {
            format!("failed to rewrite {} as of {}", record.title(), record.date())
        })?;
        match (route, record) {
            (Route::Skip(reason), record) => {
                debug!(
                    "skipping {} as of {} ({})",
                    record.title(),
                    record.date(),
                    reason.as_str()
                );
                *self
                    .report
                    .skipped
                    .entry(reason.as_str().to_string())
                    .or_default() += 1;
                Ok(())
            }
            (Route::File, Record::Upload(upload)) => self.commit_upload(&upload),
            (Route::Page(rewrite), Record::Revision(revision)) => {
                self.commit_page(&revision, &rewrite)
            }
            (Route::Redirect { redirect, .. }, Record::Revision(revision)) => {
                self.commit_redirect(&revision, &redirect)
            }
            (_, record) => bail!(
                "no commit path for {} {}",
                record.kind().as_str(),
                record.title()
            ),
        }
    }

    pub fn finish(&mut self) -> Result<ReplayReport> {
        if self.options.prune_empty {
            self.history
                .prune_empty()
                .context("failed to prune empty commits")?;
            self.report.pruned = true;
        }
        self.report.redirects = self.redirects.len();
        Ok(self.report.clone())
    }

    fn commit_upload(&mut self, upload: &FileUpload) -> Result<()> {
        let path = self
            .layout
            .upload_file(&upload.title, upload.filename.as_deref())?;
        let bytes = decode_upload(upload.content.as_deref().unwrap_or_default())
            .with_context(|| format!("failed to decode upload {}", upload.title))?;
        if self.identities.is_denylisted(&upload.username) {
            warn!("upload {path} comes from denylisted {}", upload.username);
        }
        write_file(&self.layout.absolute(&path), &bytes)?;
        self.commit(
            vec![path],
            &upload.username,
            &upload.date,
            &upload.comment,
            UPLOAD_FALLBACK_MESSAGE,
        )?;
        self.report.file_commits += 1;
        Ok(())
    }

    fn commit_page(&mut self, revision: &PageRevision, rewrite: &Rewrite) -> Result<()> {
        let title = revision.title.as_str();
        let markup_path = self.layout.markup_file(title);
        let markup_absolute = self.layout.absolute(&markup_path);
        let previous = read_existing(&markup_absolute)?;
        write_markup_snapshot(&markup_absolute, revision)?;

        let mut paths = vec![markup_path];
        if self.options.convert {
            let markdown = match self.converter.convert(&rewrite.text) {
                Ok(markdown) => markdown,
                Err(err) => {
                    error!("conversion of {title} as of {} failed: {err}", revision.date);
                    restore(&markup_absolute, previous)?;
                    info!("skipping this revision of {title}");
                    self.report.converter_failures.push(title.to_string());
                    return Ok(());
                }
            };
            let markdown =
                relativize_wikilinks(&markdown, &self.layout.make_url(title), self.layout.prefix());
            let front = FrontMatter::for_page(
                &self.layout,
                title,
                &rewrite.categories,
                self.options.default_layout.as_deref(),
                &self.redirects.sources_of(title),
            );
            let markdown_path = self.layout.markdown_file(title);
            write_file(
                &self.layout.absolute(&markdown_path),
                render_page(&front, &markdown)?.as_bytes(),
            )?;
            paths.push(markdown_path);
        }

        self.redirects.remove(title);
        self.commit(
            paths,
            &revision.username,
            &revision.date,
            &revision.comment,
            &format!("Update {title}"),
        )?;
        self.report.page_commits += 1;
        Ok(())
    }

    fn commit_redirect(&mut self, revision: &PageRevision, redirect: &Redirect) -> Result<()> {
        let title = revision.title.as_str();
        let markup_path = self.layout.markup_file(title);
        write_markup_snapshot(&self.layout.absolute(&markup_path), revision)?;

        let mut paths = vec![markup_path];
        if self.options.convert {
            let markdown_path = self.layout.markdown_file(title);
            let stub = render_redirect_stub(&self.layout, title, redirect)?;
            write_file(&self.layout.absolute(&markdown_path), stub.as_bytes())?;
            paths.push(markdown_path);
        }

        match redirect {
            Redirect::Internal(target) => {
                info!("redirect {title} --> {target}");
                self.redirects.record(title, target);
            }
            Redirect::External(url) => {
                info!("external redirect {title} --> {url}");
                self.redirects.remove(title);
            }
        }
        self.commit(
            paths,
            &revision.username,
            &revision.date,
            &revision.comment,
            &format!("Update {title}"),
        )?;
        self.report.redirect_commits += 1;
        Ok(())
    }

    fn commit(
        &mut self,
        paths: Vec<String>,
        username: &str,
        date: &str,
        comment: &str,
        fallback: &str,
    ) -> Result<()> {
        let author = self.identities.resolve(username);
        if author.kind == AuthorKind::Unmapped {
            *self
                .report
                .missing_users
                .entry(username.to_string())
                .or_default() += 1;
        }
        let denylisted = self.identities.is_denylisted(username);
        let message = commit_message(denylisted, username, comment, fallback);
        if denylisted {
            self.report.unwanted_commits += 1;
            info!("UNWANTED {date} {} by {username}", paths[0]);
        } else {
            info!("commit {date} {} by {username}", paths[0]);
        }

        if self.record_hashes(&paths)? {
            debug!("changeset for {} leaves the tree unchanged", paths.join(", "));
            self.report.empty_changesets += 1;
        }

        let changeset = Changeset {
            paths,
            author: author.identity,
            date: date.to_string(),
            message,
        };
        self.history.commit(&changeset).with_context(|| {
            format!(
                "failed to commit {} as of {date}",
                changeset.paths.join(", ")
            )
        })?;
        Ok(())
    }

    /// Returns true when every path hashes the same as at its previous commit.
    fn record_hashes(&mut self, paths: &[String]) -> Result<bool> {
        let mut unchanged = true;
        for path in paths {
            let absolute = self.layout.absolute(path);
            let bytes = fs::read(&absolute)
                .with_context(|| format!("failed to read {}", absolute.display()))?;
            let hash = compute_hash(&bytes);
            if self.committed_hashes.get(path) != Some(&hash) {
                unchanged = false;
            }
            self.committed_hashes.insert(path.clone(), hash);
        }
        Ok(unchanged)
    }
}

fn write_markup_snapshot(path: &Path, revision: &PageRevision) -> Result<()> {
    let text = with_title_header(
        &revision.title,
        revision.content.as_deref().unwrap_or_default(),
    );
    write_file(path, text.as_bytes())
}

pub fn decode_upload(content: &str) -> Result<Vec<u8>> {
    let compact = content
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>();
    STANDARD
        .decode(compact.as_bytes())
        .context("contents are not valid base64")
}

pub(crate) fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read(path)
        .map(Some)
        .with_context(|| format!("failed to read {}", path.display()))
}

fn restore(path: &Path, previous: Option<Vec<u8>>) -> Result<()> {
    match previous {
        Some(bytes) => write_file(path, &bytes),
        None if path.exists() => {
            fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
        }
        None => Ok(()),
    }
}

fn compute_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

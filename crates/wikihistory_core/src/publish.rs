use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use crate::converter::MarkupConverter;
use crate::error::ConfigError;
use crate::frontmatter::{FrontMatter, render_page, render_redirect_stub};
use crate::layout::OutputLayout;
use crate::markup::{Redirect, Rewrite, detect_redirect, relativize_wikilinks, rewrite_with_header};
use crate::replay::{RedirectGraph, write_file};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub files_scanned: usize,
    pub redirects: usize,
    pub external_redirects: usize,
    pub converted: usize,
    pub overwritten: usize,
}

struct Snapshot {
    path: PathBuf,
    rewrite: Rewrite,
    title: String,
}

/// Expands files and directories (one level, `*.<mediawiki_ext>`) below the repository root.
pub fn collect_inputs(layout: &OutputLayout, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let ext = layout.mediawiki_ext();
    let mut names = Vec::new();
    for input in inputs {
        if input.is_absolute()
            || input
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(ConfigError::OutsideRepository(input.clone()).into());
        }
        let absolute = layout.repo_root().join(input);
        if absolute.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(&absolute).min_depth(1).max_depth(1) {
                let entry = entry
                    .with_context(|| format!("failed to list {}", absolute.display()))?;
                if entry.file_type().is_file() && has_extension(entry.path(), ext) {
                    found.push(entry.into_path());
                }
            }
            found.sort();
            names.extend(found);
        } else if absolute.is_file() && has_extension(&absolute, ext) {
            names.push(absolute);
        } else {
            bail!("unexpected input {}", input.display());
        }
    }
    info!("have {} input MediaWiki files", names.len());
    Ok(names)
}

/// Renders Markdown for markup snapshots written by a markup-only replay.
pub fn publish<C: MarkupConverter>(
    layout: &OutputLayout,
    files: &[PathBuf],
    converter: &mut C,
    default_layout: Option<&str>,
) -> Result<PublishReport> {
    let mut report = PublishReport {
        files_scanned: files.len(),
        ..PublishReport::default()
    };
    let mut redirects = RedirectGraph::default();
    let mut pages = Vec::new();

    info!("checking for redirects");
    for path in files {
        let original = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let rewrite = rewrite_with_header(&original)
            .with_context(|| format!("failed to rewrite {}", path.display()))?;
        let title = rewrite.title.clone().unwrap_or_default();
        match detect_redirect(&rewrite.text) {
            Some(Redirect::Internal(target)) => {
                info!("redirection {} --> {target}", path.display());
                redirects.record(&title, &target);
                report.redirects += 1;
            }
            Some(redirect @ Redirect::External(_)) => {
                let markdown_path = markdown_twin(layout, path);
                info!(
                    "redirection {} --> {}",
                    path.display(),
                    markdown_path.display()
                );
                if markdown_path.exists() {
                    warn!("will overwrite {}", markdown_path.display());
                    report.overwritten += 1;
                }
                let stub = render_redirect_stub(layout, &title, &redirect)?;
                write_file(&markdown_path, stub.as_bytes())?;
                report.redirects += 1;
                report.external_redirects += 1;
            }
            None => pages.push(Snapshot {
                path: path.clone(),
                rewrite,
                title,
            }),
        }
    }

    info!("converting pages");
    for page in pages {
        let markdown_path = markdown_twin(layout, &page.path);
        if markdown_path.exists() {
            warn!("will overwrite {}", markdown_path.display());
            report.overwritten += 1;
        }
        info!("{} --> {}", page.path.display(), markdown_path.display());

        let markdown = converter
            .convert(&page.rewrite.text)
            .with_context(|| format!("calling the converter failed for {}", page.path.display()))?;
        let url = layout.make_url(&page.title);
        let front = FrontMatter::for_page(
            layout,
            &page.title,
            &page.rewrite.categories,
            default_layout,
            &redirects.sources_of(&page.title),
        );
        let body = relativize_wikilinks(&markdown, &url, layout.prefix());
        write_file(&markdown_path, render_page(&front, &body)?.as_bytes())?;
        report.converted += 1;
    }
    Ok(report)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|value| value.to_str()) == Some(ext)
}

fn markdown_twin(layout: &OutputLayout, path: &Path) -> PathBuf {
    path.with_extension(layout.markdown_ext())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{collect_inputs, publish};
    use crate::converter::MarkupConverter;
    use crate::error::{ConfigError, ConverterError};
    use crate::layout::OutputLayout;
    use crate::markup::with_title_header;

    #[derive(Default)]
    struct EchoConverter {
        calls: usize,
    }

    impl MarkupConverter for EchoConverter {
        fn convert(&mut self, mediawiki: &str) -> Result<String, ConverterError> {
            self.calls += 1;
            if mediawiki.is_empty() {
                return Err(ConverterError::EmptyOutput {
                    program: "echo".to_string(),
                });
            }
            Ok(format!("{mediawiki} [Home](Main_Page \"wikilink\")\n"))
        }
    }

    fn write_snapshot(root: &Path, relative: &str, title: &str, text: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        fs::write(path, with_title_header(title, text)).expect("write snapshot");
    }

    fn layout(root: &Path) -> OutputLayout {
        OutputLayout::new(root, "wiki/", "mediawiki", "md").expect("layout")
    }

    #[test]
    fn redirects_become_redirect_from_entries() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_snapshot(root, "wiki/Main_Page.mediawiki", "Main Page", "Welcome\n[[Category:Intro]]");
        write_snapshot(root, "wiki/Home.mediawiki", "Home", "#REDIRECT [[Main Page]]");
        write_snapshot(
            root,
            "wiki/Elsewhere.mediawiki",
            "Elsewhere",
            "{{#externalredirect: https://example.org/}}",
        );
        write_snapshot(root, "wiki/BioSQL_Linux.mediawiki", "BioSQL/Linux", "Install");
        fs::write(root.join("wiki/notes.txt"), "ignored").expect("write other file");

        let layout = layout(root);
        let files = collect_inputs(&layout, &[PathBuf::from("wiki")]).expect("collect");
        assert_eq!(files.len(), 4);

        let mut converter = EchoConverter::default();
        let report = publish(&layout, &files, &mut converter, Some("wiki")).expect("publish");
        assert_eq!(report.files_scanned, 4);
        assert_eq!(report.redirects, 2);
        assert_eq!(report.external_redirects, 1);
        assert_eq!(report.converted, 2);
        assert_eq!(converter.calls, 2);

        let main = fs::read_to_string(root.join("wiki/Main_Page.md")).expect("main page");
        assert!(main.starts_with("---\ntitle: Main Page\npermalink: wiki/Main_Page\nlayout: wiki\n"));
        assert!(main.contains("tags:\n- Intro\n"));
        assert!(main.contains("redirect_from:\n- wiki/Home\n"));
        assert!(main.ends_with("Welcome [Home](Main_Page \"wikilink\")\n"));

        let nested = fs::read_to_string(root.join("wiki/BioSQL_Linux.md")).expect("nested page");
        assert!(nested.contains("permalink: wiki/BioSQL/Linux\n"));
        assert!(nested.contains("[Home](../Main_Page \"wikilink\")"));

        assert!(!root.join("wiki/Home.md").exists());
        let external = fs::read_to_string(root.join("wiki/Elsewhere.md")).expect("external stub");
        assert!(external.contains("redirect_to: https://example.org/\n"));
    }

    #[test]
    fn inputs_must_stay_inside_the_repository() {
        let temp = tempdir().expect("tempdir");
        let layout = layout(temp.path());
        let error = collect_inputs(&layout, &[PathBuf::from("../elsewhere")])
            .expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<ConfigError>(),
            Some(ConfigError::OutsideRepository(_))
        ));
        assert!(collect_inputs(&layout, &[PathBuf::from("missing.mediawiki")]).is_err());
    }

    #[test]
    fn converter_failure_is_fatal() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_snapshot(root, "wiki/Empty.mediawiki", "Empty", "");
        let layout = layout(root);
        let files = collect_inputs(&layout, &[PathBuf::from("wiki/Empty.mediawiki")])
            .expect("collect");
        let error = publish(&layout, &files, &mut EchoConverter::default(), None)
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("Empty.mediawiki"));
        assert!(!root.join("wiki/Empty.md").exists());
    }

    #[test]
    fn snapshot_without_header_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("wiki")).expect("create dir");
        fs::write(root.join("wiki/Raw.mediawiki"), "no header").expect("write");
        let layout = layout(root);
        let files = collect_inputs(&layout, &[PathBuf::from("wiki")]).expect("collect");
        let error = publish(&layout, &files, &mut EchoConverter::default(), None)
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("missing title header"));
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::layout::OutputLayout;
use crate::markup::Redirect;

pub const CATEGORY_PREFIX: &str = "Category:";
pub const TAG_PAGE_LAYOUT: &str = "tagpage";

/// Jekyll front-matter written above every Markdown page and redirect stub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontMatter {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub redirect_from: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl FrontMatter {
    /// Category pages list their tag through the `tagpage` layout; other pages carry `tags`.
    pub fn for_page(
        layout: &OutputLayout,
        title: &str,
        categories: &[String],
        default_layout: Option<&str>,
        redirect_sources: &[String],
    ) -> Self {
        let mut front = Self {
            title: title.to_string(),
            permalink: Some(layout.make_url(title)),
            ..Self::default()
        };
        if let Some(tag) = title.strip_prefix(CATEGORY_PREFIX) {
            front.layout = Some(TAG_PAGE_LAYOUT.to_string());
            front.tag = Some(tag.to_string());
        } else {
            front.layout = default_layout
                .filter(|value| !value.is_empty())
                .map(ToString::to_string);
            front.tags = categories.to_vec();
        }

        let mut sources = redirect_sources.to_vec();
        sources.sort();
        sources.dedup();
        front.redirect_from = sources
            .iter()
            .map(|source| layout.make_url(source))
            .collect();
        front
    }

    pub fn for_redirect(layout: &OutputLayout, title: &str, redirect: &Redirect) -> Self {
        Self {
            title: title.to_string(),
            permalink: Some(layout.make_url(title)),
            redirect_to: Some(redirect_link(layout, redirect)),
            ..Self::default()
        }
    }

    pub fn render(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)
            .with_context(|| format!("failed to render front-matter for {}", self.title))?;
        Ok(format!("---\n{yaml}---\n\n"))
    }
}

pub fn redirect_link(layout: &OutputLayout, redirect: &Redirect) -> String {
    match redirect {
        Redirect::Internal(target) => format!("/{}", layout.make_url(target)),
        Redirect::External(url) => url.clone(),
    }
}

pub fn render_page(front: &FrontMatter, markdown: &str) -> Result<String> {
    let mut document = front.render()?;
    document.push_str(markdown);
    if !document.ends_with('\n') {
        document.push('\n');
    }
    Ok(document)
}

pub fn render_redirect_stub(layout: &OutputLayout, title: &str, redirect: &Redirect) -> Result<String> {
    let front = FrontMatter::for_redirect(layout, title, redirect);
    let body = match redirect {
        Redirect::Internal(target) => format!(
            "You should automatically be redirected to [{target}]({})\n",
            redirect_link(layout, redirect)
        ),
        Redirect::External(url) => format!("You should be redirected to <{url}>\n"),
    };
    render_page(&front, &body)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{FrontMatter, render_page, render_redirect_stub};
    use crate::layout::OutputLayout;
    use crate::markup::Redirect;

    fn layout() -> OutputLayout {
        OutputLayout::new(Path::new("/repo"), "wiki/", "mediawiki", "md").expect("layout")
    }

    fn parse(document: &str) -> FrontMatter {
        let yaml = document
            .strip_prefix("---\n")
            .and_then(|rest| rest.split_once("---\n"))
            .map(|(yaml, _)| yaml)
            .expect("front-matter block");
        serde_yaml::from_str(yaml).expect("parse front-matter")
    }

    #[test]
    fn page_front_matter_carries_tags_and_redirect_sources() {
        let front = FrontMatter::for_page(
            &layout(),
            "Home",
            &["Intro".to_string(), "Tools".to_string()],
            Some("wiki"),
            &["Start Page".to_string(), "Main Page".to_string()],
        );
        let document = render_page(&front, "Hello").expect("render");
        assert!(document.starts_with("---\ntitle: Home\npermalink: wiki/Home\nlayout: wiki\n"));
        assert!(document.ends_with("---\n\nHello\n"));

        let parsed = parse(&document);
        assert_eq!(parsed.tags, vec!["Intro", "Tools"]);
        assert_eq!(parsed.redirect_from, vec!["wiki/Main_Page", "wiki/Start_Page"]);
        assert_eq!(parsed.tag, None);
    }

    #[test]
    fn category_page_uses_tag_layout() {
        let front = FrontMatter::for_page(
            &layout(),
            "Category:Tools",
            &["Ignored".to_string()],
            Some("wiki"),
            &[],
        );
        let parsed = parse(&render_page(&front, "").expect("render"));
        assert_eq!(parsed.layout.as_deref(), Some("tagpage"));
        assert_eq!(parsed.tag.as_deref(), Some("Tools"));
        assert!(parsed.tags.is_empty());
        assert_eq!(parsed.permalink.as_deref(), Some("wiki/Category%3ATools"));
    }

    #[test]
    fn redirect_stubs_point_at_target() {
        let internal = render_redirect_stub(
            &layout(),
            "Old Page",
            &Redirect::Internal("New Page".to_string()),
        )
        .expect("render");
        assert_eq!(
            parse(&internal).redirect_to.as_deref(),
            Some("/wiki/New_Page")
        );
        assert!(internal.contains("[New Page](/wiki/New_Page)"));

        let external = render_redirect_stub(
            &layout(),
            "Elsewhere",
            &Redirect::External("https://example.org/".to_string()),
        )
        .expect("render");
        assert_eq!(
            parse(&external).redirect_to.as_deref(),
            Some("https://example.org/")
        );
        assert!(external.ends_with("You should be redirected to <https://example.org/>\n"));
    }
}

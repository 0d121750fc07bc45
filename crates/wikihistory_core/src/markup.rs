use crate::error::MarkupError;

/// Tags from the site's syntax highlighter, rewritten to `<source lang=..>`.
pub const SOURCE_LANGUAGES: [&str; 7] = ["python", "perl", "sql", "bash", "ruby", "java", "xml"];
const TOC_DIRECTIVES: [&str; 3] = ["__TOC__", "__FORCETOC__", "__NOTOC__"];
const CATEGORY_MARKER: &str = "[[Category:";
const TITLE_HEADER_START: &str = "---\ntitle:";
const WIKILINK_SUFFIX: &str = " \"wikilink\")";
const EXTERNAL_REDIRECT: &str = "{{#externalredirect:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    pub categories: Vec<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Internal(String),
    External(String),
}

pub fn rewrite(text: &str) -> Result<Rewrite, MarkupError> {
    let mut lines = Vec::new();
    let mut categories = Vec::new();
    let mut in_source = false;

    for (index, raw) in text.split('\n').enumerate() {
        let line_number = index + 1;
        for line in normalize_language_tags(raw) {
            if in_source {
                in_source = !closes_source(&line);
                lines.push(line);
                continue;
            }
            if opens_source(&line) {
                in_source = !closes_source(&line);
                lines.push(line);
                continue;
            }
            if let Some(cleaned) = clean_line(line, line_number, &mut categories)? {
                lines.push(cleaned);
            }
        }
    }

    Ok(Rewrite {
        text: lines.join("\n"),
        categories,
        title: None,
    })
}

/// Rewrites a markup snapshot carrying the `---\ntitle: ..\n---` header written at replay.
pub fn rewrite_with_header(text: &str) -> Result<Rewrite, MarkupError> {
    let (title, body) = split_title_header(text)?;
    let mut rewritten = rewrite(body)?;
    rewritten.title = Some(title);
    Ok(rewritten)
}

pub fn with_title_header(title: &str, text: &str) -> String {
    format!("---\ntitle: {title}\n---\n\n{text}")
}

pub fn split_title_header(text: &str) -> Result<(String, &str), MarkupError> {
    let rest = text
        .strip_prefix(TITLE_HEADER_START)
        .ok_or(MarkupError::MissingTitleHeader)?;
    let (title, rest) = rest.split_once('\n').ok_or(MarkupError::MissingTitleHeader)?;
    let body = rest
        .strip_prefix("---\n")
        .ok_or(MarkupError::MissingTitleHeader)?;
    let body = body.strip_prefix('\n').unwrap_or(body);
    let title = title.trim();
    if title.is_empty() {
        return Err(MarkupError::MissingTitleHeader);
    }
    Ok((title.to_string(), body))
}

pub fn detect_redirect(text: &str) -> Option<Redirect> {
    let trimmed = text.trim();
    if let Some(keyword) = trimmed.get(..9)
        && keyword.eq_ignore_ascii_case("#redirect")
    {
        let target = trimmed[9..]
            .trim_start()
            .strip_prefix("[[")?
            .strip_suffix("]]")?
            .trim();
        if target.is_empty() || target.contains('\n') || target.contains(']') {
            return None;
        }
        return Some(Redirect::Internal(target.to_string()));
    }
    if let Some(opening) = trimmed.get(..EXTERNAL_REDIRECT.len())
        && opening.eq_ignore_ascii_case(EXTERNAL_REDIRECT)
    {
        let url = trimmed[EXTERNAL_REDIRECT.len()..].strip_suffix("}}")?.trim();
        if url.is_empty() || url.contains('\n') {
            return None;
        }
        return Some(Redirect::External(url.to_string()));
    }
    None
}

/// Makes converter wikilinks relative to the folder of a page whose URL has a `/`.
pub fn relativize_wikilinks(markdown: &str, page_url: &str, prefix: &str) -> String {
    let source = page_url.strip_prefix(prefix).unwrap_or(page_url);
    let Some((base, _)) = source.rsplit_once('/') else {
        return markdown.to_string();
    };

    let mut out = String::with_capacity(markdown.len());
    let mut rest = markdown;
    while let Some(start) = rest.find("](") {
        out.push_str(&rest[..start + 2]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find(WIKILINK_SUFFIX) else {
            continue;
        };
        let target = &rest[..end];
        if target.is_empty()
            || target.contains('\n')
            || target.contains("](")
            || is_absolute_link(target)
        {
            continue;
        }
        out.push_str(&relative_path(target, base));
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn is_absolute_link(target: &str) -> bool {
    ["http:", "https:", "ftp:", "mailto:", "/"]
        .iter()
        .any(|scheme| target.starts_with(scheme))
}

fn relative_path(target: &str, base: &str) -> String {
    let target_parts = target
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    let base_parts = base
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    let common = target_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(left, right)| left == right)
        .count();

    let mut parts = vec![".."; base_parts.len() - common];
    parts.extend_from_slice(&target_parts[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Splits one raw line into the lines produced by highlighter tag rewriting.
fn normalize_language_tags(line: &str) -> Vec<String> {
    let lower = line.to_ascii_lowercase();
    for lang in SOURCE_LANGUAGES {
        let plain = format!("<{lang}>");
        let with_attributes = format!("<{lang} ");

        let opening = if lower.starts_with(&plain) {
            Some((format!("<source lang={lang}>"), &line[plain.len()..]))
        } else if lower.starts_with(&with_attributes)
            && let Some(end) = line.find('>')
        {
            let attributes = line[with_attributes.len()..end].trim();
            Some((
                format!("<source lang={lang} {attributes}>"),
                &line[end + 1..],
            ))
        } else {
            None
        };

        if let Some((head, rest)) = opening {
            let mut out = vec![head];
            match split_closing_tag(rest, lang) {
                Some(closing) => out.extend(closing),
                None if !rest.trim().is_empty() => out.push(rest.to_string()),
                None => {}
            }
            return out;
        }
        if let Some(closing) = split_closing_tag(line, lang) {
            return closing;
        }
    }
    vec![line.to_string()]
}

/// Splits `text` at its first `</lang>` into content, `</source>` and any trailing text.
fn split_closing_tag(text: &str, lang: &str) -> Option<Vec<String>> {
    let tag = format!("</{lang}>");
    let start = text.to_ascii_lowercase().find(&tag)?;
    let content = &text[..start];
    let trailing = text[start + tag.len()..].trim();

    let mut out = Vec::new();
    if !content.trim().is_empty() {
        out.push(content.trim_end().to_string());
    }
    out.push("</source>".to_string());
    if !trailing.is_empty() {
        out.push(trailing.to_string());
    }
    Some(out)
}

fn opens_source(line: &str) -> bool {
    let lower = line.trim_start().to_ascii_lowercase();
    lower.starts_with("<source ") || lower.starts_with("<source>")
}

fn closes_source(line: &str) -> bool {
    line.trim_end().to_ascii_lowercase().ends_with("</source>")
}

fn clean_line(
    line: String,
    line_number: usize,
    categories: &mut Vec<String>,
) -> Result<Option<String>, MarkupError> {
    let unwrapped = un_div(&line);
    if TOC_DIRECTIVES.contains(&unwrapped) {
        return Ok(None);
    }
    let mut line = if is_image_reference(unwrapped) {
        unwrapped.to_string()
    } else {
        line
    };

    if line.contains(CATEGORY_MARKER) {
        let stripped = extract_categories(&line, line_number, categories)?;
        if stripped.is_empty() {
            return Ok(None);
        }
        line = stripped;
    }

    if line.contains("[[:Category:") {
        line = line.replace("[[:Category:", "[[Category%3A");
    }
    if line.contains("[[User:") {
        line = line.replace("[[User:", "[[User%3A");
    }
    Ok(Some(line))
}

/// Returns the inner text of `<div ...>X</div>`, or the line untouched.
fn un_div(line: &str) -> &str {
    let trimmed = line.trim();
    if trimmed.starts_with("<div ")
        && let Some(inner) = trimmed.strip_suffix("</div>")
        && let Some(open_end) = inner.find('>')
    {
        return inner[open_end + 1..].trim();
    }
    line
}

fn is_image_reference(text: &str) -> bool {
    (text.starts_with("[[Image:") || text.starts_with("[[File:")) && text.ends_with("]]")
}

fn extract_categories(
    line: &str,
    line_number: usize,
    categories: &mut Vec<String>,
) -> Result<String, MarkupError> {
    let mut remaining = line.to_string();
    while let Some(start) = remaining.find(CATEGORY_MARKER) {
        let after = start + CATEGORY_MARKER.len();
        let Some(length) = remaining[after..].find("]]") else {
            return Err(MarkupError::UnclosedCategory {
                line: line_number,
                text: line.to_string(),
            });
        };
        let inner = &remaining[after..after + length];
        let name = inner.split('|').next().unwrap_or_default().trim();
        if !name.is_empty() {
            categories.push(name.to_string());
        }
        remaining.replace_range(start..after + length + 2, "");
    }
    Ok(remaining.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::{
        Redirect, detect_redirect, relativize_wikilinks, rewrite, rewrite_with_header,
        split_title_header, with_title_header,
    };
    use crate::error::MarkupError;

    #[test]
    fn image_div_is_unwrapped() {
        let text = "---\ntitle: Test\n---\n<div style=\"float:left; maxwidth: 180px; margin-left:25px\">[[Image:Pear.png|left|The Bosc Pear]]</div>";
        let rewritten = rewrite_with_header(text).expect("rewrite");
        assert_eq!(rewritten.text, "[[Image:Pear.png|left|The Bosc Pear]]");
        assert!(rewritten.categories.is_empty());
        assert_eq!(rewritten.title.as_deref(), Some("Test"));
    }

    #[test]
    fn non_image_div_is_kept() {
        let text = "<div class=\"note\">Read this</div>";
        assert_eq!(rewrite(text).expect("rewrite").text, text);
    }

    #[test]
    fn language_tags_become_source_blocks() {
        let text = "<python>\nprint(1)\n</python>\n<PERL id=demo>\nprint 2;\n</Perl>";
        assert_eq!(
            rewrite(text).expect("rewrite").text,
            "<source lang=python>\nprint(1)\n</source>\n<source lang=perl id=demo>\nprint 2;\n</source>"
        );
    }

    #[test]
    fn same_line_source_is_split() {
        let text = "<python>print(\"Hello world\")</python>\nafter";
        assert_eq!(
            rewrite(text).expect("rewrite").text,
            "<source lang=python>\nprint(\"Hello world\")\n</source>\nafter"
        );
    }

    #[test]
    fn text_after_a_same_line_closing_tag_leaves_the_block() {
        let rewritten = rewrite("<python>a</python> b\nText\n__TOC__\n[[Category:X]]").expect("rewrite");
        assert_eq!(
            rewritten.text,
            "<source lang=python>\na\n</source>\nb\nText"
        );
        assert_eq!(rewritten.categories, vec!["X"]);
    }

    #[test]
    fn closing_tag_mid_line_ends_an_open_block() {
        let rewritten = rewrite("<bash>\necho hi</BASH> done [[Category:Shell]]").expect("rewrite");
        assert_eq!(
            rewritten.text,
            "<source lang=bash>\necho hi\n</source>\ndone"
        );
        assert_eq!(rewritten.categories, vec!["Shell"]);
    }

    #[test]
    fn code_inside_source_block_is_verbatim() {
        let text = "<source lang=python>\n__TOC__\n# [[Category:Fake]]\n</source>\n__TOC__";
        let rewritten = rewrite(text).expect("rewrite");
        assert_eq!(
            rewritten.text,
            "<source lang=python>\n__TOC__\n# [[Category:Fake]]\n</source>"
        );
        assert!(rewritten.categories.is_empty());
    }

    #[test]
    fn toc_directives_are_dropped() {
        let text = "__TOC__\nIntro\n__NOTOC__\n<div class=\"x\">__FORCETOC__</div>";
        assert_eq!(rewrite(text).expect("rewrite").text, "Intro");
    }

    #[test]
    fn categories_are_extracted_in_order() {
        let text = "Body\n\n[[Category:Tools|sort key]] [[Category: Tutorial ]]\nSee also [[Category:Tools]] here";
        let rewritten = rewrite(text).expect("rewrite");
        assert_eq!(rewritten.categories, vec!["Tools", "Tutorial", "Tools"]);
        assert_eq!(rewritten.text, "Body\n\nSee also  here");
    }

    #[test]
    fn unclosed_category_names_the_line() {
        let error = rewrite("ok\n[[Category:Broken").expect_err("must fail");
        assert_eq!(
            error,
            MarkupError::UnclosedCategory {
                line: 2,
                text: "[[Category:Broken".to_string()
            }
        );
    }

    #[test]
    fn converter_workaround_escapes() {
        let rewritten = rewrite("See [[:Category:Tools]] and [[User:Alice|Alice]]").expect("rewrite");
        assert_eq!(
            rewritten.text,
            "See [[Category%3ATools]] and [[User%3AAlice|Alice]]"
        );
        assert!(rewritten.categories.is_empty());
    }

    #[test]
    fn rewrite_is_idempotent() {
        let text = "<python>x = 1</python>\n__TOC__\n[[Category:A]]\nSee [[:Category:B]] [[User:C]]\n<div a=\"b\">[[File:X.png]]</div>";
        let once = rewrite(text).expect("first");
        let twice = rewrite(&once.text).expect("second");
        assert_eq!(once.text, twice.text);
    }

    #[test]
    fn title_header_round_trip_strips_one_blank_line() {
        let full = with_title_header("BioSQL/Windows", "\nbody");
        let (title, body) = split_title_header(&full).expect("header");
        assert_eq!(title, "BioSQL/Windows");
        assert_eq!(body, "\nbody");
        assert_eq!(
            rewrite_with_header("plain text").expect_err("must fail"),
            MarkupError::MissingTitleHeader
        );
    }

    #[test]
    fn redirects_are_detected() {
        assert_eq!(
            detect_redirect("  #REDIRECT [[Main Page]]\n"),
            Some(Redirect::Internal("Main Page".to_string()))
        );
        assert_eq!(
            detect_redirect("#redirect [[Main Page]]"),
            Some(Redirect::Internal("Main Page".to_string()))
        );
        assert_eq!(
            detect_redirect("{{#externalredirect: https://example.org/x}}"),
            Some(Redirect::External("https://example.org/x".to_string()))
        );
        assert_eq!(detect_redirect("#REDIRECT [[A]] and [[B]]"), None);
        assert_eq!(detect_redirect("Just text"), None);
    }

    #[test]
    fn wikilinks_are_relativized_for_nested_pages() {
        let markdown = "[Home](Main_Page \"wikilink\") [Win](BioSQL/Windows \"wikilink\") [ext](https://x.org \"wikilink\")";
        assert_eq!(
            relativize_wikilinks(markdown, "wiki/BioSQL/Linux", "wiki/"),
            "[Home](../Main_Page \"wikilink\") [Win](Windows \"wikilink\") [ext](https://x.org \"wikilink\")"
        );
        assert_eq!(
            relativize_wikilinks(markdown, "wiki/Main_Page", "wiki/"),
            markdown
        );
    }
}

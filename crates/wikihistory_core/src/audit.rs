use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use log::{debug, warn};
use serde::Serialize;

use crate::route::RoutePolicy;
use crate::store::{RevisionStore, upper_cased_twin};

/// Two titles that only differ by letter case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseCollision {
    pub first: String,
    pub second: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub case_sensitive: bool,
    pub titles_scanned: usize,
    pub collisions: Vec<CaseCollision>,
}

/// Scans titles in the given order, pairing each case-fold duplicate with the first spelling seen.
pub fn find_case_collisions<I, S>(titles: I) -> Vec<CaseCollision>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    let mut collisions = Vec::new();
    for title in titles {
        let title = title.as_ref();
        let folded = title.to_lowercase();
        match seen.get(&folded) {
            Some(first) if first != title => collisions.push(CaseCollision {
                first: first.clone(),
                second: title.to_string(),
            }),
            Some(_) => {}
            None => {
                seen.insert(folded, title.to_string());
            }
        }
    }
    collisions
}

/// True when `probe` can also be reached with its file name upper-cased.
///
/// A name that is already upper case tells us nothing, so it counts as case-insensitive
/// and the audit runs anyway.
pub fn is_case_insensitive(probe: &Path) -> bool {
    match upper_cased_twin(probe) {
        Some(twin) if twin == probe => true,
        Some(twin) => twin.exists(),
        None => true,
    }
}

/// Warns about titles a case-insensitive checkout could not hold side by side.
pub fn audit_store(store: &RevisionStore, policy: &RoutePolicy) -> Result<AuditReport> {
    if !is_case_insensitive(store.path()) {
        debug!("case-sensitive file system; skipping title collision audit");
        return Ok(AuditReport {
            case_sensitive: true,
            ..AuditReport::default()
        });
    }

    let titles = store
        .distinct_titles()?
        .into_iter()
        .filter(|title| policy.excludes(title).is_none())
        .collect::<Vec<_>>();
    let collisions = find_case_collisions(&titles);
    for collision in &collisions {
        warn!(
            "case collision: {:?} and {:?} cannot coexist on a case-insensitive file system",
            collision.first, collision.second
        );
    }
    Ok(AuditReport {
        case_sensitive: false,
        titles_scanned: titles.len(),
        collisions,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;

    use tempfile::tempdir;

    use super::{CaseCollision, audit_store, find_case_collisions, is_case_insensitive};
    use crate::ingest::ExportSource;
    use crate::route::RoutePolicy;
    use crate::store::open_or_build;

    #[test]
    fn differing_case_is_reported_with_both_spellings() {
        let collisions = find_case_collisions(["Page", "Page2", "page"]);
        assert_eq!(
            collisions,
            vec![CaseCollision {
                first: "Page".to_string(),
                second: "page".to_string(),
            }]
        );
    }

    #[test]
    fn prefix_and_repeats_are_not_collisions() {
        assert!(find_case_collisions(["Page", "Page2"]).is_empty());
        assert!(find_case_collisions(["Page", "Page"]).is_empty());
        assert!(find_case_collisions(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn third_spelling_pairs_with_the_first() {
        let collisions = find_case_collisions(["HOME", "Home", "home"]);
        assert_eq!(collisions.len(), 2);
        assert!(collisions.iter().all(|collision| collision.first == "HOME"));
    }

    #[test]
    fn probe_detects_upper_cased_twin() {
        let temp = tempdir().expect("tempdir");
        let probe = temp.path().join("dump.xml.sqlite");
        fs::write(&probe, "").expect("write probe");
        let twin_visible = temp.path().join("DUMP.XML.SQLITE").exists();
        assert_eq!(is_case_insensitive(&probe), twin_visible);
        assert!(is_case_insensitive(&temp.path().join("UPPER")));
    }

    #[test]
    fn audit_ignores_excluded_titles() {
        let temp = tempdir().expect("tempdir");
        let export = temp.path().join("dump.xml");
        fs::write(
            &export,
            r#"<mediawiki>
  <page><title>Page</title><revision><timestamp>2010-01-01T00:00:00Z</timestamp><text>a</text></revision></page>
  <page><title>page</title><revision><timestamp>2010-01-02T00:00:00Z</timestamp><text>b</text></revision></page>
  <page><title>Talk:X</title><revision><timestamp>2010-01-03T00:00:00Z</timestamp><text>c</text></revision></page>
  <page><title>Talk:x</title><revision><timestamp>2010-01-04T00:00:00Z</timestamp><text>d</text></revision></page>
</mediawiki>"#,
        )
        .expect("write export");
        let (store, _) = open_or_build(&ExportSource::File(export), 10).expect("store");

        let report = audit_store(&store, &RoutePolicy::with_default_prefixes(None)).expect("audit");
        if report.case_sensitive {
            assert!(report.collisions.is_empty());
            return;
        }
        assert_eq!(report.titles_scanned, 2);
        assert_eq!(
            report.collisions,
            vec![CaseCollision {
                first: "Page".to_string(),
                second: "page".to_string(),
            }]
        );

        let whitelist = BTreeSet::from(["Page".to_string()]);
        let report = audit_store(&store, &RoutePolicy::with_default_prefixes(Some(whitelist)))
            .expect("audit");
        assert!(report.collisions.is_empty());
    }
}

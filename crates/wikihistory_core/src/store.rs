use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::ingest::{ExportReader, ExportSource};
use crate::record::{FileUpload, PageRevision, Record, RecordKind};

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS revisions (
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    filename TEXT,
    date TEXT NOT NULL,
    username TEXT NOT NULL,
    content TEXT,
    comment TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ingest_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SORT_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_date_title ON revisions(date, title)";
const SORT_INDEX_NAME: &str = "idx_date_title";
const CHECKPOINT_KEY: &str = "committed_records";
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreStatus {
    Missing,
    Stale,
    Partial { committed: u64 },
    Ready { records: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAction {
    Reused,
    Resumed,
    Rebuilt,
}

impl StoreAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reused => "reused",
            Self::Resumed => "resumed",
            Self::Rebuilt => "rebuilt",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    pub store_path: String,
    pub action: StoreAction,
    pub records: u64,
    pub skipped_on_resume: u64,
}

pub struct RevisionStore {
    path: PathBuf,
    connection: Connection,
}

/// `<input>.sqlite` next to the export, `stdin.sqlite` in the working directory for stdin.
pub fn store_path_for(source: &ExportSource) -> PathBuf {
    match source {
        ExportSource::Stdin => PathBuf::from("stdin.sqlite"),
        ExportSource::File(path) => {
            let mut name = path.as_os_str().to_os_string();
            name.push(".sqlite");
            PathBuf::from(name)
        }
    }
}

pub fn inspect_store(store_path: &Path, source: &ExportSource) -> Result<StoreStatus> {
    if !store_path.exists() {
        return Ok(StoreStatus::Missing);
    }
    let Some(source_path) = source.path() else {
        return Ok(StoreStatus::Stale);
    };
    if modified(store_path)? <= modified(source_path)? {
        return Ok(StoreStatus::Stale);
    }

    match probe_store(store_path) {
        Ok(status) => Ok(status),
        Err(error) => {
            warn!(
                "{} is not a usable store, rebuilding: {error:#}",
                normalize_path(store_path)
            );
            Ok(StoreStatus::Stale)
        }
    }
}

fn probe_store(store_path: &Path) -> Result<StoreStatus> {
    let connection = open_connection(store_path)?;
    if !table_exists(&connection, "revisions")? || !table_exists(&connection, "ingest_state")? {
        return Ok(StoreStatus::Stale);
    }
    if index_exists(&connection, SORT_INDEX_NAME)? {
        let records = count_query(&connection, "SELECT COUNT(*) FROM revisions")?;
        return Ok(StoreStatus::Ready { records });
    }
    match read_checkpoint(&connection)? {
        Some(committed) => Ok(StoreStatus::Partial { committed }),
        None => Ok(StoreStatus::Stale),
    }
}

/// Reuses, resumes or rebuilds the store for `source`, leaving it sorted and ready.
pub fn open_or_build(
    source: &ExportSource,
    checkpoint_interval: usize,
) -> Result<(RevisionStore, StoreReport)> {
    let store_path = store_path_for(source);
    let status = inspect_store(&store_path, source)?;
    debug!("store {} status {:?}", store_path.display(), status);

    let (action, skipped) = match status {
        StoreStatus::Ready { records } if records > 0 => {
            info!(
                "reusing {} ({records} records)",
                normalize_path(&store_path)
            );
            (StoreAction::Reused, 0)
        }
        StoreStatus::Partial { committed } => {
            info!(
                "resuming {} after {committed} committed records",
                normalize_path(&store_path)
            );
            let mut connection = open_connection(&store_path)?;
            populate(&mut connection, source, committed, checkpoint_interval)?;
            (StoreAction::Resumed, committed)
        }
        _ => {
            remove_store_files(&store_path)?;
            info!(
                "parsing {} into {}",
                source.display(),
                normalize_path(&store_path)
            );
            let mut connection = open_connection(&store_path)?;
            initialize_schema(&connection)?;
            populate(&mut connection, source, 0, checkpoint_interval)?;
            (StoreAction::Rebuilt, 0)
        }
    };

    let store = RevisionStore::open(&store_path)?;
    let records = store.record_count()?;
    let report = StoreReport {
        store_path: normalize_path(&store_path),
        action,
        records,
        skipped_on_resume: skipped,
    };
    Ok((store, report))
}

fn populate(
    connection: &mut Connection,
    source: &ExportSource,
    skip: u64,
    checkpoint_interval: usize,
) -> Result<()> {
    let interval = checkpoint_interval.max(1) as u64;
    let reader = ExportReader::new(source.open()?);
    let mut seen = 0u64;
    let mut committed = skip;
    let mut pending = 0u64;

    connection
        .execute_batch("BEGIN")
        .context("failed to start ingest transaction")?;
    for item in reader {
        let record = item.with_context(|| format!("failed to parse {}", source.display()))?;
        seen += 1;
        if seen <= skip {
            continue;
        }
        insert_record(connection, &record)?;
        pending += 1;
        if pending >= interval {
            committed += pending;
            pending = 0;
            write_checkpoint(connection, committed)?;
            connection
                .execute_batch("COMMIT; BEGIN")
                .context("failed to commit ingest batch")?;
            debug!("ingested {committed} records");
        }
    }
    if seen < skip {
        bail!(
            "{} holds {seen} records but the store checkpoint claims {skip}",
            source.display()
        );
    }
    committed += pending;
    write_checkpoint(connection, committed)?;
    connection
        .execute_batch("COMMIT")
        .context("failed to commit final ingest batch")?;

    connection
        .execute_batch(SORT_INDEX_SQL)
        .context("failed to create date/title sort index")?;
    debug!("ingest complete: {committed} records");
    Ok(())
}

fn insert_record(connection: &Connection, record: &Record) -> Result<()> {
    let mut statement = connection
        .prepare_cached(
            "INSERT INTO revisions (kind, title, filename, date, username, content, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .context("failed to prepare revisions insert")?;
    let (filename, content) = match record {
        Record::Revision(revision) => (None, revision.content.as_deref()),
        Record::Upload(upload) => (upload.filename.as_deref(), upload.content.as_deref()),
    };
    statement
        .execute(params![
            record.kind().as_str(),
            record.title(),
            filename,
            record.date(),
            record.username(),
            content,
            record.comment(),
        ])
        .with_context(|| format!("failed to insert record for {}", record.title()))?;
    Ok(())
}

fn write_checkpoint(connection: &Connection, committed: u64) -> Result<()> {
    connection
        .execute(
            "INSERT INTO ingest_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CHECKPOINT_KEY, committed.to_string()],
        )
        .context("failed to write ingest checkpoint")?;
    Ok(())
}

fn read_checkpoint(connection: &Connection) -> Result<Option<u64>> {
    let value: Option<String> = connection
        .query_row(
            "SELECT value FROM ingest_state WHERE key = ?1",
            [CHECKPOINT_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read ingest checkpoint")?;
    value
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("invalid ingest checkpoint {value:?}"))
        })
        .transpose()
}

impl RevisionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = open_connection(path)?;
        if !table_exists(&connection, "revisions")? {
            bail!("{} is not a revision store", path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
            connection,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> Result<u64> {
        count_query(&self.connection, "SELECT COUNT(*) FROM revisions")
    }

    pub fn distinct_titles(&self) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT DISTINCT title FROM revisions ORDER BY title ASC")
            .context("failed to prepare distinct title query")?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to run distinct title query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read title row")?);
        }
        Ok(out)
    }

    /// Visits every record ordered by date, then title, then insertion order.
    pub fn for_each_chronological<F>(&self, mut visit: F) -> Result<u64>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let mut statement = self
            .connection
            .prepare(
                "SELECT kind, title, filename, date, username, content, comment
                 FROM revisions
                 ORDER BY date ASC, title ASC, rowid ASC",
            )
            .context("failed to prepare chronological scan")?;
        let rows = statement
            .query_map([], |row| {
                Ok(StoredRow {
                    kind: row.get(0)?,
                    title: row.get(1)?,
                    filename: row.get(2)?,
                    date: row.get(3)?,
                    username: row.get(4)?,
                    content: row.get(5)?,
                    comment: row.get(6)?,
                })
            })
            .context("failed to run chronological scan")?;

        let mut visited = 0u64;
        for row in rows {
            let record = row.context("failed to read revision row")?.into_record()?;
            visit(record)?;
            visited += 1;
        }
        Ok(visited)
    }
}

struct StoredRow {
    kind: String,
    title: String,
    filename: Option<String>,
    date: String,
    username: String,
    content: Option<String>,
    comment: String,
}

impl StoredRow {
    fn into_record(self) -> Result<Record> {
        let Some(kind) = RecordKind::parse(&self.kind) else {
            bail!("unknown record kind {:?} for {}", self.kind, self.title);
        };
        Ok(match kind {
            RecordKind::Revision => Record::Revision(PageRevision {
                title: self.title,
                date: self.date,
                username: self.username,
                content: self.content,
                comment: self.comment,
            }),
            RecordKind::Upload => Record::Upload(FileUpload {
                title: self.title,
                filename: self.filename,
                date: self.date,
                username: self.username,
                content: self.content,
                comment: self.comment,
            }),
        })
    }
}

/// Removes the store, its WAL sidecars and an upper-cased twin left by case probes.
fn remove_store_files(store_path: &Path) -> Result<()> {
    let mut candidates = vec![store_path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = store_path.as_os_str().to_os_string();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }
    if let Some(twin) = upper_cased_twin(store_path)
        && twin != store_path
    {
        candidates.push(twin);
    }
    for path in candidates {
        if path.exists() {
            warn!("removing stale store file {}", normalize_path(&path));
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

pub fn upper_cased_twin(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(name.to_uppercase()))
}

fn modified(path: &Path) -> Result<std::time::SystemTime> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .with_context(|| format!("failed to read modification time of {}", path.display()))
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(STORE_SCHEMA_SQL)
        .context("failed to initialize store schema")
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    sqlite_master_has(connection, "table", table_name)
}

fn index_exists(connection: &Connection, index_name: &str) -> Result<bool> {
    sqlite_master_has(connection, "index", index_name)
}

fn sqlite_master_has(connection: &Connection, kind: &str, name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            [kind, name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for {kind} {name}"))?;
    Ok(exists == 1)
}

fn count_query(connection: &Connection, sql: &str) -> Result<u64> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    u64::try_from(count).context("count does not fit into u64")
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

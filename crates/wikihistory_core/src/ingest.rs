use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::MultiGzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::IngestError;
use crate::record::{FileUpload, PageRevision, Record, RecordKind, is_file_title};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSource {
    Stdin,
    File(PathBuf),
}

impl ExportSource {
    pub fn parse(value: &str) -> Self {
        if value == "-" || value == "/dev/stdin" {
            Self::Stdin
        } else {
            Self::File(PathBuf::from(value))
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Stdin => None,
            Self::File(path) => Some(path),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Self::Stdin => "<stdin>".to_string(),
            Self::File(path) => path.to_string_lossy().replace('\\', "/"),
        }
    }

    /// Opens the export, transparently decompressing gzip and bzip2 input.
    pub fn open(&self) -> Result<Box<dyn BufRead>> {
        match self {
            Self::Stdin => open_decoded(io::stdin(), None).context("failed to read standard input"),
            Self::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                open_decoded(file, Compression::from_extension(path))
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Returns `None` when the extension says nothing, so the caller sniffs the stream.
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Some(Self::Gzip),
            Some("bz2") => Some(Self::Bzip2),
            _ => None,
        }
    }

    /// Gzip starts with `1f 8b`, bzip2 with `BZh`.
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(b"BZh") {
            Self::Bzip2
        } else {
            Self::None
        }
    }
}

pub fn open_decoded<R: Read + 'static>(
    reader: R,
    hint: Option<Compression>,
) -> io::Result<Box<dyn BufRead>> {
    let mut buffered = BufReader::new(reader);
    let compression = match hint {
        Some(compression) => compression,
        None => Compression::from_magic_bytes(buffered.fill_buf()?),
    };
    Ok(match compression {
        Compression::None => Box::new(buffered),
        Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(buffered))),
        Compression::Bzip2 => Box::new(BufReader::new(MultiBzDecoder::new(buffered))),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Timestamp,
    Username,
    Comment,
    Text,
    Contents,
    Filename,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"title" => Some(Self::Title),
            b"timestamp" => Some(Self::Timestamp),
            b"username" => Some(Self::Username),
            b"comment" => Some(Self::Comment),
            b"text" => Some(Self::Text),
            b"contents" => Some(Self::Contents),
            b"filename" => Some(Self::Filename),
            _ => None,
        }
    }
}

/// Scoped accumulators for the element currently being walked.
#[derive(Debug, Default)]
struct ParseState {
    page_open: bool,
    record_open: Option<RecordKind>,
    capture: Option<Field>,
    text: String,
    title: Option<String>,
    date: Option<String>,
    username: Option<String>,
    comment: Option<String>,
    content: Option<String>,
    filename: Option<String>,
}

impl ParseState {
    fn start(&mut self, start: &BytesStart<'_>, position: usize) -> Result<(), IngestError> {
        let local = start.local_name();
        let tag = local.as_ref();
        match tag {
            b"page" => {
                if self.page_open {
                    return Err(unexpected_start("page", position, "another <page> is still open"));
                }
                self.reset_record();
                self.page_open = true;
                self.title = None;
            }
            b"revision" | b"upload" => {
                let kind = if tag == b"upload" {
                    RecordKind::Upload
                } else {
                    RecordKind::Revision
                };
                if let Some(open) = self.record_open {
                    return Err(unexpected_start(
                        kind.as_str(),
                        position,
                        &format!("a <{}> is still open", open.as_str()),
                    ));
                }
                if let Some(date) = &self.date {
                    return Err(unexpected_start(
                        kind.as_str(),
                        position,
                        &format!("timestamp {date} is still pending"),
                    ));
                }
                self.record_open = Some(kind);
            }
            _ => {
                let Some(field) = Field::from_tag(tag) else {
                    return Ok(());
                };
                let in_scope = match field {
                    Field::Title => self.page_open && self.record_open.is_none(),
                    _ => self.record_open.is_some(),
                };
                if !in_scope {
                    return Ok(());
                }
                if field == Field::Contents
                    && let Some(encoding) = attribute(start, "encoding", position)?
                    && encoding != "base64"
                {
                    return Err(IngestError::UnsupportedEncoding { encoding, position });
                }
                if field == Field::Text && attribute(start, "deleted", position)?.is_some() {
                    return Ok(());
                }
                self.capture = Some(field);
                self.text.clear();
            }
        }
        Ok(())
    }

    fn text(&mut self, value: &str) {
        if self.capture.is_some() {
            self.text.push_str(value);
        }
    }

    fn end(&mut self, tag: &[u8], position: usize) -> Result<Option<Record>, IngestError> {
        if let Some(field) = self.capture
            && Field::from_tag(tag) == Some(field)
        {
            self.capture = None;
            let value = std::mem::take(&mut self.text);
            self.store_field(field, value, position)?;
            return Ok(None);
        }
        match tag {
            b"revision" if self.record_open == Some(RecordKind::Revision) => {
                self.finish_record(RecordKind::Revision, position).map(Some)
            }
            b"upload" if self.record_open == Some(RecordKind::Upload) => {
                self.finish_record(RecordKind::Upload, position).map(Some)
            }
            b"page" => {
                self.reset_record();
                self.page_open = false;
                self.title = None;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn store_field(&mut self, field: Field, value: String, position: usize) -> Result<(), IngestError> {
        match field {
            Field::Title => self.title = Some(value.trim().to_string()),
            Field::Timestamp => self.date = Some(normalize_timestamp(value.trim(), position)?),
            Field::Username => self.username = Some(value.trim().to_string()),
            Field::Comment => self.comment = Some(value.trim().to_string()),
            Field::Text => self.content = Some(value),
            Field::Contents => self.content = Some(value.trim().to_string()),
            Field::Filename => self.filename = Some(value.trim().to_string()),
        }
        Ok(())
    }

    fn finish_record(&mut self, kind: RecordKind, position: usize) -> Result<Record, IngestError> {
        let title = self.title.clone();
        let date = self.date.take();
        let username = self.username.take().unwrap_or_default();
        let comment = self.comment.take().unwrap_or_default();
        let content = self.content.take();
        let filename = self.filename.take().filter(|name| !name.is_empty());
        self.record_open = None;
        self.capture = None;

        let element = kind.as_str().to_string();
        let title = title.ok_or_else(|| IngestError::MissingField {
            element: element.clone(),
            position,
            field: "title",
        })?;
        let date = date.ok_or(IngestError::MissingField {
            element,
            position,
            field: "timestamp",
        })?;

        Ok(match kind {
            RecordKind::Revision => Record::Revision(PageRevision {
                title,
                date,
                username,
                content,
                comment,
            }),
            RecordKind::Upload => {
                if !is_file_title(&title) {
                    return Err(IngestError::UploadWithoutFileTitle { title, position });
                }
                Record::Upload(FileUpload {
                    title,
                    filename,
                    date,
                    username,
                    content,
                    comment,
                })
            }
        })
    }

    fn reset_record(&mut self) {
        self.record_open = None;
        self.capture = None;
        self.text.clear();
        self.date = None;
        self.username = None;
        self.comment = None;
        self.content = None;
        self.filename = None;
    }
}

fn read_error(error: quick_xml::Error, position: usize) -> IngestError {
    match error {
        quick_xml::Error::Io(source) => {
            IngestError::Io(io::Error::new(source.kind(), source.to_string()))
        }
        error => IngestError::Xml {
            position,
            message: error.to_string(),
        },
    }
}

/// Lazily flattens a nested export into records, one element event at a time.
pub struct ExportReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    state: ParseState,
    finished: bool,
}

impl<R: BufRead> ExportReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            reader: Reader::from_reader(input),
            buf: Vec::new(),
            state: ParseState::default(),
            finished: false,
        }
    }

    fn advance(&mut self) -> Result<Option<Record>, IngestError> {
        loop {
            self.buf.clear();
            let position = self.reader.buffer_position();
            let event = self
                .reader
                .read_event_into(&mut self.buf)
                .map_err(|error| read_error(error, position))?;
            match event {
                Event::Start(start) => self.state.start(&start, position)?,
                Event::Empty(start) => {
                    self.state.start(&start, position)?;
                    let local = start.local_name();
                    if let Some(record) = self.state.end(local.as_ref(), position)? {
                        return Ok(Some(record));
                    }
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(|error| IngestError::Xml {
                        position,
                        message: error.to_string(),
                    })?;
                    self.state.text(&value);
                }
                Event::CData(cdata) => {
                    let value = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                    self.state.text(&value);
                }
                Event::End(end) => {
                    let local = end.local_name();
                    if let Some(record) = self.state.end(local.as_ref(), position)? {
                        return Ok(Some(record));
                    }
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for ExportReader<R> {
    type Item = Result<Record, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(error) => {
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}

fn attribute(
    start: &BytesStart<'_>,
    name: &str,
    position: usize,
) -> Result<Option<String>, IngestError> {
    let attribute = start
        .try_get_attribute(name)
        .map_err(|error| IngestError::Xml {
            position,
            message: error.to_string(),
        })?;
    match attribute {
        Some(attribute) => {
            let value = attribute.unescape_value().map_err(|error| IngestError::Xml {
                position,
                message: error.to_string(),
            })?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn unexpected_start(element: &str, position: usize, detail: &str) -> IngestError {
    IngestError::UnexpectedStart {
        element: element.to_string(),
        position,
        detail: detail.to_string(),
    }
}

/// UTC, second precision, `Z` suffix: lexical order matches chronological order.
pub fn normalize_timestamp(value: &str, position: usize) -> Result<String, IngestError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| {
            parsed
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        })
        .map_err(|_| IngestError::InvalidTimestamp {
            value: value.to_string(),
            position,
        })
}

#[cfg(test)]
mod tests {
    use std::io::{self, BufReader, Cursor, Read, Write};

    use bzip2::Compression as BzLevel;
    use bzip2::write::BzEncoder;
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;

    use super::{Compression, ExportReader, normalize_timestamp, open_decoded};
    use crate::error::IngestError;
    use crate::record::{Record, RecordKind};

    const EXPORT: &str = r#"<mediawiki xmlns="http://www.mediawiki.org/xml/export-0.10/" version="0.10">
  <siteinfo><sitename>Example</sitename></siteinfo>
  <page>
    <title>Home</title>
    <ns>0</ns>
    <revision>
      <id>1</id>
      <timestamp>2010-01-01T10:00:00Z</timestamp>
      <contributor><username> Alice </username><id>7</id></contributor>
      <comment>first &amp; best</comment>
      <text xml:space="preserve">Hello [[World]]
</text>
    </revision>
    <revision>
      <timestamp>2010-03-01T10:00:00Z</timestamp>
      <contributor><ip>127.0.0.1</ip></contributor>
      <text bytes="0" />
    </revision>
    <revision>
      <timestamp>2010-04-01T10:00:00Z</timestamp>
      <contributor><username>Bob</username></contributor>
      <text deleted="deleted" />
    </revision>
  </page>
  <page>
    <title>File:logo.png</title>
    <upload>
      <timestamp>2010-02-01T10:00:00Z</timestamp>
      <contributor><username>Carol</username></contributor>
      <comment>logo</comment>
      <filename>Logo.png</filename>
      <contents encoding="base64">aGVs
bG8=</contents>
    </upload>
  </page>
</mediawiki>"#;

    fn parse(xml: &str) -> Vec<Result<Record, IngestError>> {
        ExportReader::new(Cursor::new(xml.as_bytes().to_vec())).collect()
    }

    #[test]
    fn flattens_revisions_and_uploads_in_document_order() {
        let records = parse(EXPORT)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("parse export");
        assert_eq!(records.len(), 4);

        let Record::Revision(first) = &records[0] else {
            panic!("expected revision");
        };
        assert_eq!(first.title, "Home");
        assert_eq!(first.date, "2010-01-01T10:00:00Z");
        assert_eq!(first.username, "Alice");
        assert_eq!(first.comment, "first & best");
        assert_eq!(first.content.as_deref(), Some("Hello [[World]]\n"));

        let Record::Revision(anonymous) = &records[1] else {
            panic!("expected revision");
        };
        assert_eq!(anonymous.username, "");
        assert_eq!(anonymous.comment, "");
        assert_eq!(anonymous.content.as_deref(), Some(""));

        let Record::Revision(deleted) = &records[2] else {
            panic!("expected revision");
        };
        assert_eq!(deleted.content, None);

        let Record::Upload(upload) = &records[3] else {
            panic!("expected upload");
        };
        assert_eq!(upload.title, "File:logo.png");
        assert_eq!(upload.filename.as_deref(), Some("Logo.png"));
        assert_eq!(upload.content.as_deref(), Some("aGVs\nbG8="));
        assert_eq!(records[3].kind(), RecordKind::Upload);
    }

    #[test]
    fn nested_page_is_structural_error() {
        let xml = "<mediawiki><page><title>A</title><page><title>B</title></page></page></mediawiki>";
        let results = parse(xml);
        let error = results
            .into_iter()
            .find_map(Result::err)
            .expect("must fail");
        match error {
            IngestError::UnexpectedStart { element, .. } => assert_eq!(element, "page"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn upload_for_plain_page_is_rejected() {
        let xml = "<mediawiki><page><title>Home</title><upload><timestamp>2010-01-01T00:00:00Z</timestamp></upload></page></mediawiki>";
        let error = parse(xml)
            .into_iter()
            .find_map(Result::err)
            .expect("must fail");
        assert!(matches!(error, IngestError::UploadWithoutFileTitle { .. }));
    }

    #[test]
    fn revision_without_timestamp_is_rejected() {
        let xml = "<mediawiki><page><title>Home</title><revision><text>x</text></revision></page></mediawiki>";
        let error = parse(xml)
            .into_iter()
            .find_map(Result::err)
            .expect("must fail");
        assert!(error.to_string().contains("timestamp"));
    }

    #[test]
    fn unsupported_contents_encoding_is_rejected() {
        let xml = r#"<mediawiki><page><title>File:A.png</title><upload><timestamp>2010-01-01T00:00:00Z</timestamp><contents encoding="hex">00</contents></upload></page></mediawiki>"#;
        let error = parse(xml)
            .into_iter()
            .find_map(Result::err)
            .expect("must fail");
        assert!(matches!(error, IngestError::UnsupportedEncoding { .. }));
    }

    #[test]
    fn iteration_stops_after_an_error() {
        let xml = "<mediawiki><page><title>A</title><page></page></page><page><title>B</title></page></mediawiki>";
        let results = parse(xml);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        assert_eq!(
            normalize_timestamp("2010-01-01T12:00:00+02:00", 0).expect("parse"),
            "2010-01-01T10:00:00Z"
        );
        assert!(normalize_timestamp("yesterday", 0).is_err());
    }

    #[test]
    fn gzip_input_is_detected_from_magic_bytes() {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(EXPORT.as_bytes()).expect("compress");
        let compressed = encoder.finish().expect("finish gzip");
        assert_eq!(Compression::from_magic_bytes(&compressed), Compression::Gzip);

        let reader = open_decoded(Cursor::new(compressed), None).expect("open decoded");
        let records = ExportReader::new(reader)
            .collect::<Result<Vec<_>, _>>()
            .expect("parse gzip export");
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn bzip2_input_is_detected_from_magic_bytes() {
        let mut encoder = BzEncoder::new(Vec::new(), BzLevel::default());
        encoder.write_all(EXPORT.as_bytes()).expect("compress");
        let compressed = encoder.finish().expect("finish bzip2");
        assert_eq!(Compression::from_magic_bytes(&compressed), Compression::Bzip2);

        let reader = open_decoded(Cursor::new(compressed), None).expect("open decoded");
        let records = ExportReader::new(reader)
            .collect::<Result<Vec<_>, _>>()
            .expect("parse bzip2 export");
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].title(), "Home");
    }

    struct BrokenPipe;

    impl Read for BrokenPipe {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "export stream closed"))
        }
    }

    #[test]
    fn stream_failures_surface_as_io_errors() {
        let results = ExportReader::new(BufReader::new(BrokenPipe)).collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(IngestError::Io(error)) => assert_eq!(error.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected an io error, got {other:?}"),
        }
    }

    #[test]
    fn compression_from_extension() {
        use std::path::Path;
        assert_eq!(
            Compression::from_extension(Path::new("dump.xml.gz")),
            Some(Compression::Gzip)
        );
        assert_eq!(
            Compression::from_extension(Path::new("dump.xml.bz2")),
            Some(Compression::Bzip2)
        );
        assert_eq!(Compression::from_extension(Path::new("dump.xml")), None);
    }
}

use serde::Serialize;

pub const FILE_PREFIX: &str = "File:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Revision,
    Upload,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revision => "revision",
            Self::Upload => "upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "revision" => Some(Self::Revision),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRevision {
    pub title: String,
    pub date: String,
    pub username: String,
    pub content: Option<String>,
    pub comment: String,
}

/// An upload entry; `content` stays base64 encoded until replay writes it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub title: String,
    pub filename: Option<String>,
    pub date: String,
    pub username: String,
    pub content: Option<String>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Revision(PageRevision),
    Upload(FileUpload),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Revision(_) => RecordKind::Revision,
            Self::Upload(_) => RecordKind::Upload,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Revision(revision) => &revision.title,
            Self::Upload(upload) => &upload.title,
        }
    }

    pub fn date(&self) -> &str {
        match self {
            Self::Revision(revision) => &revision.date,
            Self::Upload(upload) => &upload.date,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Revision(revision) => &revision.username,
            Self::Upload(upload) => &upload.username,
        }
    }

    pub fn comment(&self) -> &str {
        match self {
            Self::Revision(revision) => &revision.comment,
            Self::Upload(upload) => &upload.comment,
        }
    }
}

pub fn is_file_title(title: &str) -> bool {
    title.starts_with(FILE_PREFIX)
}

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Malformed export structure or an unreadable source stream.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read export: {0}")]
    Io(#[from] io::Error),
    #[error("malformed XML near byte {position}: {message}")]
    Xml { position: usize, message: String },
    #[error("<{element}> opened near byte {position} while {detail}")]
    UnexpectedStart {
        element: String,
        position: usize,
        detail: String,
    },
    #[error("<{element}> closed near byte {position} without {field}")]
    MissingField {
        element: String,
        position: usize,
        field: &'static str,
    },
    #[error("<upload> for non-file title {title:?} near byte {position}")]
    UploadWithoutFileTitle { title: String, position: usize },
    #[error("<contents> near byte {position} uses unsupported encoding {encoding:?}")]
    UnsupportedEncoding { encoding: String, position: usize },
    #[error("invalid timestamp {value:?} near byte {position}")]
    InvalidTimestamp { value: String, position: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkupError {
    #[error("unclosed category marker on line {line}: {text}")]
    UnclosedCategory { line: usize, text: String },
    #[error("missing title header")]
    MissingTitleHeader,
}

/// Failure of the external markup converter for a single page.
#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with status {status}: {stderr}")]
    Status {
        program: String,
        status: i32,
        stderr: String,
    },
    #[error("no output from {program}")]
    EmptyOutput { program: String },
}

/// A versioned-history command that did not succeed. Always fatal.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {status}\nstdout: {stdout}\nstderr: {stderr}")]
    Command {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid entry in {path} line {line}: {row:?} (expected `username<TAB>Name <email>`)")]
    IdentityRow {
        path: PathBuf,
        line: usize,
        row: String,
    },
    #[error("prefix {0:?} must be empty or end with '/'")]
    Prefix(String),
    #[error("expected a git repository at {0}")]
    NotARepository(PathBuf),
    #[error("input {0} must be inside the repository")]
    OutsideRepository(PathBuf),
}

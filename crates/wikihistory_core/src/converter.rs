use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, bail};
use log::warn;

use crate::error::ConverterError;

pub const DEFAULT_PANDOC: &str = "pandoc";
pub const DEFAULT_PANDOC_TARGET: &str = "gfm-hard_line_breaks";

/// MediaWiki markup in, Markdown out.
pub trait MarkupConverter {
    fn convert(&mut self, mediawiki: &str) -> Result<String, ConverterError>;
}

#[derive(Debug, Clone)]
pub struct PandocConverter {
    program: String,
    target: String,
}

impl PandocConverter {
    pub fn new(program: &str, target: &str) -> Self {
        Self {
            program: program.to_string(),
            target: target.to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs `pandoc --version` and returns the `pandoc X.Y` line.
    pub fn version(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .with_context(|| format!("could not find {} on PATH", self.program))?;
        if !output.status.success() {
            bail!(
                "error {} from {} version check",
                output.status.code().unwrap_or(1),
                self.program
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find(|line| line.starts_with("pandoc") && line.contains('.'))
            .map(|line| line.trim().to_string())
            .with_context(|| format!("no version line from {} --version", self.program))
    }
}

impl MarkupConverter for PandocConverter {
    fn convert(&mut self, mediawiki: &str) -> Result<String, ConverterError> {
        let mut child = Command::new(&self.program)
            .args(["-f", "mediawiki", "-t", &self.target])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ConverterError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| ConverterError::Launch {
            program: self.program.clone(),
            source: io::Error::other("stdin was not captured"),
        })?;
        let input = mediawiki.as_bytes().to_vec();
        let writer = thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|source| ConverterError::Launch {
                program: self.program.clone(),
                source,
            })?;
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(ConverterError::Status {
                program: self.program.clone(),
                status: output.status.code().unwrap_or(1),
                stderr,
            });
        }
        if let Err(source) = written {
            return Err(ConverterError::Launch {
                program: self.program.clone(),
                source,
            });
        }
        if !stderr.is_empty() {
            warn!("{}: {stderr}", self.program);
        }
        if stdout.trim().is_empty() {
            return Err(ConverterError::EmptyOutput {
                program: self.program.clone(),
            });
        }
        Ok(stdout)
    }
}

//! Built-in inspectors
//!
//! [`ApproveAll`] releases every file as soon as it goes quiet.
//! [`CommandInspector`] hands the staged bytes to an external program and
//! releases the file only if the program approves it.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::InspectorConfig;
use crate::error::{Error, Result};
use crate::fs::{Inspector, StagedFile};

/// Outcome of running an inspector over one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Content accepted unchanged
    Approved,
    /// Content replaced with the inspector's output
    Sanitized,
    /// Content refused; the file stays staged
    Rejected(Option<i32>),
}

/// Approves every file unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveAll;

impl Inspector for ApproveAll {
    fn inspect(&self, file: StagedFile) {
        let result = file.set_cleaned(true).and_then(|_| file.release());
        match result {
            Ok(()) => debug!("approved node {:?}", file.node_id()),
            // Removed or renamed away before inspection ran
            Err(Error::NotFound) => debug!("node {:?} vanished before release", file.node_id()),
            Err(e) => warn!("failed to release node {:?}: {}", file.node_id(), e),
        }
    }
}

/// Pipes the staged content through an external program.
///
/// The program receives the bytes on stdin and the logical path in
/// `QUARANTINEFS_PATH`. Exit status 0 approves the file; if it also wrote
/// anything to stdout, that output replaces the content first.
#[derive(Debug, Clone)]
pub struct CommandInspector {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandInspector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from configuration; `None` when no command is configured
    pub fn from_config(config: &InspectorConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|program| Self::new(program.clone(), config.args.clone()))
    }

    /// Run the program over `file` and apply its verdict
    pub fn run(&self, file: &StagedFile) -> Result<Verdict> {
        let data = file.read_all()?;
        let path = file.path()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("QUARANTINEFS_PATH", &path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        // stdin is fed while stdout drains
        let stdin = child.stdin.take();
        let feeder = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The program may exit without draining its input
                let _ = stdin.write_all(&data);
            }
        });

        let output = child.wait_with_output()?;
        if feeder.join().is_err() {
            return Err(Error::Internal("stdin feeder panicked".to_string()));
        }

        if !output.status.success() {
            return Ok(Verdict::Rejected(output.status.code()));
        }

        let verdict = if output.stdout.is_empty() {
            Verdict::Approved
        } else {
            file.overwrite(output.stdout)?;
            Verdict::Sanitized
        };
        file.set_cleaned(true)?;
        file.release()?;
        Ok(verdict)
    }
}

impl Inspector for CommandInspector {
    fn inspect(&self, file: StagedFile) {
        let path = file.path().unwrap_or_default();
        match self.run(&file) {
            Ok(Verdict::Rejected(code)) => warn!(
                "{} rejected {} (exit status {:?}); keeping it staged",
                self.program.display(),
                path.display(),
                code
            ),
            Ok(verdict) => info!("{}: {:?}", path.display(), verdict),
            Err(Error::NotFound) => debug!("{} vanished before inspection", path.display()),
            Err(e) => warn!("inspection of {} failed: {}", path.display(), e),
        }
    }
}

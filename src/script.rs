//! Command script - the ordered list of lines injected into the client

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while building a command script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Command {index} contains an embedded newline")]
    EmbeddedNewline { index: usize },

    #[error("Failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered, immutable sequence of command lines.
///
/// Insertion order is execution order. Cloning is cheap; clones share the
/// same underlying commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandScript {
    commands: Arc<[String]>,
}

impl CommandScript {
    /// Build a script from complete command lines
    pub fn new<I, S>(commands: I) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        if let Some(index) = commands
            .iter()
            .position(|c| c.contains('\n') || c.contains('\r'))
        {
            return Err(ScriptError::EmbeddedNewline { index });
        }
        Ok(Self {
            commands: commands.into(),
        })
    }

    /// Parse script text: one command per line, blank lines and `#` comments skipped
    pub fn parse(text: &str) -> Self {
        let commands: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self {
            commands: commands.into(),
        }
    }

    /// Load a script file
    pub fn from_file(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }
}

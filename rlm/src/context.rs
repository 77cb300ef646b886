//! The document a query runs over.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use crate::cost::TokenEstimator;

/// Maximum file size to load (10MB).
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Clone, Debug)]
pub enum ContextSource {
    /// Inline content.
    String(String),
    /// A UTF-8 text file.
    File(PathBuf),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextSize {
    pub chars: usize,
    pub lines: usize,
    pub bytes: usize,
    pub tokens_estimate: u64,
}

#[derive(Clone, Debug)]
pub struct LoadedContext {
    pub content: String,
    pub size: ContextSize,
    /// File the content came from, if any.
    pub origin: Option<PathBuf>,
}

impl LoadedContext {
    pub async fn load(source: ContextSource, estimator: &TokenEstimator) -> Result<Self> {
        match source {
            ContextSource::String(content) => Ok(Self::from_content(content, None, estimator)),
            ContextSource::File(path) => {
                let content = read_bounded(&path).await?;
                Ok(Self::from_content(content, Some(path), estimator))
            }
        }
    }

    fn from_content(content: String, origin: Option<PathBuf>, estimator: &TokenEstimator) -> Self {
        let size = ContextSize {
            chars: content.chars().count(),
            lines: content.lines().count(),
            bytes: content.len(),
            tokens_estimate: if content.is_empty() {
                0
            } else {
                estimator.estimate(&content)
            },
        };
        Self {
            content,
            size,
            origin,
        }
    }
}

async fn read_bounded(path: &Path) -> Result<String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a file", path.display());
    }
    if metadata.len() > MAX_FILE_SIZE {
        bail!(
            "{} is {} bytes; the limit is {MAX_FILE_SIZE}",
            path.display(),
            metadata.len()
        );
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", path.display()))
}

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::features::ArchiveLocator;

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO Error")]
    IoError(#[from] std::io::Error),
    #[error("Json Decoding Error")]
    JsonDecode(#[from] serde_json::Error),
}

fn default_chunk_frames() -> usize {
    // ~15 minutes of audio at 100 frames/s; keeps per-chunk disk reads uniform.
    15 * 60 * 100
}

fn default_randomization_range() -> usize {
    // 24 hours of audio at 100 frames/s.
    24 * 3600 * 100
}

/// One utterance entry of the training-set file list.
#[derive(Deserialize, Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub start_frame: usize,
    pub num_frames: usize,
}

impl ArchiveEntry {
    pub fn locator(&self) -> ArchiveLocator {
        ArchiveLocator::new(self.path.clone(), self.start_frame, self.num_frames)
    }
}

/// Corpus description: the file list plus streaming tunables.
#[derive(Deserialize, Debug, Clone)]
pub struct SourceConfig {
    pub files: Vec<ArchiveEntry>,
    /// Bound (in frames) on how far apart two items may be shuffled; trades
    /// randomization quality against resident memory.
    #[serde(default = "default_randomization_range")]
    pub randomization_range: usize,
    /// Target frame count per paging chunk.
    #[serde(default = "default_chunk_frames")]
    pub chunk_frames: usize,
    /// Serve single randomized frames instead of whole utterances.
    #[serde(default)]
    pub frame_mode: bool,
}

impl SourceConfig {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let cfg = serde_json::from_reader(reader)?;
        Ok(cfg)
    }

    pub fn locators(&self) -> Vec<ArchiveLocator> {
        self.files.iter().map(|e| e.locator()).collect()
    }
}

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use ndarray::prelude::*;

/// Archive location of one utterance's feature frames.
///
/// Parsing of feature path syntax (archive offsets etc.) happens upstream;
/// this carries the resolved archive path plus the frame range within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveLocator {
    path: PathBuf,
    start_frame: usize,
    num_frames: usize,
}

impl ArchiveLocator {
    pub fn new(path: impl Into<PathBuf>, start_frame: usize, num_frames: usize) -> Self {
        ArchiveLocator {
            path: path.into(),
            start_frame,
            num_frames,
        }
    }
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
    pub fn start_frame(&self) -> usize {
        self.start_frame
    }
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }
    /// Key used for label/lattice/transcript lookup: the logical path with its
    /// final extension stripped.
    pub fn key(&self) -> String {
        self.path.with_extension("").to_string_lossy().into_owned()
    }
}

/// Feature stream properties, learned from the first archive read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureInfo {
    pub kind: String,
    pub dim: usize,
    /// Frame shift in 100 ns units (10 ms == 100_000).
    pub frame_period: u32,
}

/// Reader for the feature archive format. The archive decoding itself lives
/// outside this crate; chunk paging drives this interface.
pub trait FeatureReader {
    /// Determine feature kind, dimension and frame period for an utterance.
    fn get_info(&mut self, locator: &ArchiveLocator) -> io::Result<FeatureInfo>;
    /// Read the utterance's frames into `dst` of shape `dim x num_frames`.
    fn read(
        &mut self,
        locator: &ArchiveLocator,
        info: &FeatureInfo,
        dst: ArrayViewMut2<f32>,
    ) -> io::Result<()>;
}

/// Neighbor-context augmentation applied when copying a frame into the output
/// minibatch. Supplied externally; must be a pure function of the utterance.
pub trait FrameAugmenter {
    /// Output dimension for a given raw feature dimension.
    fn output_dim(&self, feat_dim: usize) -> usize;
    /// Write the augmented representation of frame `t` of `utt` into `out`.
    fn augment(&self, utt: ArrayView2<f32>, t: usize, out: ArrayViewMut1<f32>);
}

/// Identity augmentation: frames are copied unchanged.
pub struct NoAugment;

impl FrameAugmenter for NoAugment {
    fn output_dim(&self, feat_dim: usize) -> usize {
        feat_dim
    }
    fn augment(&self, utt: ArrayView2<f32>, t: usize, mut out: ArrayViewMut1<f32>) {
        out.assign(&utt.column(t));
    }
}

/// In-memory [`FeatureReader`], keyed by utterance key. Used by tests and as
/// a reference implementation of the reader contract. Can simulate transient
/// read failures to exercise the retry path.
pub struct MemoryFeatureReader {
    kind: String,
    frame_period: u32,
    utterances: HashMap<String, Array2<f32>>,
    fail_reads: usize,
}

impl MemoryFeatureReader {
    pub fn new(kind: &str, frame_period: u32) -> Self {
        MemoryFeatureReader {
            kind: kind.to_string(),
            frame_period,
            utterances: HashMap::new(),
            fail_reads: 0,
        }
    }
    /// Register frames (shape `dim x num_frames`) under an utterance key.
    pub fn insert(&mut self, key: &str, frames: Array2<f32>) {
        self.utterances.insert(key.to_string(), frames);
    }
    /// Make the next `n` reads fail with a transient i/o error.
    pub fn fail_next_reads(&mut self, n: usize) {
        self.fail_reads = n;
    }

    fn lookup(&self, locator: &ArchiveLocator) -> io::Result<&Array2<f32>> {
        self.utterances.get(&locator.key()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such utterance: {}", locator.key()),
            )
        })
    }
}

impl FeatureReader for MemoryFeatureReader {
    fn get_info(&mut self, locator: &ArchiveLocator) -> io::Result<FeatureInfo> {
        let frames = self.lookup(locator)?;
        Ok(FeatureInfo {
            kind: self.kind.clone(),
            dim: frames.nrows(),
            frame_period: self.frame_period,
        })
    }

    fn read(
        &mut self,
        locator: &ArchiveLocator,
        info: &FeatureInfo,
        mut dst: ArrayViewMut2<f32>,
    ) -> io::Result<()> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "simulated transient read failure",
            ));
        }
        let frames = self.lookup(locator)?;
        let (start, n) = (locator.start_frame(), locator.num_frames());
        if frames.nrows() != info.dim || start + n > frames.ncols() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame range [{}, {}) out of bounds for {}", start, start + n, locator.key()),
            ));
        }
        dst.assign(&frames.slice(s![.., start..start + n]));
        Ok(())
    }
}

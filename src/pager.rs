use std::io;
use std::sync::Arc;

use ndarray::prelude::*;
use thiserror::Error;

use crate::catalog::{ChunkData, UtteranceCatalog};
use crate::features::{FeatureInfo, FeatureReader};
use crate::lattice::{LatticeData, LatticeSource};
use crate::randomizer::RandomizedChunk;
use crate::util::attempt;

type Result<T> = std::result::Result<T, PagerError>;

const MAX_READ_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum PagerError {
    // requesting a chunk outside the resident window means the randomization
    // invariant was violated upstream
    #[error("chunk {chunk} outside resident window [{window_begin}, {window_end})")]
    WindowViolation {
        chunk: usize,
        window_begin: usize,
        window_end: usize,
    },
    #[error("i/o failure loading chunk {chunk} after {attempts} attempts")]
    Io {
        chunk: usize,
        attempts: usize,
        #[source]
        source: io::Error,
    },
    #[error("cannot page in chunk {0} with no utterances")]
    EmptyChunk(usize),
}

/// Paged-in data of one chunk: all utterance frames stored consecutively
/// (`dim x total_frames`) plus per-utterance lattices when configured.
pub struct ChunkCache {
    pub frames: Array2<f32>,
    pub lattices: Vec<Arc<LatticeData>>,
}

impl ChunkCache {
    /// Frame slice of one utterance within the chunk buffer.
    pub fn utterance_frames(&self, first_frame: usize, num_frames: usize) -> ArrayView2<f32> {
        self.frames.slice(s![.., first_frame..first_frame + num_frames])
    }
    pub fn lattice(&self, utterance_index: usize) -> Option<&Arc<LatticeData>> {
        self.lattices.get(utterance_index)
    }
}

/// Pages chunk data in and out of RAM. Owns the chunk caches (indexed by
/// original chunk index; chunk metadata itself never moves) and the archive
/// reader, and learns the feature info lazily on the first read.
pub struct ChunkPager {
    reader: Box<dyn FeatureReader>,
    lattices: Option<Arc<dyn LatticeSource>>,
    caches: Vec<Option<ChunkCache>>,
    feat_info: Option<FeatureInfo>,
    chunks_in_ram: usize,
}

impl ChunkPager {
    pub fn new(
        reader: Box<dyn FeatureReader>,
        lattices: Option<Arc<dyn LatticeSource>>,
        num_chunks: usize,
    ) -> Self {
        let mut caches = Vec::with_capacity(num_chunks);
        caches.resize_with(num_chunks, || None);
        ChunkPager {
            reader,
            lattices,
            caches,
            feat_info: None,
            chunks_in_ram: 0,
        }
    }

    /// Feature properties; `None` until the first chunk read.
    pub fn feat_info(&self) -> Option<&FeatureInfo> {
        self.feat_info.as_ref()
    }
    pub fn has_lattices(&self) -> bool {
        self.lattices.is_some()
    }
    pub fn chunks_in_ram(&self) -> usize {
        self.chunks_in_ram
    }
    /// Cache of an original chunk index, if resident.
    pub fn cache(&self, chunk_index: usize) -> Option<&ChunkCache> {
        self.caches.get(chunk_index).and_then(|c| c.as_ref())
    }

    /// Ensure randomized chunk `k` is resident. The window is passed in for
    /// checking only; a violation is a logic error, not a data error.
    /// Returns whether a read actually occurred.
    pub fn require(
        &mut self,
        catalog: &UtteranceCatalog,
        randomized: &[RandomizedChunk],
        k: usize,
        window_begin: usize,
        window_end: usize,
    ) -> Result<bool> {
        if k < window_begin || k >= window_end {
            return Err(PagerError::WindowViolation {
                chunk: k,
                window_begin,
                window_end,
            });
        }
        let rchunk = &randomized[k];
        let chunkdata = &catalog.chunks()[rchunk.chunk_index];
        if self.caches[rchunk.chunk_index].is_some() {
            return Ok(false);
        }
        if chunkdata.num_utterances() == 0 {
            return Err(PagerError::EmptyChunk(k));
        }
        log::debug!(
            "paging in randomized chunk {} (frame range [{}..{}]), {} resident in RAM",
            k,
            rchunk.global_ts,
            rchunk.global_te() - 1,
            self.chunks_in_ram + 1
        );
        // retried on transient failure so we do not end up in a broken state
        let reader = self.reader.as_mut();
        let lattices = self.lattices.as_deref();
        let mut feat_info = self.feat_info.take();
        let loaded = attempt(MAX_READ_ATTEMPTS, || {
            load_chunk(reader, lattices, chunkdata, &mut feat_info)
        });
        self.feat_info = feat_info;
        let cache = loaded.map_err(|source| PagerError::Io {
            chunk: k,
            attempts: MAX_READ_ATTEMPTS,
            source,
        })?;
        self.caches[rchunk.chunk_index] = Some(cache);
        self.chunks_in_ram += 1;
        Ok(true)
    }

    /// Free the frame buffer and lattices of randomized chunk `k`, keeping
    /// its metadata. No-op if not resident.
    pub fn release(&mut self, randomized: &[RandomizedChunk], k: usize) {
        let rchunk = &randomized[k];
        if self.caches[rchunk.chunk_index].take().is_some() {
            self.chunks_in_ram -= 1;
            log::debug!(
                "paging out randomized chunk {} (frame range [{}..{}]), {} resident in RAM",
                k,
                rchunk.global_ts,
                rchunk.global_te() - 1,
                self.chunks_in_ram
            );
        }
    }
}

/// Synchronously read all utterance frames (and lattices) of one chunk.
fn load_chunk(
    reader: &mut dyn FeatureReader,
    lattices: Option<&dyn LatticeSource>,
    chunkdata: &ChunkData,
    feat_info: &mut Option<FeatureInfo>,
) -> io::Result<ChunkCache> {
    if feat_info.is_none() {
        let info = reader.get_info(chunkdata.utterance(0).locator())?;
        log::info!(
            "determined feature kind as {}-dimensional '{}' with frame shift {:.1} ms",
            info.dim,
            info.kind,
            info.frame_period as f64 / 1e4
        );
        *feat_info = Some(info);
    }
    let info = feat_info
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "feature info not initialized"))?;

    let mut frames = Array2::<f32>::zeros((info.dim, chunkdata.total_frames()));
    let mut chunk_lattices = Vec::new();
    for i in 0..chunkdata.num_utterances() {
        let utt = chunkdata.utterance(i);
        let ts = chunkdata.first_frame(i);
        let n = utt.num_frames();
        reader.read(utt.locator(), info, frames.slice_mut(s![.., ts..ts + n]))?;
        if let Some(src) = lattices {
            chunk_lattices.push(src.get_lattice(&utt.key(), n)?);
        }
    }
    log::debug!("{} utterances read", chunkdata.num_utterances());
    Ok(ChunkCache {
        frames,
        lattices: chunk_lattices,
    })
}

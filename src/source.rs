use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ndarray::prelude::*;
use thiserror::Error;

use crate::catalog::{CatalogError, LabelTable, UtteranceCatalog};
use crate::config::SourceConfig;
use crate::features::{ArchiveLocator, FeatureReader, FrameAugmenter, NoAugment};
use crate::lattice::{LatticeData, LatticeSource, WordTranscript};
use crate::pager::{ChunkPager, PagerError};
use crate::randomizer::{Randomization, RandomizationError, UtteranceRef};
use crate::ClassId;

type Result<T> = std::result::Result<T, SourceError>;

/// Default shuffling bound: 24 hours of audio at 100 frames/s.
pub const DEFAULT_RANDOMIZATION_RANGE: usize = 24 * 3600 * 100;
/// Default chunk target: 15 minutes of audio at 100 frames/s.
pub const DEFAULT_CHUNK_FRAMES: usize = 15 * 60 * 100;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid global_ts {global_ts}: does not match an utterance boundary")]
    InvalidGlobalTs { global_ts: usize },
    #[error("frame mode cannot be combined with a lattice source")]
    FrameModeWithLattices,
    #[error("randomization missing for the requested sweep")]
    NotRandomized,
    #[error("feature dimensions unknown before the first chunk read")]
    FeatureInfoUnset,
    #[error("chunk {chunk} not resident after paging")]
    ChunkNotResident { chunk: usize },
    #[error("Catalog Error")]
    Catalog(#[from] CatalogError),
    #[error("Randomization Error")]
    Randomization(#[from] RandomizationError),
    #[error("Pager Error")]
    Pager(#[from] PagerError),
}

/// One minibatch: features of shape `dim x n`, parallel per-frame class ids
/// (empty in unsupervised mode), per-utterance lattices and word transcripts
/// (lattice mode only), and whether any chunk was paged in to serve it.
pub struct Batch {
    pub features: Array2<f32>,
    pub class_ids: Vec<ClassId>,
    pub lattices: Vec<Arc<LatticeData>>,
    pub transcripts: Vec<WordTranscript>,
    pub read_from_disk: bool,
}

impl Batch {
    pub fn num_frames(&self) -> usize {
        self.features.len_of(Axis(1))
    }
}

/// Minibatch source serving randomized utterances (or frames) from a
/// conceptually infinite, repeating timeline over the corpus.
///
/// `get_batch` calls are expected to advance `global_ts` sequentially; the
/// rolling chunk window makes paging cheap in that case. Out-of-order calls
/// degrade to re-paging but stay correct.
pub struct MinibatchSource {
    catalog: UtteranceCatalog,
    pager: ChunkPager,
    augmenter: Box<dyn FrameAugmenter>,
    transcripts: HashMap<String, WordTranscript>,
    randomization_range: usize,
    frame_mode: bool,
    /// Randomization snapshot for the current sweep; swapped wholesale on
    /// sweep change.
    current: Option<Randomization>,
}

pub struct MinibatchSourceBuilder {
    _locators: Vec<ArchiveLocator>,
    _reader: Box<dyn FeatureReader>,
    _labels: LabelTable,
    _num_classes: usize,
    _lattices: Option<Arc<dyn LatticeSource>>,
    _transcripts: HashMap<String, WordTranscript>,
    _augmenter: Option<Box<dyn FrameAugmenter>>,
    _randomization_range: Option<usize>,
    _chunk_frames: Option<usize>,
    _frame_mode: bool,
}

impl MinibatchSourceBuilder {
    pub fn new(locators: Vec<ArchiveLocator>, reader: Box<dyn FeatureReader>) -> Self {
        MinibatchSourceBuilder {
            _locators: locators,
            _reader: reader,
            _labels: LabelTable::new(),
            _num_classes: 0,
            _lattices: None,
            _transcripts: HashMap::new(),
            _augmenter: None,
            _randomization_range: None,
            _chunk_frames: None,
            _frame_mode: false,
        }
    }

    pub fn from_config(cfg: &SourceConfig, reader: Box<dyn FeatureReader>) -> Self {
        let mut b = Self::new(cfg.locators(), reader);
        b._randomization_range = Some(cfg.randomization_range);
        b._chunk_frames = Some(cfg.chunk_frames);
        b._frame_mode = cfg.frame_mode;
        b
    }

    /// Supervised training: label table plus the model output dimension.
    pub fn labels(mut self, labels: LabelTable, num_classes: usize) -> Self {
        self._labels = labels;
        self._num_classes = num_classes;
        self
    }
    pub fn lattices(mut self, lattices: Arc<dyn LatticeSource>) -> Self {
        self._lattices = Some(lattices);
        self
    }
    pub fn transcripts(mut self, transcripts: HashMap<String, WordTranscript>) -> Self {
        self._transcripts = transcripts;
        self
    }
    pub fn augmenter(mut self, augmenter: Box<dyn FrameAugmenter>) -> Self {
        self._augmenter = Some(augmenter);
        self
    }
    pub fn randomization_range(mut self, frames: usize) -> Self {
        self._randomization_range = Some(frames);
        self
    }
    pub fn chunk_frames(mut self, frames: usize) -> Self {
        self._chunk_frames = Some(frames);
        self
    }
    /// Serve single randomized frames instead of whole utterances.
    pub fn frame_mode(mut self) -> Self {
        self._frame_mode = true;
        self
    }

    pub fn build(self) -> Result<MinibatchSource> {
        if self._frame_mode && self._lattices.is_some() {
            return Err(SourceError::FrameModeWithLattices);
        }
        let catalog = UtteranceCatalog::build(
            self._locators,
            &self._labels,
            self._num_classes,
            self._lattices.as_deref(),
            self._chunk_frames.unwrap_or(DEFAULT_CHUNK_FRAMES),
        )?;
        let num_chunks = catalog.chunks().len();
        Ok(MinibatchSource {
            catalog,
            pager: ChunkPager::new(self._reader, self._lattices, num_chunks),
            augmenter: self._augmenter.unwrap_or_else(|| Box::new(NoAugment)),
            transcripts: self._transcripts,
            randomization_range: self._randomization_range.unwrap_or(DEFAULT_RANDOMIZATION_RANGE),
            frame_mode: self._frame_mode,
            current: None,
        })
    }
}

impl MinibatchSource {
    pub fn builder(
        locators: Vec<ArchiveLocator>,
        reader: Box<dyn FeatureReader>,
    ) -> MinibatchSourceBuilder {
        MinibatchSourceBuilder::new(locators, reader)
    }

    /// Frames per sweep.
    pub fn total_frames(&self) -> usize {
        self.catalog.total_frames()
    }

    /// Per-class frame occurrence counts, for prior estimation.
    pub fn unit_counts(&self) -> &[usize] {
        self.catalog.counts()
    }

    /// Drop the cached randomization; the next call rebuilds it.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Rebuild the randomization snapshot if `global_ts` entered a new sweep.
    fn lazy_randomization(&mut self, global_ts: usize) -> Result<usize> {
        let sweep = global_ts / self.catalog.total_frames();
        if self.current.as_ref().map(|r| r.sweep) != Some(sweep) {
            log::info!(
                "re-randomizing for sweep {} in {} mode",
                sweep,
                if self.frame_mode { "frame" } else { "utterance" }
            );
            self.current = Some(Randomization::build(
                &self.catalog,
                sweep,
                self.randomization_range,
                self.frame_mode,
            )?);
        }
        Ok(sweep)
    }

    /// Smallest valid `global_ts` at or after the given one for the current
    /// sweep. Frame mode accepts any position; utterance mode snaps to the
    /// next utterance start, or the end of the last utterance if the request
    /// falls inside it.
    pub fn first_valid_global_ts(&mut self, global_ts: usize) -> Result<usize> {
        self.lazy_randomization(global_ts)?;
        if self.frame_mode {
            return Ok(global_ts);
        }
        let rand = self.current.as_ref().ok_or(SourceError::NotRandomized)?;
        let refs = &rand.utterance_refs;
        let pos = refs.partition_point(|u| u.global_ts < global_ts);
        match refs.get(pos) {
            Some(u) => Ok(u.global_ts),
            None => refs.last().map(UtteranceRef::global_te).ok_or(SourceError::NotRandomized),
        }
    }

    /// Serve the minibatch starting at `global_ts`.
    ///
    /// Utterance mode requires `global_ts` to match an utterance boundary
    /// exactly and returns whole utterances: more are added while the running
    /// frame total is still below `frames_requested`, and at least one is
    /// always returned, so the result may exceed the request.
    /// Frame mode returns up to `frames_requested` single randomized frames,
    /// clipped to the sweep end.
    pub fn get_batch(&mut self, global_ts: usize, frames_requested: usize) -> Result<Batch> {
        let t_start = Instant::now();
        let sweep = self.lazy_randomization(global_ts)?;
        let batch = if !self.frame_mode {
            self.utterance_batch(global_ts, frames_requested, sweep)?
        } else {
            self.frame_batch(global_ts, frames_requested, sweep)?
        };
        log::trace!("get_batch took {:.2} ms", t_start.elapsed().as_secs_f64() * 1e3);
        Ok(batch)
    }

    fn utterance_batch(
        &mut self,
        global_ts: usize,
        frames_requested: usize,
        sweep: usize,
    ) -> Result<Batch> {
        let rand = self.current.as_ref().ok_or(SourceError::NotRandomized)?;
        // exact-match requirement: positions are addressed by their start time
        let spos = *rand
            .position_map
            .get(&global_ts)
            .ok_or(SourceError::InvalidGlobalTs { global_ts })?;
        let refs = &rand.utterance_refs;
        let (epos, mb_frames) = utterance_batch_extent(refs, spos, frames_requested);

        // free all chunks outside the union of the involved windows, then page
        // in what the chosen utterances touch
        let window_begin = rand.chunks[rand.position_chunks[spos]].window_begin;
        let window_end = rand.chunks[rand.position_chunks[epos - 1]].window_end;
        for k in 0..window_begin {
            self.pager.release(&rand.chunks, k);
        }
        for k in window_end..rand.chunks.len() {
            self.pager.release(&rand.chunks, k);
        }
        let mut read_from_disk = false;
        for pos in spos..epos {
            read_from_disk |= self.pager.require(
                &self.catalog,
                &rand.chunks,
                refs[pos].chunk_index,
                window_begin,
                window_end,
            )?;
        }

        log::debug!(
            "getting utterances {}..{} ({} frames out of {} requested) in sweep {}",
            spos,
            epos - 1,
            mb_frames,
            frames_requested,
            sweep
        );
        let feat_dim = self.pager.feat_info().ok_or(SourceError::FeatureInfoUnset)?.dim;
        let mut features = Array2::<f32>::zeros((self.augmenter.output_dim(feat_dim), mb_frames));
        let supervised = self.catalog.is_supervised();
        let mut class_ids: Vec<ClassId> = Vec::with_capacity(if supervised { mb_frames } else { 0 });
        let mut lattices = Vec::new();
        let mut transcripts = Vec::new();
        let mut tspos = 0; // start of utterance `pos` within the minibatch
        for pos in spos..epos {
            let uttref = &refs[pos];
            debug_assert_eq!(uttref.global_ts, global_ts + tspos);
            let rchunk = &rand.chunks[uttref.chunk_index];
            let chunkdata = &self.catalog.chunks()[rchunk.chunk_index];
            let cache = self
                .pager
                .cache(rchunk.chunk_index)
                .ok_or(SourceError::ChunkNotResident { chunk: uttref.chunk_index })?;
            let n = uttref.num_frames;
            let utt_frames =
                cache.utterance_frames(chunkdata.first_frame(uttref.utterance_index), n);
            for t in 0..n {
                self.augmenter.augment(utt_frames.view(), t, features.column_mut(tspos + t));
            }
            if supervised {
                let ids = self
                    .catalog
                    .class_id_slice(chunkdata.classids_begin(uttref.utterance_index), n)?;
                class_ids.extend_from_slice(ids);
            }
            if let Some(lattice) = cache.lattice(uttref.utterance_index) {
                lattices.push(lattice.clone());
                if let Some(transcript) = self.transcripts.get(&lattice.key) {
                    transcripts.push(transcript.clone());
                }
            }
            tspos += n;
        }
        debug_assert_eq!(tspos, mb_frames);
        Ok(Batch {
            features,
            class_ids,
            lattices,
            transcripts,
            read_from_disk,
        })
    }

    fn frame_batch(
        &mut self,
        global_ts: usize,
        frames_requested: usize,
        sweep: usize,
    ) -> Result<Batch> {
        let rand = self.current.as_ref().ok_or(SourceError::NotRandomized)?;
        let total_frames = self.catalog.total_frames();
        let sweep_ts = sweep * total_frames;
        let sweep_te = sweep_ts + total_frames;
        // return as much as requested, but never beyond the sweep end
        let global_te = (global_ts + frames_requested).min(sweep_te);
        let mb_frames = global_te - global_ts;

        let first_chunk = rand.chunk_for_frame_pos(global_ts)?;
        let last_chunk = rand.chunk_for_frame_pos(global_te - 1)?;
        let window_begin = rand.chunks[first_chunk].window_begin;
        let window_end = rand.chunks[last_chunk].window_end;
        log::debug!(
            "getting randomized frames [{}..{}) ({} frames out of {} requested) in sweep {}; chunks [{}..{}] -> window [{}..{})",
            global_ts,
            global_te,
            mb_frames,
            frames_requested,
            sweep,
            first_chunk,
            last_chunk,
            window_begin,
            window_end
        );
        for k in 0..window_begin {
            self.pager.release(&rand.chunks, k);
        }
        let mut read_from_disk = false;
        for k in window_begin..window_end {
            read_from_disk |=
                self.pager.require(&self.catalog, &rand.chunks, k, window_begin, window_end)?;
        }
        for k in window_end..rand.chunks.len() {
            self.pager.release(&rand.chunks, k);
        }

        let feat_dim = self.pager.feat_info().ok_or(SourceError::FeatureInfoUnset)?.dim;
        let mut features = Array2::<f32>::zeros((self.augmenter.output_dim(feat_dim), mb_frames));
        let supervised = self.catalog.is_supervised();
        let mut class_ids: Vec<ClassId> = Vec::with_capacity(if supervised { mb_frames } else { 0 });
        for j in 0..mb_frames {
            let frame_pos = (global_ts + j) % total_frames;
            let fr = rand.frame_refs[frame_pos];
            // within the window by construction; this is a check only
            read_from_disk |= self.pager.require(
                &self.catalog,
                &rand.chunks,
                fr.chunk_index(),
                window_begin,
                window_end,
            )?;
            let rchunk = &rand.chunks[fr.chunk_index()];
            let chunkdata = &self.catalog.chunks()[rchunk.chunk_index];
            let cache = self
                .pager
                .cache(rchunk.chunk_index)
                .ok_or(SourceError::ChunkNotResident { chunk: fr.chunk_index() })?;
            let n = chunkdata.num_frames(fr.utterance_index());
            let utt_frames =
                cache.utterance_frames(chunkdata.first_frame(fr.utterance_index()), n);
            self.augmenter.augment(utt_frames.view(), fr.frame_index(), features.column_mut(j));
            if supervised {
                let ids = self
                    .catalog
                    .class_id_slice(chunkdata.classids_begin(fr.utterance_index()), n)?;
                class_ids.push(ids[fr.frame_index()]);
            }
        }
        Ok(Batch {
            features,
            class_ids,
            lattices: Vec::new(),
            transcripts: Vec::new(),
            read_from_disk,
        })
    }
}

/// How many consecutive positions fit a minibatch: keep adding utterances
/// while the running total is still below the request; the first utterance is
/// always included, even when it alone exceeds the budget.
/// Returns `(end_position, total_frames)`.
fn utterance_batch_extent(
    refs: &[UtteranceRef],
    spos: usize,
    frames_requested: usize,
) -> (usize, usize) {
    let mut mb_frames = refs[spos].num_frames;
    let mut epos = spos + 1;
    while epos < refs.len() && mb_frames < frames_requested {
        mb_frames += refs[epos].num_frames;
        epos += 1;
    }
    (epos, mb_frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LabelEntry;
    use crate::features::MemoryFeatureReader;
    use crate::lattice::MemoryLatticeSource;
    use crate::CLASSID_BOUNDARY;

    const NUM_CLASSES: usize = 4;

    /// Frame value encodes utterance id and frame index: `id * 1000 + t`.
    fn utterance_matrix(idx: usize, dim: usize, frames: usize) -> Array2<f32> {
        Array2::from_shape_fn((dim, frames), |(d, t)| {
            (idx * 1000 + t) as f32 + d as f32 / 16.0
        })
    }

    struct Synth {
        locators: Vec<ArchiveLocator>,
        reader: MemoryFeatureReader,
        labels: LabelTable,
    }

    fn synth(sizes: &[usize], dim: usize) -> Synth {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut reader = MemoryFeatureReader::new("USER", 100_000);
        let mut locators = Vec::new();
        let mut labels = LabelTable::new();
        for (i, &n) in sizes.iter().enumerate() {
            let key = format!("utt{i:03}");
            reader.insert(&key, utterance_matrix(i, dim, n));
            locators.push(ArchiveLocator::new(format!("{key}.feat"), 0, n));
            labels.insert(
                key,
                vec![LabelEntry {
                    first_frame: 0,
                    num_frames: n,
                    class_id: i % NUM_CLASSES,
                }],
            );
        }
        Synth {
            locators,
            reader,
            labels,
        }
    }

    fn supervised_source(sizes: &[usize], chunk_frames: usize, frame_mode: bool) -> MinibatchSource {
        let s = synth(sizes, 2);
        let mut b = MinibatchSource::builder(s.locators, Box::new(s.reader))
            .labels(s.labels, NUM_CLASSES)
            .chunk_frames(chunk_frames)
            .randomization_range(usize::MAX);
        if frame_mode {
            b = b.frame_mode();
        }
        b.build().unwrap()
    }

    /// Decode `(utterance id, frame index)` from a feature column.
    fn decode(column: ArrayView1<f32>) -> (usize, usize) {
        let v = column[0] as usize;
        (v / 1000, v % 1000)
    }

    #[test]
    fn test_batch_extent_budget_rule() {
        let refs: Vec<UtteranceRef> = [100usize, 150, 80]
            .iter()
            .scan(0usize, |ts, &n| {
                let r = UtteranceRef {
                    chunk_index: 0,
                    utterance_index: 0,
                    num_frames: n,
                    global_ts: *ts,
                };
                *ts += n;
                Some(r)
            })
            .collect();
        // 100 alone is below the budget, so the 150-frame utterance is added
        assert_eq!(utterance_batch_extent(&refs, 0, 200), (2, 250));
        // minimum one utterance, even if it exceeds the request
        assert_eq!(utterance_batch_extent(&refs, 1, 1), (2, 150));
        // budget exactly met by the first utterance
        assert_eq!(utterance_batch_extent(&refs, 0, 100), (1, 100));
        // everything fits
        assert_eq!(utterance_batch_extent(&refs, 0, 1000), (3, 330));
    }

    #[test]
    fn test_full_sweep_utterance_mode() {
        let sizes = [100, 150, 80];
        let mut src = supervised_source(&sizes, 1000, false);
        assert_eq!(src.total_frames(), 330);
        let mut ts = src.first_valid_global_ts(0).unwrap();
        assert_eq!(ts, 0);
        let mut frames_served = 0;
        let mut first = true;
        while ts < src.total_frames() {
            let batch = src.get_batch(ts, 120).unwrap();
            assert!(batch.num_frames() > 0);
            assert_eq!(batch.class_ids.len(), batch.num_frames());
            if first {
                assert!(batch.read_from_disk);
                first = false;
            }
            // every frame's content and label must agree with its utterance
            for (j, &cid) in batch.class_ids.iter().enumerate() {
                let (utt, _t) = decode(batch.features.column(j));
                assert_eq!(cid as usize, utt % NUM_CLASSES);
                assert_ne!(cid, CLASSID_BOUNDARY);
            }
            frames_served += batch.num_frames();
            ts += batch.num_frames();
        }
        assert_eq!(frames_served, src.total_frames());
    }

    #[test]
    fn test_min_one_utterance() {
        let mut src = supervised_source(&[100, 150, 80], 1000, false);
        let ts = src.first_valid_global_ts(0).unwrap();
        let first_len = src.current.as_ref().unwrap().utterance_refs[0].num_frames;
        let batch = src.get_batch(ts, 1).unwrap();
        assert_eq!(batch.num_frames(), first_len);
    }

    #[test]
    fn test_invalid_global_ts() {
        let mut src = supervised_source(&[100, 150, 80], 1000, false);
        let ts = src.first_valid_global_ts(0).unwrap();
        // utterances are at least 2 frames, so ts + 1 is never a boundary
        assert!(matches!(
            src.get_batch(ts + 1, 100),
            Err(SourceError::InvalidGlobalTs { .. })
        ));
    }

    #[test]
    fn test_first_valid_global_ts_snaps() {
        let mut src = supervised_source(&[100, 150, 80], 1000, false);
        src.first_valid_global_ts(0).unwrap();
        let starts: Vec<usize> = src
            .current
            .as_ref()
            .unwrap()
            .utterance_refs
            .iter()
            .map(|u| u.global_ts)
            .collect();
        assert_eq!(src.first_valid_global_ts(starts[1]).unwrap(), starts[1]);
        assert_eq!(src.first_valid_global_ts(starts[1] + 1).unwrap(), starts[2]);
        // a request inside the last utterance snaps to its end
        assert_eq!(src.first_valid_global_ts(starts[2] + 1).unwrap(), 330);
    }

    #[test]
    fn test_rerandomized_per_sweep_and_deterministic() {
        let mut src = supervised_source(&[50, 60, 50, 70, 40, 30], 100, false);
        src.first_valid_global_ts(0).unwrap();
        let sweep0: Vec<UtteranceRef> = src.current.as_ref().unwrap().utterance_refs.clone();
        src.first_valid_global_ts(src.total_frames()).unwrap();
        assert_eq!(src.current.as_ref().unwrap().sweep, 1);
        src.reset();
        src.first_valid_global_ts(0).unwrap();
        assert_eq!(src.current.as_ref().unwrap().utterance_refs, sweep0);
    }

    #[test]
    fn test_paging_idempotence_across_batches() {
        // several chunks so the rolling window actually pages
        let sizes = [50, 60, 50, 70, 40, 30, 50, 60];
        let mut src = supervised_source(&sizes, 100, false);
        let ts = src.first_valid_global_ts(0).unwrap();
        let b1 = src.get_batch(ts, 80).unwrap();
        // force everything out, then re-read the same span
        let chunks = src.current.as_ref().unwrap().chunks.clone();
        for k in 0..chunks.len() {
            src.pager.release(&chunks, k);
        }
        let b2 = src.get_batch(ts, 80).unwrap();
        assert!(b2.read_from_disk);
        assert_eq!(b1.features, b2.features);
        assert_eq!(b1.class_ids, b2.class_ids);
    }

    #[test]
    fn test_unsupervised_mode() {
        let s = synth(&[100, 150], 2);
        let mut src = MinibatchSource::builder(s.locators, Box::new(s.reader))
            .chunk_frames(1000)
            .randomization_range(usize::MAX)
            .build()
            .unwrap();
        assert!(src.unit_counts().is_empty());
        let ts = src.first_valid_global_ts(0).unwrap();
        let batch = src.get_batch(ts, 100).unwrap();
        assert!(batch.class_ids.is_empty());
        assert!(batch.num_frames() > 0);
    }

    #[test]
    fn test_unit_counts() {
        let sizes = [100, 150, 80];
        let src = supervised_source(&sizes, 1000, false);
        assert_eq!(src.unit_counts().iter().sum::<usize>(), 330);
        assert_eq!(src.unit_counts()[1], 150);
    }

    #[test]
    fn test_lattices_and_transcripts() {
        let s = synth(&[100, 150], 2);
        let mut lattices = MemoryLatticeSource::new();
        let mut transcripts = HashMap::new();
        for (i, &n) in [100usize, 150].iter().enumerate() {
            let key = format!("utt{i:03}");
            lattices.insert(&key, n, vec![i as u8; 4]);
            transcripts.insert(
                key.clone(),
                Arc::new(vec![format!("word{i}a"), format!("word{i}b")]),
            );
        }
        let mut src = MinibatchSource::builder(s.locators, Box::new(s.reader))
            .labels(s.labels, NUM_CLASSES)
            .lattices(Arc::new(lattices))
            .transcripts(transcripts)
            .chunk_frames(1000)
            .randomization_range(usize::MAX)
            .build()
            .unwrap();
        let ts = src.first_valid_global_ts(0).unwrap();
        let batch = src.get_batch(ts, 250).unwrap();
        assert_eq!(batch.lattices.len(), 2);
        assert_eq!(batch.transcripts.len(), 2);
        for lattice in &batch.lattices {
            assert!(lattice.key.starts_with("utt"));
        }
    }

    #[test]
    fn test_frame_mode_batches() {
        let sizes = [5, 7, 6, 8, 4];
        let mut src = supervised_source(&sizes, 10, true);
        let total = src.total_frames();
        assert_eq!(total, 30);
        let batch = src.get_batch(0, 10).unwrap();
        assert_eq!(batch.num_frames(), 10);
        assert_eq!(batch.class_ids.len(), 10);
        for j in 0..batch.num_frames() {
            let (utt, t) = decode(batch.features.column(j));
            assert!(t < sizes[utt]);
            assert_eq!(batch.class_ids[j] as usize, utt % NUM_CLASSES);
        }
        // clipped at the sweep end
        let batch = src.get_batch(total - 3, 10).unwrap();
        assert_eq!(batch.num_frames(), 3);
        // a full sweep serves every frame exactly once
        let mut seen = vec![0usize; sizes.len()];
        let mut ts = 0;
        while ts < total {
            let b = src.get_batch(ts, 7).unwrap();
            for j in 0..b.num_frames() {
                let (utt, _t) = decode(b.features.column(j));
                seen[utt] += 1;
            }
            ts += b.num_frames();
        }
        assert_eq!(seen, sizes.to_vec());
    }

    #[test]
    fn test_frame_mode_first_valid_is_identity() {
        let mut src = supervised_source(&[5, 7, 6], 10, true);
        assert_eq!(src.first_valid_global_ts(3).unwrap(), 3);
    }

    #[test]
    fn test_frame_mode_rejects_lattices() {
        let s = synth(&[10, 12], 2);
        let res = MinibatchSource::builder(s.locators, Box::new(s.reader))
            .lattices(Arc::new(MemoryLatticeSource::new()))
            .frame_mode()
            .build();
        assert!(matches!(res, Err(SourceError::FrameModeWithLattices)));
    }

    #[test]
    fn test_transient_read_failure_is_retried() {
        let mut s = synth(&[100, 150], 2);
        s.reader.fail_next_reads(2);
        let mut src = MinibatchSource::builder(s.locators, Box::new(s.reader))
            .labels(s.labels, NUM_CLASSES)
            .chunk_frames(1000)
            .randomization_range(usize::MAX)
            .build()
            .unwrap();
        let ts = src.first_valid_global_ts(0).unwrap();
        assert!(src.get_batch(ts, 100).is_ok());
    }

    #[test]
    fn test_persistent_read_failure_is_fatal() {
        let mut s = synth(&[100, 150], 2);
        s.reader.fail_next_reads(50);
        let mut src = MinibatchSource::builder(s.locators, Box::new(s.reader))
            .labels(s.labels, NUM_CLASSES)
            .chunk_frames(1000)
            .randomization_range(usize::MAX)
            .build()
            .unwrap();
        let ts = src.first_valid_global_ts(0).unwrap();
        assert!(matches!(
            src.get_batch(ts, 100),
            Err(SourceError::Pager(PagerError::Io { .. }))
        ));
    }
}

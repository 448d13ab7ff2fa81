use std::collections::HashMap;

use rand::Rng;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;

use crate::catalog::UtteranceCatalog;
use crate::frameref::{CapacityError, FrameRef};

type Result<T> = std::result::Result<T, RandomizationError>;

#[derive(Error, Debug)]
pub enum RandomizationError {
    #[error("randomized item at position {position} escaped its chunk window")]
    WindowViolation { position: usize },
    #[error("randomized chunks do not tile the sweep timeline")]
    TimelineMismatch,
    #[error("frame position {0} outside the sweep timeline")]
    PositionOutOfRange(usize),
    #[error("Capacity Error")]
    Capacity(#[from] CapacityError),
}

/// A chunk placed on the current sweep's randomized timeline, together with
/// the window of randomized-chunk indices guaranteed resident while any of
/// its positions is being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomizedChunk {
    /// Index into the original (catalog) chunk set.
    pub chunk_index: usize,
    /// First utterance position covered by this chunk.
    pub utterance_pos_begin: usize,
    pub num_utterances: usize,
    /// Start frame on the global timeline.
    pub global_ts: usize,
    pub num_frames: usize,
    /// Paging window `[window_begin, window_end)` in randomized-chunk indices.
    pub window_begin: usize,
    pub window_end: usize,
}

impl RandomizedChunk {
    pub fn utterance_pos_end(&self) -> usize {
        self.utterance_pos_begin + self.num_utterances
    }
    pub fn global_te(&self) -> usize {
        self.global_ts + self.num_frames
    }
}

/// The underlying randomized utterance assigned to an utterance position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceRef {
    /// Index into the randomized chunk sequence.
    pub chunk_index: usize,
    /// Utterance index within that chunk.
    pub utterance_index: usize,
    /// Cached frame count; assigned during timeline placement.
    pub num_frames: usize,
    /// Start frame on the global timeline; assigned during placement.
    pub global_ts: usize,
}

impl UtteranceRef {
    pub fn global_te(&self) -> usize {
        self.global_ts + self.num_frames
    }
}

/// Snapshot of all randomization state for one sweep. Rebuilt wholesale on
/// sweep change and treated as immutable afterwards.
pub struct Randomization {
    pub(crate) sweep: usize,
    pub(crate) chunks: Vec<RandomizedChunk>,
    /// Position -> defining randomized-chunk index (the chunk that owns the
    /// position on the unrandomized timeline); determines the paging window.
    pub(crate) position_chunks: Vec<usize>,
    /// \[position\] -> randomized utterance (utterance mode).
    pub(crate) utterance_refs: Vec<UtteranceRef>,
    /// `global_ts` -> position lookup (utterance mode).
    pub(crate) position_map: HashMap<usize, usize>,
    /// \[frame position\] -> randomized frame (frame mode).
    pub(crate) frame_refs: Vec<FrameRef>,
}

/// Bring `v` into random order by swapping every element with a randomly
/// drawn partner.
fn random_shuffle<T>(v: &mut [T], seed: u64) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    for i in 0..v.len() {
        let j = rng.gen_range(0..v.len());
        v.swap(i, j);
    }
}

impl Randomization {
    /// Recompute the full randomization snapshot for `sweep`.
    ///
    /// Seeding depends only on the sweep number, so two builds for the same
    /// sweep are bit-identical. The construction guarantees that every
    /// position's assigned item lies within the chunk window of the position's
    /// defining chunk; this is re-verified before returning.
    pub fn build(
        catalog: &UtteranceCatalog,
        sweep: usize,
        randomization_range: usize,
        frame_mode: bool,
    ) -> Result<Self> {
        let total_frames = catalog.total_frames();
        let sweep_ts = sweep * total_frames;

        // randomize chunk order and lay the chunks end-to-end on the timeline
        let mut order: Vec<usize> = (0..catalog.chunks().len()).collect();
        random_shuffle(&mut order, sweep as u64);
        let mut chunks: Vec<RandomizedChunk> = Vec::with_capacity(order.len());
        let mut pos = 0usize;
        let mut ts = sweep_ts;
        for &chunk_index in &order {
            let cd = &catalog.chunks()[chunk_index];
            chunks.push(RandomizedChunk {
                chunk_index,
                utterance_pos_begin: pos,
                num_utterances: cd.num_utterances(),
                global_ts: ts,
                num_frames: cd.total_frames(),
                window_begin: 0,
                window_end: 0,
            });
            pos += cd.num_utterances();
            ts += cd.total_frames();
        }
        if pos != catalog.num_utterances() || ts != sweep_ts + total_frames {
            return Err(RandomizationError::TimelineMismatch);
        }

        // sliding-window pass: start from the left neighbor's window and
        // grow/shrink until the half-range constraint holds on both sides
        let n = chunks.len();
        for k in 0..n {
            let (mut wb, mut we) = if k == 0 {
                (0, 1)
            } else {
                (chunks[k - 1].window_begin, chunks[k - 1].window_end)
            };
            while chunks[k].global_ts - chunks[wb].global_ts > randomization_range / 2 {
                wb += 1; // too early
            }
            while we < n && chunks[we].global_te() - chunks[k].global_ts < randomization_range / 2 {
                we += 1; // got more space
            }
            // the window always covers the chunk itself
            let we = we.max(k + 1);
            debug_assert!(wb <= k && k < we);
            chunks[k].window_begin = wb;
            chunks[k].window_end = we;
        }

        let mut rand = Randomization {
            sweep,
            chunks,
            position_chunks: Vec::new(),
            utterance_refs: Vec::new(),
            position_map: HashMap::new(),
            frame_refs: Vec::new(),
        };
        if !frame_mode {
            rand.build_utterance_refs(catalog, sweep, sweep_ts)?;
        } else {
            rand.build_frame_refs(catalog, sweep, sweep_ts, total_frames)?;
        }
        Ok(rand)
    }

    /// Is the item's chunk within the window of `position`'s defining chunk?
    fn in_window(&self, position: usize, item_chunk: usize) -> bool {
        let c = &self.chunks[self.position_chunks[position]];
        item_chunk >= c.window_begin && item_chunk < c.window_end
    }

    /// Constrained permutation of utterance positions plus timeline placement
    /// and the `global_ts -> position` lookup.
    fn build_utterance_refs(
        &mut self,
        catalog: &UtteranceCatalog,
        sweep: usize,
        sweep_ts: usize,
    ) -> Result<()> {
        // positions 1:1 with utterances in randomized-chunk order
        self.position_chunks = Vec::with_capacity(catalog.num_utterances());
        let mut refs: Vec<UtteranceRef> = Vec::with_capacity(catalog.num_utterances());
        for (k, c) in self.chunks.iter().enumerate() {
            for i in 0..c.num_utterances {
                self.position_chunks.push(k);
                refs.push(UtteranceRef {
                    chunk_index: k,
                    utterance_index: i,
                    num_frames: 0,
                    global_ts: usize::MAX,
                });
            }
        }

        // random swaps constrained to the window of each position; a swap must
        // be admissible in both directions since adjacent windows differ
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(sweep as u64 + 1);
        for i in 0..refs.len() {
            let c = &self.chunks[self.position_chunks[i]];
            let pos_begin = self.chunks[c.window_begin].utterance_pos_begin;
            let pos_end = self.chunks[c.window_end - 1].utterance_pos_end();
            loop {
                let j = rng.gen_range(pos_begin..pos_end);
                if i == j {
                    break; // mapped onto itself, nothing to swap
                }
                if !self.in_window(i, refs[j].chunk_index) {
                    continue;
                }
                if !self.in_window(j, refs[i].chunk_index) {
                    continue;
                }
                refs.swap(i, j);
                break;
            }
        }

        // place the randomized utterances on the global timeline
        let mut t = sweep_ts;
        for r in refs.iter_mut() {
            r.global_ts = t;
            let rc = &self.chunks[r.chunk_index];
            r.num_frames = catalog.chunks()[rc.chunk_index].num_frames(r.utterance_index);
            t = r.global_te();
        }
        if t != sweep_ts + catalog.total_frames() {
            return Err(RandomizationError::TimelineMismatch);
        }

        for (i, r) in refs.iter().enumerate() {
            if !self.in_window(i, r.chunk_index) {
                return Err(RandomizationError::WindowViolation { position: i });
            }
        }

        self.position_map = refs.iter().enumerate().map(|(p, r)| (r.global_ts, p)).collect();
        self.utterance_refs = refs;
        Ok(())
    }

    /// Constrained permutation of single frame positions (frame mode).
    fn build_frame_refs(
        &mut self,
        catalog: &UtteranceCatalog,
        sweep: usize,
        sweep_ts: usize,
        total_frames: usize,
    ) -> Result<()> {
        // dense frame position -> defining chunk map, plus identity frame refs
        // in randomized-chunk order
        let mut t_to_chunk: Vec<u32> = Vec::with_capacity(total_frames);
        let mut refs: Vec<FrameRef> = Vec::with_capacity(total_frames);
        for (k, c) in self.chunks.iter().enumerate() {
            let k32 = u32::try_from(k).map_err(|_| CapacityError::Overflow {
                field: "t_to_chunk",
                value: k,
                max: u32::MAX as usize,
            })?;
            let cd = &catalog.chunks()[c.chunk_index];
            for i in 0..cd.num_utterances() {
                for m in 0..cd.num_frames(i) {
                    refs.push(FrameRef::new(k, i, m)?);
                    t_to_chunk.push(k32);
                }
            }
        }
        if refs.len() != total_frames {
            return Err(RandomizationError::TimelineMismatch);
        }

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(sweep as u64 + 1);
        for t in 0..total_frames {
            let c = &self.chunks[t_to_chunk[t] as usize];
            let (wb, we) = (c.window_begin, c.window_end);
            // frame-position extent of the resident window
            let post_begin = self.chunks[wb].global_ts - sweep_ts;
            let post_end = self.chunks[we - 1].global_te() - sweep_ts;
            loop {
                let t_swap = rng.gen_range(post_begin..post_end);
                // the frame currently at t_swap must be admissible at t...
                let swap_chunk = refs[t_swap].chunk_index();
                if swap_chunk < wb || swap_chunk >= we {
                    continue;
                }
                // ...and the frame at t admissible at t_swap; one-directional
                // checking is insufficient since neighboring windows differ
                let source_chunk = refs[t].chunk_index();
                let target = &self.chunks[t_to_chunk[t_swap] as usize];
                if source_chunk < target.window_begin || source_chunk >= target.window_end {
                    continue;
                }
                refs.swap(t, t_swap);
                break;
            }
        }

        // full verification sweep over all frame positions
        let mut t = 0usize;
        for c in self.chunks.iter() {
            for _ in 0..c.num_frames {
                let ci = refs[t].chunk_index();
                if ci < c.window_begin || ci >= c.window_end {
                    return Err(RandomizationError::WindowViolation { position: t });
                }
                t += 1;
            }
        }

        self.frame_refs = refs;
        Ok(())
    }

    /// Binary search the randomized chunk timeline for the chunk containing
    /// global frame position `t`.
    pub(crate) fn chunk_for_frame_pos(&self, t: usize) -> Result<usize> {
        let k = self.chunks.partition_point(|c| c.global_te() <= t);
        match self.chunks.get(k) {
            Some(c) if t >= c.global_ts => Ok(k),
            _ => Err(RandomizationError::PositionOutOfRange(t)),
        }
    }
}

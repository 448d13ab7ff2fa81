use std::collections::HashMap;

use thiserror::Error;

use crate::features::ArchiveLocator;
use crate::frameref::{MAX_FRAMES_PER_UTTERANCE, MAX_UTTERANCES_PER_CHUNK};
use crate::lattice::LatticeSource;
use crate::{ClassId, CLASSID_BOUNDARY};

type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("utterance '{key}' has {frames} frames; at least 2 required")]
    UtteranceTooShort { key: String, frames: usize },
    #[error("labels for '{key}' not in consecutive frame order")]
    LabelsNotConsecutive { key: String },
    #[error("class id {class_id} exceeds output dimension {num_classes} in '{key}'")]
    ClassIdOutOfRange {
        class_id: usize,
        num_classes: usize,
        key: String,
    },
    #[error("class id {0} does not fit into ClassId storage")]
    ClassIdTooWide(usize),
    #[error("label durations inconsistent with feature durations at '{key}'")]
    ClassIdsOutOfSync { key: String },
    #[error("expected class-id boundary marker not found; label store out of sync")]
    SentinelMismatch,
    #[error("{dropped} of {total} utterances unusable; assuming broken configuration")]
    BrokenConfiguration { dropped: usize, total: usize },
    #[error("no usable utterances in corpus")]
    EmptyCorpus,
}

/// One `(first_frame, num_frames, class_id)` span of an utterance's label
/// sequence, as parsed from the transcript format by an external reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub first_frame: usize,
    pub num_frames: usize,
    pub class_id: usize,
}

/// Utterance key -> ordered label spans. Empty means unsupervised training.
pub type LabelTable = HashMap<String, Vec<LabelEntry>>;

/// Descriptor for one utterance. Immutable once built; owned by its chunk.
#[derive(Debug, Clone)]
pub struct UtteranceDesc {
    locator: ArchiveLocator,
    classids_begin: usize,
}

impl UtteranceDesc {
    pub fn locator(&self) -> &ArchiveLocator {
        &self.locator
    }
    pub fn num_frames(&self) -> usize {
        self.locator.num_frames()
    }
    pub fn key(&self) -> String {
        self.locator.key()
    }
    /// Offset of this utterance's first frame in the flat class-id array.
    pub fn classids_begin(&self) -> usize {
        self.classids_begin
    }
}

/// A contiguous group of utterances: the unit of disk i/o and residency.
/// Holds only metadata; the paged frame/lattice cache lives in the pager.
#[derive(Debug, Default, Clone)]
pub struct ChunkData {
    utterances: Vec<UtteranceDesc>,
    first_frames: Vec<usize>,
    total_frames: usize,
}

impl ChunkData {
    fn push(&mut self, utt: UtteranceDesc) {
        self.first_frames.push(self.total_frames);
        self.total_frames += utt.num_frames();
        self.utterances.push(utt);
    }

    pub fn num_utterances(&self) -> usize {
        self.utterances.len()
    }
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
    pub fn utterance(&self, i: usize) -> &UtteranceDesc {
        &self.utterances[i]
    }
    pub fn num_frames(&self, i: usize) -> usize {
        self.utterances[i].num_frames()
    }
    /// First frame of utterance `i` within the chunk's frame buffer.
    pub fn first_frame(&self, i: usize) -> usize {
        self.first_frames[i]
    }
    pub fn classids_begin(&self, i: usize) -> usize {
        self.utterances[i].classids_begin()
    }
}

/// The immutable per-corpus data store: utterance descriptors grouped into
/// chunks, the flat class-id array, and per-class frame counts.
pub struct UtteranceCatalog {
    chunks: Vec<ChunkData>,
    class_ids: Vec<ClassId>,
    counts: Vec<usize>,
    num_utterances: usize,
    total_frames: usize,
}

impl UtteranceCatalog {
    /// Build the catalog from the training-set file list and label table.
    ///
    /// Utterances with missing labels/lattices or mismatched durations are
    /// dropped and counted; an excessive drop rate is treated as a broken
    /// configuration. Utterances longer than the frame-index capacity are
    /// skipped with a diagnostic. Chunks are filled greedily in arrival order
    /// until `chunk_frames` is exceeded or the utterance-index capacity is
    /// reached, yielding roughly uniform disk reads.
    pub fn build(
        locators: Vec<ArchiveLocator>,
        labels: &LabelTable,
        num_classes: usize,
        lattices: Option<&dyn LatticeSource>,
        chunk_frames: usize,
    ) -> Result<Self> {
        let num_infiles = locators.len();
        let supervised = !labels.is_empty();
        let mut class_ids: Vec<ClassId> = Vec::new();
        let mut counts: Vec<usize> = Vec::new();
        let mut utterances: Vec<UtteranceDesc> = Vec::with_capacity(num_infiles);
        let mut total_frames = 0usize;
        let mut num_classes_seen = 0usize;
        let mut no_labels = 0usize; // missing or mismatched label entries
        let mut no_lattice = 0usize; // missing lattice archive entries

        for locator in locators {
            let utt_frames = locator.num_frames();
            let key = locator.key();
            // 2 frames minimum so boundary markers stay addressable
            if utt_frames < 2 {
                return Err(CatalogError::UtteranceTooShort {
                    key,
                    frames: utt_frames,
                });
            }
            if utt_frames > MAX_FRAMES_PER_UTTERANCE {
                log::warn!(
                    "skipping '{}' ({} frames): exceeds max frames ({}) of the frame index field",
                    key,
                    utt_frames,
                    MAX_FRAMES_PER_UTTERANCE
                );
                continue;
            }

            let classids_begin = class_ids.len();
            if supervised {
                let labseq = labels.get(&key);
                let lacks_labels = labseq.is_none();
                if lacks_labels {
                    if no_labels < 5 {
                        log::warn!("no labels for '{}'", key);
                    }
                    no_labels += 1;
                }
                let lacks_lattice = lattices.map_or(false, |l| !l.has_lattice(&key));
                if lacks_lattice {
                    if no_lattice < 5 {
                        log::warn!("no lattice for '{}'", key);
                    }
                    no_lattice += 1;
                }
                let labseq = match labseq {
                    Some(l) if !lacks_lattice => l,
                    _ => continue, // skip this utterance entirely
                };
                let lab_frames = labseq.last().map_or(0, |e| e.first_frame + e.num_frames);
                if lab_frames != utt_frames {
                    log::warn!(
                        "duration mismatch ({} in labels vs. {} in features), skipping '{}'",
                        lab_frames,
                        utt_frames,
                        key
                    );
                    no_labels += 1;
                    continue;
                }
                // expand the label spans into the flat class-id array
                for (j, e) in labseq.iter().enumerate() {
                    let expected_first = if j == 0 {
                        0
                    } else {
                        labseq[j - 1].first_frame + labseq[j - 1].num_frames
                    };
                    if e.first_frame != expected_first {
                        return Err(CatalogError::LabelsNotConsecutive { key });
                    }
                    if e.class_id >= num_classes {
                        return Err(CatalogError::ClassIdOutOfRange {
                            class_id: e.class_id,
                            num_classes,
                            key,
                        });
                    }
                    if e.class_id >= CLASSID_BOUNDARY as usize {
                        return Err(CatalogError::ClassIdTooWide(e.class_id));
                    }
                    class_ids.extend(std::iter::repeat(e.class_id as ClassId).take(e.num_frames));
                    num_classes_seen = num_classes_seen.max(e.class_id + 1);
                    if counts.len() < num_classes_seen {
                        counts.resize(num_classes_seen, 0);
                    }
                    counts[e.class_id] += e.num_frames;
                }
                class_ids.push(CLASSID_BOUNDARY);
            }

            utterances.push(UtteranceDesc {
                locator,
                classids_begin,
            });
            total_frames += utt_frames;
            if supervised && class_ids.len() != total_frames + utterances.len() {
                return Err(CatalogError::ClassIdsOutOfSync { key });
            }
        }

        log::info!(
            "{} frames in {} out of {} utterances; {} classes",
            total_frames,
            utterances.len(),
            num_infiles,
            num_classes_seen
        );
        if supervised {
            for utt in &utterances {
                if class_ids.get(utt.classids_begin() + utt.num_frames()) != Some(&CLASSID_BOUNDARY)
                {
                    return Err(CatalogError::SentinelMismatch);
                }
            }
        }
        if no_labels + no_lattice > 0 {
            log::warn!(
                "out of {} files, {} have no labels and {} have no lattice",
                num_infiles,
                no_labels,
                no_lattice
            );
            if no_labels + no_lattice > num_infiles / 2 {
                return Err(CatalogError::BrokenConfiguration {
                    dropped: no_labels + no_lattice,
                    total: num_infiles,
                });
            }
        }
        if total_frames == 0 {
            return Err(CatalogError::EmptyCorpus);
        }

        // distribute utterances over chunks by counting off frames; chunks end
        // up slightly larger than the target (by half an utterance on average)
        let num_utterances = utterances.len();
        let mut chunks: Vec<ChunkData> = Vec::with_capacity(total_frames / chunk_frames + 1);
        for utt in utterances {
            match chunks.last_mut() {
                Some(c)
                    if c.total_frames() <= chunk_frames
                        && c.num_utterances() < MAX_UTTERANCES_PER_CHUNK =>
                {
                    c.push(utt)
                }
                _ => {
                    let mut c = ChunkData::default();
                    c.push(utt);
                    chunks.push(c);
                }
            }
        }
        log::info!(
            "{} utterances grouped into {} chunks, av. chunk size: {:.1} utterances, {:.1} frames",
            num_utterances,
            chunks.len(),
            num_utterances as f64 / chunks.len() as f64,
            total_frames as f64 / chunks.len() as f64
        );

        Ok(UtteranceCatalog {
            chunks,
            class_ids,
            counts,
            num_utterances,
            total_frames,
        })
    }

    pub fn chunks(&self) -> &[ChunkData] {
        &self.chunks
    }
    pub fn num_utterances(&self) -> usize {
        self.num_utterances
    }
    /// Frames per sweep.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
    /// Per-class frame occurrence counts, for prior estimation.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }
    pub fn is_supervised(&self) -> bool {
        !self.class_ids.is_empty()
    }

    /// Class ids for one utterance, with the boundary sentinel checked on
    /// every access. Empty in unsupervised mode.
    pub fn class_id_slice(&self, classids_begin: usize, num_frames: usize) -> Result<&[ClassId]> {
        if !self.is_supervised() {
            return Ok(&[]);
        }
        if self.class_ids.get(classids_begin + num_frames) != Some(&CLASSID_BOUNDARY) {
            return Err(CatalogError::SentinelMismatch);
        }
        Ok(&self.class_ids[classids_begin..classids_begin + num_frames])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locators(sizes: &[usize]) -> Vec<ArchiveLocator> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| ArchiveLocator::new(format!("utt{i:03}.feat"), 0, n))
            .collect()
    }

    fn labels_for(sizes: &[usize], num_classes: usize) -> LabelTable {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                (
                    format!("utt{i:03}"),
                    vec![LabelEntry {
                        first_frame: 0,
                        num_frames: n,
                        class_id: i % num_classes,
                    }],
                )
            })
            .collect()
    }

    #[test]
    fn test_chunk_grouping() {
        let sizes = [50, 60, 50, 70, 40, 30];
        let cat =
            UtteranceCatalog::build(locators(&sizes), &LabelTable::new(), 0, None, 100).unwrap();
        // greedy fill: a chunk keeps accepting while its total is <= target
        let per_chunk: Vec<usize> = cat.chunks().iter().map(|c| c.num_utterances()).collect();
        assert_eq!(per_chunk, vec![2, 2, 2]);
        assert_eq!(cat.total_frames(), 300);
        assert_eq!(cat.num_utterances(), 6);
        assert_eq!(cat.chunks()[0].first_frame(1), 50);
    }

    #[test]
    fn test_oversized_utterance_skipped() {
        let sizes = [100, 70_000, 150];
        let cat =
            UtteranceCatalog::build(locators(&sizes), &LabelTable::new(), 0, None, 1000).unwrap();
        assert_eq!(cat.num_utterances(), 2);
        assert_eq!(cat.total_frames(), 250);
    }

    #[test]
    fn test_label_sentinels_and_counts() {
        let sizes = [100, 150, 80];
        let cat =
            UtteranceCatalog::build(locators(&sizes), &labels_for(&sizes, 2), 2, None, 1000)
                .unwrap();
        assert!(cat.is_supervised());
        assert_eq!(cat.counts(), &[180, 150]);
        for chunk in cat.chunks() {
            for i in 0..chunk.num_utterances() {
                let ids = cat.class_id_slice(chunk.classids_begin(i), chunk.num_frames(i)).unwrap();
                assert_eq!(ids.len(), chunk.num_frames(i));
                assert!(ids.iter().all(|&c| c != CLASSID_BOUNDARY));
            }
        }
    }

    #[test]
    fn test_duration_mismatch_dropped() {
        let sizes = [100, 150, 80];
        let mut labels = labels_for(&sizes, 2);
        labels.get_mut("utt001").unwrap()[0].num_frames = 140; // off by 10
        let cat = UtteranceCatalog::build(locators(&sizes), &labels, 2, None, 1000).unwrap();
        assert_eq!(cat.num_utterances(), 2);
        assert_eq!(cat.total_frames(), 180);
    }

    #[test]
    fn test_broken_configuration() {
        let sizes = [100, 150, 80];
        let mut labels = labels_for(&sizes, 2);
        labels.remove("utt000");
        labels.remove("utt002");
        assert!(matches!(
            UtteranceCatalog::build(locators(&sizes), &labels, 2, None, 1000),
            Err(CatalogError::BrokenConfiguration { dropped: 2, total: 3 })
        ));
    }

    #[test]
    fn test_labels_not_consecutive() {
        let mut labels = LabelTable::new();
        labels.insert(
            "utt000".into(),
            vec![
                LabelEntry { first_frame: 0, num_frames: 5, class_id: 0 },
                LabelEntry { first_frame: 6, num_frames: 4, class_id: 1 },
            ],
        );
        assert!(matches!(
            UtteranceCatalog::build(locators(&[10]), &labels, 2, None, 1000),
            Err(CatalogError::LabelsNotConsecutive { .. })
        ));
    }

    #[test]
    fn test_class_id_out_of_range() {
        let sizes = [100];
        let labels = labels_for(&sizes, 1);
        assert!(matches!(
            UtteranceCatalog::build(locators(&sizes), &labels, 0, None, 1000),
            Err(CatalogError::ClassIdOutOfRange { .. })
        ));
    }

    #[test]
    fn test_too_short_utterance_fatal() {
        assert!(matches!(
            UtteranceCatalog::build(locators(&[1]), &LabelTable::new(), 0, None, 1000),
            Err(CatalogError::UtteranceTooShort { .. })
        ));
    }
}

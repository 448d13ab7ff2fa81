//! A two-level randomized minibatch source for utterance training data.
//!
//! The corpus is grouped into chunks that are paged in and out of RAM on
//! demand, while utterances (or single frames) are shuffled across the whole
//! corpus within a rolling chunk window. Randomization is re-derived
//! deterministically at the start of every sweep over the corpus, so the
//! timeline of served data is reproducible and resumable.

pub mod catalog;
pub mod config;
pub mod features;
pub mod frameref;
pub mod lattice;
pub mod pager;
pub mod randomizer;
pub mod source;
pub mod util;

/// Storage type for per-frame class ids.
pub type ClassId = u16;

/// Reserved boundary marker appended after every utterance's class ids.
pub const CLASSID_BOUNDARY: ClassId = ClassId::MAX;

pub use catalog::{CatalogError, LabelEntry, LabelTable, UtteranceCatalog};
pub use config::{ArchiveEntry, SourceConfig};
pub use features::{
    ArchiveLocator, FeatureInfo, FeatureReader, FrameAugmenter, MemoryFeatureReader, NoAugment,
};
pub use frameref::{CapacityError, FrameRef, MAX_FRAMES_PER_UTTERANCE, MAX_UTTERANCES_PER_CHUNK};
pub use lattice::{LatticeData, LatticeSource, MemoryLatticeSource, WordTranscript};
pub use pager::{ChunkPager, PagerError};
pub use randomizer::{Randomization, RandomizationError};
pub use source::{Batch, MinibatchSource, MinibatchSourceBuilder, SourceError};

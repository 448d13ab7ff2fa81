use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Opaque lattice payload as produced by the lattice archive reader.
/// This crate only pages and hands these out; decoding is external.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatticeData {
    pub key: String,
    pub num_frames: usize,
    pub payload: Vec<u8>,
}

/// Source of decoding lattices for sequence training. Absent means
/// lattice-free training.
pub trait LatticeSource {
    fn has_lattice(&self, key: &str) -> bool;
    /// Fetch the lattice for an utterance; `num_frames` is passed for
    /// consistency checking against the feature stream.
    fn get_lattice(&self, key: &str, num_frames: usize) -> io::Result<Arc<LatticeData>>;
}

/// Word-level transcript of one utterance, for adding best paths to lattices.
pub type WordTranscript = Arc<Vec<String>>;

/// In-memory [`LatticeSource`] used by tests.
#[derive(Default)]
pub struct MemoryLatticeSource {
    lattices: HashMap<String, Arc<LatticeData>>,
}

impl MemoryLatticeSource {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, key: &str, num_frames: usize, payload: Vec<u8>) {
        self.lattices.insert(
            key.to_string(),
            Arc::new(LatticeData {
                key: key.to_string(),
                num_frames,
                payload,
            }),
        );
    }
}

impl LatticeSource for MemoryLatticeSource {
    fn has_lattice(&self, key: &str) -> bool {
        self.lattices.contains_key(key)
    }

    fn get_lattice(&self, key: &str, num_frames: usize) -> io::Result<Arc<LatticeData>> {
        let lat = self
            .lattices
            .get(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no lattice for {key}")))?;
        if lat.num_frames != num_frames {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "lattice for {} covers {} frames, features have {}",
                    key, lat.num_frames, num_frames
                ),
            ));
        }
        Ok(lat.clone())
    }
}

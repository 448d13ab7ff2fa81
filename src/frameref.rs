use thiserror::Error;

/// Capacity of the chunk-index field (32 bits).
pub const MAX_CHUNKS: usize = u32::MAX as usize;
/// Capacity of the utterance-index field (16 bits).
pub const MAX_UTTERANCES_PER_CHUNK: usize = u16::MAX as usize;
/// Capacity of the frame-index field (16 bits).
pub const MAX_FRAMES_PER_UTTERANCE: usize = u16::MAX as usize;

#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("{field} value {value} exceeds bit field capacity ({max})")]
    Overflow {
        field: &'static str,
        value: usize,
        max: usize,
    },
}

/// Location of a single frame: `(chunk, utterance, frame)` packed into one
/// `u64`. One of these exists per corpus frame in frame mode, so the record
/// is kept fixed-width; construction rejects out-of-range indices instead of
/// truncating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct FrameRef(u64);

impl FrameRef {
    pub fn new(
        chunk_index: usize,
        utterance_index: usize,
        frame_index: usize,
    ) -> Result<Self, CapacityError> {
        check_field("chunk_index", chunk_index, MAX_CHUNKS)?;
        check_field("utterance_index", utterance_index, MAX_UTTERANCES_PER_CHUNK)?;
        check_field("frame_index", frame_index, MAX_FRAMES_PER_UTTERANCE)?;
        Ok(FrameRef(
            ((chunk_index as u64) << 32) | ((utterance_index as u64) << 16) | frame_index as u64,
        ))
    }

    /// Index into the randomized chunk sequence.
    #[inline]
    pub fn chunk_index(&self) -> usize {
        (self.0 >> 32) as usize
    }
    /// Utterance index within that chunk.
    #[inline]
    pub fn utterance_index(&self) -> usize {
        ((self.0 >> 16) & 0xffff) as usize
    }
    /// Frame index within that utterance.
    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.0 & 0xffff) as usize
    }
}

fn check_field(field: &'static str, value: usize, max: usize) -> Result<(), CapacityError> {
    if value > max {
        return Err(CapacityError::Overflow { field, value, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let r = FrameRef::new(123_456, 65_535, 17).unwrap();
        assert_eq!(r.chunk_index(), 123_456);
        assert_eq!(r.utterance_index(), 65_535);
        assert_eq!(r.frame_index(), 17);
    }

    #[test]
    fn test_frame_index_overflow() {
        // A 70000-frame utterance does not fit the 16-bit frame field.
        assert!(matches!(
            FrameRef::new(0, 0, 70_000),
            Err(CapacityError::Overflow { field: "frame_index", .. })
        ));
    }

    #[test]
    fn test_utterance_index_overflow() {
        assert!(FrameRef::new(0, MAX_UTTERANCES_PER_CHUNK + 1, 0).is_err());
    }
}

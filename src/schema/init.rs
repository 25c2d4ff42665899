//! Initial-contents patterns for job buffers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// How a buffer is populated before the first dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BufferInit {
    /// All bytes zero.
    #[default]
    Zero,
    /// Every 32-bit word set to `word`.
    Fill { word: u32 },
    /// Explicit words written from offset 0; the remainder is left untouched.
    Words { values: Vec<u32> },
    /// `start, start + step, start + 2 * step, ...` (wrapping).
    Sequence { start: u32, step: u32 },
    /// Uniform random words from a seeded generator.
    Random { seed: u64 },
}

impl BufferInit {
    /// Bytes written by an explicit pattern, or `None` when the pattern
    /// covers whatever size the buffer has.
    pub fn byte_len(&self) -> Option<u64> {
        match self {
            BufferInit::Words { values } => Some(values.len() as u64 * 4),
            _ => None,
        }
    }

    /// Generate the words for a buffer of `size` bytes.
    ///
    /// Trailing bytes that do not form a whole word are not covered.
    pub fn generate(&self, size: u64) -> Vec<u32> {
        let count = (size / 4) as usize;
        match self {
            BufferInit::Zero => vec![0; count],
            BufferInit::Fill { word } => vec![*word; count],
            BufferInit::Words { values } => values.clone(),
            BufferInit::Sequence { start, step } => (0..count as u32)
                .map(|i| start.wrapping_add(step.wrapping_mul(i)))
                .collect(),
            BufferInit::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                (0..count).map(|_| rng.r#gen::<u32>()).collect()
            }
        }
    }
}

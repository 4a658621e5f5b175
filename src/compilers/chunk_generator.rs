//! Sample-chunk generation for progressive renders.
//!
//! Cycles samples are split into chunks that start small (so the first
//! previews appear quickly) and grow along a sub-quadratic curve, until a
//! prospective chunk would exceed the per-task sample cap; the remaining
//! samples are then covered by uniformly sized chunks of at most the cap.

/// Default number of chunks produced by the curve phase.
pub const DEFAULT_UNCAPPED_CHUNKS: u32 = 5;

const CURVE_EXPONENT: f64 = 5.0 / 3.0;

/// Generates the sample ranges for the chunks of a progressive render.
///
/// The produced `(from, to)` pairs are base-1 inclusive, strictly
/// increasing, and cover `1..=sample_count` exactly once with no chunk
/// larger than `sample_cap` samples. Iteration is restartable: every call
/// to [`ChunkGenerator::chunks`] yields the identical sequence.
#[derive(Debug, Clone)]
pub struct ChunkGenerator {
    sample_count: u32,
    sample_cap: u32,
    uncapped_chunks: u32,
}

impl ChunkGenerator {
    pub fn new(sample_count: u32, sample_cap: u32, uncapped_chunks: u32) -> Self {
        Self {
            sample_count,
            sample_cap: sample_cap.max(1),
            uncapped_chunks: uncapped_chunks.max(2),
        }
    }

    /// The chunk sequence as `(from, to)` sample ranges.
    pub fn chunks(&self) -> Vec<(u32, u32)> {
        let mut chunks = Vec::new();
        if self.sample_count == 0 {
            return chunks;
        }

        let total = f64::from(self.sample_count);
        let start = total / 40.0;
        let base = (total - start).powf(1.0 / CURVE_EXPONENT) / f64::from(self.uncapped_chunks - 1);

        // Curve phase: cumulative sample counts follow
        // f(i) = (base * i)^e + start, until a chunk would exceed the cap.
        let mut cumulative: u32 = 0;
        for i in 0..self.uncapped_chunks {
            let f = (base * f64::from(i)).powf(CURVE_EXPONENT) + start;
            let next = (f.round() as u32).min(self.sample_count);
            if next <= cumulative {
                continue;
            }
            if next - cumulative > self.sample_cap {
                break;
            }
            chunks.push((cumulative + 1, next));
            cumulative = next;
            if cumulative >= self.sample_count {
                break;
            }
        }

        // Uniform phase: spread the remainder over the fewest chunks that
        // respect the cap, sized evenly to avoid a tiny leftover chunk.
        let remaining = self.sample_count - cumulative;
        if remaining > 0 {
            let num_chunks = remaining.div_ceil(self.sample_cap);
            let phase_base = cumulative;
            for j in 1..=num_chunks {
                let next = phase_base
                    + (f64::from(remaining) * f64::from(j) / f64::from(num_chunks)).round() as u32;
                if next <= cumulative {
                    continue;
                }
                chunks.push((cumulative + 1, next));
                cumulative = next;
            }
        }

        chunks
    }

    /// Iterate over the chunk sequence.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + use<> {
        self.chunks().into_iter()
    }
}

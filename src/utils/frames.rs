//! Frame-range parsing, merging and chunking.
//!
//! Frame ranges are comma-separated tokens, each either a single integer
//! or an inclusive `A-B` span: `"1,3-5,8"` ⇔ `[1, 3, 4, 5, 8]`. These
//! functions underpin all job compilers.

use crate::{Error, Result};

/// Range notation style used by [`frame_range_merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeStyle {
    /// `3-5`
    #[default]
    Dash,
    /// `3..5`, as Blender's command line expects.
    Blender,
}

impl RangeStyle {
    fn separator(&self) -> &'static str {
        match self {
            Self::Dash => "-",
            Self::Blender => "..",
        }
    }
}

/// Parse a frame-range string into a sorted list of frame numbers.
///
/// Empty input yields an empty list. Tokens with more than one `-` are
/// ignored, matching the lenient behavior Managers rely on.
pub fn frame_range_parse(frame_range: &str) -> Result<Vec<i64>> {
    if frame_range.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut frames = Vec::new();
    for part in frame_range.split(',') {
        let part = part.trim();
        let pieces: Vec<&str> = part.split('-').collect();
        match pieces.as_slice() {
            [single] => frames.push(parse_frame(single)?),
            [start, end] => {
                let start = parse_frame(start)?;
                let end = parse_frame(end)?;
                frames.extend(start..=end);
            }
            _ => continue,
        }
    }
    frames.sort_unstable();
    Ok(frames)
}

fn parse_frame(token: &str) -> Result<i64> {
    token
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid frame number {token:?}")))
}

/// Merge a sorted frame list back into a compact range string.
///
/// Consecutive runs of three or more frames become `A-B` (or `A..B` in
/// Blender style); runs of two are emitted as two singles.
pub fn frame_range_merge(frames: &[i64], style: RangeStyle) -> String {
    if frames.is_empty() {
        return String::new();
    }

    let sep = style.separator();
    let mut ranges: Vec<String> = Vec::new();
    let mut start = frames[0];
    let mut prev = frames[0];
    let mut current = frames[0];

    for &frame in &frames[1..] {
        current = frame;
        if current != prev + 1 {
            push_run(&mut ranges, start, prev, sep);
            start = current;
        }
        prev = current;
    }
    push_run(&mut ranges, start, current, sep);

    ranges.join(",")
}

fn push_run(out: &mut Vec<String>, start: i64, end: i64, sep: &str) {
    if start == end {
        out.push(start.to_string());
    } else if start + 1 == end {
        out.push(start.to_string());
        out.push(end.to_string());
    } else {
        out.push(format!("{start}{sep}{end}"));
    }
}

/// Cheap bounds of a frame-range string, without materializing the list.
///
/// Returns `None` for empty input.
pub fn frame_range_start_end(frame_range: &str) -> Result<Option<(i64, i64)>> {
    if frame_range.trim().is_empty() {
        return Ok(None);
    }

    let mut bounds: Option<(i64, i64)> = None;
    for part in frame_range.split(',') {
        let pieces: Vec<&str> = part.trim().split('-').collect();
        let (part_start, part_end) = match pieces.as_slice() {
            [single] => {
                let frame = parse_frame(single)?;
                (frame, frame)
            }
            [start, end] => (parse_frame(start)?, parse_frame(end)?),
            _ => continue,
        };
        bounds = Some(match bounds {
            None => (part_start, part_end),
            Some((min, max)) => (min.min(part_start), max.max(part_end)),
        });
    }
    Ok(bounds)
}

/// Iterator over fixed-size frame chunks of a parsed range.
///
/// Every chunk except possibly the last is exactly `chunk_size` frames.
/// Re-invoking [`iter_frame_range`] with the same arguments yields the
/// identical sequence.
pub struct FrameChunks {
    frames: Vec<i64>,
    chunk_size: usize,
    pos: usize,
}

impl Iterator for FrameChunks {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.frames.len() {
            return None;
        }
        let end = (self.pos + self.chunk_size).min(self.frames.len());
        let chunk = self.frames[self.pos..end].to_vec();
        self.pos = end;
        Some(chunk)
    }
}

/// Parse a frame-range string and slice it into chunks of `chunk_size`.
pub fn iter_frame_range(frame_range: &str, chunk_size: usize) -> Result<FrameChunks> {
    if chunk_size == 0 {
        return Err(Error::validation("chunk_size must be at least 1"));
    }
    Ok(FrameChunks {
        frames: frame_range_parse(frame_range)?,
        chunk_size,
        pos: 0,
    })
}

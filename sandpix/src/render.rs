//! Size-constrained rendering.
//!
//! Quality-adjustable formats are encoded at a starting quality and stepped down until
//! the output fits; lossless formats get a single attempt.

use crate::error::{Error, Result};
use crate::protocol::OutputFormat;

pub const DEFAULT_QUALITY: u8 = 95;
/// Quality at or below which the search gives up.
pub const QUALITY_FLOOR: u8 = 45;
pub const QUALITY_STEP: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub output: Vec<u8>,
    /// Quality of the accepted attempt, `None` for formats without a quality knob.
    pub quality: Option<u8>,
}

/// Current position of the quality search. Quality only ever goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualitySearch {
    quality: u8,
}

impl QualitySearch {
    /// Starts at the requested quality clamped to 1..=100, or [`DEFAULT_QUALITY`].
    pub fn new(requested: Option<u8>) -> Self {
        let quality = requested
            .filter(|&q| q > 0)
            .unwrap_or(DEFAULT_QUALITY)
            .clamp(1, 100);
        Self { quality }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Lowers the quality by one step. Returns `None` once the next step would land on or
    /// below the floor.
    pub fn step_down(&mut self) -> Option<u8> {
        let next = self.quality.saturating_sub(QUALITY_STEP);
        if next <= QUALITY_FLOOR {
            return None;
        }
        self.quality = next;
        Some(next)
    }
}

/// Encodes with `encode` until the output satisfies `max_file_size`.
///
/// `encode` receives the quality to use, or `None` for lossless formats. A
/// `max_file_size` of `None` or `Some(0)` means no limit. Rejected attempts are dropped
/// before the next one starts; no oversized output is ever returned.
pub fn render<F>(
    format: OutputFormat,
    max_file_size: Option<u64>,
    quality: Option<u8>,
    mut encode: F,
) -> Result<Rendered>
where
    F: FnMut(Option<u8>) -> Result<Vec<u8>>,
{
    let limit = max_file_size.filter(|&max| max > 0);

    if !format.is_quality_adjustable() {
        let output = encode(None)?;
        if let Some(max) = limit {
            if output.len() as u64 > max {
                log::debug!("{format} output of {} bytes exceeds {max}", output.len());
                return Err(Error::SizeConstraintUnsatisfiable { max_file_size: max });
            }
        }
        return Ok(Rendered {
            output,
            quality: None,
        });
    }

    let mut search = QualitySearch::new(quality);
    loop {
        let quality = search.quality();
        let output = encode(Some(quality))?;

        let Some(max) = limit else {
            return Ok(Rendered {
                output,
                quality: Some(quality),
            });
        };

        if (output.len() as u64) < max {
            log::debug!("{format} at quality {quality}: {} bytes fits {max}", output.len());
            return Ok(Rendered {
                output,
                quality: Some(quality),
            });
        }

        log::debug!("{format} at quality {quality}: {} bytes exceeds {max}", output.len());
        drop(output);

        if search.step_down().is_none() {
            return Err(Error::SizeConstraintUnsatisfiable { max_file_size: max });
        }
    }
}

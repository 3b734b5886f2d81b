//! Tile extraction and seam-free reassembly of upscaled tiles.
//!
//! Blending works on output-space segments: every axis is cut at each tile
//! start and end, so each segment is covered by a fixed set of tiles. Segments
//! covered by one tile on both axes are copied row by row; the rest are
//! weighted averages accumulated in row-major tile order.

use crate::error::UpscaleError;
use crate::image::{Dimensions, Image};
use crate::planner::{AxisSpan, TilePlan, TileSpec};

/// Upscaled pixels for one [`TileSpec`].
#[derive(Debug, Clone)]
pub struct TileResult {
    pub index: usize,
    pub image: Image,
    pub scale_factor: u32,
}

/// Copies the tile rectangle out of `image`.
pub fn extract(image: &Image, spec: &TileSpec) -> Image {
    let mut tile = Image::blank(spec.width, spec.height, image.format());
    for row in 0..spec.height {
        tile.row_span_mut(0, row, spec.width)
            .copy_from_slice(image.row_span(spec.x, spec.y + row, spec.width));
    }
    tile
}

/// Reassembles upscaled tiles into one image of `output` dimensions.
pub fn blend(
    results: Vec<TileResult>,
    plan: &TilePlan,
    output: Dimensions,
    scale_factor: u32,
) -> Result<Image, UpscaleError> {
    if scale_factor == 0 {
        return Err(UpscaleError::Composition(
            "scale factor must be positive".to_string(),
        ));
    }
    let expected = plan.source.scaled(scale_factor).ok_or_else(|| {
        UpscaleError::Composition(format!(
            "source {}x{} at x{scale_factor} overflows the output size",
            plan.source.width, plan.source.height
        ))
    })?;
    if output != expected {
        return Err(UpscaleError::Composition(format!(
            "output {}x{} does not match source {}x{} at x{scale_factor}",
            output.width, output.height, plan.source.width, plan.source.height
        )));
    }

    let tiles = index_results(results, plan, scale_factor)?;
    let format = tiles[0].image.format();
    let channels = format.channels();

    let columns = scale_spans(&plan.columns, scale_factor);
    let rows = scale_spans(&plan.rows, scale_factor);
    let column_weights = axis_weights(&columns);
    let row_weights = axis_weights(&rows);

    let mut out = Image::blank(output.width, output.height, format);
    let mut acc = Vec::new();

    for (y0, y1, covering_rows) in segments(&rows) {
        for (x0, x1, covering_columns) in segments(&columns) {
            let width = x1 - x0;
            if covering_rows.len() == 1 && covering_columns.len() == 1 {
                let (r, c) = (covering_rows[0], covering_columns[0]);
                let tile = &tiles[r * columns.len() + c].image;
                for y in y0..y1 {
                    out.row_span_mut(x0, y, width).copy_from_slice(tile.row_span(
                        x0 - columns[c].start,
                        y - rows[r].start,
                        width,
                    ));
                }
                continue;
            }

            for y in y0..y1 {
                acc.clear();
                acc.resize(width as usize * channels + width as usize, 0.0f64);
                let (sums, weights) = acc.split_at_mut(width as usize * channels);
                for &r in &covering_rows {
                    let wy = row_weights[r][(y - rows[r].start) as usize];
                    for &c in &covering_columns {
                        let tile = &tiles[r * columns.len() + c].image;
                        let local_x = x0 - columns[c].start;
                        let src = tile.row_span(local_x, y - rows[r].start, width);
                        let wx = &column_weights[c][local_x as usize..(local_x + width) as usize];
                        for (px, w_col) in wx.iter().enumerate() {
                            let w = wy * w_col;
                            weights[px] += w;
                            for ch in 0..channels {
                                sums[px * channels + ch] += w * f64::from(src[px * channels + ch]);
                            }
                        }
                    }
                }
                let dst = out.row_span_mut(x0, y, width);
                for px in 0..width as usize {
                    for ch in 0..channels {
                        let value = sums[px * channels + ch] / weights[px];
                        dst[px * channels + ch] = value.round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Orders results by plan index and checks each against its tile spec.
fn index_results(
    results: Vec<TileResult>,
    plan: &TilePlan,
    scale_factor: u32,
) -> Result<Vec<TileResult>, UpscaleError> {
    let mut slots: Vec<Option<TileResult>> = vec![None; plan.len()];
    for result in results {
        let Some(spec) = plan.tiles.get(result.index) else {
            return Err(UpscaleError::Composition(format!(
                "tile index {} is outside the plan ({} tiles)",
                result.index,
                plan.len()
            )));
        };
        if result.scale_factor != scale_factor {
            return Err(UpscaleError::Composition(format!(
                "tile {} was upscaled x{}, expected x{scale_factor}",
                result.index, result.scale_factor
            )));
        }
        let expected = Dimensions::new(spec.width, spec.height)
            .scaled(scale_factor)
            .ok_or_else(|| {
                UpscaleError::Composition(format!(
                    "tile {} at x{scale_factor} overflows the output size",
                    result.index
                ))
            })?;
        if result.image.dimensions() != expected {
            return Err(UpscaleError::Composition(format!(
                "tile {} is {}x{}, expected {}x{}",
                result.index,
                result.image.width(),
                result.image.height(),
                expected.width,
                expected.height
            )));
        }
        let slot = &mut slots[result.index];
        if slot.is_some() {
            return Err(UpscaleError::Composition(format!(
                "tile {} was produced twice",
                result.index
            )));
        }
        *slot = Some(result);
    }

    let missing: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_none())
        .map(|(index, _)| index)
        .collect();
    if !missing.is_empty() {
        return Err(UpscaleError::IncompleteTileSet { missing });
    }

    let tiles: Vec<TileResult> = slots.into_iter().flatten().collect();
    let format = tiles[0].image.format();
    if let Some(odd) = tiles.iter().find(|t| t.image.format() != format) {
        return Err(UpscaleError::Composition(format!(
            "tile {} is {:?}, expected {format:?}",
            odd.index,
            odd.image.format()
        )));
    }
    Ok(tiles)
}

fn scale_spans(spans: &[AxisSpan], factor: u32) -> Vec<AxisSpan> {
    spans
        .iter()
        .map(|s| AxisSpan {
            start: s.start * factor,
            len: s.len * factor,
        })
        .collect()
}

/// Per-span blend weights along one axis.
///
/// Inside an overlap the weight ramps linearly from the neighbour's side,
/// sampled at pixel centres so two overlapping ramps sum to exactly 1.
fn axis_weights(spans: &[AxisSpan]) -> Vec<Vec<f64>> {
    spans
        .iter()
        .enumerate()
        .map(|(i, span)| {
            let prev_end = i.checked_sub(1).map(|p| spans[p].end());
            let next_start = spans.get(i + 1).map(|n| n.start);
            (span.start..span.end())
                .map(|p| {
                    let mut w = 1.0f64;
                    if let Some(prev_end) = prev_end.filter(|&e| p < e) {
                        let overlap = f64::from(prev_end - span.start);
                        w = w.min((f64::from(p - span.start) + 0.5) / overlap);
                    }
                    if let Some(next_start) = next_start.filter(|&s| p >= s) {
                        let overlap = f64::from(span.end() - next_start);
                        w = w.min((f64::from(span.end() - p) - 0.5) / overlap);
                    }
                    w
                })
                .collect()
        })
        .collect()
}

/// Splits the axis at every span boundary; yields `(start, end, covering spans)`.
fn segments(spans: &[AxisSpan]) -> Vec<(u32, u32, Vec<usize>)> {
    let mut cuts: Vec<u32> = spans.iter().flat_map(|s| [s.start, s.end()]).collect();
    cuts.sort_unstable();
    cuts.dedup();
    cuts.windows(2)
        .map(|w| {
            let covering = spans
                .iter()
                .enumerate()
                .filter(|(_, s)| s.start <= w[0] && s.end() >= w[1])
                .map(|(i, _)| i)
                .collect();
            (w[0], w[1], covering)
        })
        .collect()
}

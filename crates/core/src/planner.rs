//! Tile planning: decides whether an image is processed whole or as a grid of
//! overlapping tiles, and where those tiles sit.

use serde::Serialize;

use crate::error::UpscaleError;
use crate::image::Dimensions;

/// One tile rectangle in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileSpec {
    /// Position in row-major plan order.
    pub index: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Half-open interval `[start, start + len)` along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisSpan {
    pub start: u32,
    pub len: u32,
}

impl AxisSpan {
    pub fn end(&self) -> u32 {
        self.start + self.len
    }
}

/// Row-major tile grid covering a source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilePlan {
    pub source: Dimensions,
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub columns: Vec<AxisSpan>,
    pub rows: Vec<AxisSpan>,
    pub tiles: Vec<TileSpec>,
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_single_tile(&self) -> bool {
        self.tiles.len() == 1
    }

    /// `(row, column)` of a tile index.
    pub fn grid_position(&self, index: usize) -> (usize, usize) {
        (index / self.columns.len(), index % self.columns.len())
    }
}

/// Validates the tiling parameters without planning anything.
pub fn validate(max_image_size: u32, tile_size: u32, tile_overlap: u32) -> Result<(), UpscaleError> {
    if max_image_size == 0 {
        return Err(UpscaleError::Configuration(
            "max_image_size must be positive".to_string(),
        ));
    }
    if tile_size == 0 {
        return Err(UpscaleError::Configuration(
            "tile_size must be positive".to_string(),
        ));
    }
    if tile_overlap >= tile_size {
        return Err(UpscaleError::Configuration(format!(
            "tile_overlap ({tile_overlap}) must be smaller than tile_size ({tile_size})"
        )));
    }
    Ok(())
}

/// Plans the tile grid for an image of `dims`.
///
/// Images no larger than `max_image_size` on both axes get a single tile.
/// Larger images are split with origins `tile_size - tile_overlap` apart; the
/// last tile on each axis ends exactly at the image edge and may be narrower.
pub fn plan(
    dims: Dimensions,
    max_image_size: u32,
    tile_size: u32,
    tile_overlap: u32,
) -> Result<TilePlan, UpscaleError> {
    validate(max_image_size, tile_size, tile_overlap)?;
    if dims.is_empty() {
        return Err(UpscaleError::InvalidInput(format!(
            "image has no pixels ({}x{})",
            dims.width, dims.height
        )));
    }

    let (columns, rows) = if dims.width <= max_image_size && dims.height <= max_image_size {
        (
            vec![AxisSpan {
                start: 0,
                len: dims.width,
            }],
            vec![AxisSpan {
                start: 0,
                len: dims.height,
            }],
        )
    } else {
        (
            axis_spans(dims.width, tile_size, tile_overlap),
            axis_spans(dims.height, tile_size, tile_overlap),
        )
    };

    let mut tiles = Vec::with_capacity(columns.len() * rows.len());
    for row in &rows {
        for column in &columns {
            tiles.push(TileSpec {
                index: tiles.len(),
                x: column.start,
                y: row.start,
                width: column.len,
                height: row.len,
            });
        }
    }

    Ok(TilePlan {
        source: dims,
        tile_size,
        tile_overlap,
        columns,
        rows,
        tiles,
    })
}

fn axis_spans(len: u32, tile_size: u32, overlap: u32) -> Vec<AxisSpan> {
    let step = tile_size - overlap;
    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let span_len = tile_size.min(len - start);
        spans.push(AxisSpan {
            start,
            len: span_len,
        });
        if start + tile_size >= len {
            break;
        }
        start += step;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered(plan: &TilePlan) -> Vec<u32> {
        let mut counts = vec![0u32; (plan.source.width * plan.source.height) as usize];
        for tile in &plan.tiles {
            for y in tile.y..tile.y + tile.height {
                for x in tile.x..tile.x + tile.width {
                    counts[(y * plan.source.width + x) as usize] += 1;
                }
            }
        }
        counts
    }

    #[test]
    fn small_image_is_single_tile() {
        let plan = plan(Dimensions::new(800, 600), 1024, 512, 32).unwrap();
        assert!(plan.is_single_tile());
        assert_eq!(
            plan.tiles[0],
            TileSpec {
                index: 0,
                x: 0,
                y: 0,
                width: 800,
                height: 600,
            }
        );
    }

    #[test]
    fn image_at_max_size_is_not_split() {
        let plan = plan(Dimensions::new(1024, 1024), 1024, 256, 16).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn large_image_grid_is_row_major() {
        let plan = plan(Dimensions::new(2048, 2048), 1024, 512, 32).unwrap();
        let starts: Vec<u32> = plan.columns.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 480, 960, 1440, 1920]);
        assert_eq!(plan.columns.last().unwrap().end(), 2048);
        assert_eq!(plan.columns.last().unwrap().len, 128);
        assert_eq!(plan.len(), 25);
        for (i, tile) in plan.tiles.iter().enumerate() {
            assert_eq!(tile.index, i);
            let (row, column) = plan.grid_position(i);
            assert_eq!(tile.x, plan.columns[column].start);
            assert_eq!(tile.y, plan.rows[row].start);
        }
        assert_eq!((plan.tiles[1].x, plan.tiles[1].y), (480, 0));
        assert_eq!((plan.tiles[5].x, plan.tiles[5].y), (0, 480));
    }

    #[test]
    fn tiles_cover_every_pixel_without_gaps() {
        for (w, h) in [(1300, 700), (1025, 1025), (3000, 40), (517, 2049)] {
            let plan = plan(Dimensions::new(w, h), 1024, 256, 24).unwrap();
            assert!(covered(&plan).iter().all(|&c| c >= 1), "{w}x{h}");
            for tile in &plan.tiles {
                assert!(tile.width <= 256 && tile.height <= 256);
                assert!(tile.x + tile.width <= w && tile.y + tile.height <= h);
            }
        }
    }

    #[test]
    fn adjacent_tiles_overlap_by_configured_amount() {
        let plan = plan(Dimensions::new(1500, 1100), 1024, 400, 40).unwrap();
        for pair in plan.columns.windows(2) {
            assert_eq!(pair[0].end() - pair[1].start, 40);
        }
        for pair in plan.rows.windows(2) {
            assert_eq!(pair[0].end() - pair[1].start, 40);
        }
    }

    #[test]
    fn oversized_axis_shorter_than_tile_gets_one_span() {
        let plan = plan(Dimensions::new(3000, 200), 1024, 512, 32).unwrap();
        assert_eq!(plan.rows.len(), 1);
        assert_eq!(plan.rows[0], AxisSpan { start: 0, len: 200 });
    }

    #[test]
    fn overlap_not_smaller_than_tile_is_rejected() {
        let err = plan(Dimensions::new(2000, 2000), 1024, 64, 64).unwrap_err();
        assert!(matches!(err, UpscaleError::Configuration(_)));
        assert!(matches!(
            plan(Dimensions::new(2000, 2000), 1024, 0, 0),
            Err(UpscaleError::Configuration(_))
        ));
    }

    #[test]
    fn empty_image_is_invalid_input() {
        let err = plan(Dimensions::new(0, 10), 1024, 512, 32).unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidInput(_)));
    }

    #[test]
    fn planning_is_reproducible() {
        let a = plan(Dimensions::new(1777, 1333), 1000, 300, 30).unwrap();
        let b = plan(Dimensions::new(1777, 1333), 1000, 300, 30).unwrap();
        assert_eq!(a, b);
    }
}

//! Tile and neighborhood descriptors handed across the device protocol.

use std::collections::VecDeque;

use crate::device::DeviceBuffer;

/// Slot count of a neighborhood descriptor: the 3×3 grid plus the output
/// tile.
pub const NEIGHBORHOOD_SLOTS: usize = 10;
/// The center tile's slot within the 3×3 grid.
pub const CENTER_SLOT: usize = 4;
/// The output tile slot.
pub const OUTPUT_SLOT: usize = 9;

/// An axis-aligned sub-rectangle of the image, processed as one unit.
///
/// Pixel `(x, y)` of the underlying buffer lives at linear index
/// `offset + y * stride + x`; the output tile rebases `offset` so the
/// center rectangle starts at index 0 of its own buffer.
#[derive(Clone, Debug, Default)]
pub struct RenderTile {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
    pub start_sample: u32,
    pub num_samples: u32,
    pub offset: isize,
    pub stride: usize,
    pub tile_index: usize,
    pub buffer: Option<DeviceBuffer>,
}

impl RenderTile {
    /// Clipping against the image bounds can leave a neighbor empty.
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

/// The 3×3 surrounding-tile descriptor plus the output tile.
#[derive(Clone, Debug)]
pub struct TileNeighborhood {
    pub tiles: [RenderTile; NEIGHBORHOOD_SLOTS],
}

impl TileNeighborhood {
    pub fn new(center: RenderTile) -> Self {
        let mut tiles: [RenderTile; NEIGHBORHOOD_SLOTS] =
            std::array::from_fn(|_| RenderTile::default());
        tiles[CENTER_SLOT] = center;
        Self { tiles }
    }

    pub fn center(&self) -> &RenderTile {
        &self.tiles[CENTER_SLOT]
    }

    pub fn output(&self) -> &RenderTile {
        &self.tiles[OUTPUT_SLOT]
    }
}

/// Partition the image into a raster-ordered grid of clipped tiles, all
/// sharing the frame-wide input buffer.
pub(crate) fn build_tile_grid(
    width: usize,
    height: usize,
    tile_w: usize,
    tile_h: usize,
    num_samples: u32,
    buffer: &DeviceBuffer,
) -> VecDeque<RenderTile> {
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut tiles = VecDeque::with_capacity(tiles_x * tiles_y);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x = tx * tile_w;
            let y = ty * tile_h;
            tiles.push_back(RenderTile {
                x,
                y,
                w: (width - x).min(tile_w),
                h: (height - y).min(tile_h),
                start_sample: 0,
                num_samples,
                offset: 0,
                stride: width,
                tile_index: ty * tiles_x + tx,
                buffer: Some(buffer.clone()),
            });
        }
    }
    tiles
}

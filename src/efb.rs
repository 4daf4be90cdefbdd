//! Embedded-framebuffer peek cache.
//!
//! A fixed grid of last-observed color/depth values, downsampled from
//! native EFB resolution by a configured divisor, each entry stamped with
//! the frame index it was captured at. Peeks from the owner thread are
//! answered from the cache when the entry is still fresh; a miss costs a
//! synchronous readback from the render thread. Pokes write through with
//! the current frame stamp. Stale entries are only ever overwritten on
//! the next access to their cell; the whole grid is invalidated on
//! resolution or backend change.

pub const EFB_WIDTH: u32 = 640;
pub const EFB_HEIGHT: u32 = 528;

/// Frame stamp meaning "never captured".
const FRAME_NEVER: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
pub struct PeekCacheConfig {
    /// Downsample divisor relative to native EFB resolution. Larger
    /// divisors trade staleness granularity for memory.
    pub divisor: u32,
    /// Lifetime in frames. An entry older than this is treated as a miss
    /// even if never touched since. Zero means same-frame hits only.
    pub life: u32,
}

impl Default for PeekCacheConfig {
    fn default() -> Self {
        Self {
            divisor: 1,
            life: 1,
        }
    }
}

#[derive(Clone, Copy)]
struct PeekCacheCell {
    color: u32,
    depth: u32,
    color_frame: u32,
    depth_frame: u32,
}

impl Default for PeekCacheCell {
    fn default() -> Self {
        Self {
            color: 0,
            depth: 0,
            color_frame: FRAME_NEVER,
            depth_frame: FRAME_NEVER,
        }
    }
}

pub struct EfbPeekCache {
    width: u32,
    height: u32,
    divisor: u32,
    life: u32,
    cells: Vec<PeekCacheCell>,
}

impl EfbPeekCache {
    pub fn new(config: PeekCacheConfig) -> Self {
        let divisor = config.divisor.max(1);
        let width = EFB_WIDTH.div_ceil(divisor);
        let height = EFB_HEIGHT.div_ceil(divisor);
        Self {
            width,
            height,
            divisor,
            life: config.life,
            cells: vec![PeekCacheCell::default(); (width * height) as usize],
        }
    }

    /// Resize the grid and drop every entry.
    pub fn configure(&mut self, config: PeekCacheConfig) {
        *self = Self::new(config);
        log::debug!(
            "EFB peek cache: {}x{} cells, divisor {}, life {} frames",
            self.width,
            self.height,
            self.divisor,
            self.life
        );
    }

    fn index(&self, x: u32, y: u32) -> usize {
        let cx = (x / self.divisor).min(self.width - 1);
        let cy = (y / self.divisor).min(self.height - 1);
        (cy * self.width + cx) as usize
    }

    fn fresh(&self, stamp: u32, frame: u32) -> bool {
        stamp != FRAME_NEVER && frame >= stamp && frame - stamp <= self.life
    }

    pub fn peek_color(&self, x: u32, y: u32, frame: u32) -> Option<u32> {
        let cell = &self.cells[self.index(x, y)];
        self.fresh(cell.color_frame, frame).then_some(cell.color)
    }

    pub fn peek_depth(&self, x: u32, y: u32, frame: u32) -> Option<u32> {
        let cell = &self.cells[self.index(x, y)];
        self.fresh(cell.depth_frame, frame).then_some(cell.depth)
    }

    /// Fill from a completed readback.
    pub fn store_color(&mut self, x: u32, y: u32, value: u32, frame: u32) {
        let idx = self.index(x, y);
        let cell = &mut self.cells[idx];
        cell.color = value;
        cell.color_frame = frame;
    }

    pub fn store_depth(&mut self, x: u32, y: u32, value: u32, frame: u32) {
        let idx = self.index(x, y);
        let cell = &mut self.cells[idx];
        cell.depth = value;
        cell.depth_frame = frame;
    }

    /// Write-through on a poke: same stamp as the framebuffer write.
    pub fn poke_color(&mut self, x: u32, y: u32, value: u32, frame: u32) {
        self.store_color(x, y, value, frame);
    }

    pub fn poke_depth(&mut self, x: u32, y: u32, value: u32, frame: u32) {
        self.store_depth(x, y, value, frame);
    }

    /// Drop every entry. Called on resolution change, backend switch and
    /// state restore.
    pub fn invalidate(&mut self) {
        for cell in &mut self.cells {
            *cell = PeekCacheCell::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_shrinks_grid_and_shares_cells() {
        let mut cache = EfbPeekCache::new(PeekCacheConfig {
            divisor: 4,
            life: 1,
        });
        cache.store_color(0, 0, 0xAABBCCDD, 5);
        // Same 4x4 cell.
        assert_eq!(cache.peek_color(3, 3, 5), Some(0xAABBCCDD));
        // Next cell over.
        assert_eq!(cache.peek_color(4, 0, 5), None);
    }

    #[test]
    fn never_captured_is_a_miss() {
        let cache = EfbPeekCache::new(PeekCacheConfig::default());
        assert_eq!(cache.peek_color(10, 10, 0), None);
        assert_eq!(cache.peek_depth(10, 10, 0), None);
    }

    #[test]
    fn color_and_depth_stamps_are_independent() {
        let mut cache = EfbPeekCache::new(PeekCacheConfig {
            divisor: 1,
            life: 0,
        });
        cache.store_color(1, 1, 7, 10);
        cache.store_depth(1, 1, 9, 12);
        assert_eq!(cache.peek_color(1, 1, 10), Some(7));
        assert_eq!(cache.peek_color(1, 1, 12), None);
        assert_eq!(cache.peek_depth(1, 1, 12), Some(9));
    }
}

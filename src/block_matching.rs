//! Sliding-window SAD block matcher.
//!
//! The matcher keeps running SAD sums over a square window for every
//! candidate disparity and updates them incrementally in both directions
//! instead of recomputing windows: a per-(row, disparity) table of horizontal
//! abs-diff sums is refreshed by a ring buffer as the window center advances
//! one column, and a per-disparity vertical sum slides down the rows of each
//! column. Per pixel the minimum-cost disparity is selected, gated on local
//! texture and match uniqueness, and refined by parabolic sub-pixel
//! interpolation. Out-of-window borders use edge replication throughout,
//! consistent with the pre-filter.

use crate::buffers::ScratchBuffers;
use crate::{prefilter, simd, DisparityMap, Result, StereoBmError, DISPARITY_SHIFT};
use image::GrayImage;

/// SAD block-matching stereo matcher.
///
/// Bundles the matching parameters with reusable internal buffers: the
/// pre-filtered image copies and sliding-window scratch grow on demand,
/// never shrink, and persist across calls, so a long-lived matcher amortizes
/// allocation. One instance serves one call at a time (`&mut self`); use
/// independent instances for concurrent matching.
#[derive(Debug)]
pub struct BlockMatcher {
    /// Window for the pre-filter's local mean estimate, odd, 5..=255.
    pub pre_filter_size: i32,
    /// Clamp magnitude of the pre-filter residual, 1..=63.
    pub pre_filter_cap: i32,
    /// SAD window side, odd, 5..=255 and smaller than both image dimensions.
    pub block_size: i32,
    /// Smallest disparity searched, may be negative.
    pub min_disparity: i32,
    /// Number of candidate disparities, positive multiple of 16.
    pub num_disparities: i32,
    /// Minimum windowed texture energy to trust a match, non-negative.
    pub texture_threshold: i32,
    /// Margin (percent) by which the best cost must beat all non-adjacent
    /// candidates, non-negative; 0 disables the gate.
    pub uniqueness_ratio: i32,
    /// Accepted for speckle post-filtering configuration; not applied by the
    /// matching pass.
    pub speckle_window_size: i32,
    pub speckle_range: i32,
    scratch: ScratchBuffers,
}

impl Default for BlockMatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BlockMatcher {
    /// Create a matcher with the standard defaults. A non-positive
    /// `num_disparities` falls back to 64.
    pub fn new(num_disparities: i32) -> Self {
        Self {
            pre_filter_size: 9,
            pre_filter_cap: 31,
            block_size: 15,
            min_disparity: 0,
            num_disparities: if num_disparities > 0 {
                num_disparities
            } else {
                64
            },
            texture_threshold: 10,
            uniqueness_ratio: 15,
            speckle_window_size: 0,
            speckle_range: 0,
            scratch: ScratchBuffers::default(),
        }
    }

    pub fn with_block_size(mut self, size: i32) -> Self {
        self.block_size = size;
        self
    }

    pub fn with_pre_filter(mut self, size: i32, cap: i32) -> Self {
        self.pre_filter_size = size;
        self.pre_filter_cap = cap;
        self
    }

    pub fn with_disparity_range(mut self, min_disparity: i32, num_disparities: i32) -> Self {
        self.min_disparity = min_disparity;
        self.num_disparities = num_disparities;
        self
    }

    pub fn with_texture_threshold(mut self, threshold: i32) -> Self {
        self.texture_threshold = threshold;
        self
    }

    pub fn with_uniqueness_ratio(mut self, ratio: i32) -> Self {
        self.uniqueness_ratio = ratio;
        self
    }

    pub fn with_speckle(mut self, window_size: i32, range: i32) -> Self {
        self.speckle_window_size = window_size;
        self.speckle_range = range;
        self
    }

    /// Compute a disparity map for a rectified pair.
    pub fn compute(&mut self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap> {
        let mut disp = DisparityMap::new(
            left.width(),
            left.height(),
            self.min_disparity,
            self.num_disparities,
        );
        self.compute_into(left, right, &mut disp)?;
        Ok(disp)
    }

    /// Compute into a caller-allocated map of matching size.
    ///
    /// The map is fully overwritten; its disparity range is updated to this
    /// matcher's so the sentinel stays consistent.
    pub fn compute_into(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        disp: &mut DisparityMap,
    ) -> Result<()> {
        if left.width() != right.width() || left.height() != right.height() {
            return Err(StereoBmError::DimensionMismatch(format!(
                "left image is {}x{}, right image is {}x{}",
                left.width(),
                left.height(),
                right.width(),
                right.height()
            )));
        }
        if disp.width != left.width() || disp.height != left.height() {
            return Err(StereoBmError::DimensionMismatch(format!(
                "disparity map is {}x{}, images are {}x{}",
                disp.width,
                disp.height,
                left.width(),
                left.height()
            )));
        }

        let width = left.width() as usize;
        let height = left.height() as usize;
        self.validate(width, height)?;

        disp.min_disparity = self.min_disparity;
        disp.num_disparities = self.num_disparities;

        let ndisp = self.num_disparities as usize;
        let wsz = self.block_size as usize;
        let pfs = self.pre_filter_size as usize;
        let cap = self.pre_filter_cap;

        let mindisp = self.min_disparity;
        let filtered = ((mindisp - 1) << DISPARITY_SHIFT) as i16;
        let lofs = (ndisp as i32 - 1 + mindisp).max(0) as usize;
        let rofs = (-(ndisp as i32 - 1 + mindisp)).max(0) as usize;
        // Every valid column must keep its own window center and all of its
        // candidate windows inside both images.
        let width1 =
            (width as i64 - lofs as i64).min(width as i64 - rofs as i64 - ndisp as i64 + 1);
        if lofs >= width || rofs >= width || width1 < 1 {
            // No column can host every candidate disparity; a fully rejected
            // map is a successful result.
            disp.data.fill(filtered);
            return Ok(());
        }
        let width1 = width1 as usize;

        // The two inputs are filtered independently, so run them in parallel.
        self.scratch.reserve_prefilter(width, height, pfs);
        {
            let ScratchBuffers {
                filtered_left,
                filtered_right,
                vsum_left,
                vsum_right,
                ..
            } = &mut self.scratch;
            let fl = &mut filtered_left[..width * height];
            let fr = &mut filtered_right[..width * height];
            rayon::join(
                move || prefilter::prefilter_into(left.as_raw(), width, height, fl, pfs, cap, vsum_left),
                move || {
                    prefilter::prefilter_into(right.as_raw(), width, height, fr, pfs, cap, vsum_right)
                },
            );
        }

        self.scratch.reserve_matching(height, ndisp, wsz);

        let params = MatchParams {
            ndisp,
            wsz,
            width1,
            lofs,
            rofs,
            mindisp,
            texture_threshold: self.texture_threshold,
            uniqueness_ratio: self.uniqueness_ratio,
            pre_filter_cap: cap,
            filtered,
        };
        let ScratchBuffers {
            filtered_left,
            filtered_right,
            sad,
            hsad,
            htext,
            cbuf,
            rgather,
            ..
        } = &mut self.scratch;
        match_prefiltered(
            &params,
            &filtered_left[..width * height],
            &filtered_right[..width * height],
            width,
            height,
            &mut disp.data,
            sad,
            hsad,
            htext,
            cbuf,
            rgather,
        );
        Ok(())
    }

    /// Fail fast on any out-of-domain parameter before buffers are touched.
    fn validate(&self, width: usize, height: usize) -> Result<()> {
        if self.pre_filter_size < 5 || self.pre_filter_size > 255 || self.pre_filter_size % 2 == 0 {
            return Err(StereoBmError::InvalidParameter(format!(
                "pre_filter_size must be odd and within 5..=255, got {}",
                self.pre_filter_size
            )));
        }
        if !(1..=63).contains(&self.pre_filter_cap) {
            return Err(StereoBmError::InvalidParameter(format!(
                "pre_filter_cap must be within 1..=63, got {}",
                self.pre_filter_cap
            )));
        }
        if self.block_size < 5 || self.block_size > 255 || self.block_size % 2 == 0 {
            return Err(StereoBmError::InvalidParameter(format!(
                "block_size must be odd and within 5..=255, got {}",
                self.block_size
            )));
        }
        if self.block_size as usize >= width.min(height) {
            return Err(StereoBmError::InvalidParameter(format!(
                "block_size must be smaller than both image dimensions, got {} for a {}x{} image",
                self.block_size, width, height
            )));
        }
        if self.num_disparities <= 0 || self.num_disparities % 16 != 0 {
            return Err(StereoBmError::InvalidParameter(format!(
                "num_disparities must be a positive multiple of 16, got {}",
                self.num_disparities
            )));
        }
        if self.texture_threshold < 0 {
            return Err(StereoBmError::InvalidParameter(format!(
                "texture_threshold must be non-negative, got {}",
                self.texture_threshold
            )));
        }
        if self.uniqueness_ratio < 0 {
            return Err(StereoBmError::InvalidParameter(format!(
                "uniqueness_ratio must be non-negative, got {}",
                self.uniqueness_ratio
            )));
        }
        Ok(())
    }
}

struct MatchParams {
    ndisp: usize,
    wsz: usize,
    width1: usize,
    lofs: usize,
    rofs: usize,
    mindisp: i32,
    texture_threshold: i32,
    uniqueness_ratio: i32,
    pre_filter_cap: i32,
    filtered: i16,
}

/// The candidate window of `ndisp` right-image samples starting at `rcol`.
///
/// Columns past the image edge replicate the last pixel; the gather row is
/// only touched for border windows.
fn right_window<'a>(row: &'a [u8], rcol: usize, ndisp: usize, gather: &'a mut [u8]) -> &'a [u8] {
    if rcol + ndisp <= row.len() {
        &row[rcol..rcol + ndisp]
    } else {
        let last = row[row.len() - 1];
        let gather = &mut gather[..ndisp];
        for (d, g) in gather.iter_mut().enumerate() {
            let c = rcol + d;
            *g = if c < row.len() { row[c] } else { last };
        }
        gather
    }
}

/// Disjoint views of the entering and exiting abs-diff ring banks.
fn bank_pair(cbuf: &mut [u8], cstep: usize, new_bank: usize, sub_bank: usize) -> (&mut [u8], &[u8]) {
    debug_assert_ne!(new_bank, sub_bank);
    if new_bank < sub_bank {
        let (head, tail) = cbuf.split_at_mut(sub_bank * cstep);
        (&mut head[new_bank * cstep..][..cstep], &tail[..cstep])
    } else {
        let (head, tail) = cbuf.split_at_mut(new_bank * cstep);
        (&mut tail[..cstep], &head[sub_bank * cstep..][..cstep])
    }
}

#[allow(clippy::too_many_arguments)]
fn match_prefiltered(
    p: &MatchParams,
    left: &[u8],
    right: &[u8],
    width: usize,
    height: usize,
    disp: &mut [i16],
    sad: &mut [i32],
    hsad: &mut [i32],
    htext: &mut [i32],
    cbuf: &mut [u8],
    rgather: &mut [u8],
) {
    let MatchParams {
        ndisp,
        wsz,
        width1,
        lofs,
        rofs,
        ..
    } = *p;
    let wsz2 = wsz / 2;
    // Texture rows -wsz2-1 .. height+wsz2 live at htext[row + ht].
    let ht = wsz2 + 1;
    let cstep = height * ndisp;

    // Texture proxy: distance of a pre-filtered value from the neutral level.
    let mut tab = [0u8; 256];
    for (v, t) in tab.iter_mut().enumerate() {
        *t = (v as i32 - p.pre_filter_cap).unsigned_abs() as u8;
    }

    let hsad = &mut hsad[..height * ndisp];
    let htext = &mut htext[..height + wsz + 2];
    let sad = &mut sad[..ndisp + 2];
    let cbuf = &mut cbuf[..(wsz + 1) * cstep];
    hsad.fill(0);
    htext.fill(0);

    let clamp_col = |c: i32| c.clamp(0, width as i32 - 1) as usize;

    // Seed the horizontal SAD table and texture sums with the columns of the
    // first window position.
    for xi in -(wsz2 as i32) - 1..wsz2 as i32 {
        let bank = (xi + wsz2 as i32 + 1) as usize % (wsz + 1);
        let lcol = clamp_col(xi + lofs as i32);
        let rcol = clamp_col(xi + rofs as i32);
        let cbank = &mut cbuf[bank * cstep..][..cstep];
        for y in 0..height {
            let lval = left[y * width + lcol];
            let rvals = right_window(&right[y * width..][..width], rcol, ndisp, rgather);
            simd::seed_abs_diffs(
                &mut hsad[y * ndisp..][..ndisp],
                &mut cbank[y * ndisp..][..ndisp],
                rvals,
                lval,
            );
            htext[ht + y] += tab[lval as usize] as i32;
        }
    }

    // Sentinel the columns no candidate disparity can cover.
    for y in 0..height {
        let row = &mut disp[y * width..][..width];
        row[..lofs].fill(p.filtered);
        row[lofs + width1..].fill(p.filtered);
    }

    for x in 0..width1 {
        let x0 = x as i32 - wsz2 as i32 - 1;
        let x1 = x as i32 + wsz2 as i32;
        // Column x1 enters the window; column x0, written wsz+1 steps ago,
        // leaves it.
        let bank_sub = x % (wsz + 1);
        let bank = (x + wsz) % (wsz + 1);
        let lcol_sub = clamp_col(x0 + lofs as i32);
        let lcol = clamp_col(x1 + lofs as i32);
        let rcol = clamp_col(x1 + rofs as i32);
        let (cbank, cbank_sub) = bank_pair(cbuf, cstep, bank, bank_sub);

        for y in 0..height {
            let lval = left[y * width + lcol];
            let rvals = right_window(&right[y * width..][..width], rcol, ndisp, rgather);
            simd::slide_abs_diffs(
                &mut hsad[y * ndisp..][..ndisp],
                &mut cbank[y * ndisp..][..ndisp],
                &cbank_sub[y * ndisp..][..ndisp],
                rvals,
                lval,
            );
            htext[ht + y] +=
                tab[lval as usize] as i32 - tab[left[y * width + lcol_sub] as usize] as i32;
        }

        // Replicate texture sums past both image edges.
        for y in 0..=wsz2 {
            htext[ht + height + y] = htext[ht + height - 1];
            htext[ht - y - 1] = htext[ht];
        }

        // Seed the vertical SAD sums for this column, top row weighted for
        // edge replication.
        for d in 0..ndisp {
            sad[1 + d] = hsad[d] * (wsz2 as i32 + 2);
        }
        for y in 1..wsz2 {
            let hrow = &hsad[y * ndisp..][..ndisp];
            for d in 0..ndisp {
                sad[1 + d] += hrow[d];
            }
        }
        let mut tsum: i32 = htext[..wsz + 1].iter().sum();

        for y in 0..height {
            let hrow_add = &hsad[(y + wsz2).min(height - 1) * ndisp..][..ndisp];
            let hrow_sub = &hsad[y.saturating_sub(wsz2 + 1) * ndisp..][..ndisp];

            // Slide the window down one row; ties keep the first (lowest)
            // disparity index.
            let mut minsad = i32::MAX;
            let mut mind = 0usize;
            for d in 0..ndisp {
                let curr = sad[1 + d] + hrow_add[d] - hrow_sub[d];
                sad[1 + d] = curr;
                if curr < minsad {
                    minsad = curr;
                    mind = d;
                }
            }

            tsum += htext[ht + y + wsz2] - htext[y];
            let out = &mut disp[y * width + lofs + x];
            if tsum < p.texture_threshold {
                *out = p.filtered;
                continue;
            }

            if p.uniqueness_ratio > 0 {
                let thresh = minsad + minsad * p.uniqueness_ratio / 100;
                let ambiguous = (0..ndisp).any(|d| {
                    sad[1 + d] <= thresh
                        && ((d as i32) < mind as i32 - 1 || (d as i32) > mind as i32 + 1)
                });
                if ambiguous {
                    *out = p.filtered;
                    continue;
                }
            }

            // Guard slots replicate the inner neighbor so the parabola has
            // three points even at the range extremes.
            sad[0] = sad[2];
            sad[ndisp + 1] = sad[ndisp - 1];
            let prev_cost = sad[mind];
            let next_cost = sad[mind + 2];
            let denom = prev_cost + next_cost - 2 * sad[mind + 1];
            let delta = if denom != 0 {
                (next_cost - prev_cost) * 128 / denom
            } else {
                0
            };
            *out = (((ndisp as i32 - mind as i32 - 1 + p.mindisp) * 256 + delta + 15) >> 4) as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured_image(width: u32, height: u32, seed: u32) -> GrayImage {
        let mut img = GrayImage::new(width, height);
        let mut state = seed;
        for y in 0..height {
            for x in 0..width {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                img.put_pixel(x, y, Luma([(state >> 24) as u8]));
            }
        }
        img
    }

    fn assert_invalid(matcher: &mut BlockMatcher, needle: &str) {
        let img = textured_image(64, 48, 1);
        match matcher.compute(&img, &img) {
            Err(StereoBmError::InvalidParameter(msg)) => {
                assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}")
            }
            other => panic!("expected InvalidParameter for {needle}, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_out_of_domain_parameters() {
        assert_invalid(&mut BlockMatcher::new(64).with_pre_filter(8, 31), "pre_filter_size");
        assert_invalid(&mut BlockMatcher::new(64).with_pre_filter(3, 31), "pre_filter_size");
        assert_invalid(&mut BlockMatcher::new(64).with_pre_filter(9, 0), "pre_filter_cap");
        assert_invalid(&mut BlockMatcher::new(64).with_pre_filter(9, 64), "pre_filter_cap");
        assert_invalid(&mut BlockMatcher::new(64).with_block_size(4), "block_size");
        assert_invalid(&mut BlockMatcher::new(64).with_block_size(3), "block_size");
        assert_invalid(&mut BlockMatcher::new(64).with_block_size(49), "block_size");
        assert_invalid(&mut BlockMatcher::new(16).with_disparity_range(0, 15), "num_disparities");
        assert_invalid(&mut BlockMatcher::new(16).with_disparity_range(0, -16), "num_disparities");
        assert_invalid(
            &mut BlockMatcher::new(16).with_texture_threshold(-1),
            "texture_threshold",
        );
        assert_invalid(
            &mut BlockMatcher::new(16).with_uniqueness_ratio(-5),
            "uniqueness_ratio",
        );
    }

    #[test]
    fn test_rejects_mismatched_sizes() {
        let left = textured_image(64, 48, 1);
        let right = textured_image(60, 48, 2);
        let mut matcher = BlockMatcher::new(16);
        assert!(matches!(
            matcher.compute(&left, &right),
            Err(StereoBmError::DimensionMismatch(_))
        ));

        let right = textured_image(64, 48, 2);
        let mut small = DisparityMap::new(32, 24, 0, 16);
        assert!(matches!(
            matcher.compute_into(&left, &right, &mut small),
            Err(StereoBmError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_degenerate_geometry_fills_sentinel() {
        // 20 columns cannot host 32 disparities; that is a success, not an
        // error.
        let img = textured_image(20, 20, 5);
        let mut matcher = BlockMatcher::new(32).with_block_size(5);
        let disp = matcher.compute(&img, &img).unwrap();
        assert!(disp.data.iter().all(|&v| v == disp.filtered_value()));
    }

    #[test]
    fn test_identical_pair_reports_zero_disparity() {
        let img = textured_image(96, 64, 7);
        let mut matcher = BlockMatcher::new(32).with_block_size(9);
        let disp = matcher.compute(&img, &img).unwrap();

        let mut valid = 0;
        for y in 8..56u32 {
            for x in 40..88u32 {
                if let Some(d) = disp.disparity_at(x, y) {
                    assert!(
                        d.abs() <= 0.5,
                        "self-match at ({x},{y}) drifted to {d}"
                    );
                    valid += 1;
                }
            }
        }
        assert!(valid > 1000, "only {valid} confident pixels");
    }

    #[test]
    fn test_border_columns_are_sentinel() {
        let img = textured_image(80, 40, 3);
        let mut matcher = BlockMatcher::new(16).with_block_size(5);
        let disp = matcher.compute(&img, &img).unwrap();
        for y in 0..40 {
            for x in 0..15 {
                assert_eq!(disp.get(x, y), disp.filtered_value());
            }
        }
    }
}

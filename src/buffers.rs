//! Reusable scratch buffers for the matcher.
//!
//! Each working region is a named `Vec` indexed through bounds-checked
//! slices. Buffers grow on demand and are never shrunk, so a
//! matcher instance amortizes allocation across calls. Regions whose previous
//! contents would leak into a new result are re-zeroed by the matching pass
//! itself.

/// Grow-only buffer bundle owned by a `BlockMatcher`.
#[derive(Debug, Default)]
pub(crate) struct ScratchBuffers {
    /// Pre-filtered copy of the left input, `width * height` bytes used.
    pub filtered_left: Vec<u8>,
    /// Pre-filtered copy of the right input.
    pub filtered_right: Vec<u8>,
    /// Vertical box-sum scratch rows for the two pre-filter passes.
    pub vsum_left: Vec<i32>,
    pub vsum_right: Vec<i32>,
    /// Per-disparity running SAD, `ndisp + 2` slots with one guard slot on
    /// each side for sub-pixel interpolation.
    pub sad: Vec<i32>,
    /// Horizontal SAD table, `height * ndisp`, row-major by (row, disparity).
    pub hsad: Vec<i32>,
    /// Per-row texture energy, `height + wsz + 2` slots including `wsz/2 + 1`
    /// replicated guard rows on each side.
    pub htext: Vec<i32>,
    /// Ring of per-column abs-diff banks: `wsz + 1` banks of `height * ndisp`
    /// bytes each, so the column leaving the window can be subtracted.
    pub cbuf: Vec<u8>,
    /// Gather row for border-clamped right-image samples, `ndisp` bytes.
    pub rgather: Vec<u8>,
}

fn grow<T: Default + Clone>(buf: &mut Vec<T>, len: usize) {
    if buf.len() < len {
        buf.resize(len, T::default());
    }
}

impl ScratchBuffers {
    /// Size the pre-filter buffers for a `width * height` request.
    pub fn reserve_prefilter(&mut self, width: usize, height: usize, winsize: usize) {
        let vsum_len = width + winsize + 2;
        grow(&mut self.filtered_left, width * height);
        grow(&mut self.filtered_right, width * height);
        grow(&mut self.vsum_left, vsum_len);
        grow(&mut self.vsum_right, vsum_len);
    }

    /// Size the sliding-window buffers for one matching pass.
    pub fn reserve_matching(&mut self, height: usize, ndisp: usize, wsz: usize) {
        grow(&mut self.sad, ndisp + 2);
        grow(&mut self.hsad, height * ndisp);
        grow(&mut self.htext, height + wsz + 2);
        grow(&mut self.cbuf, (wsz + 1) * height * ndisp);
        grow(&mut self.rgather, ndisp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_grow_but_never_shrink() {
        let mut bufs = ScratchBuffers::default();
        bufs.reserve_matching(100, 64, 15);
        assert_eq!(bufs.hsad.len(), 100 * 64);
        let cbuf_len = bufs.cbuf.len();

        bufs.reserve_matching(10, 16, 5);
        assert_eq!(bufs.hsad.len(), 100 * 64);
        assert_eq!(bufs.cbuf.len(), cbuf_len);

        bufs.reserve_matching(200, 64, 15);
        assert_eq!(bufs.hsad.len(), 200 * 64);
    }

    #[test]
    fn test_reserve_prefilter_sizes() {
        let mut bufs = ScratchBuffers::default();
        bufs.reserve_prefilter(64, 48, 9);
        assert_eq!(bufs.filtered_left.len(), 64 * 48);
        assert_eq!(bufs.filtered_right.len(), 64 * 48);
        assert!(bufs.vsum_left.len() >= 64 + 9 + 2);
    }
}

//! Lane-parallel variants of the hot inner loops.
//!
//! All kernels here use integer lanes and are bit-exact with their scalar
//! remainder loops, so vectorized and scalar execution produce identical
//! disparity maps.

use wide::i32x8;

#[inline]
fn widen8(v: &[u8]) -> i32x8 {
    i32x8::from([
        v[0] as i32,
        v[1] as i32,
        v[2] as i32,
        v[3] as i32,
        v[4] as i32,
        v[5] as i32,
        v[6] as i32,
        v[7] as i32,
    ])
}

#[inline]
fn load8(v: &[i32]) -> i32x8 {
    i32x8::from([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]])
}

/// `vsum[x] += bottom[x] - top[x]` for every column.
pub(crate) fn add_sub_rows(vsum: &mut [i32], bottom: &[u8], top: &[u8]) {
    let n = vsum.len();
    debug_assert_eq!(bottom.len(), n);
    debug_assert_eq!(top.len(), n);

    let mut x = 0;
    while x + 8 <= n {
        let acc = load8(&vsum[x..x + 8]) + widen8(&bottom[x..x + 8]) - widen8(&top[x..x + 8]);
        vsum[x..x + 8].copy_from_slice(&acc.to_array());
        x += 8;
    }
    for x in x..n {
        vsum[x] += bottom[x] as i32 - top[x] as i32;
    }
}

/// Seed pass of the horizontal SAD table for one (row, entering column):
/// `diff = |lval - rvals[d]|; cbuf[d] = diff; hsad[d] += diff`.
pub(crate) fn seed_abs_diffs(hsad: &mut [i32], cbuf: &mut [u8], rvals: &[u8], lval: u8) {
    let n = hsad.len();
    debug_assert_eq!(cbuf.len(), n);
    debug_assert_eq!(rvals.len(), n);

    let lv = i32x8::splat(lval as i32);
    let mut d = 0;
    while d + 8 <= n {
        let diff = (lv - widen8(&rvals[d..d + 8])).abs();
        let acc = load8(&hsad[d..d + 8]) + diff;
        hsad[d..d + 8].copy_from_slice(&acc.to_array());
        for (dst, v) in cbuf[d..d + 8].iter_mut().zip(diff.to_array()) {
            *dst = v as u8;
        }
        d += 8;
    }
    for d in d..n {
        let diff = (lval as i32 - rvals[d] as i32).abs();
        cbuf[d] = diff as u8;
        hsad[d] += diff;
    }
}

/// Sliding pass: the window advances one column, so the entering column's
/// abs-diffs are added while the exiting column's (stored in `cbuf_sub` by an
/// earlier pass) are subtracted:
/// `diff = |lval - rvals[d]|; cbuf[d] = diff; hsad[d] += diff - cbuf_sub[d]`.
pub(crate) fn slide_abs_diffs(
    hsad: &mut [i32],
    cbuf: &mut [u8],
    cbuf_sub: &[u8],
    rvals: &[u8],
    lval: u8,
) {
    let n = hsad.len();
    debug_assert_eq!(cbuf.len(), n);
    debug_assert_eq!(cbuf_sub.len(), n);
    debug_assert_eq!(rvals.len(), n);

    let lv = i32x8::splat(lval as i32);
    let mut d = 0;
    while d + 8 <= n {
        let diff = (lv - widen8(&rvals[d..d + 8])).abs();
        let acc = load8(&hsad[d..d + 8]) + diff - widen8(&cbuf_sub[d..d + 8]);
        hsad[d..d + 8].copy_from_slice(&acc.to_array());
        for (dst, v) in cbuf[d..d + 8].iter_mut().zip(diff.to_array()) {
            *dst = v as u8;
        }
        d += 8;
    }
    for d in d..n {
        let diff = (lval as i32 - rvals[d] as i32).abs();
        cbuf[d] = diff as u8;
        hsad[d] += diff - cbuf_sub[d] as i32;
    }
}

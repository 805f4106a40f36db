//! Binary morphology on boolean masks

use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis};

/// Dilate `mask` with a `size` x `size` rectangular structuring element.
///
/// The anchor sits at `size / 2`, so for even sizes the element reaches one pixel
/// further towards the top/left than towards the bottom/right of the source pixel's
/// image: a set pixel at `p` spreads to `[p - (size - 1 - size / 2), p + size / 2]`.
/// Pixels outside the mask are treated as unset.
///
/// A rectangle is separable, so this runs a 1-D sliding maximum along rows and then
/// along columns.
#[must_use]
pub fn dilate_rect(mask: &Array2<bool>, size: usize) -> Array2<bool> {
    if size <= 1 || mask.is_empty() {
        return mask.clone();
    }
    let anchor = size / 2;
    let mut horizontal = Array2::from_elem(mask.raw_dim(), false);
    for (src, dst) in mask.rows().into_iter().zip(horizontal.rows_mut()) {
        dilate_line(src, dst, size, anchor);
    }
    let mut out = Array2::from_elem(mask.raw_dim(), false);
    for (src, dst) in horizontal
        .axis_iter(Axis(1))
        .zip(out.axis_iter_mut(Axis(1)))
    {
        dilate_line(src, dst, size, anchor);
    }
    out
}

/// `dst[x]` is set when any of `src[x - anchor ..= x + size - 1 - anchor]` is set
fn dilate_line(
    src: ArrayView1<'_, bool>,
    mut dst: ArrayViewMut1<'_, bool>,
    size: usize,
    anchor: usize,
) {
    let len = src.len();
    // prefix[i] = number of set pixels in src[..i]
    let mut prefix = Vec::with_capacity(len + 1);
    prefix.push(0_usize);
    let mut running = 0;
    for &pixel in src {
        running += usize::from(pixel);
        prefix.push(running);
    }
    if running == 0 {
        return;
    }
    let reach = size - 1 - anchor;
    for (x, out) in dst.iter_mut().enumerate() {
        let lo = x.saturating_sub(anchor);
        let hi = (x + reach + 1).min(len);
        *out = prefix[hi] > prefix[lo];
    }
}

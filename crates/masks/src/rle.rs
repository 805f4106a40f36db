//! COCO compressed run-length encoding
//!
//! Counts alternate between runs of `false` and `true`, starting with `false`, over the
//! mask in column-major order. The string form packs each count into 5-bit groups
//! offset by 48, with counts after the third stored as deltas against the count two
//! positions back.

use ndarray::{Array2, ArrayView2, ShapeBuilder};
use race_vision_common::{ProcessingError, Result};

/// Parse a compressed counts string into run lengths
///
/// # Errors
///
/// Returns `MalformedAnnotation` on characters outside the encoding alphabet,
/// truncated groups, deltas that overflow, or negative run lengths.
pub fn parse_counts(encoded: &str) -> Result<Vec<u64>> {
    let bytes = encoded.as_bytes();
    let mut counts: Vec<i64> = Vec::with_capacity(bytes.len());
    let mut p = 0;

    while p < bytes.len() {
        let mut x: i64 = 0;
        let mut k = 0;
        let mut more = true;
        while more {
            let byte = *bytes.get(p).ok_or_else(|| {
                ProcessingError::MalformedAnnotation(format!("truncated RLE string: {encoded}"))
            })?;
            if !(48..48 + 64).contains(&byte) {
                return Err(ProcessingError::MalformedAnnotation(format!(
                    "invalid RLE character {:?}",
                    byte as char
                )));
            }
            if k >= 12 {
                return Err(ProcessingError::MalformedAnnotation(
                    "RLE count overflows 64 bits".to_string(),
                ));
            }
            let c = i64::from(byte - 48);
            x |= (c & 0x1f) << (5 * k);
            more = c & 0x20 != 0;
            p += 1;
            k += 1;
            if !more && (c & 0x10) != 0 {
                x |= -1_i64 << (5 * k);
            }
        }
        let m = counts.len();
        if m > 2 {
            x = x.checked_add(counts[m - 2]).ok_or_else(|| {
                ProcessingError::MalformedAnnotation(format!("RLE run {m} overflows"))
            })?;
        }
        counts.push(x);
    }

    counts
        .into_iter()
        .map(|c| {
            u64::try_from(c).map_err(|_| {
                ProcessingError::MalformedAnnotation(format!("negative RLE run length {c}"))
            })
        })
        .collect()
}

/// Pack run lengths into a compressed counts string
#[must_use]
pub fn format_counts(counts: &[u64]) -> String {
    let mut out = String::with_capacity(counts.len() * 2);
    for (i, &count) in counts.iter().enumerate() {
        let mut x = count as i64;
        if i > 2 {
            x -= counts[i - 2] as i64;
        }
        let mut more = true;
        while more {
            let mut c = x & 0x1f;
            x >>= 5;
            more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            out.push(char::from((c + 48) as u8));
        }
    }
    out
}

/// Decode a compressed RLE string into a `height` x `width` mask
///
/// # Errors
///
/// Returns `MalformedAnnotation` if the string is invalid or its runs do not cover
/// exactly `height * width` pixels.
pub fn decode(encoded: &str, height: usize, width: usize) -> Result<Array2<bool>> {
    let total = height.checked_mul(width).ok_or_else(|| {
        ProcessingError::MalformedAnnotation(format!("mask size {height}x{width} overflows"))
    })?;
    let counts = parse_counts(encoded)?;
    let covered = counts
        .iter()
        .try_fold(0_u64, |sum, &count| sum.checked_add(count))
        .ok_or_else(|| ProcessingError::MalformedAnnotation("RLE runs overflow".to_string()))?;
    if covered != total as u64 {
        return Err(ProcessingError::MalformedAnnotation(format!(
            "RLE covers {covered} pixels, mask is {height}x{width}"
        )));
    }

    let mut data = Vec::with_capacity(total);
    let mut value = false;
    for count in counts {
        data.extend(std::iter::repeat(value).take(count as usize));
        value = !value;
    }

    Array2::from_shape_vec((height, width).f(), data)
        .map_err(|e| ProcessingError::MalformedAnnotation(format!("RLE shape mismatch: {e}")))
}

/// Encode a mask in column-major order
#[must_use]
pub fn encode(mask: &ArrayView2<'_, bool>) -> String {
    let mut counts = Vec::new();
    let mut current = false;
    let mut run = 0_u64;
    // Iterating the transpose in logical order walks the mask column by column
    for &pixel in mask.t().iter() {
        if pixel != current {
            counts.push(run);
            run = 0;
            current = pixel;
        }
        run += 1;
    }
    counts.push(run);
    format_counts(&counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse_plain_counts() {
        assert_eq!(parse_counts("325").unwrap(), vec![3, 2, 5]);
    }

    #[test]
    fn test_parse_delta_counts() {
        // Fourth count is stored relative to the second: 4 - 1 = 3
        assert_eq!(parse_counts("1113").unwrap(), vec![1, 1, 1, 4]);
        // Negative delta: 2 - 5 = -3 packs to 'M'
        assert_eq!(parse_counts("151M").unwrap(), vec![1, 5, 1, 2]);
    }

    #[test]
    fn test_format_matches_parse() {
        assert_eq!(format_counts(&[1, 5, 1, 2]), "151M");
        assert_eq!(format_counts(&[3, 2, 5]), "325");

        let large = vec![0, 2_073_600];
        assert_eq!(parse_counts(&format_counts(&large)).unwrap(), large);
    }

    #[test]
    fn test_decode_is_column_major() {
        let mask = decode("325", 2, 5).unwrap();
        // Linear indices 3 and 4 in column-major order
        let expected = array![
            [false, false, true, false, false],
            [false, true, false, false, false]
        ];
        assert_eq!(mask, expected);
    }

    #[test]
    fn test_encode_decode_agree() {
        let mask = array![
            [true, false, false, true],
            [true, true, false, false],
            [false, true, false, true]
        ];
        let encoded = encode(&mask.view());
        assert_eq!(decode(&encoded, 3, 4).unwrap(), mask);
    }

    #[test]
    fn test_all_true_mask_starts_with_empty_run() {
        let mask = Array2::from_elem((2, 2), true);
        let encoded = encode(&mask.view());
        assert_eq!(parse_counts(&encoded).unwrap(), vec![0, 4]);
    }

    #[test]
    fn test_decode_rejects_size_mismatch() {
        let err = decode("325", 3, 5).unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedAnnotation(_)));
    }

    #[test]
    fn test_parse_rejects_overflowing_deltas() {
        // Every run after the third adds 2^58 to the run two positions back
        let delta = &format_counts(&[0, 0, 0, 1 << 58])[3..];
        let encoded = format!("000{}", delta.repeat(80));
        let err = parse_counts(&encoded).unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedAnnotation(_)));
    }

    #[test]
    fn test_decode_rejects_overflowing_sizes() {
        assert!(decode("0", usize::MAX, 2).is_err());
        // Each run fits in i64, their total does not fit in u64
        let delta = &format_counts(&[0, 0, 0, 1 << 58])[3..];
        let runs = format!("000{}", delta.repeat(60));
        assert!(parse_counts(&runs).is_ok());
        let err = decode(&runs, 2, 2).unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedAnnotation(_)));
    }

    #[test]
    fn test_parse_rejects_bad_characters() {
        assert!(parse_counts("12 3").is_err());
        // Continuation bit set on the last character
        assert!(parse_counts("P").is_err());
    }
}

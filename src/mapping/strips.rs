//! Row partitioner: parallel-for over disjoint horizontal strips.
//!
//! Every per-pixel sweep of the estimator writes only to its own rows of the
//! destination grid, so the grid is split into strips of `strip_height` rows
//! and the strips run on the rayon pool. The implicit join of the parallel
//! iterator is the only synchronization point.

use rayon::prelude::*;

/// Run `body(y_start, y_end, strip)` for each strip of rows in
/// `[y_min, y_max)`, where `strip` is the mutable sub-slice of `buffer`
/// covering exactly those rows.
///
/// Read-only context is captured by the closure; writes must go through the
/// strip slice, which is what makes the parallelism race-free.
pub fn par_row_strips<T, F>(
    buffer: &mut [T],
    width: usize,
    y_min: usize,
    y_max: usize,
    strip_height: usize,
    body: F,
) where
    T: Send,
    F: Fn(usize, usize, &mut [T]) + Sync,
{
    debug_assert!(y_max * width <= buffer.len());
    if y_min >= y_max {
        return;
    }

    buffer[y_min * width..y_max * width]
        .par_chunks_mut(strip_height * width)
        .enumerate()
        .for_each(|(i, strip)| {
            let y_start = y_min + i * strip_height;
            let y_end = (y_start + strip_height).min(y_max);
            body(y_start, y_end, strip);
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_cover_range_exactly_once() {
        let width = 8;
        let mut buffer = vec![0u32; width * 20];
        par_row_strips(&mut buffer, width, 3, 17, 5, |y0, y1, strip| {
            assert_eq!(strip.len(), (y1 - y0) * width);
            for v in strip.iter_mut() {
                *v += 1;
            }
        });

        for y in 0..20 {
            let expected = u32::from((3..17).contains(&y));
            for x in 0..width {
                assert_eq!(buffer[x + y * width], expected, "row {y}");
            }
        }
    }

    #[test]
    fn test_strip_offsets_match_rows() {
        let width = 4;
        let mut buffer = vec![0usize; width * 12];
        par_row_strips(&mut buffer, width, 0, 12, 10, |y0, y1, strip| {
            for (i, v) in strip.iter_mut().enumerate() {
                *v = (y0 + i / width) * 100 + (y1 - y0);
            }
        });
        assert_eq!(buffer[0], 1000); // row 0, strip of 10 rows
        assert_eq!(buffer[11 * width], 1100 + 2); // row 11, final 2-row strip
    }

    #[test]
    fn test_empty_range_is_noop() {
        let mut buffer = vec![7u8; 16];
        par_row_strips(&mut buffer, 4, 2, 2, 10, |_, _, _| unreachable!());
        assert!(buffer.iter().all(|&v| v == 7));
    }
}

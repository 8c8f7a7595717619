//! Property tests for the compositor's layout math

use greenroom_core::compositor::{cover_rect, ease_out_cubic, fit_rect, grid_side, Rect};
use proptest::prelude::*;

proptest! {
    /// The grid always has enough cells, and never a whole spare row of them
    #[test]
    fn grid_side_is_minimal(n in 1usize..200) {
        let side = grid_side(n) as usize;
        prop_assert!(side * side >= n);
        prop_assert!((side - 1) * (side - 1) < n);
    }

    /// A fitted rect stays inside its destination
    #[test]
    fn fit_rect_stays_inside(
        src_w in 1u32..4000,
        src_h in 1u32..4000,
        dst_w in 1u32..2000,
        dst_h in 1u32..2000,
    ) {
        let dst = Rect::new(0, 0, dst_w, dst_h);
        let fitted = fit_rect(src_w, src_h, dst);
        prop_assert!(fitted.x >= 0);
        prop_assert!(fitted.y >= 0);
        prop_assert!(fitted.x as u32 + fitted.w <= dst_w);
        prop_assert!(fitted.y as u32 + fitted.h <= dst_h);
        // One axis is (near) fully used; the other letterboxes.
        prop_assert!(fitted.w == dst_w || fitted.h == dst_h || fitted.w + 1 >= dst_w || fitted.h + 1 >= dst_h);
    }

    /// A covering rect leaves no destination pixel uncovered
    #[test]
    fn cover_rect_covers_destination(
        src_w in 1u32..4000,
        src_h in 1u32..4000,
        dst_w in 1u32..2000,
        dst_h in 1u32..2000,
    ) {
        let dst = Rect::new(0, 0, dst_w, dst_h);
        let covered = cover_rect(src_w, src_h, dst);
        prop_assert!(covered.x <= 0);
        prop_assert!(covered.y <= 0);
        prop_assert!(covered.x + covered.w as i32 >= dst_w as i32);
        prop_assert!(covered.y + covered.h as i32 >= dst_h as i32);
    }

    /// Ease-out is monotone and bounded on the unit interval
    #[test]
    fn ease_out_cubic_is_monotone(a in 0.0f32..1.0, b in 0.0f32..1.0) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let (ea, eb) = (ease_out_cubic(lo), ease_out_cubic(hi));
        prop_assert!(ea <= eb + f32::EPSILON);
        prop_assert!((0.0..=1.0).contains(&ea));
        prop_assert!((0.0..=1.0).contains(&eb));
    }
}

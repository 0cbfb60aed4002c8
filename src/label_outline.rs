use ndarray::{Array4, Axis};
use rayon::prelude::*;

use crate::reslice::Resliced;

/// Keep only the border of every labelled region.
///
/// A labelled pixel survives when some pixel of the same frame within
/// `thickness` (Chebyshev distance) carries a different label or lies
/// outside the volume; every other pixel becomes 0. Neighbours past the
/// image edge are ignored.
pub fn label_outline(resliced: &Resliced, thickness: u32) -> Resliced {
    let (width, height, depth) = resliced.extent();
    let radius = thickness.max(1) as isize;
    let labels = resliced.values.index_axis(Axis(3), 0);
    let inside = &resliced.inside;

    let frames: Vec<Vec<f64>> = (0..depth)
        .into_par_iter()
        .map(|z| {
            let mut frame = vec![0.0; width * height];
            for y in 0..height {
                for x in 0..width {
                    let label = labels[[z, y, x]];
                    if label == 0.0 || !inside[[z, y, x]] {
                        continue;
                    }
                    let is_edge = (-radius..=radius).any(|dy| {
                        (-radius..=radius).any(|dx| {
                            let ny = y as isize + dy;
                            let nx = x as isize + dx;
                            if ny < 0 || nx < 0 || ny >= height as isize || nx >= width as isize {
                                return false;
                            }
                            let (ny, nx) = (ny as usize, nx as usize);
                            !inside[[z, ny, nx]] || labels[[z, ny, nx]] != label
                        })
                    });
                    if is_edge {
                        frame[y * width + x] = label;
                    }
                }
            }
            frame
        })
        .collect();

    let values = Array4::from_shape_vec((depth, height, width, 1), frames.concat())
        .unwrap_or_else(|_| Array4::zeros((depth, height, width, 1)));
    Resliced {
        values,
        inside: resliced.inside.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn square() -> Resliced {
        // 5×5 frame with a 3×3 block of label 2 in the middle.
        let values = Array4::from_shape_fn((1, 5, 5, 1), |(_, y, x, _)| {
            if (1..=3).contains(&y) && (1..=3).contains(&x) { 2.0 } else { 0.0 }
        });
        Resliced {
            values,
            inside: Array3::from_elem((1, 5, 5), true),
        }
    }

    #[test]
    fn test_interior_is_cleared() {
        let outline = label_outline(&square(), 1);
        assert_eq!(outline.values[[0, 2, 2, 0]], 0.0);
        assert_eq!(outline.values[[0, 1, 1, 0]], 2.0);
        assert_eq!(outline.values[[0, 1, 2, 0]], 2.0);
        assert_eq!(outline.values[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_thick_outline_fills_small_region() {
        let outline = label_outline(&square(), 2);
        assert_eq!(outline.values[[0, 2, 2, 0]], 2.0);
    }

    #[test]
    fn test_image_edge_is_not_a_border() {
        let block = Resliced {
            values: Array4::from_elem((1, 3, 3, 1), 1.0),
            inside: Array3::from_elem((1, 3, 3), true),
        };
        let outline = label_outline(&block, 1);
        assert!(outline.values.iter().all(|v| *v == 0.0));
    }
}

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::enums::BlendMode;

/// One input of a blend, drawn at `opacity` in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct BlendInput<'a> {
    pub image: &'a RgbaImage,
    pub opacity: f64,
}

/// Stack `layers` back to front.
///
/// The first layer is the base: its colour is scaled by its opacity and its
/// alpha is kept. Every further layer is mixed in with weight
/// `opacity × alpha / 255`. With `clip_to_background` the base alpha is
/// kept; otherwise alpha is mixed like colour. Layers whose size differs
/// from the base are skipped.
pub fn alpha_blend(layers: &[BlendInput<'_>], clip_to_background: bool) -> Option<RgbaImage> {
    let (base, rest) = layers.split_first()?;
    let (width, height) = base.image.dimensions();
    let mut output = base.image.clone();
    if base.opacity < 1.0 {
        let opacity = base.opacity.clamp(0.0, 1.0);
        for pixel in output.pixels_mut() {
            for channel in &mut pixel.0[..3] {
                *channel = (*channel as f64 * opacity).round() as u8;
            }
        }
    }

    for layer in rest {
        if layer.image.dimensions() != (width, height) {
            continue;
        }
        let opacity = layer.opacity.clamp(0.0, 1.0);
        let samples: &mut [u8] = &mut output;
        samples
            .par_chunks_mut(4)
            .zip(layer.image.as_raw().par_chunks(4))
            .for_each(|(out, input)| {
                let weight = opacity * input[3] as f64 / 255.0;
                if weight <= 0.0 {
                    return;
                }
                let channels = if clip_to_background { 3 } else { 4 };
                for c in 0..channels {
                    let mixed = out[c] as f64 * (1.0 - weight) + input[c] as f64 * weight;
                    out[c] = mixed.round().clamp(0.0, 255.0) as u8;
                }
            });
    }
    Some(output)
}

/// Per-pixel `background ± foreground × opacity`, clamped to 8 bits.
///
/// With `clip_to_background` the result takes the background alpha,
/// otherwise the larger of the two alphas.
pub fn add_subtract(
    background: &RgbaImage,
    foreground: &BlendInput<'_>,
    subtract: bool,
    clip_to_background: bool,
) -> RgbaImage {
    let (width, height) = background.dimensions();
    if foreground.image.dimensions() != (width, height) {
        return background.clone();
    }
    let sign = if subtract { -1.0 } else { 1.0 };
    let opacity = foreground.opacity.clamp(0.0, 1.0);
    RgbaImage::from_fn(width, height, |x, y| {
        let bg = background.get_pixel(x, y).0;
        let fg = foreground.image.get_pixel(x, y).0;
        let mut out = [0u8; 4];
        for c in 0..3 {
            let value = bg[c] as f64 + sign * fg[c] as f64 * opacity;
            out[c] = value.round().clamp(0.0, 255.0) as u8;
        }
        out[3] = if clip_to_background { bg[3] } else { bg[3].max(fg[3]) };
        Rgba(out)
    })
}

/// The mode actually used for a requested mode and the layers present.
///
/// Add and Subtract need both background and foreground and fall back to
/// Alpha otherwise.
pub fn effective_mode(requested: BlendMode, has_background: bool, has_foreground: bool) -> BlendMode {
    match requested {
        BlendMode::Add | BlendMode::Subtract if !(has_background && has_foreground) => BlendMode::Alpha,
        mode => mode,
    }
}

/// Blend background, foreground and label rasters under `mode`.
///
/// The label layer always goes on top. Returns the composited raster, or
/// `None` if no layer is present.
pub fn composite(
    mode: BlendMode,
    background: Option<BlendInput<'_>>,
    foreground: Option<BlendInput<'_>>,
    label: Option<BlendInput<'_>>,
    clip_to_background: bool,
) -> Option<RgbaImage> {
    let mode = effective_mode(mode, background.is_some(), foreground.is_some());
    let base = match (mode, background, foreground) {
        (BlendMode::Add | BlendMode::Subtract, Some(bg), Some(fg)) => {
            let bg = alpha_blend(&[bg], clip_to_background)?;
            Some(add_subtract(&bg, &fg, mode == BlendMode::Subtract, clip_to_background))
        }
        (BlendMode::ReverseAlpha, bg, fg) => {
            let stack: Vec<_> = [fg, bg].into_iter().flatten().collect();
            alpha_blend(&stack, clip_to_background)
        }
        (_, bg, fg) => {
            let stack: Vec<_> = [bg, fg].into_iter().flatten().collect();
            alpha_blend(&stack, clip_to_background)
        }
    };

    match (base, label) {
        (Some(base), Some(label)) => alpha_blend(
            &[
                BlendInput {
                    image: &base,
                    opacity: 1.0,
                },
                label,
            ],
            clip_to_background,
        ),
        (Some(base), None) => Some(base),
        (None, Some(label)) => alpha_blend(&[label], clip_to_background),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(2, 2, Rgba(color))
    }

    fn input(image: &RgbaImage, opacity: f64) -> BlendInput<'_> {
        BlendInput { image, opacity }
    }

    #[test]
    fn test_opaque_stack_shows_topmost() {
        let red = solid([255, 0, 0, 255]);
        let green = solid([0, 255, 0, 255]);
        let blue = solid([0, 0, 255, 255]);
        let out = composite(
            BlendMode::Alpha,
            Some(input(&red, 1.0)),
            Some(input(&green, 1.0)),
            Some(input(&blue, 1.0)),
            true,
        )
        .unwrap();
        assert_eq!(out, blue);
    }

    #[test]
    fn test_reverse_alpha_swaps_order() {
        let red = solid([255, 0, 0, 255]);
        let green = solid([0, 255, 0, 255]);
        let out = composite(
            BlendMode::ReverseAlpha,
            Some(input(&red, 1.0)),
            Some(input(&green, 1.0)),
            None,
            true,
        )
        .unwrap();
        assert_eq!(out, red);
    }

    #[test]
    fn test_transparent_label_keeps_base() {
        let grey = solid([100, 100, 100, 255]);
        let empty = solid([0, 0, 0, 0]);
        let out = composite(BlendMode::Alpha, Some(input(&grey, 1.0)), None, Some(input(&empty, 1.0)), true).unwrap();
        assert_eq!(out, grey);
    }

    #[test]
    fn test_half_opacity_mixes() {
        let black = solid([0, 0, 0, 255]);
        let white = solid([200, 200, 200, 255]);
        let out = alpha_blend(&[input(&black, 1.0), input(&white, 0.5)], true).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [100, 100, 100, 255]);
    }

    #[test]
    fn test_add_and_subtract_clamp() {
        let bg = solid([200, 100, 10, 255]);
        let fg = solid([100, 100, 100, 128]);
        let added = composite(BlendMode::Add, Some(input(&bg, 1.0)), Some(input(&fg, 1.0)), None, true).unwrap();
        assert_eq!(added.get_pixel(0, 0).0, [255, 200, 110, 255]);
        let subtracted =
            composite(BlendMode::Subtract, Some(input(&bg, 1.0)), Some(input(&fg, 1.0)), None, true).unwrap();
        assert_eq!(subtracted.get_pixel(0, 0).0, [100, 0, 0, 255]);
    }

    #[test]
    fn test_add_without_foreground_is_alpha() {
        let bg = solid([10, 20, 30, 255]);
        let label = solid([0, 0, 0, 0]);
        assert_eq!(effective_mode(BlendMode::Add, true, false), BlendMode::Alpha);
        assert_eq!(effective_mode(BlendMode::Subtract, true, true), BlendMode::Subtract);
        let add = composite(BlendMode::Add, Some(input(&bg, 1.0)), None, Some(input(&label, 1.0)), true);
        let alpha = composite(BlendMode::Alpha, Some(input(&bg, 1.0)), None, Some(input(&label, 1.0)), true);
        assert_eq!(add, alpha);
    }

    #[test]
    fn test_unclipped_alpha_accumulates() {
        let empty = solid([0, 0, 0, 0]);
        let fg = solid([50, 50, 50, 255]);
        let clipped = alpha_blend(&[input(&empty, 1.0), input(&fg, 1.0)], true).unwrap();
        assert_eq!(clipped.get_pixel(0, 0).0[3], 0);
        let open = alpha_blend(&[input(&empty, 1.0), input(&fg, 1.0)], false).unwrap();
        assert_eq!(open.get_pixel(0, 0).0, [50, 50, 50, 255]);
    }

    #[test]
    fn test_nothing_to_blend() {
        assert!(composite(BlendMode::Alpha, None, None, None, true).is_none());
    }
}

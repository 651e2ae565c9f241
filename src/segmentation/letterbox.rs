use image::{imageops, RgbImage, RgbaImage};

/// Slack factor before a small input shrinks the canvas instead of being
/// upsampled into it.
const SHRINK_SLACK: f32 = 1.15;

/// Geometry of one letterboxed render. Produced by [`plan`] and consumed,
/// unmodified, by [`unletterbox`] to invert the transform. Scoped to a single
/// inference pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxMeta {
    pub orig_w: u32,
    pub orig_h: u32,
    pub scale: f32,
    pub dx: u32,
    pub dy: u32,
    pub target: u32,
}

impl LetterboxMeta {
    /// Dimensions of the scaled content inside the canvas.
    pub fn scaled_dims(&self) -> (u32, u32) {
        let w = ((self.orig_w as f32 * self.scale).round() as u32).min(self.target);
        let h = ((self.orig_h as f32 * self.scale).round() as u32).min(self.target);
        (w, h)
    }
}

/// Compute the letterbox geometry for an image of `(orig_w, orig_h)` into a
/// square canvas of side `target`.
///
/// Unless `force_exact` is set, the canvas shrinks to the source's larger
/// dimension times the slack factor (rounded) whenever `target` exceeds that
/// bound, so tiny inputs are not upsampled into a huge canvas.
pub fn plan(orig_w: u32, orig_h: u32, target: u32, force_exact: bool) -> LetterboxMeta {
    let max_dim = orig_w.max(orig_h).max(1);
    let mut target = target.max(1);
    if !force_exact && target as f32 > max_dim as f32 * SHRINK_SLACK {
        target = ((max_dim as f32) * SHRINK_SLACK).round() as u32;
    }

    let scale = target as f32 / max_dim as f32;
    let mut meta = LetterboxMeta {
        orig_w,
        orig_h,
        scale,
        dx: 0,
        dy: 0,
        target,
    };
    let (scaled_w, scaled_h) = meta.scaled_dims();
    meta.dx = (meta.target - scaled_w) / 2;
    meta.dy = (meta.target - scaled_h) / 2;
    meta
}

/// Render `image` into a black `target x target` canvas at the planned scale
/// and offset.
pub fn render(image: &RgbImage, meta: &LetterboxMeta) -> RgbImage {
    let _span = tracing::debug_span!("letterbox").entered();

    let (scaled_w, scaled_h) = meta.scaled_dims();
    let scaled = imageops::resize(image, scaled_w, scaled_h, imageops::FilterType::Lanczos3);

    // New buffers are zero-filled, which is the black padding we want
    let mut canvas = RgbImage::new(meta.target, meta.target);
    imageops::replace(&mut canvas, &scaled, meta.dx as i64, meta.dy as i64);
    canvas
}

/// Invert the letterbox: crop the content region out of a canvas-sized result
/// and scale it back to the original dimensions.
pub fn unletterbox(mask: &RgbaImage, meta: &LetterboxMeta) -> RgbaImage {
    let _span = tracing::debug_span!("unletterbox").entered();

    let (scaled_w, scaled_h) = meta.scaled_dims();
    let content = imageops::crop_imm(mask, meta.dx, meta.dy, scaled_w, scaled_h).to_image();
    imageops::resize(&content, meta.orig_w, meta.orig_h, imageops::FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn plan_landscape_centers_vertically() {
        let meta = plan(2000, 1000, 1024, false);
        assert_eq!(meta.target, 1024);
        assert!((meta.scale - 1024.0 / 2000.0).abs() < 1e-6);
        assert_eq!(meta.scaled_dims(), (1024, 512));
        assert_eq!(meta.dx, 0);
        assert_eq!(meta.dy, 256);
    }

    #[test]
    fn plan_portrait_centers_horizontally() {
        let meta = plan(500, 1000, 1024, false);
        assert_eq!(meta.target, 1024);
        assert_eq!(meta.scaled_dims(), (512, 1024));
        assert_eq!(meta.dx, 256);
        assert_eq!(meta.dy, 0);
    }

    #[test]
    fn plan_square_fills_canvas() {
        let meta = plan(640, 640, 1024, false);
        assert_eq!(meta.scaled_dims(), (1024, 1024));
        assert_eq!(meta.dx, 0);
        assert_eq!(meta.dy, 0);
    }

    #[test]
    fn plan_shrinks_canvas_for_tiny_inputs() {
        // Canvas collapses to round(100 * 1.15), not to the raw max dimension
        let meta = plan(100, 50, 1024, false);
        assert_eq!(meta.target, 115);
        assert!((meta.scale - 1.15).abs() < 1e-6);
        assert_eq!(meta.scaled_dims(), (115, 57));
        assert_eq!(meta.dx, 0);
        assert_eq!(meta.dy, 29);
    }

    #[test]
    fn plan_keeps_canvas_within_slack() {
        // 110 <= 100 * 1.15, so no shrink
        let meta = plan(100, 80, 110, false);
        assert_eq!(meta.target, 110);
    }

    #[test]
    fn plan_force_exact_never_shrinks() {
        let meta = plan(100, 50, 1024, true);
        assert_eq!(meta.target, 1024);
        assert_eq!(meta.scaled_dims(), (1024, 512));
        assert_eq!(meta.dy, 256);
    }

    #[test]
    fn plan_invariants_hold_across_shapes() {
        let shapes = [
            (1u32, 1u32),
            (3, 7),
            (733, 401),
            (1024, 1024),
            (1920, 1080),
            (4032, 3024),
        ];
        for (w, h) in shapes {
            for force in [false, true] {
                let meta = plan(w, h, 1024, force);
                let (sw, sh) = meta.scaled_dims();
                assert!(meta.scale > 0.0);
                assert!(meta.dx + sw <= meta.target, "{w}x{h} force={force}");
                assert!(meta.dy + sh <= meta.target, "{w}x{h} force={force}");
            }
        }
    }

    #[test]
    fn render_places_content_on_black_padding() {
        let white = RgbImage::from_pixel(100, 50, image::Rgb([255, 255, 255]));
        let meta = plan(100, 50, 100, true);
        let canvas = render(&white, &meta);

        assert_eq!(canvas.dimensions(), (100, 100));
        // Padding above, content in the middle band, padding below
        assert_eq!(canvas.get_pixel(50, 12), &image::Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(50, 50), &image::Rgb([255, 255, 255]));
        assert_eq!(canvas.get_pixel(50, 88), &image::Rgb([0, 0, 0]));
    }

    #[test]
    fn unletterbox_restores_original_dimensions() {
        for (w, h) in [(733u32, 401u32), (401, 733), (256, 256)] {
            let meta = plan(w, h, 1024, false);
            let canvas = RgbaImage::from_pixel(meta.target, meta.target, Rgba([0, 0, 0, 128]));
            let restored = unletterbox(&canvas, &meta);
            assert_eq!(restored.dimensions(), (w, h));
        }
    }

    #[test]
    fn unletterbox_reads_only_the_content_region() {
        let meta = plan(100, 50, 100, true);
        let mut canvas = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 0]));
        // Opaque only inside the content band (rows 25..75)
        for y in 25..75 {
            for x in 0..100 {
                canvas.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let restored = unletterbox(&canvas, &meta);
        assert_eq!(restored.dimensions(), (100, 50));
        assert_eq!(restored.get_pixel(50, 25)[3], 255);
    }
}

use image::{Rgba, RgbaImage};

/// How many leading raw values are inspected to decide whether the output is
/// logits or already a probability map.
const SIGMOID_PROBE: usize = 512;

/// Band of mask values considered uncertain boundary; only these are blended.
const FEATHER_LOW: u8 = 15;
const FEATHER_HIGH: u8 = 240;
const FEATHER_KEEP: f32 = 0.6;
const FEATHER_BLEND: f32 = 0.4;
const FEATHER_RADIUS: usize = 1;

/// Midtone lift applied after feathering.
const GAMMA: f32 = 0.9;

/// True when the sampled prefix holds values outside [0, 1], meaning the
/// whole tensor is pre-sigmoid logits. The decision is all-or-nothing.
pub fn needs_sigmoid(data: &[f32]) -> bool {
    data.iter()
        .take(SIGMOID_PROBE)
        .any(|&v| v < 0.0 || v > 1.0)
}

/// Logistic squash, applied elementwise to the entire tensor.
pub fn apply_sigmoid(data: &mut [f32]) {
    for v in data.iter_mut() {
        *v = 1.0 / (1.0 + (-*v).exp());
    }
}

/// Quantize to 8-bit: clamp to [0, 1] and scale; non-finite values become 0.
pub fn quantize(data: &[f32]) -> Vec<u8> {
    data.iter()
        .map(|&v| {
            let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
            (v * 255.0).round() as u8
        })
        .collect()
}

/// Separable Gaussian blur with sigma = radius and clamped edges.
fn blur_mask(mask: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    let sigma = radius as f32;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }

    // Horizontal pass
    let mut tmp = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f32;
            for (i, k) in kernel.iter().enumerate() {
                let sx = (x as isize + i as isize - radius as isize)
                    .clamp(0, width as isize - 1) as usize;
                acc += mask[y * width + sx] as f32 * k;
            }
            tmp[y * width + x] = acc.round() as u8;
        }
    }

    // Vertical pass
    let mut out = vec![0u8; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f32;
            for (i, k) in kernel.iter().enumerate() {
                let sy = (y as isize + i as isize - radius as isize)
                    .clamp(0, height as isize - 1) as usize;
                acc += tmp[sy * width + x] as f32 * k;
            }
            out[y * width + x] = acc.round() as u8;
        }
    }
    out
}

/// Blend each uncertain-boundary pixel toward its blurred neighborhood.
/// Confident foreground and background values are left untouched.
pub fn feather_blend(mask: &mut [u8], width: usize, height: usize) {
    let blurred = blur_mask(mask, width, height, FEATHER_RADIUS);
    for (v, b) in mask.iter_mut().zip(blurred.iter()) {
        let a = *v;
        if a > FEATHER_LOW && a < FEATHER_HIGH {
            *v = (a as f32 * FEATHER_KEEP + *b as f32 * FEATHER_BLEND) as u8;
        }
    }
}

/// Global midtone lift, applied to every pixel.
pub fn apply_gamma(mask: &mut [u8]) {
    for v in mask.iter_mut() {
        *v = ((*v as f32 / 255.0).powf(GAMMA) * 255.0).round() as u8;
    }
}

/// Full boundary shaping: feather the uncertain band, then lift midtones.
pub fn boundary_feather(mask: &mut [u8], width: usize, height: usize) {
    let _span = tracing::debug_span!("boundary_feather").entered();
    feather_blend(mask, width, height);
    apply_gamma(mask);
}

/// Pack a single-channel mask into RGBA with black RGB; downstream consumers
/// read only the alpha channel.
pub fn compose_rgba(mask: &[u8], width: u32, height: u32) -> RgbaImage {
    let mut out = RgbaImage::new(width, height);
    for (pixel, &a) in out.pixels_mut().zip(mask.iter()) {
        *pixel = Rgba([0, 0, 0, a]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_detects_logits() {
        assert!(needs_sigmoid(&[-4.0, 6.0, 0.5]));
        assert!(needs_sigmoid(&[0.5, 1.2]));
        assert!(!needs_sigmoid(&[0.0, 0.5, 1.0]));
    }

    #[test]
    fn probe_inspects_prefix_only() {
        let mut data = vec![0.5f32; 600];
        data[550] = -5.0;
        assert!(!needs_sigmoid(&data));
        data[100] = -5.0;
        assert!(needs_sigmoid(&data));
    }

    #[test]
    fn sigmoid_maps_logits_into_unit_range() {
        let mut data = vec![0.0f32, -10.0, 10.0];
        apply_sigmoid(&mut data);
        assert!((data[0] - 0.5).abs() < 1e-6);
        assert!(data[1] < 0.001);
        assert!(data[2] > 0.999);
    }

    #[test]
    fn quantize_clamps_and_zeroes_non_finite() {
        let out = quantize(&[
            -0.5,
            0.0,
            0.5,
            1.0,
            1.5,
            f32::NAN,
            f32::INFINITY,
            f32::NEG_INFINITY,
        ]);
        assert_eq!(out, vec![0, 0, 128, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn blur_preserves_flat_fields() {
        let mask = vec![128u8; 25];
        let out = blur_mask(&mask, 5, 5, 1);
        assert!(out.iter().all(|&v| v == 128));
    }

    #[test]
    fn blend_skips_confident_values() {
        // High-contrast neighborhoods around each probe value
        let mut mask = vec![255u8; 25];
        mask[12] = 0;
        let before = mask.clone();
        feather_blend(&mut mask, 5, 5);
        assert_eq!(mask[12], before[12]);

        let mut mask = vec![255u8; 25];
        mask[12] = 15;
        feather_blend(&mut mask, 5, 5);
        assert_eq!(mask[12], 15);

        let mut mask = vec![0u8; 25];
        mask[12] = 240;
        feather_blend(&mut mask, 5, 5);
        assert_eq!(mask[12], 240);

        let mut mask = vec![0u8; 25];
        mask[12] = 255;
        feather_blend(&mut mask, 5, 5);
        assert_eq!(mask[12], 255);
    }

    #[test]
    fn blend_moves_uncertain_values_toward_blur() {
        let mut mask = vec![255u8; 25];
        mask[12] = 16;
        feather_blend(&mut mask, 5, 5);
        // 0.6 * 16 + 0.4 * blurred, with a bright neighborhood pulling up
        assert!(mask[12] > 16);

        let mut mask = vec![0u8; 25];
        mask[12] = 100;
        feather_blend(&mut mask, 5, 5);
        assert!(mask[12] < 100);
    }

    #[test]
    fn gamma_keeps_endpoints_and_lifts_midtones() {
        let mut mask = vec![0u8, 128, 255];
        apply_gamma(&mut mask);
        assert_eq!(mask[0], 0);
        assert_eq!(mask[2], 255);
        assert!(mask[1] > 128);
        assert_eq!(mask[1], 137);
    }

    #[test]
    fn compose_writes_alpha_only() {
        let mask = vec![0u8, 64, 128, 255];
        let image = compose_rgba(&mask, 2, 2);
        assert_eq!(image.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgba([0, 0, 0, 64]));
        assert_eq!(image.get_pixel(0, 1), &Rgba([0, 0, 0, 128]));
        assert_eq!(image.get_pixel(1, 1), &Rgba([0, 0, 0, 255]));
    }
}

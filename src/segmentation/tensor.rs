use anyhow::Result;
use image::RgbImage;
use ndarray::{Array4, ArrayViewD};

/// Single-channel float plane lifted out of an inference output tensor.
#[derive(Debug, Clone)]
pub struct MattePlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// Pack an RGB canvas into a planar NCHW tensor normalized to [-1, 1].
///
/// Per-channel value = (raw/255 - 0.5) / 0.5, stored channel-major with
/// shape [1, 3, height, width].
pub fn pack_rgb(canvas: &RgbImage) -> Array4<f32> {
    let _span = tracing::debug_span!("pack_rgb").entered();

    let (width, height) = canvas.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for y in 0..height {
        for x in 0..width {
            let pixel = canvas.get_pixel(x, y);
            let r = (pixel[0] as f32 / 255.0 - 0.5) / 0.5;
            let g = (pixel[1] as f32 / 255.0 - 0.5) / 0.5;
            let b = (pixel[2] as f32 / 255.0 - 0.5) / 0.5;

            tensor[[0, 0, y as usize, x as usize]] = r;
            tensor[[0, 1, y as usize, x as usize]] = g;
            tensor[[0, 2, y as usize, x as usize]] = b;
        }
    }

    tensor
}

/// Interpret a model output as a `[1, 1, H, W]` alpha plane.
pub fn unpack_alpha(view: ArrayViewD<'_, f32>) -> Result<MattePlane> {
    let shape = view.shape();
    if shape.len() != 4 {
        anyhow::bail!("unexpected output shape {shape:?}, want [1, 1, h, w]");
    }

    let height = shape[2] as u32;
    let width = shape[3] as u32;
    let data: Vec<f32> = view.iter().copied().collect();
    Ok(MattePlane {
        width,
        height,
        data,
    })
}

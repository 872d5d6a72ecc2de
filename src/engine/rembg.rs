use image::RgbaImage;

use super::BackgroundRemover;
use crate::error::GenerationError;

/// 按边框颜色抠图：取四条边的平均色作为背景色，相近的像素设为透明。
/// 输入若已经带透明背景则原样返回。
#[derive(Debug, Clone, Copy)]
pub struct BorderKeyRemover {
    /// RGB 欧氏距离阈值
    pub tolerance: f32,
}

impl Default for BorderKeyRemover {
    fn default() -> Self {
        Self { tolerance: 40.0 }
    }
}

impl BackgroundRemover for BorderKeyRemover {
    fn remove(&self, mut image: RgbaImage) -> Result<RgbaImage, GenerationError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(GenerationError::invalid("image has no pixels"));
        }
        if has_transparent_border(&image) {
            return Ok(image);
        }

        let background = border_mean(&image);
        let tol2 = self.tolerance * self.tolerance;
        for pixel in image.pixels_mut() {
            let d2: f32 = (0..3)
                .map(|c| {
                    let diff = pixel.0[c] as f32 - background[c];
                    diff * diff
                })
                .sum();
            if d2 <= tol2 {
                pixel.0[3] = 0;
            }
        }
        Ok(image)
    }
}

fn border_pixels(image: &RgbaImage) -> impl Iterator<Item = &image::Rgba<u8>> {
    let (w, h) = image.dimensions();
    image
        .enumerate_pixels()
        .filter(move |(x, y, _)| *x == 0 || *y == 0 || *x == w - 1 || *y == h - 1)
        .map(|(_, _, p)| p)
}

// 超过一半的边框像素已经透明，视为已抠好
fn has_transparent_border(image: &RgbaImage) -> bool {
    let (mut total, mut clear) = (0usize, 0usize);
    for p in border_pixels(image) {
        total += 1;
        if p.0[3] < 128 {
            clear += 1;
        }
    }
    clear * 2 > total
}

fn border_mean(image: &RgbaImage) -> [f32; 3] {
    let mut sum = [0.0f32; 3];
    let mut count = 0usize;
    for p in border_pixels(image) {
        for c in 0..3 {
            sum[c] += p.0[c] as f32;
        }
        count += 1;
    }
    sum.map(|s| s / count.max(1) as f32)
}

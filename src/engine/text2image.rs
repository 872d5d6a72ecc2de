use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::TextToImage;
use crate::error::GenerationError;

/// 占位文生图：同一个提示词总是得到同一张图——白底上的一个彩色椭圆。
/// 后续的去背景 + 形状管线会把它当作普通的单图输入。
#[derive(Debug, Clone, Copy)]
pub struct SeededTextToImage {
    pub size: u32,
}

impl Default for SeededTextToImage {
    fn default() -> Self {
        Self { size: 256 }
    }
}

impl SeededTextToImage {
    pub fn draw(&self, prompt: &str) -> RgbaImage {
        let mut hasher = DefaultHasher::new();
        prompt.trim().to_lowercase().hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        let size = self.size as f32;
        let rx = rng.gen_range(0.18..0.42) * size;
        let ry = rng.gen_range(0.18..0.42) * size;
        // 颜色避开接近白色的区域，保证能被抠出来
        let colour = Rgba([
            rng.gen_range(20..200),
            rng.gen_range(20..200),
            rng.gen_range(20..200),
            255,
        ]);
        let c = size / 2.0;

        RgbaImage::from_fn(self.size, self.size, |x, y| {
            let dx = (x as f32 + 0.5 - c) / rx;
            let dy = (y as f32 + 0.5 - c) / ry;
            if dx * dx + dy * dy <= 1.0 {
                colour
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }
}

#[async_trait]
impl TextToImage for SeededTextToImage {
    async fn render(&self, prompt: &str) -> Result<RgbaImage, GenerationError> {
        let this = *self;
        let prompt = prompt.to_string();
        Ok(tokio::task::spawn_blocking(move || this.draw(&prompt)).await?)
    }
}

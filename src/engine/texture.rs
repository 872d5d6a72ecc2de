use async_trait::async_trait;
use image::RgbaImage;

use super::TexturePainter;
use crate::error::GenerationError;
use crate::mesh::Mesh;

/// 正交投影上色：把参考图沿 z 轴投到网格上，写入顶点色。
/// 落在透明区域的顶点用前景平均色。
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionPainter;

impl ProjectionPainter {
    pub fn paint_blocking(&self, mut mesh: Mesh, reference: &RgbaImage) -> Result<Mesh, GenerationError> {
        let (w, h) = reference.dimensions();
        if w == 0 || h == 0 {
            return Err(GenerationError::invalid("texture reference image is empty"));
        }
        let fallback = foreground_mean(reference);

        let colors = mesh
            .positions
            .iter()
            .map(|p| {
                let u = ((p[0] + 1.0) / 2.0 * w as f32).clamp(0.0, w as f32 - 1.0) as u32;
                let v = ((1.0 - p[1]) / 2.0 * h as f32).clamp(0.0, h as f32 - 1.0) as u32;
                let px = reference.get_pixel(u, v).0;
                if px[3] >= 128 {
                    [px[0], px[1], px[2], 255]
                } else {
                    fallback
                }
            })
            .collect();
        mesh.colors = Some(colors);
        Ok(mesh)
    }
}

#[async_trait]
impl TexturePainter for ProjectionPainter {
    async fn paint(&self, mesh: Mesh, reference: &RgbaImage) -> Result<Mesh, GenerationError> {
        let painter = *self;
        let reference = reference.clone();
        tokio::task::spawn_blocking(move || painter.paint_blocking(mesh, &reference)).await?
    }
}

fn foreground_mean(image: &RgbaImage) -> [u8; 4] {
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for p in image.pixels().filter(|p| p.0[3] >= 128) {
        for c in 0..3 {
            sum[c] += p.0[c] as u64;
        }
        count += 1;
    }
    if count == 0 {
        return [200, 200, 200, 255];
    }
    [
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
        255,
    ]
}

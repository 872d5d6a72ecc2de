//! 内置形状管线：基于剪影的体素外壳。
//!
//! 单图时按剪影的距离场做浮雕式膨胀；多视角时用正、左、背三个剪影求交。
//! 坐标约定：y 向上；正面相机在 +z 看向 -z（图片列 → x），
//! 左侧相机在 -x 看向 +x（列 → z），背面相机在 -z 看向 +z（列 → n-1-x）。

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::info;

use super::{Conditioning, ShapePipeline};
use crate::error::GenerationError;
use crate::mesh::Mesh;
use crate::normalizer::SamplingParams;

const ALPHA_THRESHOLD: u8 = 128;

pub struct SilhouetteHullPipeline {
    name: String,
}

impl SilhouetteHullPipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ShapePipeline for SilhouetteHullPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        conditioning: &Conditioning,
        params: &SamplingParams,
    ) -> Result<Mesh, GenerationError> {
        let conditioning = conditioning.clone();
        let params = *params;
        let start = Instant::now();

        let mesh = tokio::task::spawn_blocking(move || build_hull(&conditioning, &params)).await??;

        info!(
            pipeline = %self.name,
            seed = params.seed,
            octree_resolution = params.octree_resolution,
            num_inference_steps = params.num_inference_steps,
            num_chunks = params.num_chunks,
            guidance_scale = params.guidance_scale,
            faces = mesh.face_count(),
            elapsed_secs = start.elapsed().as_secs_f32(),
            "shape generated"
        );
        Ok(mesh)
    }
}

/// 体素网格边长
pub fn grid_size(octree_resolution: u32) -> usize {
    (octree_resolution as usize / 4).clamp(8, 96)
}

/// Laplacian 平滑次数
pub fn relax_passes(num_inference_steps: u32) -> usize {
    (num_inference_steps as usize / 5).clamp(1, 10)
}

pub fn build_hull(
    conditioning: &Conditioning,
    params: &SamplingParams,
) -> Result<Mesh, GenerationError> {
    let n = grid_size(params.octree_resolution);
    let grid = match conditioning {
        Conditioning::Single(image) => relief(&silhouette(image, n), n),
        Conditioning::Multiview { front, left, back } => carve(
            &silhouette(front, n),
            &silhouette(left, n),
            &silhouette(back, n),
            n,
        ),
    };

    if !grid.cells.iter().any(|&filled| filled) {
        return Err(GenerationError::invalid(
            "conditioning image has no foreground after background removal",
        ));
    }

    let mut mesh = grid.surface();
    relax(&mut mesh, relax_passes(params.num_inference_steps));
    Ok(mesh)
}

/// n×n 的前景掩码，按 [列][行] 存储，行 0 在图片顶部
struct Mask {
    n: usize,
    bits: Vec<bool>,
}

impl Mask {
    fn get(&self, col: usize, row: usize) -> bool {
        self.bits[row * self.n + col]
    }
}

fn silhouette(image: &RgbaImage, n: usize) -> Mask {
    let resized = imageops::resize(image, n as u32, n as u32, FilterType::Triangle);
    let bits = resized.pixels().map(|p| p.0[3] >= ALPHA_THRESHOLD).collect();
    Mask { n, bits }
}

struct VoxelGrid {
    n: usize,
    cells: Vec<bool>,
}

impl VoxelGrid {
    fn new(n: usize) -> Self {
        Self {
            n,
            cells: vec![false; n * n * n],
        }
    }

    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.n * (y + self.n * z)
    }

    fn filled(&self, x: isize, y: isize, z: isize) -> bool {
        let n = self.n as isize;
        if x < 0 || y < 0 || z < 0 || x >= n || y >= n || z >= n {
            return false;
        }
        self.cells[self.index(x as usize, y as usize, z as usize)]
    }

    fn set(&mut self, x: usize, y: usize, z: usize) {
        let i = self.index(x, y, z);
        self.cells[i] = true;
    }

    /// 边界体素面 → 焊接好的三角网格，缩放到 [-1, 1]
    fn surface(&self) -> Mesh {
        // 每个方向：法线偏移 + 从外侧看逆时针的四个角
        const SIDES: [([isize; 3], [[u32; 3]; 4]); 6] = [
            ([1, 0, 0], [[1, 0, 0], [1, 1, 0], [1, 1, 1], [1, 0, 1]]),
            ([-1, 0, 0], [[0, 0, 0], [0, 0, 1], [0, 1, 1], [0, 1, 0]]),
            ([0, 1, 0], [[0, 1, 0], [0, 1, 1], [1, 1, 1], [1, 1, 0]]),
            ([0, -1, 0], [[0, 0, 0], [1, 0, 0], [1, 0, 1], [0, 0, 1]]),
            ([0, 0, 1], [[0, 0, 1], [1, 0, 1], [1, 1, 1], [0, 1, 1]]),
            ([0, 0, -1], [[0, 0, 0], [0, 1, 0], [1, 1, 0], [1, 0, 0]]),
        ];

        let scale = 2.0 / self.n as f32;
        let mut corners: HashMap<[u32; 3], u32> = HashMap::new();
        let mut mesh = Mesh::default();

        for z in 0..self.n {
            for y in 0..self.n {
                for x in 0..self.n {
                    if !self.cells[self.index(x, y, z)] {
                        continue;
                    }
                    for (dir, quad) in &SIDES {
                        let (nx, ny, nz) = (
                            x as isize + dir[0],
                            y as isize + dir[1],
                            z as isize + dir[2],
                        );
                        if self.filled(nx, ny, nz) {
                            continue;
                        }
                        let ids = quad.map(|offset| {
                            let key = [x as u32 + offset[0], y as u32 + offset[1], z as u32 + offset[2]];
                            *corners.entry(key).or_insert_with(|| {
                                mesh.positions.push(key.map(|c| c as f32 * scale - 1.0));
                                (mesh.positions.len() - 1) as u32
                            })
                        });
                        mesh.faces.push([ids[0], ids[1], ids[2]]);
                        mesh.faces.push([ids[0], ids[2], ids[3]]);
                    }
                }
            }
        }
        mesh
    }
}

/// 单图：剪影内每个像素按到边界的距离决定厚度，得到圆润的浮雕
fn relief(mask: &Mask, n: usize) -> VoxelGrid {
    let depth = distance_field(mask);
    let mut grid = VoxelGrid::new(n);
    let centre = n as f32 / 2.0;
    let max_half = n as f32 / 2.0;

    for row in 0..n {
        let y = n - 1 - row;
        for col in 0..n {
            let half = depth[row * n + col].min(max_half);
            if half <= 0.0 {
                continue;
            }
            for z in 0..n {
                if (z as f32 + 0.5 - centre).abs() < half {
                    grid.set(col, y, z);
                }
            }
        }
    }
    grid
}

/// 多视角：三个剪影的交集
fn carve(front: &Mask, left: &Mask, back: &Mask, n: usize) -> VoxelGrid {
    let mut grid = VoxelGrid::new(n);
    for row in 0..n {
        let y = n - 1 - row;
        for x in 0..n {
            if !front.get(x, row) || !back.get(n - 1 - x, row) {
                continue;
            }
            for z in 0..n {
                if left.get(z, row) {
                    grid.set(x, y, z);
                }
            }
        }
    }
    grid
}

/// 3-4 倒角距离变换（以像素为单位），图外视为背景
fn distance_field(mask: &Mask) -> Vec<f32> {
    const DIAG: f32 = std::f32::consts::SQRT_2;
    let n = mask.n;
    let mut d: Vec<f32> = mask
        .bits
        .iter()
        .map(|&fg| if fg { f32::INFINITY } else { 0.0 })
        .collect();

    let at = |d: &[f32], col: isize, row: isize| -> f32 {
        if col < 0 || row < 0 || col >= n as isize || row >= n as isize {
            0.0
        } else {
            d[row as usize * n + col as usize]
        }
    };

    for row in 0..n as isize {
        for col in 0..n as isize {
            let i = row as usize * n + col as usize;
            if d[i] == 0.0 {
                continue;
            }
            let best = (at(&d, col - 1, row) + 1.0)
                .min(at(&d, col, row - 1) + 1.0)
                .min(at(&d, col - 1, row - 1) + DIAG)
                .min(at(&d, col + 1, row - 1) + DIAG);
            d[i] = d[i].min(best);
        }
    }
    for row in (0..n as isize).rev() {
        for col in (0..n as isize).rev() {
            let i = row as usize * n + col as usize;
            if d[i] == 0.0 {
                continue;
            }
            let best = (at(&d, col + 1, row) + 1.0)
                .min(at(&d, col, row + 1) + 1.0)
                .min(at(&d, col + 1, row + 1) + DIAG)
                .min(at(&d, col - 1, row + 1) + DIAG);
            d[i] = d[i].min(best);
        }
    }
    d
}

fn relax(mesh: &mut Mesh, passes: usize) {
    let mut neighbours: Vec<Vec<u32>> = vec![Vec::new(); mesh.positions.len()];
    for f in &mesh.faces {
        for k in 0..3 {
            let (a, b) = (f[k], f[(k + 1) % 3]);
            if !neighbours[a as usize].contains(&b) {
                neighbours[a as usize].push(b);
            }
            if !neighbours[b as usize].contains(&a) {
                neighbours[b as usize].push(a);
            }
        }
    }

    for _ in 0..passes {
        let previous = mesh.positions.clone();
        for (i, adj) in neighbours.iter().enumerate() {
            if adj.is_empty() {
                continue;
            }
            let mut mean = [0.0f32; 3];
            for &j in adj {
                for a in 0..3 {
                    mean[a] += previous[j as usize][a];
                }
            }
            for a in 0..3 {
                mean[a] /= adj.len() as f32;
                mesh.positions[i][a] = 0.5 * previous[i][a] + 0.5 * mean[a];
            }
        }
    }
}

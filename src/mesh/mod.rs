//! 三角网格及其后处理、编解码。

pub mod export;
pub mod glb;
pub mod postprocess;

use thiserror::Error;

pub use export::ExportFormat;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("malformed mesh: {0}")]
    Malformed(String),

    #[error("unsupported mesh feature: {0}")]
    Unsupported(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 索引三角网格。`colors` 若存在，与 `positions` 一一对应（RGBA8）。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    pub colors: Option<Vec<[u8; 4]>>,
}

impl Mesh {
    pub fn new(positions: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            positions,
            faces,
            colors: None,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// 所有索引都落在顶点范围内，颜色数量与顶点一致
    pub fn validate(&self) -> Result<(), MeshError> {
        let n = self.positions.len() as u32;
        if let Some(face) = self.faces.iter().find(|f| f.iter().any(|&i| i >= n)) {
            return Err(MeshError::Malformed(format!(
                "face {face:?} references a vertex outside 0..{n}"
            )));
        }
        if let Some(colors) = &self.colors {
            if colors.len() != self.positions.len() {
                return Err(MeshError::Malformed(format!(
                    "{} colors for {} vertices",
                    colors.len(),
                    self.positions.len()
                )));
            }
        }
        Ok(())
    }

    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = *self.positions.first()?;
        let mut min = first;
        let mut max = first;
        for p in &self.positions {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some((min, max))
    }

    pub fn face_area(&self, face: &[u32; 3]) -> f32 {
        let a = self.positions[face[0] as usize];
        let b = self.positions[face[1] as usize];
        let c = self.positions[face[2] as usize];
        0.5 * length(cross(sub(b, a), sub(c, a)))
    }

    pub fn face_normal(&self, face: &[u32; 3]) -> [f32; 3] {
        let a = self.positions[face[0] as usize];
        let b = self.positions[face[1] as usize];
        let c = self.positions[face[2] as usize];
        let n = cross(sub(b, a), sub(c, a));
        let len = length(n);
        if len > 0.0 {
            [n[0] / len, n[1] / len, n[2] / len]
        } else {
            [0.0, 0.0, 0.0]
        }
    }

    /// 删除没有被任何面引用的顶点并重排索引
    pub fn compact(&mut self) {
        let mut remap = vec![u32::MAX; self.positions.len()];
        let mut positions = Vec::new();
        let mut colors = self.colors.as_ref().map(|_| Vec::new());

        for face in &mut self.faces {
            for index in face.iter_mut() {
                let old = *index as usize;
                if remap[old] == u32::MAX {
                    remap[old] = positions.len() as u32;
                    positions.push(self.positions[old]);
                    if let (Some(out), Some(src)) = (colors.as_mut(), self.colors.as_ref()) {
                        out.push(src[old]);
                    }
                }
                *index = remap[old];
            }
        }

        self.positions = positions;
        self.colors = colors;
    }
}

pub(crate) fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn length(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// 测试用的小网格
#[cfg(test)]
pub(crate) mod fixtures {
    use super::Mesh;

    /// 单位立方体，12 个三角形
    pub fn cube(offset: [f32; 3], size: f32) -> Mesh {
        let [ox, oy, oz] = offset;
        let mut positions = Vec::new();
        for i in 0..8u32 {
            positions.push([
                ox + size * (i & 1) as f32,
                oy + size * ((i >> 1) & 1) as f32,
                oz + size * ((i >> 2) & 1) as f32,
            ]);
        }
        let faces = vec![
            [0, 2, 1], [1, 2, 3],
            [4, 5, 6], [5, 7, 6],
            [0, 1, 4], [1, 5, 4],
            [2, 6, 3], [3, 6, 7],
            [0, 4, 2], [2, 4, 6],
            [1, 3, 5], [3, 7, 5],
        ];
        Mesh::new(positions, faces)
    }

    /// 把两个网格拼在一起（不共享顶点）
    pub fn merge(a: &Mesh, b: &Mesh) -> Mesh {
        let offset = a.positions.len() as u32;
        let mut positions = a.positions.clone();
        positions.extend_from_slice(&b.positions);
        let mut faces = a.faces.clone();
        faces.extend(b.faces.iter().map(|f| [f[0] + offset, f[1] + offset, f[2] + offset]));
        Mesh::new(positions, faces)
    }
}

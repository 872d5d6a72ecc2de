//! 纹理前的网格清理：去浮块 → 去退化面 → 减面。
//!
//! 每一步都假设输入是上一步的输出，顺序由 [`standard_stages`] 固定。

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::Mesh;
use crate::error::GenerationError;

pub trait MeshStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, mesh: Mesh) -> Result<Mesh, GenerationError>;
}

/// 按顺序执行的一组后处理步骤
pub fn standard_stages(max_faces: usize) -> Vec<Box<dyn MeshStage>> {
    vec![
        Box::new(FloaterRemover),
        Box::new(DegenerateFaceRemover::default()),
        Box::new(FaceReducer::new(max_faces)),
    ]
}

pub fn run_stages(stages: &[Box<dyn MeshStage>], mut mesh: Mesh) -> Result<Mesh, GenerationError> {
    for stage in stages {
        let before = mesh.face_count();
        mesh = stage.apply(mesh)?;
        debug!(
            stage = stage.name(),
            faces_before = before,
            faces_after = mesh.face_count(),
            "post-processing stage finished"
        );
    }
    Ok(mesh)
}

/// 只保留面数最多的连通分量
#[derive(Debug, Clone, Copy, Default)]
pub struct FloaterRemover;

impl MeshStage for FloaterRemover {
    fn name(&self) -> &'static str {
        "floater_removal"
    }

    fn apply(&self, mut mesh: Mesh) -> Result<Mesh, GenerationError> {
        if mesh.faces.is_empty() {
            return Ok(mesh);
        }

        let mut sets = DisjointSet::new(mesh.positions.len());
        for face in &mesh.faces {
            sets.union(face[0] as usize, face[1] as usize);
            sets.union(face[1] as usize, face[2] as usize);
        }

        let mut face_counts: HashMap<usize, usize> = HashMap::new();
        for face in &mesh.faces {
            *face_counts.entry(sets.find(face[0] as usize)).or_default() += 1;
        }
        // 面数相同时取根编号小的，保证结果确定
        let Some((&keep, _)) = face_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            return Ok(mesh);
        };

        mesh.faces.retain(|face| sets.find(face[0] as usize) == keep);
        mesh.compact();
        Ok(mesh)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DegenerateFaceRemover {
    pub min_area: f32,
}

impl Default for DegenerateFaceRemover {
    fn default() -> Self {
        Self { min_area: 1e-12 }
    }
}

impl MeshStage for DegenerateFaceRemover {
    fn name(&self) -> &'static str {
        "degenerate_face_removal"
    }

    fn apply(&self, mut mesh: Mesh) -> Result<Mesh, GenerationError> {
        let mut seen = HashSet::new();
        let faces = std::mem::take(&mut mesh.faces);
        let kept: Vec<[u32; 3]> = faces
            .into_iter()
            .filter(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2])
            .filter(|f| mesh.face_area(f) > self.min_area)
            .filter(|f| seen.insert(canonical(f)))
            .collect();
        mesh.faces = kept;
        mesh.compact();
        Ok(mesh)
    }
}

/// 顶点聚类减面：网格越来越粗，直到面数不超过 `max_faces`
#[derive(Debug, Clone, Copy)]
pub struct FaceReducer {
    pub max_faces: usize,
}

impl FaceReducer {
    pub fn new(max_faces: usize) -> Self {
        Self { max_faces }
    }
}

impl MeshStage for FaceReducer {
    fn name(&self) -> &'static str {
        "face_reduction"
    }

    fn apply(&self, mesh: Mesh) -> Result<Mesh, GenerationError> {
        if mesh.face_count() <= self.max_faces {
            return Ok(mesh);
        }
        let Some((min, max)) = mesh.bounds() else {
            return Ok(mesh);
        };
        let extent = (0..3).map(|a| max[a] - min[a]).fold(0.0f32, f32::max);
        if extent <= 0.0 {
            return Ok(mesh);
        }

        // 面数约与格子数的平方成正比，先按比例估一个起点
        let ratio = (self.max_faces as f32 / mesh.face_count() as f32).sqrt();
        let natural = (mesh.vertex_count() as f32).cbrt().max(2.0) * 4.0;
        let mut cells = (natural * ratio).max(1.0);

        loop {
            let reduced = cluster(&mesh, min, extent, cells.ceil() as u32);
            if reduced.face_count() <= self.max_faces || cells <= 1.0 {
                return Ok(reduced);
            }
            cells *= 0.8;
        }
    }
}

fn cluster(mesh: &Mesh, min: [f32; 3], extent: f32, cells: u32) -> Mesh {
    let cell_size = extent / cells as f32;
    let mut cell_of: HashMap<[u32; 3], u32> = HashMap::new();
    let mut sums: Vec<([f32; 3], [u32; 4], u32)> = Vec::new();
    let mut remap = Vec::with_capacity(mesh.positions.len());

    for (i, p) in mesh.positions.iter().enumerate() {
        let key = [0, 1, 2].map(|a| (((p[a] - min[a]) / cell_size) as u32).min(cells - 1));
        let id = *cell_of.entry(key).or_insert_with(|| {
            sums.push(([0.0; 3], [0; 4], 0));
            (sums.len() - 1) as u32
        });
        let entry = &mut sums[id as usize];
        for a in 0..3 {
            entry.0[a] += p[a];
        }
        if let Some(colors) = &mesh.colors {
            for c in 0..4 {
                entry.1[c] += colors[i][c] as u32;
            }
        }
        entry.2 += 1;
        remap.push(id);
    }

    let positions = sums
        .iter()
        .map(|(s, _, n)| [s[0] / *n as f32, s[1] / *n as f32, s[2] / *n as f32])
        .collect();
    let colors = mesh.colors.as_ref().map(|_| {
        sums.iter()
            .map(|(_, c, n)| c.map(|v| (v / n) as u8))
            .collect()
    });

    let mut seen = HashSet::new();
    let faces = mesh
        .faces
        .iter()
        .map(|f| f.map(|i| remap[i as usize]))
        .filter(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2])
        .filter(|f| seen.insert(canonical(f)))
        .collect();

    let mut reduced = Mesh {
        positions,
        faces,
        colors,
    };
    reduced.compact();
    reduced
}

// 旋转到最小索引打头，保留绕序
fn canonical(f: &[u32; 3]) -> [u32; 3] {
    let start = (0..3).min_by_key(|&i| f[i]).unwrap_or(0);
    [f[start], f[(start + 1) % 3], f[(start + 2) % 3]]
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::{cube, merge};

    #[test]
    fn floater_remover_keeps_largest_component() {
        let body = cube([0.0; 3], 1.0);
        let speck = Mesh::new(
            vec![[5.0, 5.0, 5.0], [5.1, 5.0, 5.0], [5.0, 5.1, 5.0]],
            vec![[0, 1, 2]],
        );
        let mesh = merge(&body, &speck);
        assert_eq!(mesh.face_count(), 13);

        let cleaned = FloaterRemover.apply(mesh).unwrap();
        assert_eq!(cleaned.face_count(), 12);
        assert_eq!(cleaned.vertex_count(), 8);
        cleaned.validate().unwrap();
    }

    #[test]
    fn degenerate_remover_drops_collapsed_and_duplicate_faces() {
        let mut mesh = cube([0.0; 3], 1.0);
        mesh.faces.push([0, 0, 1]);
        let duplicate = mesh.faces[0];
        mesh.faces.push(duplicate);
        // 三点共线
        mesh.positions.push([0.5, 0.0, 0.0]);
        mesh.faces.push([0, 8, 1]);

        let cleaned = DegenerateFaceRemover::default().apply(mesh).unwrap();
        assert_eq!(cleaned.face_count(), 12);
        assert_eq!(cleaned.vertex_count(), 8);
    }

    #[test]
    fn reducer_leaves_small_meshes_alone() {
        let mesh = cube([0.0; 3], 1.0);
        let reduced = FaceReducer::new(100).apply(mesh.clone()).unwrap();
        assert_eq!(reduced, mesh);
    }

    #[test]
    fn reducer_meets_face_budget() {
        // 细分的平面：40x40 格子，3200 个三角形
        let n = 40u32;
        let mut positions = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                positions.push([x as f32 / n as f32, y as f32 / n as f32, 0.0]);
            }
        }
        let mut faces = Vec::new();
        for y in 0..n {
            for x in 0..n {
                let i = y * (n + 1) + x;
                faces.push([i, i + 1, i + n + 1]);
                faces.push([i + 1, i + n + 2, i + n + 1]);
            }
        }
        let mesh = Mesh::new(positions, faces);

        let reduced = FaceReducer::new(500).apply(mesh).unwrap();
        assert!(reduced.face_count() <= 500);
        assert!(reduced.face_count() > 0);
        reduced.validate().unwrap();
    }

    #[test]
    fn standard_stages_are_in_fixed_order() {
        let names: Vec<_> = standard_stages(10).iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec!["floater_removal", "degenerate_face_removal", "face_reduction"]
        );
    }
}

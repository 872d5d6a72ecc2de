use std::fmt::Write as _;
use std::str::FromStr;

use super::{glb, Mesh, MeshError};

/// 结果文件格式，对应请求里的 `type` 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExportFormat {
    #[default]
    Glb,
    Obj,
    Stl,
    Ply,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Glb => "glb",
            ExportFormat::Obj => "obj",
            ExportFormat::Stl => "stl",
            ExportFormat::Ply => "ply",
        }
    }

    pub fn encode(&self, mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
        match self {
            ExportFormat::Glb => glb::encode(mesh),
            ExportFormat::Obj => to_obj(mesh),
            ExportFormat::Stl => to_binary_stl(mesh),
            ExportFormat::Ply => to_ascii_ply(mesh),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "glb" => Ok(ExportFormat::Glb),
            "obj" => Ok(ExportFormat::Obj),
            "stl" => Ok(ExportFormat::Stl),
            "ply" => Ok(ExportFormat::Ply),
            other => Err(MeshError::Unsupported(format!("export type `{other}`"))),
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

fn to_obj(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    mesh.validate()?;
    let mut out = String::new();
    for (i, p) in mesh.positions.iter().enumerate() {
        match &mesh.colors {
            // 非标准但被广泛支持的顶点色扩展
            Some(colors) => {
                let [r, g, b, _] = colors[i].map(|c| c as f32 / 255.0);
                let _ = writeln!(out, "v {} {} {} {r:.4} {g:.4} {b:.4}", p[0], p[1], p[2]);
            }
            None => {
                let _ = writeln!(out, "v {} {} {}", p[0], p[1], p[2]);
            }
        }
    }
    for f in &mesh.faces {
        let _ = writeln!(out, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1);
    }
    Ok(out.into_bytes())
}

fn to_binary_stl(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    mesh.validate()?;
    let mut out = Vec::with_capacity(84 + mesh.faces.len() * 50);
    let mut header = [0u8; 80];
    let label = b"meshgen-server binary STL";
    header[..label.len()].copy_from_slice(label);
    out.extend_from_slice(&header);
    out.extend_from_slice(&(mesh.faces.len() as u32).to_le_bytes());

    for face in &mesh.faces {
        for v in mesh.face_normal(face) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for &i in face {
            for v in mesh.positions[i as usize] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }
    Ok(out)
}

fn to_ascii_ply(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    mesh.validate()?;
    let mut out = String::new();
    let _ = writeln!(out, "ply\nformat ascii 1.0");
    let _ = writeln!(out, "element vertex {}", mesh.positions.len());
    let _ = writeln!(out, "property float x\nproperty float y\nproperty float z");
    if mesh.colors.is_some() {
        let _ = writeln!(
            out,
            "property uchar red\nproperty uchar green\nproperty uchar blue\nproperty uchar alpha"
        );
    }
    let _ = writeln!(out, "element face {}", mesh.faces.len());
    let _ = writeln!(out, "property list uchar int vertex_indices\nend_header");

    for (i, p) in mesh.positions.iter().enumerate() {
        match &mesh.colors {
            Some(colors) => {
                let [r, g, b, a] = colors[i];
                let _ = writeln!(out, "{} {} {} {r} {g} {b} {a}", p[0], p[1], p[2]);
            }
            None => {
                let _ = writeln!(out, "{} {} {}", p[0], p[1], p[2]);
            }
        }
    }
    for f in &mesh.faces {
        let _ = writeln!(out, "3 {} {} {}", f[0], f[1], f[2]);
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::cube;

    #[test]
    fn parses_known_types() {
        assert_eq!("glb".parse::<ExportFormat>().unwrap(), ExportFormat::Glb);
        assert_eq!(".OBJ".parse::<ExportFormat>().unwrap(), ExportFormat::Obj);
        assert_eq!("stl".parse::<ExportFormat>().unwrap(), ExportFormat::Stl);
        assert!("fbx".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::default().extension(), "glb");
    }

    #[test]
    fn obj_has_one_based_faces() {
        let text = String::from_utf8(ExportFormat::Obj.encode(&cube([0.0; 3], 1.0)).unwrap()).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("v ")).count(), 8);
        assert!(text.lines().any(|l| l == "f 1 3 2"));
        assert!(!text.lines().any(|l| l.starts_with("f ") && l.contains(" 0")));
    }

    #[test]
    fn stl_size_matches_face_count() {
        let bytes = ExportFormat::Stl.encode(&cube([0.0; 3], 1.0)).unwrap();
        assert_eq!(bytes.len(), 84 + 12 * 50);
        assert_eq!(u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]), 12);
    }

    #[test]
    fn ply_header_declares_colors() {
        let mut mesh = cube([0.0; 3], 1.0);
        mesh.colors = Some(vec![[1, 2, 3, 255]; 8]);
        let text = String::from_utf8(ExportFormat::Ply.encode(&mesh).unwrap()).unwrap();
        assert!(text.contains("element vertex 8"));
        assert!(text.contains("property uchar red"));
        assert!(text.contains("element face 12"));
    }
}

//! glTF 2.0 二进制（GLB）读写，只覆盖三角网格需要的那一部分。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Mesh, MeshError};

const MAGIC: u32 = 0x4654_6C67; // "glTF"
const VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const FLOAT: u32 = 5126;
const UNSIGNED_BYTE: u32 = 5121;
const UNSIGNED_SHORT: u32 = 5123;
const UNSIGNED_INT: u32 = 5125;

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const MODE_TRIANGLES: u32 = 4;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    asset: Asset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scene: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scenes: Vec<Scene>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    nodes: Vec<Node>,
    #[serde(default)]
    meshes: Vec<MeshDef>,
    #[serde(default)]
    accessors: Vec<Accessor>,
    #[serde(default)]
    buffer_views: Vec<BufferView>,
    #[serde(default)]
    buffers: Vec<Buffer>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Asset {
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generator: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Scene {
    nodes: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mesh: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MeshDef {
    primitives: Vec<Primitive>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Primitive {
    attributes: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    indices: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buffer_view: Option<usize>,
    #[serde(default)]
    byte_offset: usize,
    component_type: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    normalized: bool,
    count: usize,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: usize,
    #[serde(default)]
    byte_offset: usize,
    byte_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    byte_stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Buffer {
    byte_length: usize,
}

/// 把网格编码为单个 GLB 文件
pub fn encode(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    mesh.validate()?;

    let mut bin = Vec::new();
    let mut doc = Document {
        asset: Asset {
            version: "2.0".to_string(),
            generator: Some(concat!("meshgen-server ", env!("CARGO_PKG_VERSION")).to_string()),
        },
        scene: Some(0),
        scenes: vec![Scene { nodes: vec![0] }],
        nodes: vec![Node { mesh: Some(0) }],
        ..Default::default()
    };

    let (min, max) = mesh.bounds().unwrap_or(([0.0; 3], [0.0; 3]));
    let positions = push_view(&mut bin, &mut doc, ARRAY_BUFFER, |out| {
        for p in &mesh.positions {
            for v in p {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    });
    doc.accessors.push(Accessor {
        buffer_view: Some(positions),
        byte_offset: 0,
        component_type: FLOAT,
        normalized: false,
        count: mesh.positions.len(),
        kind: "VEC3".to_string(),
        min: Some(min.to_vec()),
        max: Some(max.to_vec()),
    });

    let indices = push_view(&mut bin, &mut doc, ELEMENT_ARRAY_BUFFER, |out| {
        for f in &mesh.faces {
            for i in f {
                out.extend_from_slice(&i.to_le_bytes());
            }
        }
    });
    doc.accessors.push(Accessor {
        buffer_view: Some(indices),
        byte_offset: 0,
        component_type: UNSIGNED_INT,
        normalized: false,
        count: mesh.faces.len() * 3,
        kind: "SCALAR".to_string(),
        min: None,
        max: None,
    });

    let mut attributes = BTreeMap::from([("POSITION".to_string(), 0)]);
    if let Some(colors) = &mesh.colors {
        let view = push_view(&mut bin, &mut doc, ARRAY_BUFFER, |out| {
            for c in colors {
                out.extend_from_slice(c);
            }
        });
        attributes.insert("COLOR_0".to_string(), doc.accessors.len());
        doc.accessors.push(Accessor {
            buffer_view: Some(view),
            byte_offset: 0,
            component_type: UNSIGNED_BYTE,
            normalized: true,
            count: colors.len(),
            kind: "VEC4".to_string(),
            min: None,
            max: None,
        });
    }

    doc.meshes.push(MeshDef {
        primitives: vec![Primitive {
            attributes,
            indices: Some(1),
            mode: Some(MODE_TRIANGLES),
        }],
    });
    doc.buffers.push(Buffer {
        byte_length: bin.len(),
    });

    let mut json = serde_json::to_vec(&doc)?;
    pad_to_four(&mut json, b' ');

    let total = 12 + 8 + json.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);
    Ok(out)
}

// 追加一个 4 字节对齐的 bufferView，返回它的下标
fn push_view(
    bin: &mut Vec<u8>,
    doc: &mut Document,
    target: u32,
    write: impl FnOnce(&mut Vec<u8>),
) -> usize {
    let offset = bin.len();
    write(bin);
    let length = bin.len() - offset;
    pad_to_four(bin, 0);
    doc.buffer_views.push(BufferView {
        buffer: 0,
        byte_offset: offset,
        byte_length: length,
        byte_stride: None,
        target: Some(target),
    });
    doc.buffer_views.len() - 1
}

fn pad_to_four(buf: &mut Vec<u8>, fill: u8) {
    while buf.len() % 4 != 0 {
        buf.push(fill);
    }
}

/// 读取第一个 mesh 的全部三角形 primitive，合并为一个网格。节点变换被忽略。
pub fn decode(bytes: &[u8]) -> Result<Mesh, MeshError> {
    if bytes.len() < 20 {
        return Err(MeshError::Malformed("file shorter than GLB header".into()));
    }
    if read_u32(bytes, 0)? != MAGIC {
        return Err(MeshError::Malformed("bad GLB magic".into()));
    }
    let version = read_u32(bytes, 4)?;
    if version != VERSION {
        return Err(MeshError::Unsupported(format!("GLB version {version}")));
    }

    let mut json_chunk = None;
    let mut bin_chunk: &[u8] = &[];
    let mut cursor = 12;
    while cursor + 8 <= bytes.len() {
        let length = read_u32(bytes, cursor)? as usize;
        let kind = read_u32(bytes, cursor + 4)?;
        let start = cursor + 8;
        let end = start
            .checked_add(length)
            .ok_or_else(|| MeshError::Malformed("chunk runs past end of file".into()))?;
        let chunk = bytes
            .get(start..end)
            .ok_or_else(|| MeshError::Malformed("chunk runs past end of file".into()))?;
        match kind {
            CHUNK_JSON => json_chunk = Some(chunk),
            CHUNK_BIN => bin_chunk = chunk,
            _ => {}
        }
        cursor = end;
    }

    let json = json_chunk.ok_or_else(|| MeshError::Malformed("missing JSON chunk".into()))?;
    let doc: Document = serde_json::from_slice(json)?;
    let mesh_def = doc
        .meshes
        .first()
        .ok_or_else(|| MeshError::Malformed("document has no meshes".into()))?;

    let mut mesh = Mesh::default();
    let mut colors: Vec<[u8; 4]> = Vec::new();
    let mut any_colors = false;

    for primitive in &mesh_def.primitives {
        let mode = primitive.mode.unwrap_or(MODE_TRIANGLES);
        if mode != MODE_TRIANGLES {
            return Err(MeshError::Unsupported(format!("primitive mode {mode}")));
        }
        let position = *primitive
            .attributes
            .get("POSITION")
            .ok_or_else(|| MeshError::Malformed("primitive without POSITION".into()))?;

        let base = mesh.positions.len();
        let positions = read_vec3_f32(&doc, bin_chunk, position)?;
        let count = positions.len();
        mesh.positions.extend(positions);

        match primitive.attributes.get("COLOR_0") {
            Some(&accessor) => {
                any_colors = true;
                colors.extend(read_colors(&doc, bin_chunk, accessor, count)?);
            }
            None => colors.extend(std::iter::repeat([255, 255, 255, 255]).take(count)),
        }

        let indices = match primitive.indices {
            Some(accessor) => read_indices(&doc, bin_chunk, accessor)?,
            None => (0..count as u32).collect(),
        };
        if indices.len() % 3 != 0 {
            return Err(MeshError::Malformed(format!(
                "{} indices do not form triangles",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= count) {
            return Err(MeshError::Malformed(format!(
                "index {bad} out of range for {count} vertices"
            )));
        }
        // 单个 primitive 的下标已在范围内，累计顶点数超出 u32 时才会溢出
        let base = u32::try_from(base)
            .ok()
            .filter(|b| b.checked_add(count as u32).is_some())
            .ok_or_else(|| MeshError::Malformed("too many vertices for u32 indices".into()))?;
        mesh.faces.extend(
            indices
                .chunks_exact(3)
                .map(|t| [t[0] + base, t[1] + base, t[2] + base]),
        );
    }

    if any_colors {
        mesh.colors = Some(colors);
    }
    mesh.validate()?;
    Ok(mesh)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, MeshError> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| MeshError::Malformed(format!("truncated at byte {at}")))
}

/// 按 stride 切出 accessor 的每个元素
fn elements<'a>(
    doc: &Document,
    bin: &'a [u8],
    index: usize,
    element_size: usize,
) -> Result<Vec<&'a [u8]>, MeshError> {
    let acc = accessor(doc, index)?;
    let view_index = acc
        .buffer_view
        .ok_or_else(|| MeshError::Unsupported("sparse or empty accessors".into()))?;
    let view = doc
        .buffer_views
        .get(view_index)
        .ok_or_else(|| MeshError::Malformed(format!("bufferView {view_index} missing")))?;
    if view.buffer != 0 {
        return Err(MeshError::Unsupported("external buffers".into()));
    }

    let stride = view.byte_stride.unwrap_or(element_size);
    if stride < element_size {
        return Err(MeshError::Malformed(format!(
            "bufferView {view_index} stride {stride} is smaller than its elements"
        )));
    }
    let overrun = || MeshError::Malformed(format!("accessor {index} overruns its bufferView"));
    let view_end = view
        .byte_offset
        .checked_add(view.byte_length)
        .filter(|&end| end <= bin.len())
        .ok_or_else(|| MeshError::Malformed("bufferView overruns BIN chunk".into()))?;
    let start = view
        .byte_offset
        .checked_add(acc.byte_offset)
        .ok_or_else(overrun)?;

    // 先确认最后一个元素落在 bufferView 内，再按 count 分配
    if acc.count > 0 {
        let last_end = (acc.count - 1)
            .checked_mul(stride)
            .and_then(|span| span.checked_add(start))
            .and_then(|at| at.checked_add(element_size))
            .ok_or_else(overrun)?;
        if last_end > view_end {
            return Err(overrun());
        }
    }

    let mut out = Vec::with_capacity(acc.count);
    for i in 0..acc.count {
        let at = start + i * stride;
        out.push(&bin[at..at + element_size]);
    }
    Ok(out)
}

fn accessor(doc: &Document, index: usize) -> Result<&Accessor, MeshError> {
    doc.accessors
        .get(index)
        .ok_or_else(|| MeshError::Malformed(format!("accessor {index} missing")))
}

fn read_vec3_f32(doc: &Document, bin: &[u8], index: usize) -> Result<Vec<[f32; 3]>, MeshError> {
    let acc = accessor(doc, index)?;
    if acc.component_type != FLOAT || acc.kind != "VEC3" {
        return Err(MeshError::Unsupported(
            "POSITION must be VEC3 of f32".into(),
        ));
    }
    let items = elements(doc, bin, index, 12)?;
    Ok(items
        .into_iter()
        .map(|e| [0, 4, 8].map(|o| f32::from_le_bytes([e[o], e[o + 1], e[o + 2], e[o + 3]])))
        .collect())
}

fn read_indices(doc: &Document, bin: &[u8], index: usize) -> Result<Vec<u32>, MeshError> {
    let acc = accessor(doc, index)?;
    let size = match acc.component_type {
        UNSIGNED_BYTE => 1,
        UNSIGNED_SHORT => 2,
        UNSIGNED_INT => 4,
        other => return Err(MeshError::Unsupported(format!("index component type {other}"))),
    };
    let items = elements(doc, bin, index, size)?;
    Ok(items
        .into_iter()
        .map(|e| match size {
            1 => e[0] as u32,
            2 => u16::from_le_bytes([e[0], e[1]]) as u32,
            _ => u32::from_le_bytes([e[0], e[1], e[2], e[3]]),
        })
        .collect())
}

fn read_colors(
    doc: &Document,
    bin: &[u8],
    index: usize,
    expected: usize,
) -> Result<Vec<[u8; 4]>, MeshError> {
    let acc = accessor(doc, index)?;
    let components = match acc.kind.as_str() {
        "VEC3" => 3,
        "VEC4" => 4,
        other => return Err(MeshError::Unsupported(format!("COLOR_0 type {other}"))),
    };
    let component_size = match acc.component_type {
        UNSIGNED_BYTE => 1,
        UNSIGNED_SHORT => 2,
        FLOAT => 4,
        other => return Err(MeshError::Unsupported(format!("COLOR_0 component type {other}"))),
    };
    let items = elements(doc, bin, index, components * component_size)?;
    if items.len() != expected {
        return Err(MeshError::Malformed("COLOR_0 count differs from POSITION".into()));
    }

    Ok(items
        .into_iter()
        .map(|e| {
            let mut rgba = [255u8; 4];
            for (c, slot) in rgba.iter_mut().enumerate().take(components) {
                let at = c * component_size;
                *slot = match component_size {
                    1 => e[at],
                    2 => (u16::from_le_bytes([e[at], e[at + 1]]) >> 8) as u8,
                    _ => {
                        let v = f32::from_le_bytes([e[at], e[at + 1], e[at + 2], e[at + 3]]);
                        (v.clamp(0.0, 1.0) * 255.0).round() as u8
                    }
                };
            }
            rgba
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::fixtures::cube;

    #[test]
    fn header_and_chunks_are_aligned() {
        let bytes = encode(&cube([0.0; 3], 1.0)).unwrap();
        assert_eq!(&bytes[0..4], b"glTF");
        assert_eq!(read_u32(&bytes, 8).unwrap() as usize, bytes.len());
        let json_len = read_u32(&bytes, 12).unwrap() as usize;
        assert_eq!(json_len % 4, 0);
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn decode_restores_geometry_and_colors() {
        let mut mesh = cube([-0.5; 3], 1.0);
        mesh.colors = Some((0..8).map(|i| [i * 10, 0, 255, 255]).collect());

        let decoded = decode(&encode(&mesh).unwrap()).unwrap();
        assert_eq!(decoded, mesh);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode(b"not a glb at all, sorry"), Err(MeshError::Malformed(_))));
        assert!(decode(&[]).is_err());
    }

    // 手工拼一个 GLB，JSON 内容由测试决定
    fn raw_glb(doc: serde_json::Value, bin: &[u8]) -> Vec<u8> {
        let mut json = serde_json::to_vec(&doc).unwrap();
        pad_to_four(&mut json, b' ');
        let mut bin = bin.to_vec();
        pad_to_four(&mut bin, 0);
        let total = 12 + 8 + json.len() + 8 + bin.len();
        let mut out = Vec::new();
        for word in [MAGIC, VERSION, total as u32, json.len() as u32, CHUNK_JSON] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&json);
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
        out.extend_from_slice(&bin);
        out
    }

    fn triangle_bin(extra_indices: &[u32]) -> Vec<u8> {
        let mut bin = Vec::new();
        for v in [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bin.extend_from_slice(&v.to_le_bytes());
        }
        for i in [0u32, 1, 2].iter().chain(extra_indices) {
            bin.extend_from_slice(&i.to_le_bytes());
        }
        bin
    }

    fn position_doc(count: u64, byte_offset: u64) -> serde_json::Value {
        serde_json::json!({
            "asset": { "version": "2.0" },
            "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 } }] }],
            "accessors": [{
                "bufferView": 0,
                "byteOffset": byte_offset,
                "componentType": FLOAT,
                "count": count,
                "type": "VEC3"
            }],
            "bufferViews": [{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }],
            "buffers": [{ "byteLength": 36 }]
        })
    }

    #[test]
    fn decode_accepts_hand_built_triangle() {
        let mesh = decode(&raw_glb(position_doc(3, 0), &triangle_bin(&[]))).unwrap();
        assert_eq!(mesh.faces, vec![[0, 1, 2]]);
    }

    #[test]
    fn decode_rejects_count_larger_than_view() {
        let bytes = raw_glb(position_doc(1_000_000_000_000, 0), &triangle_bin(&[]));
        assert!(matches!(decode(&bytes), Err(MeshError::Malformed(_))));

        let bytes = raw_glb(position_doc(u64::MAX, 0), &triangle_bin(&[]));
        assert!(matches!(decode(&bytes), Err(MeshError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_overflowing_byte_offset() {
        let bytes = raw_glb(position_doc(3, u64::MAX), &triangle_bin(&[]));
        assert!(matches!(decode(&bytes), Err(MeshError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_index_outside_its_primitive() {
        let doc = serde_json::json!({
            "asset": { "version": "2.0" },
            "meshes": [{ "primitives": [
                { "attributes": { "POSITION": 0 }, "indices": 1 },
                { "attributes": { "POSITION": 0 }, "indices": 2 }
            ] }],
            "accessors": [
                { "bufferView": 0, "componentType": FLOAT, "count": 3, "type": "VEC3" },
                { "bufferView": 1, "componentType": UNSIGNED_INT, "count": 3, "type": "SCALAR" },
                { "bufferView": 2, "componentType": UNSIGNED_INT, "count": 3, "type": "SCALAR" }
            ],
            "bufferViews": [
                { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
                { "buffer": 0, "byteOffset": 36, "byteLength": 12 },
                { "buffer": 0, "byteOffset": 48, "byteLength": 12 }
            ],
            "buffers": [{ "byteLength": 60 }]
        });

        // 第二个 primitive 的 u32::MAX 下标不能借 base 回绕到第一个 primitive
        let bytes = raw_glb(doc.clone(), &triangle_bin(&[0, 1, u32::MAX]));
        assert!(matches!(decode(&bytes), Err(MeshError::Malformed(_))));

        let bytes = raw_glb(doc.clone(), &triangle_bin(&[0, 1, 3]));
        assert!(matches!(decode(&bytes), Err(MeshError::Malformed(_))));

        let mesh = decode(&raw_glb(doc, &triangle_bin(&[2, 1, 0]))).unwrap();
        assert_eq!(mesh.faces, vec![[0, 1, 2], [5, 4, 3]]);
    }

    #[test]
    fn decode_rejects_truncated_file() {
        let bytes = encode(&cube([0.0; 3], 1.0)).unwrap();
        assert!(decode(&bytes[..bytes.len() - 40]).is_err());
    }
}

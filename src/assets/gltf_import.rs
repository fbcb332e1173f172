//! Conversion of a glTF document into the owned scene graph.

use std::collections::HashMap;
use std::path::Path;

use glam::{Quat, Vec3};
use gltf::animation::util::ReadOutputs;
use serde_json::Value;

use super::draco::{self, AttributeKind, DracoAttribute, DracoMesh};
use super::AssetError;
use crate::animation::{AnimationClip, Channel, ChannelValues, Interpolation};
use crate::camera::EmbeddedCamera;
use crate::scene::{
    Geometry, Image, Material, MaterialId, Node, NodeId, NodeRole, RoleMarkers, SceneGraph, Side,
    TextureMap, TextureSource, Transform,
};

const DRACO_EXTENSION: &str = "KHR_draco_mesh_compression";

pub struct ImportedScene {
    pub graph: SceneGraph,
    /// Synthetic node holding the glTF scene's root nodes.
    pub model_root: NodeId,
    pub clips: Vec<AnimationClip>,
    pub cameras: Vec<EmbeddedCamera>,
}

pub fn import_gltf(
    bytes: &[u8],
    base_dir: Option<&Path>,
    markers: &RoleMarkers,
) -> Result<ImportedScene, AssetError> {
    let gltf = gltf::Gltf::from_slice_without_validation(bytes)
        .map_err(|err| AssetError::Parse(err.to_string()))?;
    let blob = gltf.blob;
    let mut root = gltf.document.into_json();
    // Draco primitives are decoded here; validate everything else as usual.
    root.extensions_required
        .retain(|extension| extension != DRACO_EXTENSION);
    let document =
        gltf::Document::from_json(root).map_err(|err| AssetError::Parse(err.to_string()))?;
    if document
        .extensions_used()
        .any(|extension| extension == DRACO_EXTENSION)
    {
        log::debug!("Scene uses {}", DRACO_EXTENSION);
    }

    let buffers = gltf::import_buffers(&document, base_dir, blob)
        .map_err(|err| AssetError::Resources(err.to_string()))?;
    let images = gltf::import_images(&document, base_dir, &buffers)
        .map_err(|err| AssetError::Resources(err.to_string()))?;

    let mut builder = Builder {
        graph: SceneGraph::new(),
        document: &document,
        markers,
        buffers: &buffers,
        materials: HashMap::new(),
        node_ids: HashMap::new(),
        image_ids: Vec::new(),
        skipped_primitives: 0,
    };
    for (index, image) in images.iter().enumerate() {
        let id = builder.graph.add_image(Image {
            name: format!("image_{index}"),
            width: image.width,
            height: image.height,
            pixels: to_rgba8(image),
        });
        builder.image_ids.push(id);
    }

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or(AssetError::NoScene)?;
    let model_root = builder.graph.add_node(
        Node::new(scene.name().unwrap_or("Scene")),
        None,
    );
    for node in scene.nodes() {
        builder.add_node(&node, model_root);
    }
    if builder.skipped_primitives > 0 {
        log::warn!(
            "Skipped {} primitives without decodable positions",
            builder.skipped_primitives
        );
    }

    let cameras = builder.cameras(&scene);
    let clips = document
        .animations()
        .filter_map(|animation| builder.clip(&animation))
        .collect();

    Ok(ImportedScene {
        graph: builder.graph,
        model_root,
        clips,
        cameras,
    })
}

struct Builder<'a> {
    graph: SceneGraph,
    document: &'a gltf::Document,
    markers: &'a RoleMarkers,
    buffers: &'a [gltf::buffer::Data],
    materials: HashMap<Option<usize>, MaterialId>,
    node_ids: HashMap<usize, NodeId>,
    image_ids: Vec<crate::scene::ImageId>,
    skipped_primitives: usize,
}

impl Builder<'_> {
    fn add_node(&mut self, source: &gltf::Node, parent: NodeId) {
        let name = source.name().unwrap_or_default().to_string();
        let extras = parse_extras(source.extras());
        let (translation, rotation, scale) = source.transform().decomposed();

        let mut node = Node::new(name.clone());
        node.transform = Transform {
            translation: Vec3::from_array(translation),
            rotation: Quat::from_array(rotation),
            scale: Vec3::from_array(scale),
        };
        node.role = self.markers.classify(&name, extras.as_ref());
        node.extras = extras;
        let role = node.role;
        let id = self.graph.add_node(node, Some(parent));
        self.node_ids.insert(source.index(), id);

        if let Some(mesh) = source.mesh() {
            let primitives: Vec<_> = mesh
                .primitives()
                .filter_map(|primitive| self.primitive(&primitive))
                .collect();
            if primitives.len() == 1 {
                if let Some(node) = self.graph.node_mut(id) {
                    node.geometry = Some(primitives[0].0);
                    node.material = Some(primitives[0].1);
                }
            } else {
                // One child per primitive; the anchor role stays on the parent only.
                let child_role = if role == NodeRole::CameraAnchor {
                    NodeRole::Generic
                } else {
                    role
                };
                for (index, (geometry, material)) in primitives.into_iter().enumerate() {
                    let mut child = Node::new(format!("{name}.{index}"));
                    child.geometry = Some(geometry);
                    child.material = Some(material);
                    child.role = child_role;
                    self.graph.add_node(child, Some(id));
                }
            }
        }

        for child in source.children() {
            self.add_node(&child, id);
        }
    }

    fn primitive(
        &mut self,
        primitive: &gltf::Primitive,
    ) -> Option<(crate::scene::GeometryId, MaterialId)> {
        if primitive.mode() != gltf::mesh::Mode::Triangles {
            log::warn!("Skipping non-triangle primitive ({:?})", primitive.mode());
            return None;
        }
        let arrays = match primitive.extension_value(DRACO_EXTENSION) {
            Some(extension) => self.draco_arrays(extension),
            None => self.accessor_arrays(primitive),
        };
        let Some(VertexArrays {
            positions,
            indices,
            normals,
            uvs,
        }) = arrays
        else {
            self.skipped_primitives += 1;
            return None;
        };

        let mut geometry = Geometry::new(positions, indices);
        if let Some(normals) = normals {
            geometry.normals = normals;
        }
        geometry.uvs = uvs;
        let geometry = self.graph.add_geometry(geometry);
        let material = self.material(&primitive.material());
        Some((geometry, material))
    }

    fn accessor_arrays(&self, primitive: &gltf::Primitive) -> Option<VertexArrays> {
        let buffers = self.buffers;
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
        let positions: Vec<[f32; 3]> = reader.read_positions()?.collect();
        let indices: Vec<u32> = match reader.read_indices() {
            Some(indices) => indices.into_u32().collect(),
            None => (0..positions.len() as u32).collect(),
        };
        let normals = reader
            .read_normals()
            .map(|normals| normals.collect::<Vec<_>>())
            .filter(|normals| normals.len() == positions.len());
        let uvs = reader
            .read_tex_coords(0)
            .map(|uvs| uvs.into_f32().collect::<Vec<_>>())
            .filter(|uvs| uvs.len() == positions.len());
        Some(VertexArrays {
            positions,
            indices,
            normals,
            uvs,
        })
    }

    /// Decodes the compressed payload the extension points at; its attributes
    /// map glTF semantics to Draco attribute ids.
    fn draco_arrays(&self, extension: &Value) -> Option<VertexArrays> {
        let mesh = match self.decode_draco(extension) {
            Ok(mesh) => mesh,
            Err(err) => {
                log::warn!("Skipping compressed primitive: {}", err);
                return None;
            }
        };
        let Some(positions) = draco_attribute(&mesh, extension, "POSITION", AttributeKind::Position)
            .and_then(DracoAttribute::to_vec3)
        else {
            log::warn!("Compressed primitive has no decodable POSITION");
            return None;
        };
        let normals = draco_attribute(&mesh, extension, "NORMAL", AttributeKind::Normal)
            .and_then(DracoAttribute::to_vec3);
        let uvs = draco_attribute(&mesh, extension, "TEXCOORD_0", AttributeKind::TexCoord)
            .and_then(DracoAttribute::to_vec2);
        let indices = if mesh.indices.is_empty() {
            (0..positions.len() as u32).collect()
        } else {
            mesh.indices.clone()
        };
        Some(VertexArrays {
            positions,
            indices,
            normals,
            uvs,
        })
    }

    fn decode_draco(&self, extension: &Value) -> Result<DracoMesh, AssetError> {
        let view = extension
            .get("bufferView")
            .and_then(Value::as_u64)
            .and_then(|index| self.document.views().nth(index as usize))
            .ok_or_else(|| AssetError::Parse(format!("{} has no valid bufferView", DRACO_EXTENSION)))?;
        let bytes = self
            .buffers
            .get(view.buffer().index())
            .and_then(|data| data.0.get(view.offset()..view.offset() + view.length()))
            .ok_or_else(|| AssetError::Resources(format!("bufferView {} is out of range", view.index())))?;
        Ok(draco::decode_mesh(bytes)?)
    }

    fn material(&mut self, source: &gltf::Material) -> MaterialId {
        if let Some(id) = self.materials.get(&source.index()) {
            return *id;
        }
        let pbr = source.pbr_metallic_roughness();
        let map = pbr.base_color_texture().and_then(|info| {
            let image = self.image_ids.get(info.texture().source().index())?;
            Some(TextureMap {
                source: TextureSource::Image(*image),
                flip_y: false,
            })
        });
        let video_texture_paths = parse_extras(source.extras())
            .as_ref()
            .and_then(|extras| extras.get("video_texture_paths"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let base_color = pbr.base_color_factor();
        let material = Material {
            name: source.name().unwrap_or_default().to_string(),
            base_color,
            map,
            transparent: source.alpha_mode() == gltf::material::AlphaMode::Blend,
            opacity: base_color[3],
            side: if source.double_sided() {
                Side::Double
            } else {
                Side::Front
            },
            video_texture_paths,
        };
        let id = self.graph.add_material(material);
        self.materials.insert(source.index(), id);
        id
    }

    fn cameras(&self, scene: &gltf::Scene) -> Vec<EmbeddedCamera> {
        let mut cameras = Vec::new();
        let mut stack: Vec<gltf::Node> = scene.nodes().collect();
        stack.reverse();
        while let Some(node) = stack.pop() {
            if let Some(camera) = node.camera() {
                if let Some(embedded) = self.embedded_camera(&node, &camera) {
                    cameras.push(embedded);
                }
            }
            let mut children: Vec<_> = node.children().collect();
            children.reverse();
            stack.extend(children);
        }
        cameras
    }

    fn embedded_camera(&self, node: &gltf::Node, camera: &gltf::Camera) -> Option<EmbeddedCamera> {
        let gltf::camera::Projection::Perspective(perspective) = camera.projection() else {
            log::warn!(
                "Ignoring orthographic camera {}",
                camera.name().unwrap_or_default()
            );
            return None;
        };
        let id = *self.node_ids.get(&node.index())?;
        let world = Transform::from_matrix(self.graph.world_matrix(id));
        let delta = parse_extras(node.extras())
            .as_ref()
            .and_then(read_delta)
            .or_else(|| parse_extras(camera.extras()).as_ref().and_then(read_delta));
        Some(EmbeddedCamera {
            name: camera
                .name()
                .or(node.name())
                .unwrap_or_default()
                .to_string(),
            fov_deg: perspective.yfov().to_degrees(),
            near: perspective.znear(),
            far: perspective.zfar(),
            aspect: perspective.aspect_ratio(),
            position: world.translation,
            rotation: world.rotation,
            delta,
        })
    }

    fn clip(&self, animation: &gltf::Animation) -> Option<AnimationClip> {
        let buffers = self.buffers;
        let mut channels = Vec::new();
        for channel in animation.channels() {
            let Some(target) = self.node_ids.get(&channel.target().node().index()).copied() else {
                continue;
            };
            let interpolation = match channel.sampler().interpolation() {
                gltf::animation::Interpolation::Step => Interpolation::Step,
                gltf::animation::Interpolation::Linear => Interpolation::Linear,
                gltf::animation::Interpolation::CubicSpline => Interpolation::CubicSpline,
            };
            let reader = channel.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
            let Some(times) = reader.read_inputs().map(|inputs| inputs.collect::<Vec<f32>>()) else {
                continue;
            };
            let values = match reader.read_outputs() {
                Some(ReadOutputs::Translations(values)) => {
                    ChannelValues::Translation(spline_values(values.map(Vec3::from_array), interpolation))
                }
                Some(ReadOutputs::Rotations(values)) => ChannelValues::Rotation(spline_values(
                    values.into_f32().map(Quat::from_array),
                    interpolation,
                )),
                Some(ReadOutputs::Scales(values)) => {
                    ChannelValues::Scale(spline_values(values.map(Vec3::from_array), interpolation))
                }
                Some(ReadOutputs::MorphTargetWeights(_)) | None => continue,
            };
            channels.push(Channel {
                target,
                times,
                values,
                interpolation,
            });
        }
        if channels.is_empty() {
            return None;
        }
        Some(AnimationClip {
            name: animation.name().unwrap_or("clip").to_string(),
            channels,
        })
    }
}

struct VertexArrays {
    positions: Vec<[f32; 3]>,
    indices: Vec<u32>,
    normals: Option<Vec<[f32; 3]>>,
    uvs: Option<Vec<[f32; 2]>>,
}

fn draco_attribute<'m>(
    mesh: &'m DracoMesh,
    extension: &Value,
    semantic: &str,
    kind: AttributeKind,
) -> Option<&'m DracoAttribute> {
    let id = extension.get("attributes")?.get(semantic)?.as_u64()?;
    let attribute = mesh.attribute(u32::try_from(id).ok()?)?;
    if attribute.kind != kind {
        log::warn!("Draco attribute {} for {} is a {:?}", id, semantic, attribute.kind);
    }
    (attribute.values.len() == mesh.num_points * attribute.components).then_some(attribute)
}

/// Cubic spline outputs come as (in-tangent, value, out-tangent) triples; keep the value.
fn spline_values<T>(values: impl Iterator<Item = T>, interpolation: Interpolation) -> Vec<T> {
    match interpolation {
        Interpolation::CubicSpline => values.skip(1).step_by(3).collect(),
        Interpolation::Step | Interpolation::Linear => values.collect(),
    }
}

fn parse_extras(extras: &gltf::json::Extras) -> Option<Value> {
    let raw = extras.as_ref()?;
    match serde_json::from_str(raw.get()) {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("Ignoring malformed extras: {}", err);
            None
        }
    }
}

fn read_delta(extras: &Value) -> Option<Vec3> {
    let values = extras.get("random_delta_transform")?.as_array()?;
    match values.as_slice() {
        [x, y, z] => Some(Vec3::new(
            x.as_f64()? as f32,
            y.as_f64()? as f32,
            z.as_f64()? as f32,
        )),
        _ => None,
    }
}

fn to_rgba8(image: &gltf::image::Data) -> Vec<u8> {
    use gltf::image::Format;

    let pixels = &image.pixels;
    let u16_high = |chunk: &[u8]| chunk.get(1).copied().unwrap_or(0);
    let f32_byte = |chunk: &[u8]| {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        (value.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    match image.format {
        Format::R8G8B8A8 => pixels.clone(),
        Format::R8G8B8 => pixels
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        Format::R8G8 => pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[1], 0, 255])
            .collect(),
        Format::R8 => pixels.iter().flat_map(|v| [*v, *v, *v, 255]).collect(),
        Format::R16 => pixels
            .chunks_exact(2)
            .flat_map(|p| {
                let v = u16_high(p);
                [v, v, v, 255]
            })
            .collect(),
        Format::R16G16 => pixels
            .chunks_exact(4)
            .flat_map(|p| [u16_high(&p[0..2]), u16_high(&p[2..4]), 0, 255])
            .collect(),
        Format::R16G16B16 => pixels
            .chunks_exact(6)
            .flat_map(|p| [u16_high(&p[0..2]), u16_high(&p[2..4]), u16_high(&p[4..6]), 255])
            .collect(),
        Format::R16G16B16A16 => pixels
            .chunks_exact(8)
            .flat_map(|p| {
                [
                    u16_high(&p[0..2]),
                    u16_high(&p[2..4]),
                    u16_high(&p[4..6]),
                    u16_high(&p[6..8]),
                ]
            })
            .collect(),
        Format::R32G32B32FLOAT => pixels
            .chunks_exact(12)
            .flat_map(|p| [f32_byte(&p[0..4]), f32_byte(&p[4..8]), f32_byte(&p[8..12]), 255])
            .collect(),
        Format::R32G32B32A32FLOAT => pixels
            .chunks_exact(16)
            .flat_map(|p| {
                [
                    f32_byte(&p[0..4]),
                    f32_byte(&p[4..8]),
                    f32_byte(&p[8..12]),
                    f32_byte(&p[12..16]),
                ]
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubic_spline_keeps_value_component() {
        let values = spline_values([0, 1, 2, 3, 4, 5].into_iter(), Interpolation::CubicSpline);
        assert_eq!(values, vec![1, 4]);
        let values = spline_values([7, 8].into_iter(), Interpolation::Linear);
        assert_eq!(values, vec![7, 8]);
    }

    #[test]
    fn delta_requires_three_numbers() {
        let extras = serde_json::json!({ "random_delta_transform": [0.5, -1, 2] });
        assert_eq!(read_delta(&extras), Some(Vec3::new(0.5, -1.0, 2.0)));
        let extras = serde_json::json!({ "random_delta_transform": [1, 2] });
        assert_eq!(read_delta(&extras), None);
    }

    /// Packs a JSON document and binary chunk into a GLB container.
    fn glb(json: &str, bin: &[u8]) -> Vec<u8> {
        let mut json = json.as_bytes().to_vec();
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let mut bin = bin.to_vec();
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        let total = 12 + 8 + json.len() + 8 + bin.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(b"glTF");
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(b"JSON");
        out.extend_from_slice(&json);
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(b"BIN\0");
        out.extend_from_slice(&bin);
        out
    }

    fn draco_scene(payload: &[u8]) -> Vec<u8> {
        let json = format!(
            r#"{{
                "asset": {{ "version": "2.0" }},
                "extensionsUsed": ["KHR_draco_mesh_compression"],
                "extensionsRequired": ["KHR_draco_mesh_compression"],
                "scene": 0,
                "scenes": [{{ "nodes": [0] }}],
                "nodes": [{{ "name": "Tri", "mesh": 0 }}],
                "meshes": [{{ "primitives": [{{
                    "attributes": {{ "POSITION": 0, "TEXCOORD_0": 1 }},
                    "indices": 2,
                    "extensions": {{ "KHR_draco_mesh_compression": {{
                        "bufferView": 0,
                        "attributes": {{ "POSITION": 0, "TEXCOORD_0": 1 }}
                    }} }}
                }}] }}],
                "accessors": [
                    {{ "componentType": 5126, "count": 3, "type": "VEC3", "min": [0, 0, 0], "max": [1, 1, 0] }},
                    {{ "componentType": 5126, "count": 3, "type": "VEC2" }},
                    {{ "componentType": 5125, "count": 3, "type": "SCALAR" }}
                ],
                "bufferViews": [{{ "buffer": 0, "byteLength": {len} }}],
                "buffers": [{{ "byteLength": {len} }}]
            }}"#,
            len = payload.len()
        );
        glb(&json, payload)
    }

    #[test]
    fn draco_compressed_primitive_loads() {
        let bytes = draco_scene(&draco::testing::triangle());
        let scene = import_gltf(&bytes, None, &RoleMarkers::default()).unwrap();
        let node = scene.graph.find_by_name("Tri").unwrap();
        let geometry = scene
            .graph
            .node(node)
            .and_then(|node| node.geometry)
            .and_then(|id| scene.graph.geometry(id))
            .unwrap();
        assert_eq!(
            geometry.positions,
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
        );
        assert_eq!(geometry.indices, vec![0, 1, 2]);
        assert_eq!(
            geometry.uvs,
            Some(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]])
        );
        assert_eq!(geometry.normals.len(), 3);
    }

    #[test]
    fn undecodable_draco_primitive_is_skipped_not_fatal() {
        let edgebreaker = draco::testing::StreamWriter::mesh(1).0;
        let scene = import_gltf(&draco_scene(&edgebreaker), None, &RoleMarkers::default()).unwrap();
        let node = scene.graph.find_by_name("Tri").unwrap();
        assert!(scene.graph.node(node).unwrap().geometry.is_none());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            import_gltf(b"not a gltf", None, &RoleMarkers::default()),
            Err(AssetError::Parse(_))
        ));
    }
}

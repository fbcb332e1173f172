pub mod environment;
pub mod lights;

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::app::egui_host::EguiFrameOutput;
use crate::camera::Camera;
use crate::scene::bounds::Aabb;
use crate::scene::{
    Geometry, GeometryId, ImageId, Material, MaterialId, SceneGraph, Side, TextureSource,
};
use crate::video::{DecodedFrame, VideoId};
use lights::LightsUniform;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const HELPER_COLOR: [f32; 3] = [1.0, 1.0, 0.0];

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to create surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("failed to acquire frame: {0}")]
    Frame(#[from] wgpu::SurfaceError),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MeshVertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

impl MeshVertex {
    const ATTRIBUTES: [wgpu::VertexAttribute; 3] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct LineVertex {
    position: [f32; 3],
    color: [f32; 3],
}

impl LineVertex {
    const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CameraUniform {
    view_proj: [[f32; 4]; 4],
    position: [f32; 4],
}

impl CameraUniform {
    fn new(camera: &Camera) -> Self {
        Self {
            view_proj: camera.view_projection().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MaterialUniform {
    base_color: [f32; 4],
    /// x = flip_y, y = opacity.
    params: [f32; 4],
}

impl MaterialUniform {
    fn new(material: &Material) -> Self {
        let flip_y = material.map.map(|map| map.flip_y).unwrap_or(false);
        Self {
            base_color: material.base_color,
            params: [
                if flip_y { 1.0 } else { 0.0 },
                material.opacity.clamp(0.0, 1.0),
                0.0,
                0.0,
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ModelUniform {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 4],
    /// x = receive shadow.
    flags: [f32; 4],
}

impl ModelUniform {
    fn new(world: Mat4, receive_shadow: bool) -> Self {
        Self {
            model: world.to_cols_array_2d(),
            normal: world.inverse().transpose().to_cols_array_2d(),
            flags: [if receive_shadow { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
        }
    }
}

struct GpuMesh {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
    center: Vec3,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct VideoTexture {
    texture: GpuTexture,
    /// Bumped whenever the texture is recreated so bind groups follow.
    generation: u64,
}

/// Which texture a material bind group was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundTexture {
    White,
    /// A video with no decoded frame yet.
    Pending,
    Image(ImageId),
    Video(VideoId, u64),
}

struct MaterialBinding {
    key: BoundTexture,
    uniform: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

struct Draw {
    geometry: GeometryId,
    material: MaterialId,
    model_index: u32,
    transparent: bool,
    double_sided: bool,
    cast_shadow: bool,
    /// Squared distance to the camera.
    depth: f32,
}

/// What one frame needs from the app.
pub struct FrameParams<'a> {
    pub graph: Option<&'a SceneGraph>,
    pub camera: &'a Camera,
    pub lights: &'a LightsUniform,
    pub helper: Option<Aabb>,
    pub background: [f32; 3],
    pub ui: Option<&'a EguiFrameOutput>,
}

pub struct RenderContext {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    depth_view: wgpu::TextureView,

    globals_bind_group: wgpu::BindGroup,
    camera_buffer: wgpu::Buffer,
    lights_buffer: wgpu::Buffer,
    material_layout: wgpu::BindGroupLayout,
    model_layout: wgpu::BindGroupLayout,
    model_buffer: wgpu::Buffer,
    model_bind_group: wgpu::BindGroup,
    model_stride: u32,
    model_capacity: usize,

    /// Indexed by `transparent * 2 + double_sided`.
    scene_pipelines: [wgpu::RenderPipeline; 4],
    line_pipeline: wgpu::RenderPipeline,

    shadow_pipeline: wgpu::RenderPipeline,
    shadow_view: wgpu::TextureView,
    shadow_camera_buffer: wgpu::Buffer,
    shadow_bind_group: wgpu::BindGroup,

    repeat_sampler: wgpu::Sampler,
    clamp_sampler: wgpu::Sampler,
    white: GpuTexture,
    clear: GpuTexture,

    meshes: HashMap<GeometryId, GpuMesh>,
    images: HashMap<ImageId, Option<GpuTexture>>,
    videos: HashMap<VideoId, VideoTexture>,
    materials: HashMap<MaterialId, MaterialBinding>,

    egui_renderer: egui_wgpu::Renderer,
}

impl RenderContext {
    pub fn new(window: Arc<Window>, shadow_map_size: u32) -> Result<Self, RenderError> {
        pollster::block_on(Self::new_async(window, shadow_map_size))
    }

    async fn new_async(window: Arc<Window>, shadow_map_size: u32) -> Result<Self, RenderError> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(window)?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RenderError::NoAdapter)?;
        log::info!("Using GPU: {}", adapter.get_info().name);
        log::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("loopview device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|format| format.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0]);
        log::info!("Surface format: {:?}", format);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        let depth_view = create_depth_view(&device, config.width, config.height);

        let globals_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("globals layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::VERTEX_FRAGMENT, false),
                uniform_entry(1, wgpu::ShaderStages::FRAGMENT, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                },
            ],
        });
        let material_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("material layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::FRAGMENT, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let model_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("model layout"),
            entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX_FRAGMENT, true)],
        });
        let shadow_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("shadow camera layout"),
            entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX, false)],
        });

        let camera_buffer = uniform_buffer::<CameraUniform>(&device, "camera uniform");
        let lights_buffer = uniform_buffer::<LightsUniform>(&device, "lights uniform");
        let shadow_camera_buffer = uniform_buffer::<[[f32; 4]; 4]>(&device, "shadow camera");

        let shadow_size = shadow_map_size.clamp(1, device.limits().max_texture_dimension_2d);
        let shadow_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("shadow map"),
            size: wgpu::Extent3d {
                width: shadow_size,
                height: shadow_size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let shadow_view = shadow_texture.create_view(&Default::default());
        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("shadow sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });

        let globals_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("globals"),
            layout: &globals_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: camera_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: lights_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&shadow_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&shadow_sampler),
                },
            ],
        });
        let shadow_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("shadow camera"),
            layout: &shadow_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: shadow_camera_buffer.as_entire_binding(),
            }],
        });

        let alignment = device.limits().min_uniform_buffer_offset_alignment;
        let model_stride = align_to(std::mem::size_of::<ModelUniform>() as u32, alignment);
        let model_capacity = 64;
        let (model_buffer, model_bind_group) =
            create_model_storage(&device, &model_layout, model_stride, model_capacity);

        let scene_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("scene shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("scene.wgsl").into()),
        });
        let scene_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("scene pipeline layout"),
            bind_group_layouts: &[&globals_layout, &material_layout, &model_layout],
            push_constant_ranges: &[],
        });
        let scene_pipelines = [
            scene_pipeline(&device, &scene_layout, &scene_shader, format, false, false),
            scene_pipeline(&device, &scene_layout, &scene_shader, format, false, true),
            scene_pipeline(&device, &scene_layout, &scene_shader, format, true, false),
            scene_pipeline(&device, &scene_layout, &scene_shader, format, true, true),
        ];

        let shadow_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("shadow shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shadow.wgsl").into()),
        });
        let shadow_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("shadow pipeline layout"),
                bind_group_layouts: &[&shadow_layout, &model_layout],
                push_constant_ranges: &[],
            });
        let shadow_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("shadow pipeline"),
            layout: Some(&shadow_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shadow_shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: None,
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState {
                    constant: 2,
                    slope_scale: 2.0,
                    clamp: 0.0,
                },
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let line_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("line shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("lines.wgsl").into()),
        });
        let line_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("line pipeline layout"),
            bind_group_layouts: &[&globals_layout],
            push_constant_ranges: &[],
        });
        let line_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("line pipeline"),
            layout: Some(&line_layout),
            vertex: wgpu::VertexState {
                module: &line_shader,
                entry_point: Some("vs_main"),
                buffers: &[LineVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &line_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::LineList,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: false,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let repeat_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("repeat sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let clamp_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("clamp sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let white = create_texture(&device, "white", 1, 1);
        write_rgba(&queue, &white, &[255, 255, 255, 255]);
        let clear = create_texture(&device, "pending video", 1, 1);
        write_rgba(&queue, &clear, &[0, 0, 0, 0]);

        let egui_renderer = egui_wgpu::Renderer::new(&device, format, None, 1, false);

        Ok(Self {
            surface,
            device,
            queue,
            config,
            depth_view,
            globals_bind_group,
            camera_buffer,
            lights_buffer,
            material_layout,
            model_layout,
            model_buffer,
            model_bind_group,
            model_stride,
            model_capacity,
            scene_pipelines,
            line_pipeline,
            shadow_pipeline,
            shadow_view,
            shadow_camera_buffer,
            shadow_bind_group,
            repeat_sampler,
            clamp_sampler,
            white,
            clear,
            meshes: HashMap::new(),
            images: HashMap::new(),
            videos: HashMap::new(),
            materials: HashMap::new(),
            egui_renderer,
        })
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        PhysicalSize::new(self.config.width, self.config.height)
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        self.surface.configure(&self.device, &self.config);
        self.depth_view = create_depth_view(&self.device, new_size.width, new_size.height);
    }

    /// Drops every GPU resource tied to the previous scene.
    pub fn clear_scene(&mut self) {
        self.meshes.clear();
        self.images.clear();
        self.videos.clear();
        self.materials.clear();
    }

    /// Copies a decoded frame into the video's texture, recreating it when the size changes.
    pub fn upload_video_frame(&mut self, video: VideoId, frame: &DecodedFrame) {
        if !frame.is_complete() {
            log::warn!(
                "Dropping incomplete frame {} for video {:?} ({} bytes for {}x{})",
                frame.frame_index,
                video,
                frame.data.len(),
                frame.width,
                frame.height
            );
            return;
        }
        let stale = self.videos.get(&video).map_or(true, |existing| {
            existing.texture.width != frame.width || existing.texture.height != frame.height
        });
        if stale {
            let generation = self
                .videos
                .get(&video)
                .map_or(0, |existing| existing.generation + 1);
            log::debug!(
                "Creating {}x{} texture for video {:?}",
                frame.width,
                frame.height,
                video
            );
            let texture = create_texture(&self.device, "video frame", frame.width, frame.height);
            self.videos.insert(video, VideoTexture { texture, generation });
        }
        if let Some(target) = self.videos.get(&video) {
            write_rgba(&self.queue, &target.texture, &frame.data);
        }
    }

    pub fn render(&mut self, frame: &FrameParams<'_>) -> Result<(), RenderError> {
        let draws = match frame.graph {
            Some(graph) => self.prepare_draws(graph, frame.camera),
            None => Vec::new(),
        };
        self.queue.write_buffer(
            &self.camera_buffer,
            0,
            bytemuck::bytes_of(&CameraUniform::new(frame.camera)),
        );
        self.queue
            .write_buffer(&self.lights_buffer, 0, bytemuck::bytes_of(frame.lights));
        self.queue.write_buffer(
            &self.shadow_camera_buffer,
            0,
            bytemuck::bytes_of(&frame.lights.shadow_view_proj),
        );
        let helper_lines = frame.helper.map(|bounds| {
            let vertices = box_lines(&bounds);
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("helper lines"),
                    contents: bytemuck::cast_slice(&vertices),
                    usage: wgpu::BufferUsages::VERTEX,
                })
        });

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.device, &self.config);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });

        self.shadow_pass(&mut encoder, &draws, frame.lights.direction[3] > 0.5);
        self.scene_pass(
            &mut encoder,
            &view,
            &draws,
            frame.background,
            helper_lines.as_ref(),
        );
        if let Some(ui) = frame.ui {
            self.paint_ui(&mut encoder, &view, ui);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn prepare_draws(&mut self, graph: &SceneGraph, camera: &Camera) -> Vec<Draw> {
        let world = graph.world_matrices();
        let mut visible = vec![false; graph.len()];
        let mut draws = Vec::new();
        let mut models = Vec::new();
        for id in graph.traverse() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let parent_visible = node.parent.map_or(true, |parent| visible[parent.0]);
            visible[id.0] = parent_visible && node.visible;
            if !visible[id.0] {
                continue;
            }
            let (Some(geometry_id), Some(material_id)) = (node.geometry, node.material) else {
                continue;
            };
            let (Some(geometry), Some(material)) =
                (graph.geometry(geometry_id), graph.material(material_id))
            else {
                continue;
            };
            if geometry.indices.is_empty() {
                continue;
            }
            let center = self.ensure_mesh(geometry_id, geometry);
            self.ensure_material(material_id, material, graph);
            let world_center = world[id.0].transform_point3(center);
            draws.push(Draw {
                geometry: geometry_id,
                material: material_id,
                model_index: models.len() as u32,
                transparent: material.transparent,
                double_sided: material.side == Side::Double,
                cast_shadow: node.cast_shadow,
                depth: world_center.distance_squared(camera.position),
            });
            models.push(ModelUniform::new(world[id.0], node.receive_shadow));
        }
        self.write_models(&models);
        draws
    }

    fn ensure_mesh(&mut self, id: GeometryId, geometry: &Geometry) -> Vec3 {
        if let Some(mesh) = self.meshes.get(&id) {
            return mesh.center;
        }
        let uvs = geometry.sampling_uvs();
        let vertices: Vec<MeshVertex> = geometry
            .positions
            .iter()
            .enumerate()
            .map(|(index, position)| MeshVertex {
                position: *position,
                normal: geometry.normals.get(index).copied().unwrap_or([0.0, 1.0, 0.0]),
                uv: uvs.get(index).copied().unwrap_or([0.0, 0.0]),
            })
            .collect();
        let center = geometry.local_bounds().center();
        let mesh = GpuMesh {
            vertices: self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("mesh vertices"),
                    contents: bytemuck::cast_slice(&vertices),
                    usage: wgpu::BufferUsages::VERTEX,
                }),
            indices: self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("mesh indices"),
                    contents: bytemuck::cast_slice(&geometry.indices),
                    usage: wgpu::BufferUsages::INDEX,
                }),
            index_count: geometry.indices.len() as u32,
            center,
        };
        self.meshes.insert(id, mesh);
        center
    }

    fn ensure_image(&mut self, id: ImageId, graph: &SceneGraph) -> bool {
        if let Some(texture) = self.images.get(&id) {
            return texture.is_some();
        }
        let texture = graph.image(id).and_then(|image| {
            let expected = image.width as usize * image.height as usize * 4;
            if image.width == 0 || image.height == 0 || image.pixels.len() != expected {
                log::warn!(
                    "Image '{}' has {} bytes for {}x{}, using a plain white texture",
                    image.name,
                    image.pixels.len(),
                    image.width,
                    image.height
                );
                return None;
            }
            let texture = create_texture(&self.device, &image.name, image.width, image.height);
            write_rgba(&self.queue, &texture, &image.pixels);
            Some(texture)
        });
        let uploaded = texture.is_some();
        self.images.insert(id, texture);
        uploaded
    }

    fn bound_texture(&mut self, material: &Material, graph: &SceneGraph) -> BoundTexture {
        match material.map.map(|map| map.source) {
            None => BoundTexture::White,
            Some(TextureSource::Image(image)) => {
                if self.ensure_image(image, graph) {
                    BoundTexture::Image(image)
                } else {
                    BoundTexture::White
                }
            }
            Some(TextureSource::Video(video)) => match self.videos.get(&video) {
                Some(texture) => BoundTexture::Video(video, texture.generation),
                None => BoundTexture::Pending,
            },
        }
    }

    fn ensure_material(&mut self, id: MaterialId, material: &Material, graph: &SceneGraph) {
        let key = self.bound_texture(material, graph);
        let uniform = MaterialUniform::new(material);
        if let Some(binding) = self.materials.get(&id) {
            if binding.key == key {
                self.queue
                    .write_buffer(&binding.uniform, 0, bytemuck::bytes_of(&uniform));
                return;
            }
        }
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("material uniform"),
                contents: bytemuck::bytes_of(&uniform),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        let (view, sampler) = match key {
            BoundTexture::White => (&self.white.view, &self.repeat_sampler),
            BoundTexture::Pending => (&self.clear.view, &self.clamp_sampler),
            BoundTexture::Image(image) => (
                self.images
                    .get(&image)
                    .and_then(Option::as_ref)
                    .map_or(&self.white.view, |texture| &texture.view),
                &self.repeat_sampler,
            ),
            BoundTexture::Video(video, _) => (
                self.videos
                    .get(&video)
                    .map_or(&self.clear.view, |texture| &texture.texture.view),
                &self.clamp_sampler,
            ),
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("material"),
            layout: &self.material_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        });
        self.materials.insert(
            id,
            MaterialBinding {
                key,
                uniform: buffer,
                bind_group,
            },
        );
    }

    fn write_models(&mut self, models: &[ModelUniform]) {
        if models.is_empty() {
            return;
        }
        if models.len() > self.model_capacity {
            self.model_capacity = models.len().next_power_of_two();
            let (buffer, bind_group) = create_model_storage(
                &self.device,
                &self.model_layout,
                self.model_stride,
                self.model_capacity,
            );
            self.model_buffer = buffer;
            self.model_bind_group = bind_group;
        }
        let stride = self.model_stride as usize;
        let mut bytes = vec![0_u8; models.len() * stride];
        for (index, model) in models.iter().enumerate() {
            let start = index * stride;
            let data = bytemuck::bytes_of(model);
            bytes[start..start + data.len()].copy_from_slice(data);
        }
        self.queue.write_buffer(&self.model_buffer, 0, &bytes);
    }

    fn shadow_pass(&self, encoder: &mut wgpu::CommandEncoder, draws: &[Draw], enabled: bool) {
        // Always cleared so receivers sample "lit" when shadows are off.
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("shadow pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.shadow_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if !enabled {
            return;
        }
        pass.set_pipeline(&self.shadow_pipeline);
        pass.set_bind_group(0, &self.shadow_bind_group, &[]);
        for draw in draws.iter().filter(|draw| draw.cast_shadow) {
            let Some(mesh) = self.meshes.get(&draw.geometry) else {
                continue;
            };
            pass.set_bind_group(1, &self.model_bind_group, &[draw.model_index * self.model_stride]);
            pass.set_vertex_buffer(0, mesh.vertices.slice(..));
            pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
    }

    fn scene_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        draws: &[Draw],
        background: [f32; 3],
        helper_lines: Option<&wgpu::Buffer>,
    ) {
        let [r, g, b] = background.map(srgb_to_linear);
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("scene pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: r as f64,
                        g: g as f64,
                        b: b as f64,
                        a: 1.0,
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Discard,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_bind_group(0, &self.globals_bind_group, &[]);

        let mut transparent: Vec<&Draw> = draws.iter().filter(|draw| draw.transparent).collect();
        transparent.sort_by(|a, b| b.depth.total_cmp(&a.depth));
        let ordered = draws
            .iter()
            .filter(|draw| !draw.transparent)
            .chain(transparent);
        for draw in ordered {
            let (Some(mesh), Some(material)) = (
                self.meshes.get(&draw.geometry),
                self.materials.get(&draw.material),
            ) else {
                continue;
            };
            let pipeline = usize::from(draw.transparent) * 2 + usize::from(draw.double_sided);
            pass.set_pipeline(&self.scene_pipelines[pipeline]);
            pass.set_bind_group(1, &material.bind_group, &[]);
            pass.set_bind_group(2, &self.model_bind_group, &[draw.model_index * self.model_stride]);
            pass.set_vertex_buffer(0, mesh.vertices.slice(..));
            pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }

        if let Some(lines) = helper_lines {
            pass.set_pipeline(&self.line_pipeline);
            pass.set_vertex_buffer(0, lines.slice(..));
            pass.draw(0..24, 0..1);
        }
    }

    fn paint_ui(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        ui: &EguiFrameOutput,
    ) {
        for (id, delta) in &ui.textures_delta.set {
            self.egui_renderer
                .update_texture(&self.device, &self.queue, *id, delta);
        }
        let screen = egui_wgpu::ScreenDescriptor {
            size_in_pixels: [self.config.width, self.config.height],
            pixels_per_point: ui.pixels_per_point,
        };
        self.egui_renderer.update_buffers(
            &self.device,
            &self.queue,
            encoder,
            &ui.clipped_primitives,
            &screen,
        );
        {
            let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("egui pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.egui_renderer
                .render(&mut pass.forget_lifetime(), &ui.clipped_primitives, &screen);
        }
        for id in &ui.textures_delta.free {
            self.egui_renderer.free_texture(id);
        }
    }
}

fn uniform_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    dynamic: bool,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_buffer<T: Pod>(device: &wgpu::Device, label: &str) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: std::mem::size_of::<T>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn create_model_storage(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    stride: u32,
    capacity: usize,
) -> (wgpu::Buffer, wgpu::BindGroup) {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("model uniforms"),
        size: stride as u64 * capacity as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("model"),
        layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &buffer,
                offset: 0,
                size: NonZeroU64::new(std::mem::size_of::<ModelUniform>() as u64),
            }),
        }],
    });
    (buffer, bind_group)
}

fn scene_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
    transparent: bool,
    double_sided: bool,
) -> wgpu::RenderPipeline {
    let label = match (transparent, double_sided) {
        (false, false) => "opaque pipeline",
        (false, true) => "opaque double-sided pipeline",
        (true, false) => "transparent pipeline",
        (true, true) => "transparent double-sided pipeline",
    };
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[MeshVertex::layout()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(if transparent {
                    wgpu::BlendState::ALPHA_BLENDING
                } else {
                    wgpu::BlendState::REPLACE
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: if double_sided {
                None
            } else {
                Some(wgpu::Face::Back)
            },
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: !transparent,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

fn create_depth_view(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("depth texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&Default::default())
}

fn create_texture(device: &wgpu::Device, label: &str, width: u32, height: u32) -> GpuTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&Default::default());
    GpuTexture {
        texture,
        view,
        width,
        height,
    }
}

fn write_rgba(queue: &wgpu::Queue, target: &GpuTexture, data: &[u8]) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &target.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(target.width * 4),
            rows_per_image: Some(target.height),
        },
        wgpu::Extent3d {
            width: target.width,
            height: target.height,
            depth_or_array_layers: 1,
        },
    );
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

fn srgb_to_linear(channel: f32) -> f32 {
    if channel <= 0.04045 {
        channel / 12.92
    } else {
        ((channel + 0.055) / 1.055).powf(2.4)
    }
}

fn box_lines(bounds: &Aabb) -> Vec<LineVertex> {
    bounds
        .edges()
        .iter()
        .flat_map(|edge| {
            edge.map(|point| LineVertex {
                position: point.to_array(),
                color: HELPER_COLOR,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_structs_match_shader_layouts() {
        assert_eq!(std::mem::size_of::<MeshVertex>(), 32);
        assert_eq!(std::mem::size_of::<CameraUniform>(), 80);
        assert_eq!(std::mem::size_of::<MaterialUniform>(), 32);
        assert_eq!(std::mem::size_of::<ModelUniform>(), 144);
        assert_eq!(std::mem::size_of::<LightsUniform>(), 272);
    }

    #[test]
    fn model_stride_respects_offset_alignment() {
        assert_eq!(align_to(144, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(300, 256), 512);
        assert_eq!(align_to(144, 0), 144);
    }

    #[test]
    fn helper_box_has_twelve_edges() {
        let bounds = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let lines = box_lines(&bounds);
        assert_eq!(lines.len(), 24);
        assert!(lines.iter().all(|vertex| vertex.color == HELPER_COLOR));
    }

    #[test]
    fn material_uniform_carries_flip_and_opacity() {
        use crate::scene::{TextureMap, TextureSource};
        let material = Material {
            map: Some(TextureMap {
                source: TextureSource::Image(ImageId(0)),
                flip_y: true,
            }),
            opacity: 1.5,
            ..Material::default()
        };
        let uniform = MaterialUniform::new(&material);
        assert_eq!(uniform.params[0], 1.0);
        assert_eq!(uniform.params[1], 1.0);
    }

    #[test]
    fn grey_background_is_linearised() {
        assert!((srgb_to_linear(0.5) - 0.214).abs() < 1e-3);
        assert_eq!(srgb_to_linear(0.0), 0.0);
        assert!((srgb_to_linear(1.0) - 1.0).abs() < 1e-6);
    }
}

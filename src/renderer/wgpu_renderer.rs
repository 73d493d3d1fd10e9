//! wgpu renderer implementation

use crate::material::{uniform_layout, MaterialId, ShaderMaterial, UniformValue};
use crate::renderer::traits::*;
use crate::renderer::types::*;
use glam::Mat4;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

/// Camera matrices handed to scene draw callbacks.
#[derive(Debug, Clone, Copy)]
pub struct CameraParams {
    pub view: Mat4,
    pub projection: Mat4,
}

/// Per-draw context handed to a registered scene callback.
///
/// The callback owns its pipelines and must configure them from `state`:
/// color/depth write masks and the stencil setup are renderer state here,
/// not render-pass state. The stencil reference is already set on the pass.
pub struct SceneDrawParams<'a> {
    pub camera: CameraParams,
    /// Pixel size of the bound target.
    pub viewport: (u32, u32),
    pub format: TextureFormat,
    pub depth_stencil: bool,
    pub state: &'a RenderState,
}

/// A registered scene: a closure that records draws into an open pass.
pub type SceneCallback = Box<dyn FnMut(&mut wgpu::RenderPass<'_>, &SceneDrawParams<'_>)>;

struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    depth_view: Option<wgpu::TextureView>,
    desc: RenderTargetDescriptor,
}

/// Everything that selects a distinct pipeline permutation for a material.
/// The stencil reference is set dynamically and stays out of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    format: TextureFormat,
    sample_count: u32,
    has_depth_stencil: bool,
    depth_write: bool,
    color_write: bool,
    stencil: Option<StencilKey>,
    blend: Option<BlendState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StencilKey {
    compare: CompareFunction,
    read_mask: u32,
    ops: StencilOps,
}

struct CompiledMaterial {
    module: wgpu::ShaderModule,
    version: u64,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_buffer: Option<wgpu::Buffer>,
    uniform_size: u64,
    depth_test: bool,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

/// Copyable description of the currently bound attachment.
#[derive(Clone, Copy)]
struct TargetInfo {
    format: TextureFormat,
    sample_count: u32,
    has_depth_stencil: bool,
    size: (u32, u32),
}

pub struct WgpuRenderer {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: Option<wgpu::Surface<'static>>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: Option<wgpu::SurfaceConfiguration>,
    current_frame: Option<wgpu::SurfaceTexture>,
    logical_size: (u32, u32),
    pixel_ratio: f32,
    state: RenderState,
    linear_sampler: wgpu::Sampler,

    targets: HashMap<u64, GpuTarget>,
    next_target_id: u64,
    materials: HashMap<u64, CompiledMaterial>,
    scenes: HashMap<u64, SceneCallback>,
    next_scene_id: u64,
    cameras: HashMap<u64, CameraParams>,
    next_camera_id: u64,
}

impl WgpuRenderer {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn convert_texture_format_back(format: wgpu::TextureFormat) -> TextureFormat {
        match format {
            wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
            wgpu::TextureFormat::Rgba32Float => TextureFormat::Rgba32Float,
            _ => TextureFormat::Bgra8Unorm,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_stencil_op(op: StencilOp) -> wgpu::StencilOperation {
        match op {
            StencilOp::Keep => wgpu::StencilOperation::Keep,
            StencilOp::Zero => wgpu::StencilOperation::Zero,
            StencilOp::Replace => wgpu::StencilOperation::Replace,
            StencilOp::Invert => wgpu::StencilOperation::Invert,
            StencilOp::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
            StencilOp::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
            StencilOp::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
            StencilOp::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_state(blend: BlendState) -> wgpu::BlendState {
        let component = |c: BlendComponent| wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(c.src_factor),
            dst_factor: Self::convert_blend_factor(c.dst_factor),
            operation: Self::convert_blend_operation(c.operation),
        };
        wgpu::BlendState {
            color: component(blend.color),
            alpha: component(blend.alpha),
        }
    }
}

impl WgpuRenderer {
    /// Create a renderer presenting to a window.
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> RendererResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    /// Async initialization, for callers already on an async runtime.
    pub async fn new_async(
        window: Arc<winit::window::Window>,
        vsync: bool,
    ) -> RendererResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| RendererError::SurfaceCreationFailed(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                RendererError::InitializationFailed("No suitable adapter found".into())
            })?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = Self::request_device(&adapter).await?;

        let size = window.inner_size();
        let pixel_ratio = window.scale_factor() as f32;
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .unwrap_or(surface_caps.formats[0]);

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let logical_size = (
            (size.width.max(1) as f32 / pixel_ratio).round() as u32,
            (size.height.max(1) as f32 / pixel_ratio).round() as u32,
        );

        Ok(Self::from_parts(
            instance,
            Some(surface),
            adapter,
            device,
            queue,
            Some(surface_config),
            logical_size,
            pixel_ratio,
        ))
    }

    /// Create a renderer with no window. Screen draws fail; everything else
    /// works, which is what off-screen composition and capture need.
    pub fn headless(width: u32, height: u32, pixel_ratio: f32) -> RendererResult<Self> {
        pollster::block_on(Self::headless_async(width, height, pixel_ratio))
    }

    pub async fn headless_async(
        width: u32,
        height: u32,
        pixel_ratio: f32,
    ) -> RendererResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                RendererError::InitializationFailed("No suitable adapter found".into())
            })?;

        let (device, queue) = Self::request_device(&adapter).await?;

        Ok(Self::from_parts(
            instance,
            None,
            adapter,
            device,
            queue,
            None,
            (width.max(1), height.max(1)),
            pixel_ratio,
        ))
    }

    async fn request_device(
        adapter: &wgpu::Adapter,
    ) -> RendererResult<(wgpu::Device, wgpu::Queue)> {
        adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Compositor Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        instance: wgpu::Instance,
        surface: Option<wgpu::Surface<'static>>,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        surface_config: Option<wgpu::SurfaceConfiguration>,
        logical_size: (u32, u32),
        pixel_ratio: f32,
    ) -> Self {
        let linear_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Compositor Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            surface_config,
            current_frame: None,
            logical_size,
            pixel_ratio,
            state: RenderState::default(),
            linear_sampler,
            targets: HashMap::new(),
            next_target_id: 1,
            materials: HashMap::new(),
            scenes: HashMap::new(),
            next_scene_id: 1,
            cameras: HashMap::new(),
            next_camera_id: 1,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Resize the surface to a new physical size.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let (Some(surface), Some(config)) = (&self.surface, &mut self.surface_config) {
            config.width = width;
            config.height = height;
            surface.configure(&self.device, config);
        }
        self.logical_size = (
            (width as f32 / self.pixel_ratio).round() as u32,
            (height as f32 / self.pixel_ratio).round() as u32,
        );
    }

    pub fn set_pixel_ratio(&mut self, ratio: f32) {
        self.pixel_ratio = ratio.max(f32::EPSILON);
    }

    /// Present the frame acquired by the first screen draw, if any.
    pub fn present(&mut self) {
        if let Some(frame) = self.current_frame.take() {
            frame.present();
        }
    }

    /// Register a scene draw callback, returning the handle to render it by.
    pub fn register_scene(&mut self, callback: SceneCallback) -> SceneHandle {
        let id = self.next_scene_id;
        self.next_scene_id += 1;
        self.scenes.insert(id, callback);
        SceneHandle::from_raw(id)
    }

    pub fn unregister_scene(&mut self, scene: SceneHandle) {
        self.scenes.remove(&scene.raw());
    }

    pub fn register_camera(&mut self, camera: CameraParams) -> CameraHandle {
        let id = self.next_camera_id;
        self.next_camera_id += 1;
        self.cameras.insert(id, camera);
        CameraHandle::from_raw(id)
    }

    pub fn set_camera(&mut self, handle: CameraHandle, camera: CameraParams) {
        self.cameras.insert(handle.raw(), camera);
    }

    pub fn unregister_camera(&mut self, camera: CameraHandle) {
        self.cameras.remove(&camera.raw());
    }

    /// Read a target's color buffer back to the CPU. Supported for the
    /// 8-bit RGBA formats.
    pub fn read_target(&mut self, target: TargetHandle) -> RendererResult<image::RgbaImage> {
        let gpu = self.targets.get(&target.raw()).ok_or_else(|| {
            RendererError::InvalidHandle(format!("unknown target {}", target.raw()))
        })?;
        match gpu.desc.format {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {}
            other => {
                return Err(RendererError::ReadbackFailed(format!(
                    "readback not supported for {other:?}"
                )))
            }
        }

        let (width, height) = (gpu.desc.width, gpu.desc.height);
        // Rows must align to 256 bytes for texture-to-buffer copies.
        let unpadded_bytes_per_row = width * 4;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(256) * 256;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &gpu.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| RendererError::ReadbackFailed(e.to_string()))?
            .map_err(|e| RendererError::ReadbackFailed(e.to_string()))?;

        let data = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for row in data.chunks(padded_bytes_per_row as usize) {
            pixels.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
        }
        drop(data);
        buffer.unmap();

        image::RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| RendererError::ReadbackFailed("pixel buffer size mismatch".into()))
    }

    fn ensure_frame(&mut self) -> RendererResult<()> {
        if self.current_frame.is_some() {
            return Ok(());
        }
        let surface = self.surface.as_ref().ok_or_else(|| {
            RendererError::InvalidHandle("headless renderer has no screen target".into())
        })?;
        let frame = surface.get_current_texture().map_err(|e| match e {
            wgpu::SurfaceError::OutOfMemory => RendererError::OutOfMemory,
            wgpu::SurfaceError::Lost => RendererError::DeviceLost,
            other => RendererError::SurfaceCreationFailed(other.to_string()),
        })?;
        self.current_frame = Some(frame);
        Ok(())
    }

    fn current_target_info(&self) -> RendererResult<TargetInfo> {
        match self.state.render_target {
            Some(handle) => {
                let gpu = self.targets.get(&handle.raw()).ok_or_else(|| {
                    RendererError::InvalidHandle(format!("unknown target {}", handle.raw()))
                })?;
                Ok(TargetInfo {
                    format: gpu.desc.format,
                    sample_count: gpu.desc.sample_count,
                    has_depth_stencil: gpu.depth_view.is_some(),
                    size: (gpu.desc.width, gpu.desc.height),
                })
            }
            None => {
                let config = self.surface_config.as_ref().ok_or_else(|| {
                    RendererError::InvalidHandle("headless renderer has no screen target".into())
                })?;
                Ok(TargetInfo {
                    format: Self::convert_texture_format_back(config.format),
                    sample_count: 1,
                    has_depth_stencil: false,
                    size: (config.width, config.height),
                })
            }
        }
    }

    /// (Re)compile a material's shader module and bind group layout when its
    /// source or defines changed since the last draw.
    fn compile_material(&mut self, material: &mut ShaderMaterial) -> RendererResult<()> {
        let raw = material.id().raw();
        let dirty = material.take_needs_update();
        let up_to_date = self
            .materials
            .get(&raw)
            .map_or(false, |c| c.version == material.version());
        if up_to_date && !dirty {
            return Ok(());
        }

        let source = material.preprocess().map_err(|e| {
            RendererError::ShaderCompilationFailed(format!("{}: {e}", material.label()))
        })?;

        // Validate before handing the source to wgpu, so a broken shader
        // surfaces as an error instead of a device loss.
        let module = naga::front::wgsl::parse_str(&source).map_err(|e| {
            RendererError::ShaderCompilationFailed(format!(
                "{}: {}",
                material.label(),
                e.emit_to_string(&source)
            ))
        })?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| {
            RendererError::ShaderCompilationFailed(format!(
                "{}: {}",
                material.label(),
                e.as_inner()
            ))
        })?;

        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(material.label()),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });

        let uniform_size = uniform_layout(material.uniforms()).len() as u64;
        let texture_count = material
            .uniforms()
            .iter()
            .filter(|(_, value)| value.is_texture())
            .count() as u32;

        let mut entries = Vec::new();
        let mut binding = 0;
        if uniform_size > 0 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
            binding += 1;
        }
        for _ in 0..texture_count {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            binding += 1;
        }
        if texture_count > 0 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(material.label()),
                    entries: &entries,
                });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(material.label()),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        log::debug!("compiled material {} v{}", material.label(), material.version());
        self.materials.insert(
            raw,
            CompiledMaterial {
                module: shader,
                version: material.version(),
                bind_group_layout,
                pipeline_layout,
                uniform_buffer: None,
                uniform_size: 0,
                depth_test: material.depth_test,
                pipelines: HashMap::new(),
            },
        );
        Ok(())
    }

    fn ensure_pipeline(&mut self, material: &ShaderMaterial, key: &PipelineKey) {
        let device = &self.device;
        let Some(compiled) = self.materials.get_mut(&material.id().raw()) else {
            return;
        };
        if compiled.pipelines.contains_key(key) {
            return;
        }

        let depth_stencil = key.has_depth_stencil.then(|| {
            let stencil_face = match &key.stencil {
                Some(stencil) => wgpu::StencilFaceState {
                    compare: Self::convert_compare_function(stencil.compare),
                    fail_op: Self::convert_stencil_op(stencil.ops.fail),
                    depth_fail_op: Self::convert_stencil_op(stencil.ops.z_fail),
                    pass_op: Self::convert_stencil_op(stencil.ops.z_pass),
                },
                None => wgpu::StencilFaceState::IGNORE,
            };
            wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth24PlusStencil8,
                depth_write_enabled: key.depth_write,
                depth_compare: if compiled.depth_test {
                    wgpu::CompareFunction::LessEqual
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: wgpu::StencilState {
                    front: stencil_face,
                    back: stencil_face,
                    read_mask: key.stencil.as_ref().map_or(0, |s| s.read_mask),
                    write_mask: if key.stencil.is_some() { 0xff } else { 0 },
                },
                bias: wgpu::DepthBiasState::default(),
            }
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(material.label()),
            layout: Some(&compiled.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &compiled.module,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &compiled.module,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(key.format),
                    blend: key.blend.map(Self::convert_blend_state),
                    write_mask: if key.color_write {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: key.sample_count,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
        });
        compiled.pipelines.insert(key.clone(), pipeline);
    }

    fn upload_uniforms(&mut self, material: &ShaderMaterial) -> RendererResult<()> {
        let data = uniform_layout(material.uniforms());
        let Some(compiled) = self.materials.get_mut(&material.id().raw()) else {
            return Err(RendererError::InvalidHandle(format!(
                "material {} is not compiled",
                material.label()
            )));
        };
        if data.is_empty() {
            return Ok(());
        }
        if compiled.uniform_size != data.len() as u64 {
            compiled.uniform_buffer = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(material.label()),
                size: data.len() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
            compiled.uniform_size = data.len() as u64;
        }
        if let Some(buffer) = &compiled.uniform_buffer {
            self.queue.write_buffer(buffer, 0, &data);
        }
        Ok(())
    }

    fn pipeline_key_for(&self, material: &ShaderMaterial, info: &TargetInfo) -> PipelineKey {
        PipelineKey {
            format: info.format,
            sample_count: info.sample_count,
            has_depth_stencil: info.has_depth_stencil,
            depth_write: material.depth_write && self.state.depth_write,
            color_write: self.state.color_write,
            stencil: (info.has_depth_stencil && self.state.stencil.test).then(|| StencilKey {
                compare: self.state.stencil.func.compare,
                read_mask: self.state.stencil.func.read_mask,
                ops: self.state.stencil.ops,
            }),
            blend: material.blending,
        }
    }
}

impl Renderer for WgpuRenderer {
    fn state(&self) -> &RenderState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RenderState {
        &mut self.state
    }

    fn size(&self) -> (u32, u32) {
        self.logical_size
    }

    fn pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    fn create_target(&mut self, desc: &RenderTargetDescriptor) -> RendererResult<TargetHandle> {
        if desc.format.is_depth() {
            return Err(RendererError::TargetCreationFailed(format!(
                "{:?} is not a color format",
                desc.format
            )));
        }
        let max_size = self.device.limits().max_texture_dimension_2d;
        if desc.width > max_size || desc.height > max_size {
            return Err(RendererError::TargetCreationFailed(format!(
                "{}x{} exceeds device limit {max_size}",
                desc.width, desc.height
            )));
        }

        let extent = wgpu::Extent3d {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: extent,
            mip_level_count: 1,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let depth_view = desc.depth_stencil.then(|| {
            let depth = self.device.create_texture(&wgpu::TextureDescriptor {
                label: desc.label.as_deref(),
                size: extent,
                mip_level_count: 1,
                sample_count: desc.sample_count,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Depth24PlusStencil8,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            });
            depth.create_view(&wgpu::TextureViewDescriptor::default())
        });

        let id = self.next_target_id;
        self.next_target_id += 1;
        self.targets.insert(
            id,
            GpuTarget {
                texture,
                view,
                depth_view,
                desc: desc.clone(),
            },
        );
        Ok(TargetHandle::from_raw(id))
    }

    fn destroy_target(&mut self, target: TargetHandle) {
        self.targets.remove(&target.raw());
    }

    fn target_texture(&self, target: TargetHandle) -> Option<TextureHandle> {
        self.targets
            .contains_key(&target.raw())
            .then(|| TextureHandle::from_raw(target.raw()))
    }

    fn clear(&mut self, color: bool, depth: bool, stencil: bool) {
        if self.state.render_target.is_none() {
            if let Err(e) = self.ensure_frame() {
                log::warn!("clear skipped: {e}");
                return;
            }
        }

        let surface_view = self
            .current_frame
            .as_ref()
            .filter(|_| self.state.render_target.is_none())
            .map(|frame| {
                frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default())
            });

        let (color_view, depth_view) = match self.state.render_target {
            Some(handle) => match self.targets.get(&handle.raw()) {
                Some(gpu) => (&gpu.view, gpu.depth_view.as_ref()),
                None => {
                    log::warn!("clear skipped: unknown target {}", handle.raw());
                    return;
                }
            },
            None => match surface_view.as_ref() {
                Some(view) => (view, None),
                None => return,
            },
        };

        let color_load = if color && self.state.color_write {
            let c = self.state.clear_color;
            wgpu::LoadOp::Clear(wgpu::Color {
                r: c.x as f64,
                g: c.y as f64,
                b: c.z as f64,
                a: self.state.clear_alpha as f64,
            })
        } else {
            wgpu::LoadOp::Load
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Clear Encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: depth_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: if depth && self.state.depth_write {
                                wgpu::LoadOp::Clear(1.0)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: Some(wgpu::Operations {
                            load: if stencil {
                                wgpu::LoadOp::Clear(self.state.stencil.clear_value)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn render_scene(&mut self, scene: SceneHandle, camera: CameraHandle) -> RendererResult<()> {
        let camera_params = *self.cameras.get(&camera.raw()).ok_or_else(|| {
            RendererError::InvalidHandle(format!("unknown camera {}", camera.raw()))
        })?;
        if self.state.render_target.is_none() {
            self.ensure_frame()?;
        }
        let info = self.current_target_info()?;

        let surface_view = self
            .current_frame
            .as_ref()
            .filter(|_| self.state.render_target.is_none())
            .map(|frame| {
                frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default())
            });
        let (color_view, depth_view) = match self.state.render_target {
            Some(handle) => {
                let gpu = self.targets.get(&handle.raw()).ok_or_else(|| {
                    RendererError::InvalidHandle(format!("unknown target {}", handle.raw()))
                })?;
                (&gpu.view, gpu.depth_view.as_ref())
            }
            None => {
                let view = surface_view.as_ref().ok_or_else(|| {
                    RendererError::InvalidHandle("no frame acquired for screen draw".into())
                })?;
                (view, None)
            }
        };

        let callback = self.scenes.get_mut(&scene.raw()).ok_or_else(|| {
            RendererError::InvalidHandle(format!("unknown scene {}", scene.raw()))
        })?;

        let auto = self.state.auto_clear;
        let color_load = if auto && self.state.auto_clear_color && self.state.color_write {
            let c = self.state.clear_color;
            wgpu::LoadOp::Clear(wgpu::Color {
                r: c.x as f64,
                g: c.y as f64,
                b: c.z as f64,
                a: self.state.clear_alpha as f64,
            })
        } else {
            wgpu::LoadOp::Load
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Scene Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Scene"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: depth_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: if auto
                                && self.state.auto_clear_depth
                                && self.state.depth_write
                            {
                                wgpu::LoadOp::Clear(1.0)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: Some(wgpu::Operations {
                            load: if auto && self.state.auto_clear_stencil {
                                wgpu::LoadOp::Clear(self.state.stencil.clear_value)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_stencil_reference(self.state.stencil.func.reference);

            let params = SceneDrawParams {
                camera: camera_params,
                viewport: info.size,
                format: info.format,
                depth_stencil: info.has_depth_stencil,
                state: &self.state,
            };
            callback(&mut pass, &params);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw_fullscreen(&mut self, material: &mut ShaderMaterial) -> RendererResult<()> {
        if self.state.render_target.is_none() {
            self.ensure_frame()?;
        }
        let info = self.current_target_info()?;
        let key = self.pipeline_key_for(material, &info);

        self.compile_material(material)?;
        self.ensure_pipeline(material, &key);
        self.upload_uniforms(material)?;

        let compiled = self.materials.get(&material.id().raw()).ok_or_else(|| {
            RendererError::InvalidHandle(format!("material {} is not compiled", material.label()))
        })?;
        let pipeline = compiled.pipelines.get(&key).ok_or_else(|| {
            RendererError::InvalidHandle(format!("material {} has no pipeline", material.label()))
        })?;

        // Assemble the bind group: uniform buffer, textures in declaration
        // order, then the shared sampler.
        let mut bindings = Vec::new();
        let mut binding = 0;
        if let Some(buffer) = &compiled.uniform_buffer {
            bindings.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            });
            binding += 1;
        }
        let mut has_textures = false;
        for (name, value) in material.uniforms() {
            let UniformValue::Texture(texture) = value else {
                continue;
            };
            has_textures = true;
            let handle = texture.ok_or_else(|| {
                RendererError::InvalidHandle(format!(
                    "material {} uniform {name} has no texture bound",
                    material.label()
                ))
            })?;
            let gpu = self.targets.get(&handle.raw()).ok_or_else(|| {
                RendererError::InvalidHandle(format!(
                    "material {} uniform {name} references a destroyed target",
                    material.label()
                ))
            })?;
            bindings.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::TextureView(&gpu.view),
            });
            binding += 1;
        }
        if has_textures {
            bindings.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Sampler(&self.linear_sampler),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(material.label()),
            layout: &compiled.bind_group_layout,
            entries: &bindings,
        });

        let surface_view = self
            .current_frame
            .as_ref()
            .filter(|_| self.state.render_target.is_none())
            .map(|frame| {
                frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default())
            });
        let (color_view, depth_view) = match self.state.render_target {
            Some(handle) => {
                let gpu = self.targets.get(&handle.raw()).ok_or_else(|| {
                    RendererError::InvalidHandle(format!("unknown target {}", handle.raw()))
                })?;
                (&gpu.view, gpu.depth_view.as_ref())
            }
            None => {
                let view = surface_view.as_ref().ok_or_else(|| {
                    RendererError::InvalidHandle("no frame acquired for screen draw".into())
                })?;
                (view, None)
            }
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Fullscreen Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(material.label()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: depth_view.map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_stencil_reference(self.state.stencil.func.reference);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn destroy_material(&mut self, material: MaterialId) {
        self.materials.remove(&material.raw());
    }
}

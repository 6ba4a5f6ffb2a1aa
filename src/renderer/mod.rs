// Renderer - ties the backend together into a frame loop
//
// RenderContext owns every GPU object and implements FrameTimeline; FrameLoop
// sequences it. Fields drop in declaration order, which is the reverse of
// creation: swapchain and pipeline first, the device last.

pub mod assets;
pub mod frame;
pub mod scene;

use anyhow::{Context, Result};
use ash::vk;
use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::descriptor::FRAME_BINDINGS;
use crate::backend::image::find_depth_format;
use crate::backend::pipeline::{scissor_for, viewport_for};
use crate::backend::{
    AcquireOutcome, CommandPool, DescriptorPool, DescriptorSetLayout, FrameSlot, GpuBuffer,
    GpuImage, GraphicsPipeline, PresentOutcome, PresentationWindow, RecreateOutcome, RenderPass,
    RhiError, ShaderKind, ShaderModule, Swapchain, Transfer, VulkanDevice,
};
use crate::config::Config;
use assets::{MeshData, TextureData};
use frame::{FrameLoop, FrameOutcome, FrameTimeline};
use scene::{mesh_placements, Mesh, MeshPushConstants, UniformBufferObject, Vertex};

/// Base name of the shader pair in the shader directory.
const SCENE_SHADER: &str = "scene";

/// The backend entry points the application drives.
pub trait RenderBackend {
    fn initialize(window: Arc<Window>, config: &Config) -> Result<Self>
    where
        Self: Sized;

    fn draw_frame(&mut self) -> Result<FrameOutcome>;

    /// The window size changed (or fullscreen toggled).
    fn notify_resized(&mut self);

    /// Show or hide the `index`-th mesh. Returns its name and new visibility,
    /// or `None` when there is no such mesh.
    fn toggle_mesh(&mut self, index: usize) -> Option<(String, bool)>;

    /// Wait for in-flight work; resources are released when the backend drops.
    fn terminate(&mut self) -> Result<()>;
}

pub struct VulkanRenderer {
    frame_loop: FrameLoop,
    ctx: RenderContext,
}

impl RenderBackend for VulkanRenderer {
    fn initialize(window: Arc<Window>, config: &Config) -> Result<Self> {
        let ctx = RenderContext::new(window, config)?;
        Ok(Self {
            frame_loop: FrameLoop::new(ctx.slots.len()),
            ctx,
        })
    }

    fn draw_frame(&mut self) -> Result<FrameOutcome> {
        self.frame_loop.draw_frame(&mut self.ctx)
    }

    fn notify_resized(&mut self) {
        self.frame_loop.notify_resized();
    }

    fn toggle_mesh(&mut self, index: usize) -> Option<(String, bool)> {
        let instance = &mut self.ctx.meshes.get_mut(index)?.instance;
        let visible = instance.toggle();
        Some((instance.name.clone(), visible))
    }

    fn terminate(&mut self) -> Result<()> {
        log::info!(
            "Shutting down after {} frames",
            self.frame_loop.frame_index()
        );
        self.ctx.device.wait_idle()
    }
}

struct RenderContext {
    // Sized to the window
    swapchain: Swapchain,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,

    // Shader interface
    shaders: [ShaderModule; 2],
    descriptor_sets: Vec<vk::DescriptorSet>,
    descriptor_pool: DescriptorPool,
    descriptor_layout: DescriptorSetLayout,

    // Scene resources
    meshes: Vec<Mesh>,
    texture: GpuImage,
    uniform_buffers: Vec<GpuBuffer>,

    // Per-frame command buffers and sync
    slots: Vec<FrameSlot>,
    command_pool: CommandPool,
    transfer: Transfer,

    device: Arc<VulkanDevice>,
    window: Arc<Window>,

    clear_color: [f32; 4],
    field_of_view: f32,
    start_time: Instant,
}

impl RenderContext {
    fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let presentation: &dyn PresentationWindow = window.as_ref();
        let device = VulkanDevice::new(
            &config.window.title,
            config.validation_enabled(),
            Some(presentation),
        )?;

        let transfer = Transfer::new(&device)?;
        let depth_format = find_depth_format(&device)?;

        let mut swapchain = Swapchain::new(
            device.clone(),
            window.framebuffer_extent(),
            config.present_mode(),
            depth_format,
            &transfer,
        )?;

        let render_pass = RenderPass::new(&device, swapchain.format, depth_format)?;
        swapchain.create_framebuffers(&render_pass)?;

        let descriptor_layout = DescriptorSetLayout::new(&device, &FRAME_BINDINGS)?;

        let shader_dir = &config.assets.shader_dir;
        let shaders = [
            ShaderModule::load(&device, shader_dir, SCENE_SHADER, ShaderKind::Vertex)?,
            ShaderModule::load(&device, shader_dir, SCENE_SHADER, ShaderKind::Fragment)?,
        ];
        let pipeline = create_pipeline(&device, &render_pass, &shaders, &descriptor_layout)?;

        let texture_data = TextureData::load_or_default(config.assets.texture.as_deref());
        let texture = transfer
            .upload_image(
                texture_data.width,
                texture_data.height,
                vk::Format::R8G8B8A8_SRGB,
                &texture_data.pixels,
            )
            .context("Failed to upload texture")?;

        let meshes = load_meshes(&transfer, &config.assets.meshes)?;

        let slot_count = config.frames_in_flight();
        let uniform_buffers = (0..slot_count)
            .map(|_| GpuBuffer::uniform(&device, size_of::<UniformBufferObject>() as vk::DeviceSize))
            .collect::<Result<Vec<_>>>()?;

        let descriptor_pool = DescriptorPool::new(&device, &FRAME_BINDINGS, slot_count as u32, 1)?;
        let buffer_refs: Vec<&GpuBuffer> = uniform_buffers.iter().collect();
        let descriptor_sets = descriptor_pool.allocate_sets(
            &descriptor_layout,
            slot_count,
            &buffer_refs,
            Some(&texture),
        )?;

        let command_pool = CommandPool::resettable(&device, device.graphics_queue_family)?;
        let slots = FrameSlot::create_slots(&device, &command_pool, slot_count)?;

        log::info!(
            "Vulkan initialized: {} frames in flight, {} meshes",
            slot_count,
            meshes.len()
        );

        Ok(Self {
            swapchain,
            pipeline,
            render_pass,
            shaders,
            descriptor_sets,
            descriptor_pool,
            descriptor_layout,
            meshes,
            texture,
            uniform_buffers,
            slots,
            command_pool,
            transfer,
            device,
            window,
            clear_color: config.graphics.clear_color,
            field_of_view: config.graphics.field_of_view,
            start_time: Instant::now(),
        })
    }

    fn update_uniforms(&self, slot: usize) -> Result<()> {
        let extent = self.swapchain.extent;
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let ubo = UniformBufferObject::for_frame(
            self.start_time.elapsed().as_secs_f32(),
            aspect,
            self.field_of_view,
        );
        self.uniform_buffers[slot].write(&[ubo])
    }

    fn record_commands(&self, cmd: vk::CommandBuffer, slot: usize, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let framebuffer = *self
            .swapchain
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for swapchain image {}", image_index))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.render_pass)
            .framebuffer(framebuffer)
            .render_area(scissor_for(self.swapchain.extent))
            .clear_values(&clear_values);

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

            device.cmd_set_viewport(cmd, 0, &[viewport_for(self.swapchain.extent)]);
            device.cmd_set_scissor(cmd, 0, &[scissor_for(self.swapchain.extent)]);

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.descriptor_sets[slot]],
                &[],
            );

            for mesh in self.meshes.iter().filter(|m| m.instance.visible) {
                device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer.buffer], &[0]);
                device.cmd_bind_index_buffer(
                    cmd,
                    mesh.index_buffer.buffer,
                    0,
                    vk::IndexType::UINT32,
                );
                device.cmd_push_constants(
                    cmd,
                    self.pipeline.layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&mesh.instance.push_constants()),
                );
                device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
            }

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        Ok(())
    }

    /// New render pass and pipeline for a changed surface format.
    fn rebuild_render_pass(&mut self) -> Result<()> {
        log::info!(
            "Surface format changed {:?} -> {:?}, rebuilding render pass and pipeline",
            self.render_pass.color_format,
            self.swapchain.format
        );

        let render_pass = RenderPass::new(
            &self.device,
            self.swapchain.format,
            self.swapchain.depth_format,
        )?;
        let pipeline = create_pipeline(
            &self.device,
            &render_pass,
            &self.shaders,
            &self.descriptor_layout,
        )?;

        // Old pipeline goes before the render pass it was built against
        self.pipeline = pipeline;
        self.render_pass = render_pass;
        Ok(())
    }
}

impl FrameTimeline for RenderContext {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.slots[slot].wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.swapchain
            .acquire_next_image(u64::MAX, self.slots[slot].image_available)
    }

    fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        self.update_uniforms(slot)?;

        let frame = &self.slots[slot];
        self.record_commands(frame.command_buffer, slot, image_index)?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // Reset only once a submission that signals the fence is certain
        frame.reset()?;
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .map_err(|e| RhiError::vulkan("vkQueueSubmit", e))
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[self.slots[slot].render_finished],
        )
    }

    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
        let extent = self.window.framebuffer_extent();
        let outcome = self.swapchain.recreate(extent, &self.transfer)?;

        if outcome == RecreateOutcome::Rebuilt {
            if self.swapchain.format != self.render_pass.color_format {
                self.rebuild_render_pass()?;
            }
            self.swapchain.create_framebuffers(&self.render_pass)?;
        }

        Ok(outcome)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be destroyed while the GPU still references it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to idle device during cleanup: {:?}", e);
        }
    }
}

fn create_pipeline(
    device: &Arc<VulkanDevice>,
    render_pass: &RenderPass,
    shaders: &[ShaderModule; 2],
    descriptor_layout: &DescriptorSetLayout,
) -> Result<GraphicsPipeline> {
    GraphicsPipeline::new(
        device,
        render_pass,
        &[&shaders[0], &shaders[1]],
        &Vertex::layout(),
        &[descriptor_layout.layout],
        size_of::<MeshPushConstants>() as u32,
    )
}

/// Upload the named built-in meshes; unknown names are skipped with a warning.
fn load_meshes(transfer: &Transfer, names: &[String]) -> Result<Vec<Mesh>> {
    let known: Vec<(&str, MeshData)> = names
        .iter()
        .filter_map(|name| match MeshData::builtin(name) {
            Some(data) => Some((name.as_str(), data)),
            None => {
                log::warn!("Unknown mesh '{}', skipping", name);
                None
            }
        })
        .collect();

    if known.is_empty() {
        log::warn!("No meshes configured, drawing a quad");
        return Ok(vec![Mesh::upload(
            transfer,
            "quad",
            &MeshData::quad(),
            glam::Mat4::IDENTITY,
        )?]);
    }

    known
        .iter()
        .zip(mesh_placements(known.len()))
        .map(|((name, data), transform)| Mesh::upload(transfer, name, data, transform))
        .collect()
}

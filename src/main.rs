// =============================================================================
// VULKAN RHI RENDERER
// =============================================================================
//
// FRAME FLOW (see renderer::frame):
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image (out of date -> rebuild, drop frame)
// 3. Write uniforms, record and submit the slot's command buffer
// 4. Present, rebuilding afterwards on suboptimal/out-of-date/resize
// 5. Advance to the next slot
//
// =============================================================================

use anyhow::{Context, Result};
use rhi_renderer::{Config, FrameOutcome, RenderBackend, VulkanRenderer};
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // The log target lives in the config; read it once silently, then
    // again with logging up so load warnings are reported
    let config = Config::load_from_path("config.toml").unwrap_or_default();
    init_logging(&config)?;

    let config = Config::load();
    log::info!("Starting Vulkan renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.exit_status()
}

/// Initialize logging, writing to `debug.log_file` instead of stderr when enabled
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    // Dropped before the window so the surface goes before its OS handle
    renderer: Option<Box<dyn RenderBackend>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// First fatal error; the event loop exits when it is set
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn exit_status(self) -> Result<()> {
        match self.fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn halt(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal error, stopping: {:?}", error);
        self.fatal.get_or_insert(error);
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(e) = renderer.terminate() {
                log::error!("Error during shutdown: {:?}", e);
            }
        }
        self.renderer = None;
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(renderer) = self.renderer.as_mut() {
                renderer.notify_resized();
            }
        }
    }

    fn toggle_mesh(&mut self, index: usize) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match renderer.toggle_mesh(index) {
            Some((name, true)) => log::info!("Showing mesh '{}'", name),
            Some((name, false)) => log::info!("Hiding mesh '{}'", name),
            None => log::debug!("No mesh at index {}", index),
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

/// Number keys 1-9 select meshes 0-8 in load order.
fn mesh_index_for_key(key: KeyCode) -> Option<usize> {
    const DIGITS: [KeyCode; 9] = [
        KeyCode::Digit1,
        KeyCode::Digit2,
        KeyCode::Digit3,
        KeyCode::Digit4,
        KeyCode::Digit5,
        KeyCode::Digit6,
        KeyCode::Digit7,
        KeyCode::Digit8,
        KeyCode::Digit9,
    ];
    DIGITS.iter().position(|&digit| digit == key)
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.halt(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match VulkanRenderer::initialize(window.clone(), &self.config) {
            Ok(renderer) => self.renderer = Some(Box::new(renderer)),
            Err(e) => {
                self.halt(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.notify_resized();
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };

                match renderer.draw_frame() {
                    Ok(FrameOutcome::Presented { .. }) => self.update_fps(),
                    Ok(FrameOutcome::Dropped) | Ok(FrameOutcome::Skipped) => {}
                    Err(e) => {
                        self.halt(event_loop, e);
                        self.shutdown();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() {
                    return;
                }
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => {
                        log::info!("ESC pressed, exiting...");
                        self.shutdown();
                        event_loop.exit();
                    }
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                    PhysicalKey::Code(key) => {
                        if let Some(index) = mesh_index_for_key(key) {
                            self.toggle_mesh(index);
                        }
                    }
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws while the renderer is alive.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let (Some(window), Some(_)) = (&self.window, &self.renderer) {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_keys_select_meshes_in_order() {
        assert_eq!(mesh_index_for_key(KeyCode::Digit1), Some(0));
        assert_eq!(mesh_index_for_key(KeyCode::Digit9), Some(8));
        assert_eq!(mesh_index_for_key(KeyCode::Digit0), None);
        assert_eq!(mesh_index_for_key(KeyCode::KeyA), None);
    }
}

use anyhow::{anyhow, Context, Result};
use glutin::{
    config::ConfigTemplateBuilder,
    context::{ContextApi, ContextAttributesBuilder, GlProfile, PossiblyCurrentContext, Version},
    display::{GetGlDisplay, GlDisplay},
    prelude::*,
    surface::{Surface, SwapInterval, WindowSurface},
};
use glutin_winit::{DisplayBuilder, GlWindow};
use log::{info, LevelFilter};
use raw_window_handle::HasRawWindowHandle;
use simple_logger::SimpleLogger;
use std::{
    ffi::{CStr, CString},
    num::NonZeroU32,
};
use winit::{
    dpi::{LogicalSize, PhysicalSize},
    event::{Event, WindowEvent},
    event_loop::{EventLoop, EventLoopBuilder},
    window::{Window, WindowBuilder},
};

use firstlight::{config, NativeGl, Program, QuadMesh, ShaderSource};

struct App {
    window: Window,
    gl_context: PossiblyCurrentContext,
    gl_surface: Surface<WindowSurface>,
    gl: NativeGl,
    mesh: Option<QuadMesh>,
    program: Option<Program>,
}

impl App {
    fn new() -> Result<(Self, EventLoop<()>)> {
        SimpleLogger::new().with_level(LevelFilter::Info).init()?;
        info!("Initializing application...");

        let config = config::load_or_create("config.toml")?;

        let event_loop = EventLoopBuilder::new().build()?;
        let window_builder = WindowBuilder::new()
            .with_title(&config.window.title)
            .with_inner_size(LogicalSize::new(config.window.width, config.window.height));

        let template = ConfigTemplateBuilder::new().with_alpha_size(8);

        let display_builder = DisplayBuilder::new().with_window_builder(Some(window_builder));

        let (window, gl_config) = display_builder
            .build(&event_loop, template, |configs| {
                configs
                    .reduce(|accum, config| {
                        if config.num_samples() > accum.num_samples() {
                            config
                        } else {
                            accum
                        }
                    })
                    .unwrap()
            })
            .map_err(|e| anyhow!("Failed to create window and GL display: {e}"))?;

        let window = window.context("No window was created for the GL display")?;
        let raw_window_handle = window.raw_window_handle();

        let context_attributes = ContextAttributesBuilder::new()
            .with_context_api(ContextApi::OpenGl(Some(Version::new(3, 3))))
            .with_profile(GlProfile::Compatibility)
            .build(Some(raw_window_handle));

        let gl_display = gl_config.display();

        let gl_context = unsafe {
            gl_display
                .create_context(&gl_config, &context_attributes)
                .context("Failed to create OpenGL context")?
        };

        let attrs = window.build_surface_attributes(<_>::default());
        let gl_surface = unsafe {
            gl_config
                .display()
                .create_window_surface(&gl_config, &attrs)
                .context("Failed to create GL surface")?
        };

        let gl_context = gl_context
            .make_current(&gl_surface)
            .context("Failed to make context current")?;

        // Load OpenGL functions
        gl::load_with(|symbol| {
            let symbol = CString::new(symbol).unwrap();
            gl_display.get_proc_address(symbol.as_c_str()) as *const _
        });

        let version = unsafe {
            let data = gl::GetString(gl::VERSION);
            if data.is_null() {
                String::from("unknown")
            } else {
                CStr::from_ptr(data.cast()).to_string_lossy().into_owned()
            }
        };
        info!("OpenGL version: {}", version);

        if config.window.vsync {
            let interval = SwapInterval::Wait(NonZeroU32::new(1).unwrap());
            if let Err(e) = gl_surface.set_swap_interval(&gl_context, interval) {
                log::warn!("Failed to enable vsync: {}", e);
            }
        }

        // Initialize OpenGL state
        let [r, g, b, a] = config.render.clear_color;
        unsafe {
            gl::ClearColor(r, g, b, a);
        }

        let gl = NativeGl;
        let source_text = std::fs::read_to_string(&config.render.shader_path)
            .with_context(|| format!("Failed to read shader file {}", config.render.shader_path))?;
        let source = ShaderSource::parse(&source_text)
            .with_context(|| format!("Failed to split shader file {}", config.render.shader_path))?;
        let program = Program::build(&gl, &source).context("Failed to build shader program")?;
        program.bind(&gl);
        info!("Shader program {} ready", program.id());

        let mesh = QuadMesh::new();

        Ok((
            Self {
                window,
                gl_context,
                gl_surface,
                gl,
                mesh: Some(mesh),
                program: Some(program),
            },
            event_loop,
        ))
    }

    fn resize(&self, size: PhysicalSize<u32>) {
        // Zero-sized surfaces come through while minimized; skip them.
        let (Some(width), Some(height)) =
            (NonZeroU32::new(size.width), NonZeroU32::new(size.height))
        else {
            return;
        };
        self.gl_surface.resize(&self.gl_context, width, height);
        unsafe {
            gl::Viewport(0, 0, size.width as i32, size.height as i32);
        }
    }

    fn redraw(&self) {
        unsafe {
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
        if let Some(mesh) = &self.mesh {
            mesh.draw();
        }
        if let Err(e) = self.gl_surface.swap_buffers(&self.gl_context) {
            log::error!("Failed to swap buffers: {}", e);
        }
    }

    fn cleanup(&mut self) {
        // GL objects must die while their context is current.
        let _ = self.gl_context.make_current(&self.gl_surface);
        self.mesh = None;
        if let Some(program) = self.program.take() {
            program.delete(&self.gl);
        }
        info!("Shutdown complete");
    }
}

fn main() -> Result<()> {
    let (mut app, event_loop) = App::new()?;

    event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { event, .. } => match event {
            WindowEvent::CloseRequested => {
                app.cleanup();
                elwt.exit();
            }
            WindowEvent::Resized(size) => app.resize(size),
            WindowEvent::RedrawRequested => app.redraw(),
            _ => (),
        },
        Event::AboutToWait => app.window.request_redraw(),
        _ => (),
    })?;

    Ok(())
}

pub mod config;
pub mod render;

// Re-export commonly used types
pub use config::AppConfig;
pub use render::debug::{clear_gl_errors, log_gl_errors};
pub use render::driver::{GlApi, NativeGl};
pub use render::mesh::QuadMesh;
pub use render::shader::{BuildError, CompileError, ParseError, Program, ShaderSource, StageKind};

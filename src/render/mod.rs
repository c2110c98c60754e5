pub mod debug;
pub mod driver;
pub mod mesh;
pub mod shader;

pub use driver::NativeGl;
pub use shader::{Program, ShaderSource};

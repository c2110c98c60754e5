use gl::types::{GLchar, GLint, GLsizei, GLuint};

use crate::render::shader::StageKind;

/// Driver surface the program builder calls into.
///
/// Implementations stand for one GL context. Context state is not
/// reentrant, so a handle must only be used from the thread that owns
/// its context. The production implementation is [`NativeGl`]; tests
/// substitute a scripted fake.
pub trait GlApi {
    fn create_shader(&self, kind: StageKind) -> GLuint;
    fn shader_source(&self, shader: GLuint, source: &str);
    fn compile_shader(&self, shader: GLuint);
    fn compile_status(&self, shader: GLuint) -> bool;
    fn shader_info_log(&self, shader: GLuint) -> String;
    fn delete_shader(&self, shader: GLuint);

    fn create_program(&self) -> GLuint;
    fn attach_shader(&self, program: GLuint, shader: GLuint);
    fn link_program(&self, program: GLuint);
    fn link_status(&self, program: GLuint) -> bool;
    /// Driver-side check that the program is usable with current state.
    fn validate_program(&self, program: GLuint);
    fn validate_status(&self, program: GLuint) -> bool;
    fn program_info_log(&self, program: GLuint) -> String;
    fn delete_program(&self, program: GLuint);
    fn use_program(&self, program: GLuint);
}

/// Driver handle backed by the globally loaded `gl` bindings.
///
/// Only valid after `gl::load_with` has run for the current context.
#[derive(Debug, Default)]
pub struct NativeGl;

impl GlApi for NativeGl {
    fn create_shader(&self, kind: StageKind) -> GLuint {
        unsafe { gl::CreateShader(kind.gl_enum()) }
    }

    fn shader_source(&self, shader: GLuint, source: &str) {
        // Length is passed explicitly, so the source needs no NUL terminator.
        let ptr = source.as_ptr() as *const GLchar;
        let len = source.len() as GLint;
        unsafe { gl::ShaderSource(shader, 1, &ptr, &len) };
    }

    fn compile_shader(&self, shader: GLuint) {
        unsafe { gl::CompileShader(shader) };
    }

    fn compile_status(&self, shader: GLuint) -> bool {
        let mut status: GLint = 0;
        unsafe { gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status) };
        status != 0
    }

    fn shader_info_log(&self, shader: GLuint) -> String {
        let mut len: GLint = 0;
        unsafe { gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len) };
        read_log(len, |capacity, written, buffer| unsafe {
            gl::GetShaderInfoLog(shader, capacity, written, buffer)
        })
    }

    fn delete_shader(&self, shader: GLuint) {
        unsafe { gl::DeleteShader(shader) };
    }

    fn create_program(&self) -> GLuint {
        unsafe { gl::CreateProgram() }
    }

    fn attach_shader(&self, program: GLuint, shader: GLuint) {
        unsafe { gl::AttachShader(program, shader) };
    }

    fn link_program(&self, program: GLuint) {
        unsafe { gl::LinkProgram(program) };
    }

    fn link_status(&self, program: GLuint) -> bool {
        let mut status: GLint = 0;
        unsafe { gl::GetProgramiv(program, gl::LINK_STATUS, &mut status) };
        status != 0
    }

    fn validate_program(&self, program: GLuint) {
        unsafe { gl::ValidateProgram(program) };
    }

    fn validate_status(&self, program: GLuint) -> bool {
        let mut status: GLint = 0;
        unsafe { gl::GetProgramiv(program, gl::VALIDATE_STATUS, &mut status) };
        status != 0
    }

    fn program_info_log(&self, program: GLuint) -> String {
        let mut len: GLint = 0;
        unsafe { gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len) };
        read_log(len, |capacity, written, buffer| unsafe {
            gl::GetProgramInfoLog(program, capacity, written, buffer)
        })
    }

    fn delete_program(&self, program: GLuint) {
        unsafe { gl::DeleteProgram(program) };
    }

    fn use_program(&self, program: GLuint) {
        unsafe { gl::UseProgram(program) };
    }
}

// INFO_LOG_LENGTH counts the trailing NUL; the fetch call reports how many
// bytes it actually wrote. The buffer is sized to exactly what the driver
// reported, never a fixed guess.
fn read_log<F>(len: GLint, fetch: F) -> String
where
    F: FnOnce(GLsizei, *mut GLsizei, *mut GLchar),
{
    if len <= 0 {
        return String::new();
    }

    let mut buffer = vec![0u8; len as usize];
    let mut written: GLsizei = 0;
    fetch(len as GLsizei, &mut written, buffer.as_mut_ptr() as *mut GLchar);
    buffer.truncate(written.clamp(0, len) as usize);

    String::from_utf8_lossy(&buffer).into_owned()
}

use gl::types::GLenum;

/// Drains any error flags left over from earlier calls.
pub fn clear_gl_errors() {
    unsafe { while gl::GetError() != gl::NO_ERROR {} }
}

/// Logs every error flag currently set, naming the offending call site.
/// Returns `false` if at least one flag was set.
pub fn log_gl_errors(call: &str, file: &str, line: u32) -> bool {
    let mut clean = true;
    loop {
        let code = unsafe { gl::GetError() };
        if code == gl::NO_ERROR {
            break;
        }
        log::error!(
            "GL error {} (0x{code:04x}) in {call} at {file}:{line}",
            error_name(code)
        );
        clean = false;
    }
    clean
}

fn error_name(code: GLenum) -> &'static str {
    match code {
        gl::INVALID_ENUM => "INVALID_ENUM",
        gl::INVALID_VALUE => "INVALID_VALUE",
        gl::INVALID_OPERATION => "INVALID_OPERATION",
        gl::INVALID_FRAMEBUFFER_OPERATION => "INVALID_FRAMEBUFFER_OPERATION",
        gl::OUT_OF_MEMORY => "OUT_OF_MEMORY",
        _ => "UNKNOWN",
    }
}

/// Wraps a GL call so any error flag it raises is logged together with
/// the expression text and source location.
#[macro_export]
macro_rules! gl_check {
    ($call:expr) => {{
        $crate::render::debug::clear_gl_errors();
        let value = $call;
        $crate::render::debug::log_gl_errors(stringify!($call), file!(), line!());
        value
    }};
}

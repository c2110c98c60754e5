// Stage splitting and program construction for combined shader source files.

use gl::types::{GLenum, GLuint};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

use crate::render::driver::GlApi;

/// Marker substring that turns a line into a stage directive.
const STAGE_DIRECTIVE: &str = "# shader";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("source line {line} appears before any `# shader` directive")]
    MalformedSource { line: usize },
}

/// One stage failed to compile; `log` is the driver's diagnostic text.
#[derive(Debug, Error)]
#[error("{kind} shader compilation failed:\n{log}")]
pub struct CompileError {
    pub kind: StageKind,
    pub log: String,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Stage(#[from] CompileError),
    #[error("program linking failed:\n{0}")]
    Link(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Vertex,
    Fragment,
}

impl StageKind {
    pub(crate) fn gl_enum(self) -> GLenum {
        match self {
            StageKind::Vertex => gl::VERTEX_SHADER,
            StageKind::Fragment => gl::FRAGMENT_SHADER,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageKind::Vertex => "vertex",
            StageKind::Fragment => "fragment",
        })
    }
}

/// Per-stage source text recovered from one combined shader file.
#[derive(Clone, Debug)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

impl ShaderSource {
    /// Splits a combined source file into its vertex and fragment stages.
    ///
    /// A line containing `# shader` is a directive and is never copied to
    /// the output. A directive mentioning `vertex` selects the vertex
    /// stage; one mentioning `fragment` selects the fragment stage
    /// (`vertex` wins when a directive names both); a directive naming
    /// neither leaves the selection unchanged. Every other line lands in
    /// the currently selected stage, newline-terminated. A source line
    /// before the first selecting directive is malformed.
    pub fn parse(text: &str) -> Result<ShaderSource, ParseError> {
        let mut vertex = String::new();
        let mut fragment = String::new();
        let mut current: Option<StageKind> = None;

        for (index, line) in text.lines().enumerate() {
            if line.contains(STAGE_DIRECTIVE) {
                if line.contains("vertex") {
                    current = Some(StageKind::Vertex);
                } else if line.contains("fragment") {
                    current = Some(StageKind::Fragment);
                }
                continue;
            }

            let buffer = match current {
                Some(StageKind::Vertex) => &mut vertex,
                Some(StageKind::Fragment) => &mut fragment,
                None => return Err(ParseError::MalformedSource { line: index + 1 }),
            };
            buffer.push_str(line);
            buffer.push('\n');
        }

        Ok(ShaderSource { vertex, fragment })
    }
}

/// A compiled stage, alive only between compilation and linking.
struct StageUnit {
    id: GLuint,
    kind: StageKind,
}

fn compile_stage<G: GlApi>(
    gl: &G,
    kind: StageKind,
    source: &str,
) -> Result<StageUnit, CompileError> {
    let id = gl.create_shader(kind);
    gl.shader_source(id, source);
    gl.compile_shader(id);

    if gl.compile_status(id) {
        return Ok(StageUnit { id, kind });
    }

    // Fetch the diagnostic before the failed object goes away.
    let log = gl.shader_info_log(id);
    gl.delete_shader(id);
    Err(CompileError { kind, log })
}

/// Linked and validated shader program.
///
/// The id is never the driver's invalid-object sentinel (0). The handle
/// does not release itself; call [`Program::delete`] with the owning
/// driver handle once the program is no longer needed.
#[derive(Debug)]
pub struct Program {
    id: NonZeroU32,
}

impl Program {
    /// Builds a program from split stage sources: compile both stages,
    /// attach, link, validate. Stage units are deleted on every path past
    /// their compilation; a failed build deletes the program object too,
    /// so an error leaves nothing allocated driver-side.
    ///
    /// A stage compile failure aborts the build before the other work:
    /// the fragment stage is never compiled once the vertex stage has
    /// failed, and nothing is ever linked from a missing stage.
    pub fn build<G: GlApi>(gl: &G, source: &ShaderSource) -> Result<Program, BuildError> {
        let id = match NonZeroU32::new(gl.create_program()) {
            Some(id) => id,
            None => return Err(BuildError::Link(String::from("driver returned no program object"))),
        };
        let program = id.get();

        let vertex = match compile_stage(gl, StageKind::Vertex, &source.vertex) {
            Ok(unit) => unit,
            Err(err) => {
                gl.delete_program(program);
                return Err(err.into());
            }
        };

        let fragment = match compile_stage(gl, StageKind::Fragment, &source.fragment) {
            Ok(unit) => unit,
            Err(err) => {
                log::debug!(
                    "releasing unlinked {} stage after {} stage failure",
                    vertex.kind,
                    err.kind
                );
                gl.delete_shader(vertex.id);
                gl.delete_program(program);
                return Err(err.into());
            }
        };

        gl.attach_shader(program, vertex.id);
        gl.attach_shader(program, fragment.id);
        gl.link_program(program);

        // The stage units are part of the linked program now; they are
        // deleted whether or not the link succeeded.
        gl.delete_shader(vertex.id);
        gl.delete_shader(fragment.id);

        if !gl.link_status(program) {
            let log = gl.program_info_log(program);
            gl.delete_program(program);
            return Err(BuildError::Link(log));
        }

        gl.validate_program(program);
        if !gl.validate_status(program) {
            let log = gl.program_info_log(program);
            gl.delete_program(program);
            return Err(BuildError::Link(log));
        }

        Ok(Program { id })
    }

    pub fn id(&self) -> GLuint {
        self.id.get()
    }

    /// Makes this program the one used by subsequent draw calls.
    pub fn bind<G: GlApi>(&self, gl: &G) {
        gl.use_program(self.id.get());
    }

    /// Releases the driver-side program object.
    pub fn delete<G: GlApi>(self, gl: &G) {
        gl.delete_program(self.id.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    /// Scripted stand-in for the GL driver. Tracks every object the
    /// builder allocates so tests can assert that nothing leaks.
    #[derive(Default)]
    struct FakeGl {
        fail_compile: Vec<StageKind>,
        fail_link: bool,
        fail_validate: bool,
        refuse_programs: bool,
        inner: RefCell<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        next_id: GLuint,
        shaders: HashMap<GLuint, StageKind>,
        programs: HashSet<GLuint>,
        compiled: Vec<StageKind>,
        submitted: Vec<(StageKind, String)>,
        bound: GLuint,
    }

    impl FakeGl {
        fn failing_stage(kind: StageKind) -> Self {
            FakeGl {
                fail_compile: vec![kind],
                ..FakeGl::default()
            }
        }

        fn failing_link() -> Self {
            FakeGl {
                fail_link: true,
                ..FakeGl::default()
            }
        }

        fn failing_validation() -> Self {
            FakeGl {
                fail_validate: true,
                ..FakeGl::default()
            }
        }

        fn live_shaders(&self) -> usize {
            self.inner.borrow().shaders.len()
        }

        fn live_programs(&self) -> usize {
            self.inner.borrow().programs.len()
        }

        fn compile_order(&self) -> Vec<StageKind> {
            self.inner.borrow().compiled.clone()
        }

        fn submitted(&self) -> Vec<(StageKind, String)> {
            self.inner.borrow().submitted.clone()
        }

        fn bound(&self) -> GLuint {
            self.inner.borrow().bound
        }

        fn kind_of(&self, shader: GLuint) -> StageKind {
            self.inner.borrow().shaders[&shader]
        }
    }

    impl GlApi for FakeGl {
        fn create_shader(&self, kind: StageKind) -> GLuint {
            let mut state = self.inner.borrow_mut();
            state.next_id += 1;
            let id = state.next_id;
            state.shaders.insert(id, kind);
            id
        }

        fn shader_source(&self, shader: GLuint, source: &str) {
            let kind = self.kind_of(shader);
            self.inner.borrow_mut().submitted.push((kind, source.to_string()));
        }

        fn compile_shader(&self, shader: GLuint) {
            let kind = self.kind_of(shader);
            self.inner.borrow_mut().compiled.push(kind);
        }

        fn compile_status(&self, shader: GLuint) -> bool {
            !self.fail_compile.contains(&self.kind_of(shader))
        }

        fn shader_info_log(&self, shader: GLuint) -> String {
            format!("0:1(1): error: scripted {} failure", self.kind_of(shader))
        }

        fn delete_shader(&self, shader: GLuint) {
            let removed = self.inner.borrow_mut().shaders.remove(&shader);
            assert!(removed.is_some(), "double delete of shader {shader}");
        }

        fn create_program(&self) -> GLuint {
            if self.refuse_programs {
                return 0;
            }
            let mut state = self.inner.borrow_mut();
            state.next_id += 1;
            let id = state.next_id;
            state.programs.insert(id);
            id
        }

        fn attach_shader(&self, program: GLuint, shader: GLuint) {
            let state = self.inner.borrow();
            assert!(state.programs.contains(&program), "attach to dead program {program}");
            assert!(state.shaders.contains_key(&shader), "attach of dead shader {shader}");
        }

        fn link_program(&self, _program: GLuint) {}

        fn link_status(&self, _program: GLuint) -> bool {
            !self.fail_link
        }

        fn validate_program(&self, _program: GLuint) {}

        fn validate_status(&self, _program: GLuint) -> bool {
            !self.fail_validate
        }

        fn program_info_log(&self, _program: GLuint) -> String {
            if self.fail_link {
                String::from("error: scripted link failure: interface mismatch")
            } else if self.fail_validate {
                String::from("error: scripted validation failure")
            } else {
                String::new()
            }
        }

        fn delete_program(&self, program: GLuint) {
            let removed = self.inner.borrow_mut().programs.remove(&program);
            assert!(removed, "double delete of program {program}");
        }

        fn use_program(&self, program: GLuint) {
            self.inner.borrow_mut().bound = program;
        }
    }

    const COMBINED_SRC: &str =
        "# shader vertex\nvoid main() { gl_Position = vec4(0.0); }\n# shader fragment\nvoid main() {}\n";

    fn sample_source() -> ShaderSource {
        ShaderSource::parse(COMBINED_SRC).unwrap()
    }

    #[test]
    fn test_split_routes_lines_to_each_stage() {
        let text = "# shader vertex\nlayout(location = 0) in vec4 position;\nvoid main() { gl_Position = position; }\n# shader fragment\nlayout(location = 0) out vec4 color;\nvoid main() { color = vec4(1.0); }\n";
        let source = ShaderSource::parse(text).unwrap();

        assert_eq!(
            source.vertex,
            "layout(location = 0) in vec4 position;\nvoid main() { gl_Position = position; }\n"
        );
        assert_eq!(
            source.fragment,
            "layout(location = 0) out vec4 color;\nvoid main() { color = vec4(1.0); }\n"
        );
        assert_eq!(source.vertex.lines().count(), 2);
        assert_eq!(source.fragment.lines().count(), 2);
        assert!(!source.vertex.contains(STAGE_DIRECTIVE));
        assert!(!source.fragment.contains(STAGE_DIRECTIVE));
    }

    #[test]
    fn test_split_keeps_stage_on_unknown_directive() {
        let text = "# shader vertex\nfirst\n# shader geometry\nsecond\n";
        let source = ShaderSource::parse(text).unwrap();

        assert_eq!(source.vertex, "first\nsecond\n");
        assert_eq!(source.fragment, "");
    }

    #[test]
    fn test_split_rejects_source_before_first_directive() {
        let err = ShaderSource::parse("void main() {}\n# shader vertex\n").unwrap_err();

        match err {
            ParseError::MalformedSource { line } => assert_eq!(line, 1),
        }
    }

    #[test]
    fn test_split_prefers_vertex_when_directive_names_both() {
        // `vertex` is checked first, so a directive mentioning both
        // keywords selects the vertex stage.
        let text = "# shader vertex then fragment\npayload\n";
        let source = ShaderSource::parse(text).unwrap();

        assert_eq!(source.vertex, "payload\n");
        assert_eq!(source.fragment, "");
    }

    #[test]
    fn test_build_returns_program_and_frees_stage_units() {
        let gl = FakeGl::default();
        let source = sample_source();

        let program = Program::build(&gl, &source).unwrap();

        assert_ne!(program.id(), 0);
        assert_eq!(gl.live_shaders(), 0, "stage units must not outlive the build");
        assert_eq!(gl.live_programs(), 1);
        assert_eq!(gl.compile_order(), vec![StageKind::Vertex, StageKind::Fragment]);
        assert_eq!(
            gl.submitted(),
            vec![
                (StageKind::Vertex, source.vertex.clone()),
                (StageKind::Fragment, source.fragment.clone()),
            ]
        );

        let id = program.id();
        program.bind(&gl);
        assert_eq!(gl.bound(), id);

        program.delete(&gl);
        assert_eq!(gl.live_programs(), 0);
    }

    #[test]
    fn test_build_short_circuits_on_vertex_failure() {
        let gl = FakeGl::failing_stage(StageKind::Vertex);

        let err = Program::build(&gl, &sample_source()).unwrap_err();

        match err {
            BuildError::Stage(e) => {
                assert_eq!(e.kind, StageKind::Vertex);
                assert!(!e.log.is_empty());
            }
            other => panic!("expected a stage error, got {other:?}"),
        }
        // The fragment stage must never be compiled once the vertex failed.
        assert_eq!(gl.compile_order(), vec![StageKind::Vertex]);
        assert_eq!(gl.live_shaders(), 0);
        assert_eq!(gl.live_programs(), 0);
    }

    #[test]
    fn test_build_frees_vertex_unit_on_fragment_failure() {
        let gl = FakeGl::failing_stage(StageKind::Fragment);

        let err = Program::build(&gl, &sample_source()).unwrap_err();

        match err {
            BuildError::Stage(e) => assert_eq!(e.kind, StageKind::Fragment),
            other => panic!("expected a stage error, got {other:?}"),
        }
        assert_eq!(gl.compile_order(), vec![StageKind::Vertex, StageKind::Fragment]);
        assert_eq!(gl.live_shaders(), 0);
        assert_eq!(gl.live_programs(), 0);
    }

    #[test]
    fn test_build_surfaces_link_log_and_frees_everything() {
        let gl = FakeGl::failing_link();

        let err = Program::build(&gl, &sample_source()).unwrap_err();

        match err {
            BuildError::Link(log) => assert!(log.contains("link failure")),
            other => panic!("expected a link error, got {other:?}"),
        }
        assert_eq!(gl.live_shaders(), 0);
        assert_eq!(gl.live_programs(), 0);
    }

    #[test]
    fn test_build_surfaces_validation_log() {
        let gl = FakeGl::failing_validation();

        let err = Program::build(&gl, &sample_source()).unwrap_err();

        match err {
            BuildError::Link(log) => assert!(log.contains("validation failure")),
            other => panic!("expected a link error, got {other:?}"),
        }
        assert_eq!(gl.live_shaders(), 0);
        assert_eq!(gl.live_programs(), 0);
    }

    #[test]
    fn test_build_twice_yields_independent_programs() {
        let gl = FakeGl::default();
        let source = sample_source();

        let first = Program::build(&gl, &source).unwrap();
        let second = Program::build(&gl, &source).unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(gl.live_programs(), 2);
        assert_eq!(gl.live_shaders(), 0);
    }

    #[test]
    fn test_build_rejects_null_program_object() {
        let gl = FakeGl {
            refuse_programs: true,
            ..FakeGl::default()
        };

        let err = Program::build(&gl, &sample_source()).unwrap_err();

        assert!(matches!(err, BuildError::Link(_)));
        assert!(gl.compile_order().is_empty());
        assert_eq!(gl.live_shaders(), 0);
    }
}

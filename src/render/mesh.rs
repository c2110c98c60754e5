use gl::types::{GLsizei, GLsizeiptr, GLuint};
use std::mem;
use std::ptr;

use crate::gl_check;

/// Unit quad centered on the origin, two floats per vertex.
pub const QUAD_VERTICES: [f32; 8] = [
    -0.5, -0.5, // 0
    0.5, -0.5, // 1
    0.5, 0.5, // 2
    -0.5, 0.5, // 3
];

/// Two triangles sharing the quad's diagonal.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// GPU-resident quad: vertex array plus vertex and index buffers.
pub struct QuadMesh {
    vao: GLuint,
    vbo: GLuint,
    ibo: GLuint,
    index_count: GLsizei,
}

impl QuadMesh {
    /// Uploads the quad once; the buffers never change afterwards.
    pub fn new() -> QuadMesh {
        let mut vao = 0;
        let mut vbo = 0;
        let mut ibo = 0;

        unsafe {
            gl::GenVertexArrays(1, &mut vao);
            gl::BindVertexArray(vao);

            gl::GenBuffers(1, &mut vbo);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            gl_check!(gl::BufferData(
                gl::ARRAY_BUFFER,
                mem::size_of_val(&QUAD_VERTICES) as GLsizeiptr,
                QUAD_VERTICES.as_ptr().cast(),
                gl::STATIC_DRAW,
            ));

            gl::EnableVertexAttribArray(0);
            gl::VertexAttribPointer(
                0,
                2,
                gl::FLOAT,
                gl::FALSE,
                (2 * mem::size_of::<f32>()) as GLsizei,
                ptr::null(),
            );

            gl::GenBuffers(1, &mut ibo);
            gl::BindBuffer(gl::ELEMENT_ARRAY_BUFFER, ibo);
            gl_check!(gl::BufferData(
                gl::ELEMENT_ARRAY_BUFFER,
                mem::size_of_val(&QUAD_INDICES) as GLsizeiptr,
                QUAD_INDICES.as_ptr().cast(),
                gl::STATIC_DRAW,
            ));
        }

        QuadMesh {
            vao,
            vbo,
            ibo,
            index_count: QUAD_INDICES.len() as GLsizei,
        }
    }

    /// Issues the indexed draw for the quad.
    pub fn draw(&self) {
        unsafe {
            gl::BindVertexArray(self.vao);
            gl_check!(gl::DrawElements(
                gl::TRIANGLES,
                self.index_count,
                gl::UNSIGNED_INT,
                ptr::null(),
            ));
        }
    }
}

impl Drop for QuadMesh {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteBuffers(1, &self.vbo);
            gl::DeleteBuffers(1, &self.ibo);
            gl::DeleteVertexArrays(1, &self.vao);
        }
    }
}

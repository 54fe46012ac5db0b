use std::io;

/// Turns a message into the body of one frame.
pub trait Encode<'a> {
    /// Writes the owned part of `self` into `buf` and optionally hands back a borrowed tail,
    /// which goes on the wire right after `buf` without being copied.
    ///
    /// Gradients are sent this way, so a step never clones the parameter-sized buffer.
    fn encode(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}

/// Reads a message back from the body of one frame, borrowing from it where it can.
pub trait Decode<'a>: Sized {
    fn decode(body: &'a mut [u8]) -> io::Result<Self>;
}

/// An element of a receive buffer.
///
/// Frame bodies are read into buffers of these, so the body starts 4-byte aligned and the
/// `f32`s in it can be viewed without a copy.
pub trait Word: bytemuck::Pod {}

impl Word for u32 {}
impl Word for u64 {}
impl Word for f32 {}

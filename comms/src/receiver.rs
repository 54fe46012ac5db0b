use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    Decode, Word,
    frame::{self, FrameLen, PREFIX_SIZE},
};

/// The reading end of a framed link.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Storage for the frame body, grown as needed and reused across calls. The
    ///   returned message borrows from it.
    ///
    /// # Returns
    /// * `io::ErrorKind::UnexpectedEof` if the peer closed the link, even mid frame.
    /// * `io::ErrorKind::InvalidData` if the frame is oversized or doesn't decode.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Decode<'buf>,
        B: Word,
    {
        let mut prefix = [0; PREFIX_SIZE];
        self.rx.read_exact(&mut prefix).await.map_err(closed)?;

        let len = usize::try_from(FrameLen::from_be_bytes(prefix))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        frame::check_len(len)?;

        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());
        let body = &mut bytemuck::cast_slice_mut::<B, u8>(buf.as_mut_slice())[..len];
        self.rx.read_exact(body).await.map_err(closed)?;

        T::decode(body)
    }
}

fn closed(e: io::Error) -> io::Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            io::Error::new(io::ErrorKind::UnexpectedEof, "the peer closed the link")
        }
        _ => e,
    }
}

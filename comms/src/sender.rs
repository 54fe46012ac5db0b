use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    Encode,
    frame::{self, FrameLen, PREFIX_SIZE},
};

/// The writing end of a framed link.
///
/// Every `send` writes one frame: the body length followed by the encoded message.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Encodes `msg` and writes it as a single frame, flushing afterwards.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An `io::Error` if the message can't be encoded, is bigger than `MAX_FRAME_LEN` or
    /// the link is gone.
    pub async fn send<'a, T: Encode<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(PREFIX_SIZE, 0);

        let tail = msg.encode(buf)?;
        let body_len = buf.len() - PREFIX_SIZE + tail.map_or(0, <[u8]>::len);
        frame::check_len(body_len)?;

        buf[..PREFIX_SIZE].copy_from_slice(&(body_len as FrameLen).to_be_bytes());
        tx.write_all(buf).await?;

        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }
}

//! Framed message links between the workers of a run.

mod codec;
mod frame;
pub mod msg;
mod receiver;
mod sender;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Decode, Encode, Word};
pub use frame::MAX_FRAME_LEN;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;

/// Wraps the two halves of a stream into a framed link.
///
/// # Arguments
/// * `rx` - The readable half.
/// * `tx` - The writable half.
///
/// # Returns
/// The receiving and sending ends of the link.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}

use std::io;

/// The length prefix of every frame, big endian.
pub(crate) type FrameLen = u64;
pub(crate) const PREFIX_SIZE: usize = size_of::<FrameLen>();

/// Upper bound on a frame body. Bigger lengths mean a corrupt stream or a foreign peer.
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

pub(crate) fn check_len(len: usize) -> io::Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"),
        ));
    }

    Ok(())
}

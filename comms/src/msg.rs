use std::{borrow::Cow, io};

use crate::{Decode, Encode};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const GRADIENT_KIND: Header = 2;
const AVERAGED_KIND: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// A worker's local gradient for the current iteration, sent to the hub.
    Gradient(&'a [f32]),
    /// The gradient averaged over every worker, sent back by the hub.
    Averaged(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Disconnect,
}

/// The application layer message exchanged inside a process group.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name for this message's kind, meant for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Join { .. }) => "control/join",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(Payload::Gradient(_)) => "data/gradient",
            Msg::Data(Payload::Averaged(_)) => "data/averaged",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("the given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received an invalid message kind {kind}"),
        ))
    }
}

impl<'a> Encode<'a> for Msg<'a> {
    fn encode(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Gradient(grad) => (GRADIENT_KIND, *grad),
                    Payload::Averaged(grad) => (AVERAGED_KIND, *grad),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Decode<'a> for Msg<'a> {
    fn decode(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let rest: &'a [u8] = rest;
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);

        match Header::from_be_bytes(header) {
            ERR_KIND => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind @ (GRADIENT_KIND | AVERAGED_KIND) => {
                let nums = bytemuck::try_cast_slice(rest).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad f32 payload: {e}"))
                })?;

                let payload = if kind == GRADIENT_KIND {
                    Payload::Gradient(nums)
                } else {
                    Payload::Averaged(nums)
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(msg: &Msg<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = msg.encode(&mut buf).unwrap();
        if let Some(tail) = tail {
            buf.extend_from_slice(tail);
        }
        buf
    }

    #[test]
    fn control_message_survives_encoding() {
        let msg = Msg::Control(Command::Join {
            rank: 3,
            world_size: 4,
        });
        let mut raw = body_of(&msg);

        assert_eq!(Msg::decode(&mut raw).unwrap(), msg);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = 9u32.to_be_bytes().to_vec();
        let err = Msg::decode(&mut raw).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut raw = vec![0u8; 2];
        assert!(Msg::decode(&mut raw).is_err());
    }

    #[test]
    fn kind_names_data_direction() {
        assert_eq!(Msg::Data(Payload::Gradient(&[])).kind(), "data/gradient");
        assert_eq!(Msg::Data(Payload::Averaged(&[])).kind(), "data/averaged");
    }
}

use std::{borrow::Cow, io, time::Duration};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
};
use log::{info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};

use super::{
    GradientSync,
    sync::{ABORT_GRACE, bounded, lost, unexpected},
};
use crate::error::{Result, TrainErr};

const HUB_RANK: usize = 0;

/// A non-primary rank's end of the star all-reduce.
pub struct Spoke<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
    rx_buf: Vec<u32>,
    timeout: Option<Duration>,
    /// The hub failed or left, there's nobody to talk to.
    hub_gone: bool,
    closed: bool,
}

impl<R, W> Spoke<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Announces this rank to the hub and waits for its acknowledgement.
    ///
    /// # Arguments
    /// * `rank` - This worker's rank.
    /// * `world_size` - Amount of workers in the run.
    /// * `rx` - Receiving end of the hub channel.
    /// * `tx` - Sending end of the hub channel.
    pub async fn handshake(
        rank: usize,
        world_size: usize,
        mut rx: OnoReceiver<R>,
        mut tx: OnoSender<W>,
    ) -> Result<Self> {
        let join = Msg::Control(Command::Join { rank, world_size });
        tx.send(&join).await.map_err(lost)?;

        let mut rx_buf = Vec::new();
        match rx.recv_into(&mut rx_buf).await.map_err(lost)? {
            Msg::Control(Command::Join {
                rank: HUB_RANK,
                world_size: theirs,
            }) if theirs == world_size => {}
            msg => return Err(lost(unexpected(HUB_RANK, "a join acknowledgement", &msg))),
        }

        info!(rank = rank, world_size = world_size; "joined the process group");
        Ok(Self {
            rank,
            rx,
            tx,
            rx_buf,
            timeout: None,
            hub_gone: false,
            closed: false,
        })
    }

    /// Bounds how long a single all-reduce may wait for the group.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn reduce(&mut self, grads: &mut [f32]) -> io::Result<()> {
        self.tx.send(&Msg::Data(Payload::Gradient(grads))).await?;

        match self.rx.recv_into(&mut self.rx_buf).await? {
            Msg::Data(Payload::Averaged(avg)) if avg.len() == grads.len() => {
                grads.copy_from_slice(avg);
                Ok(())
            }
            Msg::Data(Payload::Averaged(avg)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "the hub sent an average of length {}, expected {}",
                    avg.len(),
                    grads.len()
                ),
            )),
            msg @ (Msg::Control(Command::Disconnect) | Msg::Err(_)) => {
                self.hub_gone = true;
                Err(unexpected(HUB_RANK, "an averaged gradient", &msg))
            }
            msg => Err(unexpected(HUB_RANK, "an averaged gradient", &msg)),
        }
    }

    async fn leave(&mut self) -> Result<()> {
        self.tx
            .send(&Msg::Control(Command::Disconnect))
            .await
            .map_err(lost)?;

        loop {
            match self.rx.recv_into(&mut self.rx_buf).await.map_err(lost)? {
                Msg::Control(Command::Disconnect) => return Ok(()),
                msg @ Msg::Err(_) => {
                    return Err(lost(unexpected(HUB_RANK, "a disconnect", &msg)));
                }
                msg => warn!(rank = self.rank; "ignoring {} while shutting down", msg.kind()),
            }
        }
    }
}

impl<R, W> GradientSync for Spoke<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn all_reduce_mean(&mut self, grads: &mut [f32]) -> Result<()> {
        if self.closed || self.hub_gone {
            return Err(TrainErr::Sync("the process group is closed".into()));
        }

        let timeout = self.timeout;
        bounded(timeout, async { self.reduce(grads).await.map_err(lost) }).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.hub_gone {
            return Ok(());
        }

        let timeout = self.timeout;
        bounded(timeout, self.leave()).await?;

        info!(rank = self.rank; "left the process group");
        Ok(())
    }

    async fn abort(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.hub_gone {
            let notice = Msg::Err(Cow::Borrowed(reason));
            let grace = self.timeout.unwrap_or(ABORT_GRACE);
            match time::timeout(grace, self.tx.send(&notice)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(rank = self.rank; "couldn't report the failure: {e}"),
                Err(_) => warn!(rank = self.rank; "gave up reporting the failure after {grace:?}"),
            }
        }

        warn!(rank = self.rank; "left the process group: {reason}");
    }
}

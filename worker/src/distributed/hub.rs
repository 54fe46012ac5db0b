use std::{borrow::Cow, io, time::Duration};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
};
use futures::future;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};

use super::{
    GradientSync,
    sync::{ABORT_GRACE, bounded, lost, unexpected},
};
use crate::error::{Result, TrainErr};

/// Where a peer stands in the group, as far as the hub has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Joined,
    /// Sent its disconnect and waits for the hub's.
    Leaving,
    /// Reported a failure, nothing more will come from it.
    Failed,
}

struct Peer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
    rx_buf: Vec<u32>,
    state: PeerState,
}

/// The rank 0 end of the star all-reduce.
///
/// Every iteration it receives one gradient per peer, averages them with its own and sends
/// the result back, so every rank steps its optimizer with the very same values.
pub struct Hub<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    world_size: usize,
    peers: Vec<Peer<R, W>>,
    timeout: Option<Duration>,
    closed: bool,
}

impl<R, W> Hub<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Waits for every peer to join and acknowledges them.
    ///
    /// # Arguments
    /// * `world_size` - Amount of workers in the run, the hub included.
    /// * `channels` - One channel per peer, in any order.
    ///
    /// # Returns
    /// A `TrainErr::Sync` if a peer announces a wrong world size, a rank out of range or a
    /// rank some other peer already took.
    pub async fn handshake(
        world_size: usize,
        channels: Vec<(OnoReceiver<R>, OnoSender<W>)>,
    ) -> Result<Self> {
        if channels.len() + 1 != world_size {
            return Err(TrainErr::Sync(format!(
                "a world of size {world_size} needs {} peers, got {}",
                world_size.saturating_sub(1),
                channels.len()
            )));
        }

        let futs = channels.into_iter().map(async |(mut rx, tx)| {
            let mut rx_buf = Vec::new();
            let rank = match rx.recv_into(&mut rx_buf).await? {
                Msg::Control(Command::Join {
                    rank,
                    world_size: theirs,
                }) if theirs == world_size && (1..world_size).contains(&rank) => rank,
                Msg::Control(Command::Join {
                    rank,
                    world_size: theirs,
                }) => {
                    let text = format!(
                        "a peer joined as rank {rank} of {theirs}, the group has {world_size} ranks"
                    );
                    return Err(io::Error::new(io::ErrorKind::InvalidData, text));
                }
                msg => {
                    let text = format!("expected a join, got {}", msg.kind());
                    return Err(io::Error::new(io::ErrorKind::InvalidData, text));
                }
            };

            Ok::<_, io::Error>(Peer {
                rank,
                rx,
                tx,
                rx_buf,
                state: PeerState::Joined,
            })
        });

        let mut peers = future::try_join_all(futs).await.map_err(lost)?;
        peers.sort_by_key(|peer| peer.rank);

        if let Some(w) = peers.windows(2).find(|w| w[0].rank == w[1].rank) {
            return Err(TrainErr::Sync(format!("rank {} joined twice", w[0].rank)));
        }

        let ack = Msg::Control(Command::Join {
            rank: 0,
            world_size,
        });
        let futs = peers.iter_mut().map(|peer| peer.tx.send(&ack));
        future::try_join_all(futs).await.map_err(lost)?;

        info!(world_size = world_size; "every peer joined the group");
        Ok(Self {
            world_size,
            peers,
            timeout: None,
            closed: false,
        })
    }

    /// Bounds how long a single all-reduce may wait for the group.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn reduce(&mut self, grads: &mut [f32]) -> Result<()> {
        if let Some(peer) = self.peers.iter().find(|p| p.state != PeerState::Joined) {
            return Err(TrainErr::Sync(format!(
                "rank {} is no longer part of the group",
                peer.rank
            )));
        }

        let len = grads.len();

        let futs = self.peers.iter_mut().map(async |peer| {
            let rank = peer.rank;
            match peer.rx.recv_into(&mut peer.rx_buf).await? {
                Msg::Data(Payload::Gradient(grad)) if grad.len() == len => Ok(grad),
                Msg::Data(Payload::Gradient(grad)) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "rank {rank} sent a gradient of length {}, expected {len}",
                        grad.len()
                    ),
                )),
                msg @ Msg::Control(Command::Disconnect) => {
                    peer.state = PeerState::Leaving;
                    Err(unexpected(rank, "a gradient", &msg))
                }
                msg @ Msg::Err(_) => {
                    peer.state = PeerState::Failed;
                    Err(unexpected(rank, "a gradient", &msg))
                }
                msg => Err(unexpected(rank, "a gradient", &msg)),
            }
        });

        let received = future::try_join_all(futs).await.map_err(lost)?;
        for grad in received {
            grads.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
        }

        let n = self.world_size as f32;
        grads.iter_mut().for_each(|g| *g /= n);

        let msg = Msg::Data(Payload::Averaged(grads));
        let futs = self.peers.iter_mut().map(|peer| peer.tx.send(&msg));
        future::try_join_all(futs).await.map_err(lost)?;

        debug!(peers = self.peers.len(); "gradients averaged");
        Ok(())
    }

    /// Waits for every joined peer's disconnect and answers each leaving peer with the hub's.
    async fn close(&mut self) -> Result<()> {
        let futs = self.peers.iter_mut().map(async |peer| {
            while peer.state == PeerState::Joined {
                match peer.rx.recv_into(&mut peer.rx_buf).await? {
                    Msg::Control(Command::Disconnect) => peer.state = PeerState::Leaving,
                    msg @ Msg::Err(_) => {
                        peer.state = PeerState::Failed;
                        return Err(unexpected(peer.rank, "a disconnect", &msg));
                    }
                    msg => warn!(rank = peer.rank; "ignoring {} while shutting down", msg.kind()),
                }
            }

            match peer.state {
                PeerState::Leaving => peer.tx.send(&Msg::Control(Command::Disconnect)).await,
                _ => Ok(()),
            }
        });

        // Every peer gets its answer before the first failure is reported.
        let results = future::join_all(futs).await;
        results.into_iter().try_for_each(|r| r).map_err(lost)
    }
}

impl<R, W> GradientSync for Hub<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn all_reduce_mean(&mut self, grads: &mut [f32]) -> Result<()> {
        if self.closed {
            return Err(TrainErr::Sync("the process group is closed".into()));
        }

        let timeout = self.timeout;
        bounded(timeout, self.reduce(grads)).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let timeout = self.timeout;
        bounded(timeout, self.close()).await?;
        info!("process group closed");
        Ok(())
    }

    async fn abort(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let notice = Msg::Err(Cow::Borrowed(reason));
        let futs = self
            .peers
            .iter_mut()
            .filter(|peer| peer.state != PeerState::Failed)
            .map(async |peer| {
                if let Err(e) = peer.tx.send(&notice).await {
                    warn!(rank = peer.rank; "couldn't report the failure: {e}");
                }
            });

        let grace = self.timeout.unwrap_or(ABORT_GRACE);
        if time::timeout(grace, future::join_all(futs)).await.is_err() {
            warn!("gave up reporting the failure after {grace:?}");
        }

        self.peers.clear();
        warn!("left the process group: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{self as tokio_io, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::distributed::Spoke;

    type Link = (OnoReceiver<ReadHalf<DuplexStream>>, OnoSender<WriteHalf<DuplexStream>>);

    fn link() -> (Link, Link) {
        let (one, two) = tokio_io::duplex(4096);
        let (rx1, tx1) = tokio_io::split(one);
        let (rx2, tx2) = tokio_io::split(two);
        (comms::channel(rx1, tx1), comms::channel(rx2, tx2))
    }

    async fn pair(
        timeout: Option<Duration>,
    ) -> (
        Hub<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
        Spoke<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
    ) {
        let (hub_end, (rx, tx)) = link();
        let (hub, spoke) = tokio::join!(
            Hub::handshake(2, vec![hub_end]),
            Spoke::handshake(1, 2, rx, tx),
        );
        (
            hub.unwrap().with_timeout(timeout),
            spoke.unwrap().with_timeout(timeout),
        )
    }

    #[tokio::test]
    async fn averages_with_the_peer() {
        let (mut hub, mut spoke) = pair(None).await;
        let mut ours = vec![1.0, 2.0];
        let mut theirs = vec![3.0, -2.0];

        let (a, b) = tokio::join!(
            hub.all_reduce_mean(&mut ours),
            spoke.all_reduce_mean(&mut theirs),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(ours, [2.0, 0.0]);
        assert_eq!(ours, theirs);
    }

    #[tokio::test]
    async fn a_silent_peer_times_out_the_barrier() {
        let (mut hub, _spoke) = pair(Some(Duration::from_millis(50))).await;
        let mut grads = vec![1.0; 3];

        let err = hub.all_reduce_mean(&mut grads).await.unwrap_err();
        assert!(matches!(err, TrainErr::Sync(_)));
    }

    #[tokio::test]
    async fn shutdown_is_bounded_by_the_timeout() {
        let (mut hub, _spoke) = pair(Some(Duration::from_millis(50))).await;

        let err = hub.shutdown().await.unwrap_err();
        assert!(matches!(err, TrainErr::Sync(_)));
    }

    #[tokio::test]
    async fn a_peer_leaving_mid_reduce_still_gets_its_answer() {
        let (mut hub, mut spoke) = pair(None).await;
        let mut grads = vec![1.0; 3];

        let hub_side = async {
            let reduced = hub.all_reduce_mean(&mut grads).await;
            (reduced, hub.shutdown().await)
        };
        let both = time::timeout(Duration::from_secs(5), async {
            tokio::join!(hub_side, spoke.shutdown())
        });

        let ((reduced, closed), left) = both.await.unwrap();
        assert!(matches!(reduced, Err(TrainErr::Sync(_))));
        closed.unwrap();
        left.unwrap();
    }

    #[tokio::test]
    async fn abort_reaches_a_peer_blocked_on_the_barrier() {
        let (mut hub, mut spoke) = pair(None).await;
        let mut grads = vec![1.0; 3];

        let mut theirs = grads.clone();
        let (reduced, _) = tokio::join!(
            spoke.all_reduce_mean(&mut theirs),
            hub.abort("disk full"),
        );

        match reduced {
            Err(TrainErr::Sync(reason)) => assert!(reason.contains("disk full")),
            other => panic!("expected a sync failure, got {other:?}"),
        }
        assert!(hub.all_reduce_mean(&mut grads).await.is_err());
    }
}

use std::time::Duration;

use log::{info, warn};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use super::{GradientSync, Hub, Solo, Spoke, WorkerTopology, sync::lost};
use crate::error::Result;

const CONNECT_ATTEMPTS: usize = 60;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// The gradient-averaging group this process belongs to.
pub enum ProcessGroup {
    Solo(Solo),
    Hub(Hub<OwnedReadHalf, OwnedWriteHalf>),
    Spoke(Spoke<OwnedReadHalf, OwnedWriteHalf>),
}

impl ProcessGroup {
    /// Joins the group `topology` describes over tcp.
    ///
    /// The primary listens on the rendezvous address until every other rank connected, the
    /// rest connect to it, retrying while the primary isn't up yet.
    ///
    /// # Arguments
    /// * `topology` - This process's place in the run.
    /// * `timeout` - Optional bound on every all-reduce.
    ///
    /// # Returns
    /// A `TrainErr::Sync` if the group can't be formed.
    pub async fn init(topology: &WorkerTopology, timeout: Option<Duration>) -> Result<Self> {
        if !topology.is_distributed() {
            return Ok(Self::Solo(Solo));
        }

        let (rank, world_size) = (topology.rank(), topology.world_size());
        let addr = topology.master_addr();

        if topology.is_primary() {
            let listener = TcpListener::bind(addr).await.map_err(lost)?;
            info!(world_size = world_size; "waiting for peers at {addr}");

            let mut channels = Vec::with_capacity(world_size - 1);
            while channels.len() + 1 < world_size {
                let (stream, peer_addr) = listener.accept().await.map_err(lost)?;
                stream.set_nodelay(true).map_err(lost)?;
                info!("peer connected from {peer_addr}");

                let (rx, tx) = stream.into_split();
                channels.push(comms::channel(rx, tx));
            }

            let hub = Hub::handshake(world_size, channels).await?;
            return Ok(Self::Hub(hub.with_timeout(timeout)));
        }

        let stream = connect(addr).await?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        let spoke = Spoke::handshake(rank, world_size, rx, tx).await?;
        Ok(Self::Spoke(spoke.with_timeout(timeout)))
    }
}

async fn connect(addr: &str) -> Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(lost)?;
                return Ok(stream);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt = attempt; "couldn't reach the primary at {addr}: {e}, retrying");
                attempt += 1;
                time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(lost(e)),
        }
    }
}

impl GradientSync for ProcessGroup {
    async fn all_reduce_mean(&mut self, grads: &mut [f32]) -> Result<()> {
        match self {
            ProcessGroup::Solo(solo) => solo.all_reduce_mean(grads).await,
            ProcessGroup::Hub(hub) => hub.all_reduce_mean(grads).await,
            ProcessGroup::Spoke(spoke) => spoke.all_reduce_mean(grads).await,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self {
            ProcessGroup::Solo(solo) => solo.shutdown().await,
            ProcessGroup::Hub(hub) => hub.shutdown().await,
            ProcessGroup::Spoke(spoke) => spoke.shutdown().await,
        }
    }

    async fn abort(&mut self, reason: &str) {
        match self {
            ProcessGroup::Solo(solo) => solo.abort(reason).await,
            ProcessGroup::Hub(hub) => hub.abort(reason).await,
            ProcessGroup::Spoke(spoke) => spoke.abort(reason).await,
        }
    }
}

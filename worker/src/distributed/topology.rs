use std::env;

use crate::error::{ConfigErr, Result};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: &str = "29500";

/// Where this process sits in the run. Established once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTopology {
    rank: usize,
    world_size: usize,
    distributed: bool,
    master_addr: String,
}

impl WorkerTopology {
    /// A non-distributed run with a single worker.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            distributed: false,
            master_addr: format!("{DEFAULT_MASTER_ADDR}:{DEFAULT_MASTER_PORT}"),
        }
    }

    /// A distributed run.
    ///
    /// # Arguments
    /// * `rank` - This process's rank, below `world_size`.
    /// * `world_size` - Amount of workers in the run.
    /// * `master_addr` - The `host:port` the primary listens on.
    pub fn distributed(
        rank: usize,
        world_size: usize,
        master_addr: impl Into<String>,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(ConfigErr::InvalidValue {
                key: "RANK".into(),
                reason: format!("rank {rank} is outside a world of size {world_size}"),
            }
            .into());
        }

        Ok(Self {
            rank,
            world_size,
            distributed: true,
            master_addr: master_addr.into(),
        })
    }

    /// Reads the topology from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| env::var(key).ok())
    }

    /// Reads the topology through `var`.
    ///
    /// The run is distributed iff `LOCAL_RANK` is set. `RANK` defaults to `LOCAL_RANK`,
    /// `WORLD_SIZE` is required, and the rendezvous is `MASTER_ADDR:MASTER_PORT`.
    pub fn from_env_with(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let Some(local_rank) = var("LOCAL_RANK") else {
            return Ok(Self::single());
        };

        let parse = |key: &str, raw: String| {
            raw.parse::<usize>().map_err(|e| ConfigErr::InvalidValue {
                key: key.to_string(),
                reason: format!("{raw:?} is not a valid integer: {e}"),
            })
        };

        let local_rank = parse("LOCAL_RANK", local_rank)?;
        let rank = match var("RANK") {
            Some(raw) => parse("RANK", raw)?,
            None => local_rank,
        };
        let world_size = var("WORLD_SIZE").ok_or_else(|| ConfigErr::InvalidValue {
            key: "WORLD_SIZE".into(),
            reason: "must be set for distributed runs".into(),
        })?;
        let world_size = parse("WORLD_SIZE", world_size)?;

        let host = var("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let port = var("MASTER_PORT").unwrap_or_else(|| DEFAULT_MASTER_PORT.to_string());

        Self::distributed(rank, world_size, format!("{host}:{port}"))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    /// Only the primary logs, evaluates and writes checkpoints.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// The rendezvous address of the process group.
    pub fn master_addr(&self) -> &str {
        &self.master_addr
    }
}

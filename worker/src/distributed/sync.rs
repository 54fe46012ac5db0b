use std::{io, time::Duration};

use comms::msg::Msg;
use tokio::time;

use crate::error::{Result, TrainErr};

/// Averages gradients across every worker of the run.
#[allow(unused)]
#[trait_variant::make(GradientSync: Send)]
pub trait LocalGradientSync {
    /// Replaces `grads` with the mean of every worker's `grads` for this iteration.
    ///
    /// Blocks until every worker has contributed, so all of them leave with the same values.
    ///
    /// # Arguments
    /// * `grads` - This worker's gradient, overwritten with the average.
    ///
    /// # Returns
    /// A `TrainErr::Sync` if a peer misbehaves, disconnects or the barrier times out.
    async fn all_reduce_mean(&mut self, grads: &mut [f32]) -> Result<()>;

    /// Leaves the group cleanly. Further calls are no-ops.
    ///
    /// # Returns
    /// A `TrainErr::Sync` if a peer failed instead of leaving, or the group didn't answer
    /// within the barrier timeout.
    async fn shutdown(&mut self) -> Result<()>;

    /// Tells the rest of the group this worker failed with `reason` and lets go of it.
    ///
    /// Never waits for an answer. A notice that can't be delivered is only logged.
    async fn abort(&mut self, reason: &str);
}

/// The group of a non-distributed run: averaging over one worker changes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Solo;

impl GradientSync for Solo {
    async fn all_reduce_mean(&mut self, _grads: &mut [f32]) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self, _reason: &str) {}
}

/// How long a failing worker tries to deliver its notice when no barrier timeout is set.
pub(super) const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Runs `fut`, failing with `TrainErr::Sync` if it takes longer than `timeout`.
pub(super) async fn bounded<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => time::timeout(limit, fut).await.map_err(|_| {
            TrainErr::Sync(format!("the group didn't answer within {limit:?}"))
        })?,
        None => fut.await,
    }
}

/// Turns a transport failure into a synchronization failure.
pub(super) fn lost(e: io::Error) -> TrainErr {
    TrainErr::Sync(e.to_string())
}

/// The error for a message that doesn't belong at this point of the protocol.
pub(super) fn unexpected(rank: usize, expected: &str, msg: &Msg<'_>) -> io::Error {
    let text = match msg {
        Msg::Err(detail) => format!("rank {rank} failed: {detail}"),
        msg => format!("expected {expected} from rank {rank}, got {}", msg.kind()),
    };
    io::Error::new(io::ErrorKind::InvalidData, text)
}

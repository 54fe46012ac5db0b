mod group;
mod hub;
mod spoke;
mod sync;
mod topology;

pub use group::ProcessGroup;
pub use hub::Hub;
pub use spoke::Spoke;
pub use sync::{GradientSync, Solo};
pub use topology::WorkerTopology;

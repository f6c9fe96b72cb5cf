mod clock;
mod handler;
mod store;

pub use clock::{Clock, SystemClock};
pub use handler::BatchHandler;
pub use store::{
    AtomicBatch, AtomicBatchOutcome, BatchGuard, CommandReply, CoordinationStore, StoreCommand,
};

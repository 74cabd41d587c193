//! Forward error correction: the Reed-Solomon codec plus the bounded
//! priority queue that schedules encode/decode jobs across splitfile
//! segments.

pub mod codec;
pub mod queue;

pub use codec::{bucket_of, BlockSlot, FecCodec};
pub use queue::{FecJob, FecQueue, NUM_PRIORITIES};

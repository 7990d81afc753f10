pub mod body_stream;

pub use body_stream::{GuardedStream, MeteredStream, TransferOutcome, TransferStats};

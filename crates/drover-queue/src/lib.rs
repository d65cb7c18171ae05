mod connection;
mod pool;
mod proto;

pub use connection::Connection;
pub use pool::Pool;
pub use proto::{Command, QueueCodec, Reply, MAX_JOB_SIZE};

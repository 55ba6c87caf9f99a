pub mod buffer_pool;
pub mod graceful_shutdown;
pub mod routines;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
pub use routines::{PoolError, RoutinePool};

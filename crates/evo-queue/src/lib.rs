//! evo-queue: queue-interface backends, the connection pool and the
//! queue-snapshot cache.
//!
//! Backends: `LocalQueue` (child processes), `InternalQueue` (in-process
//! evaluation on a blocking thread) and `RemoteQueue<A>` for the batch
//! schedulers PBS, SGE, LSF, SLURM and LoadLeveler.
pub mod internal;
pub mod local;
pub mod pool;
pub mod remote;
pub mod snapshot;
pub mod transport;

pub use internal::InternalQueue;
pub use local::{LocalQueue, LocalQueueConfig};
pub use pool::{ConnectionHandle, ConnectionPool, PoolError};
pub use remote::{
    LoadLeveler, LoadLevelerQueue, Lsf, LsfQueue, Pbs, PbsQueue, QueueCode, RemoteQueue,
    RemoteQueueConfig, SchedulerAdapter, Sge, SgeQueue, Slurm, SlurmQueue,
};
pub use snapshot::SnapshotCache;
pub use transport::{
    ExecOutput, SessionFactory, ShellSessionFactory, ShellTransport, ShellTransportConfig,
    Transport, TransportError,
};

//! Loader engine
//!
//! Data flow for one job:
//! allocator -> reader (inflight + 1) -> pool task -> stream processor ->
//! record handler -> completion tracker -> reader (inflight - 1, mark done).

pub mod allocator;
pub mod completion;
pub mod entry;
pub mod heartbeat;
pub mod job;
pub mod pool;
pub mod reader;
pub mod scanner;
pub mod stream;

pub use allocator::{DirectoryAllocator, LeaseAllocator, LedgerAllocator};
pub use completion::CompletionTracker;
pub use entry::{RecordHandler, ResourceEntry, ResourceEntryProcessor};
pub use heartbeat::spawn_heartbeat;
pub use job::{BucketJob, JobDoneHandler, JobStats};
pub use pool::WorkerPool;
pub use reader::{Reader, ReaderSettings, ReaderState};
pub use scanner::{BucketScanner, ScanTarget};
pub use stream::{resource_cost, StreamProcessor, StreamSettings, StreamStats};

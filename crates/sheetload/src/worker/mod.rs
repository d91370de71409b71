pub mod pool;
pub mod task;

pub use pool::{TaskExecutor, WorkerPool};
pub use task::{IngestSource, Task, TaskKind, TaskResult};

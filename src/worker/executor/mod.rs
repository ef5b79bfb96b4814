mod host;
mod sequential;

pub use self::host::{BackupPolicy, ThreadPoolExecutor};
pub use self::sequential::SequentialExecutor;

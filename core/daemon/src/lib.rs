//! relay-daemon: wakes managed workers when they are mentioned in the shared
//! message log, supervises the resulting processes and tracks their presence.

pub mod cancel;
pub mod config;
pub mod daemon;
pub mod debounce;
pub mod driver;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod presence;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod telemetry;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use cancel::CancelToken;
pub use config::{load_config, DaemonConfig};
pub use daemon::{Daemon, RunningDaemon, StopHandle, TickReport};
pub use error::{ConfigError, DaemonError, LockError, SpawnError, StoreError};
pub use store::{SqliteStore, Store};

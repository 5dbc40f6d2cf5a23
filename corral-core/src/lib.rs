// ABOUTME: Host side of corral: configuration, container launch, and the Session Host Controller.
// ABOUTME: Also provides the group dispatcher, persisted session ids, and Prometheus metrics.

pub mod config;
pub mod container;
pub mod deadlines;
pub mod dispatcher;
pub mod host;
pub mod metrics;
pub mod paths;
pub mod session;

pub use config::Config;
pub use container::{ContainerSpec, Launch, Launcher, RuntimeLauncher};
pub use deadlines::{Expiry, LivenessDeadlines, Timeouts};
pub use dispatcher::Dispatcher;
pub use host::{HostLimits, HostRun, RunOutcome, SessionHost};
pub use session::{GroupSession, SessionStore};

// Re-export the wire types hosts exchange with containers
pub use corral_agent::{BackendKind, ContainerInput, ContainerOutput, OutputStatus};

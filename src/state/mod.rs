//! In-memory state: workers, metrics, sessions, logs, and the event bus.

pub mod model;
pub mod ring;
pub mod store;

pub use model::{
    AuthStatus, ConsoleEvent, ControlPlaneStatus, LogEntry, LogFilter, LogLevel, RecentActivity,
    SessionInfo, SessionStatus, SessionType, WorkerInfo, WorkerMetrics, WorkerStatus,
};
pub use ring::RingBuffer;
pub use store::{StateStore, Subscription};

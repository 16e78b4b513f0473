//! searchlink-server: service plumbing under the HTTP surface
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             searchlink-server                │
//! ├─────────────────────────────────────────────┤
//! │  config.rs   - settings tree + change events│
//! │  session.rs  - cookie-bound session manager │
//! │  gate.rs     - at-most-one-run task gate    │
//! │  schedule.rs - cron-driven periodic tasks   │
//! │  poller.rs   - incremental adaptor polling  │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod gate;
pub mod poller;
pub mod schedule;
pub mod session;

pub use config::{AdaptorConfig, ConfigEvent, ConfigHandle, ConfigLoadError};
pub use gate::ExclusiveTask;
pub use poller::IncrementalPoller;
pub use schedule::{CronScheduler, ScheduleError, ScheduleId};
pub use session::{Session, SessionHandle, SessionManager};

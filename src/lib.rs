//! Core library for the hrobot provisioning tool.
//!
//! The crate drives bare-metal servers rented through the Hetzner Robot API
//! from an empty rescue system to a booted, encrypted, cluster-joined node.
//! [`resource::ServerLifecycle`] owns the create/read/update/delete
//! semantics of a managed server and hands the imaging work to the
//! [`pipeline::ProvisioningPipeline`] state machine, which talks to the host
//! over [`session::RemoteSession`]. Orders and virtual switches have their
//! own small lifecycles in [`transactions`] and [`vswitch`].

pub mod allocator;
pub mod config;
pub mod disks;
pub mod logging;
pub mod payload;
pub mod pipeline;
pub mod resource;
pub mod robot;
pub mod session;
pub mod test_support;
pub mod transactions;
pub mod vswitch;
pub mod waiter;

pub use allocator::{AllocatorError, PrivateIpAllocator};
pub use config::{ConfigError, RobotConfig};
pub use pipeline::{PipelineConfig, PipelineStage, ProvisionError, ProvisioningPipeline};
pub use resource::{LifecycleError, ManagedServer, ManagedServerState, ServerLifecycle};
pub use robot::{RobotApi, RobotClient, RobotError};
pub use session::{CommandRunner, ProcessCommandRunner, RemoteSession, SessionConfig};
pub use transactions::{OrderKind, OrderLifecycle, TransactionCache, TransactionError};
pub use vswitch::{VSwitchLifecycle, VSwitchSpec};

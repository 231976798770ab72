//! apiary — an agent-hosting runtime.
//!
//! A fleet of small, mostly-idle, individually-addressable agents lives in
//! one process: persisted by a state backend, instantiated lazily, served
//! JSON-RPC over pluggable transports, scheduled delayed work, and wired
//! together through a publish/subscribe event layer.
//!
//! The pieces, leaves first:
//!
//! - [`state`]: the persistent per-agent KV store interface and backends.
//! - [`rpc`]: the JSON-RPC envelope, dispatch tables, and the class registry.
//! - [`agent`]: the `Agent` trait, retargetable handles, and the operation
//!   context.
//! - [`instantiation`]: lazy lifecycle plus the two-phase cold boot.
//! - [`callbacks`]: tag → pending-call correlation between sends and
//!   responses.
//! - [`scheduler`]: delayed, cancelable self-RPC tasks.
//! - [`events`]: per-agent subscription tables and trigger fan-out.
//! - [`host`]: the coordinator routing `receive`/`send` across all of it.
//! - [`transport`]: the carrier interface and the HTTP implementation.

pub mod agent;
pub mod callbacks;
pub mod config;
pub mod demo;
pub mod events;
pub mod host;
pub mod instantiation;
pub mod logging;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod types;

pub use agent::{Agent, AgentClass, AgentContext, AgentHandle};
pub use callbacks::{CallbackRegistry, PendingCall};
pub use config::{AgentSeed, ConfigError, HostConfig, HttpConfig, SchedulerSettings};
pub use events::{EventBus, Subscription};
pub use host::{AgentHost, HostOptions};
pub use instantiation::{BootHandle, DeferredStats, InstantiationEntry, InstantiationService};
pub use rpc::dispatch::{optional, required, Authorizor, MethodAllowList, MethodTable};
pub use rpc::registry::AgentRegistry;
pub use rpc::{JsonRpcRequest, JsonRpcResponse, RpcError};
pub use scheduler::TaskScheduler;
pub use state::{build_store, FileStateStore, MemoryStateStore, StateBackend, StateConfig, StateStore};
pub use transport::{HttpRpcServer, HttpTransport, Transport};
pub use types::{
    AgentUrl, HostError, InstantiationError, SchedulerError, StateError, Tag, TransportError,
};

pub mod classify;
pub mod error;
pub mod key_pool;
pub mod queue;
pub mod service;

pub use error::{PoolError, QueueError, RouteError};
pub use key_pool::{
    Backend, Capability, DisableReason, Key, KeyChecker, KeyPatch, KeyPool, KeySnapshot, KeyStatus,
    KeyStore, VendorPolicy,
};
pub use queue::{
    Dispatch, EnqueueRequest, Identity, Lane, PromptBudget, QueueMode, QueueSettings, QueueTicket,
    QueuedRequest, RequestQueue,
};
pub use service::{Service, route_to_service};

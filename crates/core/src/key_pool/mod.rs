//! Credential records, per-vendor stores, the pool that routes between them, and the
//! background checker that keeps key state honest.

mod checker;
mod key;
pub mod policy;
mod pool;
mod store;

pub use checker::{KEY_CHECK_PERIOD, KeyChecker, MIN_CHECK_INTERVAL, ProbeVerdict, classify_probe};
pub use key::{Backend, Capability, DisableReason, Key, KeyPatch, KeySnapshot, KeyStatus, key_id};
pub use policy::VendorPolicy;
pub use pool::KeyPool;
pub use store::{KeyStore, parse_reset_duration};

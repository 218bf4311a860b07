use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::http::HeaderMap;

use crate::error::PoolError;
use crate::key_pool::key::{DisableReason, Key, KeyPatch, KeySnapshot};
use crate::key_pool::policy::detect_service;
use crate::key_pool::store::KeyStore;
use crate::service::{Service, route_to_service};

/// One `KeyStore` per vendor, fixed for the lifetime of the pool.
pub struct KeyPool {
    stores: BTreeMap<Service, Arc<KeyStore>>,
    checks_enabled: AtomicBool,
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPool {
    pub fn new() -> Self {
        let stores = Service::ALL
            .into_iter()
            .map(|svc| (svc, Arc::new(KeyStore::new(svc))))
            .collect();
        Self {
            stores,
            checks_enabled: AtomicBool::new(false),
        }
    }

    /// Build a pool from `(vendor, comma-separated credentials)` pairs.
    pub fn from_credentials<'a>(credentials: impl IntoIterator<Item = (Service, &'a str)>) -> Self {
        let pool = Self::new();
        for (service, list) in credentials {
            pool.store(service).load(list);
        }
        pool
    }

    pub fn store(&self, service: Service) -> &Arc<KeyStore> {
        // Every vendor gets a store in `new`, so the index cannot miss.
        &self.stores[&service]
    }

    pub fn stores(&self) -> impl Iterator<Item = &Arc<KeyStore>> {
        self.stores.values()
    }

    pub fn set_checks_enabled(&self, enabled: bool) {
        self.checks_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn route(&self, model: &str) -> Result<Service, PoolError> {
        Ok(route_to_service(model)?)
    }

    pub fn get(&self, model: &str, apply_lockout: bool) -> Result<Key, PoolError> {
        let service = self.route(model)?;
        self.store(service).select(model, apply_lockout)
    }

    pub fn lockout_period(&self, model: &str) -> Duration {
        match route_to_service(model) {
            Ok(service) => self.store(service).lockout_period(model),
            Err(_) => Duration::ZERO,
        }
    }

    pub fn mark_rate_limited(&self, key: &Key) -> Result<(), PoolError> {
        self.store(key.service()).mark_rate_limited(key.id())
    }

    pub fn disable(&self, key: &Key, reason: DisableReason) -> Result<(), PoolError> {
        self.store(key.service()).disable(key.id(), reason)
    }

    pub fn update(
        &self,
        key: &Key,
        expected_version: Option<u64>,
        patch: &KeyPatch,
    ) -> Result<u64, PoolError> {
        self.store(key.service())
            .update(key.id(), expected_version, patch)
    }

    pub fn update_rate_limits(&self, key: &Key, headers: &HeaderMap) -> Result<(), PoolError> {
        self.store(key.service())
            .update_rate_limits(key.id(), headers)
    }

    pub fn increment_prompt(&self, key: &Key) -> Result<(), PoolError> {
        self.store(key.service()).increment_prompt(key.id())
    }

    pub fn delete(&self, key: &Key) -> bool {
        self.store(key.service()).delete(key.id())
    }

    /// Add a credential, detecting its vendor from the secret's shape.
    pub fn add_key(&self, secret: &str) -> Result<String, PoolError> {
        let service = detect_service(secret).ok_or(PoolError::UnrecognizedCredential)?;
        self.store(service).add(secret)
    }

    pub fn delete_by_id(&self, id: &str) -> bool {
        self.stores().any(|s| s.delete(id))
    }

    pub fn get_by_id(&self, id: &str) -> Option<KeySnapshot> {
        self.stores().find_map(|s| s.get(id))
    }

    pub fn list(&self) -> Vec<KeySnapshot> {
        self.stores().flat_map(|s| s.list()).collect()
    }

    /// Active keys for one vendor, or for every vendor with `None`.
    pub fn available(&self, service: Option<Service>) -> usize {
        match service {
            Some(svc) => self.store(svc).available(),
            None => self.stores().map(|s| s.available()).sum(),
        }
    }

    pub fn any_unchecked(&self) -> bool {
        self.checks_enabled.load(Ordering::Relaxed) && self.stores().any(|s| s.any_unchecked())
    }

    pub fn recheck(&self, service: Option<Service>) {
        match service {
            Some(svc) => self.store(svc).recheck(),
            None => self.stores().for_each(|s| s.recheck()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pool_routes_to_vendor_store() {
        let pool = KeyPool::from_credentials([
            (Service::OpenAi, "sk-a,sk-b"),
            (Service::Anthropic, "sk-ant-a"),
        ]);
        assert_eq!(pool.available(None), 3);
        assert_eq!(pool.available(Some(Service::OpenAi)), 2);
        assert_eq!(pool.available(Some(Service::Google)), 0);

        let key = pool.get("claude-3-haiku", false).unwrap();
        assert_eq!(key.service(), Service::Anthropic);
        assert!(matches!(
            pool.get("made-up-model", false),
            Err(PoolError::Route(_))
        ));
    }

    #[test]
    fn add_key_detects_vendor_and_rejects_duplicates() {
        let pool = KeyPool::new();
        let id = pool.add_key("sk-ant-api03-xyz").unwrap();
        assert!(id.starts_with("ant-"));
        assert_eq!(pool.add_key("sk-ant-api03-xyz"), Err(PoolError::DuplicateKey));
        assert_eq!(pool.add_key("???"), Err(PoolError::UnrecognizedCredential));
        assert!(pool.get_by_id(&id).is_some());
        assert!(pool.delete_by_id(&id));
        assert!(pool.get_by_id(&id).is_none());
    }

    #[test]
    fn any_unchecked_requires_checks_enabled() {
        let pool = KeyPool::from_credentials([(Service::Mistral, "m1")]);
        assert!(!pool.any_unchecked());
        pool.set_checks_enabled(true);
        assert!(pool.any_unchecked());
    }

    #[test]
    fn listing_never_exposes_secrets() {
        let pool = KeyPool::from_credentials([(Service::Cohere, "super-secret-value")]);
        let json = serde_json::to_string(&pool.list()).unwrap();
        assert!(!json.contains("super-secret-value"));
        assert!(json.contains("\"service\":\"cohere\""));
    }
}

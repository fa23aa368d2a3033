use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    error::{EngineError, SubscriberError},
    sources::FeedSource,
};

use super::{
    detector::{classify, Classification, Watermark},
    post::Post,
};

/// Receiver of new posts of one tracked identity.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, post: &Post) -> Result<(), SubscriberError>;
}

/// Recorded state of a tracked identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityState {
    pub uid: String,
    pub display_name: String,
    pub watermark: Watermark,
}

struct TrackedIdentity {
    display_name: String,
    watermark: Watermark,
    subscribers: BTreeMap<String, Arc<dyn Subscriber>>,
}

/// Tracked identities and their subscribers.
///
/// All bookkeeping happens under one short lock that is never held across
/// an await point.
#[derive(Default)]
pub struct Registry {
    identities: Mutex<HashMap<String, TrackedIdentity>>,
}

impl TrackedIdentity {
    fn snapshot(&self, uid: &str) -> IdentityState {
        IdentityState {
            uid: uid.to_owned(),
            display_name: self.display_name.clone(),
            watermark: self.watermark.clone(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedIdentity>> {
        self.identities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load previously persisted state. Subscribers of an already tracked
    /// identity are kept.
    pub fn seed(&self, state: IdentityState) {
        let IdentityState {
            uid,
            display_name,
            watermark,
        } = state;

        let mut identities = self.lock();
        match identities.get_mut(&uid) {
            Some(identity) => {
                identity.display_name = display_name;
                identity.watermark = watermark;
            }
            None => {
                identities.insert(
                    uid,
                    TrackedIdentity {
                        display_name,
                        watermark,
                        subscribers: BTreeMap::new(),
                    },
                );
            }
        }
    }

    /// Add or replace the subscriber stored under `key`. Unknown identities
    /// are created, which requires resolving their name upstream.
    pub async fn register(
        &self,
        uid: &str,
        key: &str,
        subscriber: Arc<dyn Subscriber>,
        source: &dyn FeedSource,
    ) -> Result<IdentityState, EngineError> {
        let known = self.lock().contains_key(uid);
        let resolved = if known {
            None
        } else {
            let name = source
                .resolve_name(uid)
                .await
                .map_err(|source| EngineError::NameResolution {
                    uid: uid.to_owned(),
                    source,
                })?;
            debug!(uid, name = %name, "resolved identity name");
            Some(name)
        };

        let mut identities = self.lock();
        let identity = identities
            .entry(uid.to_owned())
            .or_insert_with(|| TrackedIdentity {
                display_name: resolved.unwrap_or_default(),
                watermark: Watermark::default(),
                subscribers: BTreeMap::new(),
            });
        if identity.subscribers.insert(key.to_owned(), subscriber).is_none() {
            info!(uid, key, name = %identity.display_name, "subscribed");
        }

        Ok(identity.snapshot(uid))
    }

    /// Remove one subscriber. The identity itself stays tracked; it is just
    /// not polled while nobody listens.
    pub fn unregister(&self, uid: &str, key: &str) -> bool {
        let removed = self
            .lock()
            .get_mut(uid)
            .map(|identity| identity.subscribers.remove(key).is_some())
            .unwrap_or_default();

        if removed {
            info!(uid, key, "unsubscribed");
        }
        removed
    }

    pub fn state(&self, uid: &str) -> Option<IdentityState> {
        self.lock().get(uid).map(|identity| identity.snapshot(uid))
    }

    pub fn is_subscribed(&self, uid: &str, key: &str) -> bool {
        self.lock()
            .get(uid)
            .is_some_and(|identity| identity.subscribers.contains_key(key))
    }

    /// Identities with at least one subscriber, in a stable order.
    pub fn active_identities(&self) -> Vec<String> {
        let mut uids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, identity)| !identity.subscribers.is_empty())
            .map(|(uid, _)| uid.clone())
            .collect();
        uids.sort();

        uids
    }

    pub fn subscribers(&self, uid: &str) -> Vec<(String, Arc<dyn Subscriber>)> {
        self.lock()
            .get(uid)
            .map(|identity| {
                identity
                    .subscribers
                    .iter()
                    .map(|(key, subscriber)| (key.clone(), Arc::clone(subscriber)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Classify a freshly fetched head against the recorded state and apply
    /// the result in one step. `None` when the identity is not tracked.
    pub fn observe(
        &self,
        uid: &str,
        display_name: &str,
        fetched: &Watermark,
    ) -> Option<(Classification, IdentityState)> {
        let mut identities = self.lock();
        let identity = identities.get_mut(uid)?;

        let classification = classify(&identity.watermark, fetched);
        if classification.decision.changes_state() {
            identity.watermark = classification.state.clone();
            if !display_name.is_empty() {
                identity.display_name = display_name.to_owned();
            }
        }

        Some((classification, identity.snapshot(uid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        testing::{RecordingSubscriber, ScriptedSource},
        Decision,
    };

    fn seeded(uid: &str, post_id: &str, timestamp: u64) -> IdentityState {
        IdentityState {
            uid: uid.to_owned(),
            display_name: "alice".to_owned(),
            watermark: Watermark::new(post_id, timestamp),
        }
    }

    #[tokio::test]
    async fn register_creates_identity_with_resolved_name() {
        let source = ScriptedSource::default();
        source.set_name("42", "alice");
        let registry = Registry::new();

        let state = registry
            .register("42", "chat:1", RecordingSubscriber::new(), &source)
            .await
            .unwrap();

        assert_eq!(state.display_name, "alice");
        assert_eq!(state.watermark, Watermark::default());
        assert_eq!(registry.active_identities(), vec!["42".to_owned()]);
        assert!(registry.is_subscribed("42", "chat:1"));
    }

    #[tokio::test]
    async fn register_known_identity_skips_lookup_and_returns_state() {
        let source = ScriptedSource::default();
        let registry = Registry::new();
        registry.seed(seeded("42", "100", 1000));

        let state = registry
            .register("42", "chat:1", RecordingSubscriber::new(), &source)
            .await
            .unwrap();

        assert_eq!(state, seeded("42", "100", 1000));
        assert_eq!(source.name_requests(), 0);
    }

    #[tokio::test]
    async fn failed_name_resolution_registers_nothing() {
        let source = ScriptedSource::default();
        let registry = Registry::new();

        let err = registry
            .register("404", "chat:1", RecordingSubscriber::new(), &source)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NameResolution { ref uid, .. } if uid == "404"));
        assert!(registry.state("404").is_none());
        assert!(registry.active_identities().is_empty());
    }

    #[tokio::test]
    async fn reregistering_key_replaces_subscriber() {
        let source = ScriptedSource::default();
        let registry = Registry::new();
        registry.seed(seeded("42", "100", 1000));
        let first = RecordingSubscriber::new();
        let second = RecordingSubscriber::new();

        registry.register("42", "chat:1", first.clone(), &source).await.unwrap();
        registry.register("42", "chat:1", second.clone(), &source).await.unwrap();

        let subscribers = registry.subscribers("42");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].0, "chat:1");
    }

    #[tokio::test]
    async fn unregister_keeps_identity_but_deactivates_it() {
        let source = ScriptedSource::default();
        let registry = Registry::new();
        registry.seed(seeded("42", "100", 1000));
        registry
            .register("42", "chat:1", RecordingSubscriber::new(), &source)
            .await
            .unwrap();

        assert!(registry.unregister("42", "chat:1"));
        assert!(!registry.unregister("42", "chat:1"));
        assert!(!registry.unregister("7", "chat:1"));
        assert!(registry.state("42").is_some());
        assert!(registry.active_identities().is_empty());
    }

    #[test]
    fn seed_keeps_subscribers_of_tracked_identity() {
        let registry = Registry::new();
        registry.seed(seeded("42", "100", 1000));
        registry
            .lock()
            .get_mut("42")
            .unwrap()
            .subscribers
            .insert("chat:1".to_owned(), RecordingSubscriber::new());

        registry.seed(seeded("42", "200", 2000));

        assert_eq!(registry.state("42").unwrap().watermark, Watermark::new("200", 2000));
        assert_eq!(registry.subscribers("42").len(), 1);
    }

    #[test]
    fn observe_applies_classification() {
        let registry = Registry::new();
        registry.seed(seeded("42", "100", 1000));

        let (c, state) = registry.observe("42", "alice2", &Watermark::new("100", 1000)).unwrap();
        assert_eq!(c.decision, Decision::NoChange);
        assert_eq!(state.display_name, "alice");

        let (c, state) = registry.observe("42", "alice2", &Watermark::new("101", 1001)).unwrap();
        assert_eq!(c.decision, Decision::Deliver);
        assert_eq!(state.display_name, "alice2");
        assert_eq!(state.watermark, Watermark::new("101", 1001));

        assert!(registry.observe("7", "bob", &Watermark::new("1", 1)).is_none());
    }
}

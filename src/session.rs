//! Per-identity session: one query cache and the components built on it.

use std::sync::Arc;

use tracing::info;

use crate::cache::{QueryCache, ReadOptions};
use crate::config::CacheConfig;
use crate::error::ServiceError;
use crate::mutation::MutationCoordinator;
use crate::profile::{Aggregate, DerivedProfileView, ProfileAggregator};
use crate::queries::Queries;
use crate::service::{Identity, RemoteService};

/// Login state reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    Available(Identity),
    Unavailable,
}

pub struct Session {
    identity: Identity,
    cache: QueryCache,
    queries: Queries,
    mutations: MutationCoordinator,
    profiles: ProfileAggregator,
}

impl Session {
    pub fn start(identity: Identity, service: Arc<dyn RemoteService>, config: &CacheConfig) -> Self {
        let cache = QueryCache::new(config);
        let queries = Queries::new(service.clone(), ReadOptions::from_config(config));
        let mutations = MutationCoordinator::new(service, cache.clone(), identity.clone());
        let profiles = ProfileAggregator::new(cache.clone(), queries.clone());
        info!(identity = %identity, "session started");

        Self {
            identity,
            cache,
            queries,
            mutations,
            profiles,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn queries(&self) -> &Queries {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn profiles(&self) -> &ProfileAggregator {
        &self.profiles
    }

    /// True once the caller's profile is known to be absent; never while it
    /// is still loading or failed to load.
    pub fn needs_profile_setup(&self) -> bool {
        let entry = self.cache.read(&self.queries.caller_profile());
        matches!(entry.data(), Some(None))
    }

    /// Profile view of `identity` from this session's point of view.
    pub fn view(&self, identity: &Identity) -> Aggregate<DerivedProfileView> {
        self.profiles.view(identity, &self.identity)
    }

    /// Follow `target` if the caller does not yet, unfollow otherwise.
    /// Returns whether the caller follows `target` afterwards.
    pub async fn toggle_follow(&self, target: &Identity) -> Result<bool, ServiceError> {
        if target == &self.identity {
            return Err(ServiceError::Validation("You cannot follow yourself".to_string()));
        }

        let relation = self
            .cache
            .resolve(&self.queries.is_following(target, &self.identity))
            .await;
        if relation.is_errored() {
            return Err(relation
                .error
                .unwrap_or_else(|| ServiceError::Transport("Request failed".to_string())));
        }

        match relation.data() {
            Some(true) => {
                self.mutations.unfollow(target).await?;
                Ok(false)
            }
            _ => {
                self.mutations.follow(target).await?;
                Ok(true)
            }
        }
    }

    fn end(self) {
        self.cache.clear();
        info!(identity = %self.identity, "session ended");
    }
}

/// Starts and ends sessions as the identity provider reports login state.
pub struct SessionManager {
    service: Arc<dyn RemoteService>,
    config: CacheConfig,
    current: Option<Session>,
}

impl SessionManager {
    pub fn new(service: Arc<dyn RemoteService>, config: CacheConfig) -> Self {
        Self {
            service,
            config,
            current: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Apply a login state change. A new identity always gets a fresh cache.
    pub fn handle(&mut self, event: IdentityEvent) -> Option<&Session> {
        match event {
            IdentityEvent::Available(identity) => {
                if self.current.as_ref().is_some_and(|s| s.identity == identity) {
                    return self.current.as_ref();
                }
                if let Some(previous) = self.current.take() {
                    previous.end();
                }
                self.current = Some(Session::start(identity, self.service.clone(), &self.config));
            }
            IdentityEvent::Unavailable => {
                if let Some(previous) = self.current.take() {
                    previous.end();
                }
            }
        }
        self.current.as_ref()
    }
}

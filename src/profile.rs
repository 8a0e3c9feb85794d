//! Profile views assembled from independent cache reads.
//!
//! Nothing here is cached on its own: every view is recomputed from its
//! constituent entries, so it is current as soon as they are invalidated.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::cache::{Query, QueryCache, QueryEntry, QueryKey, QueryStatus, Subscription};
use crate::error::ServiceError;
use crate::queries::Queries;
use crate::service::{Identity, Reel, UserProfile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateStatus {
    Pending,
    Resolved,
    Errored(ServiceError),
}

/// A derived value together with the combined status of its inputs.
///
/// `value` is present only when every input has resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate<T> {
    pub status: AggregateStatus,
    pub value: Option<T>,
}

impl<T> Aggregate<T> {
    fn resolved(value: T) -> Self {
        Self {
            status: AggregateStatus::Resolved,
            value: Some(value),
        }
    }

    fn unresolved(status: AggregateStatus) -> Self {
        Self { status, value: None }
    }

    pub fn is_pending(&self) -> bool {
        self.status == AggregateStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status == AggregateStatus::Resolved
    }

    pub fn error(&self) -> Option<&ServiceError> {
        match &self.status {
            AggregateStatus::Errored(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedProfileView {
    /// `None` when the user has not set up a profile.
    pub profile: Option<UserProfile>,
    pub follower_count: u64,
    pub following_count: u64,
    pub is_followed_by_caller: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberCard {
    pub identity: Identity,
    pub profile: UserProfile,
    pub follower_count: u64,
}

/// Any errored input makes the whole aggregate errored; otherwise any
/// pending input keeps it pending.
fn combine<'a>(inputs: impl IntoIterator<Item = (QueryStatus, Option<&'a ServiceError>)>) -> AggregateStatus {
    let mut pending = false;
    for (status, error) in inputs {
        match status {
            QueryStatus::Errored => {
                let error = error
                    .cloned()
                    .unwrap_or_else(|| ServiceError::Transport("Request failed".to_string()));
                return AggregateStatus::Errored(error);
            }
            QueryStatus::Pending => pending = true,
            QueryStatus::Resolved => {}
        }
    }
    if pending {
        AggregateStatus::Pending
    } else {
        AggregateStatus::Resolved
    }
}

fn input<T>(entry: &QueryEntry<T>) -> (QueryStatus, Option<&ServiceError>) {
    (entry.status, entry.error.as_ref())
}

struct ViewInputs {
    profile: QueryEntry<Option<UserProfile>>,
    follower_count: QueryEntry<u64>,
    following_count: QueryEntry<u64>,
    relation: Option<QueryEntry<bool>>,
}

impl ViewInputs {
    fn assemble(&self) -> Aggregate<DerivedProfileView> {
        let status = combine(
            [
                Some(input(&self.profile)),
                Some(input(&self.follower_count)),
                Some(input(&self.following_count)),
                self.relation.as_ref().map(input),
            ]
            .into_iter()
            .flatten(),
        );
        if status != AggregateStatus::Resolved {
            return Aggregate::unresolved(status);
        }

        let is_followed_by_caller = match &self.relation {
            Some(entry) => entry.data().copied(),
            None => Some(false),
        };
        match (
            self.profile.data(),
            self.follower_count.data(),
            self.following_count.data(),
            is_followed_by_caller,
        ) {
            (Some(profile), Some(&follower_count), Some(&following_count), Some(is_followed_by_caller)) => {
                Aggregate::resolved(DerivedProfileView {
                    profile: profile.clone(),
                    follower_count,
                    following_count,
                    is_followed_by_caller,
                })
            }
            _ => Aggregate::unresolved(AggregateStatus::Pending),
        }
    }
}

struct CardInputs {
    identity: Identity,
    profile: QueryEntry<Option<UserProfile>>,
    follower_count: QueryEntry<u64>,
}

fn assemble_cards(inputs: &[CardInputs]) -> Aggregate<Vec<MemberCard>> {
    let status = combine(
        inputs
            .iter()
            .flat_map(|card| [input(&card.profile), input(&card.follower_count)]),
    );
    if status != AggregateStatus::Resolved {
        return Aggregate::unresolved(status);
    }

    let cards = inputs
        .iter()
        .filter_map(|card| {
            let profile = card.profile.data()?.as_ref()?;
            Some(MemberCard {
                identity: card.identity.clone(),
                profile: profile.clone(),
                follower_count: card.follower_count.data().copied()?,
            })
        })
        .collect();
    Aggregate::resolved(cards)
}

/// Distinct uploaders in order of first appearance.
fn uploaders(reels: &[Reel]) -> Vec<Identity> {
    let mut seen = HashSet::new();
    reels
        .iter()
        .filter(|reel| seen.insert(reel.uploader.clone()))
        .map(|reel| reel.uploader.clone())
        .collect()
}

/// Read-only composition of cached queries into profile views.
#[derive(Clone)]
pub struct ProfileAggregator {
    cache: QueryCache,
    queries: Queries,
}

impl ProfileAggregator {
    pub fn new(cache: QueryCache, queries: Queries) -> Self {
        Self { cache, queries }
    }

    // Saving a profile only invalidates the caller's own entry, so the self
    // view reads that one.
    fn profile_query(&self, identity: &Identity, caller: &Identity) -> Query<Option<UserProfile>> {
        if identity == caller {
            self.queries.caller_profile()
        } else {
            self.queries.user_profile(identity)
        }
    }

    fn relation_query(&self, identity: &Identity, caller: &Identity) -> Option<Query<bool>> {
        (identity != caller).then(|| self.queries.is_following(identity, caller))
    }

    /// Cache keys the view for `identity` is built from.
    pub fn view_keys(&self, identity: &Identity, caller: &Identity) -> Vec<QueryKey> {
        let mut keys = vec![
            self.profile_query(identity, caller).key().clone(),
            self.queries.follower_count(identity).key().clone(),
            self.queries.following_count(identity).key().clone(),
        ];
        keys.extend(self.relation_query(identity, caller).map(|q| q.key().clone()));
        keys
    }

    /// Current view of `identity` as seen by `caller`, starting any fetches
    /// it needs. The relationship is not queried for the caller's own view.
    pub fn view(&self, identity: &Identity, caller: &Identity) -> Aggregate<DerivedProfileView> {
        ViewInputs {
            profile: self.cache.read(&self.profile_query(identity, caller)),
            follower_count: self.cache.read(&self.queries.follower_count(identity)),
            following_count: self.cache.read(&self.queries.following_count(identity)),
            relation: self
                .relation_query(identity, caller)
                .map(|query| self.cache.read(&query)),
        }
        .assemble()
    }

    /// Like `view`, but waits for every input to settle.
    pub async fn load(&self, identity: &Identity, caller: &Identity) -> Aggregate<DerivedProfileView> {
        let profile = self.profile_query(identity, caller);
        let follower_count = self.queries.follower_count(identity);
        let following_count = self.queries.following_count(identity);
        let relation = self.relation_query(identity, caller);

        let (profile, follower_count, following_count, relation) = tokio::join!(
            self.cache.resolve(&profile),
            self.cache.resolve(&follower_count),
            self.cache.resolve(&following_count),
            async {
                match &relation {
                    Some(query) => Some(self.cache.resolve(query).await),
                    None => None,
                }
            },
        );

        ViewInputs {
            profile,
            follower_count,
            following_count,
            relation,
        }
        .assemble()
    }

    /// Call `on_change` whenever any input of the view changes status.
    ///
    /// Keeps the inputs subscribed, so writes refetch them eagerly. Dropping
    /// the returned guards stops the notifications.
    pub fn watch<F>(&self, identity: &Identity, caller: &Identity, on_change: F) -> Vec<Subscription>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let on_change = Arc::new(on_change);
        self.view_keys(identity, caller)
            .iter()
            .map(|key| {
                let on_change = on_change.clone();
                self.cache.subscribe(key, move |_| on_change())
            })
            .collect()
    }

    /// Everyone who has uploaded a reel and set up a profile.
    pub fn members(&self) -> Aggregate<Vec<MemberCard>> {
        let reels = self.cache.read(&self.queries.all_reels());
        self.cards_for(&reels, |reels| uploaders(reels))
    }

    pub fn followers(&self, identity: &Identity) -> Aggregate<Vec<MemberCard>> {
        let list = self.cache.read(&self.queries.followers(identity));
        self.cards_for(&list, |ids| ids.to_vec())
    }

    pub fn following(&self, identity: &Identity) -> Aggregate<Vec<MemberCard>> {
        let list = self.cache.read(&self.queries.following(identity));
        self.cards_for(&list, |ids| ids.to_vec())
    }

    pub async fn load_members(&self) -> Aggregate<Vec<MemberCard>> {
        let reels = self.cache.resolve(&self.queries.all_reels()).await;
        self.load_cards_for(&reels, |reels| uploaders(reels)).await
    }

    pub async fn load_followers(&self, identity: &Identity) -> Aggregate<Vec<MemberCard>> {
        let list = self.cache.resolve(&self.queries.followers(identity)).await;
        self.load_cards_for(&list, |ids| ids.to_vec()).await
    }

    pub async fn load_following(&self, identity: &Identity) -> Aggregate<Vec<MemberCard>> {
        let list = self.cache.resolve(&self.queries.following(identity)).await;
        self.load_cards_for(&list, |ids| ids.to_vec()).await
    }

    fn cards_for<T>(
        &self,
        list: &QueryEntry<T>,
        identities: impl FnOnce(&T) -> Vec<Identity>,
    ) -> Aggregate<Vec<MemberCard>> {
        let Some(ids) = Self::list_identities(list, identities) else {
            return Aggregate::unresolved(combine([input(list)]).pending_if_resolved());
        };
        let inputs: Vec<CardInputs> = ids
            .into_iter()
            .map(|identity| CardInputs {
                profile: self.cache.read(&self.queries.user_profile(&identity)),
                follower_count: self.cache.read(&self.queries.follower_count(&identity)),
                identity,
            })
            .collect();
        assemble_cards(&inputs)
    }

    async fn load_cards_for<T>(
        &self,
        list: &QueryEntry<T>,
        identities: impl FnOnce(&T) -> Vec<Identity>,
    ) -> Aggregate<Vec<MemberCard>> {
        let Some(ids) = Self::list_identities(list, identities) else {
            return Aggregate::unresolved(combine([input(list)]).pending_if_resolved());
        };
        let inputs = join_all(ids.into_iter().map(|identity| async move {
            let profile = self.queries.user_profile(&identity);
            let follower_count = self.queries.follower_count(&identity);
            let (profile, follower_count) = tokio::join!(
                self.cache.resolve(&profile),
                self.cache.resolve(&follower_count),
            );
            CardInputs {
                identity,
                profile,
                follower_count,
            }
        }))
        .await;
        assemble_cards(&inputs)
    }

    fn list_identities<T>(
        list: &QueryEntry<T>,
        identities: impl FnOnce(&T) -> Vec<Identity>,
    ) -> Option<Vec<Identity>> {
        list.data().map(identities)
    }
}

impl AggregateStatus {
    // A resolved list whose value could not be read is treated as still
    // loading.
    fn pending_if_resolved(self) -> Self {
        match self {
            AggregateStatus::Resolved => AggregateStatus::Pending,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryOp, ReadOptions};
    use crate::config::CacheConfig;
    use crate::mutation::MutationCoordinator;
    use crate::service::fake::FakeService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<FakeService>, QueryCache, ProfileAggregator) {
        setup_with(&CacheConfig::default())
    }

    fn setup_with(config: &CacheConfig) -> (Arc<FakeService>, QueryCache, ProfileAggregator) {
        let fake = Arc::new(FakeService::new("me"));
        let cache = QueryCache::new(config);
        let queries = Queries::new(fake.clone(), ReadOptions::default());
        (fake, cache.clone(), ProfileAggregator::new(cache, queries))
    }

    #[tokio::test]
    async fn test_view_of_other_user() {
        let (fake, _cache, profiles) = setup();
        fake.put_profile("alice", "Alice");
        fake.add_edge("me", "alice");
        fake.add_edge("bob", "alice");
        fake.add_edge("alice", "bob");

        let view = profiles.load(&Identity::new("alice"), &fake.caller()).await;
        assert!(view.is_resolved());
        let view = view.value.unwrap();
        assert_eq!(view.profile.unwrap().username, "Alice");
        assert_eq!(view.follower_count, 2);
        assert_eq!(view.following_count, 1);
        assert!(view.is_followed_by_caller);
    }

    #[tokio::test]
    async fn test_self_view_skips_relationship_query() {
        let (fake, _cache, profiles) = setup();
        fake.put_profile("me", "Me");
        // Even a stray self edge must not make the caller "followed by self"
        fake.add_edge("me", "me");
        let me = fake.caller();

        let view = profiles.load(&me, &me).await.value.unwrap();
        assert!(!view.is_followed_by_caller);
        assert_eq!(fake.calls("getFollowers"), 0);
        assert_eq!(fake.calls("getCallerUserProfile"), 1);
        assert_eq!(fake.calls("getUserProfile"), 0);
        assert_eq!(profiles.view_keys(&me, &me).len(), 3);
    }

    #[tokio::test]
    async fn test_view_is_pending_until_every_input_resolves() {
        let (fake, _cache, profiles) = setup();
        let release = fake.gate("getFollowingCount");
        let alice = Identity::new("alice");
        let me = fake.caller();

        assert!(profiles.view(&alice, &me).is_pending());

        // Everything but the gated read settles
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(profiles.view(&alice, &me).is_pending());

        release.send(()).unwrap();
        let view = profiles.load(&alice, &me).await;
        assert!(view.is_resolved());
        assert_eq!(view.value.unwrap().profile, None);
    }

    #[tokio::test]
    async fn test_any_errored_input_errors_the_view() {
        let (fake, _cache, profiles) = setup();
        fake.fail_next("getFollowerCount", "connection reset");

        let view = profiles.load(&Identity::new("alice"), &fake.caller()).await;
        assert_eq!(
            view.status,
            AggregateStatus::Errored(ServiceError::Transport("connection reset".to_string()))
        );
        assert!(view.value.is_none());
    }

    #[tokio::test]
    async fn test_view_tracks_follow_through_invalidation() {
        let (fake, cache, profiles) = setup();
        let mutations = MutationCoordinator::new(fake.clone(), cache.clone(), fake.caller());
        let alice = Identity::new("alice");
        let me = fake.caller();

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        let _watch = profiles.watch(&alice, &me, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let before = profiles.load(&alice, &me).await.value.unwrap();
        assert!(!before.is_followed_by_caller);
        assert_eq!(before.follower_count, 0);

        changes.store(0, Ordering::SeqCst);
        mutations.follow(&alice).await.unwrap();
        let after = profiles.load(&alice, &me).await.value.unwrap();

        assert!(after.is_followed_by_caller);
        assert_eq!(after.follower_count, 1);
        assert!(changes.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_members_are_distinct_uploaders_with_profiles() {
        let (fake, _cache, profiles) = setup();
        fake.put_profile("bob", "Bob");
        fake.put_profile("alice", "Alice");
        fake.add_reel("bob", "one");
        fake.add_reel("alice", "two");
        fake.add_reel("bob", "three");
        fake.add_reel("ghost", "no profile");
        fake.add_edge("alice", "bob");

        let members = profiles.load_members().await.value.unwrap();
        let names: Vec<&str> = members.iter().map(|m| m.profile.username.as_str()).collect();
        assert_eq!(names, ["Bob", "Alice"]);
        assert_eq!(members[0].follower_count, 1);
        assert_eq!(fake.calls("getUserProfile"), 3);
    }

    #[tokio::test]
    async fn test_follower_cards_skip_users_without_profile() {
        let (fake, cache, profiles) = setup();
        fake.put_profile("alice", "Alice");
        fake.add_edge("alice", "me");
        fake.add_edge("lurker", "me");
        let me = fake.caller();

        let followers = profiles.load_followers(&me).await.value.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].identity, Identity::new("alice"));

        let following = profiles.load_following(&me).await.value.unwrap();
        assert!(following.is_empty());

        // Non-blocking form now answers from cache
        assert!(profiles.followers(&me).is_resolved());
        assert!(cache.peek::<Vec<Identity>>(&QueryKey::new(QueryOp::Followers).with_identity(&me)).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_follower_cards_load_beyond_idle_capacity() {
        let (fake, _cache, profiles) = setup_with(&CacheConfig {
            max_idle_entries: 2,
            ..CacheConfig::default()
        });
        for i in 0..20 {
            let follower = format!("fan{}", i);
            fake.put_profile(&follower, &format!("Fan {}", i));
            fake.add_edge(&follower, "me");
        }
        let me = fake.caller();

        for _ in 0..5 {
            let followers = profiles.load_followers(&me).await;
            assert!(followers.is_resolved());
            assert_eq!(followers.value.map(|cards| cards.len()), Some(20));
        }
    }

    #[tokio::test]
    async fn test_errored_list_errors_the_cards() {
        let (fake, _cache, profiles) = setup();
        fake.fail_next("getAllReels", "connection reset");

        let members = profiles.load_members().await;
        assert!(members.error().is_some());
        assert_eq!(fake.calls("getUserProfile"), 0);
    }
}

//! Writes to the remote service and the cache entries each one invalidates.
//!
//! The service never says what changed, so every kind of write carries a
//! fixed list of query families to mark stale. The list over-approximates:
//! a family is left out only when the write provably cannot change it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::blob::ExternalBlob;
use crate::cache::{QueryCache, QueryKey, QueryOp};
use crate::error::ServiceError;
use crate::service::{Identity, ReelId, RemoteService, UserProfile};
use crate::validate;

const SAVE_PROFILE_INVALIDATES: &[QueryOp] = &[QueryOp::CurrentUserProfile];

const UPLOAD_REEL_INVALIDATES: &[QueryOp] =
    &[QueryOp::AllReels, QueryOp::Feed, QueryOp::ReelsByUploader];

const FOLLOW_INVALIDATES: &[QueryOp] = &[
    QueryOp::Followers,
    QueryOp::Following,
    QueryOp::FollowerCount,
    QueryOp::FollowingCount,
    QueryOp::IsFollowing,
    QueryOp::Feed,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    SaveProfile,
    UploadReel,
    Follow,
    Unfollow,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::SaveProfile => "saveProfile",
            MutationKind::UploadReel => "uploadReel",
            MutationKind::Follow => "follow",
            MutationKind::Unfollow => "unfollow",
        }
    }

    /// Query families marked stale after a successful write of this kind.
    pub fn invalidates(&self) -> &'static [QueryOp] {
        match self {
            MutationKind::SaveProfile => SAVE_PROFILE_INVALIDATES,
            MutationKind::UploadReel => UPLOAD_REEL_INVALIDATES,
            MutationKind::Follow | MutationKind::Unfollow => FOLLOW_INVALIDATES,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    SaveProfile(UserProfile),
    UploadReel {
        video: ExternalBlob,
        description: String,
    },
    Follow(Identity),
    Unfollow(Identity),
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::SaveProfile(_) => MutationKind::SaveProfile,
            Mutation::UploadReel { .. } => MutationKind::UploadReel,
            Mutation::Follow(_) => MutationKind::Follow,
            Mutation::Unfollow(_) => MutationKind::Unfollow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Done,
    Uploaded(ReelId),
}

/// Executes writes and keeps the query cache coherent with them.
///
/// Identical writes in flight at the same time are not merged.
#[derive(Clone)]
pub struct MutationCoordinator {
    service: Arc<dyn RemoteService>,
    cache: QueryCache,
    caller: Identity,
}

impl MutationCoordinator {
    pub fn new(service: Arc<dyn RemoteService>, cache: QueryCache, caller: Identity) -> Self {
        Self {
            service,
            cache,
            caller,
        }
    }

    /// Run `mutation`; on success invalidate its query families.
    ///
    /// Failures are classified and returned untouched otherwise; the cache
    /// is not modified when a write fails.
    pub async fn perform(&self, mutation: Mutation) -> Result<MutationOutcome, ServiceError> {
        let kind = mutation.kind();
        let result = self.execute(mutation).await;

        match result {
            Ok(outcome) => {
                let marked: usize = kind
                    .invalidates()
                    .iter()
                    .map(|op| self.cache.invalidate(&QueryKey::new(*op)))
                    .sum();
                debug!(mutation = %kind, entries = marked, "mutation succeeded");
                Ok(outcome)
            }
            Err(e) => {
                warn!(mutation = %kind, validation = e.is_validation(), error = %e, "mutation failed");
                Err(e)
            }
        }
    }

    async fn execute(&self, mutation: Mutation) -> Result<MutationOutcome, ServiceError> {
        match mutation {
            Mutation::SaveProfile(profile) => {
                let profile = validate::profile(profile)?;
                self.service.save_caller_user_profile(profile).await?;
                Ok(MutationOutcome::Done)
            }
            Mutation::UploadReel { video, description } => {
                let description = validate::reel_upload(&video, &description)?;
                let id = self.service.upload_reel(video, &description).await?;
                Ok(MutationOutcome::Uploaded(id))
            }
            Mutation::Follow(user) => {
                self.reject_self(&user)?;
                self.service.follow_user(&user).await?;
                Ok(MutationOutcome::Done)
            }
            Mutation::Unfollow(user) => {
                self.reject_self(&user)?;
                self.service.unfollow_user(&user).await?;
                Ok(MutationOutcome::Done)
            }
        }
    }

    fn reject_self(&self, user: &Identity) -> Result<(), ServiceError> {
        if user == &self.caller {
            return Err(ServiceError::Validation("You cannot follow yourself".to_string()));
        }
        Ok(())
    }

    pub async fn save_profile(&self, profile: UserProfile) -> Result<(), ServiceError> {
        self.perform(Mutation::SaveProfile(profile)).await.map(|_| ())
    }

    pub async fn upload_reel(
        &self,
        video: ExternalBlob,
        description: impl Into<String>,
    ) -> Result<ReelId, ServiceError> {
        let outcome = self
            .perform(Mutation::UploadReel {
                video,
                description: description.into(),
            })
            .await?;
        match outcome {
            MutationOutcome::Uploaded(id) => Ok(id),
            MutationOutcome::Done => Err(ServiceError::Transport(
                "Upload finished without a reel id".to_string(),
            )),
        }
    }

    pub async fn follow(&self, user: &Identity) -> Result<(), ServiceError> {
        self.perform(Mutation::Follow(user.clone())).await.map(|_| ())
    }

    pub async fn unfollow(&self, user: &Identity) -> Result<(), ServiceError> {
        self.perform(Mutation::Unfollow(user.clone())).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Query, ReadOptions};
    use crate::config::CacheConfig;
    use crate::error::ErrorDisplay;
    use crate::queries::Queries;
    use crate::service::fake::FakeService;
    use std::collections::BTreeSet;

    struct Fixture {
        fake: Arc<FakeService>,
        cache: QueryCache,
        queries: Queries,
        mutations: MutationCoordinator,
    }

    fn fixture() -> Fixture {
        let fake = Arc::new(FakeService::new("me"));
        let cache = QueryCache::new(&CacheConfig::default());
        let queries = Queries::new(fake.clone(), ReadOptions::default());
        let mutations = MutationCoordinator::new(fake.clone(), cache.clone(), fake.caller());
        Fixture {
            fake,
            cache,
            queries,
            mutations,
        }
    }

    async fn warm<T: Send + Sync + 'static>(cache: &QueryCache, query: Query<T>) -> QueryKey {
        cache.resolve(&query).await;
        query.key().clone()
    }

    /// Resolve one entry of every query family, for the caller and for `x`.
    async fn warm_everything(f: &Fixture, x: &Identity) -> Vec<QueryKey> {
        let me = f.fake.caller();
        let (c, q) = (&f.cache, &f.queries);
        f.fake.add_reel("x", "clip");
        vec![
            warm(c, q.caller_profile()).await,
            warm(c, q.user_profile(x)).await,
            warm(c, q.all_reels()).await,
            warm(c, q.feed()).await,
            warm(c, q.reels_by_uploader(x)).await,
            warm(c, q.reel(1)).await,
            warm(c, q.followers(x)).await,
            warm(c, q.following(&me)).await,
            warm(c, q.follower_count(x)).await,
            warm(c, q.following_count(&me)).await,
            warm(c, q.is_following(x, &me)).await,
            warm(c, q.caller_role()).await,
            warm(c, q.is_caller_admin()).await,
        ]
    }

    fn stale_keys(cache: &QueryCache, keys: &[QueryKey]) -> BTreeSet<String> {
        keys.iter()
            .filter(|key| cache.is_stale(key) == Some(true))
            .map(|key| key.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_follow_invalidates_exactly_its_table_row() {
        let f = fixture();
        let x = Identity::new("x");
        let keys = warm_everything(&f, &x).await;
        assert!(stale_keys(&f.cache, &keys).is_empty());

        f.mutations.follow(&x).await.unwrap();

        let expected: BTreeSet<String> = [
            "followers:x",
            "following:me",
            "followerCount:x",
            "followingCount:me",
            "isFollowing:x:me",
            "feed",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(stale_keys(&f.cache, &keys), expected);
        assert_eq!(f.cache.is_stale(&QueryOp::AllReels.into()), Some(false));
    }

    #[tokio::test]
    async fn test_unfollow_matches_follow_row() {
        let f = fixture();
        let x = Identity::new("x");
        f.fake.add_edge("me", "x");
        let keys = warm_everything(&f, &x).await;

        f.mutations.unfollow(&x).await.unwrap();

        let stale_ops: BTreeSet<QueryOp> = keys
            .iter()
            .filter(|key| f.cache.is_stale(key) == Some(true))
            .map(QueryKey::op)
            .collect();
        let expected: BTreeSet<QueryOp> = FOLLOW_INVALIDATES.iter().copied().collect();
        assert_eq!(stale_ops, expected);
    }

    #[tokio::test]
    async fn test_save_profile_only_touches_current_user_profile() {
        let f = fixture();
        let x = Identity::new("x");
        let keys = warm_everything(&f, &x).await;

        f.mutations
            .save_profile(UserProfile {
                username: "me".to_string(),
                bio: String::new(),
                profile_picture: None,
            })
            .await
            .unwrap();

        let expected: BTreeSet<String> = ["currentUserProfile".to_string()].into();
        assert_eq!(stale_keys(&f.cache, &keys), expected);
    }

    #[tokio::test]
    async fn test_upload_touches_reel_lists_only() {
        let f = fixture();
        let x = Identity::new("x");
        let keys = warm_everything(&f, &x).await;

        let id = f
            .mutations
            .upload_reel(ExternalBlob::from_url("https://blobs.example/v/new"), " new ")
            .await
            .unwrap();
        assert_eq!(id, 2);

        let expected: BTreeSet<String> = ["allReels", "feed", "reelsByUploader:x"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(stale_keys(&f.cache, &keys), expected);
        // Single reels are immutable once created
        assert_eq!(f.cache.is_stale(&QueryKey::new(QueryOp::Reel).with_reel(1)), Some(false));
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_untouched() {
        let f = fixture();
        let x = Identity::new("x");
        let keys = warm_everything(&f, &x).await;
        f.fake.fail_next("followUser", "connection reset");

        let err = f.mutations.follow(&x).await.unwrap_err();
        assert_eq!(err, ServiceError::Transport("connection reset".to_string()));
        assert_eq!(err.display(), ErrorDisplay::Notification("connection reset".to_string()));
        assert!(stale_keys(&f.cache, &keys).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_content_routes_inline() {
        let f = fixture();
        f.fake
            .fail_next("saveCallerUserProfile", "Inappropriate language detected");

        let err = f
            .mutations
            .save_profile(UserProfile {
                username: "rude".to_string(),
                bio: String::new(),
                profile_picture: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.display(),
            ErrorDisplay::Inline("Inappropriate language detected".to_string())
        );
    }

    #[tokio::test]
    async fn test_local_checks_run_before_any_call() {
        let f = fixture();

        let blank = f
            .mutations
            .save_profile(UserProfile {
                username: "  ".to_string(),
                bio: String::new(),
                profile_picture: None,
            })
            .await;
        assert!(blank.unwrap_err().is_validation());

        let me = f.fake.caller();
        assert!(f.mutations.follow(&me).await.unwrap_err().is_validation());

        let not_video = ExternalBlob::from_bytes(vec![1, 2]).with_content_type("image/png");
        assert!(f.mutations.upload_reel(not_video, "x").await.is_err());

        assert_eq!(f.fake.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_subscribed_entries_refetch_after_write() {
        let f = fixture();
        let x = Identity::new("x");
        let count = f.queries.follower_count(&x);
        let _sub = f.cache.subscribe(count.key(), |_| {});
        assert_eq!(f.cache.resolve(&count).await.data(), Some(&0));

        f.mutations.follow(&x).await.unwrap();
        let entry = f.cache.resolve(&count).await;

        assert_eq!(entry.data(), Some(&1));
        assert_eq!(f.fake.calls("getFollowerCount"), 2);
    }

    #[test]
    fn test_table_never_touches_roles_or_single_reels() {
        for kind in [
            MutationKind::SaveProfile,
            MutationKind::UploadReel,
            MutationKind::Follow,
            MutationKind::Unfollow,
        ] {
            let ops = kind.invalidates();
            assert!(!ops.contains(&QueryOp::CallerRole));
            assert!(!ops.contains(&QueryOp::IsCallerAdmin));
            assert!(!ops.contains(&QueryOp::Reel));
            assert!(!ops.contains(&QueryOp::UserProfile));
        }
    }
}

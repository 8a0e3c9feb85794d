//! Typed cache reads, one per remote read operation.

use std::sync::Arc;

use crate::cache::{Query, QueryKey, QueryOp, ReadOptions};
use crate::service::{Identity, Reel, ReelId, RemoteService, UserProfile, UserRole};

/// Builds the `Query` for each remote read, keyed structurally so that
/// reads issued from different places share cache entries.
#[derive(Clone)]
pub struct Queries {
    service: Arc<dyn RemoteService>,
    options: ReadOptions,
}

impl Queries {
    pub fn new(service: Arc<dyn RemoteService>, options: ReadOptions) -> Self {
        Self { service, options }
    }

    /// The caller's own profile; `None` means "not set up yet".
    ///
    /// Never retried: retrying before the session is ready would hide a
    /// legitimate "no profile" answer behind repeated failures.
    pub fn caller_profile(&self) -> Query<Option<UserProfile>> {
        let service = self.service.clone();
        Query::new(
            QueryOp::CurrentUserProfile.into(),
            self.options.no_retry(),
            move || {
                let service = service.clone();
                async move { service.get_caller_user_profile().await }
            },
        )
    }

    pub fn user_profile(&self, user: &Identity) -> Query<Option<UserProfile>> {
        let service = self.service.clone();
        let user = user.clone();
        Query::new(
            QueryKey::new(QueryOp::UserProfile).with_identity(&user),
            self.options,
            move || {
                let service = service.clone();
                let user = user.clone();
                async move { service.get_user_profile(&user).await }
            },
        )
    }

    pub fn all_reels(&self) -> Query<Vec<Reel>> {
        let service = self.service.clone();
        Query::new(QueryOp::AllReels.into(), self.options, move || {
            let service = service.clone();
            async move { service.get_all_reels().await }
        })
    }

    pub fn feed(&self) -> Query<Vec<Reel>> {
        let service = self.service.clone();
        Query::new(QueryOp::Feed.into(), self.options, move || {
            let service = service.clone();
            async move { service.get_feed().await }
        })
    }

    pub fn reels_by_uploader(&self, uploader: &Identity) -> Query<Vec<Reel>> {
        let service = self.service.clone();
        let uploader = uploader.clone();
        Query::new(
            QueryKey::new(QueryOp::ReelsByUploader).with_identity(&uploader),
            self.options,
            move || {
                let service = service.clone();
                let uploader = uploader.clone();
                async move { service.get_reels_by_uploader(&uploader).await }
            },
        )
    }

    pub fn reel(&self, id: ReelId) -> Query<Reel> {
        let service = self.service.clone();
        Query::new(
            QueryKey::new(QueryOp::Reel).with_reel(id),
            self.options,
            move || {
                let service = service.clone();
                async move { service.get_reel(id).await }
            },
        )
    }

    pub fn followers(&self, user: &Identity) -> Query<Vec<Identity>> {
        let service = self.service.clone();
        let user = user.clone();
        Query::new(
            QueryKey::new(QueryOp::Followers).with_identity(&user),
            self.options,
            move || {
                let service = service.clone();
                let user = user.clone();
                async move { service.get_followers(&user).await }
            },
        )
    }

    pub fn following(&self, user: &Identity) -> Query<Vec<Identity>> {
        let service = self.service.clone();
        let user = user.clone();
        Query::new(
            QueryKey::new(QueryOp::Following).with_identity(&user),
            self.options,
            move || {
                let service = service.clone();
                let user = user.clone();
                async move { service.get_following(&user).await }
            },
        )
    }

    pub fn follower_count(&self, user: &Identity) -> Query<u64> {
        let service = self.service.clone();
        let user = user.clone();
        Query::new(
            QueryKey::new(QueryOp::FollowerCount).with_identity(&user),
            self.options,
            move || {
                let service = service.clone();
                let user = user.clone();
                async move { service.get_follower_count(&user).await }
            },
        )
    }

    pub fn following_count(&self, user: &Identity) -> Query<u64> {
        let service = self.service.clone();
        let user = user.clone();
        Query::new(
            QueryKey::new(QueryOp::FollowingCount).with_identity(&user),
            self.options,
            move || {
                let service = service.clone();
                let user = user.clone();
                async move { service.get_following_count(&user).await }
            },
        )
    }

    /// Whether `follower` appears in `subject`'s follower list.
    pub fn is_following(&self, subject: &Identity, follower: &Identity) -> Query<bool> {
        let service = self.service.clone();
        let subject = subject.clone();
        let follower = follower.clone();
        Query::new(
            QueryKey::new(QueryOp::IsFollowing)
                .with_identity(&subject)
                .with_identity(&follower),
            self.options,
            move || {
                let service = service.clone();
                let subject = subject.clone();
                let follower = follower.clone();
                async move {
                    let followers = service.get_followers(&subject).await?;
                    Ok(followers.contains(&follower))
                }
            },
        )
    }

    pub fn caller_role(&self) -> Query<UserRole> {
        let service = self.service.clone();
        Query::new(QueryOp::CallerRole.into(), self.options, move || {
            let service = service.clone();
            async move { service.get_caller_user_role().await }
        })
    }

    pub fn is_caller_admin(&self) -> Query<bool> {
        let service = self.service.clone();
        Query::new(QueryOp::IsCallerAdmin.into(), self.options, move || {
            let service = service.clone();
            async move { service.is_caller_admin().await }
        })
    }
}

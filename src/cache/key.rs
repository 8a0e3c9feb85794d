use std::fmt;

use crate::service::{Identity, ReelId};

/// The remote read a cache entry holds the result of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryOp {
    CurrentUserProfile,
    UserProfile,
    AllReels,
    Feed,
    ReelsByUploader,
    Reel,
    Followers,
    Following,
    FollowerCount,
    FollowingCount,
    IsFollowing,
    CallerRole,
    IsCallerAdmin,
}

impl QueryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOp::CurrentUserProfile => "currentUserProfile",
            QueryOp::UserProfile => "userProfile",
            QueryOp::AllReels => "allReels",
            QueryOp::Feed => "feed",
            QueryOp::ReelsByUploader => "reelsByUploader",
            QueryOp::Reel => "reel",
            QueryOp::Followers => "followers",
            QueryOp::Following => "following",
            QueryOp::FollowerCount => "followerCount",
            QueryOp::FollowingCount => "followingCount",
            QueryOp::IsFollowing => "isFollowing",
            QueryOp::CallerRole => "callerRole",
            QueryOp::IsCallerAdmin => "isCallerAdmin",
        }
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural cache key: operation plus normalized parameters.
///
/// Two keys built from the same operation and equal parameters are equal no
/// matter where they were built. A key with fewer parameters doubles as a
/// prefix for invalidation (`followers` matches `followers:<anyone>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    op: QueryOp,
    params: Vec<String>,
}

impl QueryKey {
    pub fn new(op: QueryOp) -> Self {
        Self {
            op,
            params: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: &Identity) -> Self {
        self.params.push(identity.as_str().to_string());
        self
    }

    pub fn with_reel(mut self, id: ReelId) -> Self {
        self.params.push(id.to_string());
        self
    }

    pub fn op(&self) -> QueryOp {
        self.op
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// True when `prefix` names this key or a family containing it.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.op == prefix.op && self.params.starts_with(&prefix.params)
    }
}

impl From<QueryOp> for QueryKey {
    fn from(op: QueryOp) -> Self {
        QueryKey::new(op)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op.as_str())?;
        for param in &self.params {
            write!(f, ":{}", param)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_alias_structurally() {
        let a = QueryKey::new(QueryOp::Followers).with_identity(&Identity::new("alice"));
        let b = QueryKey::new(QueryOp::Followers).with_identity(&Identity::new(" alice "));
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_prefix_matching() {
        let alice = Identity::new("alice");
        let key = QueryKey::new(QueryOp::IsFollowing)
            .with_identity(&alice)
            .with_identity(&Identity::new("bob"));

        assert!(key.starts_with(&QueryOp::IsFollowing.into()));
        assert!(key.starts_with(&QueryKey::new(QueryOp::IsFollowing).with_identity(&alice)));
        assert!(key.starts_with(&key.clone()));
        assert!(!key.starts_with(&QueryOp::Followers.into()));
        assert!(!key.starts_with(
            &QueryKey::new(QueryOp::IsFollowing).with_identity(&Identity::new("bob"))
        ));
    }

    #[test]
    fn test_operation_prefix_does_not_match_similar_names() {
        // "following" must not sweep up "followingCount"
        let count = QueryKey::new(QueryOp::FollowingCount).with_identity(&Identity::new("a"));
        assert!(!count.starts_with(&QueryOp::Following.into()));
    }

    #[test]
    fn test_display() {
        let key = QueryKey::new(QueryOp::Reel).with_reel(42);
        assert_eq!(key.to_string(), "reel:42");
        assert_eq!(QueryKey::new(QueryOp::Feed).to_string(), "feed");
    }
}

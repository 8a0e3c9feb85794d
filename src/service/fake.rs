//! Scripted in-memory `RemoteService` for tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{Identity, Reel, ReelId, RemoteService, UserProfile, UserRole};
use crate::blob::ExternalBlob;

#[derive(Default)]
struct State {
    profiles: HashMap<Identity, UserProfile>,
    reels: Vec<Reel>,
    /// (follower, followee)
    edges: BTreeSet<(Identity, Identity)>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<String>>,
    gates: HashMap<&'static str, VecDeque<oneshot::Receiver<()>>>,
}

pub(crate) struct FakeService {
    caller: Identity,
    state: Mutex<State>,
}

impl FakeService {
    pub fn new(caller: &str) -> Self {
        Self {
            caller: Identity::new(caller),
            state: Mutex::new(State::default()),
        }
    }

    pub fn caller(&self) -> Identity {
        self.caller.clone()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().unwrap().calls.get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }

    pub fn put_profile(&self, user: &str, username: &str) {
        self.state.lock().unwrap().profiles.insert(
            Identity::new(user),
            UserProfile {
                username: username.to_string(),
                bio: String::new(),
                profile_picture: None,
            },
        );
    }

    pub fn add_edge(&self, follower: &str, followee: &str) {
        self.state
            .lock()
            .unwrap()
            .edges
            .insert((Identity::new(follower), Identity::new(followee)));
    }

    pub fn add_reel(&self, uploader: &str, description: &str) -> ReelId {
        let mut state = self.state.lock().unwrap();
        let id = state.reels.len() as ReelId + 1;
        state.reels.push(Reel {
            id,
            video: ExternalBlob::from_url(format!("https://blobs.example/v/{id}")),
            description: description.to_string(),
            uploader: Identity::new(uploader),
        });
        id
    }

    /// Make the next call to `method` fail with `message`.
    pub fn fail_next(&self, method: &'static str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(method)
            .or_default()
            .push_back(message.to_string());
    }

    /// Hold the next call to `method` (after it has read its result) until
    /// the returned sender fires or is dropped.
    pub fn gate(&self, method: &'static str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .gates
            .entry(method)
            .or_default()
            .push_back(rx);
        tx
    }

    fn enter(&self, method: &'static str) -> Result<Option<oneshot::Receiver<()>>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method).or_default() += 1;
        if let Some(message) = state.failures.get_mut(method).and_then(|q| q.pop_front()) {
            return Err(anyhow!(message));
        }
        Ok(state.gates.get_mut(method).and_then(|q| q.pop_front()))
    }

    async fn finish<T>(gate: Option<oneshot::Receiver<()>>, value: T) -> Result<T> {
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(value)
    }
}

#[async_trait]
impl RemoteService for FakeService {
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>> {
        let gate = self.enter("getCallerUserProfile")?;
        let value = self.state.lock().unwrap().profiles.get(&self.caller).cloned();
        Self::finish(gate, value).await
    }

    async fn save_caller_user_profile(&self, profile: UserProfile) -> Result<()> {
        let gate = self.enter("saveCallerUserProfile")?;
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(self.caller.clone(), profile);
        Self::finish(gate, ()).await
    }

    async fn get_user_profile(&self, user: &Identity) -> Result<Option<UserProfile>> {
        let gate = self.enter("getUserProfile")?;
        let value = self.state.lock().unwrap().profiles.get(user).cloned();
        Self::finish(gate, value).await
    }

    async fn upload_reel(&self, video: ExternalBlob, description: &str) -> Result<ReelId> {
        let gate = self.enter("uploadReel")?;
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.reels.len() as ReelId + 1;
            state.reels.push(Reel {
                id,
                video,
                description: description.to_string(),
                uploader: self.caller.clone(),
            });
            id
        };
        Self::finish(gate, id).await
    }

    async fn get_all_reels(&self) -> Result<Vec<Reel>> {
        let gate = self.enter("getAllReels")?;
        let value = self.state.lock().unwrap().reels.clone();
        Self::finish(gate, value).await
    }

    async fn get_feed(&self) -> Result<Vec<Reel>> {
        let gate = self.enter("getFeed")?;
        let value = {
            let state = self.state.lock().unwrap();
            state
                .reels
                .iter()
                .filter(|r| {
                    r.uploader == self.caller
                        || state.edges.contains(&(self.caller.clone(), r.uploader.clone()))
                })
                .cloned()
                .collect()
        };
        Self::finish(gate, value).await
    }

    async fn get_reels_by_uploader(&self, uploader: &Identity) -> Result<Vec<Reel>> {
        let gate = self.enter("getReelsByUploader")?;
        let value = self
            .state
            .lock()
            .unwrap()
            .reels
            .iter()
            .filter(|r| &r.uploader == uploader)
            .cloned()
            .collect();
        Self::finish(gate, value).await
    }

    async fn get_reel(&self, id: ReelId) -> Result<Reel> {
        let gate = self.enter("getReel")?;
        let value = self
            .state
            .lock()
            .unwrap()
            .reels
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("Reel not found"))?;
        Self::finish(gate, value).await
    }

    async fn follow_user(&self, user: &Identity) -> Result<()> {
        let gate = self.enter("followUser")?;
        self.state
            .lock()
            .unwrap()
            .edges
            .insert((self.caller.clone(), user.clone()));
        Self::finish(gate, ()).await
    }

    async fn unfollow_user(&self, user: &Identity) -> Result<()> {
        let gate = self.enter("unfollowUser")?;
        self.state
            .lock()
            .unwrap()
            .edges
            .remove(&(self.caller.clone(), user.clone()));
        Self::finish(gate, ()).await
    }

    async fn get_followers(&self, user: &Identity) -> Result<Vec<Identity>> {
        let gate = self.enter("getFollowers")?;
        let value = self
            .state
            .lock()
            .unwrap()
            .edges
            .iter()
            .filter(|(_, followee)| followee == user)
            .map(|(follower, _)| follower.clone())
            .collect();
        Self::finish(gate, value).await
    }

    async fn get_following(&self, user: &Identity) -> Result<Vec<Identity>> {
        let gate = self.enter("getFollowing")?;
        let value = self
            .state
            .lock()
            .unwrap()
            .edges
            .iter()
            .filter(|(follower, _)| follower == user)
            .map(|(_, followee)| followee.clone())
            .collect();
        Self::finish(gate, value).await
    }

    async fn get_follower_count(&self, user: &Identity) -> Result<u64> {
        let gate = self.enter("getFollowerCount")?;
        let value = self
            .state
            .lock()
            .unwrap()
            .edges
            .iter()
            .filter(|(_, followee)| followee == user)
            .count() as u64;
        Self::finish(gate, value).await
    }

    async fn get_following_count(&self, user: &Identity) -> Result<u64> {
        let gate = self.enter("getFollowingCount")?;
        let value = self
            .state
            .lock()
            .unwrap()
            .edges
            .iter()
            .filter(|(follower, _)| follower == user)
            .count() as u64;
        Self::finish(gate, value).await
    }

    async fn get_caller_user_role(&self) -> Result<UserRole> {
        let gate = self.enter("getCallerUserRole")?;
        Self::finish(gate, UserRole::User).await
    }

    async fn is_caller_admin(&self) -> Result<bool> {
        let gate = self.enter("isCallerAdmin")?;
        Self::finish(gate, false).await
    }

    async fn assign_caller_user_role(&self, _user: &Identity, _role: UserRole) -> Result<()> {
        let gate = self.enter("assignCallerUserRole")?;
        Self::finish(gate, ()).await
    }
}

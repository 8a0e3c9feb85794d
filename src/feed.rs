//! Scroll-driven playback for a vertical list of videos.
//!
//! The active index is a pure function of the scroll offset. Only the item
//! at the active index is ever told to play; every other mounted item is
//! paused. Instructions are forwarded only when they change what an element
//! was last told, so repeating a pause or play is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{ensure, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::FeedConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOrigin {
    /// Started by the controller when an item became active.
    Autoplay,
    /// Started by an explicit user action; platforms always allow these.
    UserGesture,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Autoplay prevented by platform policy")]
    AutoplayBlocked,
    #[error("Playback failed: {0}")]
    Failed(String),
}

/// A mounted video element the controller drives.
pub trait MediaElement: Send {
    fn play(&mut self, origin: PlayOrigin) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn set_muted(&mut self, muted: bool);
}

/// Instruction forwarded to one mounted element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    Play(usize, PlayOrigin),
    Pause(usize),
    SetMuted(usize, bool),
}

/// `round(offset / item_height)` clamped to the list, or `None` for an
/// empty list.
pub fn active_index_for(offset: f64, item_height: f64, item_count: usize) -> Option<usize> {
    if item_count == 0 {
        return None;
    }
    let raw = (offset / item_height).round();
    let index = if raw.is_finite() && raw > 0.0 {
        raw as usize
    } else {
        0
    };
    Some(index.min(item_count - 1))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrollPlaybackState {
    pub active_index: usize,
    muted: HashMap<usize, bool>,
}

impl ScrollPlaybackState {
    /// Items start muted.
    pub fn is_muted(&self, index: usize) -> bool {
        self.muted.get(&index).copied().unwrap_or(true)
    }
}

struct ItemSlot {
    element: Box<dyn MediaElement>,
    playing: bool,
    muted: bool,
}

pub struct FeedScrollController {
    item_height: f64,
    item_count: usize,
    state: ScrollPlaybackState,
    slots: HashMap<usize, ItemSlot>,
    issued: Vec<PlaybackCommand>,
}

impl FeedScrollController {
    /// `item_height` must be a positive, finite number of pixels.
    pub fn new(item_height: f64) -> Result<Self> {
        ensure!(
            item_height.is_finite() && item_height > 0.0,
            "Item height must be positive, got {}",
            item_height
        );
        Ok(Self {
            item_height,
            item_count: 0,
            state: ScrollPlaybackState::default(),
            slots: HashMap::new(),
            issued: Vec::new(),
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        Self::new(config.item_height)
    }

    pub fn state(&self) -> &ScrollPlaybackState {
        &self.state
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// The index eligible to play; `None` while the list is empty.
    pub fn active_index(&self) -> Option<usize> {
        (self.item_count > 0).then_some(self.state.active_index)
    }

    pub fn is_muted(&self, index: usize) -> bool {
        self.state.is_muted(index)
    }

    /// Indices of mounted items whose last instruction was play.
    pub fn playing(&self) -> Vec<usize> {
        let mut playing: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.playing)
            .map(|(index, _)| *index)
            .collect();
        playing.sort_unstable();
        playing
    }

    /// Commands forwarded to elements since the last call.
    pub fn take_commands(&mut self) -> Vec<PlaybackCommand> {
        std::mem::take(&mut self.issued)
    }

    /// Resize the list, e.g. after the backing query refetched.
    pub fn set_item_count(&mut self, count: usize) {
        let before = self.active_index();
        self.item_count = count;
        if count > 0 {
            self.state.active_index = self.state.active_index.min(count - 1);
        }
        let after = self.active_index();
        if before != after {
            self.activate(after, PlayOrigin::Autoplay);
        }
    }

    /// Apply a (debounced) scroll offset. Returns the new active index if
    /// it changed.
    pub fn on_scroll(&mut self, offset: f64) -> Option<usize> {
        let target = active_index_for(offset, self.item_height, self.item_count)?;
        if target == self.state.active_index {
            return None;
        }
        debug!(from = self.state.active_index, to = target, offset, "active item changed");
        self.activate(Some(target), PlayOrigin::Autoplay);
        Some(target)
    }

    /// Play `index` in response to the user, making it the active item.
    pub fn user_play(&mut self, index: usize) {
        if index >= self.item_count {
            return;
        }
        self.activate(Some(index), PlayOrigin::UserGesture);
    }

    /// Flip mute for one item. Returns the new mute state.
    pub fn toggle_mute(&mut self, index: usize) -> bool {
        let muted = !self.state.is_muted(index);
        self.state.muted.insert(index, muted);
        self.apply_mute(index);
        muted
    }

    /// Bind an element to `index` and bring it in line with current state.
    pub fn mount(&mut self, index: usize, element: Box<dyn MediaElement>) {
        self.stop(index);
        self.slots.remove(&index);
        let mut slot = ItemSlot {
            element,
            playing: false,
            muted: self.state.is_muted(index),
        };
        slot.element.set_muted(slot.muted);
        self.issued.push(PlaybackCommand::SetMuted(index, slot.muted));
        self.slots.insert(index, slot);

        if self.active_index() == Some(index) {
            self.start(index, PlayOrigin::Autoplay);
        }
    }

    /// Unbind the element at `index`. Its mute state is forgotten.
    pub fn unmount(&mut self, index: usize) -> Option<Box<dyn MediaElement>> {
        self.state.muted.remove(&index);
        let mut slot = self.slots.remove(&index)?;
        if slot.playing {
            slot.element.pause();
            self.issued.push(PlaybackCommand::Pause(index));
        }
        Some(slot.element)
    }

    /// Pause everything and release every element.
    pub fn teardown(&mut self) {
        let indices: Vec<usize> = self.slots.keys().copied().collect();
        for index in indices {
            self.stop(index);
        }
        self.slots.clear();
        trace!("feed controller torn down");
    }

    fn activate(&mut self, target: Option<usize>, origin: PlayOrigin) {
        if let Some(index) = target {
            self.state.active_index = index;
        }
        let others: Vec<usize> = self
            .slots
            .iter()
            .filter(|(index, slot)| slot.playing && Some(**index) != target)
            .map(|(index, _)| *index)
            .collect();
        for index in others {
            self.stop(index);
        }
        if let Some(index) = target {
            self.start(index, origin);
        }
    }

    fn start(&mut self, index: usize, origin: PlayOrigin) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        if slot.playing {
            return;
        }
        self.issued.push(PlaybackCommand::Play(index, origin));
        match slot.element.play(origin) {
            Ok(()) => slot.playing = true,
            Err(PlaybackError::AutoplayBlocked) => {
                debug!(index, "Autoplay prevented");
            }
            Err(e) => {
                warn!(index, error = %e, "playback failed");
            }
        }
    }

    fn stop(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        if !slot.playing {
            return;
        }
        slot.element.pause();
        slot.playing = false;
        self.issued.push(PlaybackCommand::Pause(index));
    }

    fn apply_mute(&mut self, index: usize) {
        let muted = self.state.is_muted(index);
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        if slot.muted == muted {
            return;
        }
        slot.element.set_muted(muted);
        slot.muted = muted;
        self.issued.push(PlaybackCommand::SetMuted(index, muted));
    }
}

/// Trailing-edge debounce over scroll offsets with an injected clock.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<(f64, Instant)>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    /// Record an offset; it supersedes any offset not yet released.
    pub fn push(&mut self, offset: f64, now: Instant) {
        self.pending = Some((offset, now + self.delay));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, deadline)| deadline)
    }

    /// Release the latest offset once the input has been quiet for the delay.
    pub fn poll(&mut self, now: Instant) -> Option<f64> {
        match self.pending {
            Some((offset, deadline)) if now >= deadline => {
                self.pending = None;
                Some(offset)
            }
            _ => None,
        }
    }
}

pub enum FeedEvent {
    Scroll(f64),
    ItemCount(usize),
    Mount(usize, Box<dyn MediaElement>),
    Unmount(usize),
    UserPlay(usize),
    ToggleMute(usize),
    Shutdown,
}

impl FeedEvent {
    fn name(&self) -> &'static str {
        match self {
            FeedEvent::Scroll(_) => "scroll",
            FeedEvent::ItemCount(_) => "item_count",
            FeedEvent::Mount(..) => "mount",
            FeedEvent::Unmount(_) => "unmount",
            FeedEvent::UserPlay(_) => "user_play",
            FeedEvent::ToggleMute(_) => "toggle_mute",
            FeedEvent::Shutdown => "shutdown",
        }
    }
}

/// Runs a controller on a tokio task, debouncing scroll events.
///
/// The task tears the controller down when `shutdown` is called or every
/// sender is dropped.
pub struct FeedDriver {
    tx: mpsc::UnboundedSender<FeedEvent>,
    handle: JoinHandle<()>,
}

impl FeedDriver {
    pub fn spawn(controller: FeedScrollController, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(controller, Debouncer::new(debounce), rx));
        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<FeedEvent> {
        self.tx.clone()
    }

    /// Queue an event for the driver task. Returns false once the task has
    /// stopped.
    pub fn send(&self, event: FeedEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(event = e.0.name(), "feed driver stopped, event dropped");
                false
            }
        }
    }

    pub fn scroll(&self, offset: f64) -> bool {
        self.send(FeedEvent::Scroll(offset))
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(FeedEvent::Shutdown);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "feed driver task failed");
        }
    }
}

async fn run(
    mut controller: FeedScrollController,
    mut debouncer: Debouncer,
    mut rx: mpsc::UnboundedReceiver<FeedEvent>,
) {
    loop {
        let event = match debouncer.deadline() {
            Some(deadline) => {
                tokio::select! {
                    event = rx.recv() => event,
                    _ = tokio::time::sleep_until(deadline) => {
                        if let Some(offset) = debouncer.poll(Instant::now()) {
                            controller.on_scroll(offset);
                        }
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match event {
            Some(FeedEvent::Scroll(offset)) => debouncer.push(offset, Instant::now()),
            Some(FeedEvent::ItemCount(count)) => controller.set_item_count(count),
            Some(FeedEvent::Mount(index, element)) => controller.mount(index, element),
            Some(FeedEvent::Unmount(index)) => {
                controller.unmount(index);
            }
            Some(FeedEvent::UserPlay(index)) => controller.user_play(index),
            Some(FeedEvent::ToggleMute(index)) => {
                controller.toggle_mute(index);
            }
            Some(FeedEvent::Shutdown) | None => break,
        }
    }
    controller.teardown();
}

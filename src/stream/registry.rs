//! Subscriber registry and frame fan-out.
//!
//! The registry is the only long-lived shared mutable structure in the
//! pipeline. Structural changes take a short write lock; fan-out clones the
//! senders under a read lock and writes to the channels after releasing it,
//! so a stuck subscriber never blocks registration changes for others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::error::{StreamError, StreamResult};
use crate::screen::codec::EncodeOptions;
use crate::screen::{DisplayId, Frame, DEFAULT_FPS, DEFAULT_QUALITY, MAX_FPS};

/// Opaque id chosen by the viewer (`userID` on the wire).
pub type SubscriberId = String;

/// Identifies one registration of a `(display, id)` pair. A later
/// registration of the same pair gets a new ticket.
pub type Ticket = u64;

/// Bounds for a subscriber channel's capacity.
pub const MIN_CHANNEL_CAPACITY: usize = 1;
pub const MAX_CHANNEL_CAPACITY: usize = 10;

/// Per-subscriber encode/pacing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub quality: u8,
    pub fps: u32,
    pub preview: bool,
    pub diff: bool,
    /// Fixed by the transport at registration: zstd for duplex, raw for HTTP.
    pub compress: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            fps: DEFAULT_FPS,
            preview: false,
            diff: false,
            compress: true,
        }
    }
}

impl StreamConfig {
    /// Validate and apply a new quality. Out-of-range values leave the
    /// current one untouched.
    pub fn set_quality(&mut self, quality: i64) -> StreamResult<()> {
        if !(0..=100).contains(&quality) {
            return Err(StreamError::Config(format!("quality {} outside 0-100", quality)));
        }
        self.quality = quality as u8;
        Ok(())
    }

    pub fn set_fps(&mut self, fps: i64) -> StreamResult<()> {
        if !(1..=MAX_FPS as i64).contains(&fps) {
            return Err(StreamError::Config(format!("fps {} outside 1-{}", fps, MAX_FPS)));
        }
        self.fps = fps as u32;
        Ok(())
    }

    pub fn encode_options(&self, max_width: u32) -> EncodeOptions {
        EncodeOptions {
            quality: self.quality as i32,
            max_width,
            preview: self.preview,
            diff: self.diff,
            compress: self.compress,
        }
    }
}

/// Shared, mutable view of a [`StreamConfig`]. The dispatcher writes it,
/// the capture loop reads it once per tick.
pub type ConfigHandle = Arc<RwLock<StreamConfig>>;

pub fn config_handle(config: StreamConfig) -> ConfigHandle {
    Arc::new(RwLock::new(config))
}

/// What a subscriber's channel carries.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Frame(Frame),
    /// A capture or encode failure on this display's tick.
    Error(String),
}

/// Sent to the owning connection when one of its subscribers is dropped
/// because its channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub display: DisplayId,
    pub id: SubscriberId,
    pub ticket: Ticket,
}

#[derive(Debug)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub display: DisplayId,
    pub tx: mpsc::Sender<StreamItem>,
    pub config: ConfigHandle,
    pub owner: Option<mpsc::UnboundedSender<Eviction>>,
}

/// A point-in-time copy of one registry entry, safe to use without the lock.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: SubscriberId,
    pub ticket: Ticket,
    pub tx: mpsc::Sender<StreamItem>,
    pub config: StreamConfig,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: Vec<SubscriberId>,
}

struct Entry {
    ticket: Ticket,
    sub: Subscriber,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    displays: RwLock<HashMap<DisplayId, HashMap<SubscriberId, Entry>>>,
    next_ticket: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `(display, id)` and return the
    /// ticket that owns it.
    pub fn register(&self, subscriber: Subscriber) -> Ticket {
        let display_id = subscriber.display;
        let id = subscriber.id.clone();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .displays
            .write()
            .entry(display_id)
            .or_default()
            .insert(id.clone(), Entry { ticket, sub: subscriber })
            .is_some();
        debug!(display_id, subscriber = %id, ticket, replaced, "subscriber registered");
        ticket
    }

    /// Remove `(display, id)` if it is still the registration `ticket`
    /// refers to. Returns `true` if something was removed.
    pub fn unregister(&self, display_id: DisplayId, id: &str, ticket: Ticket) -> bool {
        let removed = self.remove_if(display_id, id, ticket).is_some();
        if removed {
            debug!(display_id, subscriber = %id, ticket, "subscriber unregistered");
        }
        removed
    }

    fn remove_if(&self, display: DisplayId, id: &str, ticket: Ticket) -> Option<Subscriber> {
        let mut displays = self.displays.write();
        let subs = displays.get_mut(&display)?;
        if subs.get(id)?.ticket != ticket {
            return None;
        }
        let removed = subs.remove(id).map(|e| e.sub);
        if subs.is_empty() {
            displays.remove(&display);
        }
        removed
    }

    pub fn subscriber_count(&self, display: DisplayId) -> usize {
        self.displays.read().get(&display).map_or(0, |s| s.len())
    }

    pub fn total_subscribers(&self) -> usize {
        self.displays.read().values().map(|s| s.len()).sum()
    }

    /// Copy out every subscriber of `display` with its current config.
    pub fn snapshot(&self, display: DisplayId) -> Vec<Target> {
        let displays = self.displays.read();
        let Some(subs) = displays.get(&display) else {
            return Vec::new();
        };
        subs.values()
            .map(|e| Target {
                id: e.sub.id.clone(),
                ticket: e.ticket,
                tx: e.sub.tx.clone(),
                config: *e.sub.config.read(),
            })
            .collect()
    }

    /// Deliver `item` to every subscriber of `display`.
    #[cfg(test)]
    pub fn fanout(&self, display: DisplayId, item: &StreamItem) -> FanoutReport {
        let targets = self.snapshot(display);
        self.deliver(display, &targets, item)
    }

    /// Deliver `item` to `targets`, each independently. A full channel drops
    /// the item for that subscriber only; a closed one unregisters it.
    pub fn deliver(&self, display_id: DisplayId, targets: &[Target], item: &StreamItem) -> FanoutReport {
        let mut report = FanoutReport::default();
        for target in targets {
            match target.tx.try_send(item.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    trace!(display_id, subscriber = %target.id, "channel full, frame dropped");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    if self.evict(display_id, target) {
                        report.evicted.push(target.id.clone());
                    }
                }
            }
        }
        report
    }

    /// Remove a subscriber whose channel closed, unless it has already been
    /// replaced by a fresh registration.
    fn evict(&self, display_id: DisplayId, target: &Target) -> bool {
        let Some(removed) = self.remove_if(display_id, &target.id, target.ticket) else {
            return false;
        };
        warn!(display_id, subscriber = %target.id, "delivery failed, subscriber removed");
        if let Some(owner) = removed.owner {
            let _ = owner.send(Eviction {
                display: display_id,
                id: target.id.clone(),
                ticket: target.ticket,
            });
        }
        true
    }
}

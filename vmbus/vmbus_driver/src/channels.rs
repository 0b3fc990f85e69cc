// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Channel records, the dense channel table, and the offer/rescind queues
//! drained by the lifecycle worker.

use crate::platform::DmaBuffer;
use crate::platform::NodeHandle;
use crate::Error;
use guid::Guid;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RawMutex;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;

/// A callback invoked from the event-flags scan when the host signals a
/// channel.
pub type ChannelCallback = Arc<dyn Fn() + Send + Sync>;

/// A page-range publication owned by a channel. The backing buffer lives as
/// long as the GPADL.
pub struct Gpadl {
    pub gpadl_id: GpadlId,
    pub len: u32,
    pub buffer: Arc<dyn DmaBuffer>,
}

/// State serialized by the per-channel mutex.
#[derive(Default)]
pub struct ChannelState {
    pub gpadls: Vec<Gpadl>,
}

/// A channel offered by the host.
pub struct Channel {
    pub channel_id: ChannelId,
    pub interface_id: Guid,
    pub instance_id: Guid,
    /// True if the host signals this channel without the shared events
    /// connection. Meaningful only on post-2008 versions.
    pub dedicated_interrupt: bool,
    /// The connection id to signal for this channel.
    pub connection_id: u32,
    /// The registered device node, if any.
    pub node: Mutex<Option<NodeHandle>>,
    /// The callback slot. Written under the channel table lock on the
    /// open/close/rescind paths; read under it by the event-flags scan.
    pub callback: Mutex<Option<ChannelCallback>>,
    /// The per-channel mutex serializing open/close/GPADL operations.
    state: Arc<Mutex<ChannelState>>,
}

impl Channel {
    pub fn new(
        channel_id: ChannelId,
        interface_id: Guid,
        instance_id: Guid,
        dedicated_interrupt: bool,
        connection_id: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            interface_id,
            instance_id,
            dedicated_interrupt,
            connection_id,
            node: Mutex::new(None),
            callback: Mutex::new(None),
            state: Arc::new(Mutex::new(ChannelState::default())),
        })
    }

    pub fn lock_state(&self) -> ArcMutexGuard<RawMutex, ChannelState> {
        Mutex::lock_arc(&self.state)
    }
}

/// A channel returned by [`ChannelTable::get`] with its mutex held, so it
/// cannot be torn down while the caller operates on it.
pub struct LockedChannel {
    channel: Arc<Channel>,
    pub state: ArcMutexGuard<RawMutex, ChannelState>,
}

impl Deref for LockedChannel {
    type Target = Arc<Channel>;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

/// The slots guarded by the channel table lock. Held across callback
/// dispatch, so a rescind that clears a slot cannot race an in-flight
/// callback for that channel.
pub struct TableSlots {
    channels: Vec<Option<Arc<Channel>>>,
    highest_channel_id: u32,
}

impl TableSlots {
    pub fn get(&self, channel_id: ChannelId) -> Option<&Arc<Channel>> {
        self.channels.get(channel_id.0 as usize)?.as_ref()
    }

    /// Stores a channel and raises the highest-seen watermark.
    pub fn insert(&mut self, channel: Arc<Channel>) {
        let id = channel.channel_id.0;
        if self.highest_channel_id < id {
            self.highest_channel_id = id;
        }
        self.channels[id as usize] = Some(channel);
    }

    pub fn take(&mut self, channel_id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get_mut(channel_id.0 as usize)?.take()
    }

    pub fn highest_channel_id(&self) -> u32 {
        self.highest_channel_id
    }
}

/// The dense channel table.
pub struct ChannelTable {
    slots: Mutex<TableSlots>,
    /// Taken for write during channel destruction, after the slot has been
    /// cleared, to drain callers that are between the slot snapshot and the
    /// channel mutex.
    quiesce: RwLock<()>,
}

impl ChannelTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(TableSlots {
                channels: vec![None; capacity],
                highest_channel_id: 0,
            }),
            quiesce: RwLock::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TableSlots> {
        self.slots.lock()
    }

    /// Looks up a channel and returns it with its mutex held. `max` bounds
    /// the valid channel id range for the negotiated version.
    pub fn get(&self, channel_id: ChannelId, max: usize) -> Result<LockedChannel, Error> {
        if channel_id.0 == 0 || channel_id.0 as usize >= max {
            return Err(Error::NotFound);
        }

        let _read = self.quiesce.read();
        let channel = self
            .slots
            .lock()
            .get(channel_id)
            .cloned()
            .ok_or(Error::NotFound)?;
        let state = channel.lock_state();
        Ok(LockedChannel { channel, state })
    }

    /// Blocks until all in-flight [`ChannelTable::get`] callers and the
    /// channel's current mutex holder have finished. The slot must already
    /// be cleared.
    pub fn quiesce(&self, channel: &Channel) {
        let _write = self.quiesce.write();
        drop(channel.lock_state());
    }
}

/// A counting semaphore. One unit is released per queued offer or rescind.
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

struct SemaphoreState {
    count: usize,
    closed: bool,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                count: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        self.cond.notify_one();
    }

    /// Blocks for one unit. Returns false once the semaphore is closed and
    /// drained.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.count > 0 {
                state.count -= 1;
                return true;
            }
            if state.closed {
                return false;
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// The offer and rescind queues feeding the lifecycle worker.
pub struct ChannelQueues {
    lists: Mutex<QueueLists>,
    pub sem: Semaphore,
}

#[derive(Default)]
struct QueueLists {
    offers: VecDeque<Arc<Channel>>,
    rescinds: VecDeque<Arc<Channel>>,
}

impl ChannelQueues {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(QueueLists::default()),
            sem: Semaphore::new(),
        }
    }

    pub fn push_offer(&self, channel: Arc<Channel>) {
        self.lists.lock().offers.push_back(channel);
        self.sem.release();
    }

    pub fn push_rescind(&self, channel: Arc<Channel>) {
        self.lists.lock().rescinds.push_back(channel);
        self.sem.release();
    }

    pub fn pop_offer(&self) -> Option<Arc<Channel>> {
        self.lists.lock().offers.pop_front()
    }

    pub fn pop_rescind(&self) -> Option<Arc<Channel>> {
        self.lists.lock().rescinds.pop_front()
    }
}

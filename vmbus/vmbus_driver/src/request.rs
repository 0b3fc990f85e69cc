// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outstanding management requests and their completion rendezvous.
//!
//! Each request owns a hypercall post-message input page. A request that
//! expects a response sits on the driver's outstanding list until the
//! message engine matches an inbound reply against its
//! `(response type, channel id / discriminator)` key, copies the reply over
//! the request's message buffer, and wakes the waiter.

use crate::platform::DmaAlloc;
use crate::platform::DmaBuffer;
use crate::Error;
use hvdef::hypercall::PostMessage;
use parking_lot::Condvar;
use parking_lot::Mutex;
use safeatomic::AtomicSliceOps;
use std::mem::offset_of;
use std::sync::Arc;
use std::time::Duration;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::MessageType;
use vmbus_core::OutgoingMessage;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;

/// How long a waiter blocks for a response before the request fails.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const PAYLOAD_SIZE_OFFSET: usize = offset_of!(PostMessage, payload_size);
const PAYLOAD_OFFSET: usize = offset_of!(PostMessage, payload);

/// A management request in flight to the host.
pub struct Request {
    input: Arc<dyn DmaBuffer>,
    channel_id: ChannelId,
    response_type: MessageType,
    response_data: u32,
    state: Mutex<Option<Result<(), Error>>>,
    cond: Condvar,
}

impl Request {
    /// Creates a request carrying `message`, associated with `channel_id`
    /// for dispatch filtering. Fire-and-forget unless a response type is
    /// given.
    pub fn new(
        memory: &Arc<dyn DmaAlloc>,
        channel_id: ChannelId,
        message: &OutgoingMessage,
        response_type: MessageType,
        response_data: u32,
    ) -> Result<Arc<Self>, Error> {
        let input = memory
            .allocate("vmbus request", size_of::<PostMessage>(), false)
            .map_err(|_| Error::NoMemory)?;

        let request = Arc::new(Self {
            input,
            channel_id,
            response_type,
            response_data,
            state: Mutex::new(None),
            cond: Condvar::new(),
        });

        let bytes = request.input.bytes();
        bytes[..4].atomic_write_obj(&protocol::MESSAGE_CONNECTION_ID);
        bytes[8..12].atomic_write_obj(&protocol::VMBUS_MESSAGE_TYPE.0);
        request.set_message(message);
        Ok(request)
    }

    /// Replaces the outgoing message payload. Used to reuse one request for
    /// the consecutive additional-GPADL messages.
    pub fn set_message(&self, message: &OutgoingMessage) {
        let bytes = self.input.bytes();
        let data = message.data();
        bytes[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 4].atomic_write_obj(&(data.len() as u32));
        bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + data.len()].atomic_write(data);
    }

    /// The physical address of the post-message hypercall input.
    pub fn input_gpa(&self) -> u64 {
        self.input.gpa()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn response_type(&self) -> MessageType {
        self.response_type
    }

    pub fn response_data(&self) -> u32 {
        self.response_data
    }

    pub fn expects_response(&self) -> bool {
        self.response_type != MessageType::INVALID
    }

    /// Completes the request. On success the reply (header included) is
    /// copied over the message buffer for the waiter to read.
    pub fn notify(&self, result: Result<(), Error>, response: Option<&[u8]>) {
        if !self.expects_response() {
            return;
        }
        if let Some(data) = response {
            let bytes = self.input.bytes();
            bytes[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 4]
                .atomic_write_obj(&(data.len() as u32));
            bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + data.len()].atomic_write(data);
        }
        let mut state = self.state.lock();
        *state = Some(result);
        self.cond.notify_all();
    }

    /// Blocks until the request is notified or the timeout expires.
    pub fn wait(&self) -> Result<(), Error> {
        if !self.expects_response() {
            return Ok(());
        }
        let mut state = self.state.lock();
        while state.is_none() {
            if self.cond.wait_for(&mut state, REQUEST_TIMEOUT).timed_out() && state.is_none() {
                return Err(Error::TimedOut);
            }
        }
        state.unwrap()
    }

    /// Reads the response message body, skipping the message header.
    pub fn response<T: FromBytes + Immutable + KnownLayout>(&self) -> T {
        let offset = PAYLOAD_OFFSET + protocol::HEADER_SIZE;
        self.input.bytes()[offset..offset + size_of::<T>()].atomic_read_obj()
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPADL publication: describing a contiguous guest allocation to the host
//! as a list of physical pages, split across as many messages as the page
//! count requires.

use crate::channels::Gpadl;
use crate::platform::DmaBuffer;
use crate::request::Request;
use crate::Error;
use crate::VmbusDriver;
use std::sync::Arc;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::MessageType;
use vmbus_core::OutgoingMessage;
use zerocopy::IntoBytes;

impl VmbusDriver {
    /// Allocates a contiguous host-visible buffer and publishes it to the
    /// host as a GPADL owned by `channel_id`.
    ///
    /// The first message carries the range descriptor and as many page
    /// numbers as fit, and is the only message that is awaited; the
    /// remaining pages ship in fire-and-forget body messages. The host
    /// responds once it has seen the whole page list.
    pub fn allocate_gpadl(
        &self,
        channel_id: ChannelId,
        len: u32,
    ) -> Result<(Arc<dyn DmaBuffer>, GpadlId), Error> {
        if len == 0 || hvdef::hv_page_align(len as u64) != len as u64 {
            return Err(Error::BadArgument);
        }
        let page_count = (len as u64 >> hvdef::HV_PAGE_SHIFT) as usize;
        if page_count + 1 > protocol::GPADL_MAX_PAGES {
            return Err(Error::BadArgument);
        }

        let mut channel = self.get_channel(channel_id)?;

        let buffer = self
            .services()
            .memory
            .allocate("hv gpadl", len as usize, false)
            .map_err(|_| Error::NoMemory)?;
        let gpadl_id = self.next_gpadl_handle();

        let pfns: Vec<u64> = (0..page_count as u64).map(|i| buffer.pfn() + i).collect();
        let (first, mut remaining) = pfns.split_at(page_count.min(protocol::GpadlHeader::MAX_PAGE_VALUES));

        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            page_count,
            split = !remaining.is_empty(),
            "creating gpadl"
        );

        let header = protocol::GpadlHeader {
            channel_id,
            gpadl_id,
            len: (size_of::<protocol::GpadlRange>() + page_count * size_of::<u64>()) as u16,
            count: 1,
        };
        let range = protocol::GpadlRange { len, offset: 0 };
        let mut data = range.as_bytes().to_vec();
        data.extend_from_slice(first.as_bytes());

        let request = Request::new(
            self.memory(),
            channel_id,
            &OutgoingMessage::with_data(&header, &data),
            MessageType::GPADL_CREATED,
            gpadl_id.0,
        )?;
        self.post_request(&request)?;

        // Ship the rest of the page list. Only the first message carries the
        // response; a failure here orphans it, so take it back off the
        // outstanding list.
        if !remaining.is_empty() {
            let body = protocol::GpadlBody {
                rsvd: 0,
                gpadl_id,
            };
            let additional = match Request::new(
                self.memory(),
                channel_id,
                &OutgoingMessage::new(&body),
                MessageType::INVALID,
                0,
            ) {
                Ok(additional) => additional,
                Err(err) => {
                    self.cancel_request(&request);
                    return Err(err);
                }
            };

            while !remaining.is_empty() {
                let (chunk, rest) =
                    remaining.split_at(remaining.len().min(protocol::GpadlBody::MAX_PAGE_VALUES));
                remaining = rest;
                additional.set_message(&OutgoingMessage::with_data(&body, chunk.as_bytes()));
                if let Err(err) = self.post_request(&additional) {
                    self.cancel_request(&request);
                    return Err(err);
                }
            }
        }

        self.wait_request(&request)?;
        let response: protocol::GpadlCreated = request.response();
        if response.status != protocol::STATUS_SUCCESS {
            tracing::warn!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                status = response.status,
                "host refused gpadl"
            );
            return Err(Error::Io);
        }

        channel.state.gpadls.push(Gpadl {
            gpadl_id,
            len,
            buffer: buffer.clone(),
        });
        Ok((buffer, gpadl_id))
    }

    /// Retracts a GPADL and releases its backing buffer.
    ///
    /// The torndown response carries only the GPADL id, so the request is
    /// matched on that discriminator alone.
    pub fn free_gpadl(&self, channel_id: ChannelId, gpadl_id: GpadlId) -> Result<(), Error> {
        let mut channel = self.get_channel(channel_id)?;
        let index = channel
            .state
            .gpadls
            .iter()
            .position(|gpadl| gpadl.gpadl_id == gpadl_id)
            .ok_or(Error::BadArgument)?;
        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            len = channel.state.gpadls[index].len,
            "freeing gpadl"
        );

        let message = protocol::GpadlTeardown {
            channel_id,
            gpadl_id,
        };
        let request = Request::new(
            self.memory(),
            channel_id,
            &OutgoingMessage::new(&message),
            MessageType::GPADL_TORNDOWN,
            gpadl_id.0,
        )?;
        self.send_request(&request)?;

        channel.state.gpadls.remove(index);
        Ok(())
    }
}

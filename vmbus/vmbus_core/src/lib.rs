// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core types shared between VMBus components: the management message
//! protocol and the outgoing message builder.

#![forbid(unsafe_code)]

pub mod protocol;

use protocol::MessageHeader;
use protocol::VmbusMessage;
use protocol::HEADER_SIZE;
use protocol::MAX_MESSAGE_SIZE;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Represents a vmbus message to be sent using the synic.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    data: [u8; MAX_MESSAGE_SIZE],
    len: u8,
}

impl OutgoingMessage {
    /// Creates a new `OutgoingMessage` for the specified protocol message.
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        let mut data = [0; MAX_MESSAGE_SIZE];
        let header = MessageHeader::new(T::MESSAGE_TYPE);
        let message_bytes = message.as_bytes();
        let len = HEADER_SIZE + message_bytes.len();
        data[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        data[HEADER_SIZE..len].copy_from_slice(message_bytes);
        Self {
            data,
            len: len as u8,
        }
    }

    /// Creates a new `OutgoingMessage` for the specified protocol message,
    /// including additional data at the end of the message.
    ///
    /// Panics if the trailing data does not fit.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Self {
        let mut message = OutgoingMessage::new(message);
        let old_len = message.len as usize;
        let len = old_len + data.len();
        message.data[old_len..len].copy_from_slice(data);
        message.len = len as u8;
        message
    }

    /// Gets the binary representation of the message.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelId;
    use crate::protocol::GpadlId;
    use crate::protocol::Message;
    use crate::protocol::MessageType;
    use crate::protocol::Version;
    use crate::protocol::SUPPORTED_VERSIONS;
    use zerocopy::FromZeros;

    #[test]
    fn test_outgoing_message() {
        let message = OutgoingMessage::new(&protocol::CloseChannel {
            channel_id: ChannelId(5),
        });

        assert_eq!(&[0x7, 0, 0, 0, 0, 0, 0, 0, 0x5, 0, 0, 0], message.data())
    }

    #[test]
    fn test_outgoing_message_empty() {
        let message = OutgoingMessage::new(&protocol::Unload {});

        assert_eq!(&[0x10, 0, 0, 0, 0, 0, 0, 0], message.data())
    }

    #[test]
    fn test_outgoing_message_with_data() {
        let message = OutgoingMessage::with_data(
            &protocol::GpadlBody {
                rsvd: 0,
                gpadl_id: GpadlId(1),
            },
            &[0xa, 0xb, 0xc, 0xd],
        );

        assert_eq!(
            &[0x9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x1, 0, 0, 0, 0xa, 0xb, 0xc, 0xd],
            message.data()
        )
    }

    #[test]
    fn test_parse_roundtrip() {
        let sent = protocol::OpenResult {
            channel_id: ChannelId(9),
            open_id: 9,
            status: 0,
        };
        let message = OutgoingMessage::new(&sent);
        let Message::OpenResult(parsed, rest) = Message::parse(message.data()).unwrap() else {
            panic!("wrong message type");
        };
        assert_eq!(parsed, sent);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_rejects_short_payload() {
        let mut data = Vec::new();
        data.extend_from_slice(MessageHeader::new(MessageType::OFFER_CHANNEL).as_bytes());
        data.extend_from_slice(&protocol::OfferChannel::new_zeroed().as_bytes()[..100]);
        assert!(matches!(
            Message::parse(&data),
            Err(protocol::ParseError::MessageTooSmall(Some(
                MessageType::OFFER_CHANNEL
            )))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let data = [0x99, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Message::parse(&data),
            Err(protocol::ParseError::InvalidMessageType(MessageType(0x99)))
        ));
    }

    #[test]
    fn test_version_order_newest_first() {
        assert_eq!(SUPPORTED_VERSIONS[0], Version::Iron);
        assert!(SUPPORTED_VERSIONS.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(Version::Win10Rs5 as u32, 0x00050002);
        assert!(Version::V1.is_legacy());
        assert!(Version::Win7.is_legacy());
        assert!(!Version::Win8.is_legacy());
    }

    #[test]
    fn test_gpadl_message_capacities() {
        // 26 pages fit beside the range descriptor in the first message; 28
        // in each additional message.
        assert_eq!(protocol::GpadlHeader::MAX_PAGE_VALUES, 26);
        assert_eq!(protocol::GpadlBody::MAX_PAGE_VALUES, 28);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VMBus management message protocol.
//!
//! Management messages are carried in SynIC message slots and posted by the
//! guest with the post-message hypercall. Each message starts with a
//! [`MessageHeader`] whose leading `u32` discriminates the payload; the
//! packed structs below are the wire contract, so their layouts are pinned
//! with compile-time size asserts.

use guid::Guid;
use hvdef::HvMessageType;
use static_assertions::const_assert;
use std::fmt::Debug;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The SynIC message type carrying VMBus channel messages.
pub const VMBUS_MESSAGE_TYPE: HvMessageType = HvMessageType(1);

/// The fixed connection id for posting management messages.
pub const MESSAGE_CONNECTION_ID: u32 = 1;
/// The fixed connection id for the shared events connection used by channels
/// without a dedicated interrupt.
pub const EVENT_CONNECTION_ID: u32 = 2;

/// Host status in responses; zero means success.
pub const STATUS_SUCCESS: i32 = 0;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();
pub const MAX_MESSAGE_SIZE: usize = hvdef::HV_MESSAGE_PAYLOAD_SIZE;

/// The maximum number of channels offered by hosts speaking post-2008
/// protocol versions, bounded by the event flags available to one SINT.
pub const MAX_CHANNELS: usize = hvdef::HV_EVENT_FLAGS_COUNT;
/// The maximum number of channels on the two 2008-era protocol versions.
pub const MAX_CHANNELS_LEGACY: usize = 256;

/// The maximum number of pages in one GPADL.
pub const GPADL_MAX_PAGES: usize = 8192;

/// Trait implemented on all protocol message structs.
pub trait VmbusMessage: Sized {
    /// The corresponding message type for the struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the vmbus message header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// Represents the message type value that identifies a vmbus protocol
/// message.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const INVALID: Self = Self(0);
    pub const OFFER_CHANNEL: Self = Self(1);
    pub const RESCIND_CHANNEL_OFFER: Self = Self(2);
    pub const REQUEST_OFFERS: Self = Self(3);
    pub const ALL_OFFERS_DELIVERED: Self = Self(4);
    pub const OPEN_CHANNEL: Self = Self(5);
    pub const OPEN_CHANNEL_RESULT: Self = Self(6);
    pub const CLOSE_CHANNEL: Self = Self(7);
    pub const GPADL_HEADER: Self = Self(8);
    pub const GPADL_BODY: Self = Self(9);
    pub const GPADL_CREATED: Self = Self(10);
    pub const GPADL_TEARDOWN: Self = Self(11);
    pub const GPADL_TORNDOWN: Self = Self(12);
    pub const REL_ID_RELEASED: Self = Self(13);
    pub const INITIATE_CONTACT: Self = Self(14);
    pub const VERSION_RESPONSE: Self = Self(15);
    pub const UNLOAD: Self = Self(16);
    pub const UNLOAD_COMPLETE: Self = Self(17);
}

impl Debug for MessageType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::INVALID => "INVALID",
            Self::OFFER_CHANNEL => "OFFER_CHANNEL",
            Self::RESCIND_CHANNEL_OFFER => "RESCIND_CHANNEL_OFFER",
            Self::REQUEST_OFFERS => "REQUEST_OFFERS",
            Self::ALL_OFFERS_DELIVERED => "ALL_OFFERS_DELIVERED",
            Self::OPEN_CHANNEL => "OPEN_CHANNEL",
            Self::OPEN_CHANNEL_RESULT => "OPEN_CHANNEL_RESULT",
            Self::CLOSE_CHANNEL => "CLOSE_CHANNEL",
            Self::GPADL_HEADER => "GPADL_HEADER",
            Self::GPADL_BODY => "GPADL_BODY",
            Self::GPADL_CREATED => "GPADL_CREATED",
            Self::GPADL_TEARDOWN => "GPADL_TEARDOWN",
            Self::GPADL_TORNDOWN => "GPADL_TORNDOWN",
            Self::REL_ID_RELEASED => "REL_ID_RELEASED",
            Self::INITIATE_CONTACT => "INITIATE_CONTACT",
            Self::VERSION_RESPONSE => "VERSION_RESPONSE",
            Self::UNLOAD => "UNLOAD",
            Self::UNLOAD_COMPLETE => "UNLOAD_COMPLETE",
            Self(n) => return write!(fmt, "{:#x}", n),
        };
        fmt.pad(name)
    }
}

/// The header of a vmbus message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// Creates a new `MessageHeader` for the specified message type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

/// The protocol versions this driver can negotiate.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    /// Windows Server 2008.
    V1 = make_version(0, 13),
    /// Windows 7 / Windows Server 2008 R2.
    Win7 = make_version(1, 1),
    /// Windows 8 / Windows Server 2012.
    Win8 = make_version(2, 4),
    /// Windows 8.1 / Windows Server 2012 R2.
    Win8_1 = make_version(3, 0),
    /// Windows 10 RS1 / Windows Server 2016.
    Win10 = make_version(4, 0),
    /// Windows 10 RS3.
    Win10Rs3_0 = make_version(4, 1),
    /// Windows 10 v5.
    Win10Rs3_1 = make_version(5, 0),
    /// Windows 10 RS4.
    Win10Rs4 = make_version(5, 1),
    /// Windows 10 RS5 / Windows Server 2019.
    Win10Rs5 = make_version(5, 2),
    /// Windows Server 2022.
    Iron = make_version(5, 3),
}

/// The versions offered to the host during contact, newest first.
pub const SUPPORTED_VERSIONS: &[Version] = &[
    Version::Iron,
    Version::Win10Rs5,
    Version::Win10Rs4,
    Version::Win10Rs3_1,
    Version::Win10Rs3_0,
    Version::Win10,
    Version::Win8_1,
    Version::Win8,
    Version::Win7,
    Version::V1,
];

impl Version {
    /// Returns true for the 2008-era versions, which use the bus-wide RX
    /// event flags page and the smaller channel table.
    pub fn is_legacy(&self) -> bool {
        matches!(self, Version::V1 | Version::Win7)
    }

    pub fn major(&self) -> u16 {
        (*self as u32 >> 16) as u16
    }

    pub fn minor(&self) -> u16 {
        *self as u32 as u16
    }
}

/// Possible values for the `VersionResponse::connection_state` field.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ConnectionState(pub u8);

impl ConnectionState {
    pub const SUCCESSFUL: Self = Self(0);
    pub const FAILED_LOW_RESOURCES: Self = Self(1);
    pub const FAILED_UNKNOWN_FAILURE: Self = Self(2);
}

impl Debug for ConnectionState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match *self {
            Self::SUCCESSFUL => "SUCCESSFUL",
            Self::FAILED_LOW_RESOURCES => "FAILED_LOW_RESOURCES",
            Self::FAILED_UNKNOWN_FAILURE => "FAILED_UNKNOWN_FAILURE",
            Self(n) => return write!(fmt, "{:#x}", n),
        };
        fmt.pad(s)
    }
}

/// User-defined data provided by a device as part of an offer or open
/// request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct UserDefinedData([u8; 120]);

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 120]> for UserDefinedData {
    fn from(value: [u8; 120]) -> Self {
        Self(value)
    }
}

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: u16,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    /// Only meaningful on post-2008 versions.
    pub monitor_allocated: u8,
    /// Bit 0 set if the channel signals with a dedicated connection id
    /// instead of the shared events connection. Only meaningful on post-2008
    /// versions.
    pub is_dedicated: u16,
    /// The connection id to signal for dedicated-interrupt channels. Only
    /// meaningful on post-2008 versions.
    pub connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestOffers {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AllOffersDelivered {}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

/// A single page-aligned range covering the whole GPADL, followed on the
/// wire by the page number array.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlRange {
    pub len: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    /// Size in bytes of the range array, including the trailing page
    /// numbers.
    pub len: u16,
    pub count: u16,
}

impl GpadlHeader {
    /// The maximum number of page number values that fit after the message
    /// data and its single range descriptor.
    pub const MAX_PAGE_VALUES: usize =
        (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE - size_of::<GpadlRange>()) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// The maximum number of page number values that fit after the message
    /// data.
    pub const MAX_PAGE_VALUES: usize =
        (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    /// The guest physical address of the bus-wide RX/TX event flags page.
    pub interrupt_page: u64,
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: ConnectionState,
    pub padding: u16,
    /// The connection id assigned by the host when the version is supported.
    pub selected_version_or_connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Unload {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UnloadComplete {}

// The wire sizes of these structs are a contract with the host.
const_assert!(size_of::<MessageHeader>() == 8);
const_assert!(size_of::<OfferChannel>() == 188);
const_assert!(size_of::<RescindChannelOffer>() == 4);
const_assert!(size_of::<OpenChannel>() == 140);
const_assert!(size_of::<OpenResult>() == 12);
const_assert!(size_of::<GpadlHeader>() == 12);
const_assert!(size_of::<GpadlBody>() == 8);
const_assert!(size_of::<GpadlCreated>() == 12);
const_assert!(size_of::<GpadlTeardown>() == 8);
const_assert!(size_of::<GpadlTorndown>() == 4);
const_assert!(size_of::<InitiateContact>() == 32);
const_assert!(size_of::<VersionResponse>() == 8);

macro_rules! vmbus_message_impl {
    ($($name:ident $type:ident,)*) => {
        $(
            impl VmbusMessage for $type {
                const MESSAGE_TYPE: MessageType = MessageType::$name;
            }

            const_assert!($type::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*
    };
}

vmbus_message_impl! {
    OFFER_CHANNEL OfferChannel,
    RESCIND_CHANNEL_OFFER RescindChannelOffer,
    REQUEST_OFFERS RequestOffers,
    ALL_OFFERS_DELIVERED AllOffersDelivered,
    OPEN_CHANNEL OpenChannel,
    OPEN_CHANNEL_RESULT OpenResult,
    CLOSE_CHANNEL CloseChannel,
    GPADL_HEADER GpadlHeader,
    GPADL_BODY GpadlBody,
    GPADL_CREATED GpadlCreated,
    GPADL_TEARDOWN GpadlTeardown,
    GPADL_TORNDOWN GpadlTorndown,
    REL_ID_RELEASED RelIdReleased,
    INITIATE_CONTACT InitiateContact,
    VERSION_RESPONSE VersionResponse,
    UNLOAD Unload,
    UNLOAD_COMPLETE UnloadComplete,
}

/// An error that occurred while parsing a vmbus protocol message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The message was smaller than required for the message type.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is not a valid vmbus protocol message.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Represents a parsed vmbus protocol message. Each variant carries the
/// fixed struct plus any trailing bytes.
#[derive(Debug)]
pub enum Message<'a> {
    OfferChannel(OfferChannel, &'a [u8]),
    RescindChannelOffer(RescindChannelOffer, &'a [u8]),
    RequestOffers(RequestOffers, &'a [u8]),
    AllOffersDelivered(AllOffersDelivered, &'a [u8]),
    OpenChannel(OpenChannel, &'a [u8]),
    OpenResult(OpenResult, &'a [u8]),
    CloseChannel(CloseChannel, &'a [u8]),
    GpadlHeader(GpadlHeader, &'a [u8]),
    GpadlBody(GpadlBody, &'a [u8]),
    GpadlCreated(GpadlCreated, &'a [u8]),
    GpadlTeardown(GpadlTeardown, &'a [u8]),
    GpadlTorndown(GpadlTorndown, &'a [u8]),
    RelIdReleased(RelIdReleased, &'a [u8]),
    InitiateContact(InitiateContact, &'a [u8]),
    VersionResponse(VersionResponse, &'a [u8]),
    Unload(Unload, &'a [u8]),
    UnloadComplete(UnloadComplete, &'a [u8]),
}

impl<'a> Message<'a> {
    /// Parses a vmbus message received from the synic into an enum variant,
    /// validating that the payload is at least the fixed size for its type.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        let (header, data) = MessageHeader::read_from_prefix(data)
            .map_err(|_| ParseError::MessageTooSmall(None))?;

        fn read<'a, T: FromBytes + KnownLayout + Immutable>(
            message_type: MessageType,
            data: &'a [u8],
        ) -> Result<(T, &'a [u8]), ParseError> {
            T::read_from_prefix(data).map_err(|_| ParseError::MessageTooSmall(Some(message_type)))
        }

        let typ = header.message_type();
        let message = match typ {
            MessageType::OFFER_CHANNEL => {
                let (m, rest) = read(typ, data)?;
                Self::OfferChannel(m, rest)
            }
            MessageType::RESCIND_CHANNEL_OFFER => {
                let (m, rest) = read(typ, data)?;
                Self::RescindChannelOffer(m, rest)
            }
            MessageType::REQUEST_OFFERS => {
                let (m, rest) = read(typ, data)?;
                Self::RequestOffers(m, rest)
            }
            MessageType::ALL_OFFERS_DELIVERED => {
                let (m, rest) = read(typ, data)?;
                Self::AllOffersDelivered(m, rest)
            }
            MessageType::OPEN_CHANNEL => {
                let (m, rest) = read(typ, data)?;
                Self::OpenChannel(m, rest)
            }
            MessageType::OPEN_CHANNEL_RESULT => {
                let (m, rest) = read(typ, data)?;
                Self::OpenResult(m, rest)
            }
            MessageType::CLOSE_CHANNEL => {
                let (m, rest) = read(typ, data)?;
                Self::CloseChannel(m, rest)
            }
            MessageType::GPADL_HEADER => {
                let (m, rest) = read(typ, data)?;
                Self::GpadlHeader(m, rest)
            }
            MessageType::GPADL_BODY => {
                let (m, rest) = read(typ, data)?;
                Self::GpadlBody(m, rest)
            }
            MessageType::GPADL_CREATED => {
                let (m, rest) = read(typ, data)?;
                Self::GpadlCreated(m, rest)
            }
            MessageType::GPADL_TEARDOWN => {
                let (m, rest) = read(typ, data)?;
                Self::GpadlTeardown(m, rest)
            }
            MessageType::GPADL_TORNDOWN => {
                let (m, rest) = read(typ, data)?;
                Self::GpadlTorndown(m, rest)
            }
            MessageType::REL_ID_RELEASED => {
                let (m, rest) = read(typ, data)?;
                Self::RelIdReleased(m, rest)
            }
            MessageType::INITIATE_CONTACT => {
                let (m, rest) = read(typ, data)?;
                Self::InitiateContact(m, rest)
            }
            MessageType::VERSION_RESPONSE => {
                let (m, rest) = read(typ, data)?;
                Self::VersionResponse(m, rest)
            }
            MessageType::UNLOAD => {
                let (m, rest) = read(typ, data)?;
                Self::Unload(m, rest)
            }
            MessageType::UNLOAD_COMPLETE => {
                let (m, rest) = read(typ, data)?;
                Self::UnloadComplete(m, rest)
            }
            _ => return Err(ParseError::InvalidMessageType(typ)),
        };

        Ok(message)
    }
}

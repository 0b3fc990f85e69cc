// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements the low-level interface to the VMBus ring buffer.
//! The ring buffer resides in guest memory and is mapped into the host,
//! allowing efficient transfer of variable-sized packets.
//!
//! A ring is a 4 KiB control page followed by a page-multiple data buffer.
//! Each packet is a descriptor, a payload padded to 8 bytes, and an 8-byte
//! trailer holding the ring offset the packet was written at, shifted left
//! by 32 bits. The guest owns the write index of the outgoing ring and the
//! read index of the incoming ring; the host owns the mirrored sides, so
//! every shared field is accessed through atomics.
//!
//! In practice ring buffers always come in pairs so that packets can be both
//! sent and received. This module's interfaces operate on them singly.

#![forbid(unsafe_code)]

use safeatomic::AtomicSliceOps;
use static_assertions::const_assert;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// VMBus ring buffers are sized in multiples of 4 KiB pages, with a 4 KiB
/// control page.
pub const PAGE_SIZE: usize = 4096;

/// The descriptor at the head of every packet. Lengths are in 8-byte units.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PacketDescriptor {
    pub packet_type: u16,
    pub header_length8: u16,
    pub total_length8: u16,
    pub flags: u16,
    pub transaction_id: u64,
}

const_assert!(size_of::<PacketDescriptor>() == 16);

pub const PACKET_FLAG_RESPONSE_REQUIRED: u16 = 1;

/// The descriptor size, which is also the minimum packet header length.
pub const DESCRIPTOR_SIZE: usize = size_of::<PacketDescriptor>();

/// The packet trailer: the ring offset the packet started at, in the high 32
/// bits.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Footer {
    pub reserved: u32,
    pub offset: u32,
}

const_assert!(size_of::<Footer>() == 8);

/// If set in the control page feature bits, the endpoint supports sending
/// signals when the number of free bytes in the ring reaches or exceeds
/// `pending_send_size`.
pub const FEATURE_SUPPORTS_PENDING_SEND_SIZE: u32 = 1;

// Control page field offsets. These are a contract with the host.
const WRITE_INDEX_OFFSET: usize = 0;
const READ_INDEX_OFFSET: usize = 4;
const INTERRUPT_MASK_OFFSET: usize = 8;
const PENDING_SEND_SIZE_OFFSET: usize = 12;
const FEATURE_BITS_OFFSET: usize = 64;
const INTERRUPT_COUNT_OFFSET: usize = PAGE_SIZE - 8;

/// A control page accessor.
pub struct Control<'a>(pub &'a [AtomicU8; PAGE_SIZE]);

impl Control<'_> {
    fn word(&self, offset: usize) -> &AtomicU32 {
        self.0[offset..offset + 4].as_atomic().unwrap()
    }

    /// The index the sending side will write the next packet at.
    pub fn write_index(&self) -> &AtomicU32 {
        self.word(WRITE_INDEX_OFFSET)
    }

    /// The index the receiving side will read the next packet from.
    pub fn read_index(&self) -> &AtomicU32 {
        self.word(READ_INDEX_OFFSET)
    }

    /// Nonzero when the receiving side does not want empty-to-non-empty
    /// signals.
    pub fn interrupt_mask(&self) -> &AtomicU32 {
        self.word(INTERRUPT_MASK_OFFSET)
    }

    /// The free-byte threshold at which the receiving side should signal the
    /// sender.
    pub fn pending_send_size(&self) -> &AtomicU32 {
        self.word(PENDING_SEND_SIZE_OFFSET)
    }

    pub fn feature_bits(&self) -> &AtomicU32 {
        self.word(FEATURE_BITS_OFFSET)
    }

    /// The number of guest-to-host signals sent for this ring.
    pub fn guest_to_host_interrupt_count(&self) -> &AtomicU64 {
        self.0[INTERRUPT_COUNT_OFFSET..PAGE_SIZE]
            .as_atomic()
            .unwrap()
    }
}

impl Debug for Control<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("write_index", &self.write_index().load(Ordering::Relaxed))
            .field("read_index", &self.read_index().load(Ordering::Relaxed))
            .field(
                "interrupt_mask",
                &self.interrupt_mask().load(Ordering::Relaxed),
            )
            .field(
                "pending_send_size",
                &self.pending_send_size().load(Ordering::Relaxed),
            )
            .field("feature_bits", &self.feature_bits().load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid ring buffer pointer")]
    InvalidRingPointer,
    #[error("invalid ring memory")]
    InvalidRingMemory,
    #[error("invalid descriptor offset or length")]
    InvalidDescriptorLengths,
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    /// No complete packet is available to read.
    #[error("ring buffer does not hold a complete packet")]
    NotReady,
    /// A caller buffer is too small; the required sizes are reported.
    #[error("buffer too small, need {header_len} header and {data_len} data bytes")]
    BufferTooSmall { header_len: usize, data_len: usize },
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The ring has less than the needed number of bytes free.
    #[error("ring buffer full, need {0} bytes")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// A trait for memory backing a ring buffer.
pub trait RingMem: Send {
    /// Returns the control page. Must be page-aligned so the [`Control`]
    /// field accessors can take atomic views.
    fn control(&self) -> &[AtomicU8; PAGE_SIZE];

    /// Reads from the data portion of the ring, wrapping (once) at the end
    /// of the ring. Precondition: `addr < self.len()` and
    /// `data.len() <= self.len()`.
    fn read_at(&self, addr: usize, data: &mut [u8]);

    /// Writes to the data portion of the ring, wrapping (once) at the end of
    /// the ring. Precondition: `addr < self.len()` and
    /// `data.len() <= self.len()`.
    fn write_at(&self, addr: usize, data: &[u8]);

    /// Returns the length of the ring data buffer in bytes.
    fn len(&self) -> usize;
}

/// Implementation of `RingMem` for references. Useful for tests.
impl<T: RingMem + Sync> RingMem for &'_ T {
    fn control(&self) -> &[AtomicU8; PAGE_SIZE] {
        (*self).control()
    }
    fn read_at(&self, addr: usize, data: &mut [u8]) {
        (*self).read_at(addr, data)
    }
    fn write_at(&self, addr: usize, data: &[u8]) {
        (*self).write_at(addr, data)
    }
    fn len(&self) -> usize {
        (*self).len()
    }
}

/// An implementation of `RingMem` over a flat allocation. Useful for tests.
#[derive(Clone)]
pub struct FlatRingMem {
    inner: Arc<FlatRingInner>,
}

struct FlatRingInner {
    control: AlignedBytes,
    data: AlignedBytes,
}

/// A byte buffer aligned to the page size, as the control page accessors
/// require.
struct AlignedBytes {
    storage: Vec<AtomicU8>,
    offset: usize,
    len: usize,
}

impl AlignedBytes {
    fn new(len: usize) -> Self {
        let mut storage: Vec<AtomicU8> = Vec::new();
        storage.resize_with(len + PAGE_SIZE, Default::default);
        let offset = storage.as_ptr().align_offset(PAGE_SIZE);
        Self {
            storage,
            offset,
            len,
        }
    }

    fn bytes(&self) -> &[AtomicU8] {
        &self.storage[self.offset..self.offset + self.len]
    }
}

impl FlatRingMem {
    /// Allocates a new memory with a `len`-byte data buffer.
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(FlatRingInner {
                control: AlignedBytes::new(PAGE_SIZE),
                data: AlignedBytes::new(len),
            }),
        }
    }
}

impl Debug for FlatRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatRingMem").finish()
    }
}

impl RingMem for FlatRingMem {
    fn control(&self) -> &[AtomicU8; PAGE_SIZE] {
        self.inner.control.bytes().try_into().unwrap()
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        let ring = self.inner.data.bytes();
        if data.len() > self.len() - addr {
            let split = self.len() - addr;
            let (first, last) = data.split_at_mut(split);
            ring[addr..].atomic_read(first);
            ring[..last.len()].atomic_read(last);
        } else {
            ring[addr..addr + data.len()].atomic_read(data);
        }
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        let ring = self.inner.data.bytes();
        if data.len() > self.len() - addr {
            let split = self.len() - addr;
            let (first, last) = data.split_at(split);
            ring[addr..].atomic_write(first);
            ring[..last.len()].atomic_write(last);
        } else {
            ring[addr..addr + data.len()].atomic_write(data);
        }
    }

    fn len(&self) -> usize {
        self.inner.data.len
    }
}

/// Information about an outgoing packet.
#[derive(Debug)]
pub struct OutgoingPacket<'a> {
    pub packet_type: u16,
    pub payload: &'a [u8],
    pub response_required: bool,
    pub transaction_id: u64,
}

/// The result of a successful packet read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketRead {
    /// The length of the packet header in bytes, at least
    /// [`DESCRIPTOR_SIZE`].
    pub header_len: usize,
    /// The length of the packet data in bytes.
    pub data_len: usize,
}

struct InnerRing<M: RingMem> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Debug for InnerRing<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerRing")
            .field("control", &self.control())
            .field("size", &self.size)
            .finish()
    }
}

impl<M: RingMem> InnerRing<M> {
    fn new(mem: M) -> Result<Self, Error> {
        let size = u32::try_from(mem.len()).map_err(|_| Error::InvalidRingMemory)?;
        if size == 0 || size % PAGE_SIZE as u32 != 0 {
            return Err(Error::InvalidRingMemory);
        }
        Ok(InnerRing { mem, size })
    }

    fn control(&self) -> Control<'_> {
        Control(self.mem.control())
    }

    /// Validates a ring pointer read from shared memory.
    fn validate(&self, p: u32) -> Result<u32, Error> {
        if p >= self.size || p % 8 != 0 {
            Err(Error::InvalidRingPointer)
        } else {
            Ok(p)
        }
    }

    fn add_pointer(&self, p: u32, off: u32) -> u32 {
        (p + off) % self.size
    }

    /// The number of bytes of packet data between `read_index` and
    /// `write_index`.
    fn used(&self, write_index: u32, read_index: u32) -> u32 {
        if write_index >= read_index {
            write_index - read_index
        } else {
            self.size - (read_index - write_index)
        }
    }

    /// The number of bytes free for the writer. The ring can never be
    /// filled completely since that state would be indistinguishable from
    /// the empty ring, so 8 bytes are always held back.
    fn free(&self, write_index: u32, read_index: u32) -> u32 {
        self.size - self.used(write_index, read_index) - 8
    }
}

/// The sending side of a ring buffer.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem> {
    inner: InnerRing<M>,
}

impl<M: RingMem> OutgoingRing<M> {
    /// Returns a new outgoing ring over `mem`.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        // Feature bits are declared by the sending side.
        let control = inner.control();
        control
            .feature_bits()
            .store(FEATURE_SUPPORTS_PENDING_SEND_SIZE, Ordering::Relaxed);
        control.pending_send_size().store(0, Ordering::Relaxed);
        Ok(Self { inner })
    }

    /// Writes a packet and publishes the new write index.
    ///
    /// Returns `Ok(true)` if the ring transitioned from empty to non-empty
    /// with interrupts unmasked, in which case the caller must signal the
    /// host. Returns `Err(WriteError::Full)` without modifying the ring when
    /// the packet plus its trailer does not fit.
    ///
    /// The caller must serialize calls; the host only reads this ring.
    pub fn write(&self, packet: &OutgoingPacket<'_>) -> Result<bool, WriteError> {
        let control = self.inner.control();
        let total_len = (DESCRIPTOR_SIZE + packet.payload.len() + 7) & !7;
        let needed = total_len + size_of::<Footer>();

        let old_write_index = self
            .inner
            .validate(control.write_index().load(Ordering::Relaxed))?;
        let read_index = self
            .inner
            .validate(control.read_index().load(Ordering::Acquire))?;
        if needed as u32 > self.inner.free(old_write_index, read_index) {
            return Err(WriteError::Full(needed));
        }

        let descriptor = PacketDescriptor {
            packet_type: packet.packet_type,
            header_length8: (DESCRIPTOR_SIZE / 8) as u16,
            total_length8: (total_len / 8) as u16,
            flags: if packet.response_required {
                PACKET_FLAG_RESPONSE_REQUIRED
            } else {
                0
            },
            transaction_id: packet.transaction_id,
        };
        let footer = Footer {
            reserved: 0,
            offset: old_write_index,
        };

        let mut off = old_write_index;
        self.inner.mem.write_at(off as usize, descriptor.as_bytes());
        off = self.inner.add_pointer(off, DESCRIPTOR_SIZE as u32);
        self.inner.mem.write_at(off as usize, packet.payload);
        off = self.inner.add_pointer(off, packet.payload.len() as u32);
        let padding = [0u8; 7];
        let pad_len = total_len - DESCRIPTOR_SIZE - packet.payload.len();
        if pad_len != 0 {
            self.inner.mem.write_at(off as usize, &padding[..pad_len]);
            off = self.inner.add_pointer(off, pad_len as u32);
        }
        self.inner.mem.write_at(off as usize, footer.as_bytes());

        let new_write_index = self.inner.add_pointer(old_write_index, needed as u32);

        // The data must be visible to the host before the new write index is.
        control
            .write_index()
            .store(new_write_index, Ordering::SeqCst);

        // Signal only on an empty-to-non-empty transition: the host does not
        // need another interrupt while it is still draining.
        let needs_interrupt = control.interrupt_mask().load(Ordering::SeqCst) == 0
            && control.read_index().load(Ordering::SeqCst) == old_write_index;
        if needs_interrupt {
            control
                .guest_to_host_interrupt_count()
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(needs_interrupt)
    }
}

/// The receiving side of a ring buffer.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem> {
    inner: InnerRing<M>,
}

impl<M: RingMem> IncomingRing<M> {
    /// Returns a new incoming ring over `mem`.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        // Start with empty-to-non-empty signals enabled.
        inner.control().interrupt_mask().store(0, Ordering::Relaxed);
        Ok(Self { inner })
    }

    /// Enables or disables the interrupt mask, declaring to the opposite
    /// endpoint that empty-to-non-empty signals should not or should be
    /// sent.
    pub fn set_interrupt_mask(&self, state: bool) {
        self.inner
            .control()
            .interrupt_mask()
            .store(state as u32, Ordering::SeqCst);
    }

    /// Reads the leading `buf.len()` bytes of the next packet without
    /// consuming it.
    ///
    /// `buf.len()` is checked against the available data plus the trailer,
    /// so peeking a packet's declared total length guarantees `read_packet`
    /// for that packet will not find the ring short.
    pub fn peek(&self, buf: &mut [u8]) -> Result<(), ReadError> {
        let control = self.inner.control();
        let read_index = self
            .inner
            .validate(control.read_index().load(Ordering::Relaxed))?;
        let write_index = self
            .inner
            .validate(control.write_index().load(Ordering::Acquire))?;
        if self.inner.used(write_index, read_index) < (buf.len() + size_of::<Footer>()) as u32 {
            return Err(ReadError::NotReady);
        }
        self.inner.mem.read_at(read_index as usize, buf);
        Ok(())
    }

    /// Reads the next packet's descriptor without consuming the packet.
    pub fn peek_descriptor(&self) -> Result<PacketDescriptor, ReadError> {
        let mut desc = [0; DESCRIPTOR_SIZE];
        self.peek(&mut desc)?;
        Ok(PacketDescriptor::read_from_bytes(&desc).unwrap())
    }

    /// Reads and consumes the next packet.
    ///
    /// The full header (at least the descriptor) is copied into `header` if
    /// provided, and the data into `data`. If either buffer is too small the
    /// required sizes are returned in [`ReadError::BufferTooSmall`] and the
    /// packet is not consumed.
    ///
    /// The caller must serialize calls; the host only writes this ring.
    pub fn read_packet(
        &self,
        header: Option<&mut [u8]>,
        data: &mut [u8],
    ) -> Result<PacketRead, ReadError> {
        let descriptor = self.peek_descriptor()?;
        let header_len = descriptor.header_length8 as usize * 8;
        let total_len = descriptor.total_length8 as usize * 8;
        if header_len < DESCRIPTOR_SIZE || total_len < header_len {
            return Err(ReadError::Corrupt(Error::InvalidDescriptorLengths));
        }
        let data_len = total_len - header_len;

        let lengths = PacketRead {
            header_len,
            data_len,
        };
        if header.as_ref().is_some_and(|h| h.len() < header_len) || data.len() < data_len {
            return Err(ReadError::BufferTooSmall {
                header_len,
                data_len,
            });
        }

        let control = self.inner.control();
        let read_index = self
            .inner
            .validate(control.read_index().load(Ordering::Relaxed))?;
        let write_index = self
            .inner
            .validate(control.write_index().load(Ordering::Acquire))?;
        if self.inner.used(write_index, read_index) < (total_len + size_of::<Footer>()) as u32 {
            return Err(ReadError::NotReady);
        }

        // Read the header (or seek past it), the data, and seek past the
        // trailer.
        let mut off = read_index;
        if let Some(header) = header {
            self.inner
                .mem
                .read_at(off as usize, &mut header[..header_len]);
        }
        off = self.inner.add_pointer(off, header_len as u32);
        self.inner.mem.read_at(off as usize, &mut data[..data_len]);
        off = self.inner.add_pointer(off, data_len as u32);
        off = self.inner.add_pointer(off, size_of::<Footer>() as u32);

        // The data must be consumed before the host sees the space free.
        control.read_index().store(off, Ordering::SeqCst);
        Ok(lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_pair(len: usize) -> (OutgoingRing<FlatRingMem>, IncomingRing<FlatRingMem>) {
        let mem = FlatRingMem::new(len);
        let out_ring = OutgoingRing::new(mem.clone()).unwrap();
        let in_ring = IncomingRing::new(mem).unwrap();
        (out_ring, in_ring)
    }

    fn write_simple<M: RingMem>(ring: &OutgoingRing<M>, payload: &[u8]) -> Option<bool> {
        match ring.write(&OutgoingPacket {
            packet_type: 6,
            payload,
            response_required: false,
            transaction_id: 0,
        }) {
            Ok(signal) => Some(signal),
            Err(WriteError::Full(_)) => None,
            Err(err) => panic!("{err}"),
        }
    }

    fn read_simple<M: RingMem>(ring: &IncomingRing<M>) -> (PacketDescriptor, Vec<u8>) {
        let mut header = [0; DESCRIPTOR_SIZE];
        let mut data = vec![0; ring.inner.size as usize];
        let read = ring
            .read_packet(Some(&mut header), &mut data)
            .expect("packet expected");
        data.truncate(read.data_len);
        (PacketDescriptor::read_from_bytes(&header).unwrap(), data)
    }

    #[test]
    fn test_ring_roundtrip() {
        let (out_ring, in_ring) = ring_pair(16384);

        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        assert!(out_ring
            .write(&OutgoingPacket {
                packet_type: 7,
                payload: &payload,
                response_required: true,
                transaction_id: 0x42,
            })
            .unwrap());

        let (descriptor, data) = read_simple(&in_ring);
        assert_eq!(descriptor.packet_type, 7);
        assert_eq!(descriptor.flags, PACKET_FLAG_RESPONSE_REQUIRED);
        assert_eq!(descriptor.transaction_id, 0x42);
        // The payload comes back padded to 8 bytes.
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..9], &payload);
        assert_eq!(&data[9..], &[0; 7]);
    }

    #[test]
    fn test_backpressure_leaves_ring_unchanged() {
        let (out_ring, in_ring) = ring_pair(4096);

        // Each packet takes 16 + 1000 + 0 + 8 = 1024 bytes; three fit in the
        // 4096-byte ring alongside the 8 reserved bytes.
        let payload = [0xaau8; 1000];
        for _ in 0..3 {
            write_simple(&out_ring, &payload).unwrap();
        }
        let control = Control(out_ring.inner.mem.control());
        let write_index = control.write_index().load(Ordering::Relaxed);

        // The ring is now full; another write must fail without moving the
        // write index.
        assert!(write_simple(&out_ring, &payload).is_none());
        assert_eq!(control.write_index().load(Ordering::Relaxed), write_index);

        // Draining one packet frees space for exactly one more.
        read_simple(&in_ring);
        write_simple(&out_ring, &payload).unwrap();
        assert!(write_simple(&out_ring, &payload).is_none());
    }

    #[test]
    fn test_signal_on_empty_to_nonempty_only() {
        let (out_ring, in_ring) = ring_pair(16384);

        // First write signals, subsequent writes coalesce.
        assert!(write_simple(&out_ring, &[1]).unwrap());
        assert!(!write_simple(&out_ring, &[2]).unwrap());
        assert!(!write_simple(&out_ring, &[3]).unwrap());
        assert_eq!(
            Control(out_ring.inner.mem.control())
                .guest_to_host_interrupt_count()
                .load(Ordering::Relaxed),
            1
        );

        // Drain; the next write is another empty-to-non-empty transition.
        read_simple(&in_ring);
        read_simple(&in_ring);
        read_simple(&in_ring);
        assert!(write_simple(&out_ring, &[4]).unwrap());

        // A masked ring never signals.
        in_ring.set_interrupt_mask(true);
        read_simple(&in_ring);
        assert!(!write_simple(&out_ring, &[5]).unwrap());
    }

    #[test]
    fn test_wraparound() {
        // Data capacity 4096; place the write index near the end so a
        // 40-byte packet wraps.
        let (out_ring, in_ring) = ring_pair(4096);
        let control = Control(out_ring.inner.mem.control());
        control.write_index().store(4080, Ordering::Relaxed);
        control.read_index().store(4080, Ordering::Relaxed);

        // 16-byte descriptor + 24-byte payload = 40-byte packet.
        let payload: Vec<u8> = (0..24).collect();
        write_simple(&out_ring, &payload).unwrap();

        // The descriptor lands at 4080..4095, the payload wraps to 0..23,
        // the trailer follows at 24..31, and the published index is 32.
        assert_eq!(control.write_index().load(Ordering::Relaxed), 32);
        let mut trailer = [0; 8];
        out_ring.inner.mem.read_at(24, &mut trailer);
        assert_eq!(u64::from_le_bytes(trailer), 4080 << 32);

        let (descriptor, data) = read_simple(&in_ring);
        assert_eq!(descriptor.total_length8, 5);
        assert_eq!(data, payload);
        assert_eq!(control.read_index().load(Ordering::Relaxed), 32);
    }

    #[test]
    fn test_read_not_ready_and_too_small() {
        let (out_ring, in_ring) = ring_pair(4096);
        let mut data = [0; 64];
        assert_eq!(
            in_ring.read_packet(None, &mut data),
            Err(ReadError::NotReady)
        );

        write_simple(&out_ring, &[7; 32]).unwrap();
        let mut small = [0; 8];
        assert_eq!(
            in_ring.read_packet(None, &mut small),
            Err(ReadError::BufferTooSmall {
                header_len: 16,
                data_len: 32,
            })
        );
        let mut short_header = [0; 8];
        assert_eq!(
            in_ring.read_packet(Some(&mut short_header), &mut data),
            Err(ReadError::BufferTooSmall {
                header_len: 16,
                data_len: 32,
            })
        );

        // The failed reads consumed nothing.
        let read = in_ring.read_packet(None, &mut data).unwrap();
        assert_eq!(read.data_len, 32);
        assert_eq!(&data[..32], &[7; 32]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (out_ring, in_ring) = ring_pair(4096);
        write_simple(&out_ring, &[9; 8]).unwrap();

        let descriptor = in_ring.peek_descriptor().unwrap();
        assert_eq!(descriptor.total_length8, 3);
        let again = in_ring.peek_descriptor().unwrap();
        assert_eq!(descriptor, again);

        let mut data = [0; 8];
        in_ring.read_packet(None, &mut data).unwrap();
        assert_eq!(data, [9; 8]);
        assert_eq!(in_ring.peek_descriptor(), Err(ReadError::NotReady));
    }
}

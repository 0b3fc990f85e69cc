// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-channel ring device: the interface a device driver one level up
//! uses to move packets over an open channel.

use crate::channels::ChannelCallback;
use crate::platform::DmaBuffer;
use crate::Error;
use crate::VmbusDriver;
use hvdef::HV_PAGE_SIZE_USIZE;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PacketRead;
use vmbus_ring::ReadError;
use vmbus_ring::RingMem;
use vmbus_ring::WriteError;
use vmbus_ring::PAGE_SIZE;

/// Ring memory carved out of the channel's GPADL buffer.
#[derive(Clone)]
struct GpadlRingMem {
    buffer: Arc<dyn DmaBuffer>,
    control_offset: usize,
    data_offset: usize,
    data_len: usize,
}

impl GpadlRingMem {
    fn data(&self) -> &[AtomicU8] {
        &self.buffer.bytes()[self.data_offset..self.data_offset + self.data_len]
    }
}

impl RingMem for GpadlRingMem {
    fn control(&self) -> &[AtomicU8; PAGE_SIZE] {
        self.buffer.bytes()[self.control_offset..self.control_offset + PAGE_SIZE]
            .try_into()
            .unwrap()
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        use safeatomic::AtomicSliceOps;
        let ring = self.data();
        if data.len() > self.data_len - addr {
            let split = self.data_len - addr;
            let (first, last) = data.split_at_mut(split);
            ring[addr..].atomic_read(first);
            ring[..last.len()].atomic_read(last);
        } else {
            ring[addr..addr + data.len()].atomic_read(data);
        }
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        use safeatomic::AtomicSliceOps;
        let ring = self.data();
        if data.len() > self.data_len - addr {
            let split = self.data_len - addr;
            let (first, last) = data.split_at(split);
            ring[addr..].atomic_write(first);
            ring[..last.len()].atomic_write(last);
        } else {
            ring[addr..addr + data.len()].atomic_write(data);
        }
    }

    fn len(&self) -> usize {
        self.data_len
    }
}

struct OpenRings {
    gpadl_id: GpadlId,
    tx: Mutex<OutgoingRing<GpadlRingMem>>,
    rx: Mutex<IncomingRing<GpadlRingMem>>,
}

/// A device endpoint for one registered channel.
pub struct ChannelDevice {
    driver: Arc<VmbusDriver>,
    channel_id: ChannelId,
    rings: Mutex<Option<Arc<OpenRings>>>,
}

impl ChannelDevice {
    pub fn new(driver: Arc<VmbusDriver>, channel_id: ChannelId) -> Self {
        Self {
            driver,
            channel_id,
            rings: Mutex::new(None),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The protocol version negotiated by the bus.
    pub fn bus_version(&self) -> u32 {
        self.driver.get_version()
    }

    /// Opens the channel with a fresh ring pair. Both lengths must be
    /// positive multiples of the page size.
    ///
    /// The callback runs on a deferred-procedure queue whenever the host
    /// signals the channel; it may start firing before `open` returns, since
    /// some devices transmit as soon as the channel opens on their side.
    pub fn open(
        &self,
        tx_len: u32,
        rx_len: u32,
        callback: Option<ChannelCallback>,
    ) -> Result<(), Error> {
        if tx_len == 0
            || rx_len == 0
            || tx_len as usize % PAGE_SIZE != 0
            || rx_len as usize % PAGE_SIZE != 0
        {
            return Err(Error::BadArgument);
        }

        let mut rings = self.rings.lock();
        if rings.is_some() {
            return Err(Error::Busy);
        }

        let tx_total = HV_PAGE_SIZE_USIZE + tx_len as usize;
        let rx_total = HV_PAGE_SIZE_USIZE + rx_len as usize;

        tracing::debug!(
            channel_id = self.channel_id.0,
            tx_len,
            rx_len,
            "opening channel device"
        );

        // One GPADL backs both rings: TX control page and data first, then
        // the RX ring at the page offset passed to the host.
        let (buffer, gpadl_id) = self
            .driver
            .allocate_gpadl(self.channel_id, (tx_total + rx_total) as u32)?;

        let tx = OutgoingRing::new(GpadlRingMem {
            buffer: buffer.clone(),
            control_offset: 0,
            data_offset: HV_PAGE_SIZE_USIZE,
            data_len: tx_len as usize,
        })
        .map_err(|_| Error::BadArgument)?;
        let rx = IncomingRing::new(GpadlRingMem {
            buffer,
            control_offset: tx_total,
            data_offset: tx_total + HV_PAGE_SIZE_USIZE,
            data_len: rx_len as usize,
        })
        .map_err(|_| Error::BadArgument)?;

        // Bounce the caller's callback through the DPC queue so it runs off
        // the interrupt path.
        let callback = callback.map(|callback| {
            let dpc = self.driver.dpc();
            Arc::new(move || {
                let callback = callback.clone();
                dpc.queue(Box::new(move || callback()));
            }) as ChannelCallback
        });

        if let Err(err) =
            self.driver
                .open_channel(self.channel_id, gpadl_id, tx_total as u32, callback)
        {
            tracing::warn!(
                channel_id = self.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to open channel"
            );
            let _ = self.driver.free_gpadl(self.channel_id, gpadl_id);
            return Err(err);
        }

        *rings = Some(Arc::new(OpenRings {
            gpadl_id,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }));
        Ok(())
    }

    /// Closes the channel and releases the ring GPADL.
    pub fn close(&self) {
        let Some(rings) = self.rings.lock().take() else {
            return;
        };

        if let Err(err) = self.driver.close_channel(self.channel_id) {
            tracing::warn!(
                channel_id = self.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to close channel"
            );
        }
        if let Err(err) = self.driver.free_gpadl(self.channel_id, rings.gpadl_id) {
            tracing::warn!(
                channel_id = self.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to free ring gpadl"
            );
        }
    }

    fn open_rings(&self) -> Result<Arc<OpenRings>, Error> {
        self.rings.lock().clone().ok_or(Error::NotReady)
    }

    /// Writes a packet to the TX ring, signaling the host if the ring
    /// transitioned from empty to non-empty.
    pub fn write_packet(
        &self,
        packet_type: u16,
        payload: &[u8],
        response_required: bool,
        transaction_id: u64,
    ) -> Result<(), Error> {
        let rings = self.open_rings()?;
        let signal = {
            let tx = rings.tx.lock();
            tx.write(&OutgoingPacket {
                packet_type,
                payload,
                response_required,
                transaction_id,
            })
            .map_err(|err| match err {
                WriteError::Full(_) => Error::NotReady,
                WriteError::Corrupt(_) => Error::Io,
            })?
        };
        if signal {
            self.driver.signal_channel(self.channel_id)?;
        }
        Ok(())
    }

    /// Reads the leading bytes of the next RX packet without consuming it.
    pub fn peek_packet(&self, buf: &mut [u8]) -> Result<(), ReadError> {
        let rings = self.open_rings().map_err(|_| ReadError::NotReady)?;
        let rx = rings.rx.lock();
        rx.peek(buf)
    }

    /// Reads and consumes the next RX packet. Returns
    /// [`ReadError::BufferTooSmall`] with the required sizes when a caller
    /// buffer is too small, and [`ReadError::NotReady`] when no complete
    /// packet is available.
    pub fn read_packet(
        &self,
        header: Option<&mut [u8]>,
        data: &mut [u8],
    ) -> Result<PacketRead, ReadError> {
        let rings = self.open_rings().map_err(|_| ReadError::NotReady)?;
        let rx = rings.rx.lock();
        rx.read_packet(header, data)
    }
}

/// Maps ring packet errors into the bus error taxonomy. The required sizes
/// carried by [`ReadError::BufferTooSmall`] are dropped.
impl From<ReadError> for Error {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::NotReady => Error::NotReady,
            ReadError::BufferTooSmall { .. } => Error::NoMemory,
            ReadError::Corrupt(_) => Error::Io,
        }
    }
}

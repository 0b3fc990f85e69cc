// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side driver core for the Hyper-V Virtual Machine Bus (VMBus).
//!
//! The driver connects to the host over the SynIC, negotiates the newest
//! mutually supported protocol version, registers the channels the host
//! offers as child device nodes, and gives each registered channel a
//! ring-buffer transport backed by a GPADL. The surrounding kernel is
//! reached only through the service traits in [`platform`].

pub mod platform;

mod channels;
mod device;
mod gpadl;
mod hypercall;
mod request;
mod synic;

pub use channels::ChannelCallback;
pub use device::ChannelDevice;
pub use vmbus_core::protocol::ChannelId;
pub use vmbus_core::protocol::GpadlId;
pub use vmbus_ring::PacketDescriptor;
pub use vmbus_ring::PacketRead;
pub use vmbus_ring::ReadError;

use channels::Channel;
use channels::ChannelQueues;
use channels::ChannelTable;
use channels::LockedChannel;
use hvdef::HvMessage;
use hvdef::HvMessageType;
use hvdef::HV_PAGE_SHIFT;
use hvdef::HV_PAGE_SIZE;
use hvdef::HV_PAGE_SIZE_USIZE;
use hvdef::HV_X64_MSR_EOM;
use hypercall::HypercallInterface;
use parking_lot::Mutex;
use parking_lot::RwLock;
use platform::DeviceAttributes;
use platform::DmaAlloc;
use platform::DmaBuffer;
use platform::Dpc;
use platform::InterruptHandler;
use platform::Services;
use request::Request;
use safeatomic::AtomicSliceOps;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;
use synic::SynicPages;
use synic::SINT_MESSAGE;
use thiserror::Error as ThisError;
use vmbus_core::protocol;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::Version;
use vmbus_core::OutgoingMessage;

/// The hardware id of the VMBus device in ACPI.
const VMBUS_ACPI_HARDWARE_ID: &str = "VMBUS";

/// The bus error taxonomy. Hypercall transient failures are retried
/// internally; everything else surfaces to the caller of the bus or device
/// interface.
#[derive(Debug, ThisError, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bad argument")]
    BadArgument,
    #[error("out of memory")]
    NoMemory,
    #[error("not ready")]
    NotReady,
    #[error("i/o error")]
    Io,
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out")]
    TimedOut,
    #[error("channel not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("device busy")]
    Busy,
}

/// How the interrupt handler locates signaled channels. Legacy versions use
/// the bus-wide RX event flags page; newer versions use the per-CPU SynIC
/// event flags directly. Off while disconnected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum EventFlagsMode {
    Off = 0,
    Legacy = 1,
    Modern = 2,
}

/// The installed IRQ handler. Holds the driver weakly so teardown is not
/// kept alive by the interrupt controller.
#[derive(Default)]
struct IsrShim {
    driver: RwLock<Weak<VmbusDriver>>,
}

impl InterruptHandler for IsrShim {
    fn interrupt(&self) {
        if let Some(driver) = self.driver.read().upgrade() {
            driver.handle_interrupt();
        }
    }
}

/// The VMBus bus driver singleton.
pub struct VmbusDriver {
    services: Services,
    hypercall: HypercallInterface,
    synic: SynicPages,
    /// The bus-wide RX/TX event flags page followed by the two monitor
    /// pages. The monitor pages are unused content, reserved for the host.
    bus_pages: Arc<dyn DmaBuffer>,
    irq: u8,

    version: AtomicU32,
    connection_id: AtomicU32,
    connected: AtomicBool,
    event_mode: AtomicU8,
    max_channels: AtomicUsize,

    table: ChannelTable,
    requests: Mutex<Vec<Arc<Request>>>,
    next_gpadl_handle: AtomicU32,
    queues: Arc<ChannelQueues>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for VmbusDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmbusDriver").finish_non_exhaustive()
    }
}

impl VmbusDriver {
    /// Brings up the bus: enables hypercalls, programs the SynIC on every
    /// CPU, installs the VMBus interrupt found in ACPI, negotiates the
    /// protocol version, and registers the initial channel offers.
    pub fn new(services: Services) -> Result<Arc<Self>, Error> {
        hypercall::detect_hyperv(services.arch.as_ref())?;

        let hypercall = HypercallInterface::new(&services)?;
        let cpu_count = services.cpus.cpu_count();
        let synic = SynicPages::new(&services.memory, cpu_count)?;
        let bus_pages = services
            .memory
            .allocate("vmbus", 3 * HV_PAGE_SIZE_USIZE, false)
            .map_err(|_| Error::NoMemory)?;

        // Gen1 guests present two IRQs; one suffices, so take the first.
        let irqs = services
            .acpi
            .device_irqs(VMBUS_ACPI_HARDWARE_ID)
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "could not locate VMBus in ACPI"
                );
                Error::NotFound
            })?;
        let &irq = irqs.first().ok_or(Error::Io)?;

        let isr = Arc::new(IsrShim::default());
        let vector = services
            .interrupts
            .install(irq, isr.clone())
            .map_err(|_| Error::Io)?;
        tracing::debug!(irq, vector, "vmbus interrupt installed");

        let driver = Arc::new(Self {
            hypercall,
            synic,
            bus_pages,
            irq,
            version: AtomicU32::new(0),
            connection_id: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            event_mode: AtomicU8::new(EventFlagsMode::Off as u8),
            max_channels: AtomicUsize::new(0),
            table: ChannelTable::new(protocol::MAX_CHANNELS),
            requests: Mutex::new(Vec::new()),
            next_gpadl_handle: AtomicU32::new(1),
            queues: Arc::new(ChannelQueues::new()),
            worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            services,
        });
        *isr.driver.write() = Arc::downgrade(&driver);

        // Each CPU has its own SynIC MSRs; program them all.
        {
            let driver = &driver;
            driver.services.cpus.for_each_cpu(&move |cpu| {
                synic::enable_cpu(driver.services.arch.as_ref(), &driver.synic, cpu, vector)
            });
        }

        driver.connect()?;
        driver.request_channels()?;
        Ok(driver)
    }

    /// The negotiated protocol version, as `major << 16 | minor`.
    pub fn get_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// The connection id the host assigned at connect time.
    pub fn connection_id(&self) -> u32 {
        self.connection_id.load(Ordering::Acquire)
    }

    /// The size of the channel id space for the negotiated version.
    pub fn max_channels(&self) -> usize {
        self.max_channels.load(Ordering::Acquire)
    }

    fn event_flags_mode(&self) -> EventFlagsMode {
        match self.event_mode.load(Ordering::Acquire) {
            1 => EventFlagsMode::Legacy,
            2 => EventFlagsMode::Modern,
            _ => EventFlagsMode::Off,
        }
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn memory(&self) -> &Arc<dyn DmaAlloc> {
        &self.services.memory
    }

    pub(crate) fn dpc(&self) -> Arc<dyn Dpc> {
        self.services.dpc.clone()
    }

    fn rx_event_flag_words(&self) -> &[AtomicU32] {
        self.bus_pages.bytes()[..hvdef::HV_EVENT_FLAGS_SIZE]
            .as_atomic_slice()
            .unwrap()
    }

    fn tx_event_flag_words(&self) -> &[AtomicU32] {
        let offset = HV_PAGE_SIZE_USIZE / 2;
        self.bus_pages.bytes()[offset..offset + hvdef::HV_EVENT_FLAGS_SIZE]
            .as_atomic_slice()
            .unwrap()
    }

    fn next_gpadl_handle(&self) -> GpadlId {
        // Handle 0 is reserved.
        loop {
            let handle = self.next_gpadl_handle.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return GpadlId(handle);
            }
        }
    }

    pub(crate) fn get_channel(&self, channel_id: ChannelId) -> Result<LockedChannel, Error> {
        self.table.get(channel_id, self.max_channels())
    }

    // Request plumbing.

    /// Adds the request to the outstanding list (when it expects a reply)
    /// and posts it, without waiting for the response.
    pub(crate) fn post_request(&self, request: &Arc<Request>) -> Result<(), Error> {
        if request.expects_response() {
            self.requests.lock().push(request.clone());
        }
        match self.hypercall.post_message_with_retry(request.input_gpa()) {
            Ok(()) => Ok(()),
            Err(err) => {
                if request.expects_response() {
                    self.cancel_request(request);
                }
                Err(err)
            }
        }
    }

    /// Waits for a posted request's response.
    pub(crate) fn wait_request(&self, request: &Arc<Request>) -> Result<(), Error> {
        match request.wait() {
            Ok(()) => Ok(()),
            Err(err) => {
                if err == Error::TimedOut {
                    tracing::warn!(
                        response_type = ?request.response_type(),
                        "timed out waiting for response"
                    );
                }
                self.cancel_request(request);
                Err(err)
            }
        }
    }

    pub(crate) fn send_request(&self, request: &Arc<Request>) -> Result<(), Error> {
        self.post_request(request)?;
        self.wait_request(request)
    }

    pub(crate) fn cancel_request(&self, request: &Arc<Request>) {
        self.requests
            .lock()
            .retain(|other| !Arc::ptr_eq(other, request));
    }

    // Connection bring-up.

    fn connect_version(&self, version: Version) -> Result<u32, Error> {
        let gpa = self.bus_pages.gpa();
        let message = protocol::InitiateContact {
            version_requested: version as u32,
            target_message_vp: 0,
            interrupt_page: gpa,
            parent_to_child_monitor_page_gpa: gpa + HV_PAGE_SIZE,
            child_to_parent_monitor_page_gpa: gpa + 2 * HV_PAGE_SIZE,
        };
        let request = Request::new(
            self.memory(),
            ChannelId(0),
            &OutgoingMessage::new(&message),
            MessageType::VERSION_RESPONSE,
            0,
        )?;

        tracing::debug!(
            major = version.major(),
            minor = version.minor(),
            "connecting to vmbus"
        );
        self.send_request(&request)?;

        let response: protocol::VersionResponse = request.response();
        if response.version_supported == 0 {
            return Err(Error::NotSupported);
        }
        Ok(response.selected_version_or_connection_id)
    }

    /// Negotiates the protocol version, newest first. The first version the
    /// host accepts is adopted.
    fn connect(&self) -> Result<(), Error> {
        let mut result = Err(Error::NotSupported);
        for &version in protocol::SUPPORTED_VERSIONS {
            match self.connect_version(version) {
                Ok(connection_id) => {
                    self.version.store(version as u32, Ordering::Release);
                    self.connection_id.store(connection_id, Ordering::Release);

                    let (max, mode) = if version.is_legacy() {
                        (protocol::MAX_CHANNELS_LEGACY, EventFlagsMode::Legacy)
                    } else {
                        (protocol::MAX_CHANNELS, EventFlagsMode::Modern)
                    };
                    self.max_channels.store(max, Ordering::Release);
                    self.event_mode.store(mode as u8, Ordering::Release);
                    self.connected.store(true, Ordering::Release);

                    tracing::info!(
                        major = version.major(),
                        minor = version.minor(),
                        connection_id,
                        "connected to vmbus"
                    );
                    return Ok(());
                }
                Err(err) => result = Err(err),
            }
        }
        tracing::error!("no mutually supported vmbus version");
        result
    }

    /// Asks the host for its channel offers. Offers delivered before the
    /// done message register synchronously; later offers and rescinds drain
    /// on the lifecycle worker this spawns.
    fn request_channels(self: &Arc<Self>) -> Result<(), Error> {
        let request = Request::new(
            self.memory(),
            ChannelId(0),
            &OutgoingMessage::new(&protocol::RequestOffers {}),
            MessageType::ALL_OFFERS_DELIVERED,
            0,
        )?;
        self.send_request(&request)?;

        while let Some(channel) = self.queues.pop_offer() {
            let channel_id = channel.channel_id;
            if let Err(err) = self.register_channel(&channel) {
                tracing::error!(
                    channel_id = channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to register channel"
                );
                return Err(err);
            }
        }

        let weak = Arc::downgrade(self);
        let queues = self.queues.clone();
        let worker = thread::Builder::new()
            .name("vmbus channel queue".into())
            .spawn(move || Self::lifecycle_worker(weak, queues))
            .map_err(|_| Error::NoMemory)?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// One offer and one rescind drain per semaphore unit, offers first.
    fn lifecycle_worker(weak: Weak<VmbusDriver>, queues: Arc<ChannelQueues>) {
        while queues.sem.acquire() {
            let Some(driver) = weak.upgrade() else {
                break;
            };

            if let Some(channel) = queues.pop_offer() {
                let channel_id = channel.channel_id;
                if let Err(err) = driver.register_channel(&channel) {
                    tracing::error!(
                        channel_id = channel_id.0,
                        error = &err as &dyn std::error::Error,
                        "failed to register channel"
                    );
                }
            }

            if let Some(channel) = queues.pop_rescind() {
                driver.unregister_channel(channel);
            }
        }
        tracing::debug!("exiting channel queue worker");
    }

    /// Stores the channel in the table and publishes its device node.
    fn register_channel(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        tracing::info!(
            channel_id = channel.channel_id.0,
            interface_id = %channel.interface_id,
            instance_id = %channel.instance_id,
            "registering channel"
        );

        let attributes = DeviceAttributes {
            bus: "hyperv",
            pretty_name: format!("Hyper-V Channel {}", channel.channel_id.0),
            channel_id: channel.channel_id.0,
            device_type: channel.interface_id.to_string(),
            instance_id: channel.instance_id.to_string(),
        };

        self.table.lock().insert(channel.clone());

        let node = self
            .services
            .registrar
            .register(&attributes)
            .map_err(|_| Error::Io)?;
        *channel.node.lock() = Some(node);
        Ok(())
    }

    /// Tears down a channel whose table slot has already been cleared:
    /// unpublishes the node, waits out in-flight users, releases the
    /// channel, and tells the host the id is free.
    fn unregister_channel(&self, channel: Arc<Channel>) {
        let channel_id = channel.channel_id;
        tracing::info!(channel_id = channel_id.0, "unregistering channel");

        if let Some(node) = channel.node.lock().take() {
            self.services.registrar.unregister(node);
        }

        self.table.quiesce(&channel);
        drop(channel);

        let message = protocol::RelIdReleased { channel_id };
        let released = Request::new(
            self.memory(),
            ChannelId(0),
            &OutgoingMessage::new(&message),
            MessageType::INVALID,
            0,
        )
        .and_then(|request| self.post_request(&request));
        if let Err(err) = released {
            tracing::warn!(
                channel_id = channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to release channel id"
            );
        }
    }

    /// Stops signaling dispatch, unregisters every surviving channel, and
    /// unloads from the host. With `wait`, blocks for the host's unload
    /// completion.
    fn disconnect(&self, wait: bool) -> Result<(), Error> {
        if !self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        self.event_mode
            .store(EventFlagsMode::Off as u8, Ordering::Release);

        for id in 1..self.max_channels() as u32 {
            let channel = self.table.lock().take(ChannelId(id));
            if let Some(channel) = channel {
                self.unregister_channel(channel);
            }
        }

        let request = Request::new(
            self.memory(),
            ChannelId(0),
            &OutgoingMessage::new(&protocol::Unload {}),
            if wait {
                MessageType::UNLOAD_COMPLETE
            } else {
                MessageType::INVALID
            },
            0,
        )?;
        self.send_request(&request)?;

        self.connected.store(false, Ordering::Release);
        tracing::info!("disconnected from vmbus");
        Ok(())
    }

    /// Disconnects from the host and tears down the SynIC and interrupt
    /// state. The driver is unusable afterwards; dropping it without
    /// calling this performs the same teardown without waiting for the
    /// host's unload response.
    pub fn shutdown(&self) {
        self.stop_worker();
        self.teardown(true);
    }

    fn stop_worker(&self) {
        self.queues.sem.close();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    fn teardown(&self, wait_for_unload: bool) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.disconnect(wait_for_unload) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "vmbus disconnect failed"
            );
        }

        self.services
            .cpus
            .for_each_cpu(&|_cpu| synic::disable_cpu(self.services.arch.as_ref()));
        self.services.interrupts.remove(self.irq);
    }

    // The interrupt path.

    /// The per-CPU interrupt entry: scan event flags, then hand any pending
    /// management message to the deferred worker.
    fn handle_interrupt(self: &Arc<Self>) {
        let cpu = self.services.cpus.current_cpu();

        match self.event_flags_mode() {
            EventFlagsMode::Modern => {
                self.scan_event_flags(self.synic.event_flag_words(cpu, SINT_MESSAGE))
            }
            EventFlagsMode::Legacy => self.scan_event_flags_legacy(cpu),
            EventFlagsMode::Off => {}
        }

        if self.synic.message_type(cpu, SINT_MESSAGE) != HvMessageType::NONE {
            let weak = Arc::downgrade(self);
            self.services.dpc.queue(Box::new(move || {
                if let Some(driver) = weak.upgrade() {
                    driver.process_pending_message(cpu);
                }
            }));
        }
    }

    /// Scans event flag words, consuming each word as it goes, and invokes
    /// the callback of every signaled channel. Flag 0 is reserved; channel
    /// ids start at 1.
    fn scan_event_flags(&self, words: &[AtomicU32]) {
        let slots = self.table.lock();
        let mut flags = words[0].swap(0, Ordering::SeqCst) >> 1;
        for id in 1..=slots.highest_channel_id() {
            if id % 32 == 0 {
                flags = words[(id / 32) as usize].swap(0, Ordering::SeqCst);
            }
            if flags & 1 != 0 {
                if let Some(channel) = slots.get(ChannelId(id)) {
                    let callback = channel.callback.lock().clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
            flags >>= 1;
        }
    }

    /// Pre-Win8 hosts set a single SynIC flag and publish the per-channel
    /// bits in the bus-wide RX event flags page.
    fn scan_event_flags_legacy(&self, cpu: usize) {
        if self.synic.event_flag_words(cpu, SINT_MESSAGE)[0].swap(0, Ordering::SeqCst) == 0 {
            return;
        }
        self.scan_event_flags(self.rx_event_flag_words());
    }

    /// The deferred message worker: validates and dispatches the single
    /// SynIC message slot for `cpu`, then acknowledges it.
    fn process_pending_message(&self, cpu: usize) {
        let message = self.synic.read_message(cpu, SINT_MESSAGE);
        if message.header.typ != protocol::VMBUS_MESSAGE_TYPE
            || (message.header.len as usize) < protocol::HEADER_SIZE
        {
            if message.header.typ != HvMessageType::NONE {
                tracing::error!(
                    typ = ?message.header.typ,
                    len = message.header.len,
                    "invalid hyper-v message"
                );
            }
            self.send_end_of_message(cpu, &message);
            return;
        }

        match Message::parse(message.payload()) {
            Ok(parsed) => self.handle_message(parsed, message.payload()),
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "invalid vmbus message"
                );
            }
        }

        self.send_end_of_message(cpu, &message);
    }

    fn handle_message(&self, message: Message<'_>, raw: &[u8]) {
        match message {
            Message::OfferChannel(offer, _) => self.handle_offer(&offer),
            Message::RescindChannelOffer(rescind, _) => self.handle_rescind(&rescind),
            Message::OpenResult(result, _) => {
                self.complete_request(
                    MessageType::OPEN_CHANNEL_RESULT,
                    Some(result.channel_id),
                    0,
                    raw,
                );
            }
            Message::GpadlCreated(created, _) => {
                self.complete_request(
                    MessageType::GPADL_CREATED,
                    Some(created.channel_id),
                    created.gpadl_id.0,
                    raw,
                );
            }
            // The torndown response carries no channel id; match on the
            // GPADL id alone.
            Message::GpadlTorndown(torndown, _) => {
                self.complete_request(MessageType::GPADL_TORNDOWN, None, torndown.gpadl_id.0, raw);
            }
            Message::VersionResponse(..) => {
                self.complete_request(MessageType::VERSION_RESPONSE, Some(ChannelId(0)), 0, raw);
            }
            Message::UnloadComplete(..) => {
                self.complete_request(MessageType::UNLOAD_COMPLETE, Some(ChannelId(0)), 0, raw);
            }
            Message::AllOffersDelivered(..) => {
                self.complete_request(MessageType::ALL_OFFERS_DELIVERED, Some(ChannelId(0)), 0, raw);
            }
            message => {
                tracing::warn!(?message, "unexpected vmbus message");
            }
        }
    }

    fn handle_offer(&self, offer: &protocol::OfferChannel) {
        let channel_id = offer.channel_id;
        if channel_id.0 == 0 || channel_id.0 as usize >= self.max_channels() {
            tracing::warn!(channel_id = channel_id.0, "offer for invalid channel id");
            return;
        }

        tracing::info!(
            channel_id = channel_id.0,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            subchannel_index = offer.subchannel_index,
            "received offer"
        );

        // The signaling fields are only present on post-2008 versions;
        // older hosts share the bus-wide events connection.
        let (dedicated_interrupt, connection_id) = if self.get_version() > Version::V1 as u32 {
            (offer.is_dedicated & 1 != 0, offer.connection_id)
        } else {
            (false, protocol::EVENT_CONNECTION_ID)
        };

        self.queues.push_offer(Channel::new(
            channel_id,
            offer.interface_id,
            offer.instance_id,
            dedicated_interrupt,
            connection_id,
        ));
    }

    fn handle_rescind(&self, rescind: &protocol::RescindChannelOffer) {
        let channel_id = rescind.channel_id;
        if channel_id.0 == 0 || channel_id.0 as usize >= self.max_channels() {
            tracing::warn!(channel_id = channel_id.0, "rescind for invalid channel id");
            return;
        }

        tracing::info!(channel_id = channel_id.0, "received rescind");

        // Clear the slot first; no new callback or request can target the
        // channel after this store.
        let channel = self.table.lock().take(channel_id);

        // Cancel every request still waiting on this channel.
        let cancelled: Vec<_> = {
            let mut requests = self.requests.lock();
            let mut cancelled = Vec::new();
            requests.retain(|request| {
                if request.channel_id() == channel_id {
                    cancelled.push(request.clone());
                    false
                } else {
                    true
                }
            });
            cancelled
        };
        for request in cancelled {
            request.notify(Err(Error::Cancelled), None);
        }

        if let Some(channel) = channel {
            self.queues.push_rescind(channel);
        }
    }

    /// Completes the outstanding request matching the response key, copying
    /// the reply into its message buffer. Unmatched responses are dropped.
    fn complete_request(
        &self,
        response_type: MessageType,
        channel_id: Option<ChannelId>,
        response_data: u32,
        response: &[u8],
    ) {
        let request = {
            let mut requests = self.requests.lock();
            requests
                .iter()
                .position(|request| {
                    request.response_type() == response_type
                        && channel_id.is_none_or(|id| request.channel_id() == id)
                        && request.response_data() == response_data
                })
                .map(|index| requests.remove(index))
        };

        match request {
            Some(request) => request.notify(Ok(()), Some(response)),
            None => {
                tracing::debug!(?response_type, response_data, "dropped unmatched response");
            }
        }
    }

    /// Releases the message slot and acknowledges it on the CPU it arrived
    /// on. A pending flag means the hypervisor has another message queued
    /// behind this slot, which needs its own acknowledgement there.
    fn send_end_of_message(&self, cpu: usize, message: &HvMessage) {
        self.synic.clear_message(cpu, SINT_MESSAGE);
        std::sync::atomic::fence(Ordering::SeqCst);

        if self.services.cpus.current_cpu() == cpu {
            self.services.arch.write_msr(HV_X64_MSR_EOM, 0);
        } else {
            self.dispatch_eom(cpu);
        }

        if message.header.flags.message_pending() {
            self.dispatch_eom(cpu);
        }
    }

    fn dispatch_eom(&self, cpu: usize) {
        let arch = self.services.arch.clone();
        self.services.cpus.run_on_cpu(
            cpu,
            Box::new(move || arch.write_msr(HV_X64_MSR_EOM, 0)),
        );
    }

    // The bus interface consumed by child device drivers.

    /// Opens a channel whose ring pair lives in `gpadl_id`, with the RX ring
    /// starting `rx_offset` bytes in. The callback is installed before the
    /// open message is posted, since some devices begin transmitting before
    /// the host's response is parsed.
    pub fn open_channel(
        &self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        rx_offset: u32,
        callback: Option<ChannelCallback>,
    ) -> Result<(), Error> {
        let channel = self.get_channel(channel_id)?;

        let message = protocol::OpenChannel {
            channel_id,
            open_id: channel_id.0,
            ring_buffer_gpadl_id: gpadl_id,
            target_vp: 0,
            downstream_ring_buffer_page_offset: rx_offset >> HV_PAGE_SHIFT,
            user_data: UserDefinedData::default(),
        };
        let request = Request::new(
            self.memory(),
            channel_id,
            &OutgoingMessage::new(&message),
            MessageType::OPEN_CHANNEL_RESULT,
            0,
        )?;

        *channel.callback.lock() = callback;

        tracing::info!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            rx_offset,
            "opening channel"
        );
        let result = self.send_request(&request).and_then(|()| {
            let response: protocol::OpenResult = request.response();
            if response.status == 0 && response.open_id == channel_id.0 {
                Ok(())
            } else {
                tracing::warn!(
                    channel_id = channel_id.0,
                    status = response.status,
                    open_id = response.open_id,
                    "host failed to open channel"
                );
                Err(Error::Io)
            }
        });

        if result.is_err() {
            *channel.callback.lock() = None;
        }
        result
    }

    /// Closes an open channel and clears its callback.
    pub fn close_channel(&self, channel_id: ChannelId) -> Result<(), Error> {
        let channel = self.get_channel(channel_id)?;

        let message = protocol::CloseChannel { channel_id };
        let request = Request::new(
            self.memory(),
            channel_id,
            &OutgoingMessage::new(&message),
            MessageType::INVALID,
            0,
        )?;

        tracing::info!(channel_id = channel_id.0, "closing channel");
        self.post_request(&request)?;

        *channel.callback.lock() = None;
        Ok(())
    }

    /// Kicks the host consumer of a channel. Channels without a dedicated
    /// interrupt also set their bit in the bus-wide TX event flags.
    pub fn signal_channel(&self, channel_id: ChannelId) -> Result<(), Error> {
        if channel_id.0 == 0 || channel_id.0 as usize >= self.max_channels() {
            return Err(Error::BadArgument);
        }

        let (dedicated_interrupt, connection_id) = {
            let slots = self.table.lock();
            let channel = slots.get(channel_id).ok_or(Error::BadArgument)?;
            (channel.dedicated_interrupt, channel.connection_id)
        };

        if !dedicated_interrupt {
            self.tx_event_flag_words()[(channel_id.0 / 32) as usize]
                .fetch_or(1 << (channel_id.0 & 0x1f), Ordering::SeqCst);
        }

        let status = self.hypercall.signal_event(connection_id);
        if status.is_err() {
            tracing::debug!(?status, "signal event hypercall failed");
            return Err(Error::Io);
        }
        Ok(())
    }
}

impl Drop for VmbusDriver {
    fn drop(&mut self) {
        self.stop_worker();
        // Replies can no longer be observed once the last reference is
        // gone, so the unload is posted without waiting.
        self.teardown(false);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hypercall surface: hypervisor detection, hypercall page management,
//! and the post-message and signal-event calls.

use crate::platform::DmaBuffer;
use crate::platform::HvArch;
use crate::platform::Services;
use crate::Error;
use hvdef::hypercall::Control;
use hvdef::hypercall::HypercallCode;
use hvdef::HvGuestOsId;
use hvdef::HvHypercallRegister;
use hvdef::HvStatus;
use hvdef::HV_CPUID_FEATURE_HYPERVISOR_PRESENT;
use hvdef::HV_CPUID_INTERFACE_ID;
use hvdef::HV_CPUID_LEAF_FEATURES;
use hvdef::HV_CPUID_LEAF_IMP_LIMITS;
use hvdef::HV_CPUID_LEAF_INTERFACE;
use hvdef::HV_CPUID_LEAF_VENDOR_AND_MAX;
use hvdef::HV_PAGE_SIZE_USIZE;
use hvdef::HV_X64_MSR_GUEST_OS_ID;
use hvdef::HV_X64_MSR_HYPERCALL;
use std::sync::Arc;
use std::time::Duration;

/// The number of times a transiently failing hypercall is retried before the
/// operation fails.
pub const HYPERCALL_MAX_RETRIES: u32 = 20;
/// The back-off between hypercall retries.
pub const HYPERCALL_RETRY_DELAY: Duration = Duration::from_micros(20);

/// Checks that the platform is Hyper-V by CPUID.
pub fn detect_hyperv(arch: &dyn HvArch) -> Result<(), Error> {
    let features = arch.cpuid(HV_CPUID_LEAF_FEATURES);
    if features.ecx & HV_CPUID_FEATURE_HYPERVISOR_PRESENT == 0 {
        tracing::debug!("no hypervisor detected");
        return Err(Error::NotSupported);
    }

    let max_leaf = arch.cpuid(HV_CPUID_LEAF_VENDOR_AND_MAX);
    if max_leaf.eax < HV_CPUID_LEAF_IMP_LIMITS {
        tracing::debug!(max_leaf = max_leaf.eax, "missing Hyper-V CPUID leaves");
        return Err(Error::NotSupported);
    }

    let interface = arch.cpuid(HV_CPUID_LEAF_INTERFACE);
    if interface.eax != HV_CPUID_INTERFACE_ID {
        tracing::debug!(signature = interface.eax, "not a Hyper-V interface");
        return Err(Error::NotSupported);
    }

    Ok(())
}

/// The identity written to the guest OS id MSR, using the TLFS open-source
/// vendor convention.
fn guest_os_id() -> HvGuestOsId {
    HvGuestOsId::new()
        .with_open_source(true)
        .with_os_id(1)
        .with_version(1)
}

/// The enabled hypercall code page and the calls made through it.
pub struct HypercallInterface {
    arch: Arc<dyn HvArch>,
    // Held for the lifetime of the interface; the hypervisor backs this page
    // with the call stub once the hypercall MSR is enabled.
    _page: Arc<dyn DmaBuffer>,
    enabled: bool,
}

impl HypercallInterface {
    /// Allocates the executable code page and enables hypercalls.
    ///
    /// The guest OS id must be set before the hypercall MSR; the enable bit
    /// is read back to confirm the hypervisor accepted it.
    pub fn new(services: &Services) -> Result<Self, Error> {
        let page = services
            .memory
            .allocate("hypercall", HV_PAGE_SIZE_USIZE, true)
            .map_err(|_| Error::NoMemory)?;
        let arch = services.arch.clone();

        arch.write_msr(HV_X64_MSR_GUEST_OS_ID, guest_os_id().into());

        let msr = HvHypercallRegister::from(arch.read_msr(HV_X64_MSR_HYPERCALL))
            .with_gpn(page.pfn())
            .with_enable(true);
        arch.write_msr(HV_X64_MSR_HYPERCALL, msr.into());

        let readback = HvHypercallRegister::from(arch.read_msr(HV_X64_MSR_HYPERCALL));
        if !readback.enable() {
            tracing::error!("hypervisor rejected the hypercall page");
            return Err(Error::Io);
        }

        tracing::debug!(gpa = page.gpa(), "hypercalls enabled");
        Ok(Self {
            arch,
            _page: page,
            enabled: true,
        })
    }

    /// Posts a management message; `input_gpa` is the physical address of a
    /// [`hvdef::hypercall::PostMessage`] input page.
    pub fn post_message(&self, input_gpa: u64) -> HvStatus {
        let control = Control::new().with_code(HypercallCode::HV_CALL_POST_MESSAGE.0);
        HvStatus(self.arch.hypercall(control.into(), input_gpa) as u16)
    }

    /// Posts a management message, retrying while the hypervisor is out of
    /// message buffers.
    pub fn post_message_with_retry(&self, input_gpa: u64) -> Result<(), Error> {
        let mut status = HvStatus::SUCCESS;
        for _ in 0..HYPERCALL_MAX_RETRIES {
            status = self.post_message(input_gpa);
            if !status.is_transient() {
                break;
            }
            std::thread::sleep(HYPERCALL_RETRY_DELAY);
        }

        if status.is_ok() {
            Ok(())
        } else {
            tracing::debug!(?status, "post message hypercall failed");
            if status.is_transient() {
                Err(Error::NoMemory)
            } else {
                Err(Error::Io)
            }
        }
    }

    /// Signals the host consumer of a channel via its connection id. This is
    /// a fast (register-only) hypercall.
    pub fn signal_event(&self, connection_id: u32) -> HvStatus {
        let control = Control::new()
            .with_code(HypercallCode::HV_CALL_SIGNAL_EVENT.0)
            .with_fast(true);
        HvStatus(self.arch.hypercall(control.into(), connection_id as u64) as u16)
    }

    /// Disables the hypercall page.
    pub fn disable(&mut self) {
        if self.enabled {
            let msr = HvHypercallRegister::from(self.arch.read_msr(HV_X64_MSR_HYPERCALL))
                .with_gpn(0)
                .with_enable(false);
            self.arch.write_msr(HV_X64_MSR_HYPERCALL, msr.into());
            self.enabled = false;
        }
    }
}

impl Drop for HypercallInterface {
    fn drop(&mut self) {
        self.disable();
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-CPU SynIC state: the message and event-flag pages and the MSR
//! programming that points the hypervisor at them.

use crate::platform::DmaAlloc;
use crate::platform::DmaBuffer;
use crate::platform::HvArch;
use crate::Error;
use hvdef::HvMessage;
use hvdef::HvMessageType;
use hvdef::HvSynicScontrol;
use hvdef::HvSynicSimpSiefp;
use hvdef::HvSynicSint;
use hvdef::HV_MESSAGE_SIZE;
use hvdef::HV_PAGE_SIZE_USIZE;
use hvdef::HV_X64_MSR_SCONTROL;
use hvdef::HV_X64_MSR_SIEFP;
use hvdef::HV_X64_MSR_SIMP;
use hvdef::HV_X64_MSR_SINT0;
use safeatomic::AtomicSliceOps;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

/// The SynIC interrupt source VMBus management messages arrive on.
pub const SINT_MESSAGE: u8 = 2;
/// The SynIC interrupt source for VMBus timers. Configured but not consumed
/// by this driver.
pub const SINT_TIMER: u8 = 4;

/// The per-CPU SynIC pages: one message page and one event-flags page per
/// CPU, allocated as two contiguous runs.
pub struct SynicPages {
    message_pages: Arc<dyn DmaBuffer>,
    event_flags_pages: Arc<dyn DmaBuffer>,
}

impl SynicPages {
    pub fn new(memory: &Arc<dyn DmaAlloc>, cpu_count: usize) -> Result<Self, Error> {
        let message_pages = memory
            .allocate("hv msg", cpu_count * HV_PAGE_SIZE_USIZE, false)
            .map_err(|_| Error::NoMemory)?;
        let event_flags_pages = memory
            .allocate("hv eventflags", cpu_count * HV_PAGE_SIZE_USIZE, false)
            .map_err(|_| Error::NoMemory)?;
        Ok(Self {
            message_pages,
            event_flags_pages,
        })
    }

    pub fn message_page_gpa(&self, cpu: usize) -> u64 {
        self.message_pages.gpa() + (cpu * HV_PAGE_SIZE_USIZE) as u64
    }

    pub fn event_flags_page_gpa(&self, cpu: usize) -> u64 {
        self.event_flags_pages.gpa() + (cpu * HV_PAGE_SIZE_USIZE) as u64
    }

    fn message_slot(&self, cpu: usize, sint: u8) -> &[AtomicU8] {
        let offset = cpu * HV_PAGE_SIZE_USIZE + sint as usize * HV_MESSAGE_SIZE;
        &self.message_pages.bytes()[offset..offset + HV_MESSAGE_SIZE]
    }

    /// Snapshots the message slot for a CPU and SINT.
    pub fn read_message(&self, cpu: usize, sint: u8) -> HvMessage {
        self.message_slot(cpu, sint).atomic_read_obj()
    }

    /// Reads just the type discriminator of a message slot.
    pub fn message_type(&self, cpu: usize, sint: u8) -> HvMessageType {
        HvMessageType(
            self.message_slot(cpu, sint)[..4]
                .as_atomic::<AtomicU32>()
                .unwrap()
                .load(std::sync::atomic::Ordering::Acquire),
        )
    }

    /// Releases the message slot back to the hypervisor by storing the none
    /// type.
    pub fn clear_message(&self, cpu: usize, sint: u8) {
        self.message_slot(cpu, sint)[..4]
            .as_atomic::<AtomicU32>()
            .unwrap()
            .store(HvMessageType::NONE.0, std::sync::atomic::Ordering::Release);
    }

    /// The event flag words for a CPU and SINT.
    pub fn event_flag_words(&self, cpu: usize, sint: u8) -> &[AtomicU32] {
        let offset = cpu * HV_PAGE_SIZE_USIZE + sint as usize * hvdef::HV_EVENT_FLAGS_SIZE;
        self.event_flags_pages.bytes()[offset..offset + hvdef::HV_EVENT_FLAGS_SIZE]
            .as_atomic_slice()
            .unwrap()
    }
}

/// Programs the calling CPU's SynIC MSRs: message page, event-flags page,
/// the message and timer interrupt sources, and finally the enable bit.
pub fn enable_cpu(arch: &dyn HvArch, pages: &SynicPages, cpu: usize, vector: u8) {
    let simp = HvSynicSimpSiefp::from(arch.read_msr(HV_X64_MSR_SIMP))
        .with_base_gpn(pages.message_page_gpa(cpu) >> hvdef::HV_PAGE_SHIFT)
        .with_enabled(true);
    arch.write_msr(HV_X64_MSR_SIMP, simp.into());

    let siefp = HvSynicSimpSiefp::from(arch.read_msr(HV_X64_MSR_SIEFP))
        .with_base_gpn(pages.event_flags_page_gpa(cpu) >> hvdef::HV_PAGE_SHIFT)
        .with_enabled(true);
    arch.write_msr(HV_X64_MSR_SIEFP, siefp.into());

    for sint in [SINT_MESSAGE, SINT_TIMER] {
        let msr = HV_X64_MSR_SINT0 + sint as u32;
        let value = HvSynicSint::from(arch.read_msr(msr))
            .with_vector(vector)
            .with_masked(false);
        arch.write_msr(msr, value.into());
    }

    let scontrol =
        HvSynicScontrol::from(arch.read_msr(HV_X64_MSR_SCONTROL)).with_enabled(true);
    arch.write_msr(HV_X64_MSR_SCONTROL, scontrol.into());
}

/// Reverses [`enable_cpu`] on the calling CPU.
pub fn disable_cpu(arch: &dyn HvArch) {
    let scontrol =
        HvSynicScontrol::from(arch.read_msr(HV_X64_MSR_SCONTROL)).with_enabled(false);
    arch.write_msr(HV_X64_MSR_SCONTROL, scontrol.into());

    for msr in [HV_X64_MSR_SIMP, HV_X64_MSR_SIEFP] {
        let value = HvSynicSimpSiefp::from(arch.read_msr(msr))
            .with_base_gpn(0)
            .with_enabled(false);
        arch.write_msr(msr, value.into());
    }

    for sint in [SINT_MESSAGE, SINT_TIMER] {
        let msr = HV_X64_MSR_SINT0 + sint as u32;
        let value = HvSynicSint::from(arch.read_msr(msr))
            .with_vector(0)
            .with_masked(true);
        arch.write_msr(msr, value.into());
    }
}

//! Transfer Request Blocks: the 16-byte descriptors on every xHCI ring.
//!
//! A TRB is `{parameter: u64, status: u32, control: u32}`. The control
//! dword carries the TRB type (bits 10..15) and the cycle bit (bit 0),
//! which transfers ownership between producer and consumer. Builders here
//! never set the cycle bit; the ring writes it when the TRB is enqueued.

/// TRB type codes (control dword bits 10..15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    /// Normal transfer TRB (interrupt/bulk data).
    Normal = 1,
    /// Control transfer setup stage.
    SetupStage = 2,
    /// Control transfer data stage.
    DataStage = 3,
    /// Control transfer status stage.
    StatusStage = 4,
    /// Link TRB terminating a ring segment.
    Link = 6,
    /// Enable Slot command.
    EnableSlot = 9,
    /// Disable Slot command.
    DisableSlot = 10,
    /// Address Device command.
    AddressDevice = 11,
    /// Configure Endpoint command.
    ConfigureEndpoint = 12,
    /// Stop Endpoint command.
    StopEndpoint = 15,
    /// Set TR Dequeue Pointer command.
    SetTrDequeuePointer = 16,
    /// No-op command.
    NoOpCommand = 23,
    /// Transfer event.
    TransferEvent = 32,
    /// Command completion event.
    CommandCompletionEvent = 33,
    /// Port status change event.
    PortStatusChangeEvent = 34,
    /// Host controller event.
    HostControllerEvent = 37,
    /// MFINDEX wrap event.
    MfindexWrapEvent = 39,
}

impl TrbType {
    /// Decodes a type code, if known.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Normal,
            2 => Self::SetupStage,
            3 => Self::DataStage,
            4 => Self::StatusStage,
            6 => Self::Link,
            9 => Self::EnableSlot,
            10 => Self::DisableSlot,
            11 => Self::AddressDevice,
            12 => Self::ConfigureEndpoint,
            15 => Self::StopEndpoint,
            16 => Self::SetTrDequeuePointer,
            23 => Self::NoOpCommand,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletionEvent,
            34 => Self::PortStatusChangeEvent,
            37 => Self::HostControllerEvent,
            39 => Self::MfindexWrapEvent,
            _ => return None,
        })
    }
}

/// Completion codes carried by event TRBs (status dword bits 24..31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    /// Invalid / zero code.
    Invalid = 0,
    /// Success.
    Success = 1,
    /// Transaction error on the USB wire.
    UsbTransactionError = 4,
    /// TRB-level error.
    TrbError = 5,
    /// Endpoint stalled.
    StallError = 6,
    /// Host ran out of resources.
    ResourceError = 7,
    /// Device slot cannot be enabled.
    NoSlotsAvailable = 9,
    /// Transfer shorter than requested; not an error for IN transfers.
    ShortPacket = 13,
    /// Transfer ring underrun.
    RingUnderrun = 14,
    /// Transfer ring overrun.
    RingOverrun = 15,
    /// Command was stopped before completion.
    Stopped = 26,
}

impl CompletionCode {
    /// Decodes a raw completion code; unknown values map to [`Invalid`].
    ///
    /// [`Invalid`]: CompletionCode::Invalid
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Success,
            4 => Self::UsbTransactionError,
            5 => Self::TrbError,
            6 => Self::StallError,
            7 => Self::ResourceError,
            9 => Self::NoSlotsAvailable,
            13 => Self::ShortPacket,
            14 => Self::RingUnderrun,
            15 => Self::RingOverrun,
            26 => Self::Stopped,
            _ => Self::Invalid,
        }
    }

    /// `true` for codes that complete a transfer successfully.
    pub fn is_transfer_success(self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

/// Control dword bit: cycle.
pub const TRB_CYCLE: u32 = 1 << 0;

/// Control dword bit: toggle cycle (link TRBs).
pub const TRB_TOGGLE_CYCLE: u32 = 1 << 1;

/// Control dword bit: interrupt on completion.
pub const TRB_IOC: u32 = 1 << 5;

/// Control dword bit: immediate data (setup stage).
pub const TRB_IDT: u32 = 1 << 6;

/// Control dword bit 16: direction IN (data/status stage).
pub const TRB_DIR_IN: u32 = 1 << 16;

/// Shift of the TRB type field in the control dword.
pub const TRB_TYPE_SHIFT: u32 = 10;

/// Shift of the slot-ID field in command/event control dwords.
pub const TRB_SLOT_SHIFT: u32 = 24;

/// Shift of the endpoint-ID (DCI) field in command control dwords.
pub const TRB_ENDPOINT_SHIFT: u32 = 16;

/// Setup-stage transfer type field (bits 16..17): no data stage.
pub const TRT_NO_DATA: u32 = 0 << 16;

/// Setup-stage transfer type: OUT data stage.
pub const TRT_OUT_DATA: u32 = 2 << 16;

/// Setup-stage transfer type: IN data stage.
pub const TRT_IN_DATA: u32 = 3 << 16;

/// A 16-byte Transfer Request Block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Trb {
    /// Parameter: buffer pointer, command context pointer, or immediate.
    pub parameter: u64,
    /// Status: transfer length, interrupter target, completion code.
    pub status: u32,
    /// Control: cycle, flags, TRB type, slot/endpoint IDs.
    pub control: u32,
}

impl Trb {
    /// The zero TRB.
    pub const fn empty() -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: 0,
        }
    }

    /// Returns the TRB type code.
    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_u8(((self.control >> TRB_TYPE_SHIFT) & 0x3F) as u8)
    }

    /// Returns the cycle bit.
    pub fn cycle(&self) -> bool {
        self.control & TRB_CYCLE != 0
    }

    /// Builds a link TRB pointing back at `ring_phys`.
    ///
    /// `toggle_cycle` is set so the producer's cycle state flips on wrap.
    pub fn link(ring_phys: u64) -> Self {
        Self {
            parameter: ring_phys,
            status: 0,
            control: ((TrbType::Link as u32) << TRB_TYPE_SHIFT) | TRB_TOGGLE_CYCLE,
        }
    }

    /// Builds an Enable Slot command.
    pub fn enable_slot() -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: (TrbType::EnableSlot as u32) << TRB_TYPE_SHIFT,
        }
    }

    /// Builds a Disable Slot command.
    pub fn disable_slot(slot_id: u8) -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: ((TrbType::DisableSlot as u32) << TRB_TYPE_SHIFT)
                | (u32::from(slot_id) << TRB_SLOT_SHIFT),
        }
    }

    /// Builds an Address Device command over an input context.
    pub fn address_device(input_context_phys: u64, slot_id: u8) -> Self {
        Self {
            parameter: input_context_phys,
            status: 0,
            control: ((TrbType::AddressDevice as u32) << TRB_TYPE_SHIFT)
                | (u32::from(slot_id) << TRB_SLOT_SHIFT),
        }
    }

    /// Builds a Configure Endpoint command over an input context.
    pub fn configure_endpoint(input_context_phys: u64, slot_id: u8) -> Self {
        Self {
            parameter: input_context_phys,
            status: 0,
            control: ((TrbType::ConfigureEndpoint as u32) << TRB_TYPE_SHIFT)
                | (u32::from(slot_id) << TRB_SLOT_SHIFT),
        }
    }

    /// Builds a Stop Endpoint command.
    pub fn stop_endpoint(slot_id: u8, dci: u8) -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: ((TrbType::StopEndpoint as u32) << TRB_TYPE_SHIFT)
                | (u32::from(dci) << TRB_ENDPOINT_SHIFT)
                | (u32::from(slot_id) << TRB_SLOT_SHIFT),
        }
    }

    /// Builds a Set TR Dequeue Pointer command.
    ///
    /// `dequeue_phys` carries the ring's cycle state in bit 0 (DCS).
    pub fn set_tr_dequeue(dequeue_phys: u64, dcs: bool, slot_id: u8, dci: u8) -> Self {
        Self {
            parameter: dequeue_phys | u64::from(dcs),
            status: 0,
            control: ((TrbType::SetTrDequeuePointer as u32) << TRB_TYPE_SHIFT)
                | (u32::from(dci) << TRB_ENDPOINT_SHIFT)
                | (u32::from(slot_id) << TRB_SLOT_SHIFT),
        }
    }

    /// Builds a control-transfer setup stage TRB.
    ///
    /// The 8-byte setup packet rides in the parameter as immediate data
    /// (IDT); `trt` describes the data stage that follows.
    pub fn setup_stage(setup_packet: [u8; 8], trt: u32) -> Self {
        Self {
            parameter: u64::from_le_bytes(setup_packet),
            status: 8,
            control: ((TrbType::SetupStage as u32) << TRB_TYPE_SHIFT) | TRB_IDT | trt,
        }
    }

    /// Builds a control-transfer data stage TRB.
    pub fn data_stage(buffer_phys: u64, length: u32, dir_in: bool) -> Self {
        let mut control = (TrbType::DataStage as u32) << TRB_TYPE_SHIFT;
        if dir_in {
            control |= TRB_DIR_IN;
        }
        Self {
            parameter: buffer_phys,
            status: length,
            control,
        }
    }

    /// Builds a control-transfer status stage TRB.
    ///
    /// Interrupt on completion is always requested; status completion is
    /// what retires the whole control transfer.
    pub fn status_stage(dir_in: bool) -> Self {
        let mut control = ((TrbType::StatusStage as u32) << TRB_TYPE_SHIFT) | TRB_IOC;
        if dir_in {
            control |= TRB_DIR_IN;
        }
        Self {
            parameter: 0,
            status: 0,
            control,
        }
    }

    /// Builds a normal transfer TRB (interrupt/bulk data).
    pub fn normal(buffer_phys: u64, length: u32) -> Self {
        Self {
            parameter: buffer_phys,
            status: length,
            control: ((TrbType::Normal as u32) << TRB_TYPE_SHIFT) | TRB_IOC,
        }
    }

    // --- Event TRB field accessors -------------------------------------

    /// Completion code of an event TRB.
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_u8(((self.status >> 24) & 0xFF) as u8)
    }

    /// Slot ID of an event TRB.
    pub fn slot_id(&self) -> u8 {
        ((self.control >> TRB_SLOT_SHIFT) & 0xFF) as u8
    }

    /// Endpoint ID (DCI) of a transfer event TRB.
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> TRB_ENDPOINT_SHIFT) & 0x1F) as u8
    }

    /// Port index (1-based port ID) of a port status change event.
    pub fn port_id(&self) -> u8 {
        ((self.parameter >> 24) & 0xFF) as u8
    }

    /// Residual transfer length of a transfer event.
    pub fn transfer_length(&self) -> u32 {
        self.status & 0xFF_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trb_is_16_bytes() {
        assert_eq!(core::mem::size_of::<Trb>(), 16);
    }

    #[test]
    fn builders_encode_type() {
        assert_eq!(Trb::enable_slot().trb_type(), Some(TrbType::EnableSlot));
        assert_eq!(Trb::link(0x1000).trb_type(), Some(TrbType::Link));
        assert_eq!(
            Trb::address_device(0x2000, 1).trb_type(),
            Some(TrbType::AddressDevice)
        );
    }

    #[test]
    fn builders_leave_cycle_clear() {
        assert!(!Trb::enable_slot().cycle());
        assert!(!Trb::normal(0x3000, 8).cycle());
        assert!(!Trb::link(0x1000).cycle());
    }

    #[test]
    fn link_trb_toggles_cycle() {
        let link = Trb::link(0x1000);
        assert_ne!(link.control & TRB_TOGGLE_CYCLE, 0);
        assert_eq!(link.parameter, 0x1000);
    }

    #[test]
    fn setup_stage_is_immediate() {
        let packet = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        let trb = Trb::setup_stage(packet, TRT_IN_DATA);
        assert_ne!(trb.control & TRB_IDT, 0);
        assert_eq!(trb.status, 8);
        assert_eq!(trb.parameter.to_le_bytes(), packet);
    }

    #[test]
    fn status_stage_requests_completion_interrupt() {
        let trb = Trb::status_stage(false);
        assert_ne!(trb.control & TRB_IOC, 0);
        assert_eq!(trb.control & TRB_DIR_IN, 0);
        assert_ne!(Trb::status_stage(true).control & TRB_DIR_IN, 0);
    }

    #[test]
    fn command_slot_and_endpoint_fields() {
        let trb = Trb::stop_endpoint(3, 2);
        assert_eq!(trb.slot_id(), 3);
        assert_eq!(trb.endpoint_id(), 2);
    }

    #[test]
    fn event_accessors_decode_fields() {
        let event = Trb {
            parameter: 0x5000,
            status: (1 << 24) | 42,
            control: ((TrbType::TransferEvent as u32) << TRB_TYPE_SHIFT)
                | (2 << TRB_SLOT_SHIFT)
                | (1 << TRB_ENDPOINT_SHIFT)
                | TRB_CYCLE,
        };
        assert_eq!(event.trb_type(), Some(TrbType::TransferEvent));
        assert_eq!(event.completion_code(), CompletionCode::Success);
        assert_eq!(event.slot_id(), 2);
        assert_eq!(event.endpoint_id(), 1);
        assert_eq!(event.transfer_length(), 42);
    }

    #[test]
    fn short_packet_counts_as_success() {
        assert!(CompletionCode::ShortPacket.is_transfer_success());
        assert!(CompletionCode::Success.is_transfer_success());
        assert!(!CompletionCode::StallError.is_transfer_success());
    }

    #[test]
    fn unknown_completion_code_is_invalid() {
        assert_eq!(CompletionCode::from_u8(200), CompletionCode::Invalid);
    }
}

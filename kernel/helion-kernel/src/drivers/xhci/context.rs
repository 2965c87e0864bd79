//! Device, slot, endpoint, and input contexts, and the DCBAAP array.
//!
//! Contexts use the 32-byte layout (`HCCPARAMS1.CSZ == 0`). A device
//! context is the slot context followed by 31 endpoint contexts indexed by
//! DCI - 1; an input context prepends the input control context with its
//! add/drop flag dwords. All tables live in sub-4 GiB DMA memory and are
//! referenced physically from DCBAAP and command TRBs.

/// Endpoint types (endpoint context dword 1, bits 3..5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    /// Isochronous OUT.
    IsochOut = 1,
    /// Bulk OUT.
    BulkOut = 2,
    /// Interrupt OUT.
    InterruptOut = 3,
    /// Control (bidirectional).
    Control = 4,
    /// Isochronous IN.
    IsochIn = 5,
    /// Bulk IN.
    BulkIn = 6,
    /// Interrupt IN.
    InterruptIn = 7,
}

/// Port speed IDs as reported in `PORTSC.PortSpeed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortSpeed {
    /// Full speed (12 Mb/s).
    Full = 1,
    /// Low speed (1.5 Mb/s).
    Low = 2,
    /// High speed (480 Mb/s).
    High = 3,
    /// SuperSpeed (5 Gb/s).
    Super = 4,
}

impl PortSpeed {
    /// Decodes the 4-bit PORTSC speed field; unknown IDs default to high
    /// speed, the common case for emulated controllers.
    pub fn from_portsc(raw: u8) -> Self {
        match raw {
            1 => Self::Full,
            2 => Self::Low,
            4 => Self::Super,
            _ => Self::High,
        }
    }

    /// Default max packet size of endpoint 0 at this speed.
    pub fn ep0_max_packet(self) -> u16 {
        match self {
            Self::Low | Self::Full => 8,
            Self::High => 64,
            Self::Super => 512,
        }
    }
}

/// Slot context (first 32-byte block of a device context).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct SlotContext {
    dwords: [u32; 8],
}

impl SlotContext {
    /// Builds a slot context for Address Device.
    ///
    /// `context_entries` is the highest DCI the controller should
    /// evaluate (1 = only EP0).
    pub fn new(route_string: u32, speed: PortSpeed, root_hub_port: u8, context_entries: u8) -> Self {
        let mut ctx = Self::default();
        ctx.dwords[0] = (route_string & 0xF_FFFF)
            | (u32::from(speed as u8) << 20)
            | (u32::from(context_entries) << 27);
        ctx.dwords[1] = u32::from(root_hub_port) << 16;
        ctx
    }

    /// The context-entries field.
    pub fn context_entries(&self) -> u8 {
        (self.dwords[0] >> 27) as u8
    }

    /// The root hub port number.
    pub fn root_hub_port(&self) -> u8 {
        (self.dwords[1] >> 16) as u8
    }
}

/// Endpoint context (32 bytes).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct EndpointContext {
    dwords: [u32; 8],
}

impl EndpointContext {
    /// Builds an endpoint context.
    ///
    /// `tr_dequeue` is the transfer ring's physical base; `dcs` seeds the
    /// consumer cycle state (1 for a fresh ring). `interval` is the xHCI
    /// interval exponent (125 us * 2^interval).
    pub fn new(
        ep_type: EndpointType,
        max_packet: u16,
        tr_dequeue: u64,
        dcs: bool,
        interval: u8,
    ) -> Self {
        let mut ctx = Self::default();
        ctx.dwords[0] = u32::from(interval) << 16;
        // CErr = 3 retries for everything but isochronous.
        let cerr = match ep_type {
            EndpointType::IsochOut | EndpointType::IsochIn => 0,
            _ => 3,
        };
        ctx.dwords[1] =
            (cerr << 1) | (u32::from(ep_type as u8) << 3) | (u32::from(max_packet) << 16);
        let dequeue = tr_dequeue | u64::from(dcs);
        ctx.dwords[2] = dequeue as u32;
        ctx.dwords[3] = (dequeue >> 32) as u32;
        // Average TRB length: a reasonable default for scheduling.
        ctx.dwords[4] = u32::from(max_packet);
        ctx
    }

    /// The endpoint type field.
    pub fn ep_type(&self) -> u8 {
        ((self.dwords[1] >> 3) & 0x7) as u8
    }

    /// The max packet size field.
    pub fn max_packet(&self) -> u16 {
        (self.dwords[1] >> 16) as u16
    }

    /// The TR dequeue pointer including the DCS bit.
    pub fn tr_dequeue(&self) -> u64 {
        u64::from(self.dwords[2]) | (u64::from(self.dwords[3]) << 32)
    }
}

/// Number of endpoint contexts in a device context (DCI 1..=31).
pub const ENDPOINT_CONTEXTS: usize = 31;

/// A device context: slot + 31 endpoint contexts, DCBAAP-referenced.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct DeviceContext {
    /// The slot context.
    pub slot: SlotContext,
    /// Endpoint contexts indexed by DCI - 1.
    pub endpoints: [EndpointContext; ENDPOINT_CONTEXTS],
}

impl DeviceContext {
    /// A zeroed device context.
    pub const fn zeroed() -> Self {
        // SAFETY: all-zero is a valid (empty) context per the xHCI layout.
        unsafe { core::mem::zeroed() }
    }
}

/// Input control context: which contexts a command evaluates.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C, align(32))]
pub struct InputControlContext {
    dwords: [u32; 8],
}

impl InputControlContext {
    /// Drop flags (dword 0): contexts the command disables.
    pub fn set_drop_flags(&mut self, flags: u32) {
        self.dwords[0] = flags;
    }

    /// Add flags (dword 1): contexts the command evaluates. Bit 0 is the
    /// slot context, bit `dci` the corresponding endpoint.
    pub fn set_add_flags(&mut self, flags: u32) {
        self.dwords[1] = flags;
    }

    /// The add flags dword.
    pub fn add_flags(&self) -> u32 {
        self.dwords[1]
    }

    /// The drop flags dword.
    pub fn drop_flags(&self) -> u32 {
        self.dwords[0]
    }
}

/// Add-flag bit for the slot context.
pub const ADD_SLOT: u32 = 1 << 0;

/// Add-flag bit for endpoint 0 (DCI 1).
pub const ADD_EP0: u32 = 1 << 1;

/// An input context: control + slot + 31 endpoint contexts.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct InputContext {
    /// Add/drop flag block.
    pub control: InputControlContext,
    /// The slot context the command evaluates.
    pub slot: SlotContext,
    /// Endpoint contexts indexed by DCI - 1.
    pub endpoints: [EndpointContext; ENDPOINT_CONTEXTS],
}

impl InputContext {
    /// A zeroed input context.
    pub const fn zeroed() -> Self {
        // SAFETY: all-zero is a valid (empty) context per the xHCI layout.
        unsafe { core::mem::zeroed() }
    }

    /// Sets the endpoint context for `dci` and its add flag.
    pub fn set_endpoint(&mut self, dci: u8, context: EndpointContext) {
        debug_assert!((1..=31).contains(&dci));
        self.endpoints[usize::from(dci) - 1] = context;
        self.control
            .set_add_flags(self.control.add_flags() | (1 << dci));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_sizes_match_csz0_layout() {
        assert_eq!(core::mem::size_of::<SlotContext>(), 32);
        assert_eq!(core::mem::size_of::<EndpointContext>(), 32);
        assert_eq!(core::mem::size_of::<DeviceContext>(), 32 * 32);
        assert_eq!(core::mem::size_of::<InputContext>(), 33 * 32);
    }

    #[test]
    fn slot_context_fields() {
        let slot = SlotContext::new(0, PortSpeed::High, 4, 1);
        assert_eq!(slot.context_entries(), 1);
        assert_eq!(slot.root_hub_port(), 4);
        assert_eq!((slot.dwords[0] >> 20) & 0xF, PortSpeed::High as u32);
    }

    #[test]
    fn endpoint_context_encodes_dequeue_with_dcs() {
        let ep = EndpointContext::new(EndpointType::Control, 64, 0x1234_0000, true, 0);
        assert_eq!(ep.ep_type(), EndpointType::Control as u8);
        assert_eq!(ep.max_packet(), 64);
        assert_eq!(ep.tr_dequeue(), 0x1234_0001);
    }

    #[test]
    fn isoch_endpoints_have_no_retries() {
        let ep = EndpointContext::new(EndpointType::IsochIn, 1024, 0x8000, true, 3);
        assert_eq!((ep.dwords[1] >> 1) & 0x3, 0);
        let bulk = EndpointContext::new(EndpointType::BulkIn, 512, 0x8000, true, 0);
        assert_eq!((bulk.dwords[1] >> 1) & 0x3, 3);
    }

    #[test]
    fn input_context_add_flags_accumulate() {
        let mut input = InputContext::zeroed();
        input.control.set_add_flags(ADD_SLOT);
        input.set_endpoint(
            1,
            EndpointContext::new(EndpointType::Control, 8, 0x9000, true, 0),
        );
        input.set_endpoint(
            3,
            EndpointContext::new(EndpointType::InterruptIn, 8, 0xA000, true, 4),
        );
        assert_eq!(input.control.add_flags(), ADD_SLOT | ADD_EP0 | (1 << 3));
    }

    #[test]
    fn ep0_max_packet_by_speed() {
        assert_eq!(PortSpeed::Low.ep0_max_packet(), 8);
        assert_eq!(PortSpeed::Full.ep0_max_packet(), 8);
        assert_eq!(PortSpeed::High.ep0_max_packet(), 64);
        assert_eq!(PortSpeed::Super.ep0_max_packet(), 512);
    }
}

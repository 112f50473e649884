//! Per-link records held in the registry, and the client-facing
//! configuration/grant types.

use crate::hal::{BitOrder, LinkMode, LinkRegs};
use crate::message::TxQueue;

/// Position of a link in the registry; registry order is also the
/// round-robin service order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkId(u8);

impl LinkId {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Client-supplied parameters for a link request.
///
/// The receive buffer stays owned by the client; the driver only borrows
/// it for the lifetime of the grant and hands it back on release.
pub struct LinkConfig<'b> {
    pub link: LinkId,
    pub mode: LinkMode,
    pub bit_order: BitOrder,
    pub rx_buffer: Option<&'b mut [u8]>,
    /// Invoked once per ingested byte (circular receive modes only).
    pub rx_callback: Option<fn(u8)>,
    /// Paces the per-byte transmit path; invoked after every byte loaded
    /// and once more on completion.
    pub flow_callback: Option<fn()>,
}

/// Proof of exclusive ownership of a link.
///
/// Not copyable; releasing consumes it, so a stale grant cannot reach a
/// re-assigned link.
pub struct LinkGrant {
    id: LinkId,
}

impl LinkGrant {
    pub(crate) fn new(id: LinkId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }
}

/// One managed physical link. Created at construction, never destroyed;
/// request/release only toggle `assigned` and reset the transient state.
///
/// Transient fields are touched by exactly two actors, the mainline
/// scheduler and this link's own interrupt events, always under the
/// driver mutex.
pub(crate) struct Instance<'b, H> {
    pub regs: H,
    pub assigned: bool,
    pub faulted: bool,
    pub busy_tx: bool,
    pub busy_rx: bool,
    pub mode: LinkMode,
    pub bit_order: BitOrder,
    pub tx_queue: TxQueue,
    /// Bytes left in the in-flight per-byte transfer.
    pub tx_remaining: usize,
    /// Index of the byte most recently loaded from the head message.
    pub tx_index: usize,
    pub rx_buf: Option<&'b mut [u8]>,
    pub rx_next_write: usize,
    /// Outstanding single-shot block-receive length (clocked mode).
    pub rx_pending: usize,
    /// Latched when a block receive finishes; cleared by the status query.
    pub rx_complete: bool,
    pub rx_callback: Option<fn(u8)>,
    pub flow_callback: Option<fn()>,
}

impl<'b, H: LinkRegs> Instance<'b, H> {
    pub fn new(regs: H) -> Self {
        Self {
            regs,
            assigned: false,
            faulted: false,
            busy_tx: false,
            busy_rx: false,
            mode: LinkMode::Plain,
            bit_order: BitOrder::MsbFirst,
            tx_queue: TxQueue::new(),
            tx_remaining: 0,
            tx_index: 0,
            rx_buf: None,
            rx_next_write: 0,
            rx_pending: 0,
            rx_complete: false,
            rx_callback: None,
            flow_callback: None,
        }
    }

    /// Back to unassigned defaults. The transmit queue must already be
    /// drained (release abandons it first).
    pub fn reset_transients(&mut self) {
        self.faulted = false;
        self.busy_tx = false;
        self.busy_rx = false;
        while self.tx_queue.pop_front().is_some() {}
        self.tx_remaining = 0;
        self.tx_index = 0;
        self.rx_buf = None;
        self.rx_next_write = 0;
        self.rx_pending = 0;
        self.rx_complete = false;
        self.rx_callback = None;
        self.flow_callback = None;
    }
}

//! Host-side stand-ins for the hardware the driver core is generic
//! over: a scripted serial link implementing [`LinkRegs`] and a tick
//! source whose reads make busy-wait loops progress.
//!
//! Test-only; none of this is meant for a target build.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use serial_mux::{
    BitOrder, IrqLine, LinkEvent, LinkFault, LinkMode, LinkRegs, TickSource,
};

/// Millisecond clock for tests. Every read advances it by one, so the
/// driver's busy-wait loops terminate without a real timer.
pub struct SimClock(Cell<u32>);

impl SimClock {
    pub const fn new() -> Self {
        Self(Cell::new(0))
    }

    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SimClock {
    fn now(&self) -> u32 {
        let t = self.0.get().wrapping_add(1);
        self.0.set(t);
        t
    }
}

#[derive(Default)]
struct SimState {
    mode: Option<LinkMode>,
    bit_order: Option<BitOrder>,
    irq_enabled: bool,
    /// Per-line unmask state, indexed by [`line_slot`].
    unmasked: [bool; 3],
    /// Every byte the driver put on the wire, per-byte and block alike.
    written: Vec<u8>,
    /// Block transfer handed to the controller, not yet completed.
    block_tx: Option<Vec<u8>>,
    /// Armed block-receive length.
    block_rx: Option<usize>,
    events: VecDeque<LinkEvent>,
    reset_tx_count: usize,
    shutdown_count: usize,
    /// When set, block transmits complete as soon as they start.
    auto_complete: bool,
}

fn line_slot(line: IrqLine) -> usize {
    match line {
        IrqLine::TxReady => 0,
        IrqLine::TxDone => 1,
        IrqLine::RxReady => 2,
    }
}

/// One simulated link. Clones share state: hand one clone to the
/// driver, keep the other to script hardware behaviour and inspect the
/// wire.
#[derive(Clone, Default)]
pub struct SimLink {
    state: Rc<RefCell<SimState>>,
}

impl SimLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make block transmits finish instantly (the completion event is
    /// still delivered through `take_event`).
    pub fn set_auto_complete(&self, on: bool) {
        self.state.borrow_mut().auto_complete = on;
    }

    /// Finish the in-flight block transmit. Returns false if none was
    /// pending.
    pub fn complete_block_tx(&self) -> bool {
        let mut s = self.state.borrow_mut();
        match s.block_tx.take() {
            Some(data) => {
                s.written.extend_from_slice(&data);
                s.events.push_back(LinkEvent::BlockTxDone);
                true
            }
            None => false,
        }
    }

    /// Deliver one incoming byte.
    pub fn push_rx(&self, byte: u8) {
        self.state.borrow_mut().events.push_back(LinkEvent::RxByte(byte));
    }

    /// Finish the armed block receive with the given data.
    pub fn complete_block_rx(&self, data: &[u8]) {
        let mut s = self.state.borrow_mut();
        s.block_rx = None;
        for &b in data {
            s.events.push_back(LinkEvent::RxByte(b));
        }
        s.events.push_back(LinkEvent::BlockRxDone);
    }

    /// Signal "ready for the next byte" on the per-byte transmit path.
    pub fn pump_tx_ready(&self) {
        self.state.borrow_mut().events.push_back(LinkEvent::TxReady);
    }

    pub fn raise_fault(&self, fault: LinkFault) {
        self.state.borrow_mut().events.push_back(LinkEvent::Fault(fault));
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// The block transmit currently handed to the controller.
    pub fn pending_block_tx(&self) -> Option<Vec<u8>> {
        self.state.borrow().block_tx.clone()
    }

    pub fn pending_block_rx(&self) -> Option<usize> {
        self.state.borrow().block_rx
    }

    pub fn mode(&self) -> Option<LinkMode> {
        self.state.borrow().mode
    }

    pub fn bit_order(&self) -> Option<BitOrder> {
        self.state.borrow().bit_order
    }

    pub fn irq_enabled(&self) -> bool {
        self.state.borrow().irq_enabled
    }

    pub fn line_unmasked(&self, line: IrqLine) -> bool {
        self.state.borrow().unmasked[line_slot(line)]
    }

    pub fn reset_tx_count(&self) -> usize {
        self.state.borrow().reset_tx_count
    }

    pub fn shutdown_count(&self) -> usize {
        self.state.borrow().shutdown_count
    }

    pub fn events_pending(&self) -> usize {
        self.state.borrow().events.len()
    }
}

impl LinkRegs for SimLink {
    fn configure(&mut self, mode: LinkMode, bit_order: BitOrder) {
        let mut s = self.state.borrow_mut();
        s.mode = Some(mode);
        s.bit_order = Some(bit_order);
        s.unmasked = [false; 3];
    }

    fn shutdown(&mut self) {
        let mut s = self.state.borrow_mut();
        s.mode = None;
        s.shutdown_count += 1;
    }

    fn irq_enable(&mut self) {
        self.state.borrow_mut().irq_enabled = true;
    }

    fn irq_disable(&mut self) {
        self.state.borrow_mut().irq_enabled = false;
    }

    fn mask(&mut self, line: IrqLine) {
        self.state.borrow_mut().unmasked[line_slot(line)] = false;
    }

    fn unmask(&mut self, line: IrqLine) {
        self.state.borrow_mut().unmasked[line_slot(line)] = true;
    }

    fn start_block_tx(&mut self, data: &[u8]) {
        let mut s = self.state.borrow_mut();
        if s.auto_complete {
            s.written.extend_from_slice(data);
            s.events.push_back(LinkEvent::BlockTxDone);
        } else {
            s.block_tx = Some(data.to_vec());
        }
    }

    fn start_block_rx(&mut self, len: usize) {
        self.state.borrow_mut().block_rx = Some(len);
    }

    fn reset_tx(&mut self) {
        self.state.borrow_mut().reset_tx_count += 1;
    }

    fn load_tx_byte(&mut self, byte: u8) {
        self.state.borrow_mut().written.push(byte);
    }

    fn take_event(&mut self) -> Option<LinkEvent> {
        let mut s = self.state.borrow_mut();
        let deliverable = |s: &SimState, ev: &LinkEvent| match ev {
            LinkEvent::TxReady => s.unmasked[line_slot(IrqLine::TxReady)],
            LinkEvent::BlockTxDone => s.unmasked[line_slot(IrqLine::TxDone)],
            LinkEvent::RxByte(_) => s.unmasked[line_slot(IrqLine::RxReady)],
            // Faults and receive completion always surface.
            LinkEvent::BlockRxDone | LinkEvent::Fault(_) => true,
        };
        let pos = s.events.iter().position(|ev| deliverable(&s, ev))?;
        s.events.remove(pos)
    }
}

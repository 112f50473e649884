//! Interrupt-side handling: receive ingestion, per-byte transmit
//! pacing, transfer completion and hardware faults.
//!
//! On target, the vector handler for each physical link calls
//! [`SerialMux::on_interrupt`] with that link's id; everything here runs
//! under the same mutex the mainline uses, which on a Cortex-M build is
//! an interrupt-masked critical section.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::hal::{IrqLine, LinkEvent, LinkFault, LinkMode, LinkRegs};
use crate::message::MsgStatus;
use crate::mux::{DriverFlags, SerialMux, Shared};
use crate::scheduler::TaskState;
use crate::time::TickSource;

impl<'b, M: RawMutex, C: TickSource, H: LinkRegs, const N: usize>
    SerialMux<'b, M, C, H, N>
{
    /// Interrupt entry point for one link: drain and handle every
    /// pending hardware condition.
    pub fn on_interrupt(&self, id: crate::LinkId) {
        let now = self.clock.now();
        self.with(|s| Self::service_events(s, id.index(), now));
    }

    /// Polled servicing of every link, for the boot phase where the
    /// interrupt controller may not be delivering yet.
    pub(crate) fn poll_links(&self) {
        let now = self.clock.now();
        self.with(|s| {
            for idx in 0..N {
                Self::service_events(s, idx, now);
            }
        });
    }

    fn service_events(s: &mut Shared<'b, H, N>, idx: usize, now: u32) {
        while let Some(ev) = s.links[idx].regs.take_event() {
            Self::handle_event(s, idx, ev, now);
        }
    }

    fn handle_event(s: &mut Shared<'b, H, N>, idx: usize, ev: LinkEvent, now: u32) {
        if !s.links[idx].assigned {
            // Leftover status from before a release.
            return;
        }
        match ev {
            LinkEvent::RxByte(byte) => Self::ingest(s, idx, byte),
            LinkEvent::TxReady => Self::tx_ready(s, idx, now),
            LinkEvent::BlockTxDone => {
                let inst = &mut s.links[idx];
                if !inst.busy_tx {
                    return;
                }
                inst.regs.mask(IrqLine::TxDone);
                Self::finish_tx(s, idx, now);
            }
            LinkEvent::BlockRxDone => Self::finish_rx(s, idx),
            LinkEvent::Fault(fault) => Self::fault(s, idx, fault, now),
        }
    }

    /// Deposit one received byte.
    ///
    /// Circular modes wrap with no overflow detection; the client must
    /// drain faster than the wrap period. During a clocked block receive
    /// the buffer fills sequentially from the start instead.
    ///
    /// Note the asymmetry with transmit: the flow-control callback paces
    /// outgoing bytes only, nothing throttles this path.
    fn ingest(s: &mut Shared<'b, H, N>, idx: usize, byte: u8) {
        let inst = &mut s.links[idx];
        if inst.busy_rx {
            if let Some(buf) = inst.rx_buf.as_mut() {
                let limit = inst.rx_pending.min(buf.len());
                if inst.rx_next_write < limit {
                    buf[inst.rx_next_write] = byte;
                    inst.rx_next_write += 1;
                }
            }
            return;
        }
        if let Some(buf) = inst.rx_buf.as_mut() {
            if !buf.is_empty() {
                buf[inst.rx_next_write] = byte;
                inst.rx_next_write = (inst.rx_next_write + 1) % buf.len();
            }
        }
        if let Some(cb) = inst.rx_callback {
            cb(byte);
        }
    }

    /// Per-byte transmit pacing: load the next byte, or finalize when
    /// the message is exhausted. The flow callback runs in both cases.
    fn tx_ready(s: &mut Shared<'b, H, N>, idx: usize, now: u32) {
        let inst = &mut s.links[idx];
        if !inst.busy_tx || inst.tx_remaining == 0 {
            warn!("spurious tx-ready on link {}", idx);
            inst.regs.mask(IrqLine::TxReady);
            return;
        }
        inst.tx_remaining -= 1;
        if inst.tx_remaining != 0 {
            inst.tx_index += 1;
            let next = inst
                .tx_queue
                .front()
                .and_then(|m| m.data.get(inst.tx_index))
                .copied();
            if let Some(byte) = next {
                let byte = inst.bit_order.apply(byte);
                inst.regs.load_tx_byte(byte);
            }
            if let Some(cb) = inst.flow_callback {
                cb();
            }
        } else {
            inst.regs.mask(IrqLine::TxReady);
            let cb = inst.flow_callback;
            Self::finish_tx(s, idx, now);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    /// Common completion: settle the head message, free the link for
    /// the next queued transfer.
    fn finish_tx(s: &mut Shared<'b, H, N>, idx: usize, now: u32) {
        let inst = &mut s.links[idx];
        let token = inst.tx_queue.pop_front().map(|m| m.token);
        inst.busy_tx = false;
        inst.tx_remaining = 0;
        inst.tx_index = 0;
        if inst.mode == LinkMode::FlowControl {
            // Back to a receive-capable idle for the half-duplex link.
            inst.regs.unmask(IrqLine::RxReady);
        }
        if let Some(token) = token {
            s.board.update(token, MsgStatus::Complete, now);
        }
        Self::transfer_done(s);
    }

    fn finish_rx(s: &mut Shared<'b, H, N>, idx: usize) {
        let inst = &mut s.links[idx];
        if !inst.busy_rx {
            return;
        }
        inst.busy_rx = false;
        inst.rx_pending = 0;
        inst.rx_complete = true;
        inst.regs.mask(IrqLine::RxReady);
        Self::transfer_done(s);
    }

    /// Hardware fault: park this link, surface the in-flight message as
    /// abandoned. No retry; the owner decides by releasing and
    /// re-requesting.
    fn fault(s: &mut Shared<'b, H, N>, idx: usize, fault: LinkFault, now: u32) {
        let what = match fault {
            LinkFault::Nack => "nack",
            LinkFault::Overrun => "overrun",
        };
        warn!("link {} parked on {} fault", idx, what);
        let inst = &mut s.links[idx];
        inst.faulted = true;
        inst.regs.mask(IrqLine::TxReady);
        inst.regs.mask(IrqLine::TxDone);
        inst.regs.mask(IrqLine::RxReady);
        let was_busy = inst.busy_tx || inst.busy_rx;
        let token = if inst.busy_tx {
            inst.tx_queue.pop_front().map(|m| m.token)
        } else {
            None
        };
        inst.busy_tx = false;
        inst.busy_rx = false;
        inst.tx_remaining = 0;
        inst.tx_index = 0;
        inst.rx_pending = 0;
        if let Some(token) = token {
            s.board.update(token, MsgStatus::Abandoned, now);
        }
        if was_busy {
            Self::transfer_done(s);
        }
    }

    /// Balance the active-transfer count against a completed transfer.
    fn transfer_done(s: &mut Shared<'b, H, N>) {
        if s.active == 0 {
            s.flags |= DriverFlags::NO_ACTIVE_UNDERFLOW;
            s.task = TaskState::Error;
            error!("active transfer count underflow");
        } else {
            s.active -= 1;
        }
    }
}

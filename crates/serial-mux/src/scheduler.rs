//! Cooperative transmit scheduler: one registry slot serviced per tick,
//! round-robin, so no link can starve another.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::hal::{IrqLine, LinkMode, LinkRegs};
use crate::message::MsgStatus;
use crate::mux::{DriverFlags, SerialMux, Shared, DUMMY_BYTE, MAX_ACTIVE_LINKS};
use crate::time::TickSource;

/// Outer state of the driver task.
///
/// `Error` means the driver's own bookkeeping went inconsistent (active
/// transfer count underflow); the scheduler parks there until
/// `reinitialize`. A hardware fault on one link does NOT come here, it
/// only parks that link.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    Idle,
    Error,
}

impl<'b, M: RawMutex, C: TickSource, H: LinkRegs, const N: usize>
    SerialMux<'b, M, C, H, N>
{
    /// One scheduler iteration: dispatch on the task state, service the
    /// currently selected link, advance the round-robin cursor. Call
    /// once per mainline cycle.
    pub fn run_active_state(&self) {
        let now = self.clock.now();
        self.with(|s| match s.task {
            TaskState::Idle => {
                let idx = s.rr_cursor;
                s.rr_cursor = (s.rr_cursor + 1) % N;
                Self::service(s, idx, now);
            }
            TaskState::Error => {}
        });
    }

    /// Start the next transfer on link `idx` if it is assigned, healthy
    /// and idle. At most one transfer starts per call.
    pub(crate) fn service(s: &mut Shared<'b, H, N>, idx: usize, now: u32) {
        let inst = &mut s.links[idx];
        if !inst.assigned || inst.faulted || inst.busy_tx || inst.busy_rx {
            return;
        }

        // A pending block receive takes priority over queued transmits;
        // read requests are only accepted while the queue is empty, so
        // the two never actually compete.
        let started = if inst.rx_pending != 0 {
            let len = inst.rx_pending;
            if let Some(buf) = inst.rx_buf.as_mut() {
                // Predictable dummies: the same buffer sources the bytes
                // clocked out while receiving.
                for b in buf[..len].iter_mut() {
                    *b = DUMMY_BYTE;
                }
            }
            inst.rx_next_write = 0;
            inst.busy_rx = true;
            inst.regs.unmask(IrqLine::RxReady);
            inst.regs.start_block_rx(len);
            Some(None)
        } else if let Some(head) = inst.tx_queue.front() {
            let token = head.token;
            match inst.mode {
                LinkMode::FlowControl => {
                    // Per-byte transfer: first byte goes out now, the
                    // rest ride the tx-ready interrupt. Half duplex, so
                    // the receiver is quiet until the message finishes.
                    inst.tx_remaining = head.data.len();
                    inst.tx_index = 0;
                    let first = inst.bit_order.apply(head.data[0]);
                    inst.busy_tx = true;
                    inst.regs.mask(IrqLine::RxReady);
                    inst.regs.reset_tx();
                    inst.regs.load_tx_byte(first);
                    inst.regs.unmask(IrqLine::TxReady);
                    if let Some(cb) = inst.flow_callback {
                        cb();
                    }
                }
                LinkMode::Plain | LinkMode::Clocked => {
                    inst.busy_tx = true;
                    inst.regs.start_block_tx(&head.data);
                    inst.regs.unmask(IrqLine::TxDone);
                }
            }
            Some(Some(token))
        } else {
            None
        };

        if let Some(token) = started {
            if let Some(token) = token {
                s.board.update(token, MsgStatus::Sending, now);
            }
            s.active += 1;
            if s.active as usize > MAX_ACTIVE_LINKS {
                s.flags |= DriverFlags::TOO_MANY_LINKS;
                warn!("{} transfers active at once", s.active);
            }
        }
    }
}

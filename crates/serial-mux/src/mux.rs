//! The multiplexer proper: registry, resource arbiter, write entry
//! points and client-side queries.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::hal::{IrqLine, LinkMode, LinkRegs};
use crate::instance::{Instance, LinkConfig, LinkGrant};
use crate::message::{
    MsgStatus, StatusBoard, Token, TokenGen, TxMessage, MAX_TX_MESSAGE_LEN,
};
use crate::scheduler::TaskState;
use crate::time::TickSource;

/// Soft ceiling on simultaneously active transfers; exceeding it is a
/// flagged diagnostic, not a failure.
pub const MAX_ACTIVE_LINKS: usize = 4;

/// Fill byte clocked out (and pre-filled into the target buffer) during
/// a clocked-master block receive.
pub const DUMMY_BYTE: u8 = 0xFF;

bitflags::bitflags! {
    /// Inspectable "why" register for rejected calls and soft errors.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DriverFlags: u32 {
        /// Synchronous drain in progress.
        const MANUAL_MODE = 1 << 0;
        /// A write was refused because the link's FIFO was full.
        const QUEUE_FULL = 1 << 1;
        /// A write or read request had an invalid size.
        const MSG_REJECTED = 1 << 2;
        /// A request hit an already-assigned link.
        const REQUEST_DENIED = 1 << 3;
        /// More than [`MAX_ACTIVE_LINKS`] transfers in flight at once.
        const TOO_MANY_LINKS = 1 << 4;
        /// Active-transfer count underflowed; bookkeeping is corrupt and
        /// the scheduler parks in [`TaskState::Error`].
        const NO_ACTIVE_UNDERFLOW = 1 << 5;
    }
}

/// State of the current single-shot block receive (clocked mode).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxStatus {
    /// The link's mode has no block receives.
    Invalid,
    /// Nothing requested and nothing waiting to be picked up.
    Empty,
    /// Requested, not yet started by the scheduler.
    Waiting,
    Receiving,
    /// Finished; this answer clears the latch.
    Complete,
}

pub(crate) struct Shared<'b, H, const N: usize> {
    pub links: [Instance<'b, H>; N],
    pub task: TaskState,
    pub rr_cursor: usize,
    /// Transfers in flight across all links; drives the drain-mode exit
    /// condition and the starvation guard.
    pub active: u8,
    pub flags: DriverFlags,
    pub tokens: TokenGen,
    pub board: StatusBoard,
    pub initializing: bool,
}

/// Multiplexer over `N` physical serial links.
///
/// `M` picks the mutex flavour guarding mainline/ISR shared state
/// (`CriticalSectionRawMutex` on target), `C` the millisecond tick
/// source and `H` the register-level hardware interface.
pub struct SerialMux<'b, M: RawMutex, C: TickSource, H: LinkRegs, const N: usize> {
    pub(crate) shared: Mutex<M, RefCell<Shared<'b, H, N>>>,
    pub(crate) clock: &'b C,
}

impl<'b, M: RawMutex, C: TickSource, H: LinkRegs, const N: usize>
    SerialMux<'b, M, C, H, N>
{
    /// Build the registry. Links are identified by their position in
    /// `regs`, which is also the round-robin service order. The driver
    /// starts in its boot (initializing) phase; call
    /// [`set_running`](Self::set_running) once the cooperative loop is
    /// live.
    pub fn new(clock: &'b C, regs: [H; N]) -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                links: regs.map(Instance::new),
                task: TaskState::Idle,
                rr_cursor: 0,
                active: 0,
                flags: DriverFlags::empty(),
                tokens: TokenGen::new(),
                board: StatusBoard::new(),
                initializing: true,
            })),
            clock,
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Shared<'b, H, N>) -> R) -> R {
        self.shared.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Claim exclusive ownership of a link.
    ///
    /// Fails if the link is already assigned. On success the peripheral
    /// is programmed for the requested mode, its interrupt is unmasked
    /// at the controller, and the client's receive buffer and callbacks
    /// are installed.
    pub fn request(&self, config: LinkConfig<'b>) -> Option<LinkGrant> {
        self.with(|s| {
            let inst = &mut s.links[config.link.index()];
            if inst.assigned {
                s.flags |= DriverFlags::REQUEST_DENIED;
                warn!("link {} already assigned", config.link.index());
                return None;
            }
            inst.reset_transients();
            inst.mode = config.mode;
            inst.bit_order = config.bit_order;
            inst.rx_buf = config.rx_buffer;
            inst.rx_callback = config.rx_callback;
            inst.flow_callback = config.flow_callback;
            inst.regs.configure(config.mode, config.bit_order);
            match config.mode {
                // Asynchronous links listen from the moment they are
                // assigned; clocked receives are armed per request.
                LinkMode::Plain | LinkMode::FlowControl => {
                    inst.regs.unmask(IrqLine::RxReady)
                }
                LinkMode::Clocked => {}
            }
            inst.regs.irq_enable();
            inst.assigned = true;
            Some(LinkGrant::new(config.link))
        })
    }

    /// Give a link back, abandoning everything still queued or in
    /// flight. Returns the lent receive buffer.
    ///
    /// Safe to call mid-transfer: the interrupt is masked before any
    /// state is torn down, so the in-flight buffer is never read again.
    pub fn release(&self, grant: LinkGrant) -> Option<&'b mut [u8]> {
        let now = self.clock.now();
        self.with(|s| {
            let inst = &mut s.links[grant.id().index()];
            if !inst.assigned {
                return None;
            }
            inst.regs.irq_disable();
            if inst.busy_tx || inst.busy_rx {
                s.active = s.active.saturating_sub(1);
            }
            let mut abandoned: Vec<Token, { crate::message::TX_QUEUE_DEPTH }> =
                Vec::new();
            while let Some(msg) = inst.tx_queue.pop_front() {
                let _ = abandoned.push(msg.token);
            }
            let buf = inst.rx_buf.take();
            inst.reset_transients();
            inst.regs.shutdown();
            inst.assigned = false;
            for token in abandoned {
                s.board.update(token, MsgStatus::Abandoned, now);
            }
            buf
        })
    }

    /// Queue one byte for transmission.
    pub fn write_byte(&self, grant: &LinkGrant, byte: u8) -> Option<Token> {
        self.queue_write(grant, &[byte])
    }

    /// Queue a buffer for transmission. The payload is copied into the
    /// link's FIFO; `None` means rejected (empty, oversize or FIFO
    /// full), with the reason latched in [`flags`](Self::flags).
    pub fn write_data(&self, grant: &LinkGrant, data: &[u8]) -> Option<Token> {
        self.queue_write(grant, data)
    }

    fn queue_write(&self, grant: &LinkGrant, data: &[u8]) -> Option<Token> {
        let now = self.clock.now();
        let (token, drain_now) = self.with(|s| {
            if data.is_empty() || data.len() > MAX_TX_MESSAGE_LEN {
                s.flags |= DriverFlags::MSG_REJECTED;
                warn!(
                    "rejected {} byte message for link {}",
                    data.len(),
                    grant.id().index()
                );
                return (None, false);
            }
            let inst = &mut s.links[grant.id().index()];
            if inst.tx_queue.is_full() {
                s.flags |= DriverFlags::QUEUE_FULL;
                return (None, false);
            }
            let token = s.tokens.next();
            let mut payload = heapless::Vec::new();
            let _ = payload.extend_from_slice(data);
            let _ = inst.tx_queue.push_back(TxMessage { token, data: payload });
            s.board.post(token, now);
            (Some(token), s.initializing)
        });
        // During boot the cooperative loop is not running yet, so push
        // the message out synchronously.
        if token.is_some() && drain_now {
            self.manual_drain();
        }
        token
    }

    /// Clocked mode only: request one byte from the far end.
    pub fn read_byte(&self, grant: &LinkGrant) -> bool {
        self.request_read(grant, 1)
    }

    /// Clocked mode only: request `len` bytes from the far end. Refused
    /// while transmits are queued or another receive is outstanding;
    /// oversize requests are rejected outright.
    pub fn read_data(&self, grant: &LinkGrant, len: usize) -> bool {
        self.request_read(grant, len)
    }

    fn request_read(&self, grant: &LinkGrant, len: usize) -> bool {
        self.with(|s| {
            let idx = grant.id().index();
            let inst = &mut s.links[idx];
            if inst.mode != LinkMode::Clocked {
                return false;
            }
            if inst.rx_pending != 0 || inst.busy_rx || !inst.tx_queue.is_empty() {
                return false;
            }
            let cap = inst.rx_buf.as_ref().map(|b| b.len()).unwrap_or(0);
            if len == 0 || len > cap {
                s.flags |= DriverFlags::MSG_REJECTED;
                warn!("receive request of {} bytes too large for link {}", len, idx);
                return false;
            }
            inst.rx_pending = len;
            true
        })
    }

    /// Progress of the current block receive (clocked mode). Answering
    /// `Complete` clears the completion latch.
    pub fn rx_status(&self, grant: &LinkGrant) -> RxStatus {
        self.with(|s| {
            let inst = &mut s.links[grant.id().index()];
            if inst.mode != LinkMode::Clocked {
                return RxStatus::Invalid;
            }
            if inst.rx_pending == 0 {
                if inst.rx_complete {
                    inst.rx_complete = false;
                    RxStatus::Complete
                } else {
                    RxStatus::Empty
                }
            } else if inst.busy_rx {
                RxStatus::Receiving
            } else {
                RxStatus::Waiting
            }
        })
    }

    /// Look at the lent receive buffer and the write cursor without
    /// racing the interrupt path.
    pub fn with_rx<R>(
        &self,
        grant: &LinkGrant,
        f: impl FnOnce(&[u8], usize) -> R,
    ) -> R {
        self.with(|s| {
            let inst = &s.links[grant.id().index()];
            match inst.rx_buf.as_deref() {
                Some(buf) => f(buf, inst.rx_next_write),
                None => f(&[], 0),
            }
        })
    }

    /// Where the next received byte will land.
    pub fn rx_cursor(&self, grant: &LinkGrant) -> usize {
        self.with(|s| s.links[grant.id().index()].rx_next_write)
    }

    pub fn message_status(&self, token: Token) -> Option<MsgStatus> {
        self.with(|s| s.board.status(token))
    }

    /// Messages still waiting in the link's FIFO (including the one in
    /// flight).
    pub fn queued_len(&self, grant: &LinkGrant) -> usize {
        self.with(|s| s.links[grant.id().index()].tx_queue.len())
    }

    /// True once a hardware fault parked this link. The link stays
    /// parked until released and re-requested.
    pub fn link_faulted(&self, grant: &LinkGrant) -> bool {
        self.with(|s| s.links[grant.id().index()].faulted)
    }

    pub fn flags(&self) -> DriverFlags {
        self.with(|s| s.flags)
    }

    pub fn clear_flags(&self, which: DriverFlags) {
        self.with(|s| s.flags.remove(which));
    }

    pub fn task_state(&self) -> TaskState {
        self.with(|s| s.task)
    }

    pub fn active_transfers(&self) -> u8 {
        self.with(|s| s.active)
    }

    /// Expire stale status records. Call once per mainline cycle, after
    /// the scheduler tick.
    pub fn messaging_tick(&self) {
        let now = self.clock.now();
        self.with(|s| s.board.tick(now));
    }

    /// Leave the boot phase. Writes stop draining synchronously and
    /// [`manual_drain`](Self::manual_drain) becomes a no-op.
    pub fn set_running(&self) {
        self.with(|s| s.initializing = false);
    }

    /// Recover the scheduler from [`TaskState::Error`]. Only the owner
    /// of the mainline loop should call this, after deciding the
    /// bookkeeping fault is understood.
    pub fn reinitialize(&self) {
        self.with(|s| {
            s.task = TaskState::Idle;
            s.rr_cursor = 0;
            s.flags.remove(DriverFlags::NO_ACTIVE_UNDERFLOW);
        });
    }
}

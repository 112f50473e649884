#![no_std]
//! Interrupt-assisted multiplexer for queued serial peripherals.
//!
//! Arbitrates a fixed set of physical serial links (asynchronous and
//! clocked) among cooperative client tasks. Clients request exclusive
//! ownership of a link, queue byte buffers for transmission, and lend a
//! circular buffer for interrupt-driven receive ingestion. A round-robin
//! scheduler, ticked once per mainline cycle, starts the next pending
//! transfer on whichever assigned link is idle; hardware events finish it
//! and re-arm the link for the next queued message.
//!
//! The driver is generic over the register-level hardware interface
//! ([`LinkRegs`]) and the mutex flavour guarding mainline/ISR shared
//! state, so the same code runs on a Cortex-M target (with
//! `CriticalSectionRawMutex`) and under the host test harness.

// Keep this module first so the rest of the crate sees its macros.
pub(crate) mod fmt;

mod drain;
mod hal;
mod instance;
mod isr;
mod message;
mod mux;
mod scheduler;
mod time;

pub use embassy_sync::blocking_mutex::raw::{
    CriticalSectionRawMutex, NoopRawMutex, RawMutex,
};

pub use hal::{BitOrder, IrqLine, LinkEvent, LinkFault, LinkMode, LinkRegs};
pub use instance::{LinkConfig, LinkGrant, LinkId};
pub use message::{
    MsgStatus, Token, MAX_TX_MESSAGE_LEN, STATUS_HOLD_MS, TX_QUEUE_DEPTH,
};
pub use mux::{DriverFlags, RxStatus, SerialMux, DUMMY_BYTE, MAX_ACTIVE_LINKS};
pub use scheduler::TaskState;
pub use time::{elapsed_ms, is_time_up, SystemTick, TickSource};

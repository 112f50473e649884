//! End-to-end driver scenarios against the simulated hardware.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use critical_section as _;
use link_sim::{SimClock, SimLink};
use serial_mux::{
    BitOrder, CriticalSectionRawMutex, DriverFlags, IrqLine, LinkConfig,
    LinkFault, LinkId, LinkMode, MsgStatus, RxStatus, SerialMux, TaskState,
    DUMMY_BYTE, MAX_ACTIVE_LINKS,
};

type TestMux<'b, const N: usize> =
    SerialMux<'b, CriticalSectionRawMutex, SimClock, SimLink, N>;

fn cfg(link: LinkId, mode: LinkMode) -> LinkConfig<'static> {
    LinkConfig {
        link,
        mode,
        bit_order: BitOrder::MsbFirst,
        rx_buffer: None,
        rx_callback: None,
        flow_callback: None,
    }
}

#[test]
fn request_is_exclusive_until_release() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();

    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();
    assert!(link.irq_enabled());
    assert_eq!(link.mode(), Some(LinkMode::Plain));

    assert!(mux.request(cfg(LinkId::new(0), LinkMode::Plain)).is_none());
    assert!(mux.flags().contains(DriverFlags::REQUEST_DENIED));

    mux.release(grant);
    assert!(!link.irq_enabled());
    assert_eq!(link.shutdown_count(), 1);
    assert!(mux.request(cfg(LinkId::new(0), LinkMode::Plain)).is_some());
}

#[test]
fn plain_transfer_runs_to_completion() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();
    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();

    let token = mux.write_data(&grant, &[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(mux.message_status(token), Some(MsgStatus::Queued));

    mux.run_active_state();
    assert_eq!(mux.message_status(token), Some(MsgStatus::Sending));
    assert_eq!(link.pending_block_tx(), Some(vec![1, 2, 3, 4, 5]));
    assert_eq!(mux.active_transfers(), 1);

    assert!(link.complete_block_tx());
    mux.on_interrupt(LinkId::new(0));
    assert_eq!(mux.message_status(token), Some(MsgStatus::Complete));
    assert_eq!(mux.queued_len(&grant), 0);
    assert_eq!(mux.active_transfers(), 0);
    assert_eq!(link.written(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn writes_are_rejected_with_a_reason() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();
    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();

    assert!(mux.write_data(&grant, &[]).is_none());
    assert!(mux.flags().contains(DriverFlags::MSG_REJECTED));
    mux.clear_flags(DriverFlags::MSG_REJECTED);

    let oversize = [0u8; serial_mux::MAX_TX_MESSAGE_LEN + 1];
    assert!(mux.write_data(&grant, &oversize).is_none());
    assert!(mux.flags().contains(DriverFlags::MSG_REJECTED));

    for _ in 0..serial_mux::TX_QUEUE_DEPTH {
        assert!(mux.write_byte(&grant, 0xAA).is_some());
    }
    assert!(mux.write_byte(&grant, 0xBB).is_none());
    assert!(mux.flags().contains(DriverFlags::QUEUE_FULL));
}

#[test]
fn release_abandons_queued_messages() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();

    let mut rx = [0u8; 8];
    let grant = mux
        .request(LinkConfig {
            rx_buffer: Some(&mut rx),
            ..cfg(LinkId::new(0), LinkMode::Plain)
        })
        .unwrap();

    let t1 = mux.write_data(&grant, &[1, 2, 3, 4, 5]).unwrap();
    let t2 = mux.write_data(&grant, &[6, 7, 8]).unwrap();

    let buf = mux.release(grant).expect("lent buffer comes back");
    assert_eq!(buf.len(), 8);
    assert_eq!(mux.message_status(t1), Some(MsgStatus::Abandoned));
    assert_eq!(mux.message_status(t2), Some(MsgStatus::Abandoned));

    let grant = mux
        .request(LinkConfig {
            rx_buffer: Some(buf),
            ..cfg(LinkId::new(0), LinkMode::Plain)
        })
        .expect("released link can be requested again");
    assert_eq!(mux.queued_len(&grant), 0);
    assert_eq!(mux.rx_cursor(&grant), 0);
}

#[test]
fn release_is_safe_mid_flight() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();
    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();

    let token = mux.write_data(&grant, &[1, 2, 3]).unwrap();
    mux.run_active_state();
    assert_eq!(mux.message_status(token), Some(MsgStatus::Sending));

    mux.release(grant);
    assert_eq!(mux.message_status(token), Some(MsgStatus::Abandoned));
    assert_eq!(mux.active_transfers(), 0);

    // The hardware finishes anyway; the stale completion must not
    // resurrect the abandoned message.
    link.complete_block_tx();
    mux.on_interrupt(LinkId::new(0));
    assert_eq!(mux.message_status(token), Some(MsgStatus::Abandoned));
}

#[test]
fn round_robin_services_every_link_once_per_pass() {
    let clock = SimClock::new();
    let links: [SimLink; 2] = [SimLink::new(), SimLink::new()];
    let mux: TestMux<2> = SerialMux::new(&clock, links.clone());
    mux.set_running();

    let g0 = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();
    let g1 = mux.request(cfg(LinkId::new(1), LinkMode::Plain)).unwrap();

    mux.write_data(&g0, &[1, 1]).unwrap();
    mux.write_data(&g0, &[2, 2]).unwrap();
    mux.write_data(&g1, &[3, 3]).unwrap();

    // One full pass: each link starts exactly one transfer, deep queue
    // or not.
    mux.run_active_state();
    mux.run_active_state();
    assert_eq!(links[0].pending_block_tx(), Some(vec![1, 1]));
    assert_eq!(links[1].pending_block_tx(), Some(vec![3, 3]));
    assert_eq!(mux.active_transfers(), 2);

    // Busy links are skipped without stalling the pass.
    mux.run_active_state();
    mux.run_active_state();
    assert_eq!(mux.active_transfers(), 2);
    assert_eq!(mux.queued_len(&g0), 2);

    links[0].complete_block_tx();
    mux.on_interrupt(LinkId::new(0));
    mux.run_active_state();
    assert_eq!(links[0].pending_block_tx(), Some(vec![2, 2]));
}

static FLOW_CALLS: AtomicUsize = AtomicUsize::new(0);

fn flow_cb() {
    FLOW_CALLS.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn flow_control_paces_one_byte_per_interrupt() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();
    let grant = mux
        .request(LinkConfig {
            bit_order: BitOrder::LsbFirst,
            flow_callback: Some(flow_cb),
            ..cfg(LinkId::new(0), LinkMode::FlowControl)
        })
        .unwrap();
    let base = FLOW_CALLS.load(Ordering::Relaxed);

    let token = mux.write_data(&grant, &[0x01, 0x80, 0xFF]).unwrap();
    mux.run_active_state();

    // First byte goes out immediately, bit-reversed, receiver muted.
    assert_eq!(link.written(), vec![0x80]);
    assert_eq!(link.reset_tx_count(), 1);
    assert!(!link.line_unmasked(IrqLine::RxReady));
    assert!(link.line_unmasked(IrqLine::TxReady));
    assert_eq!(FLOW_CALLS.load(Ordering::Relaxed) - base, 1);

    link.pump_tx_ready();
    mux.on_interrupt(LinkId::new(0));
    assert_eq!(link.written(), vec![0x80, 0x01]);

    link.pump_tx_ready();
    mux.on_interrupt(LinkId::new(0));
    assert_eq!(link.written(), vec![0x80, 0x01, 0xFF]);
    assert_eq!(mux.message_status(token), Some(MsgStatus::Sending));

    // Final tx-ready: message settles and the link goes back to a
    // receive-capable idle.
    link.pump_tx_ready();
    mux.on_interrupt(LinkId::new(0));
    assert_eq!(mux.message_status(token), Some(MsgStatus::Complete));
    assert!(!link.line_unmasked(IrqLine::TxReady));
    assert!(link.line_unmasked(IrqLine::RxReady));
    assert_eq!(mux.active_transfers(), 0);
    assert_eq!(FLOW_CALLS.load(Ordering::Relaxed) - base, 4);
}

static RX_COUNT: AtomicUsize = AtomicUsize::new(0);
static RX_LAST: AtomicU8 = AtomicU8::new(0);

fn rx_cb(byte: u8) {
    RX_COUNT.fetch_add(1, Ordering::Relaxed);
    RX_LAST.store(byte, Ordering::Relaxed);
}

#[test]
fn receive_ingestion_wraps_the_ring() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();

    let mut ring = [0u8; 4];
    let grant = mux
        .request(LinkConfig {
            rx_buffer: Some(&mut ring),
            rx_callback: Some(rx_cb),
            ..cfg(LinkId::new(0), LinkMode::Plain)
        })
        .unwrap();
    let base = RX_COUNT.load(Ordering::Relaxed);

    for byte in 10..16 {
        link.push_rx(byte);
    }
    mux.on_interrupt(LinkId::new(0));

    assert_eq!(mux.rx_cursor(&grant), 2);
    mux.with_rx(&grant, |buf, next| {
        assert_eq!(buf, &[14, 15, 12, 13]);
        assert_eq!(next, 2);
    });
    assert_eq!(RX_COUNT.load(Ordering::Relaxed) - base, 6);
    assert_eq!(RX_LAST.load(Ordering::Relaxed), 15);
}

#[test]
fn fault_parks_only_the_faulted_link() {
    let clock = SimClock::new();
    let links: [SimLink; 2] = [SimLink::new(), SimLink::new()];
    let mux: TestMux<2> = SerialMux::new(&clock, links.clone());
    mux.set_running();

    let g0 = mux.request(cfg(LinkId::new(0), LinkMode::Clocked)).unwrap();
    let g1 = mux.request(cfg(LinkId::new(1), LinkMode::Plain)).unwrap();

    let t0 = mux.write_data(&g0, &[0x10, 0x20]).unwrap();
    mux.run_active_state();
    assert_eq!(mux.message_status(t0), Some(MsgStatus::Sending));

    links[0].raise_fault(LinkFault::Nack);
    mux.on_interrupt(LinkId::new(0));
    assert!(mux.link_faulted(&g0));
    assert_eq!(mux.message_status(t0), Some(MsgStatus::Abandoned));
    assert_eq!(mux.active_transfers(), 0);
    assert_eq!(mux.task_state(), TaskState::Idle);

    // The healthy link keeps working.
    let t1 = mux.write_data(&g1, &[0x30]).unwrap();
    mux.run_active_state();
    mux.run_active_state();
    links[1].complete_block_tx();
    mux.on_interrupt(LinkId::new(1));
    assert_eq!(mux.message_status(t1), Some(MsgStatus::Complete));

    // The parked link is skipped by the scheduler until re-requested.
    mux.write_data(&g0, &[0x40]).unwrap();
    mux.run_active_state();
    mux.run_active_state();
    assert_eq!(mux.queued_len(&g0), 1);
    assert_eq!(links[0].pending_block_tx(), Some(vec![0x10, 0x20]));

    mux.release(g0);
    let g0 = mux.request(cfg(LinkId::new(0), LinkMode::Clocked)).unwrap();
    assert!(!mux.link_faulted(&g0));
}

#[test]
fn starvation_guard_flags_excess_active_links() {
    let clock = SimClock::new();
    let links: [SimLink; MAX_ACTIVE_LINKS + 1] =
        core::array::from_fn(|_| SimLink::new());
    let mux: TestMux<{ MAX_ACTIVE_LINKS + 1 }> =
        SerialMux::new(&clock, links.clone());
    mux.set_running();

    let mut grants = Vec::new();
    for i in 0..links.len() {
        let g = mux.request(cfg(LinkId::new(i as u8), LinkMode::Plain)).unwrap();
        mux.write_byte(&g, i as u8).unwrap();
        grants.push(g);
    }
    for _ in 0..links.len() {
        mux.run_active_state();
    }
    assert_eq!(mux.active_transfers() as usize, MAX_ACTIVE_LINKS + 1);
    assert!(mux.flags().contains(DriverFlags::TOO_MANY_LINKS));
}

#[test]
fn boot_writes_drain_synchronously() {
    let clock = SimClock::new();
    let link = SimLink::new();
    link.set_auto_complete(true);
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    // Still initializing: no set_running() here.
    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();

    let t1 = mux.write_data(&grant, b"boot!").unwrap();
    assert_eq!(mux.message_status(t1), Some(MsgStatus::Complete));
    assert_eq!(mux.queued_len(&grant), 0);
    assert_eq!(mux.active_transfers(), 0);
    assert!(!mux.flags().contains(DriverFlags::MANUAL_MODE));
    assert_eq!(link.written(), b"boot!".to_vec());

    // After boot, writes wait for the cooperative loop.
    mux.set_running();
    let t2 = mux.write_data(&grant, &[0x55]).unwrap();
    assert_eq!(mux.message_status(t2), Some(MsgStatus::Queued));
}

#[test]
fn manual_drain_is_a_noop_once_running() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();
    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();

    let token = mux.write_data(&grant, &[1]).unwrap();
    mux.manual_drain();
    assert_eq!(mux.message_status(token), Some(MsgStatus::Queued));
    assert!(!mux.flags().contains(DriverFlags::MANUAL_MODE));
}

#[test]
fn clocked_block_receive_round_trip() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();

    let mut rx = [0u8; 8];
    let grant = mux
        .request(LinkConfig {
            rx_buffer: Some(&mut rx),
            ..cfg(LinkId::new(0), LinkMode::Clocked)
        })
        .unwrap();

    assert_eq!(mux.rx_status(&grant), RxStatus::Empty);
    assert!(!mux.read_data(&grant, 16));
    assert!(mux.flags().contains(DriverFlags::MSG_REJECTED));

    assert!(mux.read_data(&grant, 4));
    assert_eq!(mux.rx_status(&grant), RxStatus::Waiting);
    assert!(!mux.read_data(&grant, 2));

    mux.run_active_state();
    assert_eq!(mux.rx_status(&grant), RxStatus::Receiving);
    assert_eq!(link.pending_block_rx(), Some(4));
    assert_eq!(mux.active_transfers(), 1);
    mux.with_rx(&grant, |buf, _| {
        assert_eq!(&buf[..4], &[DUMMY_BYTE; 4]);
    });

    link.complete_block_rx(&[9, 8, 7, 6]);
    mux.on_interrupt(LinkId::new(0));
    assert_eq!(mux.rx_status(&grant), RxStatus::Complete);
    assert_eq!(mux.rx_status(&grant), RxStatus::Empty);
    mux.with_rx(&grant, |buf, next| {
        assert_eq!(&buf[..4], &[9, 8, 7, 6]);
        assert_eq!(next, 4);
    });
    assert_eq!(mux.active_transfers(), 0);

    // Reads are refused while transmits are pending.
    mux.write_byte(&grant, 0x01).unwrap();
    assert!(!mux.read_data(&grant, 2));
}

#[test]
fn block_receive_is_invalid_on_async_links() {
    let clock = SimClock::new();
    let link = SimLink::new();
    let mux: TestMux<1> = SerialMux::new(&clock, [link.clone()]);
    mux.set_running();
    let grant = mux.request(cfg(LinkId::new(0), LinkMode::Plain)).unwrap();
    assert!(!mux.read_byte(&grant));
    assert_eq!(mux.rx_status(&grant), RxStatus::Invalid);
}

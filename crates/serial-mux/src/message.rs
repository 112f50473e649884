//! Owned per-link transmit FIFO and the token/status bookkeeping that
//! clients use to follow a queued message to completion.

use core::num::NonZeroU32;

use heapless::{Deque, Vec};

use crate::time::elapsed_ms;

/// Largest payload accepted by a single `write_data` call.
pub const MAX_TX_MESSAGE_LEN: usize = 64;

/// Pending messages held per link.
pub const TX_QUEUE_DEPTH: usize = 8;

/// Status records retained at once.
const STATUS_BOARD_DEPTH: usize = 32;

/// How long a finished message's status stays queryable.
pub const STATUS_HOLD_MS: u32 = 10_000;

/// Opaque, non-zero identifier of a queued message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Token(NonZeroU32);

impl Token {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Lifecycle of a queued message. `Complete` and `Abandoned` are
/// terminal; a message reaches exactly one of them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgStatus {
    Queued,
    Sending,
    Complete,
    Abandoned,
}

impl MsgStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MsgStatus::Complete | MsgStatus::Abandoned)
    }
}

pub(crate) struct TxMessage {
    pub token: Token,
    pub data: Vec<u8, MAX_TX_MESSAGE_LEN>,
}

pub(crate) type TxQueue = Deque<TxMessage, TX_QUEUE_DEPTH>;

/// Wrapping token counter; zero is never issued.
pub(crate) struct TokenGen(u32);

impl TokenGen {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> Token {
        loop {
            self.0 = self.0.wrapping_add(1);
            if let Some(n) = NonZeroU32::new(self.0) {
                return Token(n);
            }
        }
    }
}

struct StatusEntry {
    token: Token,
    status: MsgStatus,
    updated_at: u32,
}

/// Bounded record of recent message statuses, queryable by token.
///
/// Terminal records age out after [`STATUS_HOLD_MS`]; when the board is
/// full the oldest terminal record is evicted first.
pub(crate) struct StatusBoard {
    entries: Vec<StatusEntry, STATUS_BOARD_DEPTH>,
}

impl StatusBoard {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Record a freshly queued message.
    pub fn post(&mut self, token: Token, now: u32) {
        if self.entries.is_full() {
            self.evict();
        }
        let _ = self.entries.push(StatusEntry {
            token,
            status: MsgStatus::Queued,
            updated_at: now,
        });
    }

    fn evict(&mut self) {
        if let Some(idx) = self.entries.iter().position(|e| e.status.is_terminal()) {
            self.entries.swap_remove(idx);
        } else {
            warn!("status board full of live messages, dropping oldest");
            self.entries.swap_remove(0);
        }
    }

    /// Transition a message's status. Terminal statuses stick: a second
    /// completion or a completion racing a release is ignored.
    pub fn update(&mut self, token: Token, status: MsgStatus, now: u32) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.token == token) {
            if e.status.is_terminal() {
                warn!("ignoring status change on finished message {}", token.get());
                return;
            }
            e.status = status;
            e.updated_at = now;
        }
    }

    pub fn status(&self, token: Token) -> Option<MsgStatus> {
        self.entries
            .iter()
            .find(|e| e.token == token)
            .map(|e| e.status)
    }

    /// Periodic pump: drop terminal records past their hold time.
    pub fn tick(&mut self, now: u32) {
        let mut i = 0;
        while i < self.entries.len() {
            let e = &self.entries[i];
            if e.status.is_terminal() && elapsed_ms(now, e.updated_at) >= STATUS_HOLD_MS {
                self.entries.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_sequential_and_nonzero() {
        let mut gen = TokenGen::new();
        assert_eq!(gen.next().get(), 1);
        assert_eq!(gen.next().get(), 2);
    }

    #[test]
    fn token_counter_skips_zero_on_wrap() {
        let mut gen = TokenGen(u32::MAX - 1);
        assert_eq!(gen.next().get(), u32::MAX);
        assert_eq!(gen.next().get(), 1);
    }

    #[test]
    fn terminal_status_is_never_overwritten() {
        let mut board = StatusBoard::new();
        let mut gen = TokenGen::new();
        let t = gen.next();
        board.post(t, 0);
        board.update(t, MsgStatus::Sending, 1);
        board.update(t, MsgStatus::Complete, 2);
        board.update(t, MsgStatus::Abandoned, 3);
        assert_eq!(board.status(t), Some(MsgStatus::Complete));
    }

    #[test]
    fn finished_records_age_out() {
        let mut board = StatusBoard::new();
        let mut gen = TokenGen::new();
        let done = gen.next();
        let live = gen.next();
        board.post(done, 0);
        board.post(live, 0);
        board.update(done, MsgStatus::Complete, 100);
        board.tick(100 + STATUS_HOLD_MS);
        assert_eq!(board.status(done), None);
        assert_eq!(board.status(live), Some(MsgStatus::Queued));
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn full_board_evicts_terminal_records_first() {
        let mut board = StatusBoard::new();
        let mut gen = TokenGen::new();
        let first = gen.next();
        board.post(first, 0);
        board.update(first, MsgStatus::Complete, 0);
        let mut live = heapless::Vec::<Token, 64>::new();
        for _ in 1..super::STATUS_BOARD_DEPTH {
            let t = gen.next();
            board.post(t, 0);
            live.push(t).unwrap();
        }
        let overflow = gen.next();
        board.post(overflow, 0);
        assert_eq!(board.status(first), None);
        assert_eq!(board.status(overflow), Some(MsgStatus::Queued));
        for t in &live {
            assert_eq!(board.status(*t), Some(MsgStatus::Queued));
        }
    }
}

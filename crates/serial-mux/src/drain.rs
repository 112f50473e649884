//! Synchronous drain: blocking flush of every queued transfer, for the
//! boot phase only.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::hal::LinkRegs;
use crate::mux::{DriverFlags, SerialMux};
use crate::scheduler::TaskState;
use crate::time::{is_time_up, TickSource};

impl<'b, M: RawMutex, C: TickSource, H: LinkRegs, const N: usize>
    SerialMux<'b, M, C, H, N>
{
    /// Blocking flush of everything queued on every link.
    ///
    /// Boot-only: guarantees early diagnostics are on the wire before
    /// the cooperative loop starts. Once [`set_running`](Self::set_running)
    /// has been called this is a logged no-op, because a blocking loop
    /// in the live mainline would starve every other task.
    ///
    /// Interrupts may not be delivering this early, so each pass polls
    /// the links' status directly before running the scheduler.
    pub fn manual_drain(&self) {
        let proceed = self.with(|s| {
            if s.initializing {
                s.flags |= DriverFlags::MANUAL_MODE;
                true
            } else {
                false
            }
        });
        if !proceed {
            warn!("manual drain ignored outside of boot");
            return;
        }

        loop {
            self.poll_links();
            self.run_active_state();
            self.messaging_tick();

            let done = self.with(|s| {
                let idle = s.active == 0
                    && s
                        .links
                        .iter()
                        .all(|l| l.faulted || (l.tx_queue.is_empty() && l.rx_pending == 0));
                // A parked scheduler will never finish the remaining
                // work; bail out rather than spin forever.
                let done = idle || s.task == TaskState::Error;
                if done {
                    s.flags.remove(DriverFlags::MANUAL_MODE);
                }
                done
            });
            if done {
                break;
            }

            let saved = self.clock.now();
            while !is_time_up(self.clock, saved, 1) {}
        }
    }
}

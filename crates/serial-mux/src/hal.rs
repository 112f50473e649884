//! Register-level interface a board layer implements per physical link.
//!
//! The driver core never touches hardware registers directly; everything
//! below the queueing and scheduling logic funnels through [`LinkRegs`],
//! the way a bus device driver is written against an `embedded-hal` bus.

/// Peripheral interrupt lines the driver masks and unmasks individually.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrqLine {
    /// Transmit register empty, per-byte pacing.
    TxReady,
    /// Block transfer controller finished the outgoing buffer.
    TxDone,
    /// A received byte is available.
    RxReady,
}

/// Hardware condition read back from the link's status register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    TxReady,
    BlockTxDone,
    BlockRxDone,
    RxByte(u8),
    Fault(LinkFault),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkFault {
    /// Acknowledge failure on a clocked link.
    Nack,
    /// Receiver overrun.
    Overrun,
}

/// Transfer style of a link, fixed when the link is requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkMode {
    /// Asynchronous link, whole buffers moved by the block-transfer
    /// controller with one completion event.
    Plain,
    /// Asynchronous link driven one byte per interrupt, paced by a
    /// client flow-control callback.
    FlowControl,
    /// Synchronous (clocked) link; block transfers, and the only mode
    /// that supports single-shot block receives.
    Clocked,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

impl BitOrder {
    /// Wire transform for the per-byte transmit path. Portable stand-in
    /// for the single-cycle bit-reverse instruction.
    pub(crate) fn apply(self, byte: u8) -> u8 {
        match self {
            BitOrder::MsbFirst => byte,
            BitOrder::LsbFirst => byte.reverse_bits(),
        }
    }
}

/// Register block of one physical serial link.
///
/// Contract: after [`configure`](LinkRegs::configure) every interrupt
/// line is masked; the driver unmasks exactly the lines the selected
/// mode needs. [`take_event`](LinkRegs::take_event) is a read-and-clear
/// of the status register and only reports conditions whose line is
/// unmasked, except faults and block-receive completion which always
/// surface.
pub trait LinkRegs {
    /// Program the peripheral for the given mode and enable it.
    fn configure(&mut self, mode: LinkMode, bit_order: BitOrder);

    /// Disable the peripheral after release.
    fn shutdown(&mut self);

    /// Unmask the link's line at the interrupt controller.
    fn irq_enable(&mut self);

    /// Mask the link's line at the interrupt controller and clear any
    /// pending request.
    fn irq_disable(&mut self);

    fn mask(&mut self, line: IrqLine);
    fn unmask(&mut self, line: IrqLine);

    /// Hand a whole buffer to the block-transfer controller.
    fn start_block_tx(&mut self, data: &[u8]);

    /// Arm the block-transfer controller to clock in `len` bytes.
    fn start_block_rx(&mut self, len: usize);

    /// Reset the transmitter before a per-byte transfer; the hardware
    /// may be mid-frame from a previous unmanaged state.
    fn reset_tx(&mut self);

    /// Write one byte into the transmit holding register.
    fn load_tx_byte(&mut self, byte: u8);

    /// Read and clear the next pending condition, if any.
    fn take_event(&mut self) -> Option<LinkEvent>;
}

#[cfg(test)]
mod tests {
    use super::BitOrder;

    #[test]
    fn lsb_first_reverses_bits() {
        assert_eq!(BitOrder::LsbFirst.apply(0x01), 0x80);
        assert_eq!(BitOrder::LsbFirst.apply(0xA5), 0xA5);
        assert_eq!(BitOrder::LsbFirst.apply(0xF0), 0x0F);
        assert_eq!(BitOrder::MsbFirst.apply(0x01), 0x01);
    }
}

use core::convert::Infallible;
use embedded_hal::digital::{ErrorType, OutputPin, PinState};

/// Maximum number of simultaneous connections the module is driven with
/// (`AT+CIPMUX=1` multi-connection mode uses ids `0..MAX_CONNS`).
pub const MAX_CONNS: usize = 6;

/// Longest accepted reply line, terminator stripped. Longer lines are dropped
/// with a diagnostic.
pub const LINE_CAP: usize = 128;

/// Largest inline data frame (`+RECEIVE`/`+IPD`/`+QIURC "recv"`) that is
/// buffered and delivered in one `ConnDataRecv` event.
pub const RECV_CAP: usize = 512;

/// Largest payload accepted by a single send request.
pub const TX_CAP: usize = 1024;

/// Request mailbox depth. A full mailbox makes `Control` return `Error::Busy`.
pub const REQUEST_QUEUE_LEN: usize = 4;

/// Depth of the queue between the line splitter and the sequencer.
pub const LINE_QUEUE_LEN: usize = 8;

pub struct NoPin;

impl ErrorType for NoPin {
    type Error = Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct ReverseOutputPin<P: OutputPin<Error = Infallible>>(pub P);

impl<P: OutputPin<Error = Infallible>> ErrorType for ReverseOutputPin<P> {
    type Error = Infallible;
}

impl<P: OutputPin<Error = Infallible>> OutputPin for ReverseOutputPin<P> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_high()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_low()
    }

    fn set_state(&mut self, state: PinState) -> Result<(), Self::Error> {
        match state {
            PinState::Low => self.0.set_state(PinState::High),
            PinState::High => self.0.set_state(PinState::Low),
        }
    }
}

pub trait ModemConfig {
    type ResetPin: OutputPin;
    type PowerPin: OutputPin;

    const FLOW_CONTROL: bool = false;

    /// Switch the UART to the module's high baudrate (`AT+IPR`) during the
    /// reset bring-up. Requires `set_baudrate` to be implemented.
    const USE_HIGH_BAUDRATE: bool = false;

    fn reset_pin(&mut self) -> Option<&mut Self::ResetPin> {
        None
    }

    fn power_pin(&mut self) -> Option<&mut Self::PowerPin> {
        None
    }

    /// Called after a successful `AT+IPR` exchange; reconfigure the host UART
    /// here. The modem keeps the old rate until this returns.
    fn set_baudrate(&mut self, _baudrate: u32) {}
}

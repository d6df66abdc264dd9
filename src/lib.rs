//! HC32L110 Serial Bootloader.
//!
//! Drives the UART ROM bootloader through reset and handshake, stages the
//! flash loader shim in RAM, then erases, blank checks and programs flash
//! through the shim command set.

use core::fmt;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(feature = "util")]
pub mod image;

pub mod flash;
pub mod pipeline;
pub mod protocol;
mod shim;

pub use flash::{NoProgress, Page, ProgramImage, ProgressCallbacks};
pub use pipeline::{Failure, Job, Layout, Pipeline, State, Step};

use protocol::{HANDSHAKE_ACK, HANDSHAKE_PATTERN};

/// Serial link to the target, with DTR and RTS wired to its reset input
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;

    /// Drop unread input and unsent output
    fn discard_buffers(&mut self) -> Result<(), E>;
}

/// Parse an address given in decimal or `0x` prefixed hex
pub fn parse_address(s: &str) -> Result<u32, core::num::ParseIntError> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Bootloader exchange, used to label protocol failures
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Operation {
    Handshake,
    RamDownload,
    ShimTransfer,
    ChipErase,
    BlankCheck,
    PageWrite,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Handshake => "handshake",
            Operation::RamDownload => "ram download init",
            Operation::ShimTransfer => "shim transfer",
            Operation::ChipErase => "chip erase",
            Operation::BlankCheck => "blank check",
            Operation::PageWrite => "page write",
        };
        f.write_str(name)
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("serial port unavailable: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("timed out waiting for {expected} bytes, got {}: {}", .received.len(), hex::encode(.received))]
    Timeout { expected: usize, received: Vec<u8> },

    #[error("{operation} failed at 0x{address:08x}, got {} bytes: {}", .received.len(), hex::encode(.received))]
    Protocol {
        operation: Operation,
        address: u32,
        received: Vec<u8>,
    },

    #[error("{operation} of {len} bytes does not fit a 16-bit length field")]
    Oversized { operation: Operation, len: usize },

    #[error("{operation} of {len} bytes at 0x{address:08x} runs past the end of the address space")]
    AddressOverflow {
        operation: Operation,
        address: u32,
        len: u64,
    },

    #[error("page size must be non-zero")]
    InvalidPageSize,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub poll_delay_ms: u32,

    /// Period to hold the device in reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub reset_hold_ms: u32,

    /// Period to wait for the bootloader to start after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            poll_delay_ms: 10,
            reset_hold_ms: 10,
            init_delay_ms: 100,
        }
    }
}

/// One open session with the bootloader
pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance over an already configured port
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the serial port
    pub fn close(self) -> P {
        debug!("Closing serial port");
        self.port
    }

    /// Drive both flow control lines, which are wired to the device reset
    pub fn set_reset_line(&mut self, asserted: bool) -> Result<(), Error<E>> {
        self.port.set_dtr(asserted)?;
        self.port.set_rts(asserted)?;
        Ok(())
    }

    pub fn discard_buffers(&mut self) -> Result<(), Error<E>> {
        self.port.discard_buffers()?;
        Ok(())
    }

    /// Blocking write of every byte in `data`
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Read exactly `count` bytes, polling until `timeout_ms` has elapsed
    pub fn read_exact(&mut self, count: usize, timeout_ms: u32) -> Result<Vec<u8>, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut received = Vec::with_capacity(count);
        let mut t = 0;

        loop {
            while received.len() < count {
                match self.port.read() {
                    Ok(v) => received.push(v),
                    Err(nb::Error::WouldBlock) => break,
                    Err(nb::Error::Other(e)) => return Err(e.into()),
                }
            }

            if received.len() == count {
                return Ok(received);
            }

            if t >= timeout_ms {
                error!(
                    "Receive timeout, expected {} bytes, got {}",
                    count,
                    received.len()
                );
                return Err(Error::Timeout {
                    expected: count,
                    received,
                });
            }

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;
        }
    }

    /// Read whatever input is currently buffered, without waiting
    pub fn read_available(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut received = Vec::new();

        loop {
            match self.port.read() {
                Ok(v) => received.push(v),
                Err(nb::Error::WouldBlock) => return Ok(received),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
    }

    /// Reset the device and synchronise with the ROM bootloader
    pub fn handshake(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.set_reset_line(true)?;
        self.delay.delay_ms(self.options.reset_hold_ms);

        // The pattern is clocked in while the device is held in reset
        debug!("Sending handshake pattern");
        self.discard_buffers()?;
        self.write_bytes(&HANDSHAKE_PATTERN)?;

        self.set_reset_line(false)?;
        self.delay.delay_ms(self.options.init_delay_ms);

        debug!("Awaiting bootloader response");
        let response = self.read_exact(1, self.options.response_timeout_ms)?;
        if response[0] != HANDSHAKE_ACK {
            debug!("Received unexpected value: 0x{:02x}", response[0]);
            return Err(Error::Protocol {
                operation: Operation::Handshake,
                address: 0,
                received: response,
            });
        }

        // Drop any banner the bootloader sent after the ack
        self.discard_buffers()?;

        info!("Handshake success");

        Ok(())
    }

    /// Pulse the reset line without expecting a reply
    pub fn reset_pulse(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.set_reset_line(true)?;
        self.delay.delay_ms(self.options.reset_hold_ms);

        self.set_reset_line(false)?;
        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Send a request and read its fixed-length response
    pub(crate) fn transact(
        &mut self,
        request: &[u8],
        response_len: usize,
    ) -> Result<Vec<u8>, Error<E>> {
        // Stale bytes from an earlier timed out exchange must not be taken as the reply
        self.discard_buffers()?;
        self.write_bytes(request)?;

        self.read_exact(response_len, self.options.response_timeout_ms)
    }
}

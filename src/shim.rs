//! Flash loader shim staging.
//!
//! The ROM bootloader only knows how to receive code into RAM and jump to
//! it. The shim is a small loader that, once running, answers the erase,
//! blank check and page write opcodes.

use core::convert::TryFrom;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{
    ram_download_frame, shim_transfer, JUMP_COMMAND, JUMP_RESPONSE_LEN, RAM_ACK,
};
use crate::{Error, Operation, Programmer, SerialPort};

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Download `shim` to RAM at `ram_base` and start executing it
    pub fn load_shim(&mut self, shim: &[u8], ram_base: u32) -> Result<(), Error<E>> {
        let length = u16::try_from(shim.len()).map_err(|_| Error::Oversized {
            operation: Operation::RamDownload,
            len: shim.len(),
        })?;

        info!("Downloading {} byte shim to 0x{:08x}", shim.len(), ram_base);

        let response = self.transact(&ram_download_frame(ram_base, length), 1)?;
        self.expect_ram_ack(Operation::RamDownload, ram_base, response)?;

        debug!("Sending shim payload");
        let response = self.transact(&shim_transfer(shim), 1)?;
        self.expect_ram_ack(Operation::ShimTransfer, ram_base, response)?;

        // Any banner is accepted, only its arrival is required
        debug!("Jumping to 0x{:08x}", ram_base);
        let banner = self.transact(&JUMP_COMMAND, JUMP_RESPONSE_LEN)?;
        debug!("Shim started: {}", hex::encode(&banner));

        info!("Shim running");

        Ok(())
    }

    fn expect_ram_ack(
        &self,
        operation: Operation,
        address: u32,
        response: Vec<u8>,
    ) -> Result<(), Error<E>> {
        if response[0] == RAM_ACK {
            return Ok(());
        }

        debug!("Received unexpected value: 0x{:02x}", response[0]);
        Err(Error::Protocol {
            operation,
            address,
            received: response,
        })
    }
}

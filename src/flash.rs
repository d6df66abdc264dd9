//! Flash erase, blank check and programming through the shim.

use core::convert::TryFrom;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{
    blank_check_frame, chip_erase_frame, validate_response_frame, write_page_frame,
    BlankCheckStatus, BLANK_CHECK_RESPONSE_LEN, FRAME_RESPONSE_LEN,
};
use crate::{Error, Operation, Programmer, SerialPort};

/// Code to be programmed, with the address of its first byte
#[derive(Clone, PartialEq, Debug)]
pub struct ProgramImage {
    pub load_address: u32,
    pub data: Vec<u8>,
}

/// A run of image bytes written by a single page write
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Page<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

impl ProgramImage {
    pub fn new(load_address: u32, data: Vec<u8>) -> Self {
        Self { load_address, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address of the last image byte, or `None` if the image runs past the
    /// end of the 32-bit address space
    pub fn last_address(&self) -> Option<u32> {
        last_address(self.load_address, self.data.len() as u64)
    }

    /// Split the image into consecutive pages of at most `page_size` bytes
    ///
    /// Only the last page may be shorter than `page_size`. A zero page size
    /// yields no pages, and page addresses wrap unless [`last_address`]
    /// succeeds.
    ///
    /// [`last_address`]: ProgramImage::last_address
    pub fn pages(&self, page_size: u16) -> impl Iterator<Item = Page<'_>> + '_ {
        let load_address = self.load_address;
        let data = match page_size {
            0 => &[][..],
            _ => &self.data[..],
        };

        data.chunks(page_size.max(1) as usize)
            .enumerate()
            .map(move |(i, data)| Page {
                address: load_address.wrapping_add((i * page_size as usize) as u32),
                data,
            })
    }

    /// Number of pages [`pages`] yields for `page_size`
    ///
    /// [`pages`]: ProgramImage::pages
    pub fn page_count(&self, page_size: u16) -> usize {
        match page_size as usize {
            0 => 0,
            page_size => (self.data.len() + page_size - 1) / page_size,
        }
    }
}

/// Address of the last of `len` bytes from `start`, if it is addressable
fn last_address(start: u32, len: u64) -> Option<u32> {
    match len {
        0 => Some(start),
        _ => u32::try_from(start as u64 + len - 1).ok(),
    }
}

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Progress sink that reports nothing
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _addr: u32, _total: usize) {}

    fn update(&mut self, _current: usize) {}

    fn finish(&mut self) {}
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Erase the whole flash array
    pub fn chip_erase(&mut self) -> Result<(), Error<E>> {
        info!("Starting chip erase");

        let response = self.transact(&chip_erase_frame(), FRAME_RESPONSE_LEN)?;
        if let Err(e) = validate_response_frame(&response, FRAME_RESPONSE_LEN) {
            debug!("Invalid chip erase response: {}", e);
            return Err(Error::Protocol {
                operation: Operation::ChipErase,
                address: 0,
                received: response,
            });
        }

        info!("Completed chip erase");

        Ok(())
    }

    /// Check that `page_count` windows of `page_size` bytes from `start` are erased
    pub fn blank_check(
        &mut self,
        start: u32,
        page_size: u16,
        page_count: u32,
    ) -> Result<(), Error<E>> {
        info!(
            "Starting blank check of {} x {} bytes at 0x{:08x}",
            page_count, page_size, start
        );

        let len = page_size as u64 * page_count as u64;
        if last_address(start, len).is_none() {
            return Err(Error::AddressOverflow {
                operation: Operation::BlankCheck,
                address: start,
                len,
            });
        }

        for i in 0..page_count {
            let address = start + i * page_size as u32;
            self.blank_check_segment(address, page_size)?;
        }

        info!("Completed blank check");

        Ok(())
    }

    fn blank_check_segment(&mut self, address: u32, length: u16) -> Result<(), Error<E>> {
        debug!("Checking that 0x{:08x}:{} is blank", address, length);

        let request = blank_check_frame(address, length);
        let response = self.transact(&request, BLANK_CHECK_RESPONSE_LEN)?;
        match BlankCheckStatus::parse(&response) {
            Ok(status) if status.is_ok() => return Ok(()),
            Ok(status) => debug!(
                "Segment not blank (flag {}, error {})",
                status.blank, status.error
            ),
            Err(e) => debug!("Invalid blank check response: {}", e),
        }

        Err(Error::Protocol {
            operation: Operation::BlankCheck,
            address,
            received: response,
        })
    }

    /// Program `image` in pages of `page_size` bytes, in ascending address order
    pub fn write_image(
        &mut self,
        image: &ProgramImage,
        page_size: u16,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error<E>> {
        if page_size == 0 {
            return Err(Error::InvalidPageSize);
        }
        if image.last_address().is_none() {
            return Err(Error::AddressOverflow {
                operation: Operation::PageWrite,
                address: image.load_address,
                len: image.len() as u64,
            });
        }

        let page_count = image.page_count(page_size);
        info!(
            "Writing {} bytes at 0x{:08x} ({} pages)",
            image.len(),
            image.load_address,
            page_count
        );

        progress.init(image.load_address, page_count);

        for (i, page) in image.pages(page_size).enumerate() {
            self.write_page(page.address, page.data)?;
            progress.update(i + 1);
        }

        progress.finish();

        Ok(())
    }

    /// Program a single page of flash
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.len() > u16::MAX as usize {
            return Err(Error::Oversized {
                operation: Operation::PageWrite,
                len: data.len(),
            });
        }

        debug!("Writing {} bytes at 0x{:08x}", data.len(), address);

        let response = self.transact(&write_page_frame(address, data), FRAME_RESPONSE_LEN)?;
        if let Err(e) = validate_response_frame(&response, FRAME_RESPONSE_LEN) {
            debug!("Invalid page write response: {}", e);
            return Err(Error::Protocol {
                operation: Operation::PageWrite,
                address,
                received: response,
            });
        }

        Ok(())
    }
}

//! HC32L110 UART bootloader framing.
//!
//! Command and response frames start with [`FRAME_HEADER`] and end with an
//! additive 8-bit checksum over every preceding byte. The handshake pattern,
//! the shim payload and the jump command are sent raw.

/// Sync byte leading every command and response frame
pub const FRAME_HEADER: u8 = 0x49;

/// Pattern clocked into the ROM bootloader while it comes out of reset
pub const HANDSHAKE_PATTERN: [u8; 20] = [
    0x18, 0xFF, 0x18, 0xFF, 0x18, 0xFF, 0x18, 0xFF, 0x18, 0xFF,
    0x18, 0xFF, 0x18, 0xFF, 0x18, 0xFF, 0x18, 0xFF, 0x18, 0xFF,
];

/// Reply to the handshake pattern
pub const HANDSHAKE_ACK: u8 = 0x11;

/// Reply to the RAM download init frame and the shim transfer
pub const RAM_ACK: u8 = 0x01;

/// Starts execution of the code previously downloaded to RAM
pub const JUMP_COMMAND: [u8; 10] = [0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0];

/// Banner length sent by the shim once it is running
pub const JUMP_RESPONSE_LEN: usize = 11;

/// Response length for chip erase and page write
pub const FRAME_RESPONSE_LEN: usize = 9;

/// Response length for a blank check segment query
pub const BLANK_CHECK_RESPONSE_LEN: usize = 10;

/// Start of on-chip SRAM, where the shim is loaded and executed
pub const RAM_BASE_ADDRESS: u32 = 0x2000_0000;

/// Start of on-chip flash
pub const FLASH_BASE_ADDRESS: u32 = 0x0000_0000;

/// Page size used for program writes
pub const WRITE_PAGE_SIZE: u16 = 64;

/// Window size used for blank checks
pub const BLANK_CHECK_PAGE_SIZE: u16 = 512;

/// Number of blank check windows covering the whole flash
pub const BLANK_CHECK_PAGE_COUNT: u32 = 64;

/// Fixed field preceding the length in a blank check query
const BLANK_CHECK_FIELDS: [u8; 2] = [0x04, 0x00];

/// Byte offsets within a blank check response
const BLANK_FLAG_INDEX: usize = 6;
const BLANK_ERROR_INDEX: usize = 7;

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Opcode {
    /// Announces a download of `length` bytes to RAM at `address` (ROM bootloader)
    RamDownload = 0x00,

    /// Erases the entire flash array (shim)
    ChipErase = 0x02,

    /// Programs up to one page of flash (shim)
    WritePage = 0x04,

    /// Checks that a flash window reads as erased (shim)
    BlankCheck = 0x07,
}

/// Reasons a response frame is rejected
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("bad header 0x{0:02x}")]
    Header(u8),
    #[error("checksum mismatch, computed 0x{computed:02x} received 0x{received:02x}")]
    Checksum { computed: u8, received: u8 },
}

/// Additive 8-bit checksum, wrapping on overflow
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Append the checksum of `data` as a trailing byte
pub fn append_checksum8(mut data: Vec<u8>) -> Vec<u8> {
    let sum = checksum8(&data);
    data.push(sum);
    data
}

/// Build a checksummed command frame
pub fn command_frame(opcode: Opcode, address: u32, fields: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + 4 + fields.len() + payload.len() + 1);

    frame.push(FRAME_HEADER);
    frame.push(opcode as u8);
    frame.extend_from_slice(&address.to_le_bytes());
    frame.extend_from_slice(fields);
    frame.extend_from_slice(payload);

    append_checksum8(frame)
}

pub fn ram_download_frame(address: u32, length: u16) -> Vec<u8> {
    command_frame(Opcode::RamDownload, address, &length.to_le_bytes(), &[])
}

/// Header-less shim transfer, terminated by its checksum only
pub fn shim_transfer(shim: &[u8]) -> Vec<u8> {
    append_checksum8(shim.to_vec())
}

pub fn chip_erase_frame() -> Vec<u8> {
    command_frame(Opcode::ChipErase, 0, &[0x00, 0x00], &[])
}

/// Page write frame, `data` must fit in a u16 length field
pub fn write_page_frame(address: u32, data: &[u8]) -> Vec<u8> {
    let length = data.len() as u16;
    command_frame(Opcode::WritePage, address, &length.to_le_bytes(), data)
}

pub fn blank_check_frame(address: u32, length: u16) -> Vec<u8> {
    let mut fields = [0u8; 4];
    fields[..2].copy_from_slice(&BLANK_CHECK_FIELDS);
    fields[2..].copy_from_slice(&length.to_le_bytes());

    command_frame(Opcode::BlankCheck, address, &fields, &[])
}

/// Check length, header and checksum trailer of a response
pub fn validate_response_frame(bytes: &[u8], expected_len: usize) -> Result<(), FrameError> {
    if bytes.len() != expected_len || bytes.is_empty() {
        return Err(FrameError::Length {
            expected: expected_len,
            actual: bytes.len(),
        });
    }

    if bytes[0] != FRAME_HEADER {
        return Err(FrameError::Header(bytes[0]));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 1);
    let computed = checksum8(body);
    if computed != trailer[0] {
        return Err(FrameError::Checksum {
            computed,
            received: trailer[0],
        });
    }

    Ok(())
}

/// Result of a blank check segment query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlankCheckStatus {
    pub blank: bool,
    pub error: u8,
}

impl BlankCheckStatus {
    /// Parse a validated blank check response
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        validate_response_frame(bytes, BLANK_CHECK_RESPONSE_LEN)?;

        Ok(Self {
            blank: bytes[BLANK_FLAG_INDEX] == 1,
            error: bytes[BLANK_ERROR_INDEX],
        })
    }

    pub fn is_ok(&self) -> bool {
        self.blank && self.error == 0
    }
}

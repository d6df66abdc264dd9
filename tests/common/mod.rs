//! Simulated HC32L110 bootloader for exercising the programmer without hardware.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use hc32_uart_loader::protocol::{
    append_checksum8, FRAME_HEADER, HANDSHAKE_ACK, HANDSHAKE_PATTERN, JUMP_COMMAND,
    JUMP_RESPONSE_LEN, RAM_ACK,
};
use hc32_uart_loader::{Options, Programmer, SerialPort};

#[derive(Debug, Clone, PartialEq)]
pub struct SimError;

/// Something that happened on the simulated link
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Dtr(bool),
    Rts(bool),
    Discard,
    Request(Vec<u8>),
    Delay(u32),
}

/// Device reply to one request
pub struct Reply {
    /// Number of polls answered with nothing before the reply arrives
    pub stall: usize,
    pub bytes: Vec<u8>,
}

impl Reply {
    pub fn now(bytes: Vec<u8>) -> Self {
        Self { stall: 0, bytes }
    }

    pub fn silent() -> Self {
        Self::now(vec![])
    }
}

#[derive(Default)]
pub struct Wire {
    pub events: Vec<Event>,
    pub closed: bool,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    stall: usize,
}

impl Wire {
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Request(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Framed requests carrying `opcode`
    pub fn frames(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.requests()
            .into_iter()
            .filter(|r| r.len() >= 2 && r[0] == FRAME_HEADER && r[1] == opcode)
            .collect()
    }

    pub fn total_delay(&self) -> u32 {
        self.events
            .iter()
            .map(|e| match e {
                Event::Delay(ms) => *ms,
                _ => 0,
            })
            .sum()
    }
}

pub type Responder = Box<dyn FnMut(&[u8]) -> Reply>;

pub struct SimPort {
    wire: Rc<RefCell<Wire>>,
    responder: Responder,
}

impl Write<u8> for SimPort {
    type Error = SimError;

    fn write(&mut self, word: u8) -> nb::Result<(), SimError> {
        self.wire.borrow_mut().pending.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), SimError> {
        let request = std::mem::take(&mut self.wire.borrow_mut().pending);
        if request.is_empty() {
            return Ok(());
        }

        let reply = (self.responder)(&request);

        let mut wire = self.wire.borrow_mut();
        wire.events.push(Event::Request(request));
        wire.stall = reply.stall;
        wire.rx.extend(reply.bytes);

        Ok(())
    }
}

impl Read<u8> for SimPort {
    type Error = SimError;

    fn read(&mut self) -> nb::Result<u8, SimError> {
        let mut wire = self.wire.borrow_mut();
        if wire.stall > 0 {
            wire.stall -= 1;
            return Err(nb::Error::WouldBlock);
        }
        wire.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<SimError> for SimPort {
    fn set_rts(&mut self, level: bool) -> Result<(), SimError> {
        self.wire.borrow_mut().events.push(Event::Rts(level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SimError> {
        self.wire.borrow_mut().events.push(Event::Dtr(level));
        Ok(())
    }

    fn discard_buffers(&mut self) -> Result<(), SimError> {
        let mut wire = self.wire.borrow_mut();
        wire.rx.clear();
        wire.pending.clear();
        wire.stall = 0;
        wire.events.push(Event::Discard);
        Ok(())
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        self.wire.borrow_mut().closed = true;
    }
}

pub struct SimDelay {
    wire: Rc<RefCell<Wire>>,
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.wire.borrow_mut().events.push(Event::Delay(ms));
    }
}

pub type SimProgrammer = Programmer<SimPort, SimDelay, SimError>;

/// Build a programmer wired to `responder`, plus a handle on the link
pub fn programmer(responder: Responder) -> (SimProgrammer, Rc<RefCell<Wire>>) {
    let wire = Rc::new(RefCell::new(Wire::default()));

    let port = SimPort {
        wire: wire.clone(),
        responder,
    };
    let delay = SimDelay { wire: wire.clone() };

    (Programmer::new(port, delay, Options::default()), wire)
}

/// 8 byte echo of a request head with a checksum trailer
pub fn echo(request: &[u8]) -> Vec<u8> {
    append_checksum8(request[..8].to_vec())
}

pub fn blank_reply(request: &[u8], blank: u8, error: u8) -> Vec<u8> {
    let mut reply = vec![FRAME_HEADER, request[1]];
    reply.extend_from_slice(&request[2..6]);
    reply.extend_from_slice(&[blank, error, 0x00]);
    append_checksum8(reply)
}

pub fn banner() -> Vec<u8> {
    (0..JUMP_RESPONSE_LEN as u8).collect()
}

/// A well behaved device: the ROM bootloader, then the shim once started
pub fn hc32() -> Responder {
    let mut expect_shim = false;

    Box::new(move |request: &[u8]| {
        if expect_shim {
            expect_shim = false;
            return Reply::now(vec![RAM_ACK]);
        }

        if request == &HANDSHAKE_PATTERN[..] {
            return Reply::now(vec![HANDSHAKE_ACK]);
        }

        if request == &JUMP_COMMAND[..] {
            return Reply::now(banner());
        }

        if request.len() < 8 || request[0] != FRAME_HEADER {
            return Reply::silent();
        }

        match request[1] {
            0x00 => {
                expect_shim = true;
                Reply::now(vec![RAM_ACK])
            }
            0x02 | 0x04 => Reply::now(echo(request)),
            0x07 => Reply::now(blank_reply(request, 1, 0)),
            _ => Reply::silent(),
        }
    })
}

/// Wrap `inner`, letting `patch` rewrite replies
pub fn patched<F>(mut inner: Responder, mut patch: F) -> Responder
where
    F: FnMut(&[u8], Reply) -> Reply + 'static,
{
    Box::new(move |request: &[u8]| {
        let reply = inner(request);
        patch(request, reply)
    })
}

pub fn is_frame(request: &[u8], opcode: u8) -> bool {
    request.len() >= 2 && request[0] == FRAME_HEADER && request[1] == opcode
}

pub fn frame_address(frame: &[u8]) -> u32 {
    u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]])
}

/// Payload of a page write frame
pub fn page_data(frame: &[u8]) -> &[u8] {
    &frame[8..frame.len() - 1]
}

pub fn shim() -> Vec<u8> {
    vec![0xA5; 48]
}

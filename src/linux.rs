use std::io::ErrorKind as IoErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Error, Options, Programmer, SerialPort};

fn kind(e: SerialError) -> IoErrorKind {
    std::io::Error::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(kind)
    }

    fn discard_buffers(&mut self) -> Result<(), IoErrorKind> {
        let res = unsafe { libc::tcflush(self.0.as_raw_fd(), libc::TCIOFLUSH) };
        if res != 0 {
            return Err(std::io::Error::last_os_error().kind());
        }
        Ok(())
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Open a linux serial port at `baud`, 8N1 without flow control
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, Error<IoErrorKind>> {
        debug!("Opening {} at {} baud", port.as_ref().display(), baud);

        // Open port
        let mut port = Serial::open(port.as_ref()).map_err(|e| Error::Io(kind(e)))?;

        // Apply settings
        let mut settings = port.0.read_settings().map_err(|e| Error::Io(kind(e)))?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings
            .set_baud_rate(BaudRate::from_speed(baud))
            .map_err(|e| Error::Io(kind(e)))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0
            .write_settings(&settings)
            .map_err(|e| Error::Io(kind(e)))?;

        // Reads return immediately so the programmer can poll against its own deadline
        port.0
            .set_timeout(Duration::from_millis(0))
            .map_err(|e| Error::Io(kind(e)))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

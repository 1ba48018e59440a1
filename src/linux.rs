use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

impl SerialPort<std::io::ErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), std::io::ErrorKind> {
        self.0.set_rts(level).map_err(|_| IoErrorKind::Other)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), std::io::ErrorKind> {
        self.0.set_dtr(level).map_err(|_| IoErrorKind::Other)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a programmer attached to a linux serial device.
    ///
    /// The Arduino bridge talks 8N1; the baud rate is configuration, not
    /// protocol, but both ends must agree (the firmware defaults to 115200).
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

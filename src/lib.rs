//! AT28C256 EEPROM programmer.
//!
//! Speaks the length-prefixed, ack-per-chunk serial protocol of the Arduino
//! bridge firmware: single-byte reads and writes, bulk dump/load transfers
//! of the 32K address space and a round-trip self test.

use core::marker::PhantomData;
use std::io;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

pub mod protocol;
pub use crate::protocol::{Command, MAX_PAYLOAD, ROM_SIZE};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

/// Characters used for self test payloads: mostly letters with enough
/// whitespace to keep a textual diff of a failed run readable.
const TEST_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ          \n";

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    /// Underlying serial port failure.
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    /// The device did not produce a byte within the response timeout. The
    /// session is in an unknown state; reset or reconnect before retrying.
    #[error("timed out waiting for a response from the device")]
    ResponseTimeout,

    /// Caller handed the frame codec a payload over [`MAX_PAYLOAD`] bytes.
    #[error("frame payload exceeds {} bytes", MAX_PAYLOAD)]
    PayloadTooLarge,

    /// Address or transfer size outside the 32K address space.
    #[error("address or size outside the {} byte address space", ROM_SIZE)]
    OutOfRange,

    /// A non-empty frame arrived where an empty ack was required. The
    /// protocol is desynchronized; fatal to the session.
    #[error("expected an empty ack frame, received {0} bytes")]
    UnexpectedAck(usize),

    /// The device replied with a frame of unexpected shape.
    #[error("malformed response from the device")]
    InvalidResponse,

    /// Failure on the local source/sink of a bulk transfer.
    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl<SerialError: core::fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for device responses (EEPROM write cycles are slow)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for device responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for the bridge firmware to boot after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 30_000,
            poll_delay_ms: 1,
            init_delay_ms: 2_000,
        }
    }
}

/// Phase of a running self test, reported alongside the byte count.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum TestPhase {
    Load,
    Dump,
}

/// Result of a completed self test. On a mismatch both buffers are handed
/// back intact so they can be written out and diffed offline.
#[derive(Clone, PartialEq, Debug)]
pub enum TestOutcome {
    Match,
    Mismatch { sent: Vec<u8>, received: Vec<u8> },
}

/// A programming session against one EEPROM bridge.
///
/// Owns the serial port exclusively for its lifetime. The protocol is
/// strictly half duplex with one operation in flight at a time, which the
/// `&mut self` receivers enforce at compile time.
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
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Consume the session and hand back the serial port.
    pub fn release(self) -> P {
        self.port
    }

    /// Reset the bridge and wait for its firmware to come up.
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            debug!("Resetting device");

            self.port.set_dtr(true)?;
            self.port.set_rts(true)?;

            self.delay.delay_ms(100u32);

            self.port.set_dtr(false)?;
            self.port.set_rts(false)?;
        }

        // The Arduino also auto-resets when the port is opened, so the boot
        // delay applies even with --no-reset.
        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Reads the byte at `addr`.
    pub fn read_byte(&mut self, addr: u16) -> Result<u8, Error<E>> {
        Self::check_addr(addr)?;

        self.send_frame(&Command::Read { addr }.encode())?;

        let resp = self.recv_frame()?;
        if resp.len() != 1 {
            error!("Expected a 1 byte value, received {} bytes", resp.len());
            return Err(Error::InvalidResponse);
        }

        Ok(resp[0])
    }

    /// Writes `value` to `addr`, blocking until the device has completed
    /// the EEPROM write cycle and acknowledged.
    pub fn write_byte(&mut self, addr: u16, value: u8) -> Result<(), Error<E>> {
        Self::check_addr(addr)?;

        self.send_and_ack(&Command::Write { addr, value }.encode())
    }

    /// Sends a reset command. Fire-and-forget: the device does not reply.
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.send_frame(&Command::Reset.encode())
    }

    /// Streams the first `size` bytes of the ROM into `sink`.
    ///
    /// Each received chunk is acknowledged with an empty frame before the
    /// device sends the next one. `progress` observes the running byte
    /// count after every chunk; dump progress is conventionally scaled
    /// against the full [`ROM_SIZE`] regardless of `size`.
    ///
    /// The device always streams the full ROM. For a partial dump the
    /// stream is cut short with a reset once `size` bytes have arrived,
    /// and the one chunk the device already has in flight is drained.
    /// Skipping that drain would desynchronize every later command.
    pub fn dump_to<W, F>(
        &mut self,
        sink: &mut W,
        size: usize,
        mut progress: F,
    ) -> Result<usize, Error<E>>
    where
        W: io::Write,
        F: FnMut(usize),
    {
        if size > ROM_SIZE {
            return Err(Error::OutOfRange);
        }

        debug!("Dumping {} bytes", size);
        self.send_frame(&Command::Dump.encode())?;

        let mut transferred = 0;
        while transferred < size {
            let chunk = self.recv_frame()?;
            if chunk.is_empty() {
                return Err(Error::InvalidResponse);
            }
            // grant the device permission to send the next chunk
            self.send_frame(&[])?;

            let take = chunk.len().min(size - transferred);
            sink.write_all(&chunk[..take])
                .map_err(|e| Error::Io(e.kind()))?;
            transferred += take;

            progress(transferred);
        }

        if size < ROM_SIZE {
            self.reset()?;
            self.recv_frame()?;
        }

        debug!("Dump complete");
        Ok(transferred)
    }

    /// Streams up to `size` bytes from `source` into the ROM, starting at
    /// address 0.
    ///
    /// The load command and every chunk are individually acknowledged: the
    /// device only accepts the next chunk once it has finished the slow
    /// byte-by-byte EEPROM writes for the current one, so each ack is the
    /// backpressure point. Returns the number of bytes sent, which falls
    /// short of `size` if `source` runs out first.
    pub fn load_from<R, F>(
        &mut self,
        source: &mut R,
        size: usize,
        mut progress: F,
    ) -> Result<usize, Error<E>>
    where
        R: io::Read,
        F: FnMut(usize),
    {
        if size > ROM_SIZE {
            return Err(Error::OutOfRange);
        }

        debug!("Loading {} bytes", size);
        self.send_and_ack(&Command::Load { size: size as u16 }.encode())?;

        let mut chunk = [0u8; MAX_PAYLOAD];
        let mut transferred = 0;
        while transferred < size {
            let want = MAX_PAYLOAD.min(size - transferred);
            let n = source
                .read(&mut chunk[..want])
                .map_err(|e| Error::Io(e.kind()))?;
            if n == 0 {
                break;
            }

            self.send_and_ack(&chunk[..n])?;
            transferred += n;

            progress(transferred);
        }

        debug!("Load complete ({} bytes)", transferred);
        Ok(transferred)
    }

    /// Round-trip test: loads `size` bytes of pseudo-random ASCII into the
    /// EEPROM, dumps them back and compares byte for byte.
    pub fn self_test<F>(&mut self, size: usize, mut progress: F) -> Result<TestOutcome, Error<E>>
    where
        F: FnMut(TestPhase, usize),
    {
        use rand::Rng;

        if size > ROM_SIZE {
            return Err(Error::OutOfRange);
        }

        let mut rng = rand::thread_rng();
        let sent: Vec<u8> = (0..size)
            .map(|_| TEST_ALPHABET[rng.gen_range(0..TEST_ALPHABET.len())])
            .collect();

        self.load_from(&mut io::Cursor::new(&sent), size, |n| {
            progress(TestPhase::Load, n)
        })?;

        let mut received = Vec::with_capacity(size);
        self.dump_to(&mut received, size, |n| progress(TestPhase::Dump, n))?;

        if sent == received {
            info!("Self test passed, {} bytes verified", size);
            Ok(TestOutcome::Match)
        } else {
            error!("Self test failed");
            Ok(TestOutcome::Mismatch { sent, received })
        }
    }

    fn check_addr(addr: u16) -> Result<(), Error<E>> {
        if (addr as usize) < ROM_SIZE {
            Ok(())
        } else {
            Err(Error::OutOfRange)
        }
    }

    /// Wraps `payload` in a length header and transmits it as one frame.
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), Error<E>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }

        block!(self.port.write(payload.len() as u8))?;
        for b in payload {
            block!(self.port.write(*b))?;
        }

        Ok(())
    }

    /// Reads one frame: a length octet followed by that many bytes. Every
    /// byte is bounded by the response timeout; a frame that stalls short
    /// of its declared length is a fatal transport fault.
    fn recv_frame(&mut self) -> Result<Vec<u8>, Error<E>> {
        let len = self.recv_byte()? as usize;

        let mut payload = Vec::with_capacity(len);
        for _ in 0..len {
            payload.push(self.recv_byte()?);
        }

        Ok(payload)
    }

    /// Sends a frame and requires an empty ack frame in response.
    fn send_and_ack(&mut self, payload: &[u8]) -> Result<(), Error<E>> {
        self.send_frame(payload)?;

        let ack = self.recv_frame()?;
        if !ack.is_empty() {
            error!("Expected empty ack, received {} bytes", ack.len());
            return Err(Error::UnexpectedAck(ack.len()));
        }

        Ok(())
    }

    fn recv_byte(&mut self) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms;

            if t > self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}

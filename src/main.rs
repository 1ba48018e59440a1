#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use at28c256_uart_loader::{Options, Programmer, TestOutcome, TestPhase, ROM_SIZE};

type Session = Programmer<Serial, Delay, io::ErrorKind>;

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "at28c256", about = "AT28C256 EEPROM programmer")]
pub struct Args {
    /// Serial port the Arduino bridge is connected to
    #[structopt(long, short, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Command to run; opens an interactive session when omitted
    #[structopt(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Clone, Debug, StructOpt)]
enum Cmd {
    /// Read a single byte
    Read { addr: String },

    /// Write a single byte
    Write { addr: String, value: String },

    /// Dump EEPROM contents to a file, or to stdout if no file is given
    Dump {
        /// Only dump the first n bytes
        #[structopt(long, short, default_value = "32768")]
        size: usize,

        file: Option<PathBuf>,
    },

    /// Load a local file (or stdin) into the EEPROM
    Load { file: Option<PathBuf> },

    /// Write random data to the EEPROM and read it back for verification
    Test {
        /// Number of bytes of test data
        #[structopt(long, short, default_value = "32768")]
        size: usize,
    },

    /// Send a reset command
    Reset,
}

const USAGE: &str = "AT28C256 EEPROM Programmer

Read or write individual addresses, dump out the full contents to a file, or
load an image file onto the EEPROM.

To read a single byte:
> [r|read] [addr]

To write a byte to a specific address:
> [w|write] [addr] [value]

To dump the entire EEPROM to a file:
> [d|dump] [filename]

To load a local file into the EEPROM:
> [l|load] [filename]

To run a write/read-back self test:
> [t|test] [size]

Send a reset command:
> reset

Address supports hex (0xFF) and octal (0o7) notation.
";

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let args = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(args.log_level, Config::default());

    info!("Connecting to serial port {}", args.port);

    let mut p = Programmer::linux(&args.port, args.baud, args.options.clone())
        .map_err(|e| anyhow!("error opening serial port: {}", e))?;

    info!("Waiting for the bridge firmware to boot");
    p.init()?;

    match &args.cmd {
        Some(cmd) => run_command(&mut p, cmd),
        None => repl(&mut p),
    }
}

fn run_command(p: &mut Session, cmd: &Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Read { addr } => {
            let addr = parse_addr(addr)?;
            let value = p.read_byte(addr)?;
            println!("{} / 0x{:02x}", value, value);
        }

        Cmd::Write { addr, value } => {
            let addr = parse_addr(addr)?;
            let value = u8::try_from(parse_num(value)?)
                .map_err(|_| anyhow!("value must fit a single byte"))?;
            p.write_byte(addr, value)?;
            println!("OK");
        }

        Cmd::Dump { size, file } => match file {
            Some(path) => {
                let mut f = File::create(path)
                    .with_context(|| format!("cannot create {}", path.display()))?;
                // dump progress is scaled against the full ROM regardless
                // of the requested size
                let pb = progress_bar(ROM_SIZE);
                p.dump_to(&mut f, *size, |n| pb.set_position(n as u64))?;
                pb.finish();
            }
            None => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                p.dump_to(&mut out, *size, |_| {})?;
                out.flush()?;
            }
        },

        Cmd::Load { file } => {
            let data = match file {
                Some(path) => std::fs::read(path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().lock().read_to_end(&mut buf)?;
                    buf
                }
            };

            let size = data.len().min(ROM_SIZE);
            println!("Loading {} bytes into EEPROM...", size);

            let pb = progress_bar(size);
            p.load_from(&mut io::Cursor::new(&data[..size]), size, |n| {
                pb.set_position(n as u64)
            })?;
            pb.finish();
        }

        Cmd::Test { size } => run_test(p, *size)?,

        Cmd::Reset => p.reset()?,
    }

    Ok(())
}

fn run_test(p: &mut Session, size: usize) -> anyhow::Result<()> {
    println!("Writing and verifying {} bytes of random data...", size);

    // one bar across both phases: load first, then the read back
    let pb = progress_bar(size * 2);
    let outcome = p.self_test(size, |phase, n| {
        let base = match phase {
            TestPhase::Load => 0,
            TestPhase::Dump => size,
        };
        pb.set_position((base + n) as u64);
    })?;
    pb.finish();

    match outcome {
        TestOutcome::Match => {
            println!("OK");
            Ok(())
        }
        TestOutcome::Mismatch { sent, received } => {
            let offset = sent
                .iter()
                .zip(received.iter())
                .position(|(a, b)| a != b)
                .unwrap_or_else(|| sent.len().min(received.len()));

            std::fs::write("eeprom-test-local.bin", &sent)?;
            std::fs::write("eeprom-test-remote.bin", &received)?;

            error!(
                "First difference at 0x{:04x}: wrote {}, read back {}",
                offset,
                hex::encode(&sent[offset..sent.len().min(offset + 8)]),
                hex::encode(&received[offset..received.len().min(offset + 8)]),
            );
            bail!("self test failed; buffers saved to eeprom-test-local.bin / eeprom-test-remote.bin");
        }
    }
}

fn repl(p: &mut Session) -> anyhow::Result<()> {
    println!("{}", USAGE);

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF ends the session
            return Ok(());
        }
        let words: Vec<&str> = line.split_whitespace().collect();

        let cmd = match words.as_slice() {
            [] => continue,
            ["q"] | ["quit"] => return Ok(()),
            ["r", addr] | ["read", addr] => Cmd::Read {
                addr: addr.to_string(),
            },
            ["w", addr, value] | ["write", addr, value] => Cmd::Write {
                addr: addr.to_string(),
                value: value.to_string(),
            },
            ["d", file] | ["dump", file] => Cmd::Dump {
                size: ROM_SIZE,
                file: Some(PathBuf::from(file)),
            },
            ["l", file] | ["load", file] => Cmd::Load {
                file: Some(PathBuf::from(file)),
            },
            ["t"] | ["test"] => Cmd::Test { size: ROM_SIZE },
            ["t", size] | ["test", size] => match parse_num(size) {
                Ok(size) => Cmd::Test { size },
                Err(e) => {
                    println!("Invalid command: {:#}", e);
                    continue;
                }
            },
            ["reset"] => Cmd::Reset,
            _ => {
                println!("Invalid command: {}", line.trim_end());
                continue;
            }
        };

        // a failed command reports and leaves the session usable
        if let Err(e) = run_command(p, &cmd) {
            println!("Error: {:#}", e);
        }
    }
}

fn parse_addr(s: &str) -> anyhow::Result<u16> {
    u16::try_from(parse_num(s)?).map_err(|_| anyhow!("address out of range: {}", s))
}

/// Parses a numeric argument in decimal, hexadecimal (0x) or octal (0o)
/// notation.
fn parse_num(s: &str) -> anyhow::Result<usize> {
    if let Some(hex) = s.strip_prefix("0x") {
        usize::from_str_radix(hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o") {
        usize::from_str_radix(oct, 8)
    } else {
        s.parse()
    }
    .with_context(|| format!("invalid number: {}", s))
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar().template("{bar:40} {percent}% ({bytes}/{total_bytes})"),
    );
    pb
}

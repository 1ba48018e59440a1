//! Wire protocol for the AT28C256 serial bridge.
//!
//! Every message on the wire is a frame: a single unsigned length octet
//! followed by that many payload bytes. A zero-length frame is a valid
//! message and serves as the acknowledgement in the flow control scheme.
//! Commands travel as frame payloads with a one-byte opcode followed by
//! big-endian arguments.

/// Capacity of the EEPROM in bytes (AT28C256, 32K x 8).
pub const ROM_SIZE: usize = 0x8000;

/// Largest frame payload the bridge firmware accepts. Chosen so that the
/// length octet plus payload fits the firmware's fixed receive buffer.
pub const MAX_PAYLOAD: usize = 62;

/// Commands understood by the bridge firmware.
///
/// `Read` and `Reset` share the `'r'` opcode and are told apart by payload
/// length alone (3 bytes vs 1). This is a quirk of the deployed firmware
/// that we keep for wire compatibility; [`Command::decode`] dispatches on
/// length for this reason.
#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    /// Read the byte at an address. Response: a single-byte frame holding
    /// the value.
    Read { addr: u16 },

    /// Write a byte to an address. Response: an empty ack frame once the
    /// EEPROM write cycle has completed.
    Write { addr: u16, value: u8 },

    /// Stream out the full ROM contents, one acknowledged chunk at a time.
    Dump,

    /// Announce a host-to-device transfer of `size` bytes. Response: an
    /// empty ack frame, after which the host streams acknowledged chunks.
    Load { size: u16 },

    /// Abort whatever the device is doing and return it to the command
    /// loop. Fire-and-forget, no response.
    Reset,
}

impl Command {
    /// Encodes the command into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Command::Read { addr } => vec![b'r', (addr >> 8) as u8, addr as u8],
            Command::Write { addr, value } => {
                vec![b'w', (addr >> 8) as u8, addr as u8, value]
            }
            Command::Dump => vec![b'd'],
            Command::Load { size } => vec![b'l', (size >> 8) as u8, size as u8],
            Command::Reset => vec![b'r'],
        }
    }

    /// Decodes a frame payload into a command, or `None` if the payload is
    /// not a well-formed command.
    ///
    /// Dispatch is on opcode *and* payload length: a 1-byte `'r'` is a
    /// reset, a 3-byte `'r'` is a read. A short or long payload for any
    /// opcode is rejected rather than guessed at.
    pub fn decode(payload: &[u8]) -> Option<Command> {
        match (payload.first(), payload.len()) {
            (Some(&b'r'), 1) => Some(Command::Reset),
            (Some(&b'r'), 3) => Some(Command::Read {
                addr: u16::from_be_bytes([payload[1], payload[2]]),
            }),
            (Some(&b'w'), 4) => Some(Command::Write {
                addr: u16::from_be_bytes([payload[1], payload[2]]),
                value: payload[3],
            }),
            (Some(&b'd'), 1) => Some(Command::Dump),
            (Some(&b'l'), 3) => Some(Command::Load {
                size: u16::from_be_bytes([payload[1], payload[2]]),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layouts() {
        assert_eq!(Command::Read { addr: 0x1234 }.encode(), [b'r', 0x12, 0x34]);
        assert_eq!(
            Command::Write { addr: 0x7fff, value: 0xab }.encode(),
            [b'w', 0x7f, 0xff, 0xab]
        );
        assert_eq!(Command::Dump.encode(), [b'd']);
        assert_eq!(Command::Load { size: 0x8000 }.encode(), [b'l', 0x80, 0x00]);
        assert_eq!(Command::Reset.encode(), [b'r']);
    }

    #[test]
    fn decode_is_encode_inverse() {
        for cmd in [
            Command::Read { addr: 0 },
            Command::Read { addr: 0x7fff },
            Command::Write { addr: 0x100, value: 0 },
            Command::Dump,
            Command::Load { size: 100 },
            Command::Reset,
        ]
        .iter()
        {
            assert_eq!(Command::decode(&cmd.encode()).as_ref(), Some(cmd));
        }
    }

    #[test]
    fn read_and_reset_disambiguated_by_length() {
        assert_eq!(Command::decode(&[b'r']), Some(Command::Reset));
        assert_eq!(
            Command::decode(&[b'r', 0x00, 0x01]),
            Some(Command::Read { addr: 1 })
        );
        // a truncated read is neither
        assert_eq!(Command::decode(&[b'r', 0x00]), None);
    }

    #[test]
    fn malformed_payloads_rejected() {
        assert_eq!(Command::decode(&[]), None);
        assert_eq!(Command::decode(&[b'x']), None);
        assert_eq!(Command::decode(&[b'w', 0, 0]), None);
        assert_eq!(Command::decode(&[b'd', 0]), None);
    }
}

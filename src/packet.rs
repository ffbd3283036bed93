//! Fixed 16-byte command/response frame spoken to a pigpio-style controller daemon.
//!
//! Wire format (little-endian, no padding, no correlation id):
//! ```text
//! ┌────────────┬──────────┬──────────┬──────────┐
//! │ Command    │ P1       │ P2       │ P3       │
//! │ (4B LE u32)│ (4B LE)  │ (4B LE)  │ (4B LE)  │
//! └────────────┴──────────┴──────────┴──────────┘
//! ```
//! On responses `p3` carries the result; a negative value is a daemon error code.

use std::fmt;

use crate::error::AppError;

/// Size of one frame on the wire.
pub const FRAME_SIZE: usize = 16;

/// Daemon command codes used by this crate. Any other code decodes as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SetMode,
    GetMode,
    SetPullUpDown,
    Read,
    Write,
    ReadBank1,
    Tick,
    HardwareRevision,
    NotifyBegin,
    NotifyClose,
    Version,
    GlitchFilter,
    NoiseFilter,
    NotifyOpenInBand,
    Other(u32),
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::SetMode => 0,
            Command::GetMode => 1,
            Command::SetPullUpDown => 2,
            Command::Read => 3,
            Command::Write => 4,
            Command::ReadBank1 => 10,
            Command::Tick => 16,
            Command::HardwareRevision => 17,
            Command::NotifyBegin => 19,
            Command::NotifyClose => 21,
            Command::Version => 26,
            Command::GlitchFilter => 97,
            Command::NoiseFilter => 98,
            Command::NotifyOpenInBand => 99,
            Command::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Command::SetMode,
            1 => Command::GetMode,
            2 => Command::SetPullUpDown,
            3 => Command::Read,
            4 => Command::Write,
            10 => Command::ReadBank1,
            16 => Command::Tick,
            17 => Command::HardwareRevision,
            19 => Command::NotifyBegin,
            21 => Command::NotifyClose,
            26 => Command::Version,
            97 => Command::GlitchFilter,
            98 => Command::NoiseFilter,
            99 => Command::NotifyOpenInBand,
            other => Command::Other(other),
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Command::SetMode => "MODES",
            Command::GetMode => "MODEG",
            Command::SetPullUpDown => "PUD",
            Command::Read => "READ",
            Command::Write => "WRITE",
            Command::ReadBank1 => "BR1",
            Command::Tick => "TICK",
            Command::HardwareRevision => "HWVER",
            Command::NotifyBegin => "NB",
            Command::NotifyClose => "NC",
            Command::Version => "PIGPV",
            Command::GlitchFilter => "FG",
            Command::NoiseFilter => "FN",
            Command::NotifyOpenInBand => "NOIB",
            Command::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.mnemonic(), self.code())
    }
}

/// Negative result code returned by the daemon in `p3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendCode(pub i32);

impl BackendCode {
    pub const INIT_FAILED: BackendCode = BackendCode(-1);
    pub const BAD_USER_GPIO: BackendCode = BackendCode(-2);
    pub const BAD_GPIO: BackendCode = BackendCode(-3);
    pub const BAD_MODE: BackendCode = BackendCode(-4);
    pub const BAD_LEVEL: BackendCode = BackendCode(-5);
    pub const BAD_PUD: BackendCode = BackendCode(-6);
    pub const BAD_HANDLE: BackendCode = BackendCode(-25);
    pub const NOT_PERMITTED: BackendCode = BackendCode(-41);
    pub const BAD_FILTER: BackendCode = BackendCode(-125);

    pub fn name(self) -> &'static str {
        match self {
            BackendCode::INIT_FAILED => "PI_INIT_FAILED",
            BackendCode::BAD_USER_GPIO => "PI_BAD_USER_GPIO",
            BackendCode::BAD_GPIO => "PI_BAD_GPIO",
            BackendCode::BAD_MODE => "PI_BAD_MODE",
            BackendCode::BAD_LEVEL => "PI_BAD_LEVEL",
            BackendCode::BAD_PUD => "PI_BAD_PUD",
            BackendCode::BAD_HANDLE => "PI_BAD_HANDLE",
            BackendCode::NOT_PERMITTED => "PI_NOT_PERMITTED",
            BackendCode::BAD_FILTER => "PI_BAD_FILTER",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for BackendCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// One decoded request or response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
}

impl Packet {
    pub fn new(command: Command, p1: i32, p2: i32, p3: i32) -> Self {
        Self {
            command,
            p1,
            p2,
            p3,
        }
    }

    pub fn request(command: Command, p1: i32, p2: i32) -> Self {
        Self::new(command, p1, p2, 0)
    }

    /// Raw `p3`, negative codes included.
    pub fn result(&self) -> i32 {
        self.p3
    }

    pub fn success(&self) -> bool {
        self.p3 >= 0
    }

    /// Tagged view of `p3` so callers never re-interpret the raw integer.
    pub fn outcome(&self) -> Result<i32, BackendCode> {
        if self.success() {
            Ok(self.p3)
        } else {
            Err(BackendCode(self.p3))
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        encode(self.command, self.p1, self.p2, self.p3)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CMD={}; P1={}; P2={}; P3={};",
            self.command, self.p1, self.p2, self.p3
        )
    }
}

pub fn encode(command: Command, p1: i32, p2: i32, p3: i32) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0..4].copy_from_slice(&command.code().to_le_bytes());
    frame[4..8].copy_from_slice(&p1.to_le_bytes());
    frame[8..12].copy_from_slice(&p2.to_le_bytes());
    frame[12..16].copy_from_slice(&p3.to_le_bytes());
    frame
}

/// Decode the first 16 bytes of `bytes`. Trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<Packet, AppError> {
    let Some(frame) = bytes.first_chunk::<FRAME_SIZE>() else {
        return Err(AppError::Frame { len: bytes.len() });
    };

    let word = |at: usize| [frame[at], frame[at + 1], frame[at + 2], frame[at + 3]];

    Ok(Packet {
        command: Command::from_code(u32::from_le_bytes(word(0))),
        p1: i32::from_le_bytes(word(4)),
        p2: i32::from_le_bytes(word(8)),
        p3: i32::from_le_bytes(word(12)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_in_field_order() {
        let frame = encode(Command::Write, 17, 1, -3);
        assert_eq!(&frame[0..4], &[4, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[17, 0, 0, 0]);
        assert_eq!(&frame[8..12], &[1, 0, 0, 0]);
        assert_eq!(&frame[12..16], &[0xfd, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn unknown_command_codes_survive_decoding() {
        let frame = encode(Command::Other(0xdead_beef), i32::MIN, i32::MAX, -1);
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.command, Command::Other(0xdead_beef));
        assert_eq!(packet.command.code(), 0xdead_beef);
        assert_eq!((packet.p1, packet.p2, packet.p3), (i32::MIN, i32::MAX, -1));
    }

    #[test]
    fn edge_values_land_in_their_own_field() {
        const EDGES: [i32; 5] = [0, 1, -1, i32::MIN, i32::MAX];

        for value in EDGES {
            for field in 0..3 {
                let mut params = [7, -7, 70];
                params[field] = value;
                let frame = encode(Command::Read, params[0], params[1], params[2]);

                let start = 4 + field * 4;
                assert_eq!(&frame[start..start + 4], &value.to_le_bytes(), "p{}", field + 1);
                let packet = decode(&frame).unwrap();
                assert_eq!([packet.p1, packet.p2, packet.p3], params);
            }
        }

        let known = [0u32, 1, 2, 3, 4, 10, 16, 17, 19, 21, 26, 97, 98, 99];
        for code in known.into_iter().chain([u32::MAX]) {
            let frame = encode(Command::from_code(code), 4, 0, 1);
            assert_eq!(&frame[0..4], &code.to_le_bytes());
            let packet = decode(&frame).unwrap();
            assert_eq!(packet.command.code(), code);
            assert_eq!((packet.p1, packet.p2, packet.p3), (4, 0, 1));
        }
    }

    #[test]
    fn known_codes_map_back_to_named_commands() {
        for code in [0u32, 1, 2, 3, 4, 10, 16, 17, 19, 21, 26, 97, 98, 99] {
            let command = Command::from_code(code);
            assert!(!matches!(command, Command::Other(_)), "code {code}");
            assert_eq!(command.code(), code);
        }
    }

    #[test]
    fn decode_rejects_short_frames() {
        for len in 0..FRAME_SIZE {
            let bytes = vec![0u8; len];
            assert!(matches!(decode(&bytes), Err(AppError::Frame { len: l }) if l == len));
        }
    }

    #[test]
    fn decode_ignores_over_read() {
        let mut bytes = encode(Command::Read, 4, 0, 1).to_vec();
        bytes.extend_from_slice(&[0xaa; 9]);
        let packet = decode(&bytes).unwrap();
        assert_eq!(packet, Packet::new(Command::Read, 4, 0, 1));
    }

    #[test]
    fn outcome_tags_negative_results() {
        let ok = Packet::new(Command::Read, 4, 0, 0);
        assert!(ok.success());
        assert_eq!(ok.outcome(), Ok(0));

        let refused = Packet::new(Command::Read, 99, 0, -3);
        assert!(!refused.success());
        assert_eq!(refused.result(), -3);
        assert_eq!(refused.outcome(), Err(BackendCode::BAD_GPIO));
        assert_eq!(BackendCode(-3).to_string(), "PI_BAD_GPIO(-3)");
    }

    #[test]
    fn display_matches_trace_format() {
        let packet = Packet::request(Command::Read, 4, 0);
        assert_eq!(packet.to_string(), "CMD=READ(3); P1=4; P2=0; P3=0;");
    }
}

//! Remote pseudo-terminal requests.
//!
//! A command may ask the server for a PTY, either with defaults or with an
//! explicit termios-style mode map. Modes are encoded once at exec time
//! into the RFC 4254 section 8 wire form: one opcode byte and a big-endian
//! u32 argument per mode, terminated by `TTY_OP_END`.

/// Terminal mode opcodes from RFC 4254 section 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtyMode {
    // Special characters.
    VIntr = 1,
    VQuit = 2,
    VErase = 3,
    VKill = 4,
    VEof = 5,
    VEol = 6,
    VEol2 = 7,
    VStart = 8,
    VStop = 9,
    VSusp = 10,
    VDsusp = 11,
    VReprint = 12,
    VWerase = 13,
    VLnext = 14,
    VFlush = 15,
    VSwtch = 16,
    VStatus = 17,
    VDiscard = 18,
    // Input flags.
    IgnPar = 30,
    ParMrk = 31,
    InPck = 32,
    IStrip = 33,
    InlCr = 34,
    IgnCr = 35,
    ICrNl = 36,
    IUclc = 37,
    IxOn = 38,
    IxAny = 39,
    IxOff = 40,
    IMaxBel = 41,
    IUtf8 = 42,
    // Local flags.
    ISig = 50,
    ICanon = 51,
    XCase = 52,
    Echo = 53,
    EchoE = 54,
    EchoK = 55,
    EchoNl = 56,
    NoFlsh = 57,
    ToStop = 58,
    IExten = 59,
    EchoCtl = 60,
    EchoKe = 61,
    PendIn = 62,
    // Output flags.
    OPost = 70,
    OLcuc = 71,
    ONlCr = 72,
    OCrNl = 73,
    ONoCr = 74,
    ONlRet = 75,
    // Character sizes and parity.
    Cs7 = 90,
    Cs8 = 91,
    ParEnb = 92,
    ParOdd = 93,
    // Line speeds.
    TtyOpIspeed = 128,
    TtyOpOspeed = 129,
}

const TTY_OP_END: u8 = 0;

/// Ordered termios-style mode map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyModes {
    entries: Vec<(PtyMode, u32)>,
}

impl PtyModes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a mode value. Re-setting a mode updates it in place; otherwise
    /// modes are encoded in insertion order.
    pub fn set(mut self, mode: PtyMode, value: u32) -> Self {
        if let Some(entry) = self.entries.iter_mut().find(|(m, _)| *m == mode) {
            entry.1 = value;
        } else {
            self.entries.push((mode, value));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form: `opcode u32-be` per entry, then `TTY_OP_END`.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 5 + 1);
        for &(mode, value) in &self.entries {
            out.push(mode as u8);
            out.extend_from_slice(&value.to_be_bytes());
        }
        out.push(TTY_OP_END);
        out
    }
}

/// A request for a remote PTY, consumed once at exec time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal name sent in the `pty-req` message.
    pub term: String,
    /// Mode map; empty means server defaults.
    pub modes: PtyModes,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string()),
            modes: PtyModes::new(),
        }
    }
}

impl PtyRequest {
    /// A request with the given mode map and the default terminal name.
    pub fn with_modes(modes: PtyModes) -> Self {
        Self {
            modes,
            ..Self::default()
        }
    }
}

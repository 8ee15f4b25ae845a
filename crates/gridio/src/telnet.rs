//! Telnet IAC parsing.
//!
//! Strips IAC sequences from the byte stream and generates negotiation replies:
//! - `IAC DO <opt>`   => `IAC WONT <opt>`
//! - `IAC WILL <opt>` => `IAC DONT <opt>`, unless `<opt>` was requested via [`IacParser::accept`]
//!
//! Subnegotiation blocks (`IAC SB ... IAC SE`) are stripped. A complete NAWS block is
//! decoded into a window-size report.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

/// Negotiate About Window Size (RFC 1073).
pub const OPT_NAWS: u8 = 31;

/// Bytes asking the peer to report its window size.
pub const fn request_naws() -> [u8; 3] {
    [IAC, DO, OPT_NAWS]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u16,
    pub height: u16,
}

/// Result of feeding one chunk through the parser.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Parsed {
    /// The stream with IAC sequences removed.
    pub data: Vec<u8>,
    /// Bytes to write back to the telnet peer (may be empty).
    pub replies: Vec<u8>,
    /// Last window size reported in this chunk, if any.
    pub window: Option<WindowSize>,
}

#[derive(Debug, Default)]
pub struct IacParser {
    state: State,
    /// If true, emit default refusal replies for DO/WILL.
    refuse_negotiation: bool,
    /// Options the peer may enable without a `DONT` reply (we asked for them).
    accepted: Vec<u8>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Data,
    Iac,
    Negotiate {
        cmd: u8,
    },
    Subneg {
        opt: Option<u8>,
        iac_seen: bool,
        buf: Vec<u8>,
    },
}

impl IacParser {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            refuse_negotiation: true,
            accepted: Vec::new(),
        }
    }

    pub fn refuse_negotiation(mut self, on: bool) -> Self {
        self.refuse_negotiation = on;
        self
    }

    /// Let the peer `WILL <opt>` without being refused.
    pub fn accept(mut self, opt: u8) -> Self {
        if !self.accepted.contains(&opt) {
            self.accepted.push(opt);
        }
        self
    }

    pub fn parse(&mut self, chunk: &[u8]) -> Parsed {
        let mut out = Parsed {
            data: Vec::with_capacity(chunk.len()),
            ..Parsed::default()
        };

        for b in chunk {
            match &mut self.state {
                State::Data => {
                    if *b == IAC {
                        self.state = State::Iac;
                    } else {
                        out.data.push(*b);
                    }
                }
                State::Iac => {
                    match *b {
                        // Escaped 0xff => literal 0xff.
                        IAC => {
                            out.data.push(IAC);
                            self.state = State::Data;
                        }
                        // Negotiation commands are 3 bytes: IAC <cmd> <opt>
                        DO | DONT | WILL | WONT => {
                            self.state = State::Negotiate { cmd: *b };
                        }
                        // Subnegotiation: IAC SB <opt> ... IAC SE
                        SB => {
                            self.state = State::Subneg {
                                opt: None,
                                iac_seen: false,
                                buf: Vec::new(),
                            };
                        }
                        // Other 2-byte IAC commands (NOP, GA, etc.) - ignore.
                        _ => {
                            self.state = State::Data;
                        }
                    }
                }
                State::Negotiate { cmd } => {
                    let opt = *b;
                    if self.refuse_negotiation {
                        match *cmd {
                            DO => out.replies.extend_from_slice(&[IAC, WONT, opt]),
                            WILL if !self.accepted.contains(&opt) => {
                                out.replies.extend_from_slice(&[IAC, DONT, opt])
                            }
                            _ => {}
                        }
                    }
                    self.state = State::Data;
                }
                State::Subneg { opt, iac_seen, buf } => {
                    if opt.is_none() {
                        *opt = Some(*b);
                        continue;
                    }

                    if *iac_seen {
                        // Only SE matters; IAC IAC is escaped literal IAC.
                        if *b == SE {
                            if *opt == Some(OPT_NAWS) {
                                if let Some(ws) = decode_naws(buf) {
                                    out.window = Some(ws);
                                }
                            }
                            self.state = State::Data;
                        } else if *b == IAC {
                            buf.push(IAC);
                            *iac_seen = false;
                        } else {
                            *iac_seen = false;
                        }
                        continue;
                    }

                    if *b == IAC {
                        *iac_seen = true;
                        continue;
                    }

                    // Guard against a peer that never sends SE.
                    if buf.len() < 64 {
                        buf.push(*b);
                    }
                }
            }
        }

        out
    }
}

fn decode_naws(buf: &[u8]) -> Option<WindowSize> {
    if buf.len() != 4 {
        return None;
    }
    Some(WindowSize {
        width: u16::from_be_bytes([buf[0], buf[1]]),
        height: u16::from_be_bytes([buf[2], buf[3]]),
    })
}

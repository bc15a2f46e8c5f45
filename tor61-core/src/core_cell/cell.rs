/*
    Cell - the 512 byte unit of the Tor61 wire protocol

    Every frame exchanged between two routers is exactly CELL_SIZE bytes,
    zero padded after the last meaningful field.

    Common header:

      0        2      3
      +--------+------+------------------------------------------+
      | circ   | type | type specific fields ...                 |
      +--------+------+------------------------------------------+

    OPEN / OPENED / OPEN_FAILED (circuit number is always 0):

      3              7              11
      | opener agent | opened agent |

    CREATE / CREATED / CREATE_FAILED / DESTROY use only the common header.

    RELAY:

      3        5          7          11       13    14                512
      | stream | reserved | digest   | length | cmd | body ...          |

    BEGIN body:  "host:port\0"                (length includes the NUL)
    EXTEND body: "host:port\0" + agent (u32)  (length = host + 5)
    DATA body:   up to MAX_RELAY_BODY raw bytes
*/

use std::fmt;

use super::error::CellError;

/// Size of every cell on the wire
pub const CELL_SIZE: usize = 512;

/// Bytes consumed by the relay header before the body starts
pub const RELAY_HEADER_SIZE: usize = 14;

/// Largest body a single relay cell can carry
pub const MAX_RELAY_BODY: usize = CELL_SIZE - RELAY_HEADER_SIZE;

pub type CircuitId = u16;
pub type StreamId = u16;
pub type AgentId = u32;

/// A cell exactly as it travels over a connection
pub type RawCell = [u8; CELL_SIZE];

const TYPE_OFFSET: usize = 2;
const OPENER_OFFSET: usize = 3;
const OPENED_OFFSET: usize = 7;
const STREAM_OFFSET: usize = 3;
const RESERVED_OFFSET: usize = 5;
const DIGEST_OFFSET: usize = 7;
const LENGTH_OFFSET: usize = 11;
const COMMAND_OFFSET: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellType {
    Create = 0x01,
    Created = 0x02,
    Relay = 0x03,
    Destroy = 0x04,
    Open = 0x05,
    Opened = 0x06,
    OpenFailed = 0x07,
    CreateFailed = 0x08,
}

impl CellType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CellType::Create),
            0x02 => Some(CellType::Created),
            0x03 => Some(CellType::Relay),
            0x04 => Some(CellType::Destroy),
            0x05 => Some(CellType::Open),
            0x06 => Some(CellType::Opened),
            0x07 => Some(CellType::OpenFailed),
            0x08 => Some(CellType::CreateFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Create => "create",
            CellType::Created => "created",
            CellType::Relay => "relay",
            CellType::Destroy => "destroy",
            CellType::Open => "open",
            CellType::Opened => "opened",
            CellType::OpenFailed => "open_failed",
            CellType::CreateFailed => "create_failed",
        }
    }

    fn is_open_family(&self) -> bool {
        matches!(self, CellType::Open | CellType::Opened | CellType::OpenFailed)
    }

    fn is_control(&self) -> bool {
        matches!(
            self,
            CellType::Create | CellType::Created | CellType::CreateFailed | CellType::Destroy
        )
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    None = 0x00,
    Begin = 0x01,
    Data = 0x02,
    End = 0x03,
    Connected = 0x04,
    Extend = 0x06,
    Extended = 0x07,
    BeginFailed = 0x0b,
    ExtendFailed = 0x0c,
}

impl RelayCommand {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(RelayCommand::None),
            0x01 => Some(RelayCommand::Begin),
            0x02 => Some(RelayCommand::Data),
            0x03 => Some(RelayCommand::End),
            0x04 => Some(RelayCommand::Connected),
            0x06 => Some(RelayCommand::Extend),
            0x07 => Some(RelayCommand::Extended),
            0x0b => Some(RelayCommand::BeginFailed),
            0x0c => Some(RelayCommand::ExtendFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayCommand::None => "none",
            RelayCommand::Begin => "begin",
            RelayCommand::Data => "data",
            RelayCommand::End => "end",
            RelayCommand::Connected => "connected",
            RelayCommand::Extend => "extend",
            RelayCommand::Extended => "extended",
            RelayCommand::BeginFailed => "begin_failed",
            RelayCommand::ExtendFailed => "extend_failed",
        }
    }
}

impl fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay subcommand together with the body it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPayload {
    None,
    Begin { host: String },
    Data(Vec<u8>),
    End,
    Connected,
    Extend { host: String, agent: AgentId },
    Extended,
    BeginFailed,
    ExtendFailed,
}

impl RelayPayload {
    pub fn command(&self) -> RelayCommand {
        match self {
            RelayPayload::None => RelayCommand::None,
            RelayPayload::Begin { .. } => RelayCommand::Begin,
            RelayPayload::Data(_) => RelayCommand::Data,
            RelayPayload::End => RelayCommand::End,
            RelayPayload::Connected => RelayCommand::Connected,
            RelayPayload::Extend { .. } => RelayCommand::Extend,
            RelayPayload::Extended => RelayCommand::Extended,
            RelayPayload::BeginFailed => RelayCommand::BeginFailed,
            RelayPayload::ExtendFailed => RelayCommand::ExtendFailed,
        }
    }

    /// Serialized body bytes, validated against the relay capacity.
    fn body(&self) -> Result<Vec<u8>, CellError> {
        let body = match self {
            RelayPayload::Begin { host } => {
                check_host(host)?;
                let mut body = host.as_bytes().to_vec();
                body.push(0);
                body
            }
            RelayPayload::Extend { host, agent } => {
                check_host(host)?;
                let mut body = host.as_bytes().to_vec();
                body.push(0);
                body.extend_from_slice(&agent.to_be_bytes());
                body
            }
            RelayPayload::Data(bytes) => bytes.clone(),
            _ => Vec::new(),
        };

        if body.len() > MAX_RELAY_BODY {
            return Err(CellError::Capacity {
                len: body.len(),
                capacity: MAX_RELAY_BODY,
            });
        }
        Ok(body)
    }

    fn parse(command: RelayCommand, body: &[u8]) -> Result<Self, CellError> {
        Ok(match command {
            RelayCommand::None => RelayPayload::None,
            RelayCommand::Begin => RelayPayload::Begin {
                host: parse_host(body, "BEGIN")?,
            },
            RelayCommand::Data => RelayPayload::Data(body.to_vec()),
            RelayCommand::End => RelayPayload::End,
            RelayCommand::Connected => RelayPayload::Connected,
            RelayCommand::Extend => {
                if body.len() < 5 {
                    return Err(CellError::Format(format!(
                        "EXTEND body of {} bytes cannot hold a host and agent id",
                        body.len()
                    )));
                }
                let (host, agent) = body.split_at(body.len() - 4);
                RelayPayload::Extend {
                    host: parse_host(host, "EXTEND")?,
                    agent: u32::from_be_bytes([agent[0], agent[1], agent[2], agent[3]]),
                }
            }
            RelayCommand::Extended => RelayPayload::Extended,
            RelayCommand::BeginFailed => RelayPayload::BeginFailed,
            RelayCommand::ExtendFailed => RelayPayload::ExtendFailed,
        })
    }
}

fn check_host(host: &str) -> Result<(), CellError> {
    if !host.is_ascii() || host.contains('\0') || !host.contains(':') {
        return Err(CellError::InvalidHost(host.to_string()));
    }
    Ok(())
}

fn parse_host(bytes: &[u8], kind: &str) -> Result<String, CellError> {
    let end = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| CellError::Format(format!("{kind} host is not null-terminated")))?;
    let host = &bytes[..end];
    if !host.is_ascii() {
        return Err(CellError::Format(format!("{kind} host is not ASCII")));
    }
    // ASCII was checked above so this cannot fail
    Ok(String::from_utf8_lossy(host).into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub circuit: CircuitId,
    pub stream: StreamId,
    pub digest: u32,
    pub payload: RelayPayload,
}

impl RelayCell {
    pub fn new(circuit: CircuitId, stream: StreamId, payload: RelayPayload) -> Self {
        Self {
            circuit,
            stream,
            digest: 0,
            payload,
        }
    }

    pub fn command(&self) -> RelayCommand {
        self.payload.command()
    }
}

/// A decoded cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Open { opener: AgentId, opened: AgentId },
    Opened { opener: AgentId, opened: AgentId },
    OpenFailed { opener: AgentId, opened: AgentId },
    Create { circuit: CircuitId },
    Created { circuit: CircuitId },
    CreateFailed { circuit: CircuitId },
    Destroy { circuit: CircuitId },
    Relay(RelayCell),
}

impl Cell {
    /// Build one of CREATE, CREATED, CREATE_FAILED or DESTROY.
    pub fn control(kind: CellType, circuit: CircuitId) -> Result<Self, CellError> {
        match kind {
            CellType::Create => Ok(Cell::Create { circuit }),
            CellType::Created => Ok(Cell::Created { circuit }),
            CellType::CreateFailed => Ok(Cell::CreateFailed { circuit }),
            CellType::Destroy => Ok(Cell::Destroy { circuit }),
            other => Err(CellError::Format(format!(
                "{other} is not a circuit control cell"
            ))),
        }
    }

    /// Build one of OPEN, OPENED or OPEN_FAILED.
    pub fn open_family(kind: CellType, opener: AgentId, opened: AgentId) -> Result<Self, CellError> {
        match kind {
            CellType::Open => Ok(Cell::Open { opener, opened }),
            CellType::Opened => Ok(Cell::Opened { opener, opened }),
            CellType::OpenFailed => Ok(Cell::OpenFailed { opener, opened }),
            other => Err(CellError::Format(format!("{other} is not an open cell"))),
        }
    }

    pub fn relay(circuit: CircuitId, stream: StreamId, payload: RelayPayload) -> Self {
        Cell::Relay(RelayCell::new(circuit, stream, payload))
    }

    pub fn cell_type(&self) -> CellType {
        match self {
            Cell::Open { .. } => CellType::Open,
            Cell::Opened { .. } => CellType::Opened,
            Cell::OpenFailed { .. } => CellType::OpenFailed,
            Cell::Create { .. } => CellType::Create,
            Cell::Created { .. } => CellType::Created,
            Cell::CreateFailed { .. } => CellType::CreateFailed,
            Cell::Destroy { .. } => CellType::Destroy,
            Cell::Relay(_) => CellType::Relay,
        }
    }

    /// Circuit number carried in bytes 0-1; always 0 for the OPEN family.
    pub fn circuit(&self) -> CircuitId {
        match self {
            Cell::Open { .. } | Cell::Opened { .. } | Cell::OpenFailed { .. } => 0,
            Cell::Create { circuit }
            | Cell::Created { circuit }
            | Cell::CreateFailed { circuit }
            | Cell::Destroy { circuit } => *circuit,
            Cell::Relay(relay) => relay.circuit,
        }
    }

    /// Serialize into a zero padded 512 byte frame.
    ///
    /// Fails without producing any bytes when a variable length field does
    /// not fit or a host string is unusable.
    pub fn encode(&self) -> Result<RawCell, CellError> {
        let mut raw = [0u8; CELL_SIZE];
        raw[0..2].copy_from_slice(&self.circuit().to_be_bytes());
        raw[TYPE_OFFSET] = self.cell_type() as u8;

        match self {
            Cell::Open { opener, opened }
            | Cell::Opened { opener, opened }
            | Cell::OpenFailed { opener, opened } => {
                raw[OPENER_OFFSET..OPENER_OFFSET + 4].copy_from_slice(&opener.to_be_bytes());
                raw[OPENED_OFFSET..OPENED_OFFSET + 4].copy_from_slice(&opened.to_be_bytes());
            }
            Cell::Relay(relay) => {
                let body = relay.payload.body()?;
                raw[STREAM_OFFSET..STREAM_OFFSET + 2].copy_from_slice(&relay.stream.to_be_bytes());
                raw[DIGEST_OFFSET..DIGEST_OFFSET + 4].copy_from_slice(&relay.digest.to_be_bytes());
                raw[LENGTH_OFFSET..LENGTH_OFFSET + 2]
                    .copy_from_slice(&(body.len() as u16).to_be_bytes());
                raw[COMMAND_OFFSET] = relay.command() as u8;
                raw[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + body.len()].copy_from_slice(&body);
            }
            _ => {}
        }

        Ok(raw)
    }

    /// Parse a frame received from a peer.
    pub fn decode(frame: &[u8]) -> Result<Self, CellError> {
        if frame.len() != CELL_SIZE {
            return Err(CellError::WrongFrameSize {
                expected: CELL_SIZE,
                actual: frame.len(),
            });
        }

        let circuit = circuit_of(frame);
        let kind = CellType::from_u8(frame[TYPE_OFFSET])
            .ok_or(CellError::UnknownCellType(frame[TYPE_OFFSET]))?;

        if kind.is_open_family() {
            if circuit != 0 {
                return Err(CellError::Format(format!(
                    "{kind} cell carries circuit number {circuit}, expected 0"
                )));
            }
            let opener = read_u32(frame, OPENER_OFFSET);
            let opened = read_u32(frame, OPENED_OFFSET);
            return Cell::open_family(kind, opener, opened);
        }

        if kind.is_control() {
            return Cell::control(kind, circuit);
        }

        let reserved = read_u16(frame, RESERVED_OFFSET);
        if reserved != 0 {
            return Err(CellError::Format(format!(
                "relay reserved field is 0x{reserved:04x}, expected 0"
            )));
        }

        let length = read_u16(frame, LENGTH_OFFSET) as usize;
        if length > MAX_RELAY_BODY {
            return Err(CellError::Format(format!(
                "relay body length {length} overflows the cell"
            )));
        }

        let command = RelayCommand::from_u8(frame[COMMAND_OFFSET])
            .ok_or(CellError::UnknownRelayCommand(frame[COMMAND_OFFSET]))?;
        let body = &frame[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + length];

        Ok(Cell::Relay(RelayCell {
            circuit,
            stream: read_u16(frame, STREAM_OFFSET),
            digest: read_u32(frame, DIGEST_OFFSET),
            payload: RelayPayload::parse(command, body)?,
        }))
    }
}

fn read_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

fn read_u32(frame: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

/// Circuit number of a raw frame without decoding the rest.
pub fn circuit_of(frame: &[u8]) -> CircuitId {
    read_u16(frame, 0)
}

/// Overwrite bytes 0-1 of a raw frame, leaving the other 510 untouched.
pub fn rewrite_circuit(raw: &mut RawCell, circuit: CircuitId) {
    raw[0..2].copy_from_slice(&circuit.to_be_bytes());
}

/// Split `payload` into maximally filled RELAY/DATA cells, in order.
pub fn data_cells(
    payload: &[u8],
    stream: StreamId,
    circuit: CircuitId,
) -> Result<Vec<RawCell>, CellError> {
    payload
        .chunks(MAX_RELAY_BODY)
        .map(|chunk| Cell::relay(circuit, stream, RelayPayload::Data(chunk.to_vec())).encode())
        .collect()
}

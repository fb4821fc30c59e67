//! Fixed-layout message frame and the op-code enumeration.
//!
//! Wire order (all integers network byte order): `data_size(4) op_code(4)
//! sequence_number(4) source(4) timestamp(4) source_stream(300, NUL-padded)
//! payload(<= MAX_DATA_SIZE)`. Transmitted length equals
//! `HEADER_LEN + data_size`, never the full fixed `MAX_DATA_SIZE` buffer.

use crate::constants::{MAX_DATA_SIZE, MAX_LINE_SIZE};
use crate::error::{Result, WatershedError};

/// Header size in bytes: four `i32` fields plus the fixed source-stream field.
const HEADER_LEN: usize = 4 * 4 + MAX_LINE_SIZE;

/// The complete, closed op-code enumeration (§6).
///
/// The dispatcher switches on this tagged variant directly rather than on a
/// bare `i32`; `OpCode::Unknown` is the explicit arm for anything that
/// doesn't decode to a known member, so the match stays exhaustive without a
/// wildcard swallowing bugs silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Presentation,
    AddModule,
    RemoveModule,
    AddModuleAck,
    RemoveModuleAck,
    AddModuleError,
    InitModule,
    PortName,
    Shutdown,
    ShutdownAck,
    RemoveModuleError,
    ModuleRunningQuery,
    ModuleRunningAck,
    QueryConsumers,
    QueryProducers,
    ModulePortsQuery,
    RuntimeModulePortsAck,
    ProducerPresentation,
    ConsumerPresentation,
    ModuleData,
    Disconnect,
    Termination,
    ParserError,
    InfoLog,
    ErrorLog,
    WarningLog,
    CreditAnnouncement,
    DbEnvDir,
    RemoveInstance,
    RemoveInstanceAck,
    RemovePeerInstance,
    AcceptConnect,
    /// Matches any op code in a receive/probe filter. Never appears on the wire.
    Any,
    /// A well-formed frame whose raw code did not match a known member.
    Unknown(i32),
}

impl OpCode {
    pub fn code(self) -> i32 {
        use OpCode::*;
        match self {
            Presentation => 0,
            AddModule => 1,
            RemoveModule => 2,
            AddModuleAck => 3,
            RemoveModuleAck => 4,
            AddModuleError => 5,
            InitModule => 6,
            PortName => 7,
            Shutdown => 8,
            ShutdownAck => 9,
            RemoveModuleError => 10,
            ModuleRunningQuery => 11,
            ModuleRunningAck => 12,
            QueryConsumers => 13,
            QueryProducers => 14,
            ModulePortsQuery => 15,
            RuntimeModulePortsAck => 17,
            ProducerPresentation => 18,
            ConsumerPresentation => 19,
            ModuleData => 20,
            Disconnect => 21,
            Termination => 22,
            ParserError => 23,
            InfoLog => 24,
            ErrorLog => 25,
            WarningLog => 26,
            CreditAnnouncement => 27,
            DbEnvDir => 28,
            RemoveInstance => 29,
            RemoveInstanceAck => 30,
            RemovePeerInstance => 31,
            AcceptConnect => 32,
            Any => crate::constants::COMM_ANY_SOURCE - 1, // -2, never sent
            Unknown(raw) => raw,
        }
    }

    pub fn from_code(raw: i32) -> OpCode {
        use OpCode::*;
        match raw {
            0 => Presentation,
            1 => AddModule,
            2 => RemoveModule,
            3 => AddModuleAck,
            4 => RemoveModuleAck,
            5 => AddModuleError,
            6 => InitModule,
            7 => PortName,
            8 => Shutdown,
            9 => ShutdownAck,
            10 => RemoveModuleError,
            11 => ModuleRunningQuery,
            12 => ModuleRunningAck,
            13 => QueryConsumers,
            14 => QueryProducers,
            15 => ModulePortsQuery,
            17 => RuntimeModulePortsAck,
            18 => ProducerPresentation,
            19 => ConsumerPresentation,
            20 => ModuleData,
            21 => Disconnect,
            22 => Termination,
            23 => ParserError,
            24 => InfoLog,
            25 => ErrorLog,
            26 => WarningLog,
            27 => CreditAnnouncement,
            28 => DbEnvDir,
            29 => RemoveInstance,
            30 => RemoveInstanceAck,
            31 => RemovePeerInstance,
            32 => AcceptConnect,
            other => Unknown(other),
        }
    }
}

/// A single message frame exchanged between participants.
#[derive(Debug, Clone)]
pub struct Message {
    pub op_code: OpCode,
    pub sequence_number: i32,
    pub source: i32,
    pub timestamp: i32,
    pub source_stream: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(op_code: OpCode, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_DATA_SIZE {
            return Err(WatershedError::BadParameter(format!(
                "payload size {} exceeds MAX_DATA_SIZE {}",
                payload.len(),
                MAX_DATA_SIZE
            )));
        }
        Ok(Message {
            op_code,
            sequence_number: 0,
            source: 0,
            timestamp: coarsetime::Clock::now_since_epoch().as_secs() as i32,
            source_stream: String::new(),
            payload,
        })
    }

    pub fn text(op_code: OpCode, text: &str) -> Result<Self> {
        Message::new(op_code, text.as_bytes().to_vec())
    }

    pub fn payload_as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn with_source_stream(mut self, stream: &str) -> Result<Self> {
        if stream.len() >= MAX_LINE_SIZE {
            return Err(WatershedError::BadParameter(format!(
                "source_stream {:?} exceeds MAX_LINE_SIZE",
                stream
            )));
        }
        self.source_stream = stream.to_string();
        Ok(self)
    }

    pub fn with_source(mut self, source: i32) -> Self {
        self.source = source;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i32) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    /// Matches this message's op code against a probe/receive filter, where
    /// `OpCode::Any` is the wildcard `MESSAGE_OP_ANY`.
    pub fn matches(&self, filter: OpCode) -> bool {
        matches!(filter, OpCode::Any) || self.op_code == filter
    }

    /// Encodes the frame using the fixed wire layout. The transmitted length
    /// is `HEADER_LEN + data_size`, not the padded `MAX_DATA_SIZE` buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_DATA_SIZE {
            return Err(WatershedError::BadParameter(
                "data_size exceeds MAX_DATA_SIZE".into(),
            ));
        }
        if self.source_stream.len() >= MAX_LINE_SIZE {
            return Err(WatershedError::BadParameter(
                "source_stream exceeds MAX_LINE_SIZE".into(),
            ));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.op_code.code().to_be_bytes());
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.source.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        let mut stream_field = [0u8; MAX_LINE_SIZE];
        stream_field[..self.source_stream.len()].copy_from_slice(self.source_stream.as_bytes());
        buf.extend_from_slice(&stream_field);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a header-only prefix to learn how many more payload bytes to
    /// read from the stream. Returns `(data_size, header)`.
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, HeaderFields)> {
        let data_size = i32::from_be_bytes(header[0..4].try_into().unwrap());
        if data_size < 0 || data_size as usize > MAX_DATA_SIZE {
            return Err(WatershedError::BadParameter(format!(
                "invalid data_size on wire: {data_size}"
            )));
        }
        let op_code = i32::from_be_bytes(header[4..8].try_into().unwrap());
        let sequence_number = i32::from_be_bytes(header[8..12].try_into().unwrap());
        let source = i32::from_be_bytes(header[12..16].try_into().unwrap());
        let timestamp = i32::from_be_bytes(header[16..20].try_into().unwrap());
        let stream_bytes = &header[20..20 + MAX_LINE_SIZE];
        let nul = stream_bytes.iter().position(|&b| b == 0).unwrap_or(stream_bytes.len());
        let source_stream = String::from_utf8_lossy(&stream_bytes[..nul]).into_owned();
        Ok((
            data_size as usize,
            HeaderFields {
                op_code: OpCode::from_code(op_code),
                sequence_number,
                source,
                timestamp,
                source_stream,
            },
        ))
    }

    pub fn from_parts(fields: HeaderFields, payload: Vec<u8>) -> Message {
        Message {
            op_code: fields.op_code,
            sequence_number: fields.sequence_number,
            source: fields.source,
            timestamp: fields.timestamp,
            source_stream: fields.source_stream,
            payload,
        }
    }
}

pub struct HeaderFields {
    pub op_code: OpCode,
    pub sequence_number: i32,
    pub source: i32,
    pub timestamp: i32,
    pub source_stream: String,
}

pub const HEADER_LEN_BYTES: usize = HEADER_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_wire_layout() {
        let msg = Message::new(OpCode::ModuleData, b"hello".to_vec())
            .unwrap()
            .with_source(3)
            .with_sequence_number(42)
            .with_source_stream("stream-a")
            .unwrap();
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 5);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&encoded[..HEADER_LEN]);
        let (data_size, fields) = Message::decode_header(&header).unwrap();
        assert_eq!(data_size, 5);
        let decoded = Message::from_parts(fields, encoded[HEADER_LEN..].to_vec());

        assert_eq!(decoded.op_code, OpCode::ModuleData);
        assert_eq!(decoded.source, 3);
        assert_eq!(decoded.sequence_number, 42);
        assert_eq!(decoded.source_stream, "stream-a");
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn rejects_oversized_payload() {
        let big = vec![0u8; MAX_DATA_SIZE + 1];
        assert!(Message::new(OpCode::ModuleData, big).is_err());
    }

    #[test]
    fn any_filter_matches_every_op_code() {
        let msg = Message::new(OpCode::Shutdown, vec![]).unwrap();
        assert!(msg.matches(OpCode::Any));
        assert!(msg.matches(OpCode::Shutdown));
        assert!(!msg.matches(OpCode::Termination));
    }

    #[test]
    fn op_code_round_trips_through_the_numeric_enumeration() {
        for code in [0, 1, 17, 32] {
            assert_eq!(OpCode::from_code(code).code(), code);
        }
        assert!(matches!(OpCode::from_code(999), OpCode::Unknown(999)));
    }
}

//! # ReadProperty / WriteProperty Codec
//!
//! Encodes the two confirmed services the reader uses and decodes the
//! replies.
//!
//! ## Frame Layout
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────────────┐
//! │ BVLC (4)     │ NPDU (2+)    │ APDU                                     │
//! │ 81 0A LL LL  │ 01 CC [...]  │ confirmed request / complex-ack / error  │
//! └──────────────┴──────────────┴──────────────────────────────────────────┘
//!
//! Request APDU:
//!   00 05 II 0C | 0C oo oo oo oo | 19 pp | [29 aa]
//!   │  │  │  │    │                │        └─ ctx 2: array index
//!   │  │  │  │    │                └─ ctx 1: property identifier
//!   │  │  │  │    └─ ctx 0: object identifier (type << 22 | instance)
//!   │  │  │  └─ service: ReadProperty (12)
//!   │  │  └─ invoke id
//!   │  └─ max APDU 1476, no segmentation
//!   └─ confirmed request
//!
//! Complex-ACK APDU:
//!   30 II 0C | ctx 0 | ctx 1 | [ctx 2] | 3E <application values> 3F
//!
//! WriteProperty request APDU:
//!   00 05 II 0F | ctx 0 | ctx 1 | [ctx 2] | 3E <value> 3F | [49 pp]
//!                                                          └─ ctx 4: priority
//!   A Null value relinquishes the command at that priority.
//!
//! Simple-ACK APDU (write accepted):
//!   20 II 0F
//! ```
//!
//! Segmented replies are not supported; every property the reader asks
//! for fits in one datagram.

use heitz_core::{ObjectReference, ObjectType};

use crate::error::{BacnetError, BacnetResult};

// =============================================================================
// Constants
// =============================================================================

const BVLC_TYPE_BIP: u8 = 0x81;
const BVLC_FORWARDED_NPDU: u8 = 0x04;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;
const BVLC_HEADER_LEN: usize = 4;
const BVLC_FORWARDED_HEADER_LEN: usize = 10;

const NPDU_VERSION: u8 = 0x01;
const NPDU_NETWORK_MESSAGE: u8 = 0x80;
const NPDU_DNET_PRESENT: u8 = 0x20;
const NPDU_SNET_PRESENT: u8 = 0x08;
const NPDU_EXPECTING_REPLY: u8 = 0x04;

const PDU_CONFIRMED_REQUEST: u8 = 0x0;
const PDU_SIMPLE_ACK: u8 = 0x2;
const PDU_COMPLEX_ACK: u8 = 0x3;
const PDU_ERROR: u8 = 0x5;
const PDU_REJECT: u8 = 0x6;
const PDU_ABORT: u8 = 0x7;
const PDU_SEGMENTED_FLAG: u8 = 0x08;
const PDU_ABORT_SERVER_FLAG: u8 = 0x01;

/// Confirmed service choice for ReadProperty.
pub const SERVICE_READ_PROPERTY: u8 = 12;

/// Confirmed service choice for WriteProperty.
pub const SERVICE_WRITE_PROPERTY: u8 = 15;

/// Lowest and highest command priority (1 is manual life safety).
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 16;

/// Max-segments unspecified, max APDU 1476 octets.
const MAX_APDU_1476: u8 = 0x05;

/// Receive buffer size; larger than any BACnet/IP datagram.
pub const MAX_DATAGRAM_LEN: usize = 1536;

const APP_TAG_NULL: u8 = 0;
const APP_TAG_BOOLEAN: u8 = 1;
const APP_TAG_UNSIGNED: u8 = 2;
const APP_TAG_SIGNED: u8 = 3;
const APP_TAG_REAL: u8 = 4;
const APP_TAG_DOUBLE: u8 = 5;
const APP_TAG_CHARACTER_STRING: u8 = 7;
const APP_TAG_ENUMERATED: u8 = 9;
const APP_TAG_OBJECT_ID: u8 = 12;

const CHARSET_UTF8: u8 = 0;
const CHARSET_ISO_8859_1: u8 = 5;

// =============================================================================
// Request Types
// =============================================================================

/// Properties the reader asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyIdentifier {
    ObjectName,
    PresentValue,
    PriorityArray,
}

impl PropertyIdentifier {
    pub const fn code(&self) -> u32 {
        match self {
            PropertyIdentifier::ObjectName => 77,
            PropertyIdentifier::PresentValue => 85,
            PropertyIdentifier::PriorityArray => 87,
        }
    }
}

/// A confirmed ReadProperty request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object: ObjectReference,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn new(object: ObjectReference, property: PropertyIdentifier) -> Self {
        ReadPropertyRequest {
            object,
            property,
            array_index: None,
        }
    }
}

/// Packs an object type and instance into a BACnet object identifier.
pub fn encode_object_id(object_type: u16, instance: u32) -> u32 {
    ((u32::from(object_type) & 0x3FF) << 22) | (instance & 0x3F_FFFF)
}

/// Encodes a complete BACnet/IP datagram carrying a ReadProperty request.
pub fn encode_read_property(invoke_id: u8, request: &ReadPropertyRequest) -> Vec<u8> {
    let mut apdu = confirmed_header(invoke_id, SERVICE_READ_PROPERTY);
    push_property_reference(
        &mut apdu,
        request.object,
        request.property,
        request.array_index,
    );

    wrap_unicast(NPDU_EXPECTING_REPLY, &apdu)
}

/// A confirmed WriteProperty request.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
    pub object: ObjectReference,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub value: BacnetValue,
    /// Command priority; `None` lets the device pick (16 for most).
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    /// Commands `present-value` at `priority`.
    pub fn present_value(object: ObjectReference, value: BacnetValue, priority: u8) -> Self {
        WritePropertyRequest {
            object,
            property: PropertyIdentifier::PresentValue,
            array_index: None,
            value,
            priority: Some(priority),
        }
    }

    /// Writes Null to `present-value`, releasing the command at `priority`.
    pub fn relinquish(object: ObjectReference, priority: u8) -> Self {
        Self::present_value(object, BacnetValue::Null, priority)
    }
}

/// Encodes a complete BACnet/IP datagram carrying a WriteProperty request.
pub fn encode_write_property(invoke_id: u8, request: &WritePropertyRequest) -> Vec<u8> {
    let mut apdu = confirmed_header(invoke_id, SERVICE_WRITE_PROPERTY);
    push_property_reference(
        &mut apdu,
        request.object,
        request.property,
        request.array_index,
    );

    apdu.push(0x3E);
    encode_application_value(&request.value, &mut apdu);
    apdu.push(0x3F);

    if let Some(priority) = request.priority {
        push_context_unsigned(&mut apdu, 4, u32::from(priority));
    }

    wrap_unicast(NPDU_EXPECTING_REPLY, &apdu)
}

fn confirmed_header(invoke_id: u8, service: u8) -> Vec<u8> {
    let mut apdu = Vec::with_capacity(24);
    apdu.push(PDU_CONFIRMED_REQUEST << 4);
    apdu.push(MAX_APDU_1476);
    apdu.push(invoke_id);
    apdu.push(service);
    apdu
}

fn push_property_reference(
    apdu: &mut Vec<u8>,
    object: ObjectReference,
    property: PropertyIdentifier,
    array_index: Option<u32>,
) {
    // Context tag 0, fixed length 4.
    apdu.push(0x0C);
    apdu.extend_from_slice(
        &encode_object_id(object.object_type.code(), object.instance).to_be_bytes(),
    );
    push_context_unsigned(apdu, 1, property.code());
    if let Some(index) = array_index {
        push_context_unsigned(apdu, 2, index);
    }
}

fn wrap_unicast(npdu_control: u8, apdu: &[u8]) -> Vec<u8> {
    let total = BVLC_HEADER_LEN + 2 + apdu.len();
    let mut frame = Vec::with_capacity(total);
    frame.push(BVLC_TYPE_BIP);
    frame.push(BVLC_ORIGINAL_UNICAST);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.push(NPDU_VERSION);
    frame.push(npdu_control);
    frame.extend_from_slice(apdu);
    frame
}

fn unsigned_len(value: u32) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn push_context_unsigned(buf: &mut Vec<u8>, tag: u8, value: u32) {
    let len = unsigned_len(value);
    buf.push((tag << 4) | 0x08 | len as u8);
    buf.extend_from_slice(&value.to_be_bytes()[4 - len..]);
}

/// Writes an application tag header, using the extended length forms
/// above 4 octets.
fn push_application_tag(buf: &mut Vec<u8>, tag: u8, len: usize) {
    match len {
        0..=4 => buf.push((tag << 4) | len as u8),
        5..=253 => {
            buf.push((tag << 4) | 5);
            buf.push(len as u8);
        }
        254..=0xFFFF => {
            buf.push((tag << 4) | 5);
            buf.push(254);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push((tag << 4) | 5);
            buf.push(255);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
}

/// Minimal big-endian octets of an unsigned value (at least one).
fn unsigned_octets(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Minimal two's-complement octets of a signed value (at least one).
fn signed_octets(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Appends one application-tagged value.
pub fn encode_application_value(value: &BacnetValue, buf: &mut Vec<u8>) {
    match value {
        BacnetValue::Null => buf.push(APP_TAG_NULL << 4),
        // Booleans carry their value in the length bits.
        BacnetValue::Boolean(b) => buf.push((APP_TAG_BOOLEAN << 4) | u8::from(*b)),
        BacnetValue::Unsigned(u) => {
            let octets = unsigned_octets(*u);
            push_application_tag(buf, APP_TAG_UNSIGNED, octets.len());
            buf.extend_from_slice(&octets);
        }
        BacnetValue::Signed(i) => {
            let octets = signed_octets(*i);
            push_application_tag(buf, APP_TAG_SIGNED, octets.len());
            buf.extend_from_slice(&octets);
        }
        BacnetValue::Real(r) => {
            push_application_tag(buf, APP_TAG_REAL, 4);
            buf.extend_from_slice(&r.to_be_bytes());
        }
        BacnetValue::Double(d) => {
            push_application_tag(buf, APP_TAG_DOUBLE, 8);
            buf.extend_from_slice(&d.to_be_bytes());
        }
        BacnetValue::CharacterString(s) => {
            push_application_tag(buf, APP_TAG_CHARACTER_STRING, s.len() + 1);
            buf.push(CHARSET_UTF8);
            buf.extend_from_slice(s.as_bytes());
        }
        BacnetValue::Enumerated(e) => {
            let octets = unsigned_octets(u64::from(*e));
            push_application_tag(buf, APP_TAG_ENUMERATED, octets.len());
            buf.extend_from_slice(&octets);
        }
        BacnetValue::ObjectIdentifier {
            object_type,
            instance,
        } => {
            push_application_tag(buf, APP_TAG_OBJECT_ID, 4);
            buf.extend_from_slice(&encode_object_id(*object_type, *instance).to_be_bytes());
        }
        BacnetValue::Raw { tag, data } => {
            push_application_tag(buf, *tag, data.len());
            buf.extend_from_slice(data);
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// An application-tagged property value.
#[derive(Debug, Clone, PartialEq)]
pub enum BacnetValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    CharacterString(String),
    Enumerated(u32),
    ObjectIdentifier { object_type: u16, instance: u32 },
    /// Anything the reader has no use for (dates, bit strings, context data).
    Raw { tag: u8, data: Vec<u8> },
}

impl BacnetValue {
    /// Numeric view of the value, if it has one.
    ///
    /// Binary present values arrive as Enumerated (0 inactive, 1 active) and
    /// map to 0.0 / 1.0. Reals map through their shortest decimal form so a
    /// device showing 7.2 yields 7.2 rather than 7.199999809265137.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BacnetValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            BacnetValue::Unsigned(u) => Some(*u as f64),
            BacnetValue::Signed(i) => Some(*i as f64),
            BacnetValue::Real(r) => r.to_string().parse().ok(),
            BacnetValue::Double(d) => Some(*d),
            BacnetValue::Enumerated(e) => Some(f64::from(*e)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BacnetValue::CharacterString(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BacnetValue::Null)
    }

    /// The encoding a device expects for a `present-value` write.
    ///
    /// ## Errors
    /// - binary objects take only 0 or 1 (inactive / active)
    /// - multi-state objects take a state number of 1 or more
    /// - device objects have no present value
    pub fn present_value_for(object_type: ObjectType, value: f64) -> BacnetResult<Self> {
        if !value.is_finite() {
            return Err(BacnetError::UnexpectedValue(format!(
                "{} is not a writable number",
                value
            )));
        }

        match object_type {
            ObjectType::AnalogInput | ObjectType::AnalogOutput | ObjectType::AnalogValue => {
                Ok(BacnetValue::Real(value as f32))
            }
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue => {
                if value == 0.0 || value == 1.0 {
                    Ok(BacnetValue::Enumerated(value as u32))
                } else {
                    Err(BacnetError::UnexpectedValue(format!(
                        "binary objects take 0 or 1, got {}",
                        value
                    )))
                }
            }
            ObjectType::MultiStateInput
            | ObjectType::MultiStateOutput
            | ObjectType::MultiStateValue => {
                if value >= 1.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) {
                    Ok(BacnetValue::Unsigned(value as u64))
                } else {
                    Err(BacnetError::UnexpectedValue(format!(
                        "multi-state objects take a state number of 1 or more, got {}",
                        value
                    )))
                }
            }
            ObjectType::Device => Err(BacnetError::UnexpectedValue(
                "device objects have no present value".to_string(),
            )),
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// A confirmed-service reply addressed to one of our invoke ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub invoke_id: u8,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Service accepted with nothing to return (WriteProperty).
    SimpleAck { service: u8 },
    /// Service payload, decoded separately once the invoke id matches.
    ComplexAck { service: u8, payload: Vec<u8> },
    Error { service: u8, class: u32, code: u32 },
    Reject { reason: u8 },
    Abort { reason: u8, from_server: bool },
}

/// Decoded ReadProperty-ACK.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object_type: u16,
    pub instance: u32,
    pub property: u32,
    pub array_index: Option<u32>,
    pub values: Vec<BacnetValue>,
}

/// Decodes a received datagram.
///
/// ## Returns
/// * `Ok(Some(frame))` - a Simple-ACK, Complex-ACK, Error, Reject or Abort
/// * `Ok(None)` - valid traffic that is not a reply (I-Am, Who-Is,
///   network-layer messages, BVLC control frames)
/// * `Err(Malformed)` - bytes that are not valid BACnet/IP
pub fn decode_response(datagram: &[u8]) -> BacnetResult<Option<ResponseFrame>> {
    let npdu = match strip_bvlc(datagram)? {
        Some(npdu) => npdu,
        None => return Ok(None),
    };

    let apdu = match strip_npdu(npdu)? {
        Some(apdu) => apdu,
        None => return Ok(None),
    };

    decode_apdu(apdu)
}

fn strip_bvlc(datagram: &[u8]) -> BacnetResult<Option<&[u8]>> {
    if datagram.len() < BVLC_HEADER_LEN {
        return Err(malformed("short BVLC header"));
    }
    if datagram[0] != BVLC_TYPE_BIP {
        return Err(malformed(format!(
            "not a BACnet/IP frame (type 0x{:02X})",
            datagram[0]
        )));
    }

    let declared = usize::from(u16::from_be_bytes([datagram[2], datagram[3]]));
    if declared < BVLC_HEADER_LEN || declared > datagram.len() {
        return Err(malformed(format!(
            "BVLC length {} does not match datagram length {}",
            declared,
            datagram.len()
        )));
    }
    let frame = &datagram[..declared];

    match datagram[1] {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => Ok(Some(&frame[BVLC_HEADER_LEN..])),
        BVLC_FORWARDED_NPDU => {
            if declared < BVLC_FORWARDED_HEADER_LEN {
                return Err(malformed("short Forwarded-NPDU header"));
            }
            Ok(Some(&frame[BVLC_FORWARDED_HEADER_LEN..]))
        }
        _ => Ok(None),
    }
}

fn strip_npdu(npdu: &[u8]) -> BacnetResult<Option<&[u8]>> {
    let mut reader = Reader::new(npdu);

    let version = reader.u8()?;
    if version != NPDU_VERSION {
        return Err(malformed(format!("unsupported NPDU version {}", version)));
    }

    let control = reader.u8()?;
    if control & NPDU_DNET_PRESENT != 0 {
        reader.skip(2)?;
        let dlen = reader.u8()?;
        reader.skip(usize::from(dlen))?;
    }
    if control & NPDU_SNET_PRESENT != 0 {
        reader.skip(2)?;
        let slen = reader.u8()?;
        reader.skip(usize::from(slen))?;
    }
    if control & NPDU_DNET_PRESENT != 0 {
        // hop count
        reader.skip(1)?;
    }

    if control & NPDU_NETWORK_MESSAGE != 0 {
        return Ok(None);
    }

    Ok(Some(reader.rest()))
}

fn decode_apdu(apdu: &[u8]) -> BacnetResult<Option<ResponseFrame>> {
    let first = *apdu.first().ok_or_else(|| malformed("empty APDU"))?;

    let body = match first >> 4 {
        PDU_SIMPLE_ACK => {
            require_len(apdu, 3, "Simple-ACK")?;
            ResponseBody::SimpleAck { service: apdu[2] }
        }
        PDU_COMPLEX_ACK => {
            if first & PDU_SEGMENTED_FLAG != 0 {
                return Err(malformed("segmented Complex-ACK not supported"));
            }
            require_len(apdu, 3, "Complex-ACK")?;
            ResponseBody::ComplexAck {
                service: apdu[2],
                payload: apdu[3..].to_vec(),
            }
        }
        PDU_ERROR => {
            require_len(apdu, 3, "Error PDU")?;
            let mut reader = Reader::new(&apdu[3..]);

            // Some services wrap the error in context tag 0.
            if reader.peek_tag()?.is_opening(0) {
                reader.tag()?;
            }
            let class = reader.application_enumerated()?;
            let code = reader.application_enumerated()?;

            ResponseBody::Error {
                service: apdu[2],
                class,
                code,
            }
        }
        PDU_REJECT => {
            require_len(apdu, 3, "Reject PDU")?;
            ResponseBody::Reject { reason: apdu[2] }
        }
        PDU_ABORT => {
            require_len(apdu, 3, "Abort PDU")?;
            ResponseBody::Abort {
                reason: apdu[2],
                from_server: first & PDU_ABORT_SERVER_FLAG != 0,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(ResponseFrame {
        invoke_id: apdu[1],
        body,
    }))
}

/// Decodes the service payload of a ReadProperty Complex-ACK.
pub fn decode_read_property_ack(payload: &[u8]) -> BacnetResult<ReadPropertyAck> {
    let mut reader = Reader::new(payload);

    let object_id = reader.context_unsigned(0)?;
    let property = reader.context_unsigned(1)?;

    let mut array_index = None;
    let next = reader.peek_tag()?;
    if next.kind == TagKind::Context && next.number == 2 {
        array_index = Some(reader.context_unsigned(2)?);
    }

    if !reader.tag()?.is_opening(3) {
        return Err(malformed("expected opening tag 3 before property value"));
    }

    let mut values = Vec::new();
    loop {
        let tag = reader.tag()?;
        match tag.kind {
            TagKind::Closing if tag.number == 3 => break,
            TagKind::Closing => {
                return Err(malformed(format!("unbalanced closing tag {}", tag.number)))
            }
            TagKind::Opening => {
                reader.skip_constructed()?;
                values.push(BacnetValue::Raw {
                    tag: tag.number,
                    data: Vec::new(),
                });
            }
            TagKind::Context => {
                let data = reader.take(tag.len)?.to_vec();
                values.push(BacnetValue::Raw {
                    tag: tag.number,
                    data,
                });
            }
            TagKind::Application => values.push(reader.application_value(tag)?),
        }
    }

    Ok(ReadPropertyAck {
        object_type: (object_id >> 22) as u16,
        instance: object_id & 0x3F_FFFF,
        property,
        array_index,
        values,
    })
}

fn require_len(apdu: &[u8], min: usize, what: &str) -> BacnetResult<()> {
    if apdu.len() < min {
        return Err(malformed(format!("{} too short ({} bytes)", what, apdu.len())));
    }
    Ok(())
}

fn malformed(reason: impl Into<String>) -> BacnetError {
    BacnetError::Malformed(reason.into())
}

// =============================================================================
// Tag Reader
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Application,
    Context,
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy)]
struct Tag {
    number: u8,
    kind: TagKind,
    /// Content length; for application booleans, the value itself.
    len: usize,
}

impl Tag {
    fn is_opening(&self, number: u8) -> bool {
        self.kind == TagKind::Opening && self.number == number
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn u8(&mut self) -> BacnetResult<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| malformed("truncated frame"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> BacnetResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("truncated frame"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> BacnetResult<()> {
        self.take(len).map(|_| ())
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn peek_tag(&self) -> BacnetResult<Tag> {
        Reader {
            buf: self.buf,
            pos: self.pos,
        }
        .tag()
    }

    fn tag(&mut self) -> BacnetResult<Tag> {
        let initial = self.u8()?;

        let mut number = initial >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }

        let is_context = initial & 0x08 != 0;
        let lvt = initial & 0x07;

        if is_context && lvt == 6 {
            return Ok(Tag {
                number,
                kind: TagKind::Opening,
                len: 0,
            });
        }
        if is_context && lvt == 7 {
            return Ok(Tag {
                number,
                kind: TagKind::Closing,
                len: 0,
            });
        }

        let len = if lvt == 5 {
            match self.u8()? {
                254 => {
                    let bytes = self.take(2)?;
                    usize::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                }
                255 => {
                    let bytes = self.take(4)?;
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                n => usize::from(n),
            }
        } else {
            usize::from(lvt)
        };

        Ok(Tag {
            number,
            kind: if is_context {
                TagKind::Context
            } else {
                TagKind::Application
            },
            len,
        })
    }

    fn context_unsigned(&mut self, number: u8) -> BacnetResult<u32> {
        let tag = self.tag()?;
        if tag.kind != TagKind::Context || tag.number != number {
            return Err(malformed(format!("expected context tag {}", number)));
        }
        let value = decode_unsigned(self.take(tag.len)?)?;
        u32::try_from(value).map_err(|_| malformed(format!("context tag {} overflows", number)))
    }

    fn application_enumerated(&mut self) -> BacnetResult<u32> {
        let tag = self.tag()?;
        if tag.kind != TagKind::Application || tag.number != APP_TAG_ENUMERATED {
            return Err(malformed("expected enumerated value"));
        }
        let value = decode_unsigned(self.take(tag.len)?)?;
        u32::try_from(value).map_err(|_| malformed("enumerated value overflows"))
    }

    fn application_value(&mut self, tag: Tag) -> BacnetResult<BacnetValue> {
        if tag.number == APP_TAG_BOOLEAN {
            return Ok(BacnetValue::Boolean(tag.len != 0));
        }

        let data = self.take(tag.len)?;
        let value = match tag.number {
            APP_TAG_NULL => BacnetValue::Null,
            APP_TAG_UNSIGNED => BacnetValue::Unsigned(decode_unsigned(data)?),
            APP_TAG_SIGNED => BacnetValue::Signed(decode_signed(data)?),
            APP_TAG_REAL => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| malformed(format!("REAL with {} bytes", data.len())))?;
                BacnetValue::Real(f32::from_be_bytes(bytes))
            }
            APP_TAG_DOUBLE => {
                let bytes: [u8; 8] = data
                    .try_into()
                    .map_err(|_| malformed(format!("DOUBLE with {} bytes", data.len())))?;
                BacnetValue::Double(f64::from_be_bytes(bytes))
            }
            APP_TAG_CHARACTER_STRING => decode_character_string(data),
            APP_TAG_ENUMERATED => {
                let value = decode_unsigned(data)?;
                BacnetValue::Enumerated(
                    u32::try_from(value).map_err(|_| malformed("enumerated value overflows"))?,
                )
            }
            APP_TAG_OBJECT_ID => {
                let bytes: [u8; 4] = data
                    .try_into()
                    .map_err(|_| malformed("object identifier must be 4 bytes"))?;
                let raw = u32::from_be_bytes(bytes);
                BacnetValue::ObjectIdentifier {
                    object_type: (raw >> 22) as u16,
                    instance: raw & 0x3F_FFFF,
                }
            }
            other => BacnetValue::Raw {
                tag: other,
                data: data.to_vec(),
            },
        };

        Ok(value)
    }

    /// Skips the body of a constructed value whose opening tag was just read.
    fn skip_constructed(&mut self) -> BacnetResult<()> {
        let mut depth = 1usize;
        while depth > 0 {
            let tag = self.tag()?;
            match tag.kind {
                TagKind::Opening => depth += 1,
                TagKind::Closing => depth -= 1,
                TagKind::Application if tag.number == APP_TAG_BOOLEAN => {}
                TagKind::Application | TagKind::Context => self.skip(tag.len)?,
            }
        }
        Ok(())
    }
}

fn decode_unsigned(data: &[u8]) -> BacnetResult<u64> {
    if data.is_empty() || data.len() > 8 {
        return Err(malformed(format!("unsigned with {} bytes", data.len())));
    }
    Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_signed(data: &[u8]) -> BacnetResult<i64> {
    if data.is_empty() || data.len() > 8 {
        return Err(malformed(format!("signed with {} bytes", data.len())));
    }
    let seed: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(data.iter().fold(seed, |acc, b| (acc << 8) | i64::from(*b)))
}

fn decode_character_string(data: &[u8]) -> BacnetValue {
    match data.split_first() {
        None => BacnetValue::CharacterString(String::new()),
        Some((&CHARSET_UTF8, text)) => {
            BacnetValue::CharacterString(String::from_utf8_lossy(text).into_owned())
        }
        Some((&CHARSET_ISO_8859_1, text)) => {
            BacnetValue::CharacterString(text.iter().map(|b| char::from(*b)).collect())
        }
        Some(_) => BacnetValue::Raw {
            tag: APP_TAG_CHARACTER_STRING,
            data: data.to_vec(),
        },
    }
}

// =============================================================================
// Test Frames
// =============================================================================


// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn analog_input(instance: u32) -> ObjectReference {
        ObjectReference::new(ObjectType::AnalogInput, instance).unwrap()
    }

    #[test]
    fn test_encode_present_value_request() {
        let request = ReadPropertyRequest::new(analog_input(1), PropertyIdentifier::PresentValue);
        let frame = encode_read_property(7, &request);

        assert_eq!(
            frame,
            vec![
                0x81, 0x0A, 0x00, 0x11, // BVLC
                0x01, 0x04, // NPDU, expecting reply
                0x00, 0x05, 0x07, 0x0C, // confirmed ReadProperty, invoke 7
                0x0C, 0x00, 0x00, 0x00, 0x01, // analog-input 1
                0x19, 0x55, // present-value
            ]
        );
    }

    #[test]
    fn test_encode_array_index_and_large_instance() {
        let object = ObjectReference::new(ObjectType::AnalogValue, 58317).unwrap();
        let mut request = ReadPropertyRequest::new(object, PropertyIdentifier::PriorityArray);
        request.array_index = Some(8);

        let frame = encode_read_property(0, &request);
        let object_id = (2u32 << 22) | 58317;

        let mut expected_object = vec![0x0C];
        expected_object.extend_from_slice(&object_id.to_be_bytes());

        assert_eq!(&frame[10..15], expected_object.as_slice());
        assert_eq!(&frame[15..], &[0x19, 0x57, 0x29, 0x08]);
        assert_eq!(usize::from(u16::from_be_bytes([frame[2], frame[3]])), frame.len());
    }

    #[test]
    fn test_decode_real_present_value() {
        let request = ReadPropertyRequest::new(analog_input(1), PropertyIdentifier::PresentValue);
        let reply = complex_ack(7, &request, &[BacnetValue::Real(21.5)]);

        let frame = decode_response(&reply).unwrap().unwrap();
        assert_eq!(frame.invoke_id, 7);

        let payload = match frame.body {
            ResponseBody::ComplexAck { service, payload } => {
                assert_eq!(service, SERVICE_READ_PROPERTY);
                payload
            }
            other => panic!("expected complex ack, got {:?}", other),
        };

        let ack = decode_read_property_ack(&payload).unwrap();
        assert_eq!(ack.object_type, 0);
        assert_eq!(ack.instance, 1);
        assert_eq!(ack.property, 85);
        assert_eq!(ack.values, vec![BacnetValue::Real(21.5)]);
        assert_eq!(ack.values[0].as_f64(), Some(21.5));
    }

    #[test]
    fn test_real_maps_to_shortest_decimal() {
        assert_eq!(BacnetValue::Real(7.2).as_f64(), Some(7.2));
        assert_eq!(BacnetValue::Enumerated(1).as_f64(), Some(1.0));
        assert_eq!(BacnetValue::Null.as_f64(), None);
        assert_eq!(BacnetValue::CharacterString("x".into()).as_f64(), None);
    }

    #[test]
    fn test_decode_priority_array_with_nulls() {
        let object = ObjectReference::new(ObjectType::AnalogValue, 3).unwrap();
        let request = ReadPropertyRequest::new(object, PropertyIdentifier::PriorityArray);

        let mut slots = vec![BacnetValue::Null; 16];
        slots[7] = BacnetValue::Real(22.0);
        slots[15] = BacnetValue::Real(20.0);

        let reply = complex_ack(1, &request, &slots);
        let frame = decode_response(&reply).unwrap().unwrap();
        let ResponseBody::ComplexAck { payload, .. } = frame.body else {
            panic!("expected complex ack");
        };

        let ack = decode_read_property_ack(&payload).unwrap();
        assert_eq!(ack.values.len(), 16);
        assert!(ack.values[0].is_null());
        assert_eq!(ack.values[7].as_f64(), Some(22.0));
    }

    #[test]
    fn test_decode_object_name() {
        let object = ObjectReference::device(100).unwrap();
        let request = ReadPropertyRequest::new(object, PropertyIdentifier::ObjectName);
        let reply = complex_ack(
            3,
            &request,
            &[BacnetValue::CharacterString("Plant Room Controller".into())],
        );

        let frame = decode_response(&reply).unwrap().unwrap();
        let ResponseBody::ComplexAck { payload, .. } = frame.body else {
            panic!("expected complex ack");
        };
        let ack = decode_read_property_ack(&payload).unwrap();
        assert_eq!(ack.object_type, 8);
        assert_eq!(ack.values[0].as_str(), Some("Plant Room Controller"));
    }

    #[test]
    fn test_decode_error_and_reject() {
        let frame = decode_response(&error_pdu(9, 1, 31)).unwrap().unwrap();
        assert_eq!(frame.invoke_id, 9);
        assert_eq!(
            frame.body,
            ResponseBody::Error {
                service: SERVICE_READ_PROPERTY,
                class: 1,
                code: 31
            }
        );

        let frame = decode_response(&reject_pdu(4, 2)).unwrap().unwrap();
        assert_eq!(frame.body, ResponseBody::Reject { reason: 2 });
    }

    #[test]
    fn test_routed_reply_is_decoded() {
        // NPDU carrying SNET 5, SLEN 1, SADR 0x10 ahead of the APDU.
        let apdu = [PDU_REJECT << 4, 12, 3];
        let mut frame = vec![
            0x81, 0x0A, 0x00, 0x00, 0x01, NPDU_SNET_PRESENT, 0x00, 0x05, 0x01, 0x10,
        ];
        frame.extend_from_slice(&apdu);
        let len = frame.len() as u16;
        frame[2..4].copy_from_slice(&len.to_be_bytes());

        let decoded = decode_response(&frame).unwrap().unwrap();
        assert_eq!(decoded.invoke_id, 12);
    }

    #[test]
    fn test_non_reply_traffic_is_ignored() {
        // Network-layer message (Who-Is-Router-To-Network).
        let network_message = [0x81, 0x0B, 0x00, 0x07, 0x01, 0x80, 0x00];
        assert_eq!(decode_response(&network_message).unwrap(), None);

        // Unconfirmed I-Am APDU header.
        let i_am = [0x81, 0x0B, 0x00, 0x08, 0x01, 0x00, 0x10, 0x00];
        assert_eq!(decode_response(&i_am).unwrap(), None);

        // BVLC-Result control frame.
        let bvlc_result = [0x81, 0x00, 0x00, 0x06, 0x00, 0x00];
        assert_eq!(decode_response(&bvlc_result).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode_response(&[0x81]), Err(BacnetError::Malformed(_))));
        assert!(matches!(
            decode_response(&[0x82, 0x0A, 0x00, 0x04]),
            Err(BacnetError::Malformed(_))
        ));
        // Declared length longer than the datagram.
        assert!(matches!(
            decode_response(&[0x81, 0x0A, 0x00, 0x20, 0x01, 0x00]),
            Err(BacnetError::Malformed(_))
        ));
        assert!(matches!(
            decode_response(&[0x81, 0x0A, 0x00, 0x09, 0x01, 0x00, 0x38, 0x01, 0x0C]),
            Err(BacnetError::Malformed(_))
        ));
    }

    #[test]
    fn test_ack_missing_closing_tag_is_malformed() {
        let request = ReadPropertyRequest::new(analog_input(1), PropertyIdentifier::PresentValue);
        let reply = complex_ack(1, &request, &[BacnetValue::Real(1.0)]);
        let ResponseBody::ComplexAck { payload, .. } = decode_response(&reply).unwrap().unwrap().body
        else {
            panic!("expected complex ack");
        };

        let truncated = &payload[..payload.len() - 1];
        assert!(matches!(
            decode_read_property_ack(truncated),
            Err(BacnetError::Malformed(_))
        ));
    }

    #[test]
    fn test_signed_values_sign_extend() {
        assert_eq!(decode_signed(&[0xFF]).unwrap(), -1);
        assert_eq!(decode_signed(&[0xFF, 0x38]).unwrap(), -200);
        assert_eq!(decode_signed(&[0x01, 0x00]).unwrap(), 256);
    }

    #[test]
    fn test_encode_write_present_value() {
        let object = ObjectReference::new(ObjectType::AnalogValue, 3).unwrap();
        let request = WritePropertyRequest::present_value(object, BacnetValue::Real(21.5), 8);
        let frame = encode_write_property(0x21, &request);

        let mut expected = vec![
            0x81, 0x0A, 0x00, 0x00, // BVLC, length patched below
            0x01, 0x04, // NPDU, expecting reply
            0x00, 0x05, 0x21, 0x0F, // confirmed WriteProperty, invoke 0x21
            0x0C, 0x00, 0x80, 0x00, 0x03, // analog-value 3
            0x19, 0x55, // present-value
            0x3E, 0x44, // opening tag 3, REAL
        ];
        expected.extend_from_slice(&21.5f32.to_be_bytes());
        expected.extend_from_slice(&[0x3F, 0x49, 0x08]); // closing tag 3, priority 8
        let len = expected.len() as u16;
        expected[2..4].copy_from_slice(&len.to_be_bytes());

        assert_eq!(frame, expected);
    }

    #[test]
    fn test_encode_relinquish_writes_null() {
        let request = WritePropertyRequest::relinquish(analog_input(1), 16);
        let frame = encode_write_property(2, &request);

        assert_eq!(&frame[17..], &[0x3E, 0x00, 0x3F, 0x49, 0x10]);
    }

    #[test]
    fn test_decode_simple_ack() {
        let frame = decode_response(&simple_ack(5, SERVICE_WRITE_PROPERTY))
            .unwrap()
            .unwrap();
        assert_eq!(frame.invoke_id, 5);
        assert_eq!(
            frame.body,
            ResponseBody::SimpleAck {
                service: SERVICE_WRITE_PROPERTY
            }
        );

        // Header without the service byte.
        assert!(matches!(
            decode_response(&[0x81, 0x0A, 0x00, 0x08, 0x01, 0x00, 0x20, 0x05]),
            Err(BacnetError::Malformed(_))
        ));
    }

    #[test]
    fn test_application_values_use_minimal_octets() {
        let mut buf = Vec::new();
        encode_application_value(&BacnetValue::Unsigned(3), &mut buf);
        encode_application_value(&BacnetValue::Unsigned(300), &mut buf);
        encode_application_value(&BacnetValue::Signed(-200), &mut buf);
        encode_application_value(&BacnetValue::Enumerated(1), &mut buf);
        encode_application_value(&BacnetValue::Boolean(true), &mut buf);
        assert_eq!(
            buf,
            vec![0x21, 0x03, 0x22, 0x01, 0x2C, 0x32, 0xFF, 0x38, 0x91, 0x01, 0x11]
        );
    }

    #[test]
    fn test_long_strings_use_extended_length() {
        let name = "x".repeat(10);
        let mut buf = Vec::new();
        encode_application_value(&BacnetValue::CharacterString(name.clone()), &mut buf);

        // Tag 7, extended length 11 (charset byte plus ten characters).
        assert_eq!(&buf[..3], &[0x75, 11, CHARSET_UTF8]);
        assert_eq!(&buf[3..], name.as_bytes());
    }

    #[test]
    fn test_present_value_encoding_follows_object_type() {
        assert_eq!(
            BacnetValue::present_value_for(ObjectType::AnalogOutput, 7.25).unwrap(),
            BacnetValue::Real(7.25)
        );
        assert_eq!(
            BacnetValue::present_value_for(ObjectType::BinaryValue, 1.0).unwrap(),
            BacnetValue::Enumerated(1)
        );
        assert_eq!(
            BacnetValue::present_value_for(ObjectType::MultiStateValue, 3.0).unwrap(),
            BacnetValue::Unsigned(3)
        );

        for (object_type, value) in [
            (ObjectType::BinaryOutput, 0.5),
            (ObjectType::MultiStateOutput, 0.0),
            (ObjectType::MultiStateOutput, 2.5),
            (ObjectType::Device, 1.0),
            (ObjectType::AnalogValue, f64::NAN),
        ] {
            assert!(
                matches!(
                    BacnetValue::present_value_for(object_type, value),
                    Err(BacnetError::UnexpectedValue(_))
                ),
                "{:?} accepted {}",
                object_type,
                value
            );
        }
    }
}

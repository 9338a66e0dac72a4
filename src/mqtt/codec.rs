//! MQTT 3.1/3.1.1 frame codec.
//!
//! Decodes frames read from a stream into [`Message`] values and encodes the
//! messages the engine pushes back into frames. Routing metadata is never on
//! the wire; the transport attaches it.

use super::message::{
    Connect, ConnectAck, Disconnect, Header, Message, MessageId, Packet, Publish, Qos, Subscribe,
    SubscribeAck, TopicRequest, Unsubscribe, Will,
};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PUBREC: u8 = 5;
pub const PUBREL: u8 = 6;
pub const PUBCOMP: u8 = 7;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const UNSUBSCRIBE: u8 = 10;
pub const UNSUBACK: u8 = 11;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected end of frame")]
    Truncated,
    #[error("malformed remaining length")]
    RemainingLength,
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("unsupported packet type {0}")]
    UnsupportedType(u8),
    #[error("invalid fixed header flags {flags:#x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },
    #[error("invalid qos {0}")]
    InvalidQos(u8),
    #[error("invalid utf8 in mqtt string")]
    Utf8,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("message id required for qos {0}")]
    MissingMessageId(Qos),
    #[error("packet {0} is not sent by the server")]
    NotEncodable(&'static str),
}

/// Read one control packet from the stream.
///
/// Returns `CodecError::Closed` when the peer closes the stream on a frame boundary.
pub async fn read_message<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    max_frame_bytes: usize,
) -> Result<Message, CodecError> {
    let mut first = [0u8; 1];
    match stream.read_exact(&mut first).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::Closed)
        }
        Err(err) => return Err(err.into()),
    }
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;
    let remaining_len = decode_remaining_length_stream(stream).await?;
    if remaining_len > max_frame_bytes {
        return Err(CodecError::TooLarge(remaining_len));
    }
    let mut buf = vec![0u8; remaining_len];
    stream.read_exact(&mut buf).await?;
    decode_packet(packet_type, flags, &buf)
}

/// Decode a frame body given its fixed header.
pub fn decode_packet(packet_type: u8, flags: u8, buf: &[u8]) -> Result<Message, CodecError> {
    match packet_type {
        CONNECT => {
            expect_flags(packet_type, flags, 0)?;
            Ok(Message::new(
                Header::default(),
                Packet::Connect(parse_connect(buf)?),
            ))
        }
        PUBLISH => parse_publish(flags, buf),
        PUBACK => ack(packet_type, flags, 0, buf, Packet::PublishAck),
        PUBREC => ack(packet_type, flags, 0, buf, Packet::PublishReceived),
        PUBREL => ack(packet_type, flags, 0b0010, buf, Packet::Release),
        PUBCOMP => ack(packet_type, flags, 0, buf, Packet::Complete),
        SUBSCRIBE => {
            expect_flags(packet_type, flags, 0b0010)?;
            parse_subscribe(buf)
        }
        UNSUBSCRIBE => {
            expect_flags(packet_type, flags, 0b0010)?;
            parse_unsubscribe(buf)
        }
        PINGREQ => {
            expect_flags(packet_type, flags, 0)?;
            Ok(Message::new(Header::default(), Packet::Ping))
        }
        DISCONNECT => {
            expect_flags(packet_type, flags, 0)?;
            Ok(Message::new(
                Header::default(),
                Packet::Disconnect(Disconnect { clean: true }),
            ))
        }
        other => Err(CodecError::UnsupportedType(other)),
    }
}

/// Encode a message the engine pushes toward a client.
///
/// `Disconnect` has no 3.1.1 server-to-client frame and encodes to `None`;
/// the transport closes the socket instead.
pub fn encode(message: &Message) -> Result<Option<Bytes>, CodecError> {
    let header = &message.header;
    let frame = match &message.packet {
        Packet::ConnectAck(ack) => encode_connack(ack),
        Packet::Publish(publish) => encode_publish(header, publish)?,
        Packet::PublishAck => encode_ack(0x40, header)?,
        Packet::PublishReceived => encode_ack(0x50, header)?,
        Packet::Release => encode_ack(0x62, header)?,
        Packet::Complete => encode_ack(0x70, header)?,
        Packet::SubscribeAck(ack) => encode_suback(header, ack)?,
        Packet::UnsubscribeAck => encode_ack(0xB0, header)?,
        Packet::Ping => vec![PINGRESP << 4, 0x00],
        Packet::Disconnect(_) => return Ok(None),
        other => return Err(CodecError::NotEncodable(other.label())),
    };
    Ok(Some(Bytes::from(frame)))
}

pub async fn write_message<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    message: &Message,
) -> Result<(), CodecError> {
    if let Some(frame) = encode(message)? {
        stream.write_all(&frame).await?;
    }
    Ok(())
}

/// Encode a client-side frame. Used by tests and tooling that act as a client.
pub fn encode_client(message: &Message) -> Result<Bytes, CodecError> {
    let header = &message.header;
    let frame = match &message.packet {
        Packet::Connect(connect) => encode_connect(connect),
        Packet::Publish(publish) => encode_publish(header, publish)?,
        Packet::PublishAck => encode_ack(0x40, header)?,
        Packet::PublishReceived => encode_ack(0x50, header)?,
        Packet::Release => encode_ack(0x62, header)?,
        Packet::Complete => encode_ack(0x70, header)?,
        Packet::Subscribe(subscribe) => {
            let mut body = message_id_bytes(header)?.to_vec();
            for request in &subscribe.topics {
                put_string(&mut body, &request.filter);
                body.push(request.qos.as_u8());
            }
            build_frame(0x82, body)
        }
        Packet::Unsubscribe(unsubscribe) => {
            let mut body = message_id_bytes(header)?.to_vec();
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter);
            }
            build_frame(0xA2, body)
        }
        Packet::Ping => vec![PINGREQ << 4, 0x00],
        Packet::Disconnect(_) => vec![DISCONNECT << 4, 0x00],
        other => return Err(CodecError::NotEncodable(other.label())),
    };
    Ok(Bytes::from(frame))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn expect_flags(packet_type: u8, flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags != expected {
        return Err(CodecError::InvalidFlags { packet_type, flags });
    }
    Ok(())
}

fn ack(
    packet_type: u8,
    flags: u8,
    expected_flags: u8,
    buf: &[u8],
    packet: Packet,
) -> Result<Message, CodecError> {
    expect_flags(packet_type, flags, expected_flags)?;
    let mut cursor = 0usize;
    let id = read_message_id(buf, &mut cursor)?;
    Ok(Message::new(Header::with_id(id), packet))
}

fn parse_connect(buf: &[u8]) -> Result<Connect, CodecError> {
    let mut cursor = 0usize;
    let protocol_name = read_string(buf, &mut cursor)?;
    let protocol_level = read_u8(buf, &mut cursor)?;
    let connect_flags = read_u8(buf, &mut cursor)?;
    let keep_alive = read_u16(buf, &mut cursor)?;
    if connect_flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved connect flag set"));
    }
    let client_id = read_string(buf, &mut cursor)?;
    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let mut will = None;
    if will_flag {
        let qos = Qos::from_u8(will_qos_bits).ok_or(CodecError::InvalidQos(will_qos_bits))?;
        let topic = read_string(buf, &mut cursor)?;
        let payload = read_binary(buf, &mut cursor)?;
        will = Some(Will {
            topic,
            payload: Bytes::from(payload),
            qos,
            retain: will_retain,
        });
    } else if will_qos_bits != 0 || will_retain {
        return Err(CodecError::Malformed("will qos/retain without will flag"));
    }
    let username_flag = (connect_flags & 0x80) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username = if username_flag {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(Bytes::from(read_binary(buf, &mut cursor)?))
    } else {
        None
    };
    Ok(Connect {
        protocol_name,
        protocol_level,
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
        will,
        protocol_data: None,
    })
}

fn parse_publish(flags: u8, buf: &[u8]) -> Result<Message, CodecError> {
    let dup = (flags & 0b0000_1000) != 0;
    let retain = (flags & 0b0000_0001) != 0;
    let qos_bits = (flags & 0b0000_0110) >> 1;
    let qos = Qos::from_u8(qos_bits).ok_or(CodecError::InvalidQos(qos_bits))?;
    if qos == Qos::AtMostOnce && dup {
        return Err(CodecError::Malformed("dup flag set for qos0 publish"));
    }
    let mut cursor = 0usize;
    let topic = read_string(buf, &mut cursor)?;
    let message_id = match qos {
        Qos::AtMostOnce => None,
        _ => Some(MessageId::Packet(read_message_id(buf, &mut cursor)?)),
    };
    let payload = Bytes::copy_from_slice(&buf[cursor..]);
    Ok(Message::new(
        Header {
            message_id,
            qos,
            dup,
            retain,
        },
        Packet::Publish(Publish { topic, payload }),
    ))
}

fn parse_subscribe(buf: &[u8]) -> Result<Message, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_message_id(buf, &mut cursor)?;
    let mut topics = Vec::new();
    while cursor < buf.len() {
        let filter = read_string(buf, &mut cursor)?;
        let opts = read_u8(buf, &mut cursor)?;
        if opts & 0b1111_1100 != 0 {
            return Err(CodecError::Malformed("reserved subscription flags set"));
        }
        let qos = Qos::from_u8(opts & 0x03).ok_or(CodecError::InvalidQos(opts & 0x03))?;
        topics.push(TopicRequest { filter, qos });
    }
    if topics.is_empty() {
        return Err(CodecError::Malformed("subscribe without topic filters"));
    }
    Ok(Message::new(
        Header::with_id(packet_id),
        Packet::Subscribe(Subscribe {
            topics,
            protocol_data: None,
        }),
    ))
}

fn parse_unsubscribe(buf: &[u8]) -> Result<Message, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_message_id(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        filters.push(read_string(buf, &mut cursor)?);
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("unsubscribe without topic filters"));
    }
    Ok(Message::new(
        Header::with_id(packet_id),
        Packet::Unsubscribe(Unsubscribe { filters }),
    ))
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, CodecError> {
    let v = *buf.get(*cursor).ok_or(CodecError::Truncated)?;
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, CodecError> {
    if *cursor + 2 > buf.len() {
        return Err(CodecError::Truncated);
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

/// Packet identifiers are non-zero.
fn read_message_id(buf: &[u8], cursor: &mut usize) -> Result<u16, CodecError> {
    match read_u16(buf, cursor)? {
        0 => Err(CodecError::Malformed("zero message id")),
        id => Ok(id),
    }
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, CodecError> {
    let bytes = read_binary(buf, cursor)?;
    String::from_utf8(bytes).map_err(|_| CodecError::Utf8)
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, CodecError> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        return Err(CodecError::Truncated);
    }
    let bytes = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

async fn decode_remaining_length_stream<S: AsyncReadExt + Unpin>(
    stream: &mut S,
) -> Result<usize, CodecError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        value += (byte[0] & 0x7F) as usize * multiplier;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(CodecError::RemainingLength)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

fn build_frame(first: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![first];
    out.extend(encode_remaining_length(body.len()));
    out.extend(body);
    out
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_binary(buf, value.as_bytes());
}

fn put_binary(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

fn message_id_bytes(header: &Header) -> Result<[u8; 2], CodecError> {
    header
        .packet_id()
        .map(u16::to_be_bytes)
        .ok_or(CodecError::MissingMessageId(header.qos))
}

fn encode_connack(ack: &ConnectAck) -> Vec<u8> {
    let flags = if ack.session_present { 0x01 } else { 0x00 };
    build_frame(CONNACK << 4, vec![flags, ack.code.as_u8()])
}

fn encode_ack(first: u8, header: &Header) -> Result<Vec<u8>, CodecError> {
    Ok(build_frame(first, message_id_bytes(header)?.to_vec()))
}

fn encode_suback(header: &Header, ack: &SubscribeAck) -> Result<Vec<u8>, CodecError> {
    let mut body = message_id_bytes(header)?.to_vec();
    body.extend(ack.granted.iter().map(|grant| grant.code()));
    Ok(build_frame(SUBACK << 4, body))
}

fn encode_publish(header: &Header, publish: &Publish) -> Result<Vec<u8>, CodecError> {
    let dup_bit = if header.dup { 0b0000_1000 } else { 0 };
    let retain_bit = if header.retain { 0x01 } else { 0x00 };
    let first = (PUBLISH << 4) | dup_bit | (header.qos.as_u8() << 1) | retain_bit;
    let mut body = Vec::with_capacity(publish.topic.len() + publish.payload.len() + 4);
    put_string(&mut body, &publish.topic);
    if header.qos != Qos::AtMostOnce {
        body.extend_from_slice(&message_id_bytes(header)?);
    }
    body.extend_from_slice(&publish.payload);
    Ok(build_frame(first, body))
}

fn encode_connect(connect: &Connect) -> Vec<u8> {
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | (will.qos.as_u8() << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    let mut body = Vec::new();
    put_string(&mut body, &connect.protocol_name);
    body.push(connect.protocol_level);
    body.push(flags);
    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    put_string(&mut body, &connect.client_id);
    if let Some(will) = &connect.will {
        put_string(&mut body, &will.topic);
        put_binary(&mut body, &will.payload);
    }
    if let Some(username) = &connect.username {
        put_string(&mut body, username);
    }
    if let Some(password) = &connect.password {
        put_binary(&mut body, password);
    }
    build_frame(CONNECT << 4, body)
}

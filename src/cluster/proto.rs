//! CBOR envelope helpers for wire-bound replica messages.
//!
//! Framing and delivery belong to the transport; this module only fixes the
//! payload shape so every transport ships the same bytes.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::key::NodeId;
use super::log::LogEntry;
use super::message::ReplicaMessage;

pub const WIRE_VERSION: u32 = 1;

/// A replica message addressed to a peer node, tagged with the owning
/// channel so the receiver can route it.
#[derive(Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    pub channel_id: String,
    pub channel_type: u8,
    pub to: NodeId,
    pub message: ReplicaMessage,
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),

    #[error("message kind {0} is not wire-bound")]
    NotWire(&'static str),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("cbor: {0}")]
    Cbor(#[from] minicbor::decode::Error),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown message type {0}")]
    UnknownMessageType(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

pub fn encode_envelope(envelope: &WireEnvelope) -> Result<Vec<u8>, ProtoEncodeError> {
    if !envelope.message.is_wire() {
        return Err(ProtoEncodeError::NotWire(envelope.message.kind()));
    }
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(6)?;
    enc.str("v")?;
    enc.u32(WIRE_VERSION)?;
    enc.str("channel_id")?;
    enc.str(&envelope.channel_id)?;
    enc.str("channel_type")?;
    enc.u8(envelope.channel_type)?;
    enc.str("to")?;
    enc.u64(envelope.to)?;
    enc.str("type")?;
    enc.str(envelope.message.kind())?;
    enc.str("body")?;
    encode_body(&mut enc, &envelope.message)?;
    Ok(buf)
}

fn encode_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    message: &ReplicaMessage,
) -> Result<(), ProtoEncodeError> {
    match message {
        ReplicaMessage::Sync { from, index } => {
            enc.map(2)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("index")?;
            enc.u64(*index)?;
        }
        ReplicaMessage::SyncResp {
            from,
            term,
            prev_log_index,
            prev_log_term,
            committed_index,
            logs,
            trace_ids,
            span_ids,
        } => {
            enc.map(8)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("term")?;
            enc.u32(*term)?;
            enc.str("prev_log_index")?;
            enc.u64(*prev_log_index)?;
            enc.str("prev_log_term")?;
            enc.u32(*prev_log_term)?;
            enc.str("committed_index")?;
            enc.u64(*committed_index)?;
            enc.str("logs")?;
            encode_logs(enc, logs)?;
            enc.str("trace_ids")?;
            enc.array(trace_ids.len() as u64)?;
            for id in trace_ids {
                enc.bytes(id)?;
            }
            enc.str("span_ids")?;
            enc.array(span_ids.len() as u64)?;
            for id in span_ids {
                enc.bytes(id)?;
            }
        }
        ReplicaMessage::Vote {
            from,
            term,
            last_log_index,
            last_log_term,
        } => {
            enc.map(4)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("term")?;
            enc.u32(*term)?;
            enc.str("last_log_index")?;
            enc.u64(*last_log_index)?;
            enc.str("last_log_term")?;
            enc.u32(*last_log_term)?;
        }
        ReplicaMessage::VoteResp {
            from,
            term,
            granted,
        } => {
            enc.map(3)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("term")?;
            enc.u32(*term)?;
            enc.str("granted")?;
            enc.bool(*granted)?;
        }
        ReplicaMessage::Heartbeat {
            from,
            term,
            committed_index,
        } => {
            enc.map(3)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("term")?;
            enc.u32(*term)?;
            enc.str("committed_index")?;
            enc.u64(*committed_index)?;
        }
        ReplicaMessage::HeartbeatResp { from, term } => {
            enc.map(2)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("term")?;
            enc.u32(*term)?;
        }
        other => return Err(ProtoEncodeError::NotWire(other.kind())),
    }
    Ok(())
}

fn encode_logs(
    enc: &mut Encoder<&mut Vec<u8>>,
    logs: &[LogEntry],
) -> Result<(), ProtoEncodeError> {
    enc.array(logs.len() as u64)?;
    for log in logs {
        enc.array(3)?;
        enc.u64(log.index)?;
        enc.u32(log.term)?;
        enc.bytes(&log.data)?;
    }
    Ok(())
}

pub fn decode_envelope(bytes: &[u8]) -> Result<WireEnvelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut version = None;
    let mut channel_id = None;
    let mut channel_type = None;
    let mut to = None;
    let mut message_type: Option<String> = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "v" => version = Some(dec.u32()?),
            "channel_id" => channel_id = Some(dec.str()?.to_string()),
            "channel_type" => channel_type = Some(dec.u8()?),
            "to" => to = Some(dec.u64()?),
            "type" => message_type = Some(dec.str()?.to_string()),
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => dec.skip()?,
        }
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != WIRE_VERSION {
        return Err(ProtoDecodeError::UnsupportedVersion(version));
    }
    let channel_id = channel_id.ok_or(ProtoDecodeError::MissingField("channel_id"))?;
    let channel_type = channel_type.ok_or(ProtoDecodeError::MissingField("channel_type"))?;
    let to = to.ok_or(ProtoDecodeError::MissingField("to"))?;
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;

    let message = decode_body(&message_type, &bytes[start..end])?;

    Ok(WireEnvelope {
        channel_id,
        channel_type,
        to,
        message,
    })
}

fn decode_body(message_type: &str, bytes: &[u8]) -> Result<ReplicaMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut from = 0u64;
    let mut term = 0u32;
    let mut index = 0u64;
    let mut prev_log_index = 0u64;
    let mut prev_log_term = 0u32;
    let mut committed_index = 0u64;
    let mut last_log_index = 0u64;
    let mut last_log_term = 0u32;
    let mut granted = false;
    let mut logs = Vec::new();
    let mut trace_ids = Vec::new();
    let mut span_ids = Vec::new();

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "from" => from = dec.u64()?,
            "term" => term = dec.u32()?,
            "index" => index = dec.u64()?,
            "prev_log_index" => prev_log_index = dec.u64()?,
            "prev_log_term" => prev_log_term = dec.u32()?,
            "committed_index" => committed_index = dec.u64()?,
            "last_log_index" => last_log_index = dec.u64()?,
            "last_log_term" => last_log_term = dec.u32()?,
            "granted" => granted = dec.bool()?,
            "logs" => logs = decode_logs(&mut dec)?,
            "trace_ids" => trace_ids = decode_fixed_bytes::<16>(&mut dec, "trace_ids")?,
            "span_ids" => span_ids = decode_fixed_bytes::<8>(&mut dec, "span_ids")?,
            _ => dec.skip()?,
        }
    }

    if from == 0 {
        return Err(ProtoDecodeError::MissingField("from"));
    }

    let message = match message_type {
        "sync" => ReplicaMessage::Sync { from, index },
        "sync_resp" => ReplicaMessage::SyncResp {
            from,
            term,
            prev_log_index,
            prev_log_term,
            committed_index,
            logs,
            trace_ids,
            span_ids,
        },
        "vote" => ReplicaMessage::Vote {
            from,
            term,
            last_log_index,
            last_log_term,
        },
        "vote_resp" => ReplicaMessage::VoteResp {
            from,
            term,
            granted,
        },
        "heartbeat" => ReplicaMessage::Heartbeat {
            from,
            term,
            committed_index,
        },
        "heartbeat_resp" => ReplicaMessage::HeartbeatResp { from, term },
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    Ok(message)
}

fn decode_logs(dec: &mut Decoder<'_>) -> Result<Vec<LogEntry>, ProtoDecodeError> {
    let len = decode_array_len(dec, "logs")?;
    let mut logs = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        let entry_len = decode_array_len(dec, "logs")?;
        if entry_len != 3 {
            return Err(ProtoDecodeError::InvalidField {
                field: "logs",
                reason: format!("log entry has {entry_len} elements, want 3"),
            });
        }
        let index = dec.u64()?;
        let term = dec.u32()?;
        let data = Bytes::copy_from_slice(dec.bytes()?);
        logs.push(LogEntry::new(index, term, data));
    }
    Ok(logs)
}

fn decode_fixed_bytes<const N: usize>(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<Vec<[u8; N]>, ProtoDecodeError> {
    let len = decode_array_len(dec, field)?;
    let mut ids = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        let raw = dec.bytes()?;
        let id: [u8; N] = raw.try_into().map_err(|_| ProtoDecodeError::InvalidField {
            field,
            reason: format!("want {N} bytes, got {}", raw.len()),
        })?;
        ids.push(id);
    }
    Ok(ids)
}

fn decode_map_len(dec: &mut Decoder<'_>) -> Result<u64, ProtoDecodeError> {
    if dec.datatype()? != Type::Map {
        return Err(ProtoDecodeError::InvalidField {
            field: "envelope",
            reason: "expected map".to_string(),
        });
    }
    dec.map()?.ok_or(ProtoDecodeError::InvalidField {
        field: "envelope",
        reason: "indefinite-length map".to_string(),
    })
}

fn decode_array_len(dec: &mut Decoder<'_>, field: &'static str) -> Result<u64, ProtoDecodeError> {
    dec.array()?.ok_or(ProtoDecodeError::InvalidField {
        field,
        reason: "indefinite-length array".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_resp_carries_logs_and_trace_ids() {
        let envelope = WireEnvelope {
            channel_id: "general".to_string(),
            channel_type: 2,
            to: 3,
            message: ReplicaMessage::SyncResp {
                from: 1,
                term: 4,
                prev_log_index: 10,
                prev_log_term: 3,
                committed_index: 9,
                logs: vec![LogEntry::new(11, 4, Bytes::from_static(b"hello"))],
                trace_ids: vec![[7u8; 16]],
                span_ids: vec![[9u8; 8]],
            },
        };
        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn local_kinds_are_rejected() {
        let envelope = WireEnvelope {
            channel_id: "general".to_string(),
            channel_type: 2,
            to: 3,
            message: ReplicaMessage::StoreAppendResp { index: 5 },
        };
        assert!(matches!(
            encode_envelope(&envelope),
            Err(ProtoEncodeError::NotWire("store_append_resp"))
        ));
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let envelope = WireEnvelope {
            channel_id: "general".to_string(),
            channel_type: 2,
            to: 3,
            message: ReplicaMessage::Heartbeat {
                from: 1,
                term: 1,
                committed_index: 0,
            },
        };
        let bytes = encode_envelope(&envelope).unwrap();
        let text = b"heartbeat";
        let pos = bytes
            .windows(text.len())
            .position(|window| window == text)
            .unwrap();
        let mut mangled = bytes.clone();
        mangled[pos..pos + text.len()].copy_from_slice(b"heartbeXt");
        assert!(matches!(
            decode_envelope(&mangled),
            Err(ProtoDecodeError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_cbor_error() {
        let envelope = WireEnvelope {
            channel_id: "general".to_string(),
            channel_type: 2,
            to: 2,
            message: ReplicaMessage::Sync { from: 3, index: 12 },
        };
        let bytes = encode_envelope(&envelope).unwrap();
        assert!(decode_envelope(&bytes[..bytes.len() / 2]).is_err());
    }
}

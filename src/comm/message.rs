//! Capability connection messages.
//!
//! Each side numbers its own outstanding questions and its own exported
//! capabilities.  A capability inside a payload travels as the sender's export
//! id; the receiver imports it and later sends `Release` for it.

use std::io::{Error, ErrorKind};

use super::rwutil::{Decoder, Encoder};

/// Wire value standing in for a null capability in a cap table.
pub const NULL_CAP: u32 = u32::MAX;

const TAG_BOOTSTRAP: u8 = 1;
const TAG_CALL: u8 = 2;
const TAG_RETURN: u8 = 3;
const TAG_RELEASE: u8 = 4;
const TAG_ABORT: u8 = 5;

const RESULT_OK: u8 = 0;
const RESULT_EXCEPTION: u8 = 1;

/// Call parameters or results as they appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WirePayload {
    pub content: Vec<u8>,
    /// Sender-hosted export ids; `None` is a null capability.
    pub caps: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask for the peer's bootstrap capability.
    Bootstrap { question: u32 },
    /// Invoke `method` on the receiver's export `target`.
    Call {
        question: u32,
        target: u32,
        method: u16,
        params: WirePayload,
    },
    /// Answer to a `Bootstrap` or `Call`.  Bootstrap answers carry the
    /// capability as the first cap table entry.
    Return {
        answer: u32,
        result: Result<WirePayload, String>,
    },
    /// Drop `count` references to the receiver's export.
    Release { export: u32, count: u32 },
    /// The sender is giving up on the connection.
    Abort { reason: String },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Message::Bootstrap { question } => {
                enc.put_u8(TAG_BOOTSTRAP).put_u32(*question);
            }
            Message::Call {
                question,
                target,
                method,
                params,
            } => {
                enc.put_u8(TAG_CALL)
                    .put_u32(*question)
                    .put_u32(*target)
                    .put_u16(*method);
                put_payload(&mut enc, params);
            }
            Message::Return { answer, result } => {
                enc.put_u8(TAG_RETURN).put_u32(*answer);
                match result {
                    Ok(payload) => {
                        enc.put_u8(RESULT_OK);
                        put_payload(&mut enc, payload);
                    }
                    Err(reason) => {
                        enc.put_u8(RESULT_EXCEPTION).put_str(reason);
                    }
                }
            }
            Message::Release { export, count } => {
                enc.put_u8(TAG_RELEASE).put_u32(*export).put_u32(*count);
            }
            Message::Abort { reason } => {
                enc.put_u8(TAG_ABORT).put_str(reason);
            }
        }
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Message, Error> {
        let mut dec = Decoder::new(buf);
        let msg = match dec.get_u8()? {
            TAG_BOOTSTRAP => Message::Bootstrap {
                question: dec.get_u32()?,
            },
            TAG_CALL => Message::Call {
                question: dec.get_u32()?,
                target: dec.get_u32()?,
                method: dec.get_u16()?,
                params: get_payload(&mut dec)?,
            },
            TAG_RETURN => {
                let answer = dec.get_u32()?;
                let result = match dec.get_u8()? {
                    RESULT_OK => Ok(get_payload(&mut dec)?),
                    RESULT_EXCEPTION => Err(dec.get_string()?),
                    other => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("unknown return kind {other}"),
                        ));
                    }
                };
                Message::Return { answer, result }
            }
            TAG_RELEASE => Message::Release {
                export: dec.get_u32()?,
                count: dec.get_u32()?,
            },
            TAG_ABORT => Message::Abort {
                reason: dec.get_string()?,
            },
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown message tag {other}"),
                ));
            }
        };
        dec.finish()?;
        Ok(msg)
    }
}

fn put_payload(enc: &mut Encoder, payload: &WirePayload) {
    enc.put_bytes(&payload.content);
    enc.put_u32(payload.caps.len() as u32);
    for cap in &payload.caps {
        enc.put_u32(cap.unwrap_or(NULL_CAP));
    }
}

fn get_payload(dec: &mut Decoder<'_>) -> Result<WirePayload, Error> {
    let content = dec.get_bytes()?;
    let count = dec.get_u32()?;
    let mut caps = Vec::new();
    for _ in 0..count {
        let id = dec.get_u32()?;
        caps.push(if id == NULL_CAP { None } else { Some(id) });
    }
    Ok(WirePayload { content, caps })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_layout() {
        let msg = Message::Call {
            question: 1,
            target: 2,
            method: 3,
            params: WirePayload {
                content: b"hi".to_vec(),
                caps: vec![Some(5), None],
            },
        };
        let expected: &[u8] = &[
            TAG_CALL, //
            0, 0, 0, 1, // question
            0, 0, 0, 2, // target
            0, 3, // method
            0, 0, 0, 2, b'h', b'i', // content
            0, 0, 0, 2, // cap count
            0, 0, 0, 5, // export 5
            0xff, 0xff, 0xff, 0xff, // null
        ];
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(expected).unwrap(), msg);
    }

    #[test]
    fn exception_return_decodes() {
        let msg = Message::Return {
            answer: 9,
            result: Err("no bootstrap capability".to_string()),
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = Message::decode(&[0x42]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut data = Message::Release { export: 1, count: 1 }.encode();
        data.push(0);
        assert!(Message::decode(&data).is_err());
    }
}

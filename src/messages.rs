use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde_bencode::value::Value;

use crate::error::{Error, Result};
use crate::util::validate_ip;

/// The definitive list of protocol messages. Effectively, this defines the
/// protocol: every message is a bencoded dictionary with a `msg` name field
/// plus the arguments listed in [`schema`], each constrained by a
/// [`Rule`]. Both inbound and outbound messages are checked against the
/// same table.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Helo(Helo),
    Ping,
    Pong,
    PexRequest,
    Pex {
        peerid: String,
        ip: String,
        port: u16,
    },
    RefChange,
    FileGet {
        file: String,
        id: i64,
    },
    FileDat {
        id: i64,
        chunk: i64,
        buf: Vec<u8>,
    },
    FileAck {
        id: i64,
        chunk: i64,
    },
    FileCancel {
        id: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Helo {
    pub peerid: String,
    pub swarmid: String,
    pub port: u16,
    pub client: String,
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Str,
    Int,
    Bytes,
}

/// Restrictions on a single message argument. Length rules apply to
/// strings and byte blobs, numeric bounds to integers.
struct Rule {
    kind: Kind,
    fixed_str: Option<&'static str>,
    fixed_int: Option<i64>,
    min_len: Option<usize>,
    max_len: Option<usize>,
    len: Option<usize>,
    regex: Option<&'static Regex>,
    min: Option<i64>,
    max: Option<i64>,
    function: Option<fn(&str) -> bool>,
}

impl Rule {
    const fn new(kind: Kind) -> Self {
        Rule {
            kind,
            fixed_str: None,
            fixed_int: None,
            min_len: None,
            max_len: None,
            len: None,
            regex: None,
            min: None,
            max: None,
            function: None,
        }
    }
}

lazy_static! {
    static ref PEERID_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
    static ref SWARMID_RE: Regex = Regex::new(r"^[0-9a-f]+$").unwrap();
    static ref FILE_RE: Regex = Regex::new(r"^[.a-zA-Z0-9/_-]+$").unwrap();
    static ref SCHEMA: HashMap<&'static str, Vec<(&'static str, Rule)>> = schema();
}

fn peerid_rule() -> Rule {
    Rule {
        min_len: Some(3),
        max_len: Some(30),
        regex: Some(&PEERID_RE),
        ..Rule::new(Kind::Str)
    }
}

fn id_rule() -> Rule {
    Rule {
        min: Some(0),
        ..Rule::new(Kind::Int)
    }
}

fn schema() -> HashMap<&'static str, Vec<(&'static str, Rule)>> {
    HashMap::from([
        (
            "helo",
            vec![
                (
                    "protocol",
                    Rule {
                        fixed_str: Some(crate::config::PROTOCOL_NAME),
                        ..Rule::new(Kind::Str)
                    },
                ),
                (
                    "major",
                    Rule {
                        fixed_int: Some(crate::config::MAJOR_VERSION),
                        ..Rule::new(Kind::Int)
                    },
                ),
                (
                    "minor",
                    Rule {
                        fixed_int: Some(crate::config::MINOR_VERSION),
                        ..Rule::new(Kind::Int)
                    },
                ),
                ("peerid", peerid_rule()),
                (
                    "swarmid",
                    Rule {
                        len: Some(40),
                        regex: Some(&SWARMID_RE),
                        ..Rule::new(Kind::Str)
                    },
                ),
                (
                    "port",
                    Rule {
                        min: Some(1),
                        max: Some(0xfffe),
                        ..Rule::new(Kind::Int)
                    },
                ),
                (
                    "client",
                    Rule {
                        min_len: Some(1),
                        max_len: Some(30),
                        ..Rule::new(Kind::Str)
                    },
                ),
            ],
        ),
        ("ping", vec![]),
        ("pong", vec![]),
        ("pex_request", vec![]),
        (
            "pex",
            vec![
                ("peerid", peerid_rule()),
                (
                    "ip",
                    Rule {
                        function: Some(validate_ip),
                        ..Rule::new(Kind::Str)
                    },
                ),
                (
                    "port",
                    Rule {
                        min: Some(1),
                        max: Some(0xffff),
                        ..Rule::new(Kind::Int)
                    },
                ),
            ],
        ),
        ("ref_change", vec![]),
        (
            "file_get",
            vec![
                (
                    "file",
                    Rule {
                        min_len: Some(1),
                        regex: Some(&FILE_RE),
                        ..Rule::new(Kind::Str)
                    },
                ),
                ("id", id_rule()),
            ],
        ),
        (
            "file_dat",
            vec![
                ("id", id_rule()),
                ("chunk", id_rule()),
                ("buf", Rule::new(Kind::Bytes)),
            ],
        ),
        (
            "file_ack",
            vec![("id", id_rule()), ("chunk", id_rule())],
        ),
        ("file_cancel", vec![("id", id_rule())]),
    ])
}

/// Check one decoded dictionary against the schema for `name`. Returns the
/// failure reason so callers can wrap it as a protocol error (inbound) or a
/// decoder error (outbound).
fn validate(name: &str, dict: &HashMap<Vec<u8>, Value>) -> std::result::Result<(), String> {
    let args = SCHEMA
        .get(name)
        .ok_or_else(|| format!("unknown message type {:?}", name))?;

    for (field, rule) in args {
        let value = dict
            .get(field.as_bytes())
            .ok_or_else(|| format!("required field {:?} is missing", field))?;

        match (rule.kind, value) {
            (Kind::Int, Value::Int(n)) => {
                if let Some(fixed) = rule.fixed_int {
                    if *n != fixed {
                        return Err(format!("field {:?} failed check: fixed value {}", field, fixed));
                    }
                }
                if let Some(min) = rule.min {
                    if *n < min {
                        return Err(format!("field {:?} failed check: min {}", field, min));
                    }
                }
                if let Some(max) = rule.max {
                    if *n > max {
                        return Err(format!("field {:?} failed check: max {}", field, max));
                    }
                }
            }
            (Kind::Bytes, Value::Bytes(_)) => {}
            (Kind::Str, Value::Bytes(raw)) => {
                let s = std::str::from_utf8(raw)
                    .map_err(|_| format!("field {:?} is not valid utf-8", field))?;
                if let Some(fixed) = rule.fixed_str {
                    if s != fixed {
                        return Err(format!("field {:?} failed check: fixed value {:?}", field, fixed));
                    }
                }
                if let Some(min_len) = rule.min_len {
                    if s.len() < min_len {
                        return Err(format!("field {:?} failed check: min len {}", field, min_len));
                    }
                }
                if let Some(max_len) = rule.max_len {
                    if s.len() > max_len {
                        return Err(format!("field {:?} failed check: max len {}", field, max_len));
                    }
                }
                if let Some(len) = rule.len {
                    if s.len() != len {
                        return Err(format!("field {:?} failed check: len {}", field, len));
                    }
                }
                if let Some(re) = rule.regex {
                    if !re.is_match(s) {
                        return Err(format!("field {:?} failed check: regex", field));
                    }
                }
                if let Some(f) = rule.function {
                    if !f(s) {
                        return Err(format!("field {:?} failed check: function", field));
                    }
                }
            }
            _ => return Err(format!("field {:?} has the wrong type", field)),
        }
    }

    // Extra fields are tolerated here; the typed constructors below never
    // read them, so unvalidated input cannot leak into handlers.
    Ok(())
}

fn take_str(dict: &mut HashMap<Vec<u8>, Value>, field: &str) -> String {
    match dict.remove(field.as_bytes()) {
        Some(Value::Bytes(raw)) => String::from_utf8(raw).expect("validated utf-8"),
        _ => unreachable!("field {:?} was validated", field),
    }
}

fn take_int(dict: &mut HashMap<Vec<u8>, Value>, field: &str) -> i64 {
    match dict.remove(field.as_bytes()) {
        Some(Value::Int(n)) => n,
        _ => unreachable!("field {:?} was validated", field),
    }
}

fn take_bytes(dict: &mut HashMap<Vec<u8>, Value>, field: &str) -> Vec<u8> {
    match dict.remove(field.as_bytes()) {
        Some(Value::Bytes(raw)) => raw,
        _ => unreachable!("field {:?} was validated", field),
    }
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Helo(_) => "helo",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::PexRequest => "pex_request",
            Message::Pex { .. } => "pex",
            Message::RefChange => "ref_change",
            Message::FileGet { .. } => "file_get",
            Message::FileDat { .. } => "file_dat",
            Message::FileAck { .. } => "file_ack",
            Message::FileCancel { .. } => "file_cancel",
        }
    }

    fn to_dict(&self) -> HashMap<Vec<u8>, Value> {
        fn bytes(s: &str) -> Value {
            Value::Bytes(s.as_bytes().to_vec())
        }

        let mut dict = HashMap::new();
        match self {
            Message::Helo(helo) => {
                dict.insert(b"protocol".to_vec(), bytes(crate::config::PROTOCOL_NAME));
                dict.insert(b"major".to_vec(), Value::Int(crate::config::MAJOR_VERSION));
                dict.insert(b"minor".to_vec(), Value::Int(crate::config::MINOR_VERSION));
                dict.insert(b"peerid".to_vec(), bytes(&helo.peerid));
                dict.insert(b"swarmid".to_vec(), bytes(&helo.swarmid));
                dict.insert(b"port".to_vec(), Value::Int(helo.port as i64));
                dict.insert(b"client".to_vec(), bytes(&helo.client));
            }
            Message::Ping | Message::Pong | Message::PexRequest | Message::RefChange => {}
            Message::Pex { peerid, ip, port } => {
                dict.insert(b"peerid".to_vec(), bytes(peerid));
                dict.insert(b"ip".to_vec(), bytes(ip));
                dict.insert(b"port".to_vec(), Value::Int(*port as i64));
            }
            Message::FileGet { file, id } => {
                dict.insert(b"file".to_vec(), bytes(file));
                dict.insert(b"id".to_vec(), Value::Int(*id));
            }
            Message::FileDat { id, chunk, buf } => {
                dict.insert(b"id".to_vec(), Value::Int(*id));
                dict.insert(b"chunk".to_vec(), Value::Int(*chunk));
                dict.insert(b"buf".to_vec(), Value::Bytes(buf.clone()));
            }
            Message::FileAck { id, chunk } => {
                dict.insert(b"id".to_vec(), Value::Int(*id));
                dict.insert(b"chunk".to_vec(), Value::Int(*chunk));
            }
            Message::FileCancel { id } => {
                dict.insert(b"id".to_vec(), Value::Int(*id));
            }
        }
        dict
    }

    fn from_dict(name: &str, mut dict: HashMap<Vec<u8>, Value>) -> Message {
        match name {
            "helo" => Message::Helo(Helo {
                peerid: take_str(&mut dict, "peerid"),
                swarmid: take_str(&mut dict, "swarmid"),
                port: take_int(&mut dict, "port") as u16,
                client: take_str(&mut dict, "client"),
            }),
            "ping" => Message::Ping,
            "pong" => Message::Pong,
            "pex_request" => Message::PexRequest,
            "pex" => Message::Pex {
                peerid: take_str(&mut dict, "peerid"),
                ip: take_str(&mut dict, "ip"),
                port: take_int(&mut dict, "port") as u16,
            },
            "ref_change" => Message::RefChange,
            "file_get" => Message::FileGet {
                file: take_str(&mut dict, "file"),
                id: take_int(&mut dict, "id"),
            },
            "file_dat" => Message::FileDat {
                id: take_int(&mut dict, "id"),
                chunk: take_int(&mut dict, "chunk"),
                buf: take_bytes(&mut dict, "buf"),
            },
            "file_ack" => Message::FileAck {
                id: take_int(&mut dict, "id"),
                chunk: take_int(&mut dict, "chunk"),
            },
            "file_cancel" => Message::FileCancel {
                id: take_int(&mut dict, "id"),
            },
            _ => unreachable!("name was validated against the schema"),
        }
    }
}

/// Decode and validate one frame payload. Any failure is a protocol error
/// that terminates the session.
pub fn decode(payload: &[u8]) -> Result<Message> {
    let value: Value = serde_bencode::from_bytes(payload)
        .map_err(|_| Error::protocol("bdecode failed"))?;

    let Value::Dict(mut dict) = value else {
        return Err(Error::protocol("message must be a dictionary"));
    };

    let name = match dict.remove(b"msg".as_slice()) {
        Some(Value::Bytes(raw)) => String::from_utf8(raw)
            .map_err(|_| Error::protocol("message name is not valid utf-8"))?,
        Some(_) => return Err(Error::protocol("message name must be a string")),
        None => return Err(Error::protocol("required field \"msg\" is missing")),
    };

    validate(&name, &dict).map_err(Error::Protocol)?;
    Ok(Message::from_dict(&name, dict))
}

/// Validate and bencode one outgoing message. A failure here is a local
/// bug: the caller logs it and closes the session.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut dict = msg.to_dict();
    validate(msg.name(), &dict).map_err(Error::Decoder)?;

    dict.insert(
        b"msg".to_vec(),
        Value::Bytes(msg.name().as_bytes().to_vec()),
    );
    serde_bencode::to_bytes(&Value::Dict(dict))
        .map_err(|e| Error::decoder(format!("bencode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helo() -> Message {
        Message::Helo(Helo {
            peerid: "alice-x".to_string(),
            swarmid: "a".repeat(40),
            port: 7001,
            client: "mainline-0.1".to_string(),
        })
    }

    #[test]
    fn round_trip_every_message_kind() {
        let messages = vec![
            helo(),
            Message::Ping,
            Message::Pong,
            Message::PexRequest,
            Message::Pex {
                peerid: "bob-y".to_string(),
                ip: "10.1.2.3".to_string(),
                port: 65535,
            },
            Message::RefChange,
            Message::FileGet {
                file: "objects/aa/bb".to_string(),
                id: 3,
            },
            Message::FileDat {
                id: 3,
                chunk: 1,
                buf: vec![0, 159, 146, 150],
            },
            Message::FileAck { id: 3, chunk: 1 },
            Message::FileCancel { id: 3 },
        ];
        for msg in messages {
            let wire = encode(&msg).unwrap();
            assert_eq!(decode(&wire).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_message_rejected() {
        let wire = b"d3:msg11:bad-messagee";
        assert!(matches!(decode(wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn missing_field_rejected() {
        // file_cancel without its id
        let wire = b"d3:msg11:file_cancele";
        assert!(matches!(decode(wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn extra_fields_are_dropped() {
        let wire = b"d5:extra3:abc2:idi7e3:msg11:file_cancele";
        assert_eq!(decode(wire).unwrap(), Message::FileCancel { id: 7 });
    }

    #[test]
    fn numeric_bounds_enforced() {
        // helo port 0 and 0xffff are both outside 1..=0xfffe
        for port in ["i0e", "i65535e"] {
            let wire = format!(
                "d6:client12:mainline-0.15:majori0e5:minori1e3:msg4:helo6:peerid7:alice-x4:port{}8:protocol7:p2p-git7:swarmid40:{}e",
                port,
                "a".repeat(40)
            );
            assert!(matches!(decode(wire.as_bytes()), Err(Error::Protocol(_))));
        }

        let bad_ack = b"d5:chunki0e2:idi-1e3:msg8:file_acke";
        assert!(matches!(decode(bad_ack), Err(Error::Protocol(_))));
    }

    #[test]
    fn peerid_rules_enforced() {
        for peerid in ["ab", "has space", &"x".repeat(31)] {
            let msg = Message::Pex {
                peerid: peerid.to_string(),
                ip: "1.2.3.4".to_string(),
                port: 80,
            };
            assert!(matches!(encode(&msg), Err(Error::Decoder(_))));
        }
    }

    #[test]
    fn pex_ip_must_be_dotted_quad() {
        let msg = Message::Pex {
            peerid: "bob-y".to_string(),
            ip: "example.com".to_string(),
            port: 80,
        };
        assert!(matches!(encode(&msg), Err(Error::Decoder(_))));
    }

    #[test]
    fn file_path_charset_enforced() {
        let msg = Message::FileGet {
            file: "objects/../secret name".to_string(),
            id: 0,
        };
        assert!(matches!(encode(&msg), Err(Error::Decoder(_))));

        let msg = Message::FileGet {
            file: String::new(),
            id: 0,
        };
        assert!(matches!(encode(&msg), Err(Error::Decoder(_))));
    }

    #[test]
    fn binary_buf_survives() {
        let buf: Vec<u8> = (0..=255).collect();
        let wire = encode(&Message::FileDat {
            id: 0,
            chunk: 1,
            buf: buf.clone(),
        })
        .unwrap();
        match decode(&wire).unwrap() {
            Message::FileDat { buf: got, .. } => assert_eq!(got, buf),
            other => panic!("unexpected message {:?}", other),
        }
    }
}

// Copyright 2024 Event Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Human-readable event and method schemas, log decoding, and call encoding.
//!
//! Mappings declare their schemas as plain signatures of the form
//! `Name(type1 name1, type2 name2, ...)`. This module parses them through
//! the ethers human-readable ABI parser, decodes matched logs into
//! [`EventData`] snapshots, and encodes destination calls back out of those
//! snapshots.

use std::collections::BTreeMap;

use ethers::abi::{self, AbiParser, ParamType, RawLog, Token};
use ethers::types::{Log, H256, I256, U256};

use crate::error::{Error, Result};
use crate::types::{EventData, EventValue, ProofData};

/// A parsed event schema.
#[derive(Debug, Clone)]
pub struct EventSignature {
    /// The underlying ABI event, with `indexed` flags preserved.
    pub event: abi::Event,
}

impl EventSignature {
    /// Parses a signature like `ValueSet(bytes32 indexed key, bytes value)`.
    ///
    /// The `event` keyword is optional; the `indexed` qualifier is
    /// recognised but does not change relaying semantics.
    pub fn parse(signature: &str) -> Result<Self> {
        let trimmed = signature.trim();
        let normalized = if trimmed.starts_with("event ") {
            trimmed.to_string()
        } else {
            format!("event {trimmed}")
        };
        let mut parser = AbiParser::default();
        let event = parser.parse_event(&normalized).map_err(|e| {
            Error::Encoding(format!("malformed event signature `{trimmed}`: {e}"))
        })?;
        Ok(Self { event })
    }

    /// The event name.
    pub fn name(&self) -> &str {
        &self.event.name
    }

    /// The canonical rendering, with resolved type aliases and without the
    /// `indexed` markers.
    pub fn render(&self) -> String {
        render_signature(
            &self.event.name,
            self.event.inputs.iter().map(|p| (&p.kind, p.name.as_str())),
        )
    }

    /// The topic0 hash used to filter logs for this event.
    pub fn topic0(&self) -> H256 {
        self.event.signature()
    }
}

/// A parsed destination method schema.
#[derive(Debug, Clone)]
pub struct MethodSignature {
    /// The underlying ABI function.
    pub function: abi::Function,
}

impl MethodSignature {
    /// Parses a signature like `setValue(bytes proof, bytes32 key, bytes value)`.
    pub fn parse(signature: &str) -> Result<Self> {
        let trimmed = signature.trim();
        let normalized = if trimmed.starts_with("function ") {
            trimmed.to_string()
        } else {
            format!("function {trimmed}")
        };
        let mut parser = AbiParser::default();
        let function = parser.parse_function(&normalized).map_err(|e| {
            Error::Encoding(format!("malformed method signature `{trimmed}`: {e}"))
        })?;
        Ok(Self { function })
    }

    /// The method name.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// The canonical rendering with parameter names.
    pub fn render(&self) -> String {
        render_signature(
            &self.function.name,
            self.function
                .inputs
                .iter()
                .map(|p| (&p.kind, p.name.as_str())),
        )
    }
}

fn render_signature<'a>(
    name: &str,
    params: impl Iterator<Item = (&'a ParamType, &'a str)>,
) -> String {
    let rendered = params
        .map(|(kind, name)| {
            if name.is_empty() {
                kind.to_string()
            } else {
                format!("{kind} {name}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{name}({rendered})")
}

/// Decodes a matched log against the event schema into named arguments.
pub fn decode_event(event: &abi::Event, log: &Log) -> Result<BTreeMap<String, EventValue>> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let parsed = event.parse_log(raw)?;
    parsed
        .params
        .into_iter()
        .map(|param| Ok((param.name, token_to_value(param.value)?)))
        .collect()
}

/// Converts a decoded ABI token into the tagged event value union.
pub fn token_to_value(token: Token) -> Result<EventValue> {
    match token {
        Token::Uint(value) => Ok(EventValue::Uint(value.to_string())),
        Token::Int(value) => Ok(EventValue::Int(I256::from_raw(value).to_string())),
        Token::Address(value) => Ok(EventValue::Address(value)),
        Token::Bool(value) => Ok(EventValue::Bool(value)),
        Token::Bytes(value) | Token::FixedBytes(value) => Ok(EventValue::Bytes(value.into())),
        Token::String(value) => Ok(EventValue::String(value)),
        other => Err(Error::Encoding(format!(
            "unsupported event argument type: {other:?}"
        ))),
    }
}

/// Converts an event value back into an ABI token of the requested type.
pub fn value_to_token(value: &EventValue, kind: &ParamType) -> Result<Token> {
    match (value, kind) {
        (EventValue::Uint(s), ParamType::Uint(_)) => Ok(Token::Uint(parse_u256(s)?)),
        (EventValue::Uint(s), ParamType::Int(_)) => Ok(Token::Int(parse_u256(s)?)),
        (EventValue::Int(s), ParamType::Int(_)) => Ok(Token::Int(parse_i256(s)?.into_raw())),
        (EventValue::Int(s), ParamType::Uint(_)) => {
            let signed = parse_i256(s)?;
            if signed.is_negative() {
                return Err(Error::Encoding(format!(
                    "cannot encode negative value {s} as an unsigned integer"
                )));
            }
            Ok(Token::Uint(signed.into_raw()))
        }
        (EventValue::Address(a), ParamType::Address) => Ok(Token::Address(*a)),
        (EventValue::Bool(b), ParamType::Bool) => Ok(Token::Bool(*b)),
        (EventValue::Bytes(b), ParamType::Bytes) => Ok(Token::Bytes(b.to_vec())),
        (EventValue::Bytes(b), ParamType::FixedBytes(size)) => {
            if b.len() != *size {
                return Err(Error::Encoding(format!(
                    "expected {size} bytes for a fixed byte string, got {}",
                    b.len()
                )));
            }
            Ok(Token::FixedBytes(b.to_vec()))
        }
        (EventValue::String(s), ParamType::String) => Ok(Token::String(s.clone())),
        (value, kind) => Err(Error::Encoding(format!(
            "argument {value:?} is not encodable as {kind}"
        ))),
    }
}

/// The zero value of an ABI type, used when an event argument is missing.
pub fn zero_token(kind: &ParamType) -> Token {
    match kind {
        ParamType::Uint(_) => Token::Uint(U256::zero()),
        ParamType::Int(_) => Token::Int(U256::zero()),
        ParamType::Address => Token::Address(Default::default()),
        ParamType::Bool => Token::Bool(false),
        ParamType::Bytes => Token::Bytes(Vec::new()),
        ParamType::FixedBytes(size) => Token::FixedBytes(vec![0u8; *size]),
        ParamType::String => Token::String(String::new()),
        ParamType::Array(_) => Token::Array(Vec::new()),
        ParamType::FixedArray(inner, size) => {
            Token::FixedArray((0..*size).map(|_| zero_token(inner)).collect())
        }
        ParamType::Tuple(inner) => Token::Tuple(inner.iter().map(zero_token).collect()),
    }
}

/// Encodes the destination call's ABI payload, selector included.
///
/// Values are selected per parameter, in order: a `bytes proof` parameter
/// takes the attached proof, a parameter named after an event argument takes
/// that argument, and anything else falls back to the type's zero value with
/// a warning.
pub fn build_call_data(
    method: &MethodSignature,
    event: &EventData,
    proof: Option<&ProofData>,
) -> Result<Vec<u8>> {
    let mut tokens = Vec::with_capacity(method.function.inputs.len());
    for param in &method.function.inputs {
        let token = if param.name == "proof" && param.kind == ParamType::Bytes {
            match proof {
                Some(data) => Token::Bytes(data.proof.clone()),
                None => {
                    return Err(Error::Encoding(format!(
                        "method {} takes a proof but the job carries no proof data",
                        method.name()
                    )))
                }
            }
        } else if let Some(value) = event.args.get(&param.name) {
            value_to_token(value, &param.kind)?
        } else {
            tracing::warn!(
                method = %method.name(),
                param = %param.name,
                ty = %param.kind,
                event = %event.name,
                "argument missing from event data, encoding a zero value",
            );
            zero_token(&param.kind)
        };
        tokens.push(token);
    }
    method.function.encode_input(&tokens).map_err(Error::Abi)
}

fn parse_u256(s: &str) -> Result<U256> {
    U256::from_dec_str(s)
        .map_err(|e| Error::Encoding(format!("invalid unsigned integer `{s}`: {e}")))
}

fn parse_i256(s: &str) -> Result<I256> {
    I256::from_dec_str(s).map_err(|e| Error::Encoding(format!("invalid integer `{s}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn sample_event_data() -> EventData {
        let mut args = BTreeMap::new();
        args.insert(
            "key".to_string(),
            EventValue::Bytes(vec![0x6b; 32].into()),
        );
        args.insert("value".to_string(), EventValue::Uint("4660".to_string()));
        EventData {
            name: "ValueSet".to_string(),
            args,
            block_number: 1000,
            transaction_index: 0,
            log_index: 2,
        }
    }

    #[test]
    fn parse_then_render_is_canonical_identity() {
        let sig = EventSignature::parse("ValueSet(bytes32 key, uint value)").unwrap();
        let rendered = sig.render();
        assert_eq!(rendered, "ValueSet(bytes32 key, uint256 value)");
        // rendering is a fixpoint of parse.
        let reparsed = EventSignature::parse(&rendered).unwrap();
        assert_eq!(reparsed.render(), rendered);
    }

    #[test]
    fn indexed_marker_is_recognised_and_dropped_on_render() {
        let sig =
            EventSignature::parse("Transfer(address indexed from, address indexed to, uint256 amount)")
                .unwrap();
        assert!(sig.event.inputs[0].indexed);
        assert!(!sig.event.inputs[2].indexed);
        assert_eq!(
            sig.render(),
            "Transfer(address from, address to, uint256 amount)"
        );
    }

    #[test]
    fn malformed_signature_is_rejected() {
        assert!(EventSignature::parse("not a signature").is_err());
        assert!(MethodSignature::parse("setValue(bytes proof").is_err());
    }

    #[test]
    fn decodes_a_matching_log() {
        let sig = EventSignature::parse("ValueSet(bytes32 key, bytes value)").unwrap();
        let data = abi::encode(&[
            Token::FixedBytes(vec![0x6b; 32]),
            Token::Bytes(vec![0x12, 0x34]),
        ]);
        let log = Log {
            topics: vec![sig.topic0()],
            data: data.into(),
            ..Default::default()
        };
        let args = decode_event(&sig.event, &log).unwrap();
        assert_eq!(args["key"], EventValue::Bytes(vec![0x6b; 32].into()));
        assert_eq!(args["value"], EventValue::Bytes(vec![0x12, 0x34].into()));
    }

    #[test]
    fn huge_uint_round_trips_through_the_union() {
        let max = U256::MAX;
        let value = token_to_value(Token::Uint(max)).unwrap();
        assert_eq!(value, EventValue::Uint(max.to_string()));
        let token = value_to_token(&value, &ParamType::Uint(256)).unwrap();
        assert_eq!(token, Token::Uint(max));
    }

    #[test]
    fn negative_int_round_trips() {
        let value = token_to_value(Token::Int(I256::from(-42).into_raw())).unwrap();
        assert_eq!(value, EventValue::Int("-42".to_string()));
        let token = value_to_token(&value, &ParamType::Int(256)).unwrap();
        assert_eq!(token, Token::Int(I256::from(-42).into_raw()));
    }

    #[test]
    fn negative_int_is_rejected_as_uint() {
        let value = EventValue::Int("-1".to_string());
        assert!(value_to_token(&value, &ParamType::Uint(256)).is_err());
    }

    #[test]
    fn zero_tokens_cover_the_base_types() {
        assert_eq!(zero_token(&ParamType::Uint(256)), Token::Uint(U256::zero()));
        assert_eq!(
            zero_token(&ParamType::Address),
            Token::Address(Address::zero())
        );
        assert_eq!(zero_token(&ParamType::Bool), Token::Bool(false));
        assert_eq!(zero_token(&ParamType::Bytes), Token::Bytes(Vec::new()));
        assert_eq!(
            zero_token(&ParamType::FixedBytes(32)),
            Token::FixedBytes(vec![0u8; 32])
        );
        assert_eq!(zero_token(&ParamType::String), Token::String(String::new()));
    }

    #[test]
    fn call_data_substitutes_the_proof_parameter() {
        let method =
            MethodSignature::parse("setValue(bytes proof, bytes32 key, uint256 value)").unwrap();
        let proof = ProofData {
            proof: vec![0xde, 0xad],
        };
        let calldata = build_call_data(&method, &sample_event_data(), Some(&proof)).unwrap();
        let selector = ethers::utils::id("setValue(bytes,bytes32,uint256)");
        assert_eq!(&calldata[..4], &selector[..]);
        let tokens = method.function.decode_input(&calldata[4..]).unwrap();
        assert_eq!(tokens[0], Token::Bytes(vec![0xde, 0xad]));
        assert_eq!(tokens[1], Token::FixedBytes(vec![0x6b; 32]));
        assert_eq!(tokens[2], Token::Uint(U256::from(4660u64)));
    }

    #[test]
    fn missing_proof_fails_encoding() {
        let method = MethodSignature::parse("setValue(bytes proof, bytes32 key)").unwrap();
        let err = build_call_data(&method, &sample_event_data(), None).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn missing_argument_falls_back_to_zero_value() {
        let method = MethodSignature::parse("setValue(bytes32 key, address owner)").unwrap();
        let calldata = build_call_data(&method, &sample_event_data(), None).unwrap();
        let tokens = method.function.decode_input(&calldata[4..]).unwrap();
        assert_eq!(tokens[1], Token::Address(Address::zero()));
    }
}

//! Versioned record encoding
//!
//! Layout of one encoded record:
//!
//! ```text
//! ┌─────────┬──────────┬──────────────────────────┐
//! │ version │ kind tag │ bincode body             │
//! │  1 byte │  1 byte  │ (bean / message fields)  │
//! └─────────┴──────────┴──────────────────────────┘
//! ```
//!
//! The body format is the serde layout of the bean struct, so adding a
//! field means bumping [`CODEC_VERSION`].

use crate::domain::{InvokerBean, RmEnvelope, RmdBean, RmsBean, SenderBean};
use thiserror::Error;

pub const CODEC_VERSION: u8 = 1;

const TAG_RMS: u8 = 1;
const TAG_RMD: u8 = 2;
const TAG_SENDER: u8 = 3;
const TAG_INVOKER: u8 = 4;
const TAG_MESSAGE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Serialization error: {message}")]
pub struct SerializationError {
    pub message: String,
}

impl SerializationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One persisted row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredRecord {
    Rms(RmsBean),
    Rmd(RmdBean),
    Sender(SenderBean),
    Invoker(InvokerBean),
    Message { key: String, envelope: RmEnvelope },
}

pub trait BeanCodec: Send + Sync {
    fn encode(&self, record: &StoredRecord) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, data: &[u8]) -> Result<StoredRecord, SerializationError>;
}

/// Default codec using bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeBeanCodec;

fn body<T: serde::Serialize>(tag: u8, value: &T) -> Result<Vec<u8>, SerializationError> {
    let mut out = vec![CODEC_VERSION, tag];
    bincode::serialize_into(&mut out, value).map_err(|e| SerializationError::new(e.to_string()))?;
    Ok(out)
}

fn parse<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, SerializationError> {
    bincode::deserialize(data).map_err(|e| SerializationError::new(e.to_string()))
}

impl BeanCodec for BincodeBeanCodec {
    fn encode(&self, record: &StoredRecord) -> Result<Vec<u8>, SerializationError> {
        match record {
            StoredRecord::Rms(bean) => body(TAG_RMS, bean),
            StoredRecord::Rmd(bean) => body(TAG_RMD, bean),
            StoredRecord::Sender(bean) => body(TAG_SENDER, bean),
            StoredRecord::Invoker(bean) => body(TAG_INVOKER, bean),
            StoredRecord::Message { key, envelope } => body(TAG_MESSAGE, &(key, envelope)),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<StoredRecord, SerializationError> {
        let (version, tag, rest) = match data {
            [version, tag, rest @ ..] => (*version, *tag, rest),
            _ => return Err(SerializationError::new("record shorter than header")),
        };
        if version != CODEC_VERSION {
            return Err(SerializationError::new(format!(
                "unsupported record version {} (expected {})",
                version, CODEC_VERSION
            )));
        }
        match tag {
            TAG_RMS => parse(rest).map(StoredRecord::Rms),
            TAG_RMD => parse(rest).map(StoredRecord::Rmd),
            TAG_SENDER => parse(rest).map(StoredRecord::Sender),
            TAG_INVOKER => parse(rest).map(StoredRecord::Invoker),
            TAG_MESSAGE => {
                parse::<(String, RmEnvelope)>(rest).map(|(key, envelope)| StoredRecord::Message { key, envelope })
            }
            other => Err(SerializationError::new(format!("unknown record kind {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageType, RmVersion};

    #[test]
    fn test_header_layout() {
        let bean = InvokerBean {
            message_store_key: "k".into(),
            sequence_id: "s".into(),
            message_number: 3,
        };
        let bytes = BincodeBeanCodec.encode(&StoredRecord::Invoker(bean.clone())).unwrap();
        assert_eq!(bytes[0], CODEC_VERSION);
        assert_eq!(bytes[1], TAG_INVOKER);
        assert_eq!(
            BincodeBeanCodec.decode(&bytes).unwrap(),
            StoredRecord::Invoker(bean)
        );
    }

    #[test]
    fn test_rms_keeps_ranges() {
        let mut rms = RmsBean::new("int", "cs", RmVersion::V1_0, 42);
        rms.sequence_id = Some("urn:seq".into());
        for _ in 0..5 {
            rms.assign_message_number();
        }
        rms.client_completed_messages.add_range(1, 2);
        rms.client_completed_messages.add(4);

        let bytes = BincodeBeanCodec.encode(&StoredRecord::Rms(rms.clone())).unwrap();
        match BincodeBeanCodec.decode(&bytes).unwrap() {
            StoredRecord::Rms(decoded) => {
                assert_eq!(decoded.client_completed_messages.to_string(), "1-2,4-4");
                assert_eq!(decoded, rms);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_version_and_kind() {
        let sender = SenderBean::new("m", "k", MessageType::AckRequest);
        let mut bytes = BincodeBeanCodec.encode(&StoredRecord::Sender(sender)).unwrap();

        let mut wrong_kind = bytes.clone();
        wrong_kind[1] = 99;
        assert!(BincodeBeanCodec.decode(&wrong_kind).is_err());

        bytes[0] = CODEC_VERSION + 1;
        let err = BincodeBeanCodec.decode(&bytes).unwrap_err();
        assert!(err.message.contains("unsupported record version"));

        assert!(BincodeBeanCodec.decode(&[CODEC_VERSION]).is_err());
    }
}

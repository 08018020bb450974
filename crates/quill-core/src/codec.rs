// ABOUTME: Converts typed records to and from schema-tagged envelopes and native document formats.
// ABOUTME: Older schema versions are upgraded step by step on decode; unknown shapes are MalformedData.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StorageError;
use crate::record::{Record, Revision, Versioned};

/// The backend-neutral stored form of a record.
///
/// File backends persist the envelope itself as a JSON or YAML document;
/// the relational backend spreads it across the `schema_version`,
/// `revision`, `updated_at` and `payload` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub schema_version: u32,
    pub revision: Revision,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    /// The `data` field as compact JSON text, used as the relational payload column.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.data)
    }

    /// Rebuild an envelope from relational columns.
    pub fn from_row(
        schema_version: u32,
        revision: Revision,
        updated_at: DateTime<Utc>,
        payload: &str,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            schema_version,
            revision,
            updated_at,
            data: serde_json::from_str(payload)?,
        })
    }
}

/// Encode a versioned record into an envelope tagged with the current schema version.
pub fn encode<R: Record>(key: &str, record: &Versioned<R>) -> Result<Envelope, StorageError> {
    let data = serde_json::to_value(&record.value)
        .map_err(|e| StorageError::malformed(R::ENTITY_TYPE, key, e))?;
    Ok(Envelope {
        schema_version: R::SCHEMA_VERSION,
        revision: record.revision,
        updated_at: Utc::now(),
        data,
    })
}

/// Decode an envelope into a typed record, upgrading older schema versions first.
pub fn decode<R: Record>(key: &str, envelope: Envelope) -> Result<Versioned<R>, StorageError> {
    let Envelope {
        schema_version,
        revision,
        mut data,
        ..
    } = envelope;

    if schema_version == 0 || schema_version > R::SCHEMA_VERSION {
        return Err(StorageError::malformed(
            R::ENTITY_TYPE,
            key,
            format!(
                "unsupported schema version {schema_version} (current is {})",
                R::SCHEMA_VERSION
            ),
        ));
    }

    let mut version = schema_version;
    while version < R::SCHEMA_VERSION {
        data = R::upgrade(version, data)
            .map_err(|reason| StorageError::malformed(R::ENTITY_TYPE, key, reason))?;
        version += 1;
        tracing::debug!(
            entity = R::ENTITY_TYPE,
            key,
            to_version = version,
            "upgraded stored record"
        );
    }

    let value = serde_json::from_value(data)
        .map_err(|e| StorageError::malformed(R::ENTITY_TYPE, key, e))?;
    Ok(Versioned::new(revision, value))
}

/// Errors from converting an envelope to or from document text.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// On-disk document encodings used by the file backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    pub fn extension(self) -> &'static str {
        match self {
            DocumentFormat::Json => "json",
            DocumentFormat::Yaml => "yaml",
        }
    }
}

/// Render an envelope as document bytes in the given format.
pub fn encode_document(format: DocumentFormat, envelope: &Envelope) -> Result<Vec<u8>, DocumentError> {
    match format {
        DocumentFormat::Json => {
            let mut bytes = serde_json::to_vec_pretty(envelope)?;
            bytes.push(b'\n');
            Ok(bytes)
        }
        DocumentFormat::Yaml => Ok(serde_yaml::to_string(envelope)?.into_bytes()),
    }
}

/// Parse document bytes in the given format into an envelope.
pub fn decode_document(format: DocumentFormat, bytes: &[u8]) -> Result<Envelope, DocumentError> {
    match format {
        DocumentFormat::Json => Ok(serde_json::from_slice(bytes)?),
        DocumentFormat::Yaml => Ok(serde_yaml::from_slice(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Wallet {
        gold: i64,
        owner: String,
        tags: Vec<String>,
        stats: BTreeMap<String, u32>,
        vip: Option<bool>,
    }

    impl Record for Wallet {
        const ENTITY_TYPE: &'static str = "wallets";
    }

    /// Version 2 renamed `coins` to `gold`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bank {
        gold: i64,
    }

    impl Record for Bank {
        const ENTITY_TYPE: &'static str = "banks";
        const SCHEMA_VERSION: u32 = 2;

        fn upgrade(from_version: u32, mut data: serde_json::Value) -> Result<serde_json::Value, String> {
            match from_version {
                1 => {
                    let obj = data.as_object_mut().ok_or("expected an object")?;
                    let coins = obj.remove("coins").ok_or("missing coins")?;
                    obj.insert("gold".to_string(), coins);
                    Ok(data)
                }
                other => Err(format!("unknown version {other}")),
            }
        }
    }

    fn wallet_strategy(text: &'static str) -> impl Strategy<Value = Versioned<Wallet>> {
        (
            0..u64::from(u32::MAX),
            any::<i64>(),
            text,
            prop::collection::vec(text, 0..4),
            prop::collection::btree_map(text, any::<u32>(), 0..4),
            any::<Option<bool>>(),
        )
            .prop_map(|(rev, gold, owner, tags, stats, vip)| {
                Versioned::new(
                    Revision(rev),
                    Wallet {
                        gold,
                        owner,
                        tags,
                        stats,
                        vip,
                    },
                )
            })
    }

    proptest! {
        #[test]
        fn envelope_round_trip(record in wallet_strategy("\\PC{0,12}")) {
            let envelope = encode("k", &record).unwrap();
            let decoded: Versioned<Wallet> = decode("k", envelope).unwrap();
            prop_assert_eq!(decoded, record);
        }

        #[test]
        fn document_round_trip(record in wallet_strategy("[a-zA-Z0-9 _-]{0,12}")) {
            for format in [DocumentFormat::Json, DocumentFormat::Yaml] {
                let envelope = encode("k", &record).unwrap();
                let bytes = encode_document(format, &envelope).unwrap();
                let parsed = decode_document(format, &bytes).unwrap();
                let decoded: Versioned<Wallet> = decode("k", parsed).unwrap();
                prop_assert_eq!(&decoded, &record);
            }
        }
    }

    #[test]
    fn encode_tags_current_schema_version() {
        let envelope = encode("p1", &Versioned::new(Revision(1), Bank { gold: 100 })).unwrap();
        assert_eq!(envelope.schema_version, 2);
        assert_eq!(envelope.data, json!({"gold": 100}));
    }

    #[test]
    fn decode_upgrades_older_schema() {
        let envelope = Envelope {
            schema_version: 1,
            revision: Revision(4),
            updated_at: Utc::now(),
            data: json!({"coins": 55}),
        };
        let decoded: Versioned<Bank> = decode("p1", envelope).unwrap();
        assert_eq!(decoded.revision, Revision(4));
        assert_eq!(decoded.value, Bank { gold: 55 });
    }

    #[test]
    fn decode_rejects_future_schema() {
        let envelope = Envelope {
            schema_version: 9,
            revision: Revision(1),
            updated_at: Utc::now(),
            data: json!({"gold": 1}),
        };
        let err = decode::<Bank>("p1", envelope).unwrap_err();
        assert!(matches!(err, StorageError::MalformedData { .. }), "got {err}");
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let envelope = Envelope {
            schema_version: 1,
            revision: Revision(1),
            updated_at: Utc::now(),
            data: json!({"gold": "lots"}),
        };
        let err = decode::<Wallet>("p1", envelope).unwrap_err();
        match err {
            StorageError::MalformedData { entity, key, .. } => {
                assert_eq!(entity, "wallets");
                assert_eq!(key, "p1");
            }
            other => panic!("expected MalformedData, got {other}"),
        }
    }

    #[test]
    fn missing_field_is_malformed() {
        let envelope = Envelope {
            schema_version: 1,
            revision: Revision(1),
            updated_at: Utc::now(),
            data: json!({}),
        };
        assert!(decode::<Wallet>("p1", envelope).is_err());
    }

    #[test]
    fn json_document_is_schema_tagged() {
        let envelope = encode("p1", &Versioned::new(Revision(3), Bank { gold: 7 })).unwrap();
        let bytes = encode_document(DocumentFormat::Json, &envelope).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"schemaVersion\": 2"));
        assert!(text.contains("\"revision\": 3"));
    }

    #[test]
    fn yaml_document_parses_hand_written_file() {
        let text = "schemaVersion: 1\nrevision: 2\nupdatedAt: 2024-05-01T10:00:00Z\ndata:\n  coins: 12\n";
        let envelope = decode_document(DocumentFormat::Yaml, text.as_bytes()).unwrap();
        let decoded: Versioned<Bank> = decode("p1", envelope).unwrap();
        assert_eq!(decoded.value.gold, 12);
        assert_eq!(decoded.revision, Revision(2));
    }

    #[test]
    fn truncated_document_is_an_error() {
        let result = decode_document(DocumentFormat::Json, br#"{"schemaVersion": 1, "revi"#);
        assert!(result.is_err());
    }

    #[test]
    fn row_payload_round_trip() {
        let envelope = encode("p1", &Versioned::new(Revision(5), Bank { gold: 9 })).unwrap();
        let payload = envelope.payload().unwrap();
        let rebuilt =
            Envelope::from_row(envelope.schema_version, envelope.revision, envelope.updated_at, &payload)
                .unwrap();
        assert_eq!(rebuilt, envelope);
    }
}

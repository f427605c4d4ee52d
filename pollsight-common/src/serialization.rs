use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Wire encoding of a report batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Cbor,
}

impl Format {
    /// Value of the `Content-Type` header for a payload in this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Cbor => "application/cbor",
        }
    }
}

/// Encode `value` as `format`.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => Ok(serde_json::to_vec(value)?),
        Format::Cbor => {
            let mut payload = Vec::new();
            ciborium::into_writer(value, &mut payload)?;
            Ok(payload)
        }
    }
}

/// Decode a payload previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(payload: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => Ok(serde_json::from_slice(payload)?),
        Format::Cbor => ciborium::from_reader(payload).map_err(|e| Error::Cbor(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{ComponentReport, MetricRecord, MetricValue, ReportBatch, Transform};

    fn sample_batch() -> ReportBatch {
        let mut component = ComponentReport::new("db01", "com.example.sql");
        component.metrics.push(MetricRecord::new(
            "Component/Connections/Current",
            "conn",
            MetricValue::Int(12),
            Transform::Value,
        ));
        ReportBatch::new(7, vec![component])
    }

    #[test]
    fn test_cbor_is_smaller() {
        let batch = sample_batch();

        let json = encode(&batch, Format::Json).unwrap();
        let cbor = encode(&batch, Format::Cbor).unwrap();

        assert!(cbor.len() < json.len());
    }

    #[test]
    fn test_decode_cbor_batch() {
        let cbor = encode(&sample_batch(), Format::Cbor).unwrap();
        let decoded: ReportBatch = decode(&cbor, Format::Cbor).unwrap();

        assert_eq!(decoded.cycle_id, 7);
        assert_eq!(decoded.components[0].name, "db01");
        assert_eq!(decoded.components[0].metrics[0].value, MetricValue::Int(12));
    }

    #[test]
    fn test_decode_wrong_format_fails() {
        let json = encode(&sample_batch(), Format::Json).unwrap();
        let result: Result<ReportBatch> = decode(&json, Format::Cbor);
        assert!(matches!(result, Err(Error::Cbor(_))));
    }

    #[test]
    fn test_format_config_names() {
        let format: Format = serde_json::from_str("\"cbor\"").unwrap();
        assert_eq!(format, Format::Cbor);
        assert_eq!(Format::Json.mime_type(), "application/json");
        assert_eq!(Format::Cbor.mime_type(), "application/cbor");
    }
}

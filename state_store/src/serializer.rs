use std::{any::type_name, fmt::Debug};

use anyhow::Result;
use serde::de::DeserializeOwned;

pub struct JsonEncoder;

pub trait JsonEncode {
    fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

impl JsonEncode for JsonEncoder {
    fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            anyhow::anyhow!(
                "error serializing inventory row: {}, type: {}, value: {:?}",
                e,
                type_name::<T>(),
                value
            )
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            anyhow::anyhow!(
                "error deserializing inventory row: {}, type: {}",
                e,
                type_name::<T>()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_card, GpuCard, GpuDeviceId};

    use super::*;

    #[test]
    fn test_decode_reports_target_type() {
        let err = JsonEncoder::decode::<GpuCard>(b"{not json").unwrap_err();
        assert!(err.to_string().contains("GpuCard"));
    }

    #[test]
    fn test_rows_and_index_values_survive_encoding() {
        let card = mock_card(3);
        let bytes = JsonEncoder::encode(&card).unwrap();
        assert_eq!(JsonEncoder::decode::<GpuCard>(&bytes).unwrap(), card);

        let bytes = JsonEncoder::encode(&GpuDeviceId(12)).unwrap();
        assert_eq!(bytes, b"12");
    }
}

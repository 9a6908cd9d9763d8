//! Canonical binary encoding of a [`RecordedRequest`](super::RecordedRequest).
//!
//! Uses `bincode`'s fixed-width, structure-tagged encoding over types built
//! entirely from `BTreeMap`/`BTreeSet`, so `decode_recorded(encode_recorded(r))
//! == r` bit-for-bit and, crucially, the same logical request always encodes
//! to the same bytes regardless of how its sets were built up.

use super::RecordedRequest;
use crate::error::CResult;

pub fn encode_recorded(recorded: &RecordedRequest) -> CResult<Vec<u8>> {
    Ok(bincode::serialize(recorded)?)
}

pub fn decode_recorded(bytes: &[u8]) -> CResult<RecordedRequest> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, ReturnMode};
    use crate::value::{AttributeValue, Item};

    #[test]
    fn round_trips_bit_for_bit() {
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S("1".into()));
        item.insert(
            "tags".into(),
            AttributeValue::Ss(["b".to_string(), "a".to_string()].into_iter().collect()),
        );
        let recorded = RecordedRequest {
            rid: 7,
            request: Request::PutRow {
                table: "widgets".into(),
                item,
                return_mode: ReturnMode::AllOld,
            },
        };
        let encoded = encode_recorded(&recorded).unwrap();
        let decoded = decode_recorded(&encoded).unwrap();
        assert_eq!(recorded, decoded);
    }

    #[test]
    fn same_logical_request_encodes_identically_regardless_of_set_build_order() {
        let mut item_a = Item::new();
        item_a.insert(
            "tags".into(),
            AttributeValue::Ss(["a".to_string(), "b".to_string()].into_iter().collect()),
        );
        let mut item_b = Item::new();
        item_b.insert(
            "tags".into(),
            AttributeValue::Ss(["b".to_string(), "a".to_string()].into_iter().collect()),
        );
        let a = RecordedRequest {
            rid: 1,
            request: Request::PutRow {
                table: "t".into(),
                item: item_a,
                return_mode: ReturnMode::None,
            },
        };
        let b = RecordedRequest {
            rid: 1,
            request: Request::PutRow {
                table: "t".into(),
                item: item_b,
                return_mode: ReturnMode::None,
            },
        };
        assert_eq!(encode_recorded(&a).unwrap(), encode_recorded(&b).unwrap());
    }
}

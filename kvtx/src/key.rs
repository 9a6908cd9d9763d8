//! `ItemKey`: a structural, order-insensitive key used to address a row and
//! to compare/hash keys as map keys.
//!
//! The backing store does not guarantee a stable iteration order for
//! set-typed attributes (see the design note on set non-determinism), so
//! this type never derives `PartialEq`/`Hash` directly off its attribute
//! map. Instead it canonicalizes the map to bytes once (attribute names are
//! already sorted by `BTreeMap`, and `AttributeValue`'s sets are already
//! sorted by `BTreeSet`) and bases every comparison on those bytes.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::error::{CResult, Error};
use crate::value::{is_reserved_name, AttributeValue, Item};

#[derive(Clone, Debug)]
pub struct ItemKey {
    attrs: Item,
}

impl ItemKey {
    /// Builds a key from its attributes. Rejects an empty key, a reserved
    /// attribute name, and any non-scalar value (sets have no business
    /// identifying a single row).
    pub fn new(attrs: BTreeMap<String, AttributeValue>) -> CResult<Self> {
        if attrs.is_empty() {
            return Err(Error::InvalidRequest("key must have at least one attribute".into()));
        }
        for (name, value) in &attrs {
            if is_reserved_name(name) {
                return Err(Error::InvalidRequest(format!(
                    "key attribute name '{name}' uses the reserved prefix"
                )));
            }
            if value.is_set() || matches!(value, AttributeValue::Null) {
                return Err(Error::InvalidRequest(format!(
                    "key attribute '{name}' must be a scalar value"
                )));
            }
        }
        Ok(Self { attrs })
    }

    pub fn single(name: impl Into<String>, value: AttributeValue) -> CResult<Self> {
        let mut attrs = BTreeMap::new();
        attrs.insert(name.into(), value);
        Self::new(attrs)
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attrs.get(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.keys().map(String::as_str)
    }

    /// The key's attributes as a standalone item, e.g. as the seed for a
    /// `PutRow` of a row that doesn't exist yet.
    pub fn to_item(&self) -> Item {
        self.attrs.clone()
    }

    /// Extracts the key attributes of a full item, given the table's
    /// primary-key attribute names.
    pub fn from_item(item: &Item, pk_attrs: &[String]) -> CResult<Self> {
        let mut attrs = BTreeMap::new();
        for name in pk_attrs {
            let value = item.get(name).cloned().ok_or_else(|| {
                Error::InvalidRequest(format!("item is missing key attribute '{name}'"))
            })?;
            attrs.insert(name.clone(), value);
        }
        Self::new(attrs)
    }

    /// Canonical, order-insensitive bytes for this key. `Eq`, `Hash`, and
    /// `Ord` are all derived from this encoding. Also used by store
    /// implementations (e.g. [`crate::store::memory::MemoryStore`]) as the
    /// byte form of a scan continuation token.
    pub(crate) fn canonical_scan_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.attrs).expect("attribute maps are always serializable")
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        self.canonical_scan_bytes()
    }
}

impl PartialEq for ItemKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

impl Eq for ItemKey {}

impl Hash for ItemKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_bytes().hash(state);
    }
}

impl PartialOrd for ItemKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ItemKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical_bytes().cmp(&other.canonical_bytes())
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = self
            .attrs
            .iter()
            .map(|(name, value)| format!("{name}={value:?}"))
            .collect();
        parts.sort();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AttributeValue;

    #[test]
    fn rejects_empty_key() {
        assert!(ItemKey::new(BTreeMap::new()).is_err());
    }

    #[test]
    fn rejects_reserved_attribute_name() {
        let mut attrs = BTreeMap::new();
        attrs.insert("_txid".to_string(), AttributeValue::S("x".into()));
        assert!(ItemKey::new(attrs).is_err());
    }

    #[test]
    fn rejects_set_valued_key_attribute() {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            "tags".to_string(),
            AttributeValue::Ss(["a".to_string()].into_iter().collect()),
        );
        assert!(ItemKey::new(attrs).is_err());
    }

    #[test]
    fn equal_keys_built_in_different_attribute_insertion_order_compare_equal() {
        let k1 = ItemKey::single("id", AttributeValue::S("42".into())).unwrap();
        let k2 = ItemKey::single("id", AttributeValue::S("42".into())).unwrap();
        assert_eq!(k1, k2);

        use std::collections::hash_map::DefaultHasher;
        let mut h1 = DefaultHasher::new();
        let mut h2 = DefaultHasher::new();
        k1.hash(&mut h1);
        k2.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn from_item_extracts_named_attributes() {
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S("42".into()));
        item.insert("color".into(), AttributeValue::S("red".into()));
        let key = ItemKey::from_item(&item, &["id".to_string()]).unwrap();
        assert_eq!(key.get("id"), Some(&AttributeValue::S("42".into())));
        assert_eq!(key.get("color"), None);
    }
}

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{bson::Document, bson_util::get_int};

/// Specifies the fields and options for an index.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder, Serialize, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IndexModel {
    /// Specifies the index's fields. For each field, specify a key-value pair in which the key is
    /// the name of the field to index and the value is index type.
    #[serde(rename = "key")]
    #[builder(!default)]
    pub keys: Document,

    /// The name of the index. Generated from the keys when not given.
    pub name: Option<String>,

    /// Whether the index rejects documents that duplicate an existing key.
    pub unique: Option<bool>,
}

impl IndexModel {
    /// The name of the index, e.g. `files_id_1_n_1`.
    pub fn index_name(&self) -> String {
        match self.name {
            Some(ref name) => name.clone(),
            None => self
                .keys
                .iter()
                .map(|(key, value)| format!("{}_{}", key, get_int(value).unwrap_or(1)))
                .collect::<Vec<_>>()
                .join("_"),
        }
    }

    pub(crate) fn is_unique(&self) -> bool {
        self.unique == Some(true)
    }

    /// Whether this index covers exactly `keys`. Indexes are considered equivalent regardless
    /// of numeric value type, e.g. `{ "n": 1 }` matches `{ "n": 1.0 }`.
    pub(crate) fn has_keys(&self, keys: &Document) -> bool {
        if self.keys.len() != keys.len() {
            return false;
        }
        keys.iter().all(|(key, value)| match self.keys.get(key) {
            Some(model_value) => match get_int(value) {
                Some(num) => get_int(model_value) == Some(num),
                None => model_value == value,
            },
            None => false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::IndexModel;
    use crate::bson::doc;

    #[test]
    fn keys_match_across_numeric_types() {
        let model = IndexModel::builder()
            .keys(doc! { "files_id": 1, "n": 1 })
            .unique(true)
            .build();
        assert!(model.has_keys(&doc! { "files_id": 1.0, "n": 1i64 }));
        assert!(!model.has_keys(&doc! { "files_id": 1 }));
        assert!(!model.has_keys(&doc! { "files_id": 1, "n": -1 }));
        assert_eq!(model.index_name(), "files_id_1_n_1");
    }
}

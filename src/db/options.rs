use serde::Deserialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::concern::WriteConcern;

/// These are the valid options for creating a [`Database`](crate::Database) with
/// [`Database::with_options`](crate::Database::with_options).
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DatabaseOptions {
    /// The default write concern for operations performed through this database, including
    /// chunk and metadata writes of the files opened on it.
    pub write_concern: Option<WriteConcern>,
}

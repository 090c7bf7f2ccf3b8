use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{bson::Document, concern::WriteConcern};

/// Contains the options for opening a [`GridStore`](crate::GridStore).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct GridStoreOptions {
    /// The root of the `<root>.files` and `<root>.chunks` collections. Defaults to `fs`.
    pub root: Option<String>,

    /// The number of bytes per chunk of a new file. Defaults to 255 KiB. Ignored when an
    /// existing file is appended to.
    pub chunk_size: Option<u32>,

    /// The MIME type stored with the file. Defaults to `binary/octet-stream`.
    pub content_type: Option<String>,

    /// User data for the `metadata` field of the files collection document.
    pub metadata: Option<Document>,

    pub aliases: Option<Vec<String>>,

    /// The name given to a new file that is opened by id.
    pub filename: Option<String>,

    /// The write concern for chunk and metadata writes. Defaults to the write concern of the
    /// database.
    pub write_concern: Option<WriteConcern>,
}

/// Contains the options for [`GridStore::read_file`](crate::GridStore::read_file) and
/// [`GridStore::readlines_file`](crate::GridStore::readlines_file).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReadFileOptions {
    /// The root to read from. Defaults to `fs`.
    pub root: Option<String>,

    /// The position to start reading at.
    pub offset: Option<u64>,

    /// The number of bytes to read. Defaults to the rest of the file.
    pub length: Option<u64>,
}

/// Contains the options for [`GridStore::list`](crate::GridStore::list) and
/// [`GridStore::list_ids`](crate::GridStore::list_ids).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ListOptions {
    /// The root to list. Defaults to `fs`.
    pub root: Option<String>,

    /// Only list files whose metadata document matches this filter.
    pub filter: Option<Document>,

    /// The number of metadata documents fetched per batch.
    pub batch_size: Option<u32>,
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    event::{CursorClosedEvent, EventHandler},
    serde_util,
};

pub(crate) const DEFAULT_NUMBER_OF_RETRIES: u32 = 5;
pub(crate) const DEFAULT_TAILABLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Specifies the options to a [`Cursor`](crate::cursor::Cursor).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CursorOptions {
    /// Keep the cursor open after the last available document and wait for more. Tailable
    /// cursors cannot be collected with `to_array` and their query shape cannot be changed.
    pub tailable: Option<bool>,

    /// How many times a tailable cursor re-issues a fetch that came back empty before giving
    /// up with a [`CursorNotReady`](crate::error::ErrorKind::CursorNotReady) error.
    ///
    /// The default value is 5.
    pub number_of_retries: Option<u32>,

    /// How long a tailable cursor waits between retries.
    ///
    /// The default value is 100 milliseconds.
    pub tailable_retry_interval: Option<Duration>,

    /// The number of documents the store should return per batch.
    pub batch_size: Option<u32>,

    /// The maximum number of documents to return. A negative value returns a single batch.
    pub limit: Option<i64>,

    /// The number of documents to skip before returning.
    pub skip: Option<u64>,

    /// The order in which to return matching documents. Directions may be given as `1`/`-1`
    /// or as `"asc"`/`"desc"`.
    pub sort: Option<Document>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The maximum amount of time the store may spend on the query.
    pub max_time: Option<Duration>,

    /// Notified once when the cursor is closed.
    #[builder(setter(strip_option))]
    pub close_event_handler: Option<EventHandler<CursorClosedEvent>>,
}

impl CursorOptions {
    pub(crate) fn is_tailable(&self) -> bool {
        self.tailable == Some(true)
    }

    pub(crate) fn number_of_retries(&self) -> u32 {
        self.number_of_retries.unwrap_or(DEFAULT_NUMBER_OF_RETRIES)
    }

    pub(crate) fn tailable_retry_interval(&self) -> Duration {
        self.tailable_retry_interval
            .unwrap_or(DEFAULT_TAILABLE_RETRY_INTERVAL)
    }
}

/// Specifies the options to a [`Cursor::count`](crate::cursor::Cursor::count) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CountOptions {
    /// The number of documents to skip before counting. Takes precedence over the cursor's
    /// own skip.
    pub skip: Option<u64>,

    /// The maximum number of documents to count. Takes precedence over the cursor's own limit.
    pub limit: Option<i64>,

    /// The maximum amount of time to allow the count to run.
    #[serde(
        rename = "maxTimeMS",
        serialize_with = "serde_util::serialize_duration_option_as_int_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis",
        default
    )]
    pub max_time: Option<Duration>,
}

//! Contains all of the types needed to specify options to operations.
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them. For example, to create an instance of
//! [`GridStoreOptions`](struct.GridStoreOptions.html) with only `chunk_size` and `content_type`
//! set, the builder API can be used as follows:
//!
//! ```rust
//! # use gridstore::options::GridStoreOptions;
//! #
//! # let options = GridStoreOptions::builder()
//! #                   .chunk_size(64 * 1024)
//! #                   .content_type("text/plain".to_string())
//! #                   .build();
//! ```

pub use crate::{
    concern::*,
    cursor::{CountOptions, CursorOptions},
    db::options::*,
    gridfs::options::*,
    store::FindOptions,
};

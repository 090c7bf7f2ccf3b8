use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::{self, doc},
    concern::{Acknowledgment, WriteConcern},
    error::ErrorKind,
};

#[test]
fn empty_write_concern() {
    let empty = WriteConcern::builder().build();
    assert!(empty.is_empty());
    assert!(empty.validate().is_ok());

    let w_0 = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
    assert!(!w_0.is_empty());
    assert!(w_0.validate().is_ok());
}

#[test]
fn unacknowledged_with_fsync_is_rejected() {
    let result = WriteConcern::from_document(doc! { "w": 0, "fsync": true });
    let error = result.expect_err("w=0 with fsync should be rejected");
    assert!(matches!(
        *error.kind,
        ErrorKind::InvalidConfiguration { .. }
    ));
}

#[test]
fn unacknowledged_with_journal_is_rejected() {
    let write_concern = WriteConcern::builder()
        .w(Acknowledgment::Nodes(0))
        .journal(true)
        .build();
    assert!(matches!(
        *write_concern.validate().unwrap_err().kind,
        ErrorKind::InvalidConfiguration { .. }
    ));
}

#[test]
fn unacknowledged_alone_is_valid() {
    let write_concern = WriteConcern::from_document(doc! { "w": 0, "fsync": false }).unwrap();
    assert_eq!(write_concern.w, Some(Acknowledgment::Nodes(0)));
    assert_eq!(write_concern.fsync, Some(false));
}

#[test]
fn parses_named_acknowledgment_and_timeout() {
    let write_concern =
        WriteConcern::from_document(doc! { "w": "majority", "wtimeout": 100, "j": true }).unwrap();
    assert_eq!(
        write_concern,
        WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .w_timeout(Duration::from_millis(100))
            .journal(true)
            .build()
    );

    let custom = WriteConcern::from_document(doc! { "w": "dc1" }).unwrap();
    assert_eq!(custom.w, Some(Acknowledgment::Custom("dc1".to_string())));
}

#[test]
fn serializes_to_command_form() {
    let write_concern = WriteConcern::builder()
        .w(Acknowledgment::Nodes(2))
        .w_timeout(Duration::from_millis(50))
        .fsync(true)
        .build();
    assert_eq!(
        bson::to_document(&write_concern).unwrap(),
        doc! { "w": 2, "wtimeout": 50, "fsync": true }
    );
}

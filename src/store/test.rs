use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson, Document},
    concern::{Acknowledgment, WriteConcern},
    error::{CommandError, ErrorKind},
    index::IndexModel,
    results::CursorReply,
    store::{DocumentStore, FailPoint, FindOptions, MemoryStore, Namespace},
};

fn ns() -> Namespace {
    Namespace::new("test", "coll")
}

async fn seed(store: &MemoryStore, count: i32) {
    for i in 0..count {
        store
            .insert_one(&ns(), doc! { "_id": i, "x": i % 3 }, None)
            .await
            .unwrap();
    }
}

fn ids(batch: impl IntoIterator<Item = Document>) -> Vec<i32> {
    batch
        .into_iter()
        .map(|doc| doc.get_i32("_id").unwrap())
        .collect()
}

#[test]
fn namespace_parsing() {
    let ns = Namespace::from_str("db.fs.chunks").unwrap();
    assert_eq!(ns, Namespace::new("db", "fs.chunks"));
    assert_eq!(ns.to_string(), "db.fs.chunks");
    assert!(Namespace::from_str("db").is_none());
}

#[tokio::test]
async fn find_batches_and_get_more() {
    let store = MemoryStore::new();
    seed(&store, 5).await;

    let options = FindOptions::builder()
        .batch_size(2)
        .sort(doc! { "_id": -1 })
        .build();
    let reply = store.find(&ns(), doc! {}, options).await.unwrap();
    assert_ne!(reply.id, 0);
    assert_eq!(ids(reply.first_batch), vec![4, 3]);

    let more = store.get_more(&ns(), reply.id, None).await.unwrap();
    assert_eq!(ids(more.batch), vec![2, 1]);
    assert!(!more.exhausted);

    let last = store.get_more(&ns(), reply.id, None).await.unwrap();
    assert_eq!(ids(last.batch), vec![0]);
    assert!(last.exhausted);
    assert_eq!(store.open_cursor_count(), 0);

    let err = store.get_more(&ns(), reply.id, None).await.unwrap_err();
    assert_eq!(err.code(), Some(43));
}

#[tokio::test]
async fn filters_skip_limit_and_projection() {
    let store = MemoryStore::new();
    seed(&store, 9).await;

    let reply = store
        .find(
            &ns(),
            doc! { "x": { "$in": [1, 2] }, "_id": { "$gte": 2 } },
            FindOptions::builder()
                .skip(1)
                .limit(3)
                .projection(doc! { "x": 0 })
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(reply.id, 0);
    let batch: Vec<Document> = reply.first_batch.into_iter().collect();
    assert_eq!(batch, vec![doc! { "_id": 4 }, doc! { "_id": 5 }, doc! { "_id": 7 }]);
}

#[tokio::test]
async fn negative_limit_is_single_batch() {
    let store = MemoryStore::new();
    seed(&store, 5).await;

    let reply = store
        .find(&ns(), doc! {}, FindOptions::builder().limit(-2).batch_size(1).build())
        .await
        .unwrap();
    assert_eq!(reply.id, 0);
    assert_eq!(ids(reply.first_batch), vec![0, 1]);
}

#[tokio::test]
async fn regex_filters() {
    let store = MemoryStore::new();
    for name in ["alpha.txt", "beta.txt", "ALPHA.bin"] {
        store
            .insert_one(&ns(), doc! { "filename": name }, None)
            .await
            .unwrap();
    }

    let reply = store
        .find(
            &ns(),
            doc! { "filename": { "$regex": "^alpha", "$options": "i" } },
            FindOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.first_batch.len(), 2);

    let reply = store
        .find(
            &ns(),
            doc! { "filename": Bson::RegularExpression(crate::bson::Regex {
                pattern: "\\.txt$".to_string(),
                options: String::new(),
            }) },
            FindOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.first_batch.len(), 2);
}

#[tokio::test]
async fn unique_index_rejects_duplicates() {
    let store = MemoryStore::new();
    let index = IndexModel::builder()
        .keys(doc! { "files_id": 1, "n": 1 })
        .unique(true)
        .build();
    store.create_index(&ns(), index.clone(), None).await.unwrap();
    store.create_index(&ns(), index, None).await.unwrap();
    assert_eq!(store.list_indexes(&ns()).await.unwrap().len(), 1);

    store
        .insert_one(&ns(), doc! { "files_id": 1, "n": 0 }, None)
        .await
        .unwrap();
    let err = store
        .insert_one(&ns(), doc! { "files_id": 1, "n": 0 }, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(11000));
}

#[tokio::test]
async fn replace_one_upserts_and_keeps_id() {
    let store = MemoryStore::new();

    let result = store
        .replace_one(&ns(), doc! { "_id": "a" }, doc! { "v": 1 }, true, None)
        .await
        .unwrap();
    assert_eq!(result.upserted_id, Some(Bson::String("a".to_string())));

    let result = store
        .replace_one(&ns(), doc! { "_id": "a" }, doc! { "v": 2 }, true, None)
        .await
        .unwrap();
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);
    assert_eq!(store.documents(&ns()), vec![doc! { "_id": "a", "v": 2 }]);

    let err = store
        .replace_one(&ns(), doc! { "_id": "a" }, doc! { "$set": { "v": 3 } }, false, None)
        .await
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
}

#[tokio::test]
async fn update_one_sets_and_unsets() {
    let store = MemoryStore::new();
    store
        .insert_one(&ns(), doc! { "_id": 1, "a": 1, "b": 2 }, None)
        .await
        .unwrap();

    let result = store
        .update_one(
            &ns(),
            doc! { "_id": 1 },
            doc! { "$set": { "a": 10 }, "$unset": { "b": "" } },
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.modified_count, 1);
    assert_eq!(store.documents(&ns()), vec![doc! { "_id": 1, "a": 10 }]);
}

#[tokio::test]
async fn delete_many_counts() {
    let store = MemoryStore::new();
    seed(&store, 6).await;
    let result = store.delete_many(&ns(), doc! { "x": 0 }, None).await.unwrap();
    assert_eq!(result.deleted_count, 2);
    assert_eq!(store.documents(&ns()).len(), 4);
}

#[tokio::test]
async fn invalid_write_concern_is_rejected() {
    let store = MemoryStore::new();
    let write_concern = WriteConcern::builder()
        .w(Acknowledgment::Nodes(0))
        .journal(true)
        .build();
    let err = store
        .insert_one(&ns(), doc! {}, Some(&write_concern))
        .await
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidConfiguration { .. }));
    assert!(store.documents(&ns()).is_empty());
}

#[tokio::test]
async fn tailable_cursor_sees_later_inserts() {
    let store = MemoryStore::new();
    seed(&store, 1).await;

    let reply = store
        .find(&ns(), doc! {}, FindOptions::builder().tailable(true).build())
        .await
        .unwrap();
    assert_eq!(ids(reply.first_batch), vec![0]);

    let empty = store.get_more(&ns(), reply.id, None).await.unwrap();
    assert!(empty.batch.is_empty());
    assert!(!empty.exhausted);

    store
        .insert_one(&ns(), doc! { "_id": 1, "x": 1 }, None)
        .await
        .unwrap();
    let more = store.get_more(&ns(), reply.id, None).await.unwrap();
    assert_eq!(ids(more.batch), vec![1]);

    store.kill_cursor(&ns(), reply.id).await.unwrap();
    assert_eq!(store.open_cursor_count(), 0);
}

#[tokio::test]
async fn commands() {
    let store = MemoryStore::new();
    seed(&store, 7).await;

    let reply = store
        .run_command("test", doc! { "count": "coll", "query": { "x": 1 }, "skip": 1 })
        .await
        .unwrap();
    assert_eq!(reply.get_i64("n").unwrap(), 1);

    let reply = store
        .run_command(
            "test",
            doc! {
                "aggregate": "coll",
                "pipeline": [{ "$match": { "x": 0 } }, { "$sort": { "_id": -1 } }],
                "cursor": { "batchSize": 2 },
            },
        )
        .await
        .unwrap();
    let cursor = CursorReply::from_command_reply(&reply).unwrap();
    assert_eq!(ids(cursor.first_batch), vec![6, 3]);
    let rest = store.get_more(&ns(), cursor.id, None).await.unwrap();
    assert_eq!(ids(rest.batch), vec![0]);

    let err = store
        .run_command("test", doc! { "frobnicate": 1 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(59));
}

#[tokio::test]
async fn filemd5_hashes_chunks_in_order() {
    let store = MemoryStore::new();
    let chunks = Namespace::new("test", "fs.chunks");
    for (n, data) in [(1, b"world".to_vec()), (0, b"hello ".to_vec())] {
        store
            .insert_one(
                &chunks,
                doc! {
                    "files_id": 7,
                    "n": n,
                    "data": Bson::Binary(crate::bson::Binary {
                        subtype: crate::bson::spec::BinarySubtype::Generic,
                        bytes: data,
                    }),
                },
                None,
            )
            .await
            .unwrap();
    }

    let reply = store
        .run_command("test", doc! { "filemd5": 7, "root": "fs" })
        .await
        .unwrap();
    assert_eq!(reply.get_i64("numChunks").unwrap(), 2);
    // md5("hello world")
    assert_eq!(
        reply.get_str("md5").unwrap(),
        "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );
}

#[tokio::test]
async fn fail_points() {
    let store = MemoryStore::new();
    store.configure_fail_point(FailPoint::fail_command(
        &["insert"],
        1,
        CommandError::new(91, "ShutdownInProgress", "shutting down"),
    ));

    let err = store.insert_one(&ns(), doc! {}, None).await.unwrap_err();
    assert_eq!(err.code(), Some(91));
    store.insert_one(&ns(), doc! {}, None).await.unwrap();
    assert_eq!(store.command_count("insert"), 2);
}

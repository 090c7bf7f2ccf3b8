use std::{io::SeekFrom, sync::Arc};

use futures::io::{AsyncReadExt, AsyncWriteExt};
use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, Bson, Document, Regex},
    concern::{Acknowledgment, WriteConcern},
    db::options::DatabaseOptions,
    error::{CommandError, Error, ErrorKind, GridFsErrorKind},
    gridfs::{
        options::{GridStoreOptions, ListOptions, ReadFileOptions},
        ChunkSizeUpdate,
        GridStore,
    },
    store::{DocumentStore, FailPoint, MemoryStore},
    Database,
};

async fn setup() -> (Arc<MemoryStore>, Database) {
    let store = Arc::new(MemoryStore::new());
    let db = Database::new(store.clone(), "gridstore_test");
    (store, db)
}

fn chunked(chunk_size: u32) -> GridStoreOptions {
    GridStoreOptions::builder().chunk_size(chunk_size).build()
}

fn bytes(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

async fn write_file(db: &Database, filename: &str, data: &[u8], chunk_size: u32) -> Bson {
    let mut file = GridStore::new(db, filename, "w", chunked(chunk_size)).unwrap();
    file.open().await.unwrap();
    file.write(data, true).await.unwrap();
    file.id().cloned().unwrap()
}

/// The lengths of the stored chunks of a file, ordered by `n`.
fn chunk_lengths(store: &MemoryStore, db: &Database, files_id: &Bson) -> Vec<usize> {
    let mut chunks: Vec<(i64, usize)> = store
        .documents(&db.namespace("fs.chunks"))
        .iter()
        .filter(|chunk| chunk.get("files_id") == Some(files_id))
        .map(|chunk| {
            let n = match chunk.get("n") {
                Some(Bson::Int32(n)) => i64::from(*n),
                Some(Bson::Int64(n)) => *n,
                other => panic!("unexpected n: {:?}", other),
            };
            (n, chunk.get_binary_generic("data").unwrap().len())
        })
        .collect();
    chunks.sort();
    let ns: Vec<i64> = chunks.iter().map(|(n, _)| *n).collect();
    assert_eq!(ns, (0..chunks.len() as i64).collect::<Vec<_>>());
    chunks.into_iter().map(|(_, length)| length).collect()
}

fn files_document(store: &MemoryStore, db: &Database, files_id: &Bson) -> Document {
    store
        .documents(&db.namespace("fs.files"))
        .into_iter()
        .find(|file| file.get("_id") == Some(files_id))
        .unwrap()
}

fn gridfs_kind(error: &Error) -> &GridFsErrorKind {
    match *error.kind {
        ErrorKind::GridFs(ref kind) => kind,
        ref other => panic!("expected a GridFs error, got {:?}", other),
    }
}

#[tokio::test]
async fn round_trip_around_chunk_boundaries() {
    let (store, db) = setup().await;
    let chunk_size = 4;

    for length in [1, 3, 4, 5, 7, 8, 9, 12, 13] {
        let data = bytes(length);
        let filename = format!("file{length}");
        let id = write_file(&db, &filename, &data, chunk_size).await;

        let read = GridStore::read_file(&db, filename.as_str(), None)
            .await
            .unwrap();
        assert_eq!(read, data, "length {length}");

        let lengths = chunk_lengths(&store, &db, &id);
        let expected_count = length.div_ceil(chunk_size as usize).max(1);
        assert_eq!(lengths.len(), expected_count, "length {length}");
        let (last, full) = lengths.split_last().unwrap();
        assert!(full.iter().all(|l| *l == chunk_size as usize));
        assert_eq!(*last, length - full.len() * chunk_size as usize);

        let file = files_document(&store, &db, &id);
        assert_eq!(file.get_i64("length").unwrap(), length as i64);
        assert_eq!(file.get_i32("chunkSize").unwrap(), chunk_size as i32);
    }
}

#[tokio::test]
async fn hello_world() {
    let (store, db) = setup().await;
    let id = write_file(&db, "greeting.txt", b"hello world", 4).await;
    assert_eq!(chunk_lengths(&store, &db, &id), vec![4, 4, 3]);

    let file = files_document(&store, &db, &id);
    assert_eq!(
        file.get_str("md5").unwrap(),
        "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );

    let mut file = GridStore::new(&db, "greeting.txt", "r", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.length(), 11);
    assert_eq!(file.chunk_size(), 4);
    assert_eq!(file.seek(SeekFrom::Start(6)).await.unwrap(), 6);
    assert_eq!(file.read(Some(5)).await.unwrap(), b"world");
    assert_eq!(file.tell(), 11);
    assert!(file.eof());
    assert_eq!(file.getc().await.unwrap(), None);
    file.close().await.unwrap();
}

#[tokio::test]
async fn empty_file_has_one_empty_chunk() {
    let (store, db) = setup().await;
    let id = write_file(&db, "empty", b"", 4).await;
    assert_eq!(chunk_lengths(&store, &db, &id), vec![0]);

    let file = files_document(&store, &db, &id);
    assert_eq!(file.get_i64("length").unwrap(), 0);
    assert_eq!(
        file.get_str("md5").unwrap(),
        "d41d8cd98f00b204e9800998ecf8427e"
    );

    let mut file = GridStore::new(&db, "empty", "r", None).unwrap();
    file.open().await.unwrap();
    let err = file.read(None).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));

    let mut buffer = Vec::new();
    assert_eq!(file.read_into(&mut buffer, None).await.unwrap(), 0);
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn seek_then_read_matches_content() {
    let (_store, db) = setup().await;
    let data = bytes(23);
    write_file(&db, "data", &data, 5).await;

    let mut file = GridStore::new(&db, "data", "r", None).unwrap();
    file.open().await.unwrap();

    for (offset, length) in [(0, 23), (4, 2), (5, 5), (9, 11), (20, 3), (22, 1), (23, 0)] {
        file.seek(SeekFrom::Start(offset)).await.unwrap();
        let read = file.read(Some(length)).await.unwrap();
        assert_eq!(
            read,
            &data[offset as usize..(offset + length) as usize],
            "offset {offset} length {length}"
        );
        assert_eq!(file.tell(), offset + length);
    }

    assert_eq!(file.seek(SeekFrom::End(-3)).await.unwrap(), 20);
    assert_eq!(file.read(None).await.unwrap(), &data[20..]);
    assert_eq!(file.seek(SeekFrom::Current(-13)).await.unwrap(), 10);
    assert_eq!(file.read(Some(2)).await.unwrap(), &data[10..12]);

    let err = file.seek(SeekFrom::Current(-100)).await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
    let err = file.seek(SeekFrom::Start(24)).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::OutOfBounds { length: 23, .. }
    ));
    assert_eq!(file.tell(), 12);

    let err = file.read(Some(12)).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::OutOfBounds {
            position: 12,
            requested: 12,
            length: 23,
        }
    ));
    assert_eq!(file.tell(), 12);

    file.rewind().await.unwrap();
    assert_eq!(file.read(Some(3)).await.unwrap(), &data[..3]);
}

#[tokio::test]
async fn truncate_discards_previous_content() {
    let (store, db) = setup().await;
    let id = write_file(&db, "notes", &bytes(10), 4).await;
    let upload_date = files_document(&store, &db, &id)
        .get_datetime("uploadDate")
        .copied()
        .unwrap();

    let reopened = write_file(&db, "notes", b"xy", 4).await;
    assert_eq!(reopened, id);
    assert_eq!(chunk_lengths(&store, &db, &id), vec![2]);
    assert_eq!(
        GridStore::read_file(&db, "notes", None).await.unwrap(),
        b"xy"
    );

    let file = files_document(&store, &db, &id);
    assert_eq!(file.get_i64("length").unwrap(), 2);
    assert_eq!(file.get_datetime("uploadDate").unwrap(), &upload_date);
    assert_eq!(store.documents(&db.namespace("fs.files")).len(), 1);
}

#[tokio::test]
async fn rewind_while_writing_truncates() {
    let (store, db) = setup().await;

    let mut file = GridStore::new(&db, "draft", "w", chunked(4)).unwrap();
    file.open().await.unwrap();
    file.write(bytes(10), false).await.unwrap();
    assert_eq!(file.length(), 10);

    file.rewind().await.unwrap();
    assert_eq!(file.tell(), 0);
    assert_eq!(file.length(), 0);
    file.write(b"xy", true).await.unwrap();

    let id = file.id().cloned().unwrap();
    assert_eq!(chunk_lengths(&store, &db, &id), vec![2]);
    assert_eq!(
        GridStore::read_file(&db, "draft", None).await.unwrap(),
        b"xy"
    );
}

#[tokio::test]
async fn rewind_on_first_chunk_keeps_content() {
    let (store, db) = setup().await;
    let id = write_file(&db, "short", b"abc", 4).await;

    let mut file = GridStore::new(&db, "short", "w+", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.tell(), 3);
    file.rewind().await.unwrap();
    assert_eq!(file.tell(), 0);
    assert_eq!(file.length(), 3);
    file.close().await.unwrap();

    assert_eq!(chunk_lengths(&store, &db, &id), vec![3]);
    assert_eq!(
        GridStore::read_file(&db, "short", None).await.unwrap(),
        b"abc"
    );

    let mut file = GridStore::new(&db, "short", "w+", None).unwrap();
    file.open().await.unwrap();
    file.rewind().await.unwrap();
    file.write(b"X", true).await.unwrap();
    assert_eq!(
        GridStore::read_file(&db, "short", None).await.unwrap(),
        b"Xbc"
    );
    assert_eq!(files_document(&store, &db, &id).get_i64("length").unwrap(), 3);
}

#[tokio::test]
async fn append_continues_after_existing_content() {
    let (store, db) = setup().await;
    let id = write_file(&db, "log", b"hello", 4).await;
    let upload_date = files_document(&store, &db, &id)
        .get_datetime("uploadDate")
        .copied()
        .unwrap();

    let mut file = GridStore::new(&db, "log", "w+", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.tell(), 5);
    assert_eq!(file.chunk_size(), 4);
    file.write(b" world", true).await.unwrap();
    assert_eq!(file.upload_date(), Some(upload_date));
    assert_eq!(file.md5(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));

    assert_eq!(chunk_lengths(&store, &db, &id), vec![4, 4, 3]);
    assert_eq!(
        GridStore::read_file(&db, "log", None).await.unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn overwrite_after_seek() {
    let (_store, db) = setup().await;
    write_file(&db, "patch", b"hello world", 4).await;

    let mut file = GridStore::new(&db, "patch", "w+", None).unwrap();
    file.open().await.unwrap();
    file.seek(SeekFrom::Start(2)).await.unwrap();
    file.write(b"LLO WO", true).await.unwrap();

    assert_eq!(
        GridStore::read_file(&db, "patch", None).await.unwrap(),
        b"heLLO WOrld"
    );
}

#[tokio::test]
async fn read_missing_file() {
    let (_store, db) = setup().await;

    let mut file = GridStore::new(&db, "missing", "r", None).unwrap();
    let err = file.open().await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));
    assert!(!file.is_open());

    let err = file.close().await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::InvalidMode { .. }
    ));

    let err = GridStore::read_file(&db, ObjectId::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));
}

#[tokio::test]
async fn mode_checks() {
    let (_store, db) = setup().await;
    write_file(&db, "file", b"data", 4).await;

    let mut file = GridStore::new(&db, "file", "rw", None).unwrap();
    let err = file.open().await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::InvalidMode { mode } if mode == "rw"
    ));

    let mut file = GridStore::new(&db, "file", "w+", None).unwrap();
    let err = file.write(b"x", false).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::NotWritable { .. }
    ));
    file.open().await.unwrap();
    let err = file.read(None).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::InvalidMode { .. }
    ));

    let mut file = GridStore::new(&db, "file", "r", None).unwrap();
    file.open().await.unwrap();
    let err = file.write(b"x", false).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::NotWritable { filename: Some(name) } if name == "file"
    ));
    file.close().await.unwrap();
    assert!(!file.is_open());
}

#[tokio::test]
async fn invalid_write_concern_is_rejected() {
    let (store, db) = setup().await;
    let write_concern = WriteConcern::builder()
        .w(Acknowledgment::Nodes(0))
        .fsync(true)
        .build();

    let options = GridStoreOptions::builder()
        .write_concern(write_concern.clone())
        .build();
    let err = GridStore::new(&db, "file", "w", options).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidConfiguration { .. }));

    let options = DatabaseOptions::builder()
        .write_concern(write_concern)
        .build();
    let err = Database::with_options(store, "db", options).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidConfiguration { .. }));

    let err = GridStore::new(&db, "file", "w", chunked(0)).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
}

#[tokio::test]
async fn chunk_size_is_fixed_once_written() {
    let (store, db) = setup().await;

    let mut file = GridStore::new(&db, "sized", "w", None).unwrap();
    assert_eq!(file.set_chunk_size(3).unwrap(), ChunkSizeUpdate::Ignored);
    file.open().await.unwrap();
    assert_eq!(file.set_chunk_size(3).unwrap(), ChunkSizeUpdate::Applied);
    file.write(b"abcd", false).await.unwrap();
    assert_eq!(file.set_chunk_size(5).unwrap(), ChunkSizeUpdate::Ignored);
    file.write(b"efg", true).await.unwrap();

    let id = file.id().cloned().unwrap();
    assert_eq!(chunk_lengths(&store, &db, &id), vec![3, 3, 1]);

    let mut file = GridStore::new(&db, "sized", "w+", None).unwrap();
    file.open().await.unwrap();
    file.seek(SeekFrom::Start(0)).await.unwrap();
    assert_eq!(file.set_chunk_size(5).unwrap(), ChunkSizeUpdate::Ignored);
    assert_eq!(file.chunk_size(), 3);

    let err = file.set_chunk_size(0).unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));

    let mut file = GridStore::new(&db, "sized", "r", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.set_chunk_size(5).unwrap(), ChunkSizeUpdate::Ignored);
}

#[tokio::test]
async fn getc_and_readlines() {
    let (_store, db) = setup().await;
    write_file(&db, "lines", b"one\ntwo\nthree", 4).await;

    let mut file = GridStore::new(&db, "lines", "r", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.getc().await.unwrap(), Some(b'o'));
    assert_eq!(
        file.readlines("\n").await.unwrap(),
        vec!["ne\n", "two\n"]
    );
    assert!(file.readlines("\n").await.unwrap().is_empty());

    let lines = GridStore::readlines_file(&db, "lines", "\n", None)
        .await
        .unwrap();
    assert_eq!(lines, vec!["one\n", "two\n"]);

    write_file(&db, "terminated", b"a\nb\n", 4).await;
    let lines = GridStore::readlines_file(&db, "terminated", "\n", None)
        .await
        .unwrap();
    assert_eq!(lines, vec!["a\n", "b\n"]);
}

#[tokio::test]
async fn read_file_with_offset_and_length() {
    let (_store, db) = setup().await;
    write_file(&db, "greeting", b"hello world", 4).await;

    let options = ReadFileOptions::builder().offset(6).length(5).build();
    let read = GridStore::read_file(&db, "greeting", options).await.unwrap();
    assert_eq!(read, b"world");

    let options = ReadFileOptions::builder().offset(6).length(6).build();
    let err = GridStore::read_file(&db, "greeting", options)
        .await
        .unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::OutOfBounds { .. }
    ));
}

#[tokio::test]
async fn corrupt_chunks_are_reported() {
    let (store, db) = setup().await;
    let id = write_file(&db, "corrupt", &bytes(10), 4).await;
    let chunks = db.namespace("fs.chunks");

    store
        .delete_many(&chunks, doc! { "files_id": id.clone(), "n": 1 }, None)
        .await
        .unwrap();
    let err = GridStore::read_file(&db, "corrupt", None).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::MissingChunk { n: 1 }
    ));

    let short = Binary {
        subtype: BinarySubtype::Generic,
        bytes: vec![1, 2],
    };
    store
        .insert_one(
            &chunks,
            doc! { "files_id": id.clone(), "n": 1, "data": short },
            None,
        )
        .await
        .unwrap();
    let err = GridStore::read_file(&db, "corrupt", None).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::WrongSizeChunk {
            actual_size: 2,
            expected_size: 4,
            n: 1,
        }
    ));
}

#[tokio::test]
async fn failed_read_keeps_position() {
    let (store, db) = setup().await;
    let data = bytes(10);
    let id = write_file(&db, "gappy", &data, 4).await;
    let chunks = db.namespace("fs.chunks");

    let mut file = GridStore::new(&db, "gappy", "r", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.read(Some(2)).await.unwrap(), &data[..2]);

    store
        .delete_many(&chunks, doc! { "files_id": id.clone(), "n": 2 }, None)
        .await
        .unwrap();
    let err = file.read(Some(8)).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::MissingChunk { n: 2 }
    ));
    assert_eq!(file.tell(), 2);

    let mut buffer = b"kept".to_vec();
    assert!(file.read_into(&mut buffer, None).await.is_err());
    assert_eq!(buffer, b"kept");
    assert_eq!(file.tell(), 2);

    assert_eq!(file.read(Some(4)).await.unwrap(), &data[2..6]);
    assert_eq!(file.tell(), 6);
}

#[tokio::test]
async fn missing_first_chunk_is_reported() {
    let (store, db) = setup().await;
    let id = write_file(&db, "headless", &bytes(10), 4).await;
    store
        .delete_many(
            &db.namespace("fs.chunks"),
            doc! { "files_id": id, "n": 0 },
            None,
        )
        .await
        .unwrap();

    let err = GridStore::read_file(&db, "headless", None).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::MissingChunk { n: 0 }
    ));
}

#[tokio::test]
async fn failed_write_does_not_advance() {
    let (store, db) = setup().await;

    let mut file = GridStore::new(&db, "flaky", "w", chunked(4)).unwrap();
    file.open().await.unwrap();
    store.configure_fail_point(FailPoint::fail_command(
        &["update"],
        1,
        CommandError::new(91, "ShutdownInProgress", "shutting down"),
    ));

    let err = file.write(b"abcdef", false).await.unwrap_err();
    assert_eq!(err.code(), Some(91));
    assert_eq!(file.tell(), 0);
    assert_eq!(file.length(), 0);

    file.write(b"abcdef", true).await.unwrap();
    assert_eq!(
        GridStore::read_file(&db, "flaky", None).await.unwrap(),
        b"abcdef"
    );
}

#[tokio::test]
async fn metadata_document() {
    let (store, db) = setup().await;
    let options = GridStoreOptions::builder()
        .chunk_size(8)
        .content_type("text/plain".to_string())
        .metadata(doc! { "owner": "ops" })
        .aliases(vec!["readme".to_string()])
        .build();

    let mut file = GridStore::new(&db, "README", "w", options).unwrap();
    file.open().await.unwrap();
    file.write(b"read me", true).await.unwrap();
    let id = file.id().cloned().unwrap();

    let stored = files_document(&store, &db, &id);
    assert_eq!(stored.get_str("filename").unwrap(), "README");
    assert_eq!(stored.get_str("contentType").unwrap(), "text/plain");
    assert_eq!(stored.get_i64("length").unwrap(), 7);
    assert_eq!(stored.get_i32("chunkSize").unwrap(), 8);
    assert_eq!(stored.get_document("metadata").unwrap(), &doc! { "owner": "ops" });
    assert_eq!(stored.get_array("aliases").unwrap(), &vec![Bson::from("readme")]);
    assert!(stored.get_datetime("uploadDate").is_ok());

    let mut file = GridStore::new(&db, id.clone(), "r", None).unwrap();
    file.open().await.unwrap();
    assert_eq!(file.filename(), Some("README"));
    assert_eq!(file.content_type(), Some("text/plain"));
    assert_eq!(file.metadata(), Some(&doc! { "owner": "ops" }));
    assert_eq!(file.aliases(), Some(&["readme".to_string()][..]));
}

#[tokio::test]
async fn new_file_opened_by_id() {
    let (_store, db) = setup().await;
    let id = ObjectId::new();

    let options = GridStoreOptions::builder()
        .filename("by-id.txt".to_string())
        .build();
    let mut file = GridStore::new(&db, id, "w", options).unwrap();
    file.open().await.unwrap();
    file.write(b"content", true).await.unwrap();
    assert_eq!(file.id(), Some(&Bson::ObjectId(id)));

    assert!(GridStore::exist(&db, "by-id.txt", None).await.unwrap());
    assert_eq!(
        GridStore::read_file(&db, id, None).await.unwrap(),
        b"content"
    );
}

#[tokio::test]
async fn indexes_are_created_once() {
    let (store, db) = setup().await;
    write_file(&db, "a", b"a", 4).await;
    write_file(&db, "b", b"b", 4).await;

    assert_eq!(store.command_count("createIndexes"), 2);
    let indexes = store
        .list_indexes(&db.namespace("fs.chunks"))
        .await
        .unwrap();
    assert!(indexes
        .iter()
        .any(|index| index.keys == doc! { "files_id": 1, "n": 1 } && index.unique == Some(true)));
}

#[tokio::test]
async fn unlink() {
    let (store, db) = setup().await;
    let id = write_file(&db, "doomed", &bytes(9), 4).await;

    let mut file = GridStore::new(&db, "doomed", "r", None).unwrap();
    file.unlink().await.unwrap();
    assert!(!GridStore::exist(&db, "doomed", None).await.unwrap());
    assert!(chunk_lengths(&store, &db, &id).is_empty());

    let err = file.unlink().await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));
}

#[tokio::test]
async fn unlink_before_first_close() {
    let (store, db) = setup().await;

    let mut file = GridStore::new(&db, "scratch", "w", chunked(4)).unwrap();
    file.open().await.unwrap();
    file.write(bytes(9), false).await.unwrap();
    let id = file.id().cloned().unwrap();
    assert_eq!(chunk_lengths(&store, &db, &id), vec![4, 4]);

    file.unlink().await.unwrap();
    assert!(!file.is_open());
    assert!(chunk_lengths(&store, &db, &id).is_empty());
}

#[tokio::test]
async fn unlink_all_collects_failures() {
    let (_store, db) = setup().await;
    write_file(&db, "a", b"a", 4).await;
    write_file(&db, "b", b"b", 4).await;

    GridStore::unlink_all(&db, ["a", "b"], None).await.unwrap();
    assert!(GridStore::list(&db, None).await.unwrap().is_empty());

    let err = GridStore::unlink_all(&db, ["a"], None).await.unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));

    let err = GridStore::unlink_all(&db, ["a", "b"], None)
        .await
        .unwrap_err();
    match *err.kind {
        ErrorKind::Multiple { ref errors } => assert_eq!(errors.len(), 2),
        ref other => panic!("expected multiple errors, got {:?}", other),
    }
}

#[tokio::test]
async fn exist_list_rename_and_drop() {
    let (store, db) = setup().await;
    let a = write_file(&db, "a.txt", b"a", 4).await;
    write_file(&db, "b.txt", b"b", 4).await;
    write_file(&db, "c.log", b"c", 4).await;

    assert!(GridStore::exist(&db, "a.txt", None).await.unwrap());
    assert!(GridStore::exist(&db, a.as_object_id().unwrap(), None)
        .await
        .unwrap());
    let logs = Regex {
        pattern: r"\.log$".to_string(),
        options: String::new(),
    };
    assert!(GridStore::exist(&db, logs, None).await.unwrap());
    assert!(!GridStore::exist(&db, "z.txt", None).await.unwrap());
    assert!(!GridStore::exist(&db, "a.txt", Some("other")).await.unwrap());

    let mut names = GridStore::list(&db, None).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.log"]);

    let options = ListOptions::builder()
        .filter(doc! { "filename": { "$regex": "txt$" } })
        .batch_size(1)
        .build();
    let mut names = GridStore::list(&db, options).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    let ids = GridStore::list_ids(&db, None).await.unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&a));

    GridStore::rename(&db, a.clone(), "renamed.txt", None)
        .await
        .unwrap();
    assert!(GridStore::exist(&db, "renamed.txt", None).await.unwrap());
    assert!(!GridStore::exist(&db, "a.txt", None).await.unwrap());
    let err = GridStore::rename(&db, ObjectId::new(), "x", None)
        .await
        .unwrap_err();
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));

    let mut cursor = GridStore::find(&db, doc! { "filename": "b.txt" }, None, None);
    let found = cursor.to_array().await.unwrap();
    assert_eq!(found.len(), 1);

    GridStore::drop_root(&db, None).await.unwrap();
    assert!(GridStore::list(&db, None).await.unwrap().is_empty());
    assert!(store.documents(&db.namespace("fs.chunks")).is_empty());
}

#[tokio::test]
async fn custom_root() {
    let (store, db) = setup().await;
    let options = GridStoreOptions::builder()
        .root("images".to_string())
        .build();
    let mut file = GridStore::new(&db, "logo.png", "w", options).unwrap();
    file.open().await.unwrap();
    file.write(b"\x89PNG", true).await.unwrap();

    assert_eq!(store.documents(&db.namespace("images.files")).len(), 1);
    assert_eq!(store.documents(&db.namespace("images.chunks")).len(), 1);
    assert!(!GridStore::exist(&db, "logo.png", None).await.unwrap());
    assert!(GridStore::exist(&db, "logo.png", Some("images"))
        .await
        .unwrap());

    let options = ReadFileOptions::builder().root("images".to_string()).build();
    assert_eq!(
        GridStore::read_file(&db, "logo.png", options).await.unwrap(),
        b"\x89PNG"
    );
}

#[tokio::test]
async fn stream_round_trip() {
    let (store, db) = setup().await;

    let mut upload = GridStore::new(&db, "streamed", "w", chunked(4))
        .unwrap()
        .into_stream();
    upload.write_all(b"hello ").await.unwrap();
    upload.write_all(b"world").await.unwrap();
    upload.close().await.unwrap();
    assert!(upload.is_ended());

    let err = upload.write_all(b"more").await.unwrap_err();
    let err = Error::from_futures_io_error(err);
    assert!(matches!(gridfs_kind(&err), GridFsErrorKind::StreamEnded));

    let id = upload.into_inner().unwrap().id().cloned().unwrap();
    assert_eq!(chunk_lengths(&store, &db, &id), vec![4, 4, 3]);

    let mut download = GridStore::new(&db, "streamed", "r", None)
        .unwrap()
        .into_stream();
    let mut buf = [0u8; 100];
    assert_eq!(download.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf[..4], b"hell");

    let mut rest = Vec::new();
    download.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"o world");
    assert_eq!(download.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn stream_end_writes_and_closes() {
    let (_store, db) = setup().await;

    let mut stream = GridStore::new(&db, "ended", "w", None)
        .unwrap()
        .into_stream();
    stream.end(Some(&b"last words"[..])).await.unwrap();
    assert!(stream.is_ended());
    assert_eq!(
        GridStore::read_file(&db, "ended", None).await.unwrap(),
        b"last words"
    );

    let err = stream.end(Some(&b"more"[..])).await.unwrap_err();
    assert!(matches!(gridfs_kind(&err), GridFsErrorKind::StreamEnded));

    let mut untouched = GridStore::new(&db, "untouched", "w", None)
        .unwrap()
        .into_stream();
    untouched.end(None).await.unwrap();
    let file = untouched.into_inner().unwrap();
    assert_eq!(file.length(), 0);
    assert!(GridStore::exist(&db, "untouched", None).await.unwrap());
}

#[tokio::test]
async fn stream_copy_to() {
    let (_store, db) = setup().await;
    let data = bytes(1000);
    write_file(&db, "big", &data, 64).await;

    let mut stream = GridStore::new(&db, "big", "r", None)
        .unwrap()
        .into_stream();
    let mut destination = Vec::new();
    assert_eq!(stream.copy_to(&mut destination).await.unwrap(), 1000);
    assert_eq!(destination, data);
    assert!(stream.is_ended());
}

#[tokio::test]
async fn stream_over_missing_file() {
    let (_store, db) = setup().await;

    let mut stream = GridStore::new(&db, "missing", "r", None)
        .unwrap()
        .into_stream();
    let mut buf = Vec::new();
    let err = stream.read_to_end(&mut buf).await.unwrap_err();
    let err = Error::from_futures_io_error(err);
    assert!(matches!(
        gridfs_kind(&err),
        GridFsErrorKind::FileNotFound { .. }
    ));
}

use std::{
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use futures_util::future::{self, BoxFuture, FutureExt};
use md5::{Digest, Md5};
use regex::RegexBuilder;

use super::{id_from_filter, DocumentStore, FindOptions, Namespace};
use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
    bson_util::{
        bson_eq,
        compare_bson,
        first_key,
        get_int,
        get_u64,
        lookup,
        replacement_document_check,
        update_document_check,
    },
    concern::WriteConcern,
    error::{CommandError, Error, Result},
    index::IndexModel,
    results::{CursorReply, DeleteResult, GetMoreResult, InsertOneResult, UpdateResult},
};

const DEFAULT_FIRST_BATCH_SIZE: usize = 101;

/// An in-process [`DocumentStore`].
///
/// Supports equality, `$in`, `$nin`, `$ne`, comparison, `$exists` and `$regex` filters, sorts,
/// inclusion and exclusion projections, batched and tailable cursors, unique indexes and the
/// `count`, `aggregate` (`$match`, `$sort`, `$skip`, `$limit`, `$project`), `filemd5` and
/// `ping` commands. Failures can be injected with [`FailPoint`]s.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<Namespace, Collection>,
    cursors: HashMap<i64, ServerCursor>,
    next_cursor_id: i64,
    fail_points: Vec<FailPoint>,
    command_log: Vec<String>,
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
}

#[derive(Debug)]
struct ServerCursor {
    ns: Namespace,
    batch_size: Option<u32>,
    source: CursorSource,
}

#[derive(Debug)]
enum CursorSource {
    Snapshot(VecDeque<Document>),
    Tailable {
        filter: Document,
        projection: Option<Document>,
        next_index: usize,
    },
}

/// Makes a [`MemoryStore`] misbehave for the next `times` invocations of the named commands.
///
/// Command names are `find`, `getMore`, `killCursors`, `insert`, `update`, `delete`,
/// `createIndexes`, `listIndexes`, `drop`, and the first key of any command passed to
/// [`DocumentStore::run_command`].
#[derive(Clone, Debug)]
pub struct FailPoint {
    command_names: Vec<String>,
    times: u32,
    action: FailPointAction,
}

#[derive(Clone, Debug)]
enum FailPointAction {
    Error(Error),
    EmptyBatch,
}

impl FailPoint {
    /// Fail the named commands with `error`.
    pub fn fail_command(command_names: &[&str], times: u32, error: impl Into<Error>) -> Self {
        Self {
            command_names: command_names.iter().map(ToString::to_string).collect(),
            times,
            action: FailPointAction::Error(error.into()),
        }
    }

    /// Answer `getMore` on a live cursor with an empty batch without advancing it, the way a
    /// tailable cursor responds while it waits for new documents.
    pub fn empty_get_more(times: u32) -> Self {
        Self {
            command_names: vec!["getMore".to_string()],
            times,
            action: FailPointAction::EmptyBatch,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a fail point. Fail points are consulted in the order they were added.
    pub fn configure_fail_point(&self, fail_point: FailPoint) {
        self.lock().fail_points.push(fail_point);
    }

    pub fn clear_fail_points(&self) {
        self.lock().fail_points.clear();
    }

    /// How many times the named command has been issued against this store.
    pub fn command_count(&self, command_name: &str) -> usize {
        self.lock()
            .command_log
            .iter()
            .filter(|name| name.as_str() == command_name)
            .count()
    }

    /// A copy of every document in the collection, in insertion order.
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.lock()
            .collections
            .get(ns)
            .map(|coll| coll.documents.clone())
            .unwrap_or_default()
    }

    /// The number of server-side cursors that have not been exhausted or killed.
    pub fn open_cursor_count(&self) -> usize {
        self.lock().cursors.len()
    }
}

impl Inner {
    /// Records the command and applies any matching fail point. Returns whether the command
    /// should answer with an empty batch.
    fn enter(&mut self, command_name: &str) -> Result<bool> {
        self.command_log.push(command_name.to_string());
        if let Some(fail_point) = self.fail_points.iter_mut().find(|fp| {
            fp.times > 0 && fp.command_names.iter().any(|name| name == command_name)
        }) {
            fail_point.times -= 1;
            return match fail_point.action {
                FailPointAction::Error(ref error) => Err(error.clone()),
                FailPointAction::EmptyBatch => Ok(true),
            };
        }
        Ok(false)
    }

    fn register_cursor(&mut self, cursor: ServerCursor) -> i64 {
        self.next_cursor_id += 1;
        let id = self.next_cursor_id;
        self.cursors.insert(id, cursor);
        id
    }

    fn query(
        &self,
        ns: &Namespace,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        if let Some(coll) = self.collections.get(ns) {
            for document in &coll.documents {
                if matches(document, filter)? {
                    documents.push(document.clone());
                }
            }
        }
        if let Some(ref sort) = options.sort {
            sort_documents(&mut documents, sort)?;
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let mut documents: Vec<Document> = documents.into_iter().skip(skip).collect();
        if let Some(limit) = options.limit.filter(|limit| *limit != 0) {
            documents.truncate(limit.unsigned_abs() as usize);
        }
        Ok(documents
            .iter()
            .map(|document| project(document, options.projection.as_ref()))
            .collect())
    }

    fn find(
        &mut self,
        ns: &Namespace,
        filter: Document,
        options: FindOptions,
    ) -> Result<CursorReply> {
        self.enter("find")?;

        if options.explain == Some(true) {
            let returned = self.query(ns, &filter, &options)?.len();
            let stage = if options.sort.is_some() { "SORT" } else { "COLLSCAN" };
            let plan = doc! {
                "queryPlanner": {
                    "namespace": ns.to_string(),
                    "parsedQuery": filter,
                    "winningPlan": { "stage": stage },
                },
                "executionStats": { "nReturned": returned as i64 },
            };
            return Ok(CursorReply::new(ns.clone(), 0, vec![plan]));
        }

        let first_batch_size = options
            .batch_size
            .map(|size| size as usize)
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_FIRST_BATCH_SIZE);

        if options.tailable == Some(true) {
            let mut next_index = 0;
            let first_batch = tailable_batch(
                self.collections.get(ns),
                &filter,
                options.projection.as_ref(),
                &mut next_index,
                first_batch_size,
            )?;
            let id = self.register_cursor(ServerCursor {
                ns: ns.clone(),
                batch_size: options.batch_size,
                source: CursorSource::Tailable {
                    filter,
                    projection: options.projection,
                    next_index,
                },
            });
            return Ok(CursorReply::new(ns.clone(), id, first_batch));
        }

        let single_batch = options.limit.is_some_and(|limit| limit < 0);
        let first_batch_size = match options.limit {
            Some(limit) if limit < 0 => limit.unsigned_abs() as usize,
            _ => first_batch_size,
        };
        let mut remaining: VecDeque<Document> = self.query(ns, &filter, &options)?.into();
        let first_batch: Vec<Document> = remaining
            .drain(..first_batch_size.min(remaining.len()))
            .collect();

        let id = if remaining.is_empty() || single_batch {
            0
        } else {
            self.register_cursor(ServerCursor {
                ns: ns.clone(),
                batch_size: options.batch_size,
                source: CursorSource::Snapshot(remaining),
            })
        };
        Ok(CursorReply::new(ns.clone(), id, first_batch))
    }

    fn get_more(
        &mut self,
        ns: &Namespace,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> Result<GetMoreResult> {
        let respond_empty = self.enter("getMore")?;

        let cursor = match self.cursors.get_mut(&cursor_id) {
            Some(cursor) if cursor.ns == *ns => cursor,
            _ => {
                return Err(CommandError::new(
                    43,
                    "CursorNotFound",
                    format!("cursor id {cursor_id} not found"),
                )
                .into())
            }
        };
        if respond_empty {
            return Ok(GetMoreResult::new(Vec::new(), false));
        }
        let size = batch_size
            .or(cursor.batch_size)
            .map(|size| size as usize)
            .filter(|size| *size > 0)
            .unwrap_or(usize::MAX);

        match cursor.source {
            CursorSource::Snapshot(ref mut remaining) => {
                let batch: Vec<Document> = remaining.drain(..size.min(remaining.len())).collect();
                let exhausted = remaining.is_empty();
                if exhausted {
                    self.cursors.remove(&cursor_id);
                }
                Ok(GetMoreResult::new(batch, exhausted))
            }
            CursorSource::Tailable {
                ref filter,
                ref projection,
                ref mut next_index,
            } => {
                let batch = tailable_batch(
                    self.collections.get(ns),
                    filter,
                    projection.as_ref(),
                    next_index,
                    size,
                )?;
                Ok(GetMoreResult::new(batch, false))
            }
        }
    }

    fn kill_cursor(&mut self, cursor_id: i64) -> Result<()> {
        self.enter("killCursors")?;
        self.cursors.remove(&cursor_id);
        Ok(())
    }

    fn insert_one(
        &mut self,
        ns: &Namespace,
        document: Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<InsertOneResult> {
        self.enter("insert")?;
        check_write_concern(write_concern)?;
        replacement_document_check(&document)?;

        let document = with_id(document, None);
        let inserted_id = document.get("_id").cloned().unwrap_or(Bson::Null);
        let coll = self.collections.entry(ns.clone()).or_default();
        coll.check_unique(ns, &document, None)?;
        coll.documents.push(document);
        Ok(InsertOneResult { inserted_id })
    }

    fn replace_one(
        &mut self,
        ns: &Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
        write_concern: Option<&WriteConcern>,
    ) -> Result<UpdateResult> {
        self.enter("update")?;
        check_write_concern(write_concern)?;
        replacement_document_check(&replacement)?;

        let coll = self.collections.entry(ns.clone()).or_default();
        let position = coll.position(&filter)?;
        match position {
            Some(index) => {
                let existing_id = coll.documents[index].get("_id").cloned();
                if let (Some(new_id), Some(old_id)) =
                    (replacement.get("_id"), existing_id.as_ref())
                {
                    if !bson_eq(new_id, old_id) {
                        return Err(CommandError::new(
                            66,
                            "ImmutableField",
                            "the (immutable) field '_id' was found to have been altered",
                        )
                        .into());
                    }
                }
                let replacement = with_id(replacement, existing_id);
                coll.check_unique(ns, &replacement, Some(index))?;
                let modified = coll.documents[index] != replacement;
                coll.documents[index] = replacement;
                Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: u64::from(modified),
                    upserted_id: None,
                })
            }
            None if upsert => {
                let replacement = with_id(replacement, id_from_filter(&filter));
                coll.check_unique(ns, &replacement, None)?;
                let upserted_id = replacement.get("_id").cloned();
                coll.documents.push(replacement);
                Ok(UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                    upserted_id,
                })
            }
            None => Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: None,
            }),
        }
    }

    fn update_one(
        &mut self,
        ns: &Namespace,
        filter: Document,
        update: Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<UpdateResult> {
        self.enter("update")?;
        check_write_concern(write_concern)?;
        update_document_check(&update)?;

        let Some(coll) = self.collections.get_mut(ns) else {
            return Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: None,
            });
        };
        let Some(index) = coll.position(&filter)? else {
            return Ok(UpdateResult {
                matched_count: 0,
                modified_count: 0,
                upserted_id: None,
            });
        };

        let mut updated = coll.documents[index].clone();
        for (operator, fields) in &update {
            let Bson::Document(fields) = fields else {
                return Err(bad_value(format!("{operator} requires a document")));
            };
            match operator.as_str() {
                "$set" => {
                    for (key, value) in fields {
                        if key == "_id" {
                            return Err(bad_value("cannot $set _id"));
                        }
                        updated.insert(key.clone(), value.clone());
                    }
                }
                "$unset" => {
                    for key in fields.keys() {
                        updated.remove(key);
                    }
                }
                other => {
                    return Err(CommandError::new(
                        9,
                        "FailedToParse",
                        format!("unknown update operator {other}"),
                    )
                    .into())
                }
            }
        }
        coll.check_unique(ns, &updated, Some(index))?;
        let modified = coll.documents[index] != updated;
        coll.documents[index] = updated;
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: u64::from(modified),
            upserted_id: None,
        })
    }

    fn delete_many(
        &mut self,
        ns: &Namespace,
        filter: Document,
        write_concern: Option<&WriteConcern>,
    ) -> Result<DeleteResult> {
        self.enter("delete")?;
        check_write_concern(write_concern)?;

        let Some(coll) = self.collections.get_mut(ns) else {
            return Ok(DeleteResult { deleted_count: 0 });
        };
        let mut kept = Vec::with_capacity(coll.documents.len());
        let mut deleted_count = 0;
        for document in coll.documents.drain(..) {
            if matches(&document, &filter)? {
                deleted_count += 1;
            } else {
                kept.push(document);
            }
        }
        coll.documents = kept;
        Ok(DeleteResult { deleted_count })
    }

    fn create_index(
        &mut self,
        ns: &Namespace,
        index: IndexModel,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        self.enter("createIndexes")?;
        check_write_concern(write_concern)?;

        let coll = self.collections.entry(ns.clone()).or_default();
        if !coll.indexes.iter().any(|existing| existing.has_keys(&index.keys)) {
            let name = index.index_name();
            coll.indexes.push(IndexModel {
                name: Some(name),
                ..index
            });
        }
        Ok(())
    }

    fn list_indexes(&mut self, ns: &Namespace) -> Result<Vec<IndexModel>> {
        self.enter("listIndexes")?;
        Ok(self
            .collections
            .get(ns)
            .map(|coll| coll.indexes.clone())
            .unwrap_or_default())
    }

    fn drop_collection(
        &mut self,
        ns: &Namespace,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        self.enter("drop")?;
        check_write_concern(write_concern)?;
        self.collections.remove(ns);
        self.cursors.retain(|_, cursor| cursor.ns != *ns);
        Ok(())
    }

    fn run_command(&mut self, db: &str, command: Document) -> Result<Document> {
        let name = first_key(&command)
            .ok_or_else(|| bad_value("empty command"))?
            .to_string();
        self.enter(&name)?;

        match name.as_str() {
            "ping" => Ok(doc! { "ok": 1.0 }),
            "count" => {
                let ns = Namespace::new(db, command.get_str("count")?);
                let query = match command.get("query") {
                    Some(Bson::Document(query)) => query.clone(),
                    _ => Document::new(),
                };
                let options = FindOptions::builder()
                    .skip(command.get("skip").and_then(get_u64))
                    .limit(command.get("limit").and_then(get_int))
                    .build();
                let n = self.query(&ns, &query, &options)?.len();
                Ok(doc! { "n": n as i64, "ok": 1.0 })
            }
            "filemd5" => {
                let files_id = command.get("filemd5").cloned().unwrap_or(Bson::Null);
                let root = command.get_str("root").unwrap_or("fs");
                let ns = Namespace::new(db, format!("{root}.chunks"));
                let options = FindOptions::builder().sort(doc! { "n": 1 }).build();
                let chunks = self.query(&ns, &doc! { "files_id": files_id }, &options)?;

                let mut hasher = Md5::new();
                for chunk in &chunks {
                    match chunk.get("data") {
                        Some(Bson::Binary(binary)) => hasher.update(&binary.bytes),
                        _ => return Err(bad_value("chunk is missing its data field")),
                    }
                }
                Ok(doc! {
                    "numChunks": chunks.len() as i64,
                    "md5": hex::encode(hasher.finalize()),
                    "ok": 1.0,
                })
            }
            "aggregate" => {
                let ns = Namespace::new(db, command.get_str("aggregate")?);
                let pipeline = command.get_array("pipeline")?;
                let batch_size = command
                    .get_document("cursor")
                    .ok()
                    .and_then(|cursor| cursor.get("batchSize"))
                    .and_then(get_u64)
                    .map(|size| size as usize)
                    .filter(|size| *size > 0)
                    .unwrap_or(DEFAULT_FIRST_BATCH_SIZE);

                let mut documents = self.query(&ns, &Document::new(), &FindOptions::default())?;
                for stage in pipeline {
                    let Bson::Document(stage) = stage else {
                        return Err(bad_value("pipeline stages must be documents"));
                    };
                    documents = apply_stage(documents, stage)?;
                }

                let mut remaining: VecDeque<Document> = documents.into();
                let first_batch: Vec<Bson> = remaining
                    .drain(..batch_size.min(remaining.len()))
                    .map(Bson::Document)
                    .collect();
                let id = if remaining.is_empty() {
                    0
                } else {
                    self.register_cursor(ServerCursor {
                        ns: ns.clone(),
                        batch_size: None,
                        source: CursorSource::Snapshot(remaining),
                    })
                };
                Ok(doc! {
                    "cursor": { "id": id, "ns": ns.to_string(), "firstBatch": first_batch },
                    "ok": 1.0,
                })
            }
            other => Err(CommandError::new(
                59,
                "CommandNotFound",
                format!("no such command: '{other}'"),
            )
            .into()),
        }
    }
}

impl Collection {
    fn position(&self, filter: &Document) -> Result<Option<usize>> {
        for (index, document) in self.documents.iter().enumerate() {
            if matches(document, filter)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn check_unique(
        &self,
        ns: &Namespace,
        candidate: &Document,
        skip: Option<usize>,
    ) -> Result<()> {
        for (position, existing) in self.documents.iter().enumerate() {
            if Some(position) == skip {
                continue;
            }
            if let (Some(a), Some(b)) = (candidate.get("_id"), existing.get("_id")) {
                if bson_eq(a, b) {
                    return Err(duplicate_key(ns, "_id_"));
                }
            }
            for index in self.indexes.iter().filter(|index| index.is_unique()) {
                let same_key = index.keys.keys().all(|key| {
                    match (lookup(candidate, key), lookup(existing, key)) {
                        (Some(a), Some(b)) => bson_eq(a, b),
                        (None, None) => true,
                        _ => false,
                    }
                });
                if same_key {
                    return Err(duplicate_key(ns, &index.index_name()));
                }
            }
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn find<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        options: FindOptions,
    ) -> BoxFuture<'a, Result<CursorReply>> {
        future::ready(self.lock().find(ns, filter, options)).boxed()
    }

    fn get_more<'a>(
        &'a self,
        ns: &'a Namespace,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> BoxFuture<'a, Result<GetMoreResult>> {
        future::ready(self.lock().get_more(ns, cursor_id, batch_size)).boxed()
    }

    fn kill_cursor<'a>(&'a self, _ns: &'a Namespace, cursor_id: i64) -> BoxFuture<'a, Result<()>> {
        future::ready(self.lock().kill_cursor(cursor_id)).boxed()
    }

    fn insert_one<'a>(
        &'a self,
        ns: &'a Namespace,
        document: Document,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<InsertOneResult>> {
        future::ready(self.lock().insert_one(ns, document, write_concern)).boxed()
    }

    fn replace_one<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<UpdateResult>> {
        future::ready(
            self.lock()
                .replace_one(ns, filter, replacement, upsert, write_concern),
        )
        .boxed()
    }

    fn update_one<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        update: Document,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<UpdateResult>> {
        future::ready(self.lock().update_one(ns, filter, update, write_concern)).boxed()
    }

    fn delete_many<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<DeleteResult>> {
        future::ready(self.lock().delete_many(ns, filter, write_concern)).boxed()
    }

    fn create_index<'a>(
        &'a self,
        ns: &'a Namespace,
        index: IndexModel,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<()>> {
        future::ready(self.lock().create_index(ns, index, write_concern)).boxed()
    }

    fn list_indexes<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Result<Vec<IndexModel>>> {
        future::ready(self.lock().list_indexes(ns)).boxed()
    }

    fn drop_collection<'a>(
        &'a self,
        ns: &'a Namespace,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<()>> {
        future::ready(self.lock().drop_collection(ns, write_concern)).boxed()
    }

    fn run_command<'a>(
        &'a self,
        db: &'a str,
        command: Document,
    ) -> BoxFuture<'a, Result<Document>> {
        future::ready(self.lock().run_command(db, command)).boxed()
    }
}

fn check_write_concern(write_concern: Option<&WriteConcern>) -> Result<()> {
    match write_concern {
        Some(write_concern) => write_concern.validate(),
        None => Ok(()),
    }
}

fn bad_value(message: impl Into<String>) -> Error {
    CommandError::new(2, "BadValue", message).into()
}

fn duplicate_key(ns: &Namespace, index_name: &str) -> Error {
    CommandError::new(
        11000,
        "DuplicateKey",
        format!("E11000 duplicate key error collection: {ns} index: {index_name}"),
    )
    .into()
}

/// Places `_id` first, taking it from `id` or generating one when the document has none.
fn with_id(document: Document, id: Option<Bson>) -> Document {
    let id = document
        .get("_id")
        .cloned()
        .or(id)
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
    let mut out = doc! { "_id": id };
    for (key, value) in document {
        if key != "_id" {
            out.insert(key, value);
        }
    }
    out
}

fn tailable_batch(
    coll: Option<&Collection>,
    filter: &Document,
    projection: Option<&Document>,
    next_index: &mut usize,
    batch_size: usize,
) -> Result<Vec<Document>> {
    let mut batch = Vec::new();
    let Some(coll) = coll else {
        return Ok(batch);
    };
    while *next_index < coll.documents.len() && batch.len() < batch_size {
        let document = &coll.documents[*next_index];
        *next_index += 1;
        if matches(document, filter)? {
            batch.push(project(document, projection));
        }
    }
    Ok(batch)
}

fn apply_stage(documents: Vec<Document>, stage: &Document) -> Result<Vec<Document>> {
    let (name, argument) = stage
        .iter()
        .next()
        .ok_or_else(|| bad_value("empty pipeline stage"))?;
    match (name.as_str(), argument) {
        ("$match", Bson::Document(filter)) => {
            let mut out = Vec::new();
            for document in documents {
                if matches(&document, filter)? {
                    out.push(document);
                }
            }
            Ok(out)
        }
        ("$sort", Bson::Document(sort)) => {
            let mut documents = documents;
            sort_documents(&mut documents, sort)?;
            Ok(documents)
        }
        ("$skip", value) => {
            let skip = get_u64(value).ok_or_else(|| bad_value("$skip must be a number"))?;
            Ok(documents.into_iter().skip(skip as usize).collect())
        }
        ("$limit", value) => {
            let limit = get_u64(value).ok_or_else(|| bad_value("$limit must be a number"))?;
            Ok(documents.into_iter().take(limit as usize).collect())
        }
        ("$project", Bson::Document(projection)) => Ok(documents
            .iter()
            .map(|document| project(document, Some(projection)))
            .collect()),
        (other, _) => Err(bad_value(format!("unsupported pipeline stage {other}"))),
    }
}

fn matches(document: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub_filter in sub_filters(condition)? {
                    if !matches(document, sub_filter)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub_filter in sub_filters(condition)? {
                    if matches(document, sub_filter)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            _ => matches_condition(lookup(document, key), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters(condition: &Bson) -> Result<Vec<&Document>> {
    match condition {
        Bson::Array(items) => items
            .iter()
            .map(|item| match item {
                Bson::Document(filter) => Ok(filter),
                _ => Err(bad_value("$and/$or entries must be documents")),
            })
            .collect(),
        _ => Err(bad_value("$and/$or require an array")),
    }
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> Result<bool> {
    match condition {
        Bson::Document(operators)
            if first_key(operators).is_some_and(|key| key.starts_with('$')) =>
        {
            for (operator, argument) in operators {
                let matched = match operator.as_str() {
                    "$eq" => equals(value, argument),
                    "$ne" => !equals(value, argument),
                    "$in" => array_argument(argument)?
                        .iter()
                        .any(|candidate| equals(value, candidate)),
                    "$nin" => !array_argument(argument)?
                        .iter()
                        .any(|candidate| equals(value, candidate)),
                    "$gt" => ordered(value, argument, |o| o == Ordering::Greater),
                    "$gte" => ordered(value, argument, |o| o != Ordering::Less),
                    "$lt" => ordered(value, argument, |o| o == Ordering::Less),
                    "$lte" => ordered(value, argument, |o| o != Ordering::Greater),
                    "$exists" => value.is_some() == is_truthy(argument),
                    "$regex" => {
                        let options = operators.get_str("$options").unwrap_or("");
                        match argument {
                            Bson::String(pattern) => regex_matches(value, pattern, options)?,
                            Bson::RegularExpression(regex) => {
                                regex_matches(value, &regex.pattern, &regex.options)?
                            }
                            _ => return Err(bad_value("$regex has to be a string")),
                        }
                    }
                    "$options" => true,
                    other => return Err(bad_value(format!("unknown operator: {other}"))),
                };
                if !matched {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Bson::RegularExpression(regex) => regex_matches(value, &regex.pattern, &regex.options),
        expected => Ok(equals(value, expected)),
    }
}

fn array_argument(argument: &Bson) -> Result<&Vec<Bson>> {
    match argument {
        Bson::Array(items) => Ok(items),
        _ => Err(bad_value("$in/$nin need an array")),
    }
}

fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| bson_eq(item, expected))
        }
        Some(value) => bson_eq(value, expected),
    }
}

fn ordered(value: Option<&Bson>, argument: &Bson, predicate: impl Fn(Ordering) -> bool) -> bool {
    value
        .and_then(|value| compare_bson(value, argument))
        .is_some_and(predicate)
}

fn regex_matches(value: Option<&Bson>, pattern: &str, options: &str) -> Result<bool> {
    let Some(Bson::String(value)) = value else {
        return Ok(false);
    };
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| bad_value(e.to_string()))?;
    Ok(regex.is_match(value))
}

fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        other => get_int(other).map_or(true, |i| i != 0),
    }
}

fn sort_documents(documents: &mut [Document], sort: &Document) -> Result<()> {
    let keys = sort
        .iter()
        .map(|(key, direction)| match get_int(direction) {
            Some(direction @ (1 | -1)) => Ok((key.clone(), direction)),
            _ => Err(bad_value(format!("bad sort direction for {key}: {direction}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    documents.sort_by(|a, b| {
        for (key, direction) in &keys {
            let ordering = match (lookup(a, key), lookup(b, key)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare_bson(a, b).unwrap_or(Ordering::Equal),
            };
            let ordering = if *direction < 0 {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn project(document: &Document, projection: Option<&Document>) -> Document {
    let Some(projection) = projection else {
        return document.clone();
    };
    let inclusive = projection
        .iter()
        .any(|(key, value)| key != "_id" && is_truthy(value));

    if !inclusive {
        let mut out = document.clone();
        for (key, value) in projection {
            if !is_truthy(value) {
                out.remove(key);
            }
        }
        return out;
    }

    let mut out = Document::new();
    if projection.get("_id").map_or(true, is_truthy) {
        if let Some(id) = document.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (key, value) in projection {
        if key != "_id" && is_truthy(value) {
            if let Some(field) = lookup(document, key) {
                out.insert(key.clone(), field.clone());
            }
        }
    }
    out
}

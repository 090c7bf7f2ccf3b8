use std::{cmp::Ordering, convert::TryFrom};

use crate::{
    bson::{Bson, Document},
    error::{ErrorKind, Result},
};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `u64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_u64(val: &Bson) -> Option<u64> {
    match *val {
        Bson::Int32(i) => u64::try_from(i).ok(),
        Bson::Int64(i) => u64::try_from(i).ok(),
        Bson::Double(f) if (f - (f as u64 as f64)).abs() <= f64::EPSILON => Some(f as u64),
        _ => None,
    }
}

fn get_f64(val: &Bson) -> Option<f64> {
    match *val {
        Bson::Int32(i) => Some(f64::from(i)),
        Bson::Int64(i) => Some(i as f64),
        Bson::Double(f) => Some(f),
        _ => None,
    }
}

pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

pub(crate) fn update_document_check(update: &Document) -> Result<()> {
    match first_key(update) {
        Some(s) if s.starts_with('$') => Ok(()),
        _ => Err(ErrorKind::InvalidArgument {
            message: "update document must have first key starting with '$".to_string(),
        }
        .into()),
    }
}

pub(crate) fn replacement_document_check(replacement: &Document) -> Result<()> {
    match first_key(replacement) {
        Some(s) if s.starts_with('$') => Err(ErrorKind::InvalidArgument {
            message: "replace document must have first key not starting with '$'".to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// Compares two values of the same broad type. Numbers compare across representations.
/// Values of unrelated types are unordered.
pub(crate) fn compare_bson(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (get_f64(a), get_f64(b)) {
        return a.partial_cmp(&b);
    }
    match (a, b) {
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.cmp(b)),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => Some(a.cmp(b)),
        (Bson::Boolean(a), Bson::Boolean(b)) => Some(a.cmp(b)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Equality that treats `1`, `1i64` and `1.0` as the same value.
pub(crate) fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (get_f64(a), get_f64(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Looks up a possibly dotted path such as `metadata.owner`.
pub(crate) fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut value = document.get(parts.next()?)?;
    for part in parts {
        value = match value {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(value)
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use super::*;
    use crate::bson::doc;

    #[test]
    fn numbers_compare_across_types() {
        assert!(bson_eq(&Bson::Int32(4), &Bson::Double(4.0)));
        assert_eq!(
            compare_bson(&Bson::Int64(3), &Bson::Int32(4)),
            Some(Ordering::Less)
        );
        assert_eq!(compare_bson(&Bson::Int32(1), &Bson::String("1".into())), None);
    }

    #[test]
    fn dotted_lookup() {
        let document = doc! { "metadata": { "owner": "ana" }, "n": 2 };
        assert_eq!(
            lookup(&document, "metadata.owner"),
            Some(&Bson::String("ana".into()))
        );
        assert_eq!(lookup(&document, "n.missing"), None);
        assert_eq!(get_u64(&Bson::Int32(-1)), None);
        assert_eq!(get_int(&Bson::Double(2.5)), None);
    }
}

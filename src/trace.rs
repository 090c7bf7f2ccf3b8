use bson::{Bson, Document};

pub(crate) const FILE_TRACING_EVENT_TARGET: &str = "gridstore::file";
pub(crate) const CURSOR_TRACING_EVENT_TARGET: &str = "gridstore::cursor";

/// Truncate serialized documents in events to this many bytes.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for bson::oid::ObjectId {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_hex()
    }
}

impl TracingRepresentation for Bson {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        match self {
            Bson::ObjectId(oid) => oid.tracing_representation(),
            Bson::String(s) => s.clone(),
            other => truncate_on_char_boundary(
                other.clone().into_relaxed_extjson().to_string(),
                DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
            ),
        }
    }
}

impl TracingRepresentation for Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        truncate_on_char_boundary(
            Bson::Document(self.clone())
                .into_relaxed_extjson()
                .to_string(),
            DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
        )
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

fn truncate_on_char_boundary(mut s: String, new_len: usize) -> String {
    if s.len() > new_len {
        let mut cut = new_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn truncates_long_documents() {
        let document = doc! { "data": "é".repeat(DEFAULT_MAX_DOCUMENT_LENGTH_BYTES) };
        let representation = document.tracing_representation();
        assert!(representation.ends_with("..."));
        assert!(representation.len() <= DEFAULT_MAX_DOCUMENT_LENGTH_BYTES + 3);
    }

    #[test]
    fn object_ids_render_as_hex() {
        let oid = bson::oid::ObjectId::new();
        assert_eq!(Bson::ObjectId(oid).tracing_representation(), oid.to_hex());
    }
}

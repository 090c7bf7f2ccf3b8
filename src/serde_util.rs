use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_millis() > i32::MAX as u128 => {
            serializer.serialize_i64(duration.as_millis() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_millis() as i32),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn serialize_u32_as_i32<S: Serializer>(
    val: &u32,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    bson::serde_helpers::serialize_u32_as_i32(val, serializer)
}

#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn serialize_u64_as_i64<S: Serializer>(
    val: &u64,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    bson::serde_helpers::serialize_u64_as_i64(val, serializer)
}

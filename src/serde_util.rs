use std::time::Duration;

use serde::Serializer;

use crate::error::Error;

pub(crate) fn serialize_duration_option_as_int_seconds<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => serializer.serialize_i64(duration.as_secs().try_into().unwrap_or(i64::MAX)),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn serialize_error_as_string<S: Serializer>(
    val: &Error,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&val.to_string())
}

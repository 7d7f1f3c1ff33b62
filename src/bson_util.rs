use crate::bson::{Bson, RawBsonRef};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this value is not
/// numeric or the conversion would be lossy, this returns `None`.
pub(crate) fn get_int_raw(val: RawBsonRef<'_>) -> Option<i64> {
    match val {
        RawBsonRef::Int32(i) => get_int(&Bson::Int32(i)),
        RawBsonRef::Int64(i) => get_int(&Bson::Int64(i)),
        RawBsonRef::Double(i) => get_int(&Bson::Double(i)),
        _ => None,
    }
}

/// Materializes a raw document into a `Document`, falling back to an empty document if the
/// bytes are malformed. Only used for monitoring output, where a lossy conversion is
/// preferable to failing the operation.
pub(crate) fn to_document(raw: &crate::bson::RawDocument) -> crate::bson::Document {
    crate::bson::Document::try_from(raw).unwrap_or_default()
}

use std::cmp::Ordering;

use super::value::{TAG_FLOAT, TAG_INT, TAG_TEXT, TAG_UUID};

/// Total order over encoded keys, evaluated directly on the encoded bytes.
///
/// Unequal tags order by tag number. Equal tags compare by payload:
/// numerically for integers and floats, lexicographically for text and
/// UUID payloads, and by the whole encoded byte string for composites.
/// Malformed inputs fall back to raw byte order rather than panicking;
/// keys in the tree were validated when they were encoded.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let (ta, tb) = match (a.first(), b.first()) {
        (Some(&ta), Some(&tb)) => (ta, tb),
        _ => return a.cmp(b),
    };
    if ta != tb {
        return ta.cmp(&tb);
    }
    match ta {
        TAG_INT => match (read_i64(&a[1..]), read_i64(&b[1..])) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.cmp(b),
        },
        TAG_FLOAT => match (read_f64(&a[1..]), read_f64(&b[1..])) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => a.cmp(b),
        },
        TAG_TEXT => text_payload(a).cmp(&text_payload(b)),
        TAG_UUID => a[1..].cmp(&b[1..]),
        _ => a.cmp(b),
    }
}

fn read_i64(data: &[u8]) -> Option<i64> {
    Some(i64::from_be_bytes(data.get(..8)?.try_into().ok()?))
}

fn read_f64(data: &[u8]) -> Option<f64> {
    Some(f64::from_be_bytes(data.get(..8)?.try_into().ok()?))
}

fn text_payload(encoded: &[u8]) -> &[u8] {
    encoded.get(5..).unwrap_or(&[])
}

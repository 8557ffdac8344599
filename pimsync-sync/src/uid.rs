//! UID extraction from local global object ids and remote resource names.
//!
//! A local calendar item carries a hex-encoded global object id. Items that
//! originated from an iCalendar source embed the source `UID` after byte
//! 40 behind a `vCal-Uid` marker; every other item uses the whole global id
//! as its uid.

/// Fixed 16-byte prefix of every global appointment id.
pub const GLOBAL_OBJECT_ID_HEADER: [u8; 16] = [
    0x04, 0x00, 0x00, 0x00, 0x82, 0x00, 0xE0, 0x00, 0x74, 0xC5, 0xB7, 0x10, 0x1A, 0x82, 0xE0, 0x08,
];

const PAYLOAD_OFFSET: usize = 40;
const VCAL_UID_MARKER: &str = "vCal-Uid";

/// Hex string to bytes. Malformed input (odd length, non-hex) yields empty.
pub fn decode_global_id(global_id: &str) -> Vec<u8> {
    hex::decode(global_id).unwrap_or_default()
}

pub fn is_global_appointment_id(candidate: &str) -> bool {
    decode_global_id(candidate).starts_with(&GLOBAL_OBJECT_ID_HEADER)
}

/// UID carried by a global object id, `None` for an empty id.
pub fn extract_uid(global_id: &str) -> Option<String> {
    if global_id.is_empty() {
        return None;
    }
    let bytes = decode_global_id(global_id);
    if bytes.len() > PAYLOAD_OFFSET {
        let payload = String::from_utf8_lossy(&bytes[PAYLOAD_OFFSET..]);
        let marker_len = VCAL_UID_MARKER.len();
        let has_marker = payload
            .get(..marker_len)
            .is_some_and(|head| head.eq_ignore_ascii_case(VCAL_UID_MARKER));
        if has_marker {
            let uid: String = payload[marker_len..]
                .chars()
                .filter(|c| *c != '\u{1}' && *c != '\0')
                .collect();
            if !uid.is_empty() {
                return Some(uid);
            }
        }
    }
    Some(global_id.to_string())
}

/// Percent-decoded file stem of a remote resource address.
///
/// `/calendars/work/a%40b.ics` → `a@b`. Returns `None` when nothing usable
/// remains.
pub fn uid_from_href(href: &str) -> Option<String> {
    let name = href.trim_end_matches('/').rsplit('/').next()?;
    let stem = match name.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => name,
    };
    if stem.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(stem)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| stem.to_string());
    Some(decoded)
}

#[cfg(test)]
pub(crate) fn encode_vcal_global_id(uid: &str) -> String {
    let mut bytes = GLOBAL_OBJECT_ID_HEADER.to_vec();
    bytes.resize(PAYLOAD_OFFSET, 0);
    bytes.extend_from_slice(VCAL_UID_MARKER.as_bytes());
    bytes.extend_from_slice(&[1, 0, 0, 0]);
    bytes.extend_from_slice(uid.as_bytes());
    bytes.push(0);
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn vcal_uid_is_extracted_and_stripped() {
        let gid = encode_vcal_global_id("event-42@example.org");
        assert!(is_global_appointment_id(&gid));
        assert_eq!(extract_uid(&gid).as_deref(), Some("event-42@example.org"));
    }

    #[test]
    fn global_id_without_marker_is_its_own_uid() {
        let mut bytes = GLOBAL_OBJECT_ID_HEADER.to_vec();
        bytes.resize(56, 0xAB);
        let gid = hex::encode_upper(bytes);
        assert_eq!(extract_uid(&gid), Some(gid.clone()));
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("zz00")]
    fn malformed_hex_decodes_to_nothing(#[case] input: &str) {
        assert!(decode_global_id(input).is_empty());
        assert!(!is_global_appointment_id(input));
    }

    #[test]
    fn empty_global_id_has_no_uid() {
        assert_eq!(extract_uid(""), None);
    }

    #[rstest]
    #[case("/cal/work/abc.ics", Some("abc"))]
    #[case("/cal/work/a%40b.example.ics", Some("a@b.example"))]
    #[case("https://dav/cal/noext", Some("noext"))]
    #[case("/cal/work/", Some("work"))]
    #[case("", None)]
    fn href_stems(#[case] href: &str, #[case] expected: Option<&str>) {
        assert_eq!(uid_from_href(href).as_deref(), expected);
    }
}

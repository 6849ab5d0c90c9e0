//! Flat text form of the ledger.
//!
//! One line per slot, six comma-separated fields in fixed order:
//!
//! ```text
//! id,shape,region,tenant,build_number,expiry
//! 1,VM.Standard2.1,PHX-AD-1,,0,
//! 2,VM.Standard2.1,PHX-AD-1,alice,5,2024-01-01T00:00:00Z
//! ```
//!
//! An empty tenant or expiry field means absent; an empty build number reads
//! as 0. Expiry is RFC 3339 in UTC and keeps sub-second precision, which
//! limits it to years 0000 through 9999.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use bytes::Bytes;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};

use crate::{
    slot::{Ledger, Slot, SlotId, Version},
    time::Timestamp,
    Error, Result,
};

const FIELDS: usize = 6;
const SEPARATOR: char = ',';
const EXPIRY_YEARS: RangeInclusive<i32> = 0..=9999;

/// Whether `at` can be written as an expiry and parsed back.
pub fn is_encodable(at: Timestamp) -> bool {
    EXPIRY_YEARS.contains(&at.year())
}

pub fn encode(ledger: &Ledger) -> Result<Bytes> {
    let mut out = String::with_capacity(ledger.len() * 64);
    for slot in ledger.slots() {
        encode_slot(slot, &mut out)?;
    }
    Ok(Bytes::from(out))
}

fn encode_slot(slot: &Slot, out: &mut String) -> Result<()> {
    let shape = checked_field(slot, "shape", slot.shape())?;
    let region = checked_field(slot, "region", slot.region())?;
    let tenant = match slot.tenant() {
        Some("") => {
            return Err(Error::Encode {
                id: slot.id(),
                reason: "held slot has an empty tenant".into(),
            })
        }
        tenant => checked_field(slot, "tenant", tenant.unwrap_or_default())?,
    };
    let expiry = match slot.expiry() {
        None => String::new(),
        Some(at) if is_encodable(at) => at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        Some(at) => {
            return Err(Error::Encode {
                id: slot.id(),
                reason: format!("expiry year {} is outside RFC 3339", at.year()),
            })
        }
    };

    out.push_str(&format!(
        "{},{},{},{},{},{}\n",
        slot.id(),
        shape,
        region,
        tenant,
        slot.build_number(),
        expiry
    ));
    Ok(())
}

fn checked_field<'a>(slot: &Slot, name: &str, value: &'a str) -> Result<&'a str> {
    if value.contains(&[SEPARATOR, '\n', '\r'][..]) {
        return Err(Error::Encode {
            id: slot.id(),
            reason: format!("{name} {value:?} contains a separator"),
        });
    }
    Ok(value)
}

/// Parse stored ledger content. The version must be the one the content was
/// fetched with.
pub fn decode(content: &[u8], version: Version) -> Result<Ledger> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::decode(0, format!("ledger is not UTF-8: {e}")))?;

    let mut slots = Vec::new();
    let mut seen = HashSet::new();
    for (index, raw) in text.split('\n').enumerate() {
        let line_no = index + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }

        let slot = decode_line(line_no, line)?;
        if !seen.insert(slot.id()) {
            return Err(Error::decode(
                line_no,
                format!("duplicate slot id {}", slot.id()),
            ));
        }
        slots.push(slot);
    }

    Ok(Ledger::from_checked(slots, version))
}

fn decode_line(line_no: usize, line: &str) -> Result<Slot> {
    // `split` keeps trailing empty fields, so a vacant slot still has six.
    let parts: Vec<&str> = line.split(SEPARATOR).collect();
    if parts.len() != FIELDS {
        return Err(Error::decode(
            line_no,
            format!("expected {FIELDS} fields, found {}", parts.len()),
        ));
    }

    let id = parts[0]
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::decode(line_no, format!("bad slot id {:?}: {e}", parts[0])))?;

    let tenant = Some(parts[3].to_string());

    let build_number = match parts[4].trim() {
        "" => 0,
        raw => raw
            .parse::<u64>()
            .map_err(|e| Error::decode(line_no, format!("bad build number {raw:?}: {e}")))?,
    };

    let expiry = match parts[5].trim() {
        "" => None,
        raw => Some(parse_expiry(raw).map_err(|e| {
            Error::decode(line_no, format!("bad expiry {raw:?}: {e}"))
        })?),
    };

    Ok(Slot::new(
        SlotId(id),
        parts[1].to_string(),
        parts[2].to_string(),
        tenant,
        build_number,
        expiry,
    ))
}

fn parse_expiry(raw: &str) -> std::result::Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn version() -> Version {
        Version::from("v1")
    }

    #[test]
    fn test_decode_keeps_trailing_empty_fields() {
        let ledger = decode(b"1,VM.Standard2.1,PHX-AD-1,,,\n", version()).unwrap();
        let slot = &ledger.slots()[0];

        assert_eq!(slot.id(), SlotId(1));
        assert_eq!(slot.shape(), "VM.Standard2.1");
        assert_eq!(slot.region(), "PHX-AD-1");
        assert!(slot.is_vacant());
        assert_eq!(slot.build_number(), 0);
        assert_eq!(slot.expiry(), None);
    }

    #[test]
    fn test_decode_held_slot() {
        let content = "2,VM.Standard2.1,PHX-AD-1,alice,5,2024-01-01T00:00:00Z\n";
        let ledger = decode(content.as_bytes(), version()).unwrap();
        let slot = &ledger.slots()[0];

        assert_eq!(slot.tenant(), Some("alice"));
        assert_eq!(slot.build_number(), 5);
        assert_eq!(
            slot.expiry(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_normalizes_offsets_to_utc() {
        let content = "2,VM.Standard2.1,PHX-AD-1,alice,5,2024-01-01T02:00:00+02:00";
        let ledger = decode(content.as_bytes(), version()).unwrap();
        assert_eq!(
            ledger.slots()[0].expiry(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_empty_tenant_reads_as_vacant() {
        let ledger = decode(b"3,VM.Standard2.1,PHX-AD-2,,12,2024-01-01T00:00:00Z", version())
            .unwrap();
        let slot = &ledger.slots()[0];
        assert!(slot.is_vacant());
        assert_eq!(slot.build_number(), 12);
    }

    #[test]
    fn test_decode_preserves_order_and_version() {
        let content = "7,A,R1,,0,\n3,B,R2,,0,\r\n\n5,C,R3,bob,1,\n";
        let ledger = decode(content.as_bytes(), Version::from("etag-9")).unwrap();

        let ids: Vec<u64> = ledger.slots().iter().map(|s| s.id().0).collect();
        assert_eq!(ids, vec![7, 3, 5]);
        assert_eq!(ledger.version().as_str(), "etag-9");
    }

    #[test]
    fn test_decode_empty_object() {
        let ledger = decode(b"", version()).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed_numbers() {
        let err = decode(b"x,A,R1,,0,\n", version()).unwrap_err();
        assert!(matches!(err, Error::Decode { line: 1, .. }));

        let err = decode(b"1,A,R1,,0,\n2,A,R1,bob,nine,\n", version()).unwrap_err();
        assert!(matches!(err, Error::Decode { line: 2, .. }));

        let err = decode(b"1,A,R1,bob,-3,\n", version()).unwrap_err();
        assert!(matches!(err, Error::Decode { line: 1, .. }));
    }

    #[test]
    fn test_decode_rejects_bad_expiry() {
        let err = decode(b"1,A,R1,bob,3,Tue Jan 01 00:00:00 UTC 2024\n", version()).unwrap_err();
        assert!(matches!(err, Error::Decode { line: 1, .. }));
    }

    #[test]
    fn test_decode_rejects_wrong_field_count() {
        assert!(matches!(
            decode(b"1,A,R1,,0\n", version()),
            Err(Error::Decode { line: 1, .. })
        ));
        assert!(matches!(
            decode(b"1,A,R1,,0,,\n", version()),
            Err(Error::Decode { line: 1, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_duplicate_ids() {
        let err = decode(b"1,A,R1,,0,\n1,A,R2,,0,\n", version()).unwrap_err();
        assert!(matches!(err, Error::Decode { line: 2, .. }));
    }

    #[test]
    fn test_decode_rejects_non_utf8() {
        assert!(matches!(
            decode(&[0xff, 0xfe, b','], version()),
            Err(Error::Decode { line: 0, .. })
        ));
    }

    #[test]
    fn test_encode_layout() {
        let expiry = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
        let ledger = Ledger::new(
            vec![
                Slot::vacant(1, "VM.Standard2.1", "PHX-AD-1"),
                Slot::leased(2, "VM.Standard2.1", "PHX-AD-1", "bob", 9, Some(expiry)),
            ],
            version(),
        )
        .unwrap();

        let encoded = encode(&ledger).unwrap();
        assert_eq!(
            &encoded[..],
            b"1,VM.Standard2.1,PHX-AD-1,,0,\n2,VM.Standard2.1,PHX-AD-1,bob,9,2024-06-01T03:00:00Z\n"
        );
    }

    #[test]
    fn test_sub_second_expiry_survives() {
        let expiry = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);
        let ledger = Ledger::new(
            vec![Slot::leased(1, "A", "R", "bob", 1, Some(expiry))],
            version(),
        )
        .unwrap();

        let decoded = decode(&encode(&ledger).unwrap(), version()).unwrap();
        assert_eq!(decoded, ledger);
    }

    #[test]
    fn test_encode_rejects_separators() {
        let ledger = Ledger::new(vec![Slot::leased(4, "A", "R", "bob,eve", 1, None)], version())
            .unwrap();
        assert!(matches!(
            encode(&ledger),
            Err(Error::Encode { id: SlotId(4), .. })
        ));
    }

    #[test]
    fn test_encode_rejects_expiry_past_year_9999() {
        let expiry = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let last = Ledger::new(vec![Slot::leased(1, "A", "R", "bob", 1, Some(expiry))], version())
            .unwrap();
        assert_eq!(decode(&encode(&last).unwrap(), version()).unwrap(), last);

        let beyond = expiry + Duration::seconds(1);
        assert!(!is_encodable(beyond));
        let ledger = Ledger::new(vec![Slot::leased(2, "A", "R", "bob", 1, Some(beyond))], version())
            .unwrap();
        assert!(matches!(
            encode(&ledger),
            Err(Error::Encode { id: SlotId(2), .. })
        ));
    }

    #[test]
    fn test_empty_tenant_round_trips_as_vacant() {
        let ledger = Ledger::new(vec![Slot::leased(1, "A", "R", "", 3, None)], version()).unwrap();

        let decoded = decode(&encode(&ledger).unwrap(), version()).unwrap();
        assert_eq!(decoded, ledger);
        assert!(decoded.slots()[0].is_vacant());
    }

    #[test]
    fn test_encode_rejects_held_slot_with_empty_tenant() {
        let slot: Slot = serde_json::from_str(
            r#"{"id":5,"shape":"A","region":"R","tenant":"","build_number":3,"expiry":null}"#,
        )
        .unwrap();
        let ledger = Ledger::new(vec![slot], version()).unwrap();
        assert!(matches!(
            encode(&ledger),
            Err(Error::Encode { id: SlotId(5), .. })
        ));
    }
}

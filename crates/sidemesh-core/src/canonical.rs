//! Canonical token encoding covered by the token signature.
//!
//! Issuers sign the JSON object `{"id", "claims", "issued_at"}` in exactly
//! that key order, claims in insertion order, rendered with `", "` between
//! items and `": "` between key and value, and with every character outside
//! printable ASCII escaped as `\uXXXX` (UTF-16 surrogate pairs above the
//! BMP). Floats use the shortest round-trip form with a signed, two digit
//! exponent when one is needed (`1e+16`, `1e-05`).
//!
//! Key-sorted or compact JSON would produce different bytes and break every
//! existing signature.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;

use crate::model::{Claims, Token};

#[derive(Serialize)]
struct SigningPayload<'a> {
    id: &'a str,
    claims: &'a Claims,
    issued_at: f64,
}

/// Bytes the token signature is computed over.
pub fn signing_payload(token: &Token) -> serde_json::Result<Vec<u8>> {
    to_canonical_vec(&SigningPayload {
        id: &token.id,
        claims: &token.claims,
        issued_at: token.issued_at,
    })
}

/// Serializes any value with the canonical formatter.
pub fn to_canonical_vec<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedAsciiFormatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// JSON formatter producing the spaced, ASCII-only layout described above.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }

    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(format_float(value).as_bytes())
    }
}

/// Shortest round-trip float text with a sign and at least two exponent digits.
fn format_float(value: f64) -> String {
    let repr = format!("{value:?}");
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => repr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClaimValue;

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn payload_keeps_field_and_claim_order() {
        let token = Token::new("tok-1", 3600, 1_700_000_000.25)
            .with_claim("sub", "svc-a")
            .with_claim("admin", false)
            .with_claim("n", 3i64)
            .with_claim("ratio", 0.5)
            .with_claim("note", ClaimValue::Null)
            .with_claim("name", "Zo\u{eb} \u{1F600}");

        assert_eq!(
            text(signing_payload(&token).unwrap()),
            r#"{"id": "tok-1", "claims": {"sub": "svc-a", "admin": false, "n": 3, "ratio": 0.5, "note": null, "name": "Zo\u00eb \ud83d\ude00"}, "issued_at": 1700000000.25}"#
        );
    }

    #[test]
    fn ttl_and_signature_are_not_signed() {
        let a = Token::new("t", 10, 5.0);
        let b = Token::new("t", 99, 5.0).with_signature(vec![9; 4]);
        assert_eq!(signing_payload(&a).unwrap(), signing_payload(&b).unwrap());
    }

    #[test]
    fn empty_claims_and_whole_float() {
        let token = Token::new("t", 1, 1_700_000_000.0);
        assert_eq!(
            text(signing_payload(&token).unwrap()),
            r#"{"id": "t", "claims": {}, "issued_at": 1700000000.0}"#
        );
    }

    #[test]
    fn exponent_forms() {
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1e-5), "1e-05");
        assert_eq!(format_float(1.5e300), "1.5e+300");
        assert_eq!(format_float(0.0001), "0.0001");
    }

    #[test]
    fn escapes_everything_outside_printable_ascii() {
        let out = text(to_canonical_vec("a\nb\u{1f}\u{7f}").unwrap());
        assert_eq!(out, r#""a\nb\u001f\u007f""#);
    }
}

//! PlayReady license challenge parsing.
//!
//! A PlayReady license request is a SOAP envelope whose content key id is
//! buried inside the challenge rather than carried as a query parameter.
//! Extracting it lets the broker enforce content-key ownership on this
//! protocol too: an authorized-for-one-video caller must not be able to
//! request keys for content ids belonging to videos it cannot view.
//!
//! The KID leaf is located by this exact element path:
//!
//! ```text
//! soap:Envelope / soap:Body
//!   / protocols:AcquireLicense / protocols:challenge
//!   / messages:Challenge / protocols:LA / protocols:ContentHeader
//!   / PlayReadyHeader:WRMHEADER / PlayReadyHeader:DATA / PlayReadyHeader:KID
//! ```
//!
//! The leaf text is base64 for exactly 16 bytes, interpreted in the mixed-
//! endian GUID layout (first three fields little-endian). Ill-formed XML,
//! an unresolved path, or a wrong payload length is a malformed challenge,
//! not an authorization failure.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::NsReader;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use uuid::Uuid;

use crate::{Error, Result};

const SOAP_NS: &[u8] = b"http://schemas.xmlsoap.org/soap/envelope/";
const PROTOCOLS_NS: &[u8] = b"http://schemas.microsoft.com/DRM/2007/03/protocols";
const MESSAGES_NS: &[u8] = b"http://schemas.microsoft.com/DRM/2007/03/protocols/messages";
const HEADER_NS: &[u8] = b"http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader";

/// Namespace-qualified path from the document root to the KID leaf.
const KID_PATH: [(&[u8], &[u8]); 10] = [
    (SOAP_NS, b"Envelope"),
    (SOAP_NS, b"Body"),
    (PROTOCOLS_NS, b"AcquireLicense"),
    (PROTOCOLS_NS, b"challenge"),
    (MESSAGES_NS, b"Challenge"),
    (PROTOCOLS_NS, b"LA"),
    (PROTOCOLS_NS, b"ContentHeader"),
    (HEADER_NS, b"WRMHEADER"),
    (HEADER_NS, b"DATA"),
    (HEADER_NS, b"KID"),
];

/// Extract the content key id from a PlayReady license challenge.
///
/// Returns the GUID in lowercase hyphenated form, matching the ids the
/// catalog stores.
///
/// # Errors
///
/// Returns [`Error::BadChallenge`] if the body is not well-formed XML, the
/// KID path does not resolve, or the payload is not base64 for exactly
/// 16 bytes.
pub fn content_key_id(challenge: &str) -> Result<String> {
    let mut reader = NsReader::from_str(challenge);
    let mut path: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut kid_text: Option<String> = None;

    loop {
        match reader.read_resolved_event() {
            Ok((resolve, Event::Start(start))) => {
                let namespace = match resolve {
                    ResolveResult::Bound(Namespace(ns)) => ns.to_vec(),
                    _ => Vec::new(),
                };
                path.push((namespace, start.local_name().as_ref().to_vec()));
            }
            Ok((_, Event::End(_))) => {
                path.pop();
            }
            Ok((_, Event::Text(text))) => {
                if path_is_kid(&path) {
                    let value = text
                        .unescape()
                        .map_err(|e| Error::BadChallenge(format!("invalid KID text: {e}")))?;
                    kid_text.get_or_insert_default().push_str(&value);
                }
            }
            Ok((_, Event::CData(data))) => {
                if path_is_kid(&path) {
                    let value = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| Error::BadChallenge(format!("invalid KID text: {e}")))?;
                    kid_text.get_or_insert_default().push_str(&value);
                }
            }
            Ok((_, Event::Eof)) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::BadChallenge(format!(
                    "challenge is not well-formed XML: {e}"
                )));
            }
        }
    }

    let text = kid_text
        .ok_or_else(|| Error::BadChallenge("KID element not found in challenge".to_string()))?;

    let decoded = BASE64
        .decode(text.trim())
        .map_err(|e| Error::BadChallenge(format!("KID is not valid base64: {e}")))?;

    let bytes: [u8; 16] = decoded.try_into().map_err(|bytes: Vec<u8>| {
        Error::BadChallenge(format!("KID must decode to 16 bytes, got {}", bytes.len()))
    })?;

    Ok(Uuid::from_bytes_le(bytes).to_string())
}

fn path_is_kid(path: &[(Vec<u8>, Vec<u8>)]) -> bool {
    path.len() == KID_PATH.len()
        && path
            .iter()
            .zip(KID_PATH.iter())
            .all(|((ns, local), (expected_ns, expected_local))| {
                ns == expected_ns && local == expected_local
            })
}

/// A minimal, well-formed challenge around the given KID text.
#[cfg(test)]
pub(crate) fn challenge_with_kid(kid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <AcquireLicense xmlns="http://schemas.microsoft.com/DRM/2007/03/protocols">
      <challenge>
        <Challenge xmlns="http://schemas.microsoft.com/DRM/2007/03/protocols/messages">
          <LA xmlns="http://schemas.microsoft.com/DRM/2007/03/protocols" Id="SignedData" xml:space="preserve">
            <ContentHeader>
              <WRMHEADER xmlns="http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader" version="4.0.0.0">
                <DATA>
                  <KID>{kid}</KID>
                </DATA>
              </WRMHEADER>
            </ContentHeader>
          </LA>
        </Challenge>
      </challenge>
    </AcquireLicense>
  </soap:Body>
</soap:Envelope>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // 16 bytes 00 00 00 10 00 20 00 30 40 50 60 70 80 90 a0 b0: the first
    // three GUID fields are little-endian, the last eight bytes verbatim.
    const KID_B64: &str = "AAAAEAAgADBAUGBwgJCgsA==";
    const KID_GUID: &str = "10000000-2000-3000-4050-60708090a0b0";

    #[test]
    fn extracts_kid_through_the_mixed_endian_guid_layout() {
        let challenge = challenge_with_kid(KID_B64);

        assert_eq!(content_key_id(&challenge).unwrap(), KID_GUID);
    }

    #[test]
    fn guid_layout_matches_from_bytes_le() {
        let bytes = BASE64.decode(KID_B64).unwrap();
        let expected = Uuid::from_bytes_le(bytes.try_into().unwrap()).to_string();

        assert_eq!(expected, KID_GUID);
    }

    #[test]
    fn surrounding_whitespace_in_kid_text_is_tolerated() {
        let challenge = challenge_with_kid(&format!("\n        {KID_B64}\n      "));

        assert_eq!(content_key_id(&challenge).unwrap(), KID_GUID);
    }

    #[test]
    fn malformed_xml_is_rejected() {
        let result = content_key_id("<soap:Envelope><unclosed");

        assert!(matches!(result, Err(Error::BadChallenge(_))));
    }

    #[test]
    fn missing_kid_path_is_rejected() {
        let challenge = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><Other xmlns="urn:other">AAAAEAAgADBAUGBwgJCgsA==</Other></soap:Body>
</soap:Envelope>"#;

        let result = content_key_id(challenge);

        assert!(matches!(result, Err(Error::BadChallenge(_))));
    }

    #[test]
    fn kid_in_the_wrong_namespace_is_rejected() {
        // Same element names, but the WRMHEADER subtree lacks the PlayReady
        // header namespace.
        let challenge = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <AcquireLicense xmlns="http://schemas.microsoft.com/DRM/2007/03/protocols">
      <challenge>
        <Challenge xmlns="http://schemas.microsoft.com/DRM/2007/03/protocols/messages">
          <LA xmlns="http://schemas.microsoft.com/DRM/2007/03/protocols">
            <ContentHeader>
              <WRMHEADER><DATA><KID>AAAAEAAgADBAUGBwgJCgsA==</KID></DATA></WRMHEADER>
            </ContentHeader>
          </LA>
        </Challenge>
      </challenge>
    </AcquireLicense>
  </soap:Body>
</soap:Envelope>"#;

        let result = content_key_id(challenge);

        assert!(matches!(result, Err(Error::BadChallenge(_))));
    }

    #[test]
    fn non_base64_kid_is_rejected() {
        let challenge = challenge_with_kid("not-base64!!!");

        assert!(matches!(
            content_key_id(&challenge),
            Err(Error::BadChallenge(_))
        ));
    }

    #[test]
    fn wrong_payload_length_is_rejected() {
        // "AAAA" decodes to 3 bytes, not 16
        let challenge = challenge_with_kid("AAAA");

        let err = content_key_id(&challenge).unwrap_err();
        assert!(err.to_string().contains("16 bytes"));
    }

    #[test]
    fn empty_kid_is_rejected() {
        let challenge = challenge_with_kid("");

        assert!(matches!(
            content_key_id(&challenge),
            Err(Error::BadChallenge(_))
        ));
    }
}

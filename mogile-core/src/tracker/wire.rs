//! Tracker line protocol encoding and decoding
//!
//! Requests are `<COMMAND> k1=v1&k2=v2\n`, replies are `OK <query>` or
//! `ERR <code> <message>`, one line each.

use std::fmt;

use url::form_urlencoded;

use crate::MogileError;

/// Commands understood by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerCommand {
    GetDomains,
    GetPaths,
    Delete,
    Rename,
    ListKeys,
    CreateOpen,
    CreateClose,
}

impl TrackerCommand {
    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerCommand::GetDomains => "GET_DOMAINS",
            TrackerCommand::GetPaths => "GET_PATHS",
            TrackerCommand::Delete => "DELETE",
            TrackerCommand::Rename => "RENAME",
            TrackerCommand::ListKeys => "LIST_KEYS",
            TrackerCommand::CreateOpen => "CREATE_OPEN",
            TrackerCommand::CreateClose => "CREATE_CLOSE",
        }
    }
}

impl fmt::Display for TrackerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded `OK` reply.
///
/// Keeps the tracker's field order so that positional consumers such as
/// path lookups see replicas in the order the tracker ranked them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerResponse {
    fields: Vec<(String, String)>,
}

impl TrackerResponse {
    /// Creates a response from already decoded pairs.
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let mut response = Self::default();
        for (key, value) in pairs {
            response.insert(key.into(), value.into());
        }
        response
    }

    /// Later duplicates replace the earlier value in place.
    fn insert(&mut self, key: String, value: String) {
        match self.fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns the value of a field the command contract requires.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the field is absent
    pub fn require(&self, key: &str) -> Result<&str, MogileError> {
        self.get(key)
            .ok_or_else(|| MogileError::protocol(format!("missing field '{key}' in tracker reply")))
    }

    /// Returns a required numeric field.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the field is absent or not a number
    pub fn require_u64(&self, key: &str) -> Result<u64, MogileError> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| {
            MogileError::protocol(format!("field '{key}' is not a number: '{raw}'"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.fields
    }
}

/// Form-encodes `key=value` pairs joined by `&`.
pub fn encode_query<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_component(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

fn decode_component(raw: &str) -> Result<String, MogileError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| MogileError::protocol(format!("invalid UTF-8 in reply field '{raw}'")))
}

/// Builds one request line, newline included.
///
/// The domain, when set, is always the first pair. With neither domain nor
/// arguments the line is the bare command.
pub fn encode_request(command: TrackerCommand, domain: Option<&str>, args: &[(&str, &str)]) -> String {
    let pairs = domain
        .map(|domain| ("domain", domain))
        .into_iter()
        .chain(args.iter().copied());
    let query = encode_query(pairs);

    if query.is_empty() {
        format!("{command}\n")
    } else {
        format!("{command} {query}\n")
    }
}

/// Decodes the argument blob of an `OK` reply.
///
/// # Errors
///
/// - `MogileError::Protocol` - If a segment has no `=`, an empty key, or the
///   blob contains whitespace
pub fn decode_query(blob: &str) -> Result<TrackerResponse, MogileError> {
    if blob.chars().any(char::is_whitespace) {
        return Err(MogileError::protocol(format!(
            "malformed reply arguments: '{blob}'"
        )));
    }

    let mut response = TrackerResponse::default();
    for segment in blob.split('&').filter(|segment| !segment.is_empty()) {
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            MogileError::protocol(format!("malformed reply segment '{segment}'"))
        })?;
        if key.is_empty() {
            return Err(MogileError::protocol(format!(
                "empty key in reply segment '{segment}'"
            )));
        }
        response.insert(decode_component(key)?, decode_component(value)?);
    }

    Ok(response)
}

/// Decodes one reply line from the tracker.
///
/// # Errors
///
/// - `MogileError::Remote` - If the tracker answered `ERR ...`
/// - `MogileError::Protocol` - If the line is neither a well-formed `OK`
///   reply nor an `ERR` reply
pub fn decode_response(line: &str) -> Result<TrackerResponse, MogileError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (status, blob) = match line.split_once(' ') {
        Some((status, blob)) => (status, Some(blob)),
        None => (line, None),
    };

    match (status, blob) {
        ("OK", Some(blob)) => decode_query(blob.trim()),
        ("OK", None) => Err(MogileError::protocol(
            "tracker reply 'OK' is missing its argument section",
        )),
        ("ERR", _) => Err(MogileError::Remote {
            message: line.trim().to_string(),
        }),
        _ => Err(MogileError::protocol(format!(
            "unexpected tracker reply: '{}'",
            line.trim()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_encode_request_with_domain_first() {
        let line = encode_request(
            TrackerCommand::GetPaths,
            Some("media"),
            &[("key", "a b/c")],
        );
        assert_eq!(line, "GET_PATHS domain=media&key=a+b%2Fc\n");
    }

    #[test]
    fn test_encode_request_without_arguments() {
        assert_eq!(
            encode_request(TrackerCommand::GetDomains, None, &[]),
            "GET_DOMAINS\n"
        );
        assert_eq!(
            encode_request(TrackerCommand::GetDomains, Some("d"), &[]),
            "GET_DOMAINS domain=d\n"
        );
    }

    #[test]
    fn test_decode_ok_reply() {
        let response =
            decode_response("OK path2=http://b/2&paths=2&path1=http://a/1\r\n").unwrap();
        assert_eq!(response.len(), 3);
        assert_eq!(response.get("paths"), Some("2"));
        let keys: Vec<&str> = response.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["path2", "paths", "path1"]);
    }

    #[test]
    fn test_decode_empty_argument_section() {
        let response = decode_response("OK \r\n").unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn test_decode_missing_argument_section() {
        let result = decode_response("OK\r\n");
        assert!(matches!(result, Err(MogileError::Protocol { .. })));
    }

    #[test]
    fn test_decode_err_reply_is_remote() {
        let result = decode_response("ERR unknown_key unknown_key\r\n");
        assert!(matches!(
            result,
            Err(MogileError::Remote { message }) if message == "ERR unknown_key unknown_key"
        ));
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let result = decode_response("HTTP/1.0 400 Bad Request\r\n");
        assert!(matches!(
            result,
            Err(MogileError::Protocol { message }) if message.contains("HTTP/1.0 400 Bad Request")
        ));
    }

    #[test]
    fn test_decode_malformed_query() {
        assert!(decode_response("OK paths=1&orphan\r\n").is_err());
        assert!(decode_response("OK =value\r\n").is_err());
    }

    #[test]
    fn test_decode_percent_encoding() {
        let response = decode_response("OK key_1=a%2Cb+c&next_after=\r\n").unwrap();
        assert_eq!(response.get("key_1"), Some("a,b c"));
        assert_eq!(response.get("next_after"), Some(""));
    }

    #[test]
    fn test_require_u64() {
        let response = TrackerResponse::from_pairs([("domains", "2"), ("bad", "x")]);
        assert_eq!(response.require_u64("domains").unwrap(), 2);
        assert!(response.require_u64("bad").is_err());
        assert!(response.require_u64("missing").is_err());
    }

    proptest! {
        #[test]
        fn test_query_round_trip(
            pairs in proptest::collection::btree_map("\\PC{1,12}", "\\PC{0,24}", 0..8)
        ) {
            let encoded = encode_query(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            let response = decode_response(&format!("OK {encoded}\r\n")).unwrap();
            let decoded: Vec<(String, String)> = response.into_pairs();
            let expected: Vec<(String, String)> = pairs.into_iter().collect();
            prop_assert_eq!(decoded, expected);
        }
    }
}

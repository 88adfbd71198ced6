use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::vocabulary::Vocabulary;

/// HTTP verbs accepted on the wire.
pub const HTTP_METHODS: Vocabulary = Vocabulary::new(
    "http method",
    &[
        "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "PATCH", "TRACE", "COPY", "LINK",
        "UNLINK", "PURGE", "LOCK", "UNLOCK", "PROPFIND", "VIEW",
    ],
);

// ════════════════════════════════════════════════════════════════
//  HttpMethod
// ════════════════════════════════════════════════════════════════

/// HTTP verb. Any verb can be built in-process, but only verbs from
/// [`HTTP_METHODS`] serialize or deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpMethod(Cow<'static, str>);

impl HttpMethod {
    pub const GET: HttpMethod = HttpMethod(Cow::Borrowed("GET"));
    pub const HEAD: HttpMethod = HttpMethod(Cow::Borrowed("HEAD"));
    pub const POST: HttpMethod = HttpMethod(Cow::Borrowed("POST"));
    pub const PUT: HttpMethod = HttpMethod(Cow::Borrowed("PUT"));
    pub const DELETE: HttpMethod = HttpMethod(Cow::Borrowed("DELETE"));
    pub const OPTIONS: HttpMethod = HttpMethod(Cow::Borrowed("OPTIONS"));
    pub const PATCH: HttpMethod = HttpMethod(Cow::Borrowed("PATCH"));
    pub const TRACE: HttpMethod = HttpMethod(Cow::Borrowed("TRACE"));
    pub const COPY: HttpMethod = HttpMethod(Cow::Borrowed("COPY"));
    pub const LINK: HttpMethod = HttpMethod(Cow::Borrowed("LINK"));
    pub const UNLINK: HttpMethod = HttpMethod(Cow::Borrowed("UNLINK"));
    pub const PURGE: HttpMethod = HttpMethod(Cow::Borrowed("PURGE"));
    pub const LOCK: HttpMethod = HttpMethod(Cow::Borrowed("LOCK"));
    pub const UNLOCK: HttpMethod = HttpMethod(Cow::Borrowed("UNLOCK"));
    pub const PROPFIND: HttpMethod = HttpMethod(Cow::Borrowed("PROPFIND"));
    pub const VIEW: HttpMethod = HttpMethod(Cow::Borrowed("VIEW"));

    /// Arbitrary verb, upper-cased. Serializes only if it is in the table.
    pub fn custom(verb: impl AsRef<str>) -> Self {
        Self(Cow::Owned(verb.as_ref().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for HttpMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let literal = HTTP_METHODS
            .encode(self.as_str())
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(literal)
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let literal = HTTP_METHODS
            .decode(&raw)
            .map_err(serde::de::Error::custom)?;
        Ok(HttpMethod(Cow::Borrowed(literal)))
    }
}

// ════════════════════════════════════════════════════════════════
//  HttpStatus
// ════════════════════════════════════════════════════════════════

/// Status code reported by an HTTP-carried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HttpStatus(u16);

impl HttpStatus {
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    /// 5xx and above; treated as transient by the retry policy.
    pub fn is_server_error(&self) -> bool {
        self.0 >= 500
    }
}

impl std::fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

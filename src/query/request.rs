//! Requests: ad hoc queries, module invocations and module spawns.

use crate::error::{Result, XccError};
use crate::query::options::{EffectiveOptions, RequestOptions};
use crate::types::{XName, XdmValue};
use std::fmt;

/// Longest query text kept in a [`RequestSummary`].
const SUMMARY_BODY_LIMIT: usize = 256;

/// Kind of request, which decides the endpoint and payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Evaluate query text sent with the request
    Adhoc,
    /// Invoke a module stored on the server
    Invoke,
    /// Queue a module for asynchronous evaluation on the server
    Spawn,
}

impl RequestKind {
    /// Endpoint path.
    pub fn path(&self) -> &'static str {
        match self {
            RequestKind::Adhoc => "/eval",
            RequestKind::Invoke => "/invoke",
            RequestKind::Spawn => "/spawn",
        }
    }

    fn payload_key(&self, options: &EffectiveOptions) -> &'static str {
        match self {
            RequestKind::Adhoc => options.query_language.payload_key(),
            RequestKind::Invoke | RequestKind::Spawn => "module",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Adhoc => write!(f, "adhoc"),
            RequestKind::Invoke => write!(f, "invoke"),
            RequestKind::Spawn => write!(f, "spawn"),
        }
    }
}

/// Compact description of a request, attached to server faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub kind: RequestKind,
    /// Query text (truncated) or module URI
    pub body: String,
    /// Names of bound variables
    pub variables: Vec<String>,
}

impl fmt::Display for RequestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} request: {}", self.kind, self.body)?;
        if !self.variables.is_empty() {
            write!(f, " [{}]", self.variables.join(", "))?;
        }
        Ok(())
    }
}

/// A request built by a session.
///
/// Variables are kept in insertion order; rebinding a name replaces its value
/// in place.
#[derive(Debug, Clone)]
pub struct Request {
    session_id: u64,
    kind: RequestKind,
    body: String,
    variables: Vec<(XName, XdmValue)>,
    options: RequestOptions,
    position: u64,
    count: Option<u64>,
}

impl Request {
    pub(crate) fn new(session_id: u64, kind: RequestKind, body: impl Into<String>) -> Self {
        Self {
            session_id,
            kind,
            body: body.into(),
            variables: Vec::new(),
            options: RequestOptions::default(),
            position: 1,
            count: None,
        }
    }

    /// Id of the session that created this request.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Query text for ad hoc requests, module URI otherwise.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Bind an external variable, replacing any earlier binding of the same name.
    pub fn set_variable(&mut self, name: XName, value: impl Into<XdmValue>) -> &mut Self {
        let value = value.into();
        match self.variables.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.variables.push((name, value)),
        }
        self
    }

    /// Bind a string variable in no namespace.
    pub fn set_new_string_variable(&mut self, local: &str, value: impl Into<String>) -> &mut Self {
        self.set_variable(XName::local(local), XdmValue::string(value))
    }

    /// Remove a binding. Returns the removed value.
    pub fn clear_variable(&mut self, name: &XName) -> Option<XdmValue> {
        let pos = self.variables.iter().position(|(n, _)| n == name)?;
        Some(self.variables.remove(pos).1)
    }

    pub fn clear_variables(&mut self) {
        self.variables.clear();
    }

    pub fn variables(&self) -> &[(XName, XdmValue)] {
        &self.variables
    }

    pub fn variable(&self, name: &XName) -> Option<&XdmValue> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: RequestOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// First result item to return, 1-based.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// # Errors
    ///
    /// Returns a usage error if `position` is zero.
    pub fn set_position(&mut self, position: u64) -> Result<&mut Self> {
        if position == 0 {
            return Err(XccError::invalid_argument(
                "position",
                "result positions start at 1",
            ));
        }
        self.position = position;
        Ok(self)
    }

    /// Maximum number of items to return; `None` is unbounded.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn set_count(&mut self, count: Option<u64>) -> &mut Self {
        self.count = count;
        self
    }

    pub fn summary(&self) -> RequestSummary {
        let body = match self.body.char_indices().nth(SUMMARY_BODY_LIMIT) {
            Some((cut, _)) => format!("{}...", &self.body[..cut]),
            None => self.body.clone(),
        };
        RequestSummary {
            kind: self.kind,
            body,
            variables: self.variables.iter().map(|(n, _)| n.to_string()).collect(),
        }
    }

    /// Form fields owned by the request itself. Session-level fields
    /// (contentbase, transaction) are added by the session.
    pub(crate) fn form_fields(&self, options: &EffectiveOptions) -> Vec<(String, String)> {
        let mut fields = vec![(
            self.kind.payload_key(options).to_string(),
            self.body.clone(),
        )];

        for (i, (name, value)) in self.variables.iter().enumerate() {
            fields.push((format!("evn{}", i), name.namespace.clone()));
            fields.push((format!("evl{}", i), name.local.clone()));
            fields.push((format!("evt{}", i), value.value_type().primitive().to_string()));
            fields.push((format!("evv{}", i), value.lexical().into_owned()));
        }

        if self.position != 1 {
            fields.push(("pos".to_string(), self.position.to_string()));
        }
        if let Some(count) = self.count {
            fields.push(("cnt".to_string(), count.to_string()));
        }

        fields.push(("locale".to_string(), options.locale.clone()));
        fields.push((
            "tzoffset".to_string(),
            options.timezone.local_minus_utc().to_string(),
        ));
        if let Some(ts) = options.effective_point_in_time {
            fields.push(("timestamp".to_string(), ts.to_string()));
        }
        if let Some(name) = &options.request_name {
            fields.push(("requestname".to_string(), name.clone()));
        }
        if let Some(version) = &options.default_language_version {
            fields.push(("dflt-version".to_string(), version.clone()));
        }
        if let Some(limit) = options.request_time_limit {
            fields.push(("timelimit".to_string(), limit.to_string()));
        }
        fields
    }
}

/// Encode fields as `application/x-www-form-urlencoded`.
pub(crate) fn encode_form(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::query::options::QueryLanguage;
    use chrono::FixedOffset;

    fn effective() -> EffectiveOptions {
        RequestOptions::new()
            .with_locale("en_US")
            .with_timezone(FixedOffset::east_opt(3600).unwrap())
            .fill_defaults(&DriverConfig::default())
    }

    fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
        fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_rebinding_replaces_in_place() {
        let mut request = Request::new(1, RequestKind::Adhoc, "declare variable $a external; $a");
        request.set_variable(XName::local("a"), 1i64);
        request.set_variable(XName::new("urn:x", "b"), "two");
        request.set_variable(XName::local("a"), "one");

        assert_eq!(request.variables().len(), 2);
        assert_eq!(request.variables()[0].0, XName::local("a"));
        assert_eq!(request.variables()[0].1, XdmValue::string("one"));
        assert_eq!(request.clear_variable(&XName::new("urn:x", "b")), Some(XdmValue::string("two")));
        assert_eq!(request.variables().len(), 1);
    }

    #[test]
    fn test_position_must_be_positive() {
        let mut request = Request::new(1, RequestKind::Adhoc, "1");
        assert!(request.set_position(0).is_err());
        request.set_position(5).unwrap();
        assert_eq!(request.position(), 5);
    }

    #[test]
    fn test_kind_paths() {
        assert_eq!(RequestKind::Adhoc.path(), "/eval");
        assert_eq!(RequestKind::Invoke.path(), "/invoke");
        assert_eq!(RequestKind::Spawn.path(), "/spawn");
    }

    #[test]
    fn test_form_fields() {
        let mut request = Request::new(1, RequestKind::Adhoc, "$x + 1");
        request.set_variable(XName::local("x"), 41i64);
        request.set_position(3).unwrap().set_count(Some(10));

        let fields = request.form_fields(&effective());
        assert_eq!(field(&fields, "xquery"), Some("$x + 1"));
        assert_eq!(field(&fields, "evn0"), Some(""));
        assert_eq!(field(&fields, "evl0"), Some("x"));
        assert_eq!(field(&fields, "evt0"), Some("xs:integer"));
        assert_eq!(field(&fields, "evv0"), Some("41"));
        assert_eq!(field(&fields, "pos"), Some("3"));
        assert_eq!(field(&fields, "cnt"), Some("10"));
        assert_eq!(field(&fields, "tzoffset"), Some("3600"));
        assert_eq!(field(&fields, "timestamp"), None);
    }

    #[test]
    fn test_default_window_not_sent() {
        let request = Request::new(1, RequestKind::Invoke, "/app/main.xqy");
        let fields = request.form_fields(&effective());
        assert_eq!(field(&fields, "module"), Some("/app/main.xqy"));
        assert_eq!(field(&fields, "pos"), None);
        assert_eq!(field(&fields, "cnt"), None);
    }

    #[test]
    fn test_javascript_payload_key() {
        let request = Request::new(1, RequestKind::Adhoc, "1 + 1");
        let mut options = effective();
        options.query_language = QueryLanguage::JavaScript;
        let fields = request.form_fields(&options);
        assert_eq!(field(&fields, "javascript"), Some("1 + 1"));
    }

    #[test]
    fn test_encode_form() {
        let encoded = encode_form(&[
            ("xquery".to_string(), "1 + 1".to_string()),
            ("locale".to_string(), "en_US".to_string()),
        ]);
        assert_eq!(encoded, "xquery=1%20%2B%201&locale=en_US");
    }

    #[test]
    fn test_summary_truncates() {
        let long = "x".repeat(1000);
        let request = Request::new(1, RequestKind::Adhoc, long);
        let summary = request.summary();
        assert!(summary.body.len() < 300);
        assert!(summary.body.ends_with("..."));
    }
}

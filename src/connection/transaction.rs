//! Transaction modes and server-version compatibility.

use crate::error::ConnectionError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// How a session shares server transactions across requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Each request runs in its own transaction; queries or updates detected per request
    #[default]
    Auto,

    /// Read-only multi-statement transaction
    Query,

    /// Multi-statement update transaction, committed explicitly
    Update,

    /// Each request is its own update transaction, committed automatically
    UpdateAutoCommit,
}

impl TransactionMode {
    /// Value of the `txnmode` form field and `TxnMode` cookie.
    pub fn as_wire(&self) -> &'static str {
        match self {
            TransactionMode::Auto => "auto",
            TransactionMode::Query => "query",
            TransactionMode::Update => "update",
            TransactionMode::UpdateAutoCommit => "update-auto-commit",
        }
    }

    /// Parse a wire value. Unknown values yield `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(TransactionMode::Auto),
            "query" => Some(TransactionMode::Query),
            "update" => Some(TransactionMode::Update),
            "update-auto-commit" | "updateautocommit" => Some(TransactionMode::UpdateAutoCommit),
            _ => None,
        }
    }

    /// Whether `commit` and `rollback` are meaningful in this mode.
    pub fn allows_explicit_commit(&self) -> bool {
        !matches!(self, TransactionMode::Auto)
    }

    /// Whether requests in this mode share one multi-statement transaction.
    pub fn is_multi_statement(&self) -> bool {
        matches!(self, TransactionMode::Query | TransactionMode::Update)
    }

    /// Statement that sets this mode on servers without mode cookies.
    pub(crate) fn compatibility_statement(&self) -> Option<&'static str> {
        match self {
            TransactionMode::Query => Some(r#"xdmp:set-transaction-mode("query")"#),
            TransactionMode::Update => Some(r#"xdmp:set-transaction-mode("update")"#),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Structured server version, parsed once from the `Server` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extract the version token from a `Server` header such as
    /// `MarkLogic 10.0-4.2`. Returns the token and the parsed version.
    pub fn from_server_header(header: &str) -> Option<(String, ServerVersion)> {
        let token = header
            .split(|c: char| c.is_whitespace() || c == '/')
            .filter(|t| t.starts_with(|c: char| c.is_ascii_digit()))
            .last()?;
        let version = token.parse().ok()?;
        Some((token.to_string(), version))
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ServerVersion {
    type Err = ConnectionError;

    /// Accepts `7.0.0`, `10.0-4.2`, `11.0-20240101` and similar forms.
    /// Missing components default to zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s
            .trim()
            .split(['.', '-'])
            .filter(|p| !p.is_empty())
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u32>()
            });

        let err = || ConnectionError::ParseError(format!("invalid server version '{}'", s));
        let major = parts.next().ok_or_else(err)?.map_err(|_| err())?;
        let minor = parts.next().transpose().map_err(|_| err())?.unwrap_or(0);
        let patch = parts.next().transpose().map_err(|_| err())?.unwrap_or(0);

        Ok(ServerVersion::new(major, minor, patch))
    }
}

/// Decides whether a server understands transaction-mode cookies.
///
/// Servers that do not are driven in compatible mode, where the session sends
/// an explicit mode-setting statement before the first request of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityPolicy {
    /// Oldest release that accepts mode cookies
    pub min_mode_cookie_version: ServerVersion,

    /// Version-token prefixes of nightly builds that accept mode cookies
    /// regardless of their numeric version
    pub nightly_prefixes: Vec<String>,
}

impl Default for CompatibilityPolicy {
    fn default() -> Self {
        Self {
            min_mode_cookie_version: ServerVersion::new(7, 0, 0),
            nightly_prefixes: Vec::new(),
        }
    }
}

impl CompatibilityPolicy {
    /// Whether the server identified by `token`/`version` needs compatible mode.
    pub fn requires_compatible_mode(&self, token: &str, version: &ServerVersion) -> bool {
        if self.nightly_prefixes.iter().any(|p| token.starts_with(p.as_str())) {
            return false;
        }
        *version < self.min_mode_cookie_version
    }
}

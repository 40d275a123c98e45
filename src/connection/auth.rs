//! Credentials and the `Authorization` header built from them.
//!
//! Passwords never appear in `Debug` or `Display` output and are zeroed when
//! the last copy of the credentials is dropped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::sync::Arc;

/// User name and password for a content source.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: Arc<SecureString>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Arc::new(SecureString::new(password.into())),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        self.password.as_str()
    }

    /// Value of the `Authorization` header for HTTP basic authentication.
    pub(crate) fn basic_authorization(&self) -> String {
        let token = BASE64.encode(format!("{}:{}", self.username, self.password()));
        format!("Basic {}", token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(username: {})", self.username)
    }
}

/// String that zeroes its bytes on drop and never displays its contents.
#[derive(PartialEq, Eq)]
struct SecureString {
    data: String,
}

impl SecureString {
    fn new(data: String) -> Self {
        Self { data }
    }

    fn as_str(&self) -> &str {
        &self.data
    }
}

impl Drop for SecureString {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.data).into_bytes();
        bytes.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&bytes);
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString(<redacted>)")
    }
}

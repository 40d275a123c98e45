//! Sessions: one logical conversation with the server.
//!
//! A [`Session`] builds requests, submits them over connections from its
//! [`ConnectionProvider`], and tracks the server-issued session and
//! transaction cookies. Mutating operations take `&mut self`; a session is
//! used by one task at a time.
//!
//! # Transaction modes
//!
//! | Mode                 | Requests share a transaction | `commit`/`rollback` |
//! |----------------------|------------------------------|---------------------|
//! | `Auto`               | no                           | illegal             |
//! | `Query`              | yes (read-only)              | with active txn     |
//! | `Update`             | yes                          | with active txn     |
//! | `UpdateAutoCommit`   | no                           | with active txn     |
//!
//! Servers older than the [`CompatibilityPolicy`](crate::connection::CompatibilityPolicy)
//! threshold do not understand the `txnmode` field; for them the session opens
//! the transaction with an explicit mode-setting statement first.

use crate::config::DriverConfig;
use crate::connection::auth::Credentials;
use crate::connection::params::Contentbase;
use crate::connection::transaction::{ServerVersion, TransactionMode};
use crate::content::Content;
use crate::error::{ConversionError, Result, ServerException, TransportError, UsageError, XccError};
use crate::query::options::{EffectiveOptions, RequestOptions};
use crate::query::packed;
use crate::query::request::{encode_form, Request, RequestKind, RequestSummary};
use crate::query::results::{release_body, PooledBody, ResultSequence, SequenceHandle};
use crate::transport::channel::ServerConnection;
use crate::transport::http::{
    encode_chunk, read_response_head, BodyReader, HttpRequest, RequestBody, ResponseHead, ACCEPT,
    USER_AGENT,
};
use crate::transport::multipart::{boundary_from_content_type, MultipartReader};
use crate::transport::protocol::{ConnectionProvider, ErrorDisposition};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const COOKIE_SESSION: &str = "SessionID";
const COOKIE_TRANSACTION: &str = "TxnID";
const COOKIE_TRANSACTION_MODE: &str = "TxnMode";

/// Server error code for a rollback without a transaction.
const NO_TRANSACTION: &str = "XDMP-NOTXN";

/// Which transaction fields accompany a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnFields {
    /// Transaction id, mode and time limit as the session state requires
    Full,
    /// Contentbase and session cookie only
    Omit,
}

/// One logical conversation with the server.
pub struct Session {
    id: u64,
    provider: Arc<dyn ConnectionProvider>,
    config: DriverConfig,
    credentials: Credentials,
    contentbase: Option<Contentbase>,
    source_uri: String,
    transaction_mode: TransactionMode,
    transaction_timeout: Option<u32>,
    session_cookie: Option<String>,
    transaction_id: Option<String>,
    default_options: RequestOptions,
    server_version: Option<ServerVersion>,
    compatible_mode: Option<bool>,
    open_sequences: Vec<SequenceHandle>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        provider: Arc<dyn ConnectionProvider>,
        config: DriverConfig,
        credentials: Credentials,
        contentbase: Option<Contentbase>,
        source_uri: String,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, source = %source_uri, "session created");
        Self {
            id,
            provider,
            config,
            credentials,
            contentbase,
            source_uri,
            transaction_mode: TransactionMode::default(),
            transaction_timeout: None,
            session_cookie: None,
            transaction_id: None,
            default_options: RequestOptions::default(),
            server_version: None,
            compatible_mode: None,
            open_sequences: Vec::new(),
            closed: false,
        }
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request evaluating `text` on the server.
    pub fn new_adhoc_query(&self, text: impl Into<String>) -> Request {
        Request::new(self.id, RequestKind::Adhoc, text)
    }

    /// Request invoking the module stored at `uri`.
    pub fn new_module_invoke(&self, uri: impl Into<String>) -> Request {
        Request::new(self.id, RequestKind::Invoke, uri)
    }

    /// Request queueing the module at `uri` for asynchronous evaluation.
    pub fn new_module_spawn(&self, uri: impl Into<String>) -> Request {
        Request::new(self.id, RequestKind::Spawn, uri)
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
    }

    /// Change the transaction mode for subsequent requests.
    ///
    /// # Errors
    ///
    /// Illegal while a transaction is active.
    pub fn set_transaction_mode(&mut self, mode: TransactionMode) -> Result<()> {
        self.check_open()?;
        if mode != self.transaction_mode && self.transaction_id.is_some() {
            return Err(XccError::illegal_state(format!(
                "cannot switch to {} mode while a transaction is active",
                mode
            )));
        }
        self.transaction_mode = mode;
        Ok(())
    }

    /// Forget the transaction cookie and switch to `mode`.
    pub(super) fn reset_transaction(&mut self, mode: TransactionMode) {
        self.transaction_id = None;
        self.transaction_mode = mode;
    }

    /// Transaction time limit in seconds, if set.
    pub fn transaction_timeout(&self) -> Option<u32> {
        self.transaction_timeout
    }

    pub fn set_transaction_timeout(&mut self, seconds: u32) -> Result<()> {
        self.check_open()?;
        self.transaction_timeout = Some(seconds);
        Ok(())
    }

    /// Server-issued session cookie.
    pub fn session_cookie(&self) -> Option<&str> {
        self.session_cookie.as_deref()
    }

    /// Id of the active transaction.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Server version, known after the first response.
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.server_version
    }

    /// Whether the server needs explicit transaction-mode statements. `false`
    /// until the server version is known.
    pub fn is_compatible_mode(&self) -> bool {
        self.compatible_mode.unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn default_request_options(&self) -> &RequestOptions {
        &self.default_options
    }

    /// Options every request of this session starts from.
    pub fn set_default_request_options(&mut self, options: RequestOptions) {
        self.default_options = options;
    }

    pub fn contentbase(&self) -> Option<&Contentbase> {
        self.contentbase.as_ref()
    }

    pub fn user(&self) -> &str {
        self.credentials.username()
    }

    /// Address of the content source, without the password.
    pub fn content_source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Options `request` would be sent with.
    pub fn effective_options(&self, request: &Request) -> EffectiveOptions {
        RequestOptions::merge(&[&self.default_options, request.options()]).fill_defaults(&self.config)
    }

    pub(super) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(UsageError::SessionClosed.into());
        }
        Ok(())
    }

    /// Fails while a streaming sequence of this session still holds a connection.
    pub(super) fn check_no_active_stream(&mut self) -> Result<()> {
        self.open_sequences.retain(SequenceHandle::is_active);
        if !self.open_sequences.is_empty() {
            return Err(XccError::illegal_state(
                "a streaming result sequence of this session is still open; drain or close it first",
            ));
        }
        Ok(())
    }

    /// Submit a request and return its results.
    ///
    /// # Errors
    ///
    /// - `UsageError::ForeignRequest` if another session built the request
    /// - illegal state while a streaming sequence of this session is open
    /// - `XccError::Server` for a server-side fault
    pub async fn submit_request(&mut self, request: &Request) -> Result<ResultSequence> {
        self.check_open()?;
        if request.session_id() != self.id {
            return Err(UsageError::ForeignRequest.into());
        }
        self.check_no_active_stream()?;

        let options = self.effective_options(request);
        self.establish_transaction(&options).await?;
        self.run(request, &options, TxnFields::Full).await
    }

    /// Commit the active transaction.
    ///
    /// # Errors
    ///
    /// Illegal in `Auto` mode and when no transaction is active.
    pub async fn commit(&mut self) -> Result<()> {
        self.end_transaction("xdmp:commit()").await
    }

    /// Roll back the active transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.end_transaction("xdmp:rollback()").await
    }

    async fn end_transaction(&mut self, statement: &'static str) -> Result<()> {
        self.check_open()?;
        if !self.transaction_mode.allows_explicit_commit() {
            return Err(XccError::illegal_state(format!(
                "{} is not allowed in {} transaction mode",
                statement, self.transaction_mode
            )));
        }
        if self.transaction_id.is_none() {
            return Err(XccError::illegal_state("no active transaction"));
        }
        self.finish_transaction(statement).await
    }

    async fn finish_transaction(&mut self, statement: &'static str) -> Result<()> {
        self.check_no_active_stream()?;
        let request = self.new_adhoc_query(statement);
        let result = self.run_cached(&request, TxnFields::Full).await;
        match &result {
            Ok(_) => self.transaction_id = None,
            Err(e) if e.server_code() == Some(NO_TRANSACTION) => self.transaction_id = None,
            Err(_) => {}
        }
        result.map(|seq| seq.close())
    }

    /// Round trip to the server outside any transaction. Also learns the
    /// server version.
    pub async fn ping(&mut self) -> Result<()> {
        self.check_open()?;
        self.check_no_active_stream()?;
        let request = self.new_adhoc_query("()");
        self.run_cached(&request, TxnFields::Omit).await?.close();
        Ok(())
    }

    /// Current server timestamp, usable as an effective point in time.
    pub async fn current_server_point_in_time(&mut self) -> Result<u64> {
        let mut request = self.new_adhoc_query("xdmp:request-timestamp()");
        request.set_options(RequestOptions::new().with_cache_result(true));
        let results = self.submit_request(&request).await?;
        let item = results.next().await?;
        results.close();

        let text = match item {
            Some(item) => item.as_string().await?,
            None => String::new(),
        };
        let parsed = text.trim().parse::<u64>();
        parsed.map_err(|_| {
            ConversionError::InvalidLexical {
                type_name: "xs:unsignedLong".to_string(),
                value: text,
            }
            .into()
        })
    }

    /// Close the session. Rolls back an open transaction and closes every
    /// streaming sequence still open. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        for handle in self.open_sequences.drain(..) {
            handle.close();
        }
        if self.transaction_id.is_some() {
            match self.finish_transaction("xdmp:rollback()").await {
                Ok(()) => tracing::debug!(session = self.id, "rolled back open transaction"),
                Err(e) if e.server_code() == Some(NO_TRANSACTION) => {
                    tracing::debug!(session = self.id, "transaction already ended on the server")
                }
                Err(e) => {
                    tracing::warn!(session = self.id, error = %e, "rollback on session close failed")
                }
            }
            self.transaction_id = None;
        }
        self.closed = true;
        tracing::debug!(session = self.id, "session closed");
    }

    async fn run_cached(&mut self, request: &Request, txn: TxnFields) -> Result<ResultSequence> {
        let mut options = self.effective_options(request);
        options.cache_result = true;
        self.run(request, &options, txn).await
    }

    /// Learn the server version with a ping if it is not known yet.
    async fn ensure_compatible_mode(&mut self) -> Result<bool> {
        if self.compatible_mode.is_none() {
            self.ping().await?;
        }
        Ok(self.is_compatible_mode())
    }

    /// On servers without mode cookies, open the transaction with an explicit
    /// mode-setting statement.
    pub(super) async fn establish_transaction(&mut self, options: &EffectiveOptions) -> Result<()> {
        if self.transaction_id.is_some() {
            return Ok(());
        }
        let statement = match self.transaction_mode.compatibility_statement() {
            Some(statement) => statement,
            None => return Ok(()),
        };
        if !self.ensure_compatible_mode().await? {
            return Ok(());
        }

        tracing::debug!(
            session = self.id,
            mode = %self.transaction_mode,
            "opening transaction with an explicit mode statement"
        );
        let request = self.new_adhoc_query(statement);
        let mut options = options.clone();
        options.cache_result = true;
        self.run(&request, &options, TxnFields::Omit).await?.close();
        Ok(())
    }

    async fn run(
        &mut self,
        request: &Request,
        options: &EffectiveOptions,
        txn: TxnFields,
    ) -> Result<ResultSequence> {
        let summary = request.summary();
        let mut fields = request.form_fields(options);
        self.append_session_fields(&mut fields, txn);

        let http = self
            .http_request(request.kind().path().to_string(), txn)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(RequestBody::Fixed(encode_form(&fields).into_bytes()));

        tracing::debug!(session = self.id, kind = %request.kind(), "submitting request");
        let (head, conn) = self.exchange(&http, options).await?;
        self.read_response(head, conn, summary, options).await
    }

    fn append_session_fields(&self, fields: &mut Vec<(String, String)>, txn: TxnFields) {
        if let Some(contentbase) = &self.contentbase {
            let (key, value) = contentbase.form_field();
            fields.push((key.to_string(), value));
        }
        if txn == TxnFields::Omit {
            return;
        }
        if let Some(id) = &self.transaction_id {
            fields.push(("txnid".to_string(), id.clone()));
        }
        let send_mode = self.transaction_mode != TransactionMode::Auto
            && (!self.is_compatible_mode() || self.transaction_id.is_some());
        if send_mode {
            fields.push(("txnmode".to_string(), self.transaction_mode.as_wire().to_string()));
            if let Some(limit) = self.transaction_timeout {
                fields.push(("txntimelimit".to_string(), limit.to_string()));
            }
        }
    }

    fn http_request(&self, target: String, txn: TxnFields) -> HttpRequest {
        let mut http = HttpRequest::post(target)
            .header("User-Agent", USER_AGENT)
            .header("Authorization", self.credentials.basic_authorization())
            .header("Accept", ACCEPT);

        let mut cookies = Vec::new();
        if let Some(session) = &self.session_cookie {
            cookies.push(format!("{}={}", COOKIE_SESSION, session));
        }
        if txn == TxnFields::Full {
            if let Some(id) = &self.transaction_id {
                cookies.push(format!("{}={}", COOKIE_TRANSACTION, id));
            }
        }
        if !cookies.is_empty() {
            http = http.header("Cookie", cookies.join("; "));
        }
        http
    }

    /// Send a request and read the response head, obtaining a fresh
    /// connection whenever the provider classifies a failure as retryable.
    async fn exchange(
        &mut self,
        http: &HttpRequest,
        options: &EffectiveOptions,
    ) -> Result<(ResponseHead, ServerConnection)> {
        let bytes = http.encode(&self.provider.address());
        let mut retries = 0;
        loop {
            let mut conn = self.provider.obtain_connection().await?;
            let outcome: Result<ResponseHead> = async {
                conn.send(&bytes).await.map_err(TransportError::from)?;
                read_head(&mut conn, options.read_timeout).await
            }
            .await;

            match outcome {
                Ok(head) => {
                    self.adopt_response_head(&head, &mut conn);
                    return Ok((head, conn));
                }
                Err(err) => {
                    let disposition = self.provider.return_error_connection(conn, &err);
                    if disposition == ErrorDisposition::Retry && retries < options.max_auto_retry {
                        retries += 1;
                        tracing::debug!(
                            session = self.id,
                            attempt = retries,
                            error = %err,
                            "resending request on a fresh connection"
                        );
                        if !options.auto_retry_delay.is_zero() {
                            tokio::time::sleep(options.auto_retry_delay).await;
                        }
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Adopt cookies, server version and connection hints from a response.
    fn adopt_response_head(&mut self, head: &ResponseHead, conn: &mut ServerConnection) {
        for cookie in head.set_cookies() {
            match cookie.name.as_str() {
                COOKIE_SESSION => {
                    self.session_cookie = (!cookie.is_expired()).then(|| cookie.value.clone());
                }
                COOKIE_TRANSACTION => {
                    let id = (!cookie.is_expired()).then(|| cookie.value.clone());
                    if id != self.transaction_id {
                        tracing::trace!(session = self.id, transaction = ?id, "transaction cookie changed");
                    }
                    self.transaction_id = id;
                }
                COOKIE_TRANSACTION_MODE if !cookie.is_expired() => {
                    if let Some(mode) = TransactionMode::from_wire(&cookie.value) {
                        self.transaction_mode = mode;
                    }
                }
                _ => {}
            }
        }

        if self.server_version.is_none() {
            if let Some((token, version)) = head.server().and_then(ServerVersion::from_server_header) {
                let compatible = self
                    .config
                    .compatibility
                    .requires_compatible_mode(&token, &version);
                tracing::debug!(
                    session = self.id,
                    version = %version,
                    compatible_mode = compatible,
                    "learned server version"
                );
                self.server_version = Some(version);
                self.compatible_mode = Some(compatible);
            }
        }

        conn.set_keep_alive_hint(head.keep_alive_timeout());
        if head.connection_close() {
            conn.request_close();
        }
    }

    fn response_error(&self, head: &ResponseHead, body: &[u8], summary: RequestSummary) -> XccError {
        if head.status == 401 {
            return XccError::Permission {
                message: format!(
                    "{} {}: user '{}' was not authenticated",
                    head.status,
                    head.reason,
                    self.credentials.username()
                ),
                retry_advised: false,
            };
        }
        ServerException::from_response(head.status, &head.reason, body)
            .with_request(summary)
            .into()
    }

    async fn read_response(
        &mut self,
        head: ResponseHead,
        conn: ServerConnection,
        summary: RequestSummary,
        options: &EffectiveOptions,
    ) -> Result<ResultSequence> {
        let mut body = BodyReader::new(conn, head.framing());

        if !head.is_success() {
            let bytes = read_body(&mut body, options.read_timeout).await?;
            release_body(body, self.provider.as_ref());
            tracing::debug!(session = self.id, status = head.status, "request failed");
            return Err(self.response_error(&head, &bytes, summary));
        }

        let content_type = head.content_type().unwrap_or_default().to_string();
        if let Some(boundary) = boundary_from_content_type(&content_type) {
            let reader =
                MultipartReader::with_fill_size(body, &boundary, options.result_buffer_size);
            let source = Box::new(PooledBody::new(reader, self.provider.clone()));
            if options.cache_result {
                return ResultSequence::read_cached(source, Some(summary), options.read_timeout).await;
            }
            let sequence = ResultSequence::streaming(source, Some(summary), options.read_timeout);
            self.open_sequences.push(sequence.handle());
            return Ok(sequence);
        }

        let bytes = read_body(&mut body, options.read_timeout).await?;
        let total = body.bytes_read();
        release_body(body, self.provider.as_ref());

        if packed::is_packed(Some(&content_type)) {
            let items = packed::decode(&bytes)?;
            return Ok(ResultSequence::from_packed(items, Some(summary), total));
        }
        if bytes.is_empty() {
            return Ok(ResultSequence::empty());
        }
        Err(TransportError::InvalidResponse(format!(
            "unexpected response content type '{}'",
            content_type
        ))
        .into())
    }

    /// Send one document to the insert endpoint.
    pub(super) async fn send_content(
        &mut self,
        content: &mut dyn Content,
        options: &EffectiveOptions,
    ) -> Result<()> {
        let mut fields: Vec<(String, String)> = content
            .options()
            .query_params(content.uri())
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.append_session_fields(&mut fields, TxnFields::Full);

        let size = content.size();
        let http = self
            .http_request(format!("/insert?{}", encode_form(&fields)), TxnFields::Full)
            .header("Content-Type", "application/octet-stream")
            .body(match size {
                Some(len) => RequestBody::Sized(len),
                None => RequestBody::Chunked,
            });
        let head_bytes = http.encode(&self.provider.address());

        tracing::trace!(session = self.id, uri = content.uri(), ?size, "inserting content");
        let mut conn = self.provider.obtain_connection().await?;
        let outcome: Result<ResponseHead> = async {
            conn.send(&head_bytes).await.map_err(TransportError::from)?;
            write_content_body(&mut conn, content, size).await?;
            read_head(&mut conn, options.read_timeout).await
        }
        .await;

        let head = match outcome {
            Ok(head) => head,
            Err(err) => {
                self.provider.return_error_connection(conn, &err);
                return Err(err);
            }
        };
        self.adopt_response_head(&head, &mut conn);

        let mut body = BodyReader::new(conn, head.framing());
        let bytes = read_body(&mut body, options.read_timeout).await?;
        release_body(body, self.provider.as_ref());
        if !head.is_success() {
            let summary = RequestSummary {
                kind: RequestKind::Adhoc,
                body: format!("insert {}", content.uri()),
                variables: Vec::new(),
            };
            return Err(self.response_error(&head, &bytes, summary));
        }
        Ok(())
    }
}

async fn read_head(conn: &mut ServerConnection, read_timeout: Option<Duration>) -> Result<ResponseHead> {
    let head = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, read_response_head(conn))
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })??,
        None => read_response_head(conn).await?,
    };
    Ok(head)
}

async fn read_body(
    body: &mut BodyReader<ServerConnection>,
    read_timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match read_timeout {
        Some(limit) => {
            tokio::time::timeout(limit, body.read_to_end(&mut bytes))
                .await
                .map_err(|_| TransportError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })?
                .map_err(TransportError::from)?;
        }
        None => {
            body.read_to_end(&mut bytes)
                .await
                .map_err(TransportError::from)?;
        }
    }
    Ok(bytes)
}

/// Stream a content body, chunk-framed when its size is unknown.
async fn write_content_body(
    conn: &mut ServerConnection,
    content: &mut dyn Content,
    size: Option<u64>,
) -> Result<()> {
    let mut written = 0u64;
    while let Some(chunk) = content.read_chunk().await? {
        if chunk.is_empty() {
            continue;
        }
        written += chunk.len() as u64;
        if size.is_some_and(|len| written > len) {
            break;
        }
        let framed = match size {
            Some(_) => chunk,
            None => encode_chunk(&chunk),
        };
        conn.send(&framed).await.map_err(TransportError::from)?;
    }

    match size {
        Some(len) if written != len => {
            conn.request_close();
            Err(XccError::invalid_argument(
                "content",
                format!(
                    "'{}' declared {} bytes but produced {}",
                    content.uri(),
                    len,
                    written
                ),
            ))
        }
        Some(_) => Ok(()),
        None => {
            conn.send(&encode_chunk(&[])).await.map_err(TransportError::from)?;
            Ok(())
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("source", &self.source_uri)
            .field("user", &self.credentials.username())
            .field("contentbase", &self.contentbase)
            .field("transaction_mode", &self.transaction_mode)
            .field("transaction_id", &self.transaction_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for handle in self.open_sequences.drain(..) {
            handle.close();
        }
        if self.transaction_id.is_some() {
            tracing::warn!(
                session = self.id,
                "session dropped with an open transaction; the server will time it out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transaction::CompatibilityPolicy;
    use crate::error::ConnectionError;
    use crate::transport::channel::ByteChannel;
    use crate::transport::pool::PoolKey;
    use crate::transport::protocol::mock::MockProvider;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    const ONE_STRING: &str = "HTTP/1.1 200 OK\r\n\
Server: MarkLogic 11.0.3\r\n\
Set-Cookie: SessionID=abc123; Path=/\r\n\
Content-Type: multipart/mixed; boundary=B\r\n\
Content-Length: 42\r\n\r\n\
--B\r\nX-Primitive: xs:string\r\n\r\nhi\r\n--B--\r\n";

    fn session_with(provider: MockProvider) -> Session {
        Session::new(
            Arc::new(provider),
            DriverConfig::default().with_auto_retry_delay(Duration::ZERO),
            Credentials::new("admin", "admin"),
            Some(Contentbase::Name("Documents".to_string())),
            "xcc://admin@localhost:8000/Documents".to_string(),
        )
    }

    fn idle_provider() -> MockProvider {
        let mut provider = MockProvider::new();
        provider.expect_address().returning(|| "localhost:8000".to_string());
        provider
    }

    /// Connections to a local listener. The listener drops the first
    /// `dropped` connections and answers the rest with `response`.
    async fn connections(count: usize, dropped: usize, response: &'static str) -> Vec<ServerConnection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for i in 0..count {
                let (mut socket, _) = listener.accept().await.unwrap();
                if i < dropped {
                    drop(socket);
                    continue;
                }
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    socket.write_all(response.as_bytes()).await.unwrap();
                    let _ = socket.read(&mut buf).await;
                });
            }
        });

        let mut conns = Vec::new();
        for _ in 0..count {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            conns.push(ServerConnection::new(
                PoolKey::new("127.0.0.1", port, None),
                ByteChannel::Plain(stream),
                Instant::now() + Duration::from_secs(60),
            ));
        }
        conns
    }

    fn serve(provider: &mut MockProvider, conns: Vec<ServerConnection>) {
        let queue = Mutex::new(VecDeque::from(conns));
        provider
            .expect_obtain_connection()
            .returning(move || Ok(queue.lock().unwrap().pop_front().expect("no connection left")));
    }

    #[tokio::test]
    async fn test_retry_disposition_resends() {
        let conns = connections(2, 1, ONE_STRING).await;
        let mut provider = idle_provider();
        serve(&mut provider, conns);
        provider
            .expect_return_error_connection()
            .times(1)
            .returning(|_, _| ErrorDisposition::Retry);
        provider.expect_return_connection().times(1).return_const(());

        let mut session = session_with(provider);
        let request = session.new_adhoc_query("'hi'");
        let results = session.submit_request(&request).await.unwrap();
        assert_eq!(results.size(), 1);
        assert_eq!(results.as_strings().await.unwrap(), vec!["hi"]);
        assert_eq!(session.session_cookie(), Some("abc123"));
        assert_eq!(session.server_version(), Some(ServerVersion::new(11, 0, 3)));
        assert!(!session.is_compatible_mode());
    }

    #[tokio::test]
    async fn test_fail_disposition_is_not_retried() {
        let conns = connections(1, 1, ONE_STRING).await;
        let mut provider = idle_provider();
        serve(&mut provider, conns);
        provider
            .expect_return_error_connection()
            .times(1)
            .returning(|_, _| ErrorDisposition::Fail);

        let mut session = session_with(provider);
        let request = session.new_adhoc_query("1");
        let err = session.submit_request(&request).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let mut provider = idle_provider();
        serve(&mut provider, connections(3, 3, ONE_STRING).await);
        provider
            .expect_return_error_connection()
            .times(3)
            .returning(|_, _| ErrorDisposition::Retry);

        let mut session = session_with(provider);
        let mut request = session.new_adhoc_query("1");
        request.set_options(RequestOptions::new().with_max_auto_retry(2));
        assert!(session.submit_request(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let mut provider = idle_provider();
        provider.expect_obtain_connection().times(1).returning(|| {
            Err(ConnectionError::ConnectionFailed {
                host: "localhost".to_string(),
                port: 8000,
                message: "refused".to_string(),
            }
            .into())
        });

        let mut session = session_with(provider);
        let request = session.new_adhoc_query("1");
        let err = session.submit_request(&request).await.unwrap_err();
        assert!(matches!(err, XccError::Connection(_)));
    }

    #[tokio::test]
    async fn test_foreign_request_rejected() {
        let mut first = session_with(idle_provider());
        let second = session_with(idle_provider());
        let request = second.new_adhoc_query("1");
        assert!(matches!(
            first.submit_request(&request).await,
            Err(XccError::Usage(UsageError::ForeignRequest))
        ));
    }

    #[tokio::test]
    async fn test_closed_session_fails_fast() {
        let mut session = session_with(idle_provider());
        session.close().await;
        session.close().await;
        assert!(session.is_closed());

        let request = session.new_adhoc_query("1");
        assert!(matches!(
            session.submit_request(&request).await,
            Err(XccError::Usage(UsageError::SessionClosed))
        ));
        assert!(session.set_transaction_mode(TransactionMode::Update).is_err());
    }

    #[tokio::test]
    async fn test_commit_rules() {
        let mut session = session_with(idle_provider());
        assert!(matches!(
            session.commit().await,
            Err(XccError::Usage(UsageError::IllegalState(_)))
        ));

        session.set_transaction_mode(TransactionMode::Update).unwrap();
        assert!(matches!(
            session.commit().await,
            Err(XccError::Usage(UsageError::IllegalState(_)))
        ));
        assert!(matches!(
            session.rollback().await,
            Err(XccError::Usage(UsageError::IllegalState(_)))
        ));
    }

    #[test]
    fn test_mode_change_blocked_by_open_transaction() {
        let mut session = session_with(idle_provider());
        session.set_transaction_mode(TransactionMode::Update).unwrap();
        session.transaction_id = Some("42".to_string());

        assert!(session.set_transaction_mode(TransactionMode::Query).is_err());
        assert!(session.set_transaction_mode(TransactionMode::Update).is_ok());
        session.transaction_id = None;
        assert!(session.set_transaction_mode(TransactionMode::Auto).is_ok());
    }

    fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
        fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_session_fields() {
        let mut session = session_with(idle_provider());
        let mut fields = Vec::new();
        session.append_session_fields(&mut fields, TxnFields::Full);
        assert_eq!(field(&fields, "dbname"), Some("Documents"));
        assert_eq!(field(&fields, "txnmode"), None);

        session.set_transaction_mode(TransactionMode::Update).unwrap();
        session.set_transaction_timeout(30).unwrap();
        let mut fields = Vec::new();
        session.append_session_fields(&mut fields, TxnFields::Full);
        assert_eq!(field(&fields, "txnmode"), Some("update"));
        assert_eq!(field(&fields, "txntimelimit"), Some("30"));
        assert_eq!(field(&fields, "txnid"), None);

        session.compatible_mode = Some(true);
        let mut fields = Vec::new();
        session.append_session_fields(&mut fields, TxnFields::Full);
        assert_eq!(field(&fields, "txnmode"), None);

        session.transaction_id = Some("7".to_string());
        let mut fields = Vec::new();
        session.append_session_fields(&mut fields, TxnFields::Full);
        assert_eq!(field(&fields, "txnid"), Some("7"));
        assert_eq!(field(&fields, "txnmode"), Some("update"));

        let mut fields = Vec::new();
        session.append_session_fields(&mut fields, TxnFields::Omit);
        assert_eq!(field(&fields, "txnid"), None);
        session.transaction_id = None;
    }

    #[test]
    fn test_cookie_adoption() {
        let mut session = session_with(idle_provider());
        let head = ResponseHead {
            status: 200,
            reason: "OK".to_string(),
            headers: vec![
                ("Set-Cookie".to_string(), "SessionID=s1".to_string()),
                ("Set-Cookie".to_string(), "TxnID=t9".to_string()),
                ("Set-Cookie".to_string(), "TxnMode=query".to_string()),
                ("Server".to_string(), "MarkLogic 6.0-2".to_string()),
            ],
        };
        let head_cleared = ResponseHead {
            status: 200,
            reason: "OK".to_string(),
            headers: vec![("Set-Cookie".to_string(), "TxnID=; Max-Age=0".to_string())],
        };

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut conn = connections(1, 0, ONE_STRING).await.remove(0);
            session.adopt_response_head(&head, &mut conn);
            assert_eq!(session.session_cookie(), Some("s1"));
            assert_eq!(session.transaction_id(), Some("t9"));
            assert_eq!(session.transaction_mode(), TransactionMode::Query);
            assert_eq!(session.server_version(), Some(ServerVersion::new(6, 0, 2)));
            assert!(session.is_compatible_mode());

            session.adopt_response_head(&head_cleared, &mut conn);
            assert_eq!(session.transaction_id(), None);
        });
    }

    #[test]
    fn test_compatibility_threshold_is_configurable() {
        let policy = CompatibilityPolicy {
            min_mode_cookie_version: ServerVersion::new(5, 0, 0),
            nightly_prefixes: Vec::new(),
        };
        let mut session = session_with(idle_provider());
        session.config = session.config.clone().with_compatibility(policy);
        let head = ResponseHead {
            status: 200,
            reason: "OK".to_string(),
            headers: vec![("Server".to_string(), "MarkLogic 6.0-2".to_string())],
        };

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut conn = connections(1, 0, ONE_STRING).await.remove(0);
            session.adopt_response_head(&head, &mut conn);
        });
        assert!(!session.is_compatible_mode());
    }

    #[test]
    fn test_permission_error_for_401() {
        let session = session_with(idle_provider());
        let head = ResponseHead {
            status: 401,
            reason: "Unauthorized".to_string(),
            headers: Vec::new(),
        };
        let summary = session.new_adhoc_query("1").summary();
        let err = session.response_error(&head, b"", summary);
        assert!(matches!(err, XccError::Permission { retry_advised: false, .. }));
        assert!(!err.to_string().contains("admin:admin"));
    }
}

//! Result sequences and items.
//!
//! A [`ResultSequence`] is either cached, with every item read before the
//! sequence is returned, or streaming, reading one multipart part per
//! [`ResultSequence::next`] call. Streaming sequences hold a server connection
//! until they are drained or closed.
//!
//! Handles are cheap to clone; clones share the cursor.

use crate::error::{ConversionError, Result, ServerException, TransportError, UsageError, XccError};
use crate::query::packed::{self, PackedItem};
use crate::query::request::RequestSummary;
use crate::transport::channel::ServerConnection;
use crate::transport::http::BodyReader;
use crate::transport::multipart::{MultipartReader, PartHeaders};
use crate::transport::protocol::ConnectionProvider;
use crate::types::{ValueType, XdmNode, XdmValue};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Part header naming the item's primitive type.
pub const HEADER_PRIMITIVE: &str = "X-Primitive";
/// Part header carrying the document URI of a node item.
pub const HEADER_URI: &str = "X-URI";
/// Part header carrying the path of a node item within its document.
pub const HEADER_PATH: &str = "X-Path";
/// Part header flagging an error part.
pub const HEADER_ERROR: &str = "X-Error";

/// Result channels. Only the primary channel carries items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultChannelName {
    Primary,
    Secondary,
}

/// Source of multipart parts behind a result sequence.
#[async_trait]
pub(crate) trait PartSource: Send {
    async fn next_part(&mut self) -> std::result::Result<Option<PartHeaders>, TransportError>;

    async fn read_body_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, TransportError>;

    fn bytes_read(&self) -> u64;

    /// Consume any remaining input and release the underlying connection.
    async fn finish(self: Box<Self>);
}

/// Response body read from a pooled connection.
pub(crate) struct PooledBody {
    reader: MultipartReader<BodyReader<ServerConnection>>,
    provider: Arc<dyn ConnectionProvider>,
}

impl PooledBody {
    pub(crate) fn new(
        reader: MultipartReader<BodyReader<ServerConnection>>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self { reader, provider }
    }
}

/// Return the connection under a fully read body to its pool, or drop it.
pub(crate) fn release_body(body: BodyReader<ServerConnection>, provider: &dyn ConnectionProvider) {
    if body.is_reusable() {
        provider.return_connection(body.into_inner());
    } else {
        tracing::debug!(
            connection = body.get_ref().id(),
            "discarding connection with unread or connection-delimited body"
        );
    }
}

#[async_trait]
impl PartSource for PooledBody {
    async fn next_part(&mut self) -> std::result::Result<Option<PartHeaders>, TransportError> {
        self.reader.next_part().await
    }

    async fn read_body_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, TransportError> {
        self.reader.read_body_chunk().await
    }

    fn bytes_read(&self) -> u64 {
        self.reader.bytes_read()
    }

    async fn finish(self: Box<Self>) {
        let PooledBody {
            mut reader,
            provider,
        } = *self;
        if let Err(e) = reader.drain().await {
            tracing::debug!(error = %e, "failed to drain result body");
            return;
        }
        release_body(reader.into_inner(), provider.as_ref());
    }
}

#[derive(Debug)]
enum ItemBody {
    Ready(Vec<u8>),
    Pending,
    Consumed,
}

struct ItemInner {
    index: usize,
    value_type: ValueType,
    uri: Option<String>,
    path: Option<String>,
    body: Mutex<ItemBody>,
    /// Set for items of streaming sequences
    owner: Option<Weak<SequenceShared>>,
}

/// One item of a result sequence.
#[derive(Clone)]
pub struct ResultItem {
    inner: Arc<ItemInner>,
}

/// Body of an item read piece by piece.
pub struct ItemStream {
    source: ItemSource,
}

enum ItemSource {
    Buffered(Option<Vec<u8>>),
    Live {
        core: OwnedMutexGuard<StreamCore>,
        owner: Weak<SequenceShared>,
        done: bool,
    },
}

impl ItemStream {
    /// Next piece of the body, `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.source {
            ItemSource::Buffered(data) => Ok(data.take().filter(|d| !d.is_empty())),
            ItemSource::Live { core, owner, done } => {
                if *done {
                    return Ok(None);
                }
                if owner.upgrade().map_or(true, |s| s.closed.load(Ordering::Acquire)) {
                    return Err(UsageError::SequenceClosed.into());
                }
                let read_timeout = core.read_timeout;
                let source = match core.source.as_mut() {
                    Some(source) => source,
                    None => return Err(UsageError::SequenceClosed.into()),
                };
                let chunk = timed(read_timeout, source.read_body_chunk())
                    .await
                    .map_err(streaming_error)?;
                if chunk.is_none() {
                    *done = true;
                }
                Ok(chunk)
            }
        }
    }

    /// Read the remaining body into memory.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl ResultItem {
    fn new(
        index: usize,
        value_type: ValueType,
        uri: Option<String>,
        path: Option<String>,
        body: ItemBody,
        owner: Option<Weak<SequenceShared>>,
    ) -> Self {
        Self {
            inner: Arc::new(ItemInner {
                index,
                value_type,
                uri,
                path,
                body: Mutex::new(body),
                owner,
            }),
        }
    }

    /// 0-based position in the sequence.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn value_type(&self) -> ValueType {
        self.inner.value_type
    }

    /// Wire primitive name, e.g. `xs:string` or `element()`.
    pub fn primitive(&self) -> &'static str {
        self.inner.value_type.primitive()
    }

    pub fn is_node(&self) -> bool {
        self.inner.value_type.is_node()
    }

    /// Document URI of a node item.
    pub fn uri(&self) -> Option<&str> {
        self.inner.uri.as_deref()
    }

    /// Path of a node item within its document.
    pub fn node_path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    /// Whether the body can still be read. Once false, stays false.
    pub fn is_fetchable(&self) -> bool {
        !matches!(*self.inner.body.lock(), ItemBody::Consumed)
    }

    /// Whether the body is held in memory.
    pub fn is_cached(&self) -> bool {
        matches!(*self.inner.body.lock(), ItemBody::Ready(_))
    }

    fn not_fetchable(&self) -> XccError {
        UsageError::NotFetchable {
            index: self.inner.index,
        }
        .into()
    }

    fn buffered_body(&self) -> Option<Vec<u8>> {
        match &*self.inner.body.lock() {
            ItemBody::Ready(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn mark_consumed(&self) {
        let mut body = self.inner.body.lock();
        if matches!(*body, ItemBody::Pending) {
            *body = ItemBody::Consumed;
        }
    }

    fn stream_core(&self) -> Result<(Arc<SequenceShared>, Arc<AsyncMutex<StreamCore>>)> {
        let shared = self
            .inner
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| self.not_fetchable())?;
        if shared.closed.load(Ordering::Acquire) {
            return Err(UsageError::SequenceClosed.into());
        }
        match &shared.mode {
            Mode::Streaming(core) => {
                let core = core.clone();
                Ok((shared, core))
            }
            Mode::Cached(_) => Err(self.not_fetchable()),
        }
    }

    /// The body bytes. Buffers a pending streaming body; the item stays fetchable.
    pub async fn as_bytes(&self) -> Result<Vec<u8>> {
        if let Some(bytes) = self.buffered_body() {
            return Ok(bytes);
        }
        if !self.is_fetchable() {
            return Err(self.not_fetchable());
        }

        let (_shared, core) = self.stream_core()?;
        let mut core = lock_stream(&core)?;
        if core.pending != Some(self.inner.index) {
            return Err(self.not_fetchable());
        }
        let body = core.read_pending_body().await?;
        *self.inner.body.lock() = ItemBody::Ready(body.clone());
        Ok(body)
    }

    /// The body as text. Binary nodes are returned base64-encoded.
    pub async fn as_string(&self) -> Result<String> {
        Ok(self.value().await?.lexical().into_owned())
    }

    /// Decode the body into an XDM value.
    pub async fn value(&self) -> Result<XdmValue> {
        let bytes = self.as_bytes().await?;
        if self.inner.value_type.is_node() {
            return Ok(XdmValue::Node(XdmNode::new(self.inner.value_type, bytes)?));
        }
        if std::str::from_utf8(&bytes).is_err() {
            return Err(ConversionError::InvalidUtf8 {
                index: self.inner.index,
            }
            .into());
        }
        Ok(XdmValue::from_wire(self.inner.value_type, bytes)?)
    }

    /// Read the body incrementally. On streaming sequences this consumes the
    /// item: afterwards it is no longer fetchable.
    pub async fn stream(&self) -> Result<ItemStream> {
        let streaming = self.inner.owner.is_some();
        {
            let mut body = self.inner.body.lock();
            let buffered = match &*body {
                ItemBody::Ready(bytes) => Some(bytes.clone()),
                ItemBody::Consumed => return Err(self.not_fetchable()),
                ItemBody::Pending => None,
            };
            if let Some(bytes) = buffered {
                if streaming {
                    *body = ItemBody::Consumed;
                }
                return Ok(ItemStream {
                    source: ItemSource::Buffered(Some(bytes)),
                });
            }
        }

        let (shared, core) = self.stream_core()?;
        let mut guard = core
            .try_lock_owned()
            .map_err(|_| XccError::illegal_state("another result item stream is still open"))?;
        if guard.pending != Some(self.inner.index) {
            return Err(self.not_fetchable());
        }
        guard.pending = None;
        *self.inner.body.lock() = ItemBody::Consumed;
        Ok(ItemStream {
            source: ItemSource::Live {
                core: guard,
                owner: Arc::downgrade(&shared),
                done: false,
            },
        })
    }
}

impl fmt::Debug for ResultItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultItem")
            .field("index", &self.inner.index)
            .field("type", &self.inner.value_type.primitive())
            .field("uri", &self.inner.uri)
            .field("fetchable", &self.is_fetchable())
            .finish()
    }
}

struct PartMeta {
    value_type: ValueType,
    uri: Option<String>,
    path: Option<String>,
}

enum PartOutcome {
    Fault(ServerException),
    Packed(Vec<PackedItem>),
    Ready(PartMeta, Vec<u8>),
    Pending(PartMeta),
}

fn streaming_error(err: TransportError) -> XccError {
    XccError::StreamingResult(err.to_string())
}

async fn timed<T, F>(limit: Option<Duration>, fut: F) -> std::result::Result<T, TransportError>
where
    F: Future<Output = std::result::Result<T, TransportError>>,
{
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })?,
    }
}

async fn read_part_body(
    source: &mut dyn PartSource,
    read_timeout: Option<Duration>,
) -> std::result::Result<Vec<u8>, TransportError> {
    let mut body = Vec::new();
    while let Some(chunk) = timed(read_timeout, source.read_body_chunk()).await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Interpret one part. Node bodies are left unread when `defer_nodes` is set.
async fn read_part(
    source: &mut dyn PartSource,
    headers: &PartHeaders,
    read_timeout: Option<Duration>,
    defer_nodes: bool,
    io_error: fn(TransportError) -> XccError,
) -> Result<PartOutcome> {
    if headers
        .get(HEADER_ERROR)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    {
        let body = read_part_body(source, read_timeout).await.map_err(io_error)?;
        return Ok(PartOutcome::Fault(ServerException::from_response(500, "", &body)));
    }

    if packed::is_packed(headers.content_type()) {
        let body = read_part_body(source, read_timeout).await.map_err(io_error)?;
        return Ok(PartOutcome::Packed(packed::decode(&body)?));
    }

    let primitive = headers.get(HEADER_PRIMITIVE).ok_or_else(|| {
        ConversionError::InvalidFormat(format!("result part without {} header", HEADER_PRIMITIVE))
    })?;
    let meta = PartMeta {
        value_type: ValueType::from_primitive(primitive)?,
        uri: headers.get(HEADER_URI).map(str::to_string),
        path: headers.get(HEADER_PATH).map(str::to_string),
    };

    if defer_nodes && meta.value_type.is_node() {
        return Ok(PartOutcome::Pending(meta));
    }
    let body = read_part_body(source, read_timeout).await.map_err(io_error)?;
    Ok(PartOutcome::Ready(meta, body))
}

/// Cursor state of a streaming sequence.
pub(crate) struct StreamCore {
    source: Option<Box<dyn PartSource>>,
    queue: VecDeque<ResultItem>,
    peeked: Option<ResultItem>,
    current: Option<ResultItem>,
    /// Index of the item whose body is next in `source`
    pending: Option<usize>,
    next_index: usize,
    started: bool,
    exhausted: bool,
    read_timeout: Option<Duration>,
    bytes_read: u64,
}

impl StreamCore {
    async fn read_pending_body(&mut self) -> Result<Vec<u8>> {
        let read_timeout = self.read_timeout;
        let source = self
            .source
            .as_deref_mut()
            .ok_or(XccError::Usage(UsageError::SequenceClosed))?;
        let body = read_part_body(source, read_timeout)
            .await
            .map_err(streaming_error)?;
        self.pending = None;
        Ok(body)
    }

    async fn finish(&mut self) {
        self.exhausted = true;
        if let Some(source) = self.source.take() {
            self.bytes_read = source.bytes_read();
            source.finish().await;
        }
    }

    fn discard(&mut self) {
        if let Some(source) = self.source.take() {
            self.bytes_read = source.bytes_read();
        }
        self.queue.clear();
        self.peeked = None;
        self.pending = None;
        self.exhausted = true;
    }

    /// Read the next item from the queue or the wire.
    async fn advance(&mut self, owner: &Weak<SequenceShared>) -> Result<Option<ResultItem>> {
        if let Some(index) = self.pending.take() {
            if let Some(current) = self.current.as_ref().filter(|c| c.index() == index) {
                current.mark_consumed();
            }
        }
        if let Some(item) = self.queue.pop_front() {
            return Ok(Some(item));
        }

        loop {
            if self.exhausted {
                return Ok(None);
            }
            let read_timeout = self.read_timeout;
            let source = match self.source.as_deref_mut() {
                Some(source) => source,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            };

            let headers = match timed(read_timeout, source.next_part())
                .await
                .map_err(streaming_error)?
            {
                Some(headers) => headers,
                None => {
                    self.finish().await;
                    return Ok(None);
                }
            };

            let outcome = read_part(source, &headers, read_timeout, true, streaming_error).await?;
            self.bytes_read = source.bytes_read();
            match outcome {
                PartOutcome::Fault(fault) => {
                    self.finish().await;
                    return Err(fault.into());
                }
                PartOutcome::Packed(items) => {
                    for entry in items {
                        let item = ResultItem::new(
                            self.next_index,
                            entry.value_type,
                            None,
                            None,
                            ItemBody::Ready(entry.body),
                            Some(owner.clone()),
                        );
                        self.next_index += 1;
                        self.queue.push_back(item);
                    }
                    if let Some(item) = self.queue.pop_front() {
                        return Ok(Some(item));
                    }
                }
                PartOutcome::Ready(meta, body) => {
                    let item = ResultItem::new(
                        self.next_index,
                        meta.value_type,
                        meta.uri,
                        meta.path,
                        ItemBody::Ready(body),
                        Some(owner.clone()),
                    );
                    self.next_index += 1;
                    return Ok(Some(item));
                }
                PartOutcome::Pending(meta) => {
                    let item = ResultItem::new(
                        self.next_index,
                        meta.value_type,
                        meta.uri,
                        meta.path,
                        ItemBody::Pending,
                        Some(owner.clone()),
                    );
                    self.pending = Some(self.next_index);
                    self.next_index += 1;
                    return Ok(Some(item));
                }
            }
        }
    }

    async fn next(&mut self, owner: &Weak<SequenceShared>) -> Result<Option<ResultItem>> {
        self.started = true;
        let item = match self.peeked.take() {
            Some(item) => Some(item),
            None => self.advance(owner).await?,
        };
        self.current = item.clone();
        Ok(item)
    }

    async fn has_next(&mut self, owner: &Weak<SequenceShared>) -> Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        self.peeked = self.advance(owner).await?;
        Ok(self.peeked.is_some())
    }
}

struct CachedState {
    items: Vec<ResultItem>,
    /// Index of the next item `next()` returns
    next: usize,
}

enum Mode {
    Cached(Mutex<CachedState>),
    Streaming(Arc<AsyncMutex<StreamCore>>),
}

pub(crate) struct SequenceShared {
    mode: Mode,
    closed: AtomicBool,
    drained: AtomicBool,
    epoch: AtomicU64,
    bytes_read: AtomicU64,
    request: Option<RequestSummary>,
}

/// Weak reference a session keeps to its open streaming sequences.
#[derive(Clone)]
pub(crate) struct SequenceHandle(Weak<SequenceShared>);

impl SequenceHandle {
    /// Whether the sequence is still open and holds its connection.
    pub(crate) fn is_active(&self) -> bool {
        self.0.upgrade().is_some_and(|s| {
            !s.closed.load(Ordering::Acquire) && !s.drained.load(Ordering::Acquire)
        })
    }

    pub(crate) fn close(&self) {
        if let Some(shared) = self.0.upgrade() {
            ResultSequence { shared }.close();
        }
    }
}

fn lock_stream(core: &AsyncMutex<StreamCore>) -> Result<tokio::sync::MutexGuard<'_, StreamCore>> {
    core.try_lock()
        .map_err(|_| XccError::illegal_state("a result item stream is still open"))
}

/// Ordered sequence of result items.
#[derive(Clone)]
pub struct ResultSequence {
    shared: Arc<SequenceShared>,
}

impl ResultSequence {
    fn with_mode(mode: Mode, request: Option<RequestSummary>, bytes_read: u64) -> Self {
        Self {
            shared: Arc::new(SequenceShared {
                mode,
                closed: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                bytes_read: AtomicU64::new(bytes_read),
                request,
            }),
        }
    }

    fn cached_from(items: Vec<ResultItem>, request: Option<RequestSummary>, bytes_read: u64) -> Self {
        let seq = Self::with_mode(
            Mode::Cached(Mutex::new(CachedState { items, next: 0 })),
            request,
            bytes_read,
        );
        seq.shared.drained.store(true, Ordering::Release);
        seq
    }

    /// An empty cached sequence.
    pub fn empty() -> Self {
        Self::cached_from(Vec::new(), None, 0)
    }

    /// Cached sequence of already decoded items.
    pub(crate) fn from_packed(
        items: Vec<PackedItem>,
        request: Option<RequestSummary>,
        bytes_read: u64,
    ) -> Self {
        let items = items
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                ResultItem::new(i, entry.value_type, None, None, ItemBody::Ready(entry.body), None)
            })
            .collect();
        Self::cached_from(items, request, bytes_read)
    }

    /// Read every part and return a cached sequence. The connection is
    /// released once the body is drained.
    pub(crate) async fn read_cached(
        mut source: Box<dyn PartSource>,
        request: Option<RequestSummary>,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut items = Vec::new();
        while let Some(headers) = timed(read_timeout, source.next_part()).await? {
            match read_part(source.as_mut(), &headers, read_timeout, false, XccError::from).await? {
                PartOutcome::Fault(fault) => {
                    source.finish().await;
                    let fault = match &request {
                        Some(summary) => fault.with_request(summary.clone()),
                        None => fault,
                    };
                    return Err(fault.into());
                }
                PartOutcome::Packed(entries) => {
                    for entry in entries {
                        items.push(ResultItem::new(
                            items.len(),
                            entry.value_type,
                            None,
                            None,
                            ItemBody::Ready(entry.body),
                            None,
                        ));
                    }
                }
                PartOutcome::Ready(meta, body) => {
                    items.push(ResultItem::new(
                        items.len(),
                        meta.value_type,
                        meta.uri,
                        meta.path,
                        ItemBody::Ready(body),
                        None,
                    ));
                }
                PartOutcome::Pending(_) => {
                    return Err(XccError::illegal_state("cached read deferred a part body"));
                }
            }
        }
        let bytes_read = source.bytes_read();
        source.finish().await;
        tracing::trace!(items = items.len(), bytes_read, "cached result sequence");
        Ok(Self::cached_from(items, request, bytes_read))
    }

    /// Streaming sequence over `source`.
    pub(crate) fn streaming(
        source: Box<dyn PartSource>,
        request: Option<RequestSummary>,
        read_timeout: Option<Duration>,
    ) -> Self {
        let core = StreamCore {
            source: Some(source),
            queue: VecDeque::new(),
            peeked: None,
            current: None,
            pending: None,
            next_index: 0,
            started: false,
            exhausted: false,
            read_timeout,
            bytes_read: 0,
        };
        Self::with_mode(Mode::Streaming(Arc::new(AsyncMutex::new(core))), request, 0)
    }

    pub(crate) fn handle(&self) -> SequenceHandle {
        SequenceHandle(Arc::downgrade(&self.shared))
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(UsageError::SequenceClosed.into());
        }
        Ok(())
    }

    fn annotate(&self, err: XccError) -> XccError {
        match (err, &self.shared.request) {
            (XccError::Server(fault), Some(summary)) if fault.request.is_none() => {
                XccError::Server(Box::new((*fault).with_request(summary.clone())))
            }
            (err, _) => err,
        }
    }

    fn sync_stream_state(&self, core: &StreamCore) {
        let bytes = core
            .source
            .as_ref()
            .map_or(core.bytes_read, |s| s.bytes_read());
        self.shared.bytes_read.store(bytes, Ordering::Release);
        if core.exhausted {
            self.shared.drained.store(true, Ordering::Release);
        }
    }

    /// Whether every item was read before the sequence was returned.
    pub fn is_cached(&self) -> bool {
        matches!(self.shared.mode, Mode::Cached(_))
    }

    /// Number of items, or -1 for streaming sequences.
    pub fn size(&self) -> i64 {
        match &self.shared.mode {
            Mode::Cached(state) => state.lock().items.len() as i64,
            Mode::Streaming(_) => -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Request that produced this sequence.
    pub fn request(&self) -> Option<&RequestSummary> {
        self.shared.request.as_ref()
    }

    /// Bytes read from the response so far.
    pub fn total_bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Advance the cursor and return the new current item, `None` at the end.
    pub async fn next(&self) -> Result<Option<ResultItem>> {
        self.check_open()?;
        match &self.shared.mode {
            Mode::Cached(state) => {
                let mut state = state.lock();
                if state.next > state.items.len() {
                    return Ok(None);
                }
                let item = state.items.get(state.next).cloned();
                state.next += 1;
                Ok(item)
            }
            Mode::Streaming(core) => {
                let mut core = lock_stream(core)?;
                let owner = Arc::downgrade(&self.shared);
                let result = core.next(&owner).await;
                self.sync_stream_state(&core);
                result.map_err(|e| self.annotate(e))
            }
        }
    }

    /// Whether another item follows. On streaming sequences this reads ahead,
    /// which skips any unread body of the current item.
    pub async fn has_next(&self) -> Result<bool> {
        self.check_open()?;
        match &self.shared.mode {
            Mode::Cached(state) => {
                let state = state.lock();
                Ok(state.next < state.items.len())
            }
            Mode::Streaming(core) => {
                let mut core = lock_stream(core)?;
                let owner = Arc::downgrade(&self.shared);
                let result = core.has_next(&owner).await;
                self.sync_stream_state(&core);
                result.map_err(|e| self.annotate(e))
            }
        }
    }

    /// The item most recently returned by `next()`.
    ///
    /// # Errors
    ///
    /// Illegal before the first `next()` and after the end was reached.
    pub async fn current(&self) -> Result<ResultItem> {
        self.check_open()?;
        let no_current = || XccError::illegal_state("no current item");
        match &self.shared.mode {
            Mode::Cached(state) => {
                let state = state.lock();
                state
                    .next
                    .checked_sub(1)
                    .and_then(|i| state.items.get(i))
                    .cloned()
                    .ok_or_else(no_current)
            }
            Mode::Streaming(core) => {
                let core = lock_stream(core)?;
                core.current.clone().ok_or_else(no_current)
            }
        }
    }

    /// Reset the cursor to before the first item. Streaming sequences cannot rewind.
    pub fn rewind(&self) -> Result<()> {
        self.check_open()?;
        match &self.shared.mode {
            Mode::Cached(state) => {
                state.lock().next = 0;
                Ok(())
            }
            Mode::Streaming(_) => Err(UsageError::Unsupported(
                "rewind on a streaming result sequence".to_string(),
            )
            .into()),
        }
    }

    /// Item at `index`. Streaming sequences only serve the current item.
    pub async fn item_at(&self, index: usize) -> Result<ResultItem> {
        self.check_open()?;
        match &self.shared.mode {
            Mode::Cached(state) => {
                let state = state.lock();
                let len = state.items.len();
                state.items.get(index).cloned().ok_or_else(|| {
                    XccError::invalid_argument(
                        "index",
                        format!("{} is out of range for a sequence of {} items", index, len),
                    )
                })
            }
            Mode::Streaming(core) => {
                let core = lock_stream(core)?;
                match &core.current {
                    Some(item) if item.index() == index => Ok(item.clone()),
                    _ => Err(XccError::illegal_state(format!(
                        "item {} is not the current item of a streaming sequence",
                        index
                    ))),
                }
            }
        }
    }

    /// Every item. Streaming sequences return the remaining items, buffered.
    pub async fn to_vec(&self) -> Result<Vec<ResultItem>> {
        self.check_open()?;
        match &self.shared.mode {
            Mode::Cached(_) => Ok(self.cached_items()),
            Mode::Streaming(_) => Ok(self.to_cached().await?.cached_items()),
        }
    }

    /// Items of a cached sequence; empty for streaming ones.
    fn cached_items(&self) -> Vec<ResultItem> {
        match &self.shared.mode {
            Mode::Cached(state) => state.lock().items.clone(),
            Mode::Streaming(_) => Vec::new(),
        }
    }

    /// Bodies of every remaining item as strings.
    pub async fn as_strings(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut iter = self.iter();
        while let Some(item) = iter.next().await? {
            out.push(item.as_string().await?);
        }
        Ok(out)
    }

    /// A cached copy. Streaming sequences are drained into the copy and closed.
    pub async fn to_cached(&self) -> Result<ResultSequence> {
        self.check_open()?;
        let core = match &self.shared.mode {
            Mode::Cached(_) => return Ok(self.clone()),
            Mode::Streaming(core) => core,
        };

        let mut items = Vec::new();
        {
            let mut core = lock_stream(core)?;
            let owner = Arc::downgrade(&self.shared);
            loop {
                let item = match core.peeked.take() {
                    Some(item) => item,
                    None => match core.advance(&owner).await? {
                        Some(item) => item,
                        None => break,
                    },
                };
                let body = if core.pending == Some(item.index()) {
                    core.read_pending_body().await?
                } else {
                    match item.buffered_body() {
                        Some(bytes) => bytes,
                        None => continue,
                    }
                };
                items.push(ResultItem::new(
                    items.len(),
                    item.value_type(),
                    item.inner.uri.clone(),
                    item.inner.path.clone(),
                    ItemBody::Ready(body),
                    None,
                ));
            }
            self.sync_stream_state(&core);
        }

        let bytes_read = self.total_bytes_read();
        self.close();
        Ok(Self::cached_from(items, self.shared.request.clone(), bytes_read))
    }

    /// Look up a result channel.
    pub fn channel(&self, name: ResultChannelName) -> Result<ResultSequence> {
        if self.is_closed() {
            return Err(XccError::illegal_state(
                "cannot look up a channel of a closed result sequence",
            ));
        }
        match name {
            ResultChannelName::Primary => Ok(self.clone()),
            ResultChannelName::Secondary => Ok(ResultSequence::empty()),
        }
    }

    /// Start an iteration. Cached sequences rewind; iterators from earlier
    /// calls become stale.
    pub fn iter(&self) -> ResultIterator {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if let Mode::Cached(state) = &self.shared.mode {
            state.lock().next = 0;
        }
        ResultIterator {
            sequence: self.clone(),
            epoch,
        }
    }

    /// Release the sequence. A streaming sequence returns its connection to
    /// the pool only if the body was fully read. Closing twice is a no-op.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.shared.mode {
            Mode::Cached(state) => {
                let mut state = state.lock();
                state.items.clear();
                state.next = 0;
            }
            Mode::Streaming(core) => match core.try_lock() {
                Ok(mut core) => {
                    if core.source.is_some() {
                        tracing::debug!("closing undrained streaming result; connection discarded");
                    }
                    core.discard();
                    core.current = None;
                }
                Err(_) => {
                    tracing::debug!("streaming result closed while an item stream is open");
                }
            },
        }
    }
}

impl fmt::Debug for ResultSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSequence")
            .field("cached", &self.is_cached())
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .field("bytes_read", &self.total_bytes_read())
            .finish()
    }
}

impl fmt::Display for ResultSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cached() {
            write!(f, "ResultSequence (cached, {} items)", self.size())
        } else {
            write!(f, "ResultSequence (streaming)")
        }
    }
}

/// Iterator bound to one iteration of a sequence.
pub struct ResultIterator {
    sequence: ResultSequence,
    epoch: u64,
}

impl ResultIterator {
    /// Next item, `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::StaleIterator` once a newer iteration was started.
    pub async fn next(&mut self) -> Result<Option<ResultItem>> {
        if self.sequence.shared.epoch.load(Ordering::Acquire) != self.epoch {
            return Err(UsageError::StaleIterator.into());
        }
        self.sequence.next().await
    }
}

#[cfg(test)]
#[async_trait]
impl PartSource for MultipartReader<&'static [u8]> {
    async fn next_part(&mut self) -> std::result::Result<Option<PartHeaders>, TransportError> {
        MultipartReader::next_part(self).await
    }

    async fn read_body_chunk(&mut self) -> std::result::Result<Option<Vec<u8>>, TransportError> {
        MultipartReader::read_body_chunk(self).await
    }

    fn bytes_read(&self) -> u64 {
        MultipartReader::bytes_read(self)
    }

    async fn finish(mut self: Box<Self>) {
        let _ = self.drain().await;
    }
}

//! Documents to insert and the options they are created with.
//!
//! A [`Content`] is a URI plus a byte source read in chunks. Rewindable
//! contents can be re-sent when an insert is retried.

use crate::error::{Result, UsageError, XccError};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 64 * 1024;

/// Format a document is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Xml,
    Json,
    Text,
    Binary,
}

impl DocumentFormat {
    pub fn as_wire(&self) -> &'static str {
        match self {
            DocumentFormat::Xml => "xml",
            DocumentFormat::Json => "json",
            DocumentFormat::Text => "text",
            DocumentFormat::Binary => "binary",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// How far the server may repair malformed XML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentRepairLevel {
    Default,
    Full,
    None,
}

impl DocumentRepairLevel {
    pub fn as_wire(&self) -> &'static str {
        match self {
            DocumentRepairLevel::Default => "default",
            DocumentRepairLevel::Full => "full",
            DocumentRepairLevel::None => "none",
        }
    }
}

/// Capability granted to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Insert,
    Update,
    NodeUpdate,
    Execute,
}

impl Capability {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Insert => "insert",
            Capability::Update => "update",
            Capability::NodeUpdate => "node-update",
            Capability::Execute => "execute",
        }
    }
}

/// A role/capability pair attached to a new document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPermission {
    pub capability: Capability,
    pub role: String,
}

impl ContentPermission {
    pub fn new(capability: Capability, role: impl Into<String>) -> Self {
        Self {
            capability,
            role: role.into(),
        }
    }
}

/// Options a document is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentCreateOptions {
    /// `None` lets the server pick from the URI extension
    pub format: Option<DocumentFormat>,
    pub collections: Vec<String>,
    pub permissions: Vec<ContentPermission>,
    pub quality: i32,
    /// Default namespace for XML content
    pub namespace: Option<String>,
    pub language: Option<String>,
    pub repair: Option<DocumentRepairLevel>,
    /// Forests the document may be placed in
    pub placement_keys: Vec<u64>,
    pub temporal_collection: Option<String>,
    /// Character encoding of the source bytes
    pub encoding: Option<String>,
}

impl ContentCreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn xml() -> Self {
        Self::new().with_format(DocumentFormat::Xml)
    }

    pub fn json() -> Self {
        Self::new().with_format(DocumentFormat::Json)
    }

    pub fn text() -> Self {
        Self::new().with_format(DocumentFormat::Text)
    }

    pub fn binary() -> Self {
        Self::new().with_format(DocumentFormat::Binary)
    }

    pub fn with_format(mut self, format: DocumentFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    pub fn with_permission(mut self, permission: ContentPermission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_quality(mut self, quality: i32) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_repair(mut self, repair: DocumentRepairLevel) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn with_placement_key(mut self, forest: u64) -> Self {
        self.placement_keys.push(forest);
        self
    }

    pub fn with_temporal_collection(mut self, collection: impl Into<String>) -> Self {
        self.temporal_collection = Some(collection.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Query parameters of an insert request for `uri`.
    pub(crate) fn query_params(&self, uri: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("uri", uri.to_string())];
        if let Some(format) = self.format {
            params.push(("format", format.as_wire().to_string()));
        }
        for collection in &self.collections {
            params.push(("coll", collection.clone()));
        }
        for permission in &self.permissions {
            params.push((
                "perm",
                format!("{}:{}", permission.capability.as_wire(), permission.role),
            ));
        }
        if self.quality != 0 {
            params.push(("quality", self.quality.to_string()));
        }
        for key in &self.placement_keys {
            params.push(("placeKey", key.to_string()));
        }
        if let Some(language) = &self.language {
            params.push(("lang", language.clone()));
        }
        if let Some(namespace) = &self.namespace {
            params.push(("ns", namespace.clone()));
        }
        if let Some(repair) = self.repair {
            params.push(("repair", repair.as_wire().to_string()));
        }
        if let Some(collection) = &self.temporal_collection {
            params.push(("tcoll", collection.clone()));
        }
        if let Some(encoding) = &self.encoding {
            params.push(("encoding", encoding.clone()));
        }
        params
    }
}

/// A document to insert.
#[async_trait]
pub trait Content: Send {
    /// URI the document is stored under.
    fn uri(&self) -> &str;

    fn options(&self) -> &ContentCreateOptions;

    /// Whether [`Content::rewind`] can restart the body.
    fn is_rewindable(&self) -> bool;

    /// Restart the body from its first byte.
    async fn rewind(&mut self) -> Result<()>;

    /// Body length in bytes, if known before reading.
    fn size(&self) -> Option<u64>;

    /// Next piece of the body, `None` at the end.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

fn not_rewindable(uri: &str) -> XccError {
    UsageError::Unsupported(format!("content '{}' cannot be rewound", uri)).into()
}

/// In-memory content.
#[derive(Debug, Clone)]
pub struct BytesContent {
    uri: String,
    data: Vec<u8>,
    options: ContentCreateOptions,
    position: usize,
}

impl BytesContent {
    pub fn new(uri: impl Into<String>, data: impl Into<Vec<u8>>, options: ContentCreateOptions) -> Self {
        Self {
            uri: uri.into(),
            data: data.into(),
            options,
            position: 0,
        }
    }

    /// Text content. Uses XML format unless `options` names one.
    pub fn from_text(uri: impl Into<String>, text: &str, mut options: ContentCreateOptions) -> Self {
        if options.format.is_none() {
            options.format = Some(DocumentFormat::Xml);
        }
        Self::new(uri, text.as_bytes().to_vec(), options)
    }

    /// JSON content serialized from `value`.
    pub fn from_json(
        uri: impl Into<String>,
        value: &serde_json::Value,
        options: ContentCreateOptions,
    ) -> Self {
        let options = options.with_format(DocumentFormat::Json);
        Self::new(uri, value.to_string().into_bytes(), options)
    }
}

#[async_trait]
impl Content for BytesContent {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn options(&self) -> &ContentCreateOptions {
        &self.options
    }

    fn is_rewindable(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position >= self.data.len() {
            return Ok(None);
        }
        let end = (self.position + CHUNK_SIZE).min(self.data.len());
        let chunk = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(Some(chunk))
    }
}

/// Content read from a file. Rewinding reopens the file.
#[derive(Debug)]
pub struct FileContent {
    uri: String,
    path: PathBuf,
    options: ContentCreateOptions,
    size: u64,
    file: Option<tokio::fs::File>,
    done: bool,
}

impl FileContent {
    /// # Errors
    ///
    /// Fails if the file's metadata cannot be read.
    pub async fn open(
        uri: impl Into<String>,
        path: impl AsRef<Path>,
        options: ContentCreateOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            XccError::invalid_argument("path", format!("cannot read '{}': {}", path.display(), e))
        })?;
        Ok(Self {
            uri: uri.into(),
            path,
            options,
            size: metadata.len(),
            file: None,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Content for FileContent {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn options(&self) -> &ContentCreateOptions {
        &self.options
    }

    fn is_rewindable(&self) -> bool {
        true
    }

    async fn rewind(&mut self) -> Result<()> {
        self.file = None;
        self.done = false;
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let file = match &mut self.file {
            Some(file) => file,
            None => {
                let opened = tokio::fs::File::open(&self.path)
                    .await
                    .map_err(crate::error::TransportError::from)?;
                self.file.insert(opened)
            }
        };
        let chunk = read_up_to(file, CHUNK_SIZE).await?;
        if chunk.is_none() {
            self.done = true;
        }
        Ok(chunk)
    }
}

/// Content from an arbitrary reader. Cannot be rewound, so inserts of it
/// are never retried.
pub struct ReaderContent<R> {
    uri: String,
    reader: Option<R>,
    options: ContentCreateOptions,
    size: Option<u64>,
}

impl<R: AsyncRead + Unpin + Send> ReaderContent<R> {
    pub fn new(uri: impl Into<String>, reader: R, options: ContentCreateOptions) -> Self {
        Self {
            uri: uri.into(),
            reader: Some(reader),
            options,
            size: None,
        }
    }

    /// Declare the body length so it is sent with `Content-Length`.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl<R> fmt::Debug for ReaderContent<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderContent")
            .field("uri", &self.uri)
            .field("size", &self.size)
            .field("consumed", &self.reader.is_none())
            .finish()
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Content for ReaderContent<R> {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn options(&self) -> &ContentCreateOptions {
        &self.options
    }

    fn is_rewindable(&self) -> bool {
        false
    }

    async fn rewind(&mut self) -> Result<()> {
        Err(not_rewindable(&self.uri))
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = match &mut self.reader {
            Some(reader) => reader,
            None => return Ok(None),
        };
        let chunk = read_up_to(reader, CHUNK_SIZE).await?;
        if chunk.is_none() {
            self.reader = None;
        }
        Ok(chunk)
    }
}

async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(crate::error::TransportError::from)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf))
}

//! Content insertion with retry and partial-failure handling.
//!
//! Two disciplines are offered:
//!
//! - **Fail-fast** ([`Session::insert_content`], [`Session::insert_contents`]):
//!   the batch is all-or-nothing. Under `Auto` and `UpdateAutoCommit` it runs
//!   in an implicit update transaction committed at the end; a retryable
//!   failure rolls back, rewinds every item and restarts from the first one.
//!   Under `Update` the items join the caller's transaction and the first
//!   failure rolls it back.
//! - **Collect-errors** ([`Session::insert_contents_collect_errors`]): every
//!   item is attempted and failures are returned per item.
//!
//! Retries only happen for retryable errors and only while every item sent
//! so far can be rewound.

use crate::connection::session::Session;
use crate::connection::transaction::TransactionMode;
use crate::content::Content;
use crate::error::{Result, XccError};
use crate::query::options::{EffectiveOptions, RequestOptions};
use std::time::Duration;

/// Backoff schedule for insert retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertRetryPolicy {
    /// Delay before the first retry
    pub first_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
}

impl Default for InsertRetryPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(125),
            max_delay: Duration::from_secs(2),
            max_attempts: 64,
        }
    }
}

impl InsertRetryPolicy {
    /// Default schedule, overridden by retry options set explicitly in `options`.
    pub fn from_options(options: &RequestOptions) -> Self {
        let mut policy = Self::default();
        if let Some(retries) = options.max_auto_retry {
            policy.max_attempts = retries;
        }
        if let Some(delay) = options.auto_retry_delay {
            policy.first_delay = delay;
            policy.max_delay = policy.max_delay.max(delay);
        }
        policy
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One item that could not be inserted.
#[derive(Debug)]
pub struct InsertFailure {
    /// Position of the item in the batch
    pub index: usize,
    pub uri: String,
    pub error: XccError,
}

impl Session {
    /// Insert one document.
    ///
    /// # Errors
    ///
    /// Fails without sending anything for an empty URI, in `Query` mode, or
    /// when the session options carry an effective point in time.
    pub async fn insert_content(&mut self, content: &mut dyn Content) -> Result<()> {
        let mut items = [content];
        self.insert_all(&mut items).await
    }

    /// Insert a batch of documents, all or nothing.
    pub async fn insert_contents(&mut self, contents: &mut [Box<dyn Content>]) -> Result<()> {
        let mut items: Vec<&mut dyn Content> = contents
            .iter_mut()
            .map(|c| c.as_mut() as &mut dyn Content)
            .collect();
        self.insert_all(&mut items).await
    }

    /// Attempt every document and return the ones that failed.
    ///
    /// # Errors
    ///
    /// Only batch validation errors are returned as `Err`.
    pub async fn insert_contents_collect_errors(
        &mut self,
        contents: &mut [Box<dyn Content>],
    ) -> Result<Vec<InsertFailure>> {
        let (sparse, options) = self.prepare_insert(contents.iter().map(|c| c.uri()))?;
        let policy = InsertRetryPolicy::from_options(&sparse);
        let in_transaction = self.transaction_mode() == TransactionMode::Update;
        if in_transaction {
            self.establish_transaction(&options).await?;
        }

        let mut failures = Vec::new();
        for (index, content) in contents.iter_mut().enumerate() {
            let content = content.as_mut();
            let mut attempt = 0;
            loop {
                let err = match self.send_content(content, &options).await {
                    Ok(()) => break,
                    Err(err) => err,
                };
                let retry = !in_transaction
                    && err.is_retryable()
                    && content.is_rewindable()
                    && attempt < policy.max_attempts;
                if retry {
                    attempt += 1;
                    tracing::debug!(
                        session = self.id(),
                        uri = content.uri(),
                        attempt,
                        error = %err,
                        "retrying insert"
                    );
                    tokio::time::sleep(policy.delay(attempt)).await;
                    if let Err(rewind_err) = content.rewind().await {
                        failures.push(InsertFailure {
                            index,
                            uri: content.uri().to_string(),
                            error: rewind_err,
                        });
                        break;
                    }
                    continue;
                }
                tracing::debug!(session = self.id(), uri = content.uri(), error = %err, "insert failed");
                failures.push(InsertFailure {
                    index,
                    uri: content.uri().to_string(),
                    error: err,
                });
                break;
            }
        }
        Ok(failures)
    }

    /// Batch validation shared by both disciplines.
    fn prepare_insert<'a>(
        &mut self,
        mut uris: impl Iterator<Item = &'a str>,
    ) -> Result<(RequestOptions, EffectiveOptions)> {
        self.check_open()?;
        self.check_no_active_stream()?;
        if self.transaction_mode() == TransactionMode::Query {
            return Err(XccError::illegal_state(
                "content cannot be inserted in query transaction mode",
            ));
        }
        let sparse = RequestOptions::merge(&[self.default_request_options()]);
        if sparse.effective_point_in_time.is_some() {
            return Err(XccError::illegal_state(
                "content cannot be inserted at an effective point in time",
            ));
        }
        if uris.any(|uri| uri.trim().is_empty()) {
            return Err(XccError::invalid_argument("uri", "content URI must not be empty"));
        }
        let options = sparse.fill_defaults(self.config());
        Ok((sparse, options))
    }

    async fn insert_all(&mut self, items: &mut [&mut dyn Content]) -> Result<()> {
        let (sparse, options) = self.prepare_insert(items.iter().map(|c| c.uri()))?;
        if items.is_empty() {
            return Ok(());
        }

        let original = self.transaction_mode();
        if original == TransactionMode::Update {
            return match self.insert_each(items, &options).await {
                Ok(()) => Ok(()),
                Err((_, err)) => {
                    self.rollback_quietly().await;
                    Err(err)
                }
            };
        }

        let policy = InsertRetryPolicy::from_options(&sparse);
        let mut attempt = 0;
        loop {
            self.set_transaction_mode(TransactionMode::Update)?;
            let outcome = self.insert_each(items, &options).await;
            let outcome = match outcome {
                Ok(()) => self.commit_if_open().await.map_err(|err| (items.len(), err)),
                Err(failed) => Err(failed),
            };
            let (failed_at, err) = match outcome {
                Ok(()) => {
                    self.reset_transaction(original);
                    return Ok(());
                }
                Err(failed) => failed,
            };

            self.rollback_quietly().await;
            self.reset_transaction(original);

            let sent = &items[..(failed_at + 1).min(items.len())];
            let retry = err.is_retryable()
                && attempt < policy.max_attempts
                && sent.iter().all(|c| c.is_rewindable());
            if !retry {
                return Err(err);
            }
            attempt += 1;
            tracing::debug!(
                session = self.id(),
                attempt,
                failed_at,
                error = %err,
                "restarting insert batch"
            );
            tokio::time::sleep(policy.delay(attempt)).await;
            for content in items.iter_mut().take(failed_at + 1) {
                content.rewind().await?;
            }
        }
    }

    /// Send items in order; on failure report the failing index.
    async fn insert_each(
        &mut self,
        items: &mut [&mut dyn Content],
        options: &EffectiveOptions,
    ) -> std::result::Result<(), (usize, XccError)> {
        self.establish_transaction(options).await.map_err(|e| (0, e))?;
        for (index, content) in items.iter_mut().enumerate() {
            self.send_content(&mut **content, options)
                .await
                .map_err(|e| (index, e))?;
        }
        Ok(())
    }

    async fn commit_if_open(&mut self) -> Result<()> {
        if self.transaction_id().is_some() {
            self.commit().await?;
        }
        Ok(())
    }

    async fn rollback_quietly(&mut self) {
        if self.transaction_id().is_none() {
            return;
        }
        if let Err(err) = self.rollback().await {
            tracing::warn!(session = self.id(), error = %err, "rollback after failed insert failed");
        }
    }
}

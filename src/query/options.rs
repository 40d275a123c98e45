//! Per-request options and the rules for combining them.
//!
//! [`RequestOptions`] is sparse: every field is optional and `None` means
//! "not set here". A session's defaults and a request's overrides are combined
//! with [`RequestOptions::merge`], where a later set value wins, and then
//! completed from [`DriverConfig`] with [`RequestOptions::fill_defaults`].

use crate::config::DriverConfig;
use chrono::{FixedOffset, Local, Offset};
use std::fmt;
use std::time::Duration;

const DEFAULT_LOCALE: &str = "en_US";

/// Language of an ad hoc query body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryLanguage {
    #[default]
    XQuery,
    JavaScript,
}

impl QueryLanguage {
    /// Form field carrying the query text.
    pub fn payload_key(&self) -> &'static str {
        match self {
            QueryLanguage::XQuery => "xquery",
            QueryLanguage::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload_key())
    }
}

/// Sparse request options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Buffer the whole result before returning it
    pub cache_result: Option<bool>,
    /// Retry budget
    pub max_auto_retry: Option<u32>,
    /// Delay between retries
    pub auto_retry_delay: Option<Duration>,
    /// Locale sent to the server, e.g. `en_US`
    pub locale: Option<String>,
    /// Timezone sent to the server as an offset in seconds
    pub timezone: Option<FixedOffset>,
    /// Size of the buffer used to read result bodies
    pub result_buffer_size: Option<usize>,
    /// Name recorded in server logs
    pub request_name: Option<String>,
    /// Server-side time limit in seconds
    pub request_time_limit: Option<u32>,
    /// Client-side limit on waiting for a response
    pub read_timeout: Option<Duration>,
    /// Evaluate at this point in time (a server timestamp)
    pub effective_point_in_time: Option<u64>,
    /// Language version used when the query does not declare one
    pub default_language_version: Option<String>,
    /// Language of ad hoc query bodies
    pub query_language: Option<QueryLanguage>,
}

/// Fully resolved options for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveOptions {
    pub cache_result: bool,
    pub max_auto_retry: u32,
    pub auto_retry_delay: Duration,
    pub locale: String,
    pub timezone: FixedOffset,
    pub result_buffer_size: usize,
    pub request_name: Option<String>,
    pub request_time_limit: Option<u32>,
    pub read_timeout: Option<Duration>,
    pub effective_point_in_time: Option<u64>,
    pub default_language_version: Option<String>,
    pub query_language: QueryLanguage,
}

macro_rules! overlay {
    ($target:ident, $source:ident, $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field.clone();
            }
        )+
    };
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine option records in order. For every field the last record that
    /// sets it wins; fields set nowhere stay unset.
    pub fn merge(layers: &[&RequestOptions]) -> RequestOptions {
        let mut merged = RequestOptions::default();
        for layer in layers {
            merged.overlay(layer);
        }
        merged
    }

    /// Overwrite fields of `self` with the set fields of `other`.
    pub fn overlay(&mut self, other: &RequestOptions) {
        overlay!(
            self,
            other,
            cache_result,
            max_auto_retry,
            auto_retry_delay,
            locale,
            timezone,
            result_buffer_size,
            request_name,
            request_time_limit,
            read_timeout,
            effective_point_in_time,
            default_language_version,
            query_language,
        );
    }

    /// Resolve unset fields from driver defaults and the platform.
    pub fn fill_defaults(&self, config: &DriverConfig) -> EffectiveOptions {
        EffectiveOptions {
            cache_result: self.cache_result.unwrap_or(true),
            max_auto_retry: self.max_auto_retry.unwrap_or(config.max_auto_retry),
            auto_retry_delay: self.auto_retry_delay.unwrap_or(config.auto_retry_delay),
            locale: self.locale.clone().unwrap_or_else(platform_locale),
            timezone: self.timezone.unwrap_or_else(platform_timezone),
            result_buffer_size: self
                .result_buffer_size
                .unwrap_or(config.result_buffer_size),
            request_name: self.request_name.clone(),
            request_time_limit: self.request_time_limit,
            read_timeout: self.read_timeout,
            effective_point_in_time: self.effective_point_in_time,
            default_language_version: self.default_language_version.clone(),
            query_language: self.query_language.unwrap_or_default(),
        }
    }

    pub fn with_cache_result(mut self, cache: bool) -> Self {
        self.cache_result = Some(cache);
        self
    }

    pub fn with_max_auto_retry(mut self, retries: u32) -> Self {
        self.max_auto_retry = Some(retries);
        self
    }

    pub fn with_auto_retry_delay(mut self, delay: Duration) -> Self {
        self.auto_retry_delay = Some(delay);
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = Some(timezone);
        self
    }

    pub fn with_result_buffer_size(mut self, size: usize) -> Self {
        self.result_buffer_size = Some(size);
        self
    }

    pub fn with_request_name(mut self, name: impl Into<String>) -> Self {
        self.request_name = Some(name.into());
        self
    }

    pub fn with_request_time_limit(mut self, seconds: u32) -> Self {
        self.request_time_limit = Some(seconds);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_effective_point_in_time(mut self, timestamp: u64) -> Self {
        self.effective_point_in_time = Some(timestamp);
        self
    }

    pub fn with_default_language_version(mut self, version: impl Into<String>) -> Self {
        self.default_language_version = Some(version.into());
        self
    }

    pub fn with_query_language(mut self, language: QueryLanguage) -> Self {
        self.query_language = Some(language);
        self
    }
}

fn platform_locale() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|raw| {
            raw.split(['.', '@'])
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .find(|locale| !locale.is_empty() && locale != "C" && locale != "POSIX")
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
}

fn platform_timezone() -> FixedOffset {
    Local::now().offset().fix()
}

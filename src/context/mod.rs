//! Per-request context handed to middleware and handlers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;

use crate::Request;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// The request being served plus a process-unique id used in log lines.
#[derive(Debug)]
pub struct Context {
    request: Request,
    request_id: u64,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for an empty or malformed body.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Parses the body as JSON, falling back to `T::default()` on any failure.
    ///
    /// The failure is logged at debug level and never reported to the caller.
    pub fn json_or_default<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        self.json().unwrap_or_else(|e| {
            tracing::debug!(
                request_id = self.request_id,
                error = %e,
                "unparseable request body, using default"
            );
            T::default()
        })
    }
}

//! Best-effort HTTP sink for error records.
//!
//! The error boundary in `nodepulse-core` can forward its records to a
//! remote log endpoint. Submission failures are logged and swallowed --
//! they must never feed back into the boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// The JSON body POSTed to the report endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

/// POSTs error records to a remote endpoint, best-effort.
#[derive(Clone)]
pub struct ErrorReporter {
    http: reqwest::Client,
    endpoint: Url,
}

impl ErrorReporter {
    pub fn new(endpoint: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            endpoint,
        })
    }

    /// Submit one record. Failures are logged at debug level and
    /// otherwise ignored.
    pub async fn submit(&self, report: ErrorReport) {
        let result = self
            .http
            .post(self.endpoint.clone())
            .json(&report)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::debug!(status = %response.status(), "error report rejected");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "error report submission failed");
            }
        }
    }
}

//! Domain events raised by the camera and the header service.
//!
//! Events arrive already decoded. The ingestion layer stamps each one with a
//! job number and session id drawn from a [`JobSequence`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// An exposure-level event: `startIntegration` or `endReadout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEvent {
    pub job_num: u64,
    pub session_id: String,
    pub image_name: String,
    #[serde(default)]
    pub image_sequence_name: String,
    #[serde(default = "default_images_in_sequence")]
    pub images_in_sequence: u32,
    #[serde(default)]
    pub exposure_time: f64,
    pub timestamp: DateTime<Utc>,
}

fn default_images_in_sequence() -> u32 {
    1
}

impl ImageEvent {
    pub fn new(job_num: u64, session_id: impl Into<String>, image_name: impl Into<String>) -> Self {
        Self {
            job_num,
            session_id: session_id.into(),
            image_name: image_name.into(),
            image_sequence_name: String::new(),
            images_in_sequence: default_images_in_sequence(),
            exposure_time: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// `largeFileObjectAvailable`: the header service published a header file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObjectEvent {
    pub job_num: u64,
    pub session_id: String,
    /// Image id the header belongs to.
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub byte_size: u64,
    #[serde(default)]
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

impl FileObjectEvent {
    pub fn new(
        job_num: u64,
        session_id: impl Into<String>,
        id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            job_num,
            session_id: session_id.into(),
            id: id.into(),
            url: url.into(),
            byte_size: 0,
            checksum: String::new(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobSequence
// ---------------------------------------------------------------------------

/// Session id plus a monotonically increasing job counter.
#[derive(Debug)]
pub struct JobSequence {
    session_id: String,
    last: AtomicU64,
}

impl JobSequence {
    /// Start a fresh session with a random id.
    pub fn new_session() -> Self {
        Self::resume(Uuid::new_v4().to_string(), 0)
    }

    /// Continue a session whose last issued job number is `last_job`.
    pub fn resume(session_id: impl Into<String>, last_job: u64) -> Self {
        Self {
            session_id: session_id.into(),
            last: AtomicU64::new(last_job),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn next_job(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_job(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

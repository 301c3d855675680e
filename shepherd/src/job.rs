use std::borrow::Cow;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Identifier of a tracked job.
///
/// Queue-sourced jobs reuse the message id so that a redelivered message
/// maps onto the job it already created.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Status partition a job record lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Every partition, in lookup order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of the logical unit of work, shared by every job and
/// message that refers to the same item.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkKey(String);

impl WorkKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives the work key for a work reference.
    ///
    /// Video URLs collapse to their 11 character video id so that the
    /// `watch?v=`, `youtu.be/` and tracking-parameter variants of one video
    /// share a key. Anything else is keyed by the trimmed reference.
    pub fn derive(work_ref: &str) -> Self {
        let trimmed = work_ref.trim();
        match video_id(trimmed) {
            Some(id) => Self(id),
            None => Self(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn video_id(work_ref: &str) -> Option<String> {
    let with_scheme = if work_ref.contains("://") {
        Cow::Borrowed(work_ref)
    } else {
        Cow::Owned(format!("https://{work_ref}"))
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?;
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(host);

    let candidate = match host {
        "youtu.be" => url.path_segments()?.next()?.to_string(),
        "youtube.com" | "music.youtube.com" => url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())?,
        _ => return None,
    };

    is_video_id(&candidate).then_some(candidate)
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Checks a work reference before it is sent to the queue.
///
/// Empty references are rejected, as are video-host URLs that do not carry
/// a recognisable video id.
pub fn validate_work_ref(work_ref: &str) -> Result<(), MessageError> {
    let trimmed = work_ref.trim();
    if trimmed.is_empty() {
        return Err(MessageError::MissingWorkRef);
    }
    let looks_like_video_host = ["youtube.com", "youtu.be"]
        .iter()
        .any(|host| trimmed.contains(host));
    if looks_like_video_host && video_id(trimmed).is_none() {
        return Err(MessageError::InvalidWorkRef(trimmed.to_string()));
    }
    Ok(())
}

/// Parameters handed to the processor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Reference to the item being processed (e.g. a media URL).
    pub work_ref: String,
    /// Task-specific parameter (e.g. the phrase to count).
    pub task_param: String,
}

/// Advisory progress reported by a running processor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total_units: u32,
    pub completed_units: u32,
}

/// Durable record of one unit of tracked work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub work_key: WorkKey,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion evidence returned by the processor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    /// A freshly queued record with no attempts.
    pub fn new(
        job_id: JobId,
        work_key: WorkKey,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            work_key,
            payload,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            attempts: 0,
            lock_owner: None,
            lock_until: None,
            progress: None,
            error: None,
            completed_at: None,
            result: None,
        }
    }

    /// A lease is expired when it is missing or ends before `now`.
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.map_or(true, |until| until < now)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.lock_owner.as_deref() == Some(worker_id)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lock_owner = None;
        self.lock_until = None;
    }
}

/// Errors raised while decoding a queue message body.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message body is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message does not contain a work reference")]
    MissingWorkRef,

    #[error("work reference is not a recognised video URL: {0}")]
    InvalidWorkRef(String),
}

/// JSON body of a work-item message.
///
/// Accepts the older `youtube_url`/`phrase` field names alongside
/// `work_ref`/`task_param`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, alias = "youtube_url", skip_serializing_if = "Option::is_none")]
    pub work_ref: Option<String>,
    #[serde(default, alias = "phrase", skip_serializing_if = "Option::is_none")]
    pub task_param: Option<String>,
}

impl MessageBody {
    pub fn new(work_ref: impl Into<String>, task_param: Option<String>) -> Self {
        Self {
            work_ref: Some(work_ref.into()),
            task_param,
        }
    }

    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let parsed: MessageBody = serde_json::from_str(body)?;
        match parsed.work_ref.as_deref().map(str::trim) {
            Some(work_ref) if !work_ref.is_empty() => Ok(parsed),
            _ => Err(MessageError::MissingWorkRef),
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Builds the processor payload, falling back to the worker's default
    /// task parameter when the message carries none.
    pub fn into_payload(self, default_task_param: &str) -> Result<JobPayload, MessageError> {
        let work_ref = self
            .work_ref
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .ok_or(MessageError::MissingWorkRef)?;
        let task_param = self
            .task_param
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_task_param.to_string());
        Ok(JobPayload {
            work_ref,
            task_param,
        })
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, PutResult, UpdateVersion};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::job::{JobId, JobRecord, JobStatus, WorkKey};

/// Errors surfaced by [`JobStore`] operations.
///
/// Write failures are never swallowed: each one maps onto a variant here so
/// callers can tell a lost race ([`StoreError::Conflict`]) apart from a
/// backend outage ([`StoreError::Backend`]).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no object at {key}")]
    NotFound { key: String },

    #[error("an object already exists at {key}")]
    AlreadyExists { key: String },

    /// A conditional write was rejected because the object changed or
    /// vanished since it was read.
    #[error("conditional write rejected at {key}")]
    Conflict { key: String },

    #[error("failed to encode or decode {key}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("object store request failed for {key}")]
    Backend {
        key: String,
        #[source]
        source: object_store::Error,
    },
}

impl StoreError {
    fn from_object_store(key: &Path, err: object_store::Error) -> Self {
        let key = key.to_string();
        match err {
            object_store::Error::NotFound { .. } => StoreError::NotFound { key },
            object_store::Error::AlreadyExists { .. } => StoreError::AlreadyExists { key },
            object_store::Error::Precondition { .. } => StoreError::Conflict { key },
            source => StoreError::Backend { key, source },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Store-assigned version of an object, used for conditional writes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionToken {
    e_tag: Option<String>,
    version: Option<String>,
}

impl VersionToken {
    fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            e_tag: meta.e_tag.clone(),
            version: meta.version.clone(),
        }
    }

    fn to_update(&self) -> UpdateVersion {
        UpdateVersion {
            e_tag: self.e_tag.clone(),
            version: self.version.clone(),
        }
    }
}

impl From<PutResult> for VersionToken {
    fn from(result: PutResult) -> Self {
        Self {
            e_tag: result.e_tag,
            version: result.version,
        }
    }
}

/// A job record together with where it was read from and at which version.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredJob {
    pub record: JobRecord,
    /// Partition the copy was read from. Differs from `record.status` only
    /// for a copy left behind by an interrupted move.
    pub partition: JobStatus,
    pub version: VersionToken,
}

impl StoredJob {
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    /// True when the copy sits in the partition its status names.
    pub fn is_settled(&self) -> bool {
        self.partition == self.record.status
    }
}

/// Evidence that a work key has been processed to completion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub work_key: WorkKey,
    pub job_id: JobId,
    pub completed_at: DateTime<Utc>,
}

/// Durable job records partitioned by status on an object store.
///
/// Layout: `jobs/{status}/{job_id}` holds the JSON record and
/// `completions/{work_key}` holds a [`CompletionMarker`].
///
/// Moves between partitions are not atomic on a blob store. They are
/// ordered fence, write-new, delete-old: the source object is first
/// overwritten conditionally on the version that was read (so only one
/// concurrent mover wins), then the record is written into the target
/// partition, then the source is deleted. A crash part-way leaves a
/// duplicate, never a gap; [`JobStore::get`] prefers the newest copy and
/// [`JobStore::reconcile`] / [`JobStore::roll_forward`] clean up.
#[derive(Clone, Debug)]
pub struct JobStore {
    objects: Arc<dyn ObjectStore>,
}

impl JobStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// The underlying object store.
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn job_key(status: JobStatus, job_id: &JobId) -> Path {
        Path::from_iter(["jobs", status.as_str(), job_id.as_str()])
    }

    pub fn partition_prefix(status: JobStatus) -> Path {
        Path::from_iter(["jobs", status.as_str()])
    }

    pub fn completion_key(work_key: &WorkKey) -> Path {
        Path::from_iter(["completions", work_key.as_str()])
    }

    /// Stores a new record in its status partition, failing with
    /// [`StoreError::AlreadyExists`] if that key is taken.
    pub async fn create(&self, job: &JobRecord) -> Result<StoredJob, StoreError> {
        let key = Self::job_key(job.status, &job.job_id);
        let version = write_json(&self.objects, &key, job, PutMode::Create).await?;
        debug!(job_id = %job.job_id, status = %job.status, "job created");
        Ok(StoredJob {
            record: job.clone(),
            partition: job.status,
            version,
        })
    }

    /// Finds a job in any partition, preferring the newest copy when an
    /// interrupted move left more than one.
    pub async fn get(&self, job_id: &JobId) -> Result<Option<StoredJob>, StoreError> {
        let copies = self.locate(job_id).await?;
        if copies.len() > 1 {
            debug!(job_id = %job_id, copies = copies.len(), "job found in multiple partitions");
        }
        Ok(newest(copies))
    }

    /// Every stored copy of a job, one per partition that holds it.
    pub async fn locate(&self, job_id: &JobId) -> Result<Vec<StoredJob>, StoreError> {
        let lookups = JobStatus::ALL.map(|status| self.get_by_status(job_id, status));
        let found = futures::future::try_join_all(lookups).await?;
        Ok(found.into_iter().flatten().collect())
    }

    pub async fn get_by_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<Option<StoredJob>, StoreError> {
        let key = Self::job_key(status, job_id);
        let found = read_json::<JobRecord>(&self.objects, &key).await?;
        Ok(found.map(|(record, version)| StoredJob {
            record,
            partition: status,
            version,
        }))
    }

    /// All records in a partition, oldest update first.
    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<StoredJob>, StoreError> {
        let prefix = Self::partition_prefix(status);
        let metas: Vec<ObjectMeta> = self
            .objects
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|err| StoreError::from_object_store(&prefix, err))?;

        let mut jobs = Vec::with_capacity(metas.len());
        for meta in metas {
            // Moved or deleted between the listing and the read.
            let Some((record, version)) = read_json::<JobRecord>(&self.objects, &meta.location).await?
            else {
                continue;
            };
            jobs.push(StoredJob {
                record,
                partition: status,
                version,
            });
        }
        jobs.sort_by(|a, b| a.record.updated_at.cmp(&b.record.updated_at));
        Ok(jobs)
    }

    /// Moves a job from `from` to `to`, conditional on `expected` still
    /// being the current source copy.
    ///
    /// `updated` must already carry `status == to`. A rejected fence is
    /// reported as [`StoreError::Conflict`]: another worker moved or changed
    /// the job first.
    pub async fn move_job(
        &self,
        expected: &StoredJob,
        from: JobStatus,
        to: JobStatus,
        updated: JobRecord,
    ) -> Result<StoredJob, StoreError> {
        let source = Self::job_key(from, expected.job_id());
        if expected.partition != from || updated.status != to || updated.job_id != expected.record.job_id {
            return Err(StoreError::Conflict {
                key: source.to_string(),
            });
        }

        // Fence: only one mover can replace the version it read.
        let fenced = write_json(
            &self.objects,
            &source,
            &updated,
            PutMode::Update(expected.version.to_update()),
        )
        .await
        .map_err(|err| match err {
            StoreError::NotFound { key } => StoreError::Conflict { key },
            other => other,
        })?;

        if from == to {
            return Ok(StoredJob {
                record: updated,
                partition: to,
                version: fenced,
            });
        }

        let target = Self::job_key(to, &updated.job_id);
        let version = write_json(&self.objects, &target, &updated, PutMode::Overwrite).await?;
        self.delete_key(&source).await?;

        debug!(job_id = %updated.job_id, %from, %to, "job moved");
        Ok(StoredJob {
            record: updated,
            partition: to,
            version,
        })
    }

    /// Unconditionally writes a record into a partition.
    pub async fn save(&self, job: &JobRecord, status: JobStatus) -> Result<StoredJob, StoreError> {
        let key = Self::job_key(status, &job.job_id);
        let version = write_json(&self.objects, &key, job, PutMode::Overwrite).await?;
        Ok(StoredJob {
            record: job.clone(),
            partition: status,
            version,
        })
    }

    /// Rewrites a record in place, conditional on `expected` being current.
    pub async fn save_if(&self, expected: &StoredJob, updated: JobRecord) -> Result<StoredJob, StoreError> {
        let partition = expected.partition;
        self.move_job(expected, partition, partition, updated).await
    }

    /// Deletes a job from one partition. Deleting a missing key succeeds.
    pub async fn delete(&self, job_id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        self.delete_key(&Self::job_key(status, job_id)).await
    }

    async fn delete_key(&self, key: &Path) -> Result<(), StoreError> {
        match self.objects.delete(key).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(StoreError::from_object_store(key, err)),
        }
    }

    /// Rewrites a copy in place, conditional on it still being the version
    /// that was read. A copy that changed or vanished is a
    /// [`StoreError::Conflict`].
    async fn fence(&self, copy: &StoredJob) -> Result<VersionToken, StoreError> {
        let key = Self::job_key(copy.partition, copy.job_id());
        write_json(
            &self.objects,
            &key,
            &copy.record,
            PutMode::Update(copy.version.to_update()),
        )
        .await
        .map_err(|err| match err {
            StoreError::NotFound { key } => StoreError::Conflict { key },
            other => other,
        })
    }

    /// Finishes an interrupted move for a copy whose status disagrees with
    /// its partition, returning the copy that now stands in the right
    /// partition.
    ///
    /// Nothing is written or deleted unless `stale` is still the current
    /// source copy. A copy that changed since it was read means someone else
    /// finished the move (or moved the job on) and is reported as
    /// [`StoreError::Conflict`]. An existing target copy at least as new as
    /// `stale` is kept.
    pub async fn roll_forward(&self, stale: &StoredJob) -> Result<StoredJob, StoreError> {
        if stale.is_settled() {
            return Ok(stale.clone());
        }
        self.fence(stale).await?;

        let target = stale.record.status;
        let target_key = Self::job_key(target, stale.job_id());
        let settled = match write_json(&self.objects, &target_key, &stale.record, PutMode::Create).await {
            Ok(version) => StoredJob {
                record: stale.record.clone(),
                partition: target,
                version,
            },
            Err(StoreError::AlreadyExists { .. }) => self.keep_newer(stale, target).await?,
            Err(err) => return Err(err),
        };
        self.delete(stale.job_id(), stale.partition).await?;

        warn!(
            job_id = %stale.job_id(),
            from = %stale.partition,
            to = %target,
            "rolled forward interrupted job move"
        );
        Ok(settled)
    }

    /// Resolves a roll-forward whose target already holds a copy.
    async fn keep_newer(&self, stale: &StoredJob, target: JobStatus) -> Result<StoredJob, StoreError> {
        let Some(existing) = self.get_by_status(stale.job_id(), target).await? else {
            return Err(StoreError::Conflict {
                key: Self::job_key(target, stale.job_id()).to_string(),
            });
        };
        if existing.record.updated_at >= stale.record.updated_at {
            return Ok(existing);
        }
        self.save_if(&existing, stale.record.clone()).await
    }

    /// Collapses duplicate copies of a job down to the newest one.
    ///
    /// Each losing copy is fenced before it is deleted; one that changed
    /// since it was read is left in place.
    pub async fn reconcile(&self, job_id: &JobId) -> Result<Option<StoredJob>, StoreError> {
        let copies = self.locate(job_id).await?;
        let Some(winner) = newest(copies.clone()) else {
            return Ok(None);
        };

        for copy in copies.iter().filter(|c| c.partition != winner.partition) {
            match self.fence(copy).await {
                Ok(_) => {
                    warn!(
                        job_id = %job_id,
                        partition = %copy.partition,
                        kept = %winner.partition,
                        "removing stale job copy"
                    );
                    self.delete(job_id, copy.partition).await?;
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(job_id = %job_id, partition = %copy.partition, "stale copy changed, leaving it");
                }
                Err(err) => return Err(err),
            }
        }

        if winner.is_settled() {
            Ok(Some(winner))
        } else {
            self.roll_forward(&winner).await.map(Some)
        }
    }

    /// Records that a work key was completed. The first marker for a key is
    /// kept; later completions of the same key leave it untouched.
    pub async fn mark_completed(&self, marker: &CompletionMarker) -> Result<(), StoreError> {
        let key = Self::completion_key(&marker.work_key);
        match write_json(&self.objects, &key, marker, PutMode::Create).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(work_key = %marker.work_key, job_id = %marker.job_id, "completion marker already present");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn completion(&self, work_key: &WorkKey) -> Result<Option<CompletionMarker>, StoreError> {
        let key = Self::completion_key(work_key);
        Ok(read_json::<CompletionMarker>(&self.objects, &key)
            .await?
            .map(|(marker, _)| marker))
    }
}

/// Newest copy by `updated_at`; ties go to the copy in its own partition.
fn newest(copies: Vec<StoredJob>) -> Option<StoredJob> {
    copies.into_iter().max_by(|a, b| {
        a.record
            .updated_at
            .cmp(&b.record.updated_at)
            .then(a.is_settled().cmp(&b.is_settled()))
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    objects: &Arc<dyn ObjectStore>,
    key: &Path,
) -> Result<Option<(T, VersionToken)>, StoreError> {
    let result = match objects.get(key).await {
        Ok(result) => result,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(err) => return Err(StoreError::from_object_store(key, err)),
    };
    let version = VersionToken::from_meta(&result.meta);
    let bytes = match result.bytes().await {
        Ok(bytes) => bytes,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(err) => return Err(StoreError::from_object_store(key, err)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })?;
    Ok(Some((value, version)))
}

pub(crate) async fn write_json<T: Serialize>(
    objects: &Arc<dyn ObjectStore>,
    key: &Path,
    value: &T,
    mode: PutMode,
) -> Result<VersionToken, StoreError> {
    let body = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })?;
    let result = objects
        .put_opts(key, PutPayload::from(body), PutOptions::from(mode))
        .await
        .map_err(|err| StoreError::from_object_store(key, err))?;
    Ok(result.into())
}

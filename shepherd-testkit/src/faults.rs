use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};

/// Object store that fails chosen operations on demand.
///
/// Wraps an [`InMemory`] store. Each switch makes every matching request
/// fail with a generic backend error until it is turned off again.
#[derive(Debug)]
pub struct FaultyObjectStore {
    inner: Arc<dyn ObjectStore>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    fail_lists: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FaultyObjectStore {
    pub fn new() -> Self {
        Self::wrap(Arc::new(InMemory::new()))
    }

    pub fn wrap(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Turn every switch off.
    pub fn heal(&self) {
        for switch in [&self.fail_puts, &self.fail_gets, &self.fail_lists, &self.fail_deletes] {
            switch.store(false, Ordering::SeqCst);
        }
    }

    fn check(switch: &AtomicBool, op: &str, location: &Path) -> object_store::Result<()> {
        if switch.load(Ordering::SeqCst) {
            return Err(injected(op, location));
        }
        Ok(())
    }
}

impl Default for FaultyObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FaultyObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FaultyObjectStore({})", self.inner)
    }
}

fn injected(op: &str, location: &Path) -> object_store::Error {
    object_store::Error::Generic {
        store: "faulty",
        source: format!("injected {op} failure at {location}").into(),
    }
}

#[async_trait]
impl ObjectStore for FaultyObjectStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        Self::check(&self.fail_puts, "put", location)?;
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        Self::check(&self.fail_puts, "put", location)?;
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
        Self::check(&self.fail_gets, "get", location)?;
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        Self::check(&self.fail_deletes, "delete", location)?;
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        if self.fail_lists.load(Ordering::SeqCst) {
            let location = prefix.cloned().unwrap_or_default();
            return stream::once(async move { Err(injected("list", &location)) }).boxed();
        }
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(injected("list", &prefix.cloned().unwrap_or_default()));
        }
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        Self::check(&self.fail_puts, "copy", to)?;
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        Self::check(&self.fail_puts, "copy", to)?;
        self.inner.copy_if_not_exists(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_switches_fail_and_heal() {
        let store = FaultyObjectStore::new();
        let path = Path::from("jobs/queued/a");
        store.put(&path, PutPayload::from_static(b"{}")).await.unwrap();

        store.fail_gets(true);
        assert!(matches!(
            store.get(&path).await,
            Err(object_store::Error::Generic { store: "faulty", .. })
        ));
        store.fail_puts(true);
        assert!(store.put(&path, PutPayload::from_static(b"{}")).await.is_err());

        store.heal();
        assert!(store.get(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_list_yields_error() {
        let store = FaultyObjectStore::new();
        store.fail_lists(true);
        let first = store.list(None).next().await.unwrap();
        assert!(first.is_err());
    }
}

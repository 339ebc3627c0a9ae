//! In-process backend. Used by tests and for running the gateway without a bot.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::AsyncRead;

use crate::{
    backend::port::{read_capped, BackendError, ChatBackend, FetchedObject},
    domain::{FileHandle, MessageId},
};

#[derive(Clone, Debug)]
struct StoredObject {
    filename: String,
    data: Bytes,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<i32, StoredObject>,
    next_id: i32,
    fail_next: Option<BackendError>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    upload_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next upload or fetch fail with `err`.
    pub fn fail_next(&self, err: BackendError) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_next = Some(err);
        }
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Unreachable("memory backend poisoned".to_string()))
    }

    fn guess_type(filename: &str) -> String {
        mime_guess::from_path(filename)
            .first_or_octet_stream()
            .to_string()
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upload(
        &self,
        filename: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        max_bytes: u64,
    ) -> Result<FileHandle, BackendError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self.lock()?.fail_next.take();
        if let Some(err) = injected {
            return Err(err);
        }

        let data = read_capped(reader, max_bytes).await?;

        let mut st = self.lock()?;
        st.next_id += 1;
        let id = st.next_id;
        st.objects.insert(
            id,
            StoredObject {
                filename: filename.to_string(),
                data: Bytes::from(data),
            },
        );
        Ok(FileHandle::new(MessageId(id), filename))
    }

    async fn fetch(&self, id: MessageId) -> Result<FetchedObject, BackendError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock()?;
        if let Some(err) = st.fail_next.take() {
            return Err(err);
        }
        let obj = st.objects.get(&id.0).cloned().ok_or(BackendError::NotFound)?;

        let size = obj.data.len() as u64;
        let body = stream::iter(vec![Ok::<_, BackendError>(obj.data)]).boxed();
        Ok(FetchedObject {
            content_type: Some(Self::guess_type(&obj.filename)),
            size: Some(size),
            filename: Some(obj.filename),
            body,
        })
    }
}

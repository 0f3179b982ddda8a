//! Storage nodes served from memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::MogileError;
use crate::transfer::{ByteStream, HttpTransport, UploadBody};

#[derive(Default)]
struct HttpState {
    objects: HashMap<String, Bytes>,
    unreadable: HashSet<String>,
    mid_stream_failures: HashSet<String>,
    gets: Vec<String>,
    puts: Vec<String>,
}

/// URL-keyed object store implementing [`HttpTransport`].
///
/// Clones share state, so a test can keep a handle while the client owns
/// another.
#[derive(Clone, Default)]
pub struct MemoryHttp {
    state: Arc<Mutex<HttpState>>,
}

impl MemoryHttp {
    pub fn insert(&self, url: &str, data: &[u8]) {
        self.state
            .lock()
            .objects
            .insert(url.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn object(&self, url: &str) -> Option<Bytes> {
        self.state.lock().objects.get(url).cloned()
    }

    pub fn remove(&self, url: &str) -> Option<Bytes> {
        self.state.lock().objects.remove(url)
    }

    /// Copies the object at `from` to `to`, returning false if absent.
    pub fn copy_object(&self, from: &str, to: &str) -> bool {
        let mut state = self.state.lock();
        match state.objects.get(from).cloned() {
            Some(data) => {
                state.objects.insert(to.to_string(), data);
                true
            }
            None => false,
        }
    }

    /// Flips every bit of the byte at `offset`.
    pub fn corrupt(&self, url: &str, offset: usize) {
        let mut state = self.state.lock();
        if let Some(data) = state.objects.get_mut(url) {
            let mut bytes = data.to_vec();
            if let Some(byte) = bytes.get_mut(offset) {
                *byte = !*byte;
            }
            *data = Bytes::from(bytes);
        }
    }

    /// Makes GETs of `url` fail as if the node were down.
    pub fn make_unreadable(&self, url: &str) {
        self.state.lock().unreadable.insert(url.to_string());
    }

    /// Makes GETs of `url` yield half the body and then fail.
    pub fn fail_mid_stream(&self, url: &str) {
        self.state.lock().mid_stream_failures.insert(url.to_string());
    }

    /// URLs requested with GET so far, in order.
    pub fn gets(&self) -> Vec<String> {
        self.state.lock().gets.clone()
    }

    /// URLs written with PUT so far, in order.
    pub fn puts(&self) -> Vec<String> {
        self.state.lock().puts.clone()
    }
}

#[async_trait]
impl HttpTransport for MemoryHttp {
    async fn put(&self, url: &str, body: UploadBody, length: u64) -> Result<(), MogileError> {
        let data = match body {
            UploadBody::Bytes(bytes) => bytes,
            UploadBody::File(mut file) => {
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer).await?;
                Bytes::from(buffer)
            }
        };

        if data.len() as u64 != length {
            return Err(MogileError::Transfer {
                url: url.to_string(),
                reason: format!("body is {} bytes, Content-Length {length}", data.len()),
            });
        }

        let mut state = self.state.lock();
        state.puts.push(url.to_string());
        state.objects.insert(url.to_string(), data);
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<ByteStream, MogileError> {
        let mut state = self.state.lock();
        state.gets.push(url.to_string());

        let not_found = || MogileError::Transfer {
            url: url.to_string(),
            reason: "HTTP status 404 Not Found".to_string(),
        };
        if state.unreadable.contains(url) {
            return Err(not_found());
        }
        let data = state.objects.get(url).cloned().ok_or_else(not_found)?;

        if state.mid_stream_failures.contains(url) {
            let half = data.slice(..data.len() / 2);
            let error = MogileError::Transfer {
                url: url.to_string(),
                reason: "connection reset mid-body".to_string(),
            };
            return Ok(futures::stream::iter(vec![Ok(half), Err(error)]).boxed());
        }

        Ok(futures::stream::iter(vec![Ok(data)]).boxed())
    }
}

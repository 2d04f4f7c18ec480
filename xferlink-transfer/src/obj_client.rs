use std::{collections::HashMap, sync::Arc, thread::JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::error::{Result, TransferError};

pub type PutCallback = Box<dyn FnOnce(bool) + Send>;
pub type GetCallback = Box<dyn FnOnce(Option<Bytes>) + Send>;

/// Asynchronous object-store operations used by the OBJ backend.
///
/// `put_object` and `get_object` return immediately; the callback fires
/// exactly once, possibly on another thread, when the request finishes.
pub trait ObjectClient: Send + Sync {
    fn put_object(&self, key: &str, data: Bytes, offset: u64, callback: PutCallback);

    /// Reads up to `len` bytes starting at `offset`. The callback receives
    /// `None` when the key is missing or `offset` is past the end.
    fn get_object(&self, key: &str, offset: u64, len: u64, callback: GetCallback);

    fn object_exists(&self, key: &str) -> Result<bool>;
}

enum Job {
    Put {
        key: String,
        data: Bytes,
        offset: u64,
        callback: PutCallback,
    },
    Get {
        key: String,
        offset: u64,
        len: u64,
        callback: GetCallback,
    },
}

type ObjectMap = Arc<Mutex<HashMap<String, Bytes>>>;

/// Process-local object store served by a fixed pool of worker threads.
pub struct InMemoryObjectStore {
    objects: ObjectMap,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl InMemoryObjectStore {
    pub fn new(num_threads: usize) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let objects: ObjectMap = Arc::new(Mutex::new(HashMap::new()));
        let mut workers = Vec::with_capacity(num_threads.max(1));
        for idx in 0..num_threads.max(1) {
            let rx = rx.clone();
            let objects = Arc::clone(&objects);
            let worker = std::thread::Builder::new()
                .name(format!("xferlink-obj-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        Self::run_job(&objects, job);
                    }
                })
                .map_err(|e| TransferError::backend(format!("spawn object worker: {e}")))?;
            workers.push(worker);
        }
        Ok(Self {
            objects,
            jobs: Some(tx),
            workers,
        })
    }

    fn run_job(objects: &ObjectMap, job: Job) {
        match job {
            Job::Put {
                key,
                data,
                offset,
                callback,
            } => {
                if offset != 0 {
                    log::warn!("partial object writes are not supported: key={key}, offset={offset}");
                    callback(false);
                    return;
                }
                objects.lock().insert(key, data);
                callback(true);
            }
            Job::Get {
                key,
                offset,
                len,
                callback,
            } => {
                let object = objects.lock().get(&key).cloned();
                let slice = object.and_then(|object| {
                    let size = object.len() as u64;
                    if offset > size {
                        return None;
                    }
                    let end = offset.saturating_add(len).min(size);
                    Some(object.slice(offset as usize..end as usize))
                });
                callback(slice);
            }
        }
    }

    fn submit(&self, job: Job) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        if let Err(channel::SendError(job)) = jobs.send(job) {
            log::error!("object worker pool is gone, failing request");
            match job {
                Job::Put { callback, .. } => callback(false),
                Job::Get { callback, .. } => callback(None),
            }
        }
    }

    pub fn object_len(&self, key: &str) -> Option<usize> {
        self.objects.lock().get(key).map(Bytes::len)
    }
}

impl ObjectClient for InMemoryObjectStore {
    fn put_object(&self, key: &str, data: Bytes, offset: u64, callback: PutCallback) {
        self.submit(Job::Put {
            key: key.to_string(),
            data,
            offset,
            callback,
        });
    }

    fn get_object(&self, key: &str, offset: u64, len: u64, callback: GetCallback) {
        self.submit(Job::Get {
            key: key.to_string(),
            offset,
            len,
            callback,
        });
    }

    fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().contains_key(key))
    }
}

impl Drop for InMemoryObjectStore {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("object worker panicked");
            }
        }
    }
}

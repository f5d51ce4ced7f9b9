//! Correlated file lookups over the framed TCP channel.
//!
//! A worker asks the controller "does file X at path P exist, and what
//! is its file id?". Requests carry a monotonically increasing id; the
//! calling thread blocks on a shared response table that the endpoint's
//! receiver thread fills in, so waiters never have to drive any loop
//! themselves. "Not found" answers are cached for the life of the
//! client and never re-asked on the wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, EndpointHandler};
use crate::error::{Result, TransportError};
use crate::protocol::{packet, FileRequest, FileResponse, FILE_ID_NOT_FOUND};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// How long a caller waits for the correlated response before the
    /// lookup is abandoned as timed out.
    pub response_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a file lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLookup {
    Found {
        /// Session-scoped id the chunk channel tags this file with.
        file_id: u16,
        /// The file exists but is empty; nothing will be broadcast.
        zero_length: bool,
    },
    NotFound,
}

/// Response table shared between callers and the receiver thread.
struct Table {
    next_request_id: u32,
    /// Responses that arrived but have not been claimed by their waiter.
    completed: HashMap<u32, FileResponse>,
    /// (filename, path_id) pairs the controller reported missing.
    not_found: HashSet<(String, String)>,
    /// The endpoint died; all waits fail fast.
    dead: bool,
}

struct State {
    table: Mutex<Table>,
    response_ready: Condvar,
}

/// The [`EndpointHandler`] half of the coordinator. Create this first,
/// spawn the endpoint with it, then build the [`FileRequestClient`]
/// from both - that ordering attaches the callback atomically with
/// endpoint creation.
pub struct ResponseRouter {
    state: Arc<State>,
}

impl ResponseRouter {
    pub fn new() -> Arc<ResponseRouter> {
        Arc::new(ResponseRouter {
            state: Arc::new(State {
                table: Mutex::new(Table {
                    next_request_id: 1,
                    completed: HashMap::new(),
                    not_found: HashSet::new(),
                    dead: false,
                }),
                response_ready: Condvar::new(),
            }),
        })
    }
}

impl EndpointHandler for ResponseRouter {
    fn on_packet(&self, packet: Vec<u8>) {
        match packet.first() {
            Some(&packet::FILE_RESPONSE) => match FileResponse::parse(&packet) {
                Ok(response) => {
                    debug!(
                        "response for request {}: file_id {}",
                        response.request_id, response.file_id
                    );
                    let mut table = self.state.table.lock();
                    table.completed.insert(response.request_id, response);
                    drop(table);
                    self.state.response_ready.notify_all();
                }
                Err(e) => warn!("dropping malformed file response: {e}"),
            },
            kind => warn!("unexpected packet kind {kind:?} on request channel"),
        }
    }

    fn on_error(&self, _error: &TransportError) {
        self.state.table.lock().dead = true;
        self.state.response_ready.notify_all();
    }
}

/// Blocking file-lookup client. Cheap to share behind an `Arc`; any
/// number of threads may request concurrently.
pub struct FileRequestClient {
    endpoint: Arc<Endpoint>,
    state: Arc<State>,
    config: RequestConfig,
}

impl FileRequestClient {
    pub fn new(
        endpoint: Arc<Endpoint>,
        router: &Arc<ResponseRouter>,
        config: RequestConfig,
    ) -> FileRequestClient {
        FileRequestClient {
            endpoint,
            state: router.state.clone(),
            config,
        }
    }

    /// Ask the controller for `filename` under `path_id` and block until
    /// the correlated response arrives. A cached "not found" answers
    /// immediately without touching the wire.
    pub fn request_file(&self, filename: &str, path_id: &str) -> Result<FileLookup> {
        let key = (filename.to_string(), path_id.to_string());

        let request_id = {
            let mut table = self.state.table.lock();
            if table.not_found.contains(&key) {
                debug!("cache hit: {filename} ({path_id}) is known missing");
                return Ok(FileLookup::NotFound);
            }
            let id = table.next_request_id;
            table.next_request_id += 1;
            id
        };

        let request = FileRequest {
            request_id,
            filename: filename.to_string(),
            path_id: path_id.to_string(),
        };
        self.endpoint.send(&request.encode())?;

        let response = self.wait_for_response(request_id)?;
        if response.file_id == FILE_ID_NOT_FOUND {
            self.state.table.lock().not_found.insert(key);
            return Ok(FileLookup::NotFound);
        }
        if response.file_id < 0 || response.file_id > u16::MAX as i32 {
            return Err(TransportError::Protocol(format!(
                "controller assigned unrepresentable file id {}",
                response.file_id
            )));
        }
        Ok(FileLookup::Found {
            file_id: response.file_id as u16,
            zero_length: response.zero_length,
        })
    }

    fn wait_for_response(&self, request_id: u32) -> Result<FileResponse> {
        let deadline = Instant::now() + self.config.response_timeout;
        let mut table = self.state.table.lock();
        loop {
            if let Some(response) = table.completed.remove(&request_id) {
                return Ok(response);
            }
            if table.dead {
                return Err(TransportError::EndpointClosed);
            }
            if self
                .state
                .response_ready
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                return Err(TransportError::ConnectionTimedOut);
            }
        }
    }
}

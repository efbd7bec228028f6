//! External-process transfer strategy.
//!
//! Each worker runs its own copy of a configured agent program and talks to
//! it with one JSON object per line over the child's stdin and stdout:
//!
//! ```text
//! > {"event":"init","operation":"download","concurrent":true,"concurrenttransfers":8}
//! < {}
//! > {"event":"download","oid":"...","size":12,"action":{"href":"..."}}
//! < {"event":"progress","oid":"...","bytesSoFar":6,"bytesSinceLast":6}
//! < {"event":"complete","oid":"...","path":"/tmp/agent/..."}
//! > {"event":"terminate"}
//! ```
//!
//! Downloaded files are hash-checked before they are moved into place, so an
//! agent is never trusted blindly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::adapter::{Direction, TransferImpl};
use crate::config::CustomAdapterConfig;
use crate::gate::AuthSignal;
use crate::http::HttpClient;
use crate::progress::ProgressCallback;
use crate::storage;
use crate::{Error, Link, ObjectRef, Oid, Result};

/// How long an agent gets to exit after `terminate` before it is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum Request<'a> {
    Init {
        operation: &'static str,
        concurrent: bool,
        concurrenttransfers: usize,
    },
    Download {
        oid: String,
        size: u64,
        action: &'a Link,
    },
    Upload {
        oid: String,
        size: u64,
        path: &'a Path,
        action: &'a Link,
    },
    Terminate,
}

/// Every reply shape the agent may send, distinguished by `event`.
#[derive(Debug, Default, Deserialize)]
struct Response {
    #[serde(default)]
    event: String,
    #[serde(default)]
    oid: String,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default, rename = "bytesSoFar")]
    bytes_so_far: u64,
    #[serde(default, rename = "bytesSinceLast")]
    bytes_since_last: usize,
    #[serde(default)]
    error: Option<AgentError>,
}

#[derive(Debug, Deserialize)]
struct AgentError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Strategy that delegates each object to an external agent process.
pub struct CustomTransfer {
    config: CustomAdapterConfig,
    direction: Direction,
    http: HttpClient,
    requested_concurrency: AtomicUsize,
}

/// A running agent owned by one worker.
pub struct AgentProcess {
    worker: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<()>>,
}

impl CustomTransfer {
    /// `http` is only used for the upload verify call.
    pub fn new(config: CustomAdapterConfig, direction: Direction, http: HttpClient) -> Self {
        CustomTransfer {
            config,
            direction,
            http,
            requested_concurrency: AtomicUsize::new(1),
        }
    }

    pub fn config(&self) -> &CustomAdapterConfig {
        &self.config
    }

    fn spawn(&self, worker: usize) -> Result<AgentProcess> {
        tracing::debug!(
            "xfer: starting up custom transfer process {:?} for worker {}",
            self.config.name,
            worker
        );
        let mut child = Command::new(&self.config.path)
            .args(self.config.args.split_whitespace())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "failed to start custom transfer command {:?}: {}",
                    self.config.path, e
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take().map(|stderr| {
            let process = process_name(&self.config.path);
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => tracing::debug!("xfer[{}]: {}", process, line.trim_end()),
                        Err(_) => break,
                    }
                }
            })
        });

        let Some(stdout) = stdout else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Process(format!(
                "no stdout for custom transfer command {:?}",
                self.config.path
            )));
        };

        Ok(AgentProcess {
            worker,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
        })
    }

    fn transfer(
        &self,
        agent: &mut AgentProcess,
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        let link = object
            .link()
            .ok_or_else(|| Error::NotFound(format!("object {} not found on the server", object.oid())))?;
        let oid = object.oid().to_hex();

        let req = match self.direction {
            Direction::Download => Request::Download {
                oid: oid.clone(),
                size: object.size(),
                action: link,
            },
            Direction::Upload => Request::Upload {
                oid: oid.clone(),
                size: object.size(),
                path: object.path(),
                action: link,
            },
        };
        agent.send(&req)?;

        // Progress replies until one completion. A failed progress callback
        // fails the object only once its completion has been read, so the
        // next request starts on a clean stream.
        let mut aborted = None;
        loop {
            let resp = agent.receive()?;
            match resp.event.as_str() {
                "progress" => {
                    check_oid(&resp, &oid)?;
                    if let (Some(cb), None) = (progress, &aborted) {
                        if let Err(e) = cb(object.name(), object.size(), resp.bytes_so_far, resp.bytes_since_last) {
                            aborted = Some(e);
                        }
                    }
                    if resp.bytes_so_far > 0 {
                        auth.signal();
                    }
                }
                "complete" => {
                    check_oid(&resp, &oid)?;
                    if let Some(err) = aborted {
                        return Err(err);
                    }
                    if let Some(err) = resp.error {
                        return Err(Error::Process(format!("error transferring {oid:?}: {err}")));
                    }
                    auth.signal();
                    return match self.direction {
                        Direction::Download => publish(object, resp.path.as_deref()),
                        Direction::Upload => match object.verify_link() {
                            Some(verify) => self.http.verify_upload(verify, object),
                            None => Ok(()),
                        },
                    };
                }
                other => {
                    return Err(Error::Process(format!(
                        "invalid message {:?} from custom adapter {:?}",
                        other, self.config.name
                    )))
                }
            }
        }
    }
}

impl TransferImpl for CustomTransfer {
    type Context = AgentProcess;

    fn worker_count(&self, max_concurrency: usize) -> usize {
        self.requested_concurrency.store(max_concurrency, Ordering::SeqCst);
        if self.config.concurrent {
            max_concurrency
        } else {
            1
        }
    }

    fn worker_starting(&self, worker: usize) -> Result<AgentProcess> {
        let mut agent = self.spawn(worker)?;
        let init = Request::Init {
            operation: self.direction.as_str(),
            concurrent: self.config.concurrent,
            concurrenttransfers: self.requested_concurrency.load(Ordering::SeqCst),
        };
        let resp = agent.send(&init).and_then(|()| agent.receive());
        match resp {
            Ok(Response { error: None, .. }) => {
                tracing::debug!(
                    "xfer: started custom adapter process {:?} for worker {} OK",
                    self.config.path,
                    worker
                );
                Ok(agent)
            }
            Ok(Response { error: Some(err), .. }) => {
                agent.abort();
                Err(Error::Process(format!(
                    "error initializing custom adapter {:?} worker {}: {}",
                    self.config.name, worker, err
                )))
            }
            Err(e) => {
                agent.abort();
                Err(e)
            }
        }
    }

    fn worker_ending(&self, _worker: usize, mut agent: AgentProcess) {
        if let Err(e) = agent.shutdown() {
            tracing::debug!(
                "xfer: error finishing up custom transfer process {:?} worker {}, aborting: {}",
                self.config.path,
                agent.worker,
                e
            );
            agent.abort();
        }
    }

    fn do_transfer(
        &self,
        agent: &mut AgentProcess,
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        self.transfer(agent, object, progress, auth)
    }
}

impl AgentProcess {
    fn send(&mut self, req: &Request<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(req)?;
        tracing::trace!(
            "xfer: custom adapter worker {} sending message: {}",
            self.worker,
            String::from_utf8_lossy(&line)
        );
        line.push(b'\n');
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Process("custom transfer process stdin is closed".into()))?;
        stdin.write_all(&line)?;
        stdin.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Response> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(Error::Process(format!(
                "custom transfer process for worker {} exited unexpectedly",
                self.worker
            )));
        }
        tracing::trace!(
            "xfer: custom adapter worker {} received response: {}",
            self.worker,
            line.trim()
        );
        Ok(serde_json::from_str(&line)?)
    }

    /// Ask the agent to exit and wait for it.
    fn shutdown(&mut self) -> Result<()> {
        tracing::debug!("xfer: shutting down adapter worker {}", self.worker);
        let sent = self.send(&Request::Terminate);
        // Closing stdin also tells the agent there is nothing more to come.
        self.stdin.take();
        sent?;

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.join_stderr();
                if !status.success() {
                    tracing::debug!("xfer: worker {} process exited with {}", self.worker, status);
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Process(format!(
                    "timeout while shutting down worker process {}",
                    self.worker
                )));
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }

    fn abort(&mut self) {
        tracing::debug!("xfer: aborting worker process: {}", self.worker);
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_stderr();
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr.take() {
            let _ = handle.join();
        }
    }
}

fn check_oid(resp: &Response, expected: &str) -> Result<()> {
    if resp.oid != expected {
        return Err(Error::Process(format!(
            "unexpected oid {:?} in response, expecting {:?}",
            resp.oid, expected
        )));
    }
    Ok(())
}

/// Check an agent-downloaded file against its OID and move it into place.
fn publish(object: &ObjectRef, path: Option<&Path>) -> Result<()> {
    let path = path.ok_or_else(|| {
        Error::Process(format!("no path in completion message for {}", object.oid()))
    })?;
    let actual = Oid::from_file(path)?;
    if &actual != object.oid() {
        return Err(Error::Integrity {
            expected: object.oid().to_hex(),
            actual: actual.to_hex(),
            written: fs::metadata(path)?.len(),
        });
    }
    storage::rename_copy_permissions(path, object.path())
}

fn process_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

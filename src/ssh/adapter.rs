//! Transfer strategy that moves objects over a pooled SSH [`Session`].

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::Arc;

use super::session::Session;
use crate::adapter::{Direction, TransferImpl};
use crate::gate::AuthSignal;
use crate::manifest::{adapter_constructor, Manifest};
use crate::oid::HashingReader;
use crate::progress::{self, CallbackReader, ProgressCallback};
use crate::storage::{self, ObjectStore};
use crate::{Error, ObjectRef, Result};

pub const SSH_ADAPTER_NAME: &str = "ssh";

/// Bytes of an error payload kept for the error message.
const ERROR_BODY_LIMIT: u64 = 1024;

/// Register the `ssh` adapter for both directions.
pub fn register(manifest: &Manifest, session: Arc<Session>, store: ObjectStore) {
    for direction in [Direction::Download, Direction::Upload] {
        let (session, store) = (session.clone(), store.clone());
        manifest.register_adapter_constructor(
            SSH_ADAPTER_NAME,
            direction,
            adapter_constructor(move |dir| SshTransfer::new(session.clone(), dir, store.clone())),
        );
    }
}

/// Worker `n` uses connection `n` of the session.
pub struct SshTransfer {
    session: Arc<Session>,
    direction: Direction,
    store: ObjectStore,
}

impl SshTransfer {
    pub fn new(session: Arc<Session>, direction: Direction, store: ObjectStore) -> Self {
        SshTransfer {
            session,
            direction,
            store,
        }
    }

    fn download(&self, worker: usize, object: &ObjectRef, progress: Option<&ProgressCallback>) -> Result<()> {
        let args = transfer_arguments(object, Direction::Download)?;
        let oid = object.oid();

        // Reserve a unique scratch file; it is removed unless published.
        let mut tmp = tempfile::Builder::new()
            .prefix(&oid.to_hex())
            .tempfile_in(self.store.incomplete_dir()?)?;

        let conn = self.session.connection(worker)?;
        let command = format!("get-object {oid}");
        let context = |e: Error| with_context(e, conn.id(), &command);
        let written = {
            let mut channel = conn.lock()?;
            channel.send_message(&command, &args).map_err(context)?;
            let (status, args, mut data) = channel.read_status_with_data().map_err(context)?;
            let received = if (200..=299).contains(&status) {
                receive_object(&mut data, &args, tmp.as_file_mut(), object, progress)
            } else {
                let mut text = String::new();
                let _ = (&mut data).take(ERROR_BODY_LIMIT).read_to_string(&mut text);
                Err(Error::retriable(Error::ServerError {
                    code: status,
                    message: format!("got status {status} when fetching OID {oid}: {text}"),
                }))
            };
            // The next response on this connection starts after the flush.
            let drained = data.drain();
            let written = received.map_err(context)?;
            drained.map_err(context)?;
            written
        };
        tracing::trace!("xfer: downloaded {} bytes of {} over SSH", written, oid);

        let tmp = tmp.into_temp_path();
        match storage::rename_copy_permissions(&tmp, object.path()) {
            // Another process may have published it first.
            Err(_) if object.path().exists() => Ok(()),
            result => result,
        }
    }

    fn upload(&self, worker: usize, object: &ObjectRef, progress: Option<&ProgressCallback>) -> Result<()> {
        let args = transfer_arguments(object, Direction::Upload)?;
        let oid = object.oid();
        let file = File::open(object.path()).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("SSH upload of {}: {}", object.path().display(), e),
            ))
        })?;
        let mut body = CallbackReader::new(
            BufReader::new(file),
            object.size(),
            progress::object_callback(progress, object, 0),
        );

        let conn = self.session.connection(worker)?;
        let command = format!("put-object {oid}");
        let context = |e: Error| with_context(e, conn.id(), &command);
        let mut channel = conn.lock()?;
        channel
            .send_message_with_data(&command, &args, &mut body)
            .map_err(context)?;
        let (status, _, lines) = channel.read_status_with_lines().map_err(context)?;
        if !(200..=299).contains(&status) {
            // 403 most likely means the upload token expired.
            if status == 403 || status == 429 {
                return Err(Error::retriable(Error::ServerError {
                    code: status,
                    message: format!("got status {status} when uploading OID {oid}"),
                }));
            }
            return Err(Error::ServerError {
                code: status,
                message: status_message(status, "uploading", oid, &lines),
            });
        }

        let command = format!("verify-object {oid}");
        let context = |e: Error| with_context(e, conn.id(), &command);
        channel.send_message(&command, &args).map_err(context)?;
        let (status, _, lines) = channel.read_status_with_lines().map_err(context)?;
        if !(200..=299).contains(&status) {
            return Err(Error::ServerError {
                code: status,
                message: status_message(status, "verifying upload", oid, &lines),
            });
        }
        Ok(())
    }
}

/// Stream a successful `get-object` payload into `out`, checking its size
/// argument and hash. Leaves whatever it did not read in `data`.
fn receive_object(
    data: &mut dyn Read,
    args: &[String],
    out: &mut File,
    object: &ObjectRef,
    progress: Option<&ProgressCallback>,
) -> Result<u64> {
    parse_size(args)?;
    let mut body = HashingReader::new(data);
    let written = progress::copy_with_callback(
        out,
        &mut body,
        object.size(),
        progress::object_callback(progress, object, 0),
    )?;
    let actual = body.finish();
    if &actual != object.oid() {
        return Err(Error::Integrity {
            expected: object.oid().to_hex(),
            actual: actual.to_hex(),
            written,
        });
    }
    Ok(written)
}

/// Name the connection and request in a protocol error.
fn with_context(err: Error, connection: usize, command: &str) -> Error {
    match err {
        Error::Protocol(message) => {
            Error::Protocol(format!("pure SSH connection (#{connection}) {command}: {message}"))
        }
        Error::Retriable(inner) => Error::Retriable(Box::new(with_context(*inner, connection, command))),
        Error::RetriableLater { inner, after } => Error::RetriableLater {
            inner: Box::new(with_context(*inner, connection, command)),
            after,
        },
        other => other,
    }
}

impl TransferImpl for SshTransfer {
    type Context = usize;

    fn worker_starting(&self, worker: usize) -> Result<usize> {
        // A missing connection surfaces again on the worker's first job.
        if let Err(e) = self.session.set_connection_count_at_least(worker + 1) {
            tracing::debug!("xfer: could not add SSH connection for worker {}: {}", worker, e);
        }
        Ok(worker)
    }

    fn do_transfer(
        &self,
        worker: &mut usize,
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        // The SSH connection is already authenticated.
        auth.signal();
        match self.direction {
            Direction::Download => self.download(*worker, object, progress),
            Direction::Upload => self.upload(*worker, object, progress),
        }
    }
}

/// `size=`, `id=` and `token=` arguments for an object's action.
fn transfer_arguments(object: &ObjectRef, direction: Direction) -> Result<Vec<String>> {
    let link = object
        .link()
        .ok_or_else(|| Error::NotFound(format!("no {} action for object: {}", direction, object.oid())))?;
    let mut args = vec![format!("size={}", object.size())];
    if let Some(id) = link.id.as_deref().filter(|id| !id.is_empty()) {
        args.push(format!("id={id}"));
    }
    if let Some(token) = link.token.as_deref().filter(|token| !token.is_empty()) {
        args.push(format!("token={token}"));
    }
    Ok(args)
}

/// The single `size=` argument of a response.
fn parse_size(args: &[String]) -> Result<u64> {
    let mut size = None;
    for value in args.iter().filter_map(|arg| arg.strip_prefix("size=")) {
        if size.is_some() {
            return Err(Error::protocol("unexpected size argument"));
        }
        size = Some(
            value
                .parse::<u64>()
                .map_err(|_| Error::protocol(format!("expected valid size, got {value:?}")))?,
        );
    }
    size.ok_or_else(|| Error::protocol("no size argument seen"))
}

fn status_message(status: u16, action: &str, oid: &crate::Oid, lines: &[String]) -> String {
    match lines.first() {
        Some(line) => format!("got status {status} when {action} OID {oid}: {line}"),
        None => format!("got status {status} when {action} OID {oid}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Link, Oid};

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size(&["size=12".to_string()]).unwrap(), 12);
        assert!(parse_size(&[]).unwrap_err().is_protocol());
        assert!(parse_size(&["size=-1".to_string()]).unwrap_err().is_protocol());
        assert!(parse_size(&["size=1".to_string(), "size=1".to_string()])
            .unwrap_err()
            .is_protocol());
    }

    #[test]
    fn test_protocol_errors_name_connection_and_request() {
        let err = with_context(
            Error::retriable(Error::protocol("no status seen")),
            3,
            "get-object abc",
        );
        assert!(err.is_retriable());
        assert_eq!(
            err.to_string(),
            "protocol error: pure SSH connection (#3) get-object abc: no status seen (retriable)"
        );
        assert!(matches!(
            with_context(Error::AuthRequired, 3, "get-object abc"),
            Error::AuthRequired
        ));
    }

    #[test]
    fn test_transfer_arguments() {
        let mut link = Link::new("ssh://example.com/repo");
        link.id = Some("abc".into());
        link.token = Some(String::new());
        let object = ObjectRef::new("a", Oid::from_content(b"a"), 1, "a").with_link(link);
        assert_eq!(
            transfer_arguments(&object, Direction::Upload).unwrap(),
            vec!["size=1", "id=abc"]
        );

        let bare = ObjectRef::new("a", Oid::from_content(b"a"), 1, "a");
        assert!(matches!(
            transfer_arguments(&bare, Direction::Download),
            Err(Error::NotFound(_))
        ));
    }
}

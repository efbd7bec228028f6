//! The `basic` upload strategy: one HTTP PUT per object.

use std::fs::File;
use std::io::{self, BufReader};

use crate::adapter::TransferImpl;
use crate::gate::AuthSignal;
use crate::http::{self, HttpClient};
use crate::progress::{self, CallbackReader, ProgressCallback, StartCallbackReader};
use crate::{Error, ObjectRef, Result};

/// Uploads object content with a single PUT to the object's link.
#[derive(Clone)]
pub struct BasicUpload {
    http: HttpClient,
}

impl BasicUpload {
    pub fn new(http: HttpClient) -> Self {
        BasicUpload { http }
    }

    fn upload(
        &self,
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        let link = object
            .link()
            .ok_or_else(|| Error::NotFound(format!("no upload action for {}", object.oid())))?;

        let mut req = self.http.request("PUT", link)?;
        if link.header("Content-Type").is_none() {
            req = req.set("Content-Type", "application/octet-stream");
        }
        let chunked = link
            .header("Transfer-Encoding")
            .map_or(false, |v| v.eq_ignore_ascii_case("chunked"));
        if !chunked {
            req = req.set("Content-Length", &object.size().to_string());
        }

        let file = File::open(object.path()).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("cannot open {} for upload: {}", object.path().display(), e),
            ))
        })?;

        // Authentication has gone through once the server starts reading
        // the body, so release the other workers then.
        let body = StartCallbackReader::new(
            CallbackReader::new(
                BufReader::new(file),
                object.size(),
                progress::object_callback(progress, object, 0),
            ),
            || auth.signal(),
        );

        let response = match req.send(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(403, response)) => {
                let _ = response.into_string();
                return Err(Error::retriable(Error::AuthRequired));
            }
            Err(ureq::Error::Status(429, response)) => {
                return Err(http::too_many_requests("PUT", link, response));
            }
            Err(ureq::Error::Status(code, response)) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unknown error".into());
                return Err(Error::ServerError {
                    code,
                    message: format!("{}: {}", http::describe("PUT", link), message.trim()),
                });
            }
            Err(ureq::Error::Transport(t)) => {
                return Err(Error::retriable(Error::Http(format!(
                    "{}: {}",
                    http::describe("PUT", link),
                    t
                ))));
            }
        };

        if response.status() > 299 {
            return Err(Error::ServerError {
                code: response.status(),
                message: http::describe("PUT", link),
            });
        }
        // Drain so the connection can be reused.
        let mut reader = response.into_reader();
        io::copy(&mut reader, &mut io::sink())?;

        // Empty bodies never trigger a read.
        auth.signal();

        match object.verify_link() {
            Some(verify) => self.http.verify_upload(verify, object),
            None => Ok(()),
        }
    }
}

impl TransferImpl for BasicUpload {
    type Context = ();

    fn worker_starting(&self, _worker: usize) -> Result<()> {
        Ok(())
    }

    fn do_transfer(
        &self,
        _ctx: &mut (),
        object: &ObjectRef,
        progress: Option<&ProgressCallback>,
        auth: &mut AuthSignal<'_>,
    ) -> Result<()> {
        self.upload(object, progress, auth)
    }
}

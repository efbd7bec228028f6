//! Progress reporting while object content streams.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::{Error, ObjectRef, Result};

/// Receives `(name, total_size, read_so_far, read_since_last)` while an
/// object streams. Returning an error aborts the current transfer.
pub type ProgressCallback = Arc<dyn Fn(&str, u64, u64, usize) -> Result<()> + Send + Sync>;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Reader that reports every read to a callback.
pub struct CallbackReader<R, F> {
    inner: R,
    total: u64,
    read_so_far: u64,
    callback: F,
}

impl<R, F> CallbackReader<R, F>
where
    R: Read,
    F: FnMut(u64, u64, usize) -> Result<()>,
{
    pub fn new(inner: R, total: u64, callback: F) -> Self {
        CallbackReader {
            inner,
            total,
            read_so_far: 0,
            callback,
        }
    }
}

impl<R, F> Read for CallbackReader<R, F>
where
    R: Read,
    F: FnMut(u64, u64, usize) -> Result<()>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.read_so_far += n as u64;
            (self.callback)(self.total, self.read_so_far, n).map_err(Error::into_io)?;
        }
        Ok(n)
    }
}

/// Reader that runs a hook once, just before the first read.
pub(crate) struct StartCallbackReader<R, F> {
    inner: R,
    hook: Option<F>,
}

impl<R: Read, F: FnOnce()> StartCallbackReader<R, F> {
    pub(crate) fn new(inner: R, hook: F) -> Self {
        StartCallbackReader {
            inner,
            hook: Some(hook),
        }
    }
}

impl<R: Read, F: FnOnce()> Read for StartCallbackReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(hook) = self.hook.take() {
            hook();
        }
        self.inner.read(buf)
    }
}

/// Copy `reader` into `writer`, reporting progress after each chunk.
///
/// Returns the number of bytes copied.
pub fn copy_with_callback<R, W, F>(writer: &mut W, reader: &mut R, total: u64, mut callback: F) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64, u64, usize) -> Result<()>,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from_io(e)),
        };
        writer.write_all(&buf[..n])?;
        written += n as u64;
        callback(total, written, n)?;
    }
    Ok(written)
}

/// Report `num_bytes` as already transferred, e.g. the resumed part of a
/// partial download.
pub(crate) fn advance_progress(callback: Option<&ProgressCallback>, object: &ObjectRef, num_bytes: u64) -> Result<()> {
    let Some(cb) = callback else {
        return Ok(());
    };
    let mut read = 0u64;
    while read < num_bytes {
        let step = (num_bytes - read).min(usize::MAX as u64);
        read += step;
        cb(object.name(), object.size(), read, step as usize)?;
    }
    Ok(())
}

/// Bind a progress callback to one object, offsetting `read_so_far` by
/// `from_byte`.
pub(crate) fn object_callback<'a>(
    callback: Option<&'a ProgressCallback>,
    object: &'a ObjectRef,
    from_byte: u64,
) -> impl FnMut(u64, u64, usize) -> Result<()> + 'a {
    move |total, read_so_far, since_last| match callback {
        Some(cb) => cb(object.name(), total, read_so_far + from_byte, since_last),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Oid;
    use parking_lot::Mutex;

    #[test]
    fn test_copy_reports_progress() {
        let data = vec![7u8; COPY_BUFFER_SIZE + 10];
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let n = copy_with_callback(&mut out, &mut &data[..], data.len() as u64, |total, so_far, last| {
            seen.push((total, so_far, last));
            Ok(())
        })
        .unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(seen.last().unwrap().1, data.len() as u64);
        assert!(seen.iter().all(|(total, _, _)| *total == data.len() as u64));
    }

    #[test]
    fn test_callback_error_aborts_read() {
        let mut reader = CallbackReader::new(&b"abc"[..], 3, |_, _, _| Err(Error::AuthRequired));
        let mut buf = [0u8; 3];
        let err = reader.read(&mut buf).unwrap_err();
        assert!(matches!(Error::from_io(err), Error::AuthRequired));
    }

    #[test]
    fn test_start_callback_runs_once() {
        let mut count = 0;
        {
            let mut reader = StartCallbackReader::new(&b"abcdef"[..], || count += 1);
            let mut buf = [0u8; 2];
            reader.read(&mut buf).unwrap();
            reader.read(&mut buf).unwrap();
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_advance_progress_offsets() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let cb: ProgressCallback = Arc::new(move |name, total, so_far, last| {
            sink.lock().push((name.to_string(), total, so_far, last));
            Ok(())
        });
        let object = ObjectRef::new("big.bin", Oid::from_content(b"x"), 100, "big.bin");

        advance_progress(Some(&cb), &object, 40).unwrap();
        let mut bound = object_callback(Some(&cb), &object, 40);
        bound(100, 10, 10).unwrap();

        let calls = calls.lock();
        assert_eq!(calls[0], ("big.bin".to_string(), 100, 40, 40));
        assert_eq!(calls[1], ("big.bin".to_string(), 100, 50, 10));
    }
}

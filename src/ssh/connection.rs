//! One `git-lfs-transfer` sub-process and the message layer on top of its
//! pktline stream.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use super::pktline::{DataReader, Packet, Pktline};
use crate::{Error, Result};

const DATA_CHUNK_SIZE: usize = 32 * 1024;

pub type ChildReader = BufReader<ChildStdout>;
pub type ChildWriter = BufWriter<ChildStdin>;

/// Request/response messages over a pktline stream.
///
/// A message is a command line, optional argument lines and either a flush,
/// or a delimiter followed by text lines or binary data and then a flush.
/// Responses start with `status <code>`.
pub struct Channel<R, W> {
    pktline: Pktline<R, W>,
}

impl<R: BufRead, W: Write> Channel<R, W> {
    pub fn new(pktline: Pktline<R, W>) -> Self {
        Channel { pktline }
    }

    /// Agree on protocol version 1.
    pub fn negotiate_version(&mut self) -> Result<()> {
        let caps = self.pktline.read_packet_list().map_err(|e| {
            Error::protocol(format!(
                "unable to negotiate version with remote side (unable to read capabilities): {e}"
            ))
        })?;
        if !caps.iter().any(|cap| cap == "version=1") {
            return Err(Error::protocol(
                "unable to negotiate version with remote side (missing version=1)",
            ));
        }
        self.send_message("version 1", &[]).map_err(|e| {
            Error::protocol(format!(
                "unable to negotiate version with remote side (unable to send version): {e}"
            ))
        })?;
        let (status, args, _) = self.read_status_with_lines().map_err(|e| {
            Error::protocol(format!(
                "unable to negotiate version with remote side (unable to read status): {e}"
            ))
        })?;
        if status != 200 {
            let text = match args.first() {
                Some(arg) => format!("server said: {arg:?}"),
                None => "no error provided".to_string(),
            };
            return Err(Error::protocol(format!(
                "unable to negotiate version with remote side (unexpected status {status}; {text})"
            )));
        }
        Ok(())
    }

    fn write_command(&mut self, command: &str, args: &[String]) -> Result<()> {
        self.pktline.write_packet_text(command)?;
        for arg in args {
            self.pktline.write_packet_text(arg)?;
        }
        Ok(())
    }

    pub fn send_message(&mut self, command: &str, args: &[String]) -> Result<()> {
        self.write_command(command, args)?;
        self.pktline.write_flush()
    }

    pub fn send_message_with_lines(&mut self, command: &str, args: &[String], lines: &[String]) -> Result<()> {
        self.write_command(command, args)?;
        self.pktline.write_delim()?;
        for line in lines {
            self.pktline.write_packet_text(line)?;
        }
        self.pktline.write_flush()
    }

    /// Send a message whose payload is everything `data` yields.
    pub fn send_message_with_data(&mut self, command: &str, args: &[String], data: &mut dyn Read) -> Result<()> {
        self.write_command(command, args)?;
        self.pktline.write_delim()?;
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e)),
            };
            self.pktline.write_packet(&buf[..n])?;
        }
        self.pktline.write_flush()
    }

    /// Read a response made of just a status line.
    pub fn read_status(&mut self) -> Result<u16> {
        let mut status = None;
        loop {
            match self.read_packet()? {
                Packet::Flush => return status.ok_or_else(|| Error::protocol("no status seen")),
                packet => {
                    let text = packet.into_text().unwrap_or_default();
                    if status.is_some() {
                        return Err(Error::protocol(format!("unexpected data, got {text:?}")));
                    }
                    status = Some(parse_status(&text)?);
                }
            }
        }
    }

    /// Read a status, its arguments and the text lines after a delimiter.
    pub fn read_status_with_lines(&mut self) -> Result<(u16, Vec<String>, Vec<String>)> {
        let mut status = None;
        let mut args = Vec::new();
        let mut lines = Vec::new();
        let mut seen_delim = false;
        loop {
            let packet = self.read_packet()?;
            match (packet, status) {
                (Packet::Flush, None) => return Err(Error::protocol("no status seen")),
                (Packet::Flush, Some(status)) => return Ok((status, args, lines)),
                (Packet::Delim, None) => return Err(Error::protocol("expected status line, got delimiter")),
                (Packet::Delim, Some(_)) if seen_delim => {
                    return Err(Error::protocol("unexpected delimiter packet"))
                }
                (Packet::Delim, Some(_)) => seen_delim = true,
                (packet, None) => status = Some(parse_status(&packet.into_text().unwrap_or_default())?),
                (packet, Some(_)) => {
                    let text = packet.into_text().unwrap_or_default();
                    if seen_delim {
                        lines.push(text);
                    } else {
                        args.push(text);
                    }
                }
            }
        }
    }

    /// Read a status and its arguments, then hand back the binary payload.
    ///
    /// The reader must be drained before the channel is used again.
    pub fn read_status_with_data(&mut self) -> Result<(u16, Vec<String>, DataReader<'_, R, W>)> {
        let mut status = None;
        let mut args = Vec::new();
        loop {
            match (self.read_packet()?, status) {
                (Packet::Flush, None) => return Err(Error::protocol("no status seen")),
                (Packet::Flush, Some(_)) => return Err(Error::protocol("unexpected flush packet")),
                (Packet::Delim, None) => return Err(Error::protocol("expected status line, got delimiter")),
                (Packet::Delim, Some(status)) => return Ok((status, args, self.pktline.data_reader())),
                (packet, None) => status = Some(parse_status(&packet.into_text().unwrap_or_default())?),
                (packet, Some(_)) => args.extend(packet.into_text()),
            }
        }
    }

    fn read_packet(&mut self) -> Result<Packet> {
        self.pktline
            .read_packet()
            .map_err(|e| Error::protocol(format!("error reading packet: {e}")))
    }

    pub fn into_inner(self) -> Pktline<R, W> {
        self.pktline
    }
}

fn parse_status(line: &str) -> Result<u16> {
    line.strip_prefix("status ")
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::protocol(format!("expected status line, got {line:?}")))
}

/// A started transfer sub-process.
///
/// The channel lock serializes whole request/response exchanges; hold the
/// guard from [`lock`](Connection::lock) across the send and the read.
pub struct Connection {
    id: usize,
    channel: Mutex<Option<Channel<ChildReader, ChildWriter>>>,
    process: Mutex<Option<Process>>,
}

struct Process {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl Process {
    /// Wait for the child and return whatever it wrote to stderr.
    fn wait(mut self) -> String {
        if let Err(e) = self.child.wait() {
            tracing::debug!("failed to wait for transfer process: {}", e);
        }
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Connection {
    /// Spawn `program` and negotiate the protocol version with it.
    pub fn start(id: usize, program: &str, args: &[String], trace_packets: bool) -> Result<Connection> {
        tracing::debug!("spawning pure SSH connection (#{})", id);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to start {program:?}: {e}")))?;

        let stderr = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });
        let mut process = Process { child, stderr };

        let (Some(stdout), Some(stdin)) = (process.child.stdout.take(), process.child.stdin.take()) else {
            let _ = process.child.kill();
            process.wait();
            return Err(Error::Process(format!("no stdio pipes for {program:?}")));
        };

        let mut pktline = Pktline::new(BufReader::new(stdout), BufWriter::new(stdin));
        if trace_packets {
            pktline = pktline.traced(id);
        }
        let mut channel = Channel::new(pktline);

        if let Err(e) = channel.negotiate_version() {
            // Closing our ends lets the child exit.
            drop(channel);
            let stderr = process.wait();
            tracing::debug!("pure SSH connection unsuccessful (#{})", id);
            let reason = match e {
                Error::Protocol(message) => message,
                other => other.to_string(),
            };
            return Err(Error::protocol(format!(
                "{reason}; failed to connect to remote SSH server: {}",
                stderr.trim()
            )));
        }
        tracing::debug!("pure SSH connection successful (#{})", id);

        Ok(Connection {
            id,
            channel: Mutex::new(Some(channel)),
            process: Mutex::new(Some(process)),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Exclusive use of the channel for one exchange.
    pub fn lock(&self) -> Result<MappedMutexGuard<'_, Channel<ChildReader, ChildWriter>>> {
        MutexGuard::try_map(self.channel.lock(), |channel| channel.as_mut())
            .map_err(|_| Error::protocol(format!("pure SSH connection (#{}) has been closed", self.id)))
    }

    /// Say `quit`, close both pipes and wait for the child to exit.
    ///
    /// Calling this again once the connection has ended does nothing.
    pub fn end(&self) -> Result<()> {
        let Some(mut channel) = self.channel.lock().take() else {
            return Ok(());
        };
        let result = channel
            .send_message("quit", &[])
            .and_then(|()| channel.read_status())
            .map(|_| ());
        drop(channel);
        if let Some(process) = self.process.lock().take() {
            process.wait();
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.get_mut().take() {
            tracing::debug!("killing transfer process for connection (#{}) that was never ended", self.id);
            self.channel.get_mut().take();
            let _ = process.child.kill();
            process.wait();
        }
    }
}

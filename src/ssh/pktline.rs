//! Pktline framing: every packet starts with its total length as four hex
//! digits. Lengths `0000` (flush) and `0001` (delimiter) carry no payload.

use std::io::{self, BufRead, Read, Write};

use crate::{Error, Result};

/// Largest packet, header included.
pub const MAX_PACKET_LENGTH: usize = 65520;

/// Largest payload a single packet can carry.
pub const MAX_PACKET_DATA: usize = MAX_PACKET_LENGTH - 4;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Flush,
    Delim,
    Data(Vec<u8>),
}

impl Packet {
    /// The payload as text with one trailing newline removed.
    pub fn into_text(self) -> Option<String> {
        match self {
            Packet::Data(mut data) => {
                if data.last() == Some(&b'\n') {
                    data.pop();
                }
                Some(String::from_utf8_lossy(&data).into_owned())
            }
            _ => None,
        }
    }
}

/// Reads and writes pktline frames over a byte stream pair.
///
/// Writes are buffered by the caller's writer; nothing is guaranteed to reach
/// the peer until [`write_flush`](Pktline::write_flush).
pub struct Pktline<R, W> {
    reader: R,
    writer: W,
    trace_id: Option<usize>,
}

impl<R: BufRead, W: Write> Pktline<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Pktline {
            reader,
            writer,
            trace_id: None,
        }
    }

    /// Log every frame at trace level, tagged with `id`.
    pub fn traced(mut self, id: usize) -> Self {
        self.trace_id = Some(id);
        self
    }

    pub fn read_packet(&mut self) -> Result<Packet> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        let len = std::str::from_utf8(&header)
            .ok()
            .and_then(|h| usize::from_str_radix(h, 16).ok())
            .ok_or_else(|| Error::protocol(format!("invalid packet length header {:?}", String::from_utf8_lossy(&header))))?;

        let packet = match len {
            0 => Packet::Flush,
            1 => Packet::Delim,
            2 | 3 => return Err(Error::protocol(format!("invalid packet length {len}"))),
            n if n > MAX_PACKET_LENGTH => {
                return Err(Error::protocol(format!("packet length {n} exceeds maximum")))
            }
            n => {
                let mut data = vec![0u8; n - 4];
                self.reader.read_exact(&mut data)?;
                Packet::Data(data)
            }
        };
        self.trace('<', &packet);
        Ok(packet)
    }

    /// Read text packets up to the next flush.
    pub fn read_packet_list(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            match self.read_packet()? {
                Packet::Flush => return Ok(lines),
                Packet::Delim => return Err(Error::protocol("unexpected delimiter packet")),
                data => lines.extend(data.into_text()),
            }
        }
    }

    pub fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PACKET_DATA {
            return Err(Error::protocol(format!("packet of {} bytes is too large", data.len())));
        }
        write!(self.writer, "{:04x}", data.len() + 4)?;
        self.writer.write_all(data)?;
        if self.trace_id.is_some() {
            self.trace('>', &Packet::Data(data.to_vec()));
        }
        Ok(())
    }

    /// Write `text` followed by a newline.
    pub fn write_packet_text(&mut self, text: &str) -> Result<()> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        self.write_packet(&data)
    }

    pub fn write_delim(&mut self) -> Result<()> {
        self.writer.write_all(b"0001")?;
        self.trace('>', &Packet::Delim);
        Ok(())
    }

    /// Write a flush packet and push everything buffered to the peer.
    pub fn write_flush(&mut self) -> Result<()> {
        self.writer.write_all(b"0000")?;
        self.writer.flush()?;
        self.trace('>', &Packet::Flush);
        Ok(())
    }

    /// Reader over data packets that ends at the next flush.
    pub fn data_reader(&mut self) -> DataReader<'_, R, W> {
        DataReader {
            pktline: self,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    fn trace(&self, dir: char, packet: &Packet) {
        let Some(id) = self.trace_id else {
            return;
        };
        match packet {
            Packet::Flush => tracing::trace!("packet {:02x} {} 0000", id, dir),
            Packet::Delim => tracing::trace!("packet {:02x} {} 0001", id, dir),
            Packet::Data(data) => {
                tracing::trace!("packet {:02x} {} {}", id, dir, String::from_utf8_lossy(data).trim_end())
            }
        }
    }
}

/// Binary payload of a message, read until its terminating flush.
///
/// Must be read to the end before the connection is used again.
pub struct DataReader<'a, R, W> {
    pktline: &'a mut Pktline<R, W>,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: BufRead, W: Write> DataReader<'_, R, W> {
    /// Discard the rest of the payload up to its flush packet.
    pub fn drain(&mut self) -> Result<u64> {
        io::copy(self, &mut io::sink()).map_err(Error::from_io)
    }
}

impl<R: BufRead, W: Write> Read for DataReader<'_, R, W> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            if self.done {
                return Ok(0);
            }
            match self.pktline.read_packet().map_err(Error::into_io)? {
                Packet::Flush => self.done = true,
                Packet::Delim => {
                    return Err(Error::protocol("unexpected delimiter packet in data").into_io())
                }
                Packet::Data(data) => {
                    self.buf = data;
                    self.pos = 0;
                }
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pktline(input: &[u8]) -> Pktline<Cursor<Vec<u8>>, Vec<u8>> {
        Pktline::new(Cursor::new(input.to_vec()), Vec::new())
    }

    #[test]
    fn test_write_frames() {
        let mut pl = pktline(b"");
        pl.write_packet_text("version 1").unwrap();
        pl.write_delim().unwrap();
        pl.write_packet(b"\x00\x01").unwrap();
        pl.write_flush().unwrap();
        let (_, out) = pl.into_inner();
        assert_eq!(out, b"000eversion 1\n00010006\x00\x010000");
    }

    #[test]
    fn test_read_frames() {
        let mut pl = pktline(b"000eversion=1\n0009abcde00010000");
        assert_eq!(pl.read_packet().unwrap().into_text().unwrap(), "version=1");
        assert_eq!(pl.read_packet().unwrap(), Packet::Data(b"abcde".to_vec()));
        assert_eq!(pl.read_packet().unwrap(), Packet::Delim);
        assert_eq!(pl.read_packet().unwrap(), Packet::Flush);
    }

    #[test]
    fn test_read_packet_list() {
        let mut pl = pktline(b"000eversion=1\n000blocking0000");
        assert_eq!(pl.read_packet_list().unwrap(), vec!["version=1", "locking"]);
    }

    #[test]
    fn test_bad_headers_are_protocol_errors() {
        assert!(pktline(b"zzzz").read_packet().unwrap_err().is_protocol());
        assert!(pktline(b"0002").read_packet().unwrap_err().is_protocol());
        assert!(pktline(b"fff5").read_packet().unwrap_err().is_protocol());
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let mut pl = pktline(b"");
        assert!(pl.write_packet(&vec![0u8; MAX_PACKET_DATA + 1]).is_err());
        assert!(pl.write_packet(&vec![0u8; MAX_PACKET_DATA]).is_ok());
    }

    #[test]
    fn test_data_reader_stops_at_flush() {
        let mut pl = pktline(b"0007abc0006de0000000astatus");
        let mut data = Vec::new();
        pl.data_reader().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"abcde");
        assert_eq!(pl.read_packet().unwrap().into_text().unwrap(), "status");
    }

    #[test]
    fn test_drain_after_partial_read() {
        let mut pl = pktline(b"0007abc0006de0000000astatus");
        let mut reader = pl.data_reader();
        let mut first = [0u8; 2];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"ab");
        assert_eq!(reader.drain().unwrap(), 3);
        assert_eq!(reader.drain().unwrap(), 0);
        assert_eq!(pl.read_packet().unwrap().into_text().unwrap(), "status");
    }
}

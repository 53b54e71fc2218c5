//! nis.rs
//!
//! Client for the NIS protocol spoken by apcupsd-compatible status daemons.
//!
//! One `fetch` call is one complete exchange: connect, send a length-prefixed
//! command frame, read length-prefixed response frames until the zero-length
//! terminator, and parse each payload line into a [`StatusRecord`]. The socket
//! lives inside the call and is closed on every exit path.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str;
use std::time::Duration;

use thiserror::Error;

use crate::units;

/// Command sent to request the full status report.
pub const STATUS_COMMAND: &str = "status";

/// Upper bound on a declared frame payload length. NIS frames carry one
/// status line each and stay far below this; anything larger means a corrupt
/// or hostile length field.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// Separator for key-value pairs
const SEP: char = ':';

/// Failure modes of a single status exchange. None of these leave the
/// connection half-open; the caller decides availability and retry policy.
#[derive(Debug, Error)]
pub enum NisError {
    /// No connection could be established within the timeout.
    #[error("could not connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// The daemon stopped responding mid-stream.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The byte stream violated the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A frame payload was not valid UTF-8.
    #[error("frame payload is not valid UTF-8: {0}")]
    Decode(#[from] str::Utf8Error),
}

/// Parsed status fields from one exchange, in daemon response order.
///
/// Keys are unique; a duplicate key overwrites the value but keeps the
/// original position. A record is only ever produced from a complete,
/// correctly terminated frame sequence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    entries: Vec<(String, String)>,
}

impl StatusRecord {
    pub fn insert(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encode a command as a request frame: 2-byte big-endian length + payload.
pub fn encode_request(command: &str) -> Vec<u8> {
    debug_assert!(command.len() <= u16::MAX as usize);
    let mut frame = Vec::with_capacity(2 + command.len());
    frame.extend_from_slice(&(command.len() as u16).to_be_bytes());
    frame.extend_from_slice(command.as_bytes());
    frame
}

/// Connect to the daemon's NIS and fetch one parsed status report.
///
/// `timeout` bounds connection establishment and each individual read. With
/// `strip_units` set, a trailing unit token is removed from every value, so
/// numeric fields come back as clean scalars.
///
/// The call performs no retries; each invocation owns its socket exclusively
/// and shares nothing with concurrent callers.
pub fn fetch(
    host: &str,
    port: u16,
    timeout: Duration,
    strip_units: bool,
) -> Result<StatusRecord, NisError> {
    let mut stream = connect(host, port, timeout)?;

    stream
        .write_all(&encode_request(STATUS_COMMAND))
        .map_err(|err| map_io(err, timeout, "sending status request"))?;

    let mut record = StatusRecord::default();
    let mut payload = Vec::new();

    loop {
        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .map_err(|err| map_io(err, timeout, "awaiting frame length"))?;

        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }
        if len > MAX_FRAME_LEN {
            return Err(NisError::Protocol(format!(
                "declared frame length {len} exceeds the {MAX_FRAME_LEN}-byte cap"
            )));
        }

        payload.resize(len, 0);
        stream
            .read_exact(&mut payload)
            .map_err(|err| map_io(err, timeout, "reading frame payload"))?;

        let line = str::from_utf8(&payload)?;
        parse_line(&mut record, line, strip_units);
    }

    Ok(record)
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NisError> {
    let addr = format!("{host}:{port}");
    let connect_err = |source| NisError::Connect {
        addr: addr.clone(),
        source,
    };

    let mut last_err = None;
    for sock_addr in (host, port).to_socket_addrs().map_err(connect_err)? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).map_err(connect_err)?;
                stream.set_write_timeout(Some(timeout)).map_err(connect_err)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(NisError::Connect {
        addr,
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")),
    })
}

/// A read timeout surfaces as `WouldBlock` on Unix and `TimedOut` on Windows;
/// everything else mid-exchange is a framing-level failure.
fn map_io(err: io::Error, timeout: Duration, context: &str) -> NisError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NisError::Timeout(timeout),
        io::ErrorKind::UnexpectedEof => {
            NisError::Protocol(format!("connection closed while {context}"))
        }
        _ => NisError::Protocol(format!("{context} failed: {err}")),
    }
}

/// Split one payload line on the first colon and insert the trimmed pair.
/// Lines without a separator are dropped rather than failing the fetch.
fn parse_line(record: &mut StatusRecord, line: &str, strip_units: bool) {
    let Some((key, value)) = line.split_once(SEP) else {
        return;
    };
    let value = value.trim();
    let value = if strip_units {
        units::strip_unit(value)
    } else {
        value
    };
    record.insert(key.trim().to_string(), value.to_string());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Frame up status lines the way the daemon does, with a trailing newline
    /// per line and a zero-length terminator frame.
    pub(crate) fn status_response(lines: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for line in lines {
            let payload = format!("{line}\n");
            bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            bytes.extend_from_slice(payload.as_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes
    }

    /// Mock daemon serving one connection per response: reads the request
    /// frame, reports the decoded command on the channel, replies with the
    /// raw bytes, then closes.
    pub(crate) fn mock_daemon(responses: Vec<Vec<u8>>) -> (u16, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut len_buf = [0u8; 2];
                stream.read_exact(&mut len_buf).unwrap();
                let mut command = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                stream.read_exact(&mut command).unwrap();
                tx.send(String::from_utf8(command).unwrap()).unwrap();
                stream.write_all(&response).unwrap();
            }
        });

        (port, rx)
    }

    #[test]
    fn fetch_keeps_units_and_response_order() {
        let (port, _rx) = mock_daemon(vec![status_response(&[
            "LOADPCT  : 23.0 Percent",
            "NOMPOWER : 865 Watts",
        ])]);

        let record = fetch("127.0.0.1", port, TIMEOUT, false).unwrap();
        assert_eq!(record.get("LOADPCT"), Some("23.0 Percent"));
        assert_eq!(record.get("NOMPOWER"), Some("865 Watts"));

        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["LOADPCT", "NOMPOWER"]);
    }

    #[test]
    fn fetch_strips_units_to_clean_scalars() {
        let (port, _rx) = mock_daemon(vec![status_response(&[
            "LOADPCT  : 23.0 Percent",
            "NOMPOWER : 865 Watts",
            "STATUS   : ONLINE",
        ])]);

        let record = fetch("127.0.0.1", port, TIMEOUT, true).unwrap();
        assert_eq!(record.get("LOADPCT"), Some("23.0"));
        assert_eq!(record.get("NOMPOWER"), Some("865"));
        assert_eq!(record.get("STATUS"), Some("ONLINE"));
    }

    #[test]
    fn request_is_a_length_prefixed_status_command() {
        assert_eq!(encode_request(STATUS_COMMAND), b"\x00\x06status");

        let (port, rx) = mock_daemon(vec![status_response(&[])]);
        fetch("127.0.0.1", port, TIMEOUT, false).unwrap();
        assert_eq!(rx.recv().unwrap(), "status");
    }

    #[test]
    fn empty_response_yields_empty_record() {
        let (port, _rx) = mock_daemon(vec![status_response(&[])]);
        let record = fetch("127.0.0.1", port, TIMEOUT, false).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn colonless_lines_are_dropped_not_fatal() {
        let (port, _rx) = mock_daemon(vec![status_response(&[
            "STATUS   : ONLINE",
            "no separator here",
            "LINEV    : 120.0 Volts",
        ])]);

        let record = fetch("127.0.0.1", port, TIMEOUT, false).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("STATUS"), Some("ONLINE"));
        assert_eq!(record.get("LINEV"), Some("120.0 Volts"));
    }

    #[test]
    fn duplicate_key_overwrites_in_place() {
        let (port, _rx) = mock_daemon(vec![status_response(&[
            "STATUS   : ONLINE",
            "LINEV    : 120.0 Volts",
            "STATUS   : ONBATT",
        ])]);

        let record = fetch("127.0.0.1", port, TIMEOUT, false).unwrap();
        assert_eq!(record.get("STATUS"), Some("ONBATT"));
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["STATUS", "LINEV"]);
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        // Declares 10 payload bytes but closes after 4.
        let mut response = vec![0x00, 0x0A];
        response.extend_from_slice(b"LOAD");
        let (port, _rx) = mock_daemon(vec![response]);

        let err = fetch("127.0.0.1", port, TIMEOUT, false).unwrap_err();
        assert!(matches!(err, NisError::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn missing_terminator_is_a_protocol_error() {
        let mut response = Vec::new();
        let payload = b"STATUS   : ONLINE\n";
        response.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        response.extend_from_slice(payload);
        // No zero-length frame before the daemon closes.
        let (port, _rx) = mock_daemon(vec![response]);

        let err = fetch("127.0.0.1", port, TIMEOUT, false).unwrap_err();
        assert!(matches!(err, NisError::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn oversized_frame_length_is_a_protocol_error() {
        let (port, _rx) = mock_daemon(vec![vec![0xFF, 0xFF]]);

        let err = fetch("127.0.0.1", port, TIMEOUT, false).unwrap_err();
        assert!(matches!(err, NisError::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn invalid_utf8_payload_is_a_decode_error() {
        let response = vec![0x00, 0x02, 0xFF, 0xFE];
        let (port, _rx) = mock_daemon(vec![response]);

        let err = fetch("127.0.0.1", port, TIMEOUT, false).unwrap_err();
        assert!(matches!(err, NisError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn connection_refused_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = fetch("127.0.0.1", port, TIMEOUT, false).unwrap_err();
        assert!(matches!(err, NisError::Connect { .. }), "got {err:?}");
    }

    #[test]
    fn stalled_daemon_is_a_timeout_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 8];
            let _ = stream.read_exact(&mut request);
            // Hold the connection open without ever answering.
            thread::sleep(Duration::from_millis(500));
        });

        let err = fetch("127.0.0.1", port, Duration::from_millis(100), false).unwrap_err();
        assert!(matches!(err, NisError::Timeout(_)), "got {err:?}");
        handle.join().unwrap();
    }
}

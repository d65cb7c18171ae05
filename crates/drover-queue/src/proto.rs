use bytes::{Buf, Bytes, BytesMut};
use drover_core::QueueError;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum body size accepted in a `RESERVED` or `OK` data chunk. Servers
/// usually cap jobs far below this; anything larger is a protocol fault.
pub const MAX_JOB_SIZE: usize = 1024 * 1024;

/// Longest head line we accept before declaring the stream corrupt
const MAX_LINE: usize = 1024;

/// Commands the worker sends. One CRLF-terminated line each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Watch { topic: String },
    Reserve { timeout_secs: u64 },
    Delete { id: u64 },
    Release { id: u64, pri: u32, delay: u32 },
    StatsJob { id: u64 },
}

/// Replies the server sends. `Reserved` and `Ok` carry a data chunk after
/// the head line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Watching(u32),
    Reserved { id: u64, body: Bytes },
    TimedOut,
    DeadlineSoon,
    Deleted,
    Released,
    Buried,
    NotFound,
    Ok(Bytes),
    /// Server-side fault line (BAD_FORMAT, INTERNAL_ERROR, ...)
    Error(String),
}

enum PendingData {
    Reserved(u64),
    Stats,
}

/// Line-oriented codec for the queue protocol. The decoder buffers until a
/// data-carrying reply's chunk and its trailing CRLF are complete.
#[derive(Default)]
pub struct QueueCodec {
    pending: Option<(PendingData, usize)>,
}

impl QueueCodec {
    pub fn new() -> Self {
        QueueCodec { pending: None }
    }
}

fn find_crlf(src: &BytesMut) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

fn parse_num<T: std::str::FromStr>(word: Option<&str>, what: &str) -> Result<T, QueueError> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| QueueError::Protocol(format!("bad {what} in reply")))
}

impl Decoder for QueueCodec {
    type Item = Reply;
    type Error = QueueError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, QueueError> {
        if let Some((head, len)) = self.pending.take() {
            if src.len() < len + 2 {
                src.reserve(len + 2 - src.len());
                self.pending = Some((head, len));
                return Ok(None);
            }
            let body = src.split_to(len).freeze();
            let crlf = src.split_to(2);
            if &crlf[..] != b"\r\n" {
                return Err(QueueError::Protocol(
                    "data chunk missing trailing CRLF".to_string(),
                ));
            }
            return Ok(Some(match head {
                PendingData::Reserved(id) => Reply::Reserved { id, body },
                PendingData::Stats => Reply::Ok(body),
            }));
        }

        let Some(eol) = find_crlf(src) else {
            if src.len() > MAX_LINE {
                return Err(QueueError::Protocol("reply line too long".to_string()));
            }
            return Ok(None);
        };
        let line = src.split_to(eol);
        src.advance(2);
        let line = std::str::from_utf8(&line)
            .map_err(|_| QueueError::Protocol("reply line is not UTF-8".to_string()))?;

        let mut words = line.split_ascii_whitespace();
        let reply = match words.next() {
            Some("RESERVED") => {
                let id = parse_num(words.next(), "job id")?;
                let len: usize = parse_num(words.next(), "byte count")?;
                if len > MAX_JOB_SIZE {
                    return Err(QueueError::Protocol(format!("job body too large: {len}")));
                }
                self.pending = Some((PendingData::Reserved(id), len));
                return self.decode(src);
            }
            Some("OK") => {
                let len: usize = parse_num(words.next(), "byte count")?;
                if len > MAX_JOB_SIZE {
                    return Err(QueueError::Protocol(format!("stats body too large: {len}")));
                }
                self.pending = Some((PendingData::Stats, len));
                return self.decode(src);
            }
            Some("WATCHING") => Reply::Watching(parse_num(words.next(), "watch count")?),
            Some("TIMED_OUT") => Reply::TimedOut,
            Some("DEADLINE_SOON") => Reply::DeadlineSoon,
            Some("DELETED") => Reply::Deleted,
            Some("RELEASED") => Reply::Released,
            Some("BURIED") => Reply::Buried,
            Some("NOT_FOUND") => Reply::NotFound,
            Some(
                fault @ ("OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
                | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING"),
            ) => Reply::Error(fault.to_string()),
            _ => {
                return Err(QueueError::Protocol(format!(
                    "unrecognized reply line: {line:?}"
                )))
            }
        };
        Ok(Some(reply))
    }
}

impl Encoder<Command> for QueueCodec {
    type Error = QueueError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), QueueError> {
        let line = match cmd {
            Command::Watch { topic } => format!("watch {topic}\r\n"),
            Command::Reserve { timeout_secs } => format!("reserve-with-timeout {timeout_secs}\r\n"),
            Command::Delete { id } => format!("delete {id}\r\n"),
            Command::Release { id, pri, delay } => format!("release {id} {pri} {delay}\r\n"),
            Command::StatsJob { id } => format!("stats-job {id}\r\n"),
        };
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut QueueCodec, bytes: &[u8]) -> Vec<Reply> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(reply) = codec.decode(&mut buf).unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn encodes_commands() {
        let mut codec = QueueCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                Command::Watch {
                    topic: "jobs".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(Command::Reserve { timeout_secs: 1 }, &mut buf)
            .unwrap();
        codec.encode(Command::Delete { id: 42 }, &mut buf).unwrap();
        codec
            .encode(
                Command::Release {
                    id: 42,
                    pri: 1024,
                    delay: 13,
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            &buf[..],
            b"watch jobs\r\nreserve-with-timeout 1\r\ndelete 42\r\nrelease 42 1024 13\r\n"
        );
    }

    #[test]
    fn decodes_bare_replies() {
        let mut codec = QueueCodec::new();
        let replies = decode_all(
            &mut codec,
            b"TIMED_OUT\r\nDEADLINE_SOON\r\nDELETED\r\nNOT_FOUND\r\nWATCHING 2\r\n",
        );
        assert_eq!(
            replies,
            vec![
                Reply::TimedOut,
                Reply::DeadlineSoon,
                Reply::Deleted,
                Reply::NotFound,
                Reply::Watching(2),
            ]
        );
    }

    #[test]
    fn decodes_reserved_with_body() {
        let mut codec = QueueCodec::new();
        let replies = decode_all(&mut codec, b"RESERVED 7 5\r\nhello\r\n");
        assert_eq!(
            replies,
            vec![Reply::Reserved {
                id: 7,
                body: Bytes::from_static(b"hello"),
            }]
        );
    }

    #[test]
    fn buffers_partial_data_chunk() {
        let mut codec = QueueCodec::new();
        let mut buf = BytesMut::from(&b"RESERVED 7 5\r\nhel"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lo\r\n");
        let reply = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Reserved {
                id: 7,
                body: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn decodes_stats_chunk() {
        let mut codec = QueueCodec::new();
        let data = b"---\nage: 3\n";
        let framed = format!("OK {}\r\n{}\r\n", data.len(), std::str::from_utf8(data).unwrap());
        let replies = decode_all(&mut codec, framed.as_bytes());
        assert_eq!(replies, vec![Reply::Ok(Bytes::from_static(data))]);
    }

    #[test]
    fn server_faults_become_error_replies() {
        let mut codec = QueueCodec::new();
        let replies = decode_all(&mut codec, b"BAD_FORMAT\r\n");
        assert_eq!(replies, vec![Reply::Error("BAD_FORMAT".to_string())]);
    }

    #[test]
    fn garbage_line_is_a_protocol_error() {
        let mut codec = QueueCodec::new();
        let mut buf = BytesMut::from(&b"HELLO WORLD\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn missing_chunk_terminator_is_an_error() {
        let mut codec = QueueCodec::new();
        let mut buf = BytesMut::from(&b"RESERVED 1 2\r\nabXX"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut codec = QueueCodec::new();
        let line = format!("RESERVED 1 {}\r\n", MAX_JOB_SIZE + 1);
        let mut buf = BytesMut::from(line.as_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}

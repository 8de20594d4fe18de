//! The inbound half of the codec: byte accumulation and reply extraction.

use bytes::BytesMut;

use super::parser::{self, ParseResult, Reply};
use crate::error::{Error, ErrorKind};

/// Incremental reply reader.
///
/// Bytes fed into the reader accumulate until they form complete replies.
/// A parse failure is sticky: once the stream is malformed, every later
/// call reports the same error.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buf: BytesMut,
    err: Option<Error>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the wire.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Extract the next complete reply, or `None` when more bytes are
    /// needed.
    pub fn get_reply(&mut self) -> Result<Option<Reply>, Error> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match parser::parse(&self.buf) {
            ParseResult::Complete(reply, consumed) => {
                let _ = self.buf.split_to(consumed);
                Ok(Some(reply))
            }
            ParseResult::Incomplete => Ok(None),
            ParseResult::Error(message) => {
                let err = Error::new(ErrorKind::Protocol, message);
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    /// The sticky parse error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_replies_across_feeds() {
        let mut reader = ReplyReader::new();
        reader.feed(b"+PO").unwrap();
        assert_eq!(reader.get_reply().unwrap(), None);
        reader.feed(b"NG\r\n$1\r\n").unwrap();
        assert_eq!(
            reader.get_reply().unwrap(),
            Some(Reply::Status("PONG".to_string()))
        );
        assert_eq!(reader.get_reply().unwrap(), None);
        reader.feed(b"A\r\n").unwrap();
        match reader.get_reply().unwrap() {
            Some(Reply::Bulk(Some(data))) => assert_eq!(&data[..], b"A"),
            other => panic!("expected bulk, got {other:?}"),
        }
        assert_eq!(reader.get_reply().unwrap(), None);
    }

    #[test]
    fn drains_multiple_replies_from_one_feed() {
        let mut reader = ReplyReader::new();
        reader.feed(b"$1\r\nA\r\n$1\r\nB\r\n").unwrap();
        assert!(matches!(
            reader.get_reply().unwrap(),
            Some(Reply::Bulk(Some(_)))
        ));
        assert!(matches!(
            reader.get_reply().unwrap(),
            Some(Reply::Bulk(Some(_)))
        ));
        assert_eq!(reader.get_reply().unwrap(), None);
    }

    #[test]
    fn parse_errors_are_sticky() {
        let mut reader = ReplyReader::new();
        reader.feed(b"!junk\r\n").unwrap();
        let err = reader.get_reply().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(reader.error().is_some());
        assert!(reader.feed(b"+OK\r\n").is_err());
        assert!(reader.get_reply().is_err());
    }
}

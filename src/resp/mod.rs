//! RESP wire codec.
//!
//! The outbound side frames commands as arrays of bulk strings; the
//! inbound side accumulates bytes and yields parsed replies through
//! [`ReplyReader`].

mod format;
mod parser;
mod reader;

pub use format::format_command;
pub use parser::Reply;
pub use reader::ReplyReader;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    // A formatted command parses back into the arguments it was built from.
    #[test]
    fn formatted_commands_round_trip_through_the_reader() {
        let argv: [&[u8]; 3] = [b"SET", b"some-key", b"some\r\nvalue"];
        let mut buf = BytesMut::new();
        format_command(&mut buf, &argv);

        let mut reader = ReplyReader::new();
        reader.feed(&buf).unwrap();
        let reply = reader.get_reply().unwrap().expect("complete frame");
        let elements = match reply {
            Reply::Array(Some(elements)) => elements,
            other => panic!("expected array, got {other:?}"),
        };
        assert_eq!(elements.len(), argv.len());
        for (element, arg) in elements.iter().zip(argv.iter()) {
            match element {
                Reply::Bulk(Some(data)) => assert_eq!(&data[..], *arg),
                other => panic!("expected bulk, got {other:?}"),
            }
        }
        assert_eq!(reader.get_reply().unwrap(), None);
    }
}

use bytes::Bytes;

/// A RESP (Redis Serialization Protocol) frame.
///
/// This enum represents all RESP2 frame types:
/// - SimpleString: Status responses like "OK"
/// - Error: Error responses from the server, including cluster redirects
/// - Integer: Numeric responses
/// - BulkString: Binary-safe string data
/// - Array: Command arguments and array responses
/// - Null: NULL value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null (*-1).
    Null,
}

impl Frame {
    /// Builds a bulk string frame.
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds a simple string frame.
    #[inline]
    pub fn simple(text: &str) -> Self {
        Frame::SimpleString(text.as_bytes().to_vec())
    }

    /// Builds an error frame from the full error line (without the leading `-`).
    #[inline]
    pub fn error(text: &str) -> Self {
        Frame::Error(text.as_bytes().to_vec())
    }

    /// Returns the payload of a simple string or non-null bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Returns the value of an integer frame.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the elements of an array frame.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns true for `Null` and null bulk strings.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }

    /// Renders the frame for log lines and assertions.
    pub fn describe(&self) -> String {
        match self {
            Frame::SimpleString(s) | Frame::Error(s) => String::from_utf8_lossy(s).into_owned(),
            Frame::Integer(i) => i.to_string(),
            Frame::BulkString(Some(b)) => String::from_utf8_lossy(b).into_owned(),
            Frame::BulkString(None) | Frame::Null => "nil".to_string(),
            Frame::Array(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(Frame::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_describe() {
        assert_eq!(Frame::simple("OK").describe(), "OK");
        assert_eq!(Frame::Integer(42).describe(), "42");
        assert_eq!(Frame::Null.describe(), "nil");
        assert_eq!(Frame::BulkString(None).describe(), "nil");
    }

    #[test]
    fn test_frame_as_bytes() {
        let frame = Frame::bulk("hello");
        assert_eq!(frame.as_bytes(), Some(&b"hello"[..]));
        assert_eq!(Frame::simple("PONG").as_bytes(), Some(&b"PONG"[..]));
        assert_eq!(Frame::Integer(42).as_bytes(), None);
        assert_eq!(Frame::BulkString(None).as_bytes(), None);
    }

    #[test]
    fn test_frame_as_array() {
        let frames = vec![Frame::Integer(1), Frame::Integer(2)];
        let frame = Frame::Array(frames.clone());
        assert_eq!(frame.as_array(), Some(&frames[..]));
        assert_eq!(Frame::Integer(42).as_array(), None);
    }

    #[test]
    fn test_frame_as_integer() {
        assert_eq!(Frame::Integer(42).as_integer(), Some(42));
        assert_eq!(Frame::Null.as_integer(), None);
    }

    #[test]
    fn test_frame_is_null() {
        assert!(Frame::Null.is_null());
        assert!(Frame::BulkString(None).is_null());
        assert!(!Frame::Integer(42).is_null());
    }

    #[test]
    fn test_frame_array_describe() {
        let frame = Frame::Array(vec![
            Frame::Integer(1),
            Frame::simple("test"),
            Frame::bulk("127.0.0.1"),
        ]);
        assert_eq!(frame.describe(), "[1, test, 127.0.0.1]");
    }
}

use async_trait::async_trait;
use bytes::Bytes;

use crate::cluster::parse_redis_error;
use crate::core::connection::Connection;
use crate::error::{Error, Result};
use crate::proto::Frame;

/// A unit of work the dispatcher can run, and re-run, against a node.
///
/// `run` may be invoked several times for one logical call (retries and
/// redirects), each time on a fresh connection, so implementations must not
/// consume themselves. Error replies from the server should be turned into
/// typed errors with [`parse_frame_response`] so that redirects are noticed.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Value produced on success.
    type Output: Send;

    /// Runs the operation on `conn`.
    async fn run(&self, conn: &mut dyn Connection) -> Result<Self::Output>;

    /// Whether the operation may be served by a replica.
    fn read_only(&self) -> bool {
        false
    }
}

/// A command ready to be sent to Redis.
///
/// Commands are built using the builder pattern and converted to frames
/// for transmission over the connection.
///
/// # Example
///
/// ```
/// use slotmux::core::command::{get, set, Cmd};
///
/// let cmd = Cmd::new("SET").arg("key").arg("value");
/// let get_cmd = get("key");
/// let set_cmd = set("key", "new_value");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Bytes>,
    read_only: bool,
}

impl Cmd {
    /// Creates a new command with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The command name (e.g., "GET", "SET", "DEL")
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            read_only: false,
        }
    }

    /// Appends an argument to the command.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Marks the command as safe to serve from a replica.
    #[inline]
    pub fn mark_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns the command arguments, name first.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Builds the RESP Array frame for this command without consuming it.
    pub fn to_frame(&self) -> Frame {
        Frame::Array(self.args.iter().cloned().map(|b| Frame::BulkString(Some(b))).collect())
    }

    /// Converts the command to a RESP Array frame.
    #[inline]
    pub fn into_frame(self) -> Frame {
        Frame::Array(
            self.args
                .into_iter()
                .map(|b| Frame::BulkString(Some(b)))
                .collect(),
        )
    }
}

#[async_trait]
impl Operation for Cmd {
    type Output = Frame;

    async fn run(&self, conn: &mut dyn Connection) -> Result<Frame> {
        let reply = conn.send_command(&self.to_frame()).await?;
        parse_frame_response(reply)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").arg(key).mark_read_only()
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").arg(key).arg(value)
}

/// Creates a SET command with expiration.
///
/// # Arguments
///
/// * `key` - The key to set
/// * `value` - The value to set
/// * `expiry` - Time until the key expires
#[inline]
pub fn set_with_expiry(
    key: impl Into<Bytes>,
    value: impl Into<Bytes>,
    expiry: std::time::Duration,
) -> Cmd {
    Cmd::new("SET")
        .arg(key)
        .arg(value)
        .arg("PX")
        .arg(expiry.as_millis().to_string())
}

/// Creates a DEL command.
#[inline]
pub fn del(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("DEL").arg(key)
}

/// Creates an EXISTS command.
#[inline]
pub fn exists(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("EXISTS").arg(key).mark_read_only()
}

/// Creates an MGET command.
///
/// In a cluster every key must hash to the same slot.
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter()
        .fold(Cmd::new("MGET"), |cmd, key| cmd.arg(key))
        .mark_read_only()
}

/// Creates an MSET command from key/value pairs.
///
/// In a cluster every key must hash to the same slot.
pub fn mset<K: Into<Bytes>, V: Into<Bytes>>(pairs: impl IntoIterator<Item = (K, V)>) -> Cmd {
    pairs
        .into_iter()
        .fold(Cmd::new("MSET"), |cmd, (key, value)| cmd.arg(key).arg(value))
}

/// Turns an error reply into a typed error, passing every other frame through.
///
/// Cluster replies (`MOVED`, `ASK`, `TRYAGAIN`, `CLUSTERDOWN`, `CROSSSLOT`)
/// become their dedicated [`Error`] variants.
#[inline]
pub fn parse_frame_response(frame: Frame) -> Result<Frame> {
    match frame {
        Frame::Error(e) => Err(parse_redis_error(&e)),
        _ => Ok(frame),
    }
}

/// Expects a `+OK` status reply.
pub fn expect_ok(frame: Frame) -> Result<()> {
    match parse_frame_response(frame)? {
        Frame::SimpleString(s) if s == b"OK" => Ok(()),
        other => Err(unexpected("OK", &other)),
    }
}

/// Converts a frame to bytes.
#[inline]
pub fn frame_to_bytes(frame: Frame) -> Result<Option<Bytes>> {
    match parse_frame_response(frame)? {
        Frame::BulkString(b) => Ok(b),
        Frame::SimpleString(s) => Ok(Some(Bytes::from(s))),
        Frame::Null => Ok(None),
        other => Err(unexpected("bulk string", &other)),
    }
}

/// Converts a frame to an integer.
#[inline]
pub fn frame_to_int(frame: Frame) -> Result<i64> {
    match parse_frame_response(frame)? {
        Frame::Integer(i) => Ok(i),
        Frame::BulkString(Some(b)) => std::str::from_utf8(&b)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| Error::Server {
                message: "reply is not an integer".to_string(),
            }),
        other => Err(unexpected("integer", &other)),
    }
}

/// Converts a frame to a boolean.
#[inline]
pub fn frame_to_bool(frame: Frame) -> Result<bool> {
    frame_to_int(frame).map(|i| i != 0)
}

/// Converts a frame array to a vector of optional bytes.
pub fn frame_to_vec_bytes(frame: Frame) -> Result<Vec<Option<Bytes>>> {
    match parse_frame_response(frame)? {
        Frame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Frame::BulkString(b) => Ok(b),
                Frame::Null => Ok(None),
                other => Err(unexpected("bulk string in array", &other)),
            })
            .collect(),
        other => Err(unexpected("array", &other)),
    }
}

// Wrong reply shape is a Server error: the connection is still usable.
fn unexpected(expected: &str, got: &Frame) -> Error {
    Error::Server {
        message: format!("expected {expected} reply, got {}", got.describe()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Cmd) -> Vec<&[u8]> {
        cmd.args().iter().map(|b| b.as_ref()).collect()
    }

    #[test]
    fn test_cmd_into_frame() {
        let frame = Cmd::new("SET").arg("k").arg("v").into_frame();
        assert_eq!(
            frame,
            Frame::Array(vec![Frame::bulk("SET"), Frame::bulk("k"), Frame::bulk("v")])
        );
    }

    #[test]
    fn test_cmd_to_frame_is_repeatable() {
        let cmd = get("key");
        assert_eq!(cmd.to_frame(), cmd.to_frame());
        assert_eq!(cmd.to_frame(), cmd.clone().into_frame());
    }

    #[test]
    fn test_read_only_marking() {
        assert!(get("k").read_only());
        assert!(exists("k").read_only());
        assert!(mget(["a", "b"]).read_only());
        assert!(!set("k", "v").read_only());
        assert!(!del("k").read_only());
    }

    #[test]
    fn test_multi_key_builders() {
        assert_eq!(args(&mget(["a", "b"])), vec![&b"MGET"[..], b"a", b"b"]);
        assert_eq!(
            args(&mset([("a", "1"), ("b", "2")])),
            vec![&b"MSET"[..], b"a", b"1", b"b", b"2"]
        );
    }

    #[test]
    fn test_set_with_expiry() {
        let cmd = set_with_expiry("k", "v", std::time::Duration::from_secs(2));
        assert_eq!(args(&cmd), vec![&b"SET"[..], b"k", b"v", b"PX", b"2000"]);
    }

    #[test]
    fn test_parse_frame_response_typed_errors() {
        let err = parse_frame_response(Frame::error("MOVED 12 10.0.0.1:7000")).unwrap_err();
        assert!(matches!(err, Error::Moved { slot: 12, .. }));

        let err = parse_frame_response(Frame::error("ERR wrong number of arguments")).unwrap_err();
        assert!(matches!(err, Error::Server { .. }));

        assert_eq!(
            parse_frame_response(Frame::Integer(1)).unwrap(),
            Frame::Integer(1)
        );
    }

    #[test]
    fn test_frame_to_bytes() {
        assert_eq!(
            frame_to_bytes(Frame::bulk("v")).unwrap(),
            Some(Bytes::from("v"))
        );
        assert_eq!(frame_to_bytes(Frame::BulkString(None)).unwrap(), None);
        assert!(frame_to_bytes(Frame::Integer(1)).is_err());
    }

    #[test]
    fn test_frame_to_int_and_bool() {
        assert_eq!(frame_to_int(Frame::Integer(3)).unwrap(), 3);
        assert_eq!(frame_to_int(Frame::bulk("42")).unwrap(), 42);
        assert!(frame_to_bool(Frame::Integer(1)).unwrap());
        assert!(!frame_to_bool(Frame::Integer(0)).unwrap());
        let err = frame_to_int(Frame::simple("x")).unwrap_err();
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_frame_to_vec_bytes() {
        let frame = Frame::Array(vec![Frame::bulk("a"), Frame::BulkString(None), Frame::Null]);
        assert_eq!(
            frame_to_vec_bytes(frame).unwrap(),
            vec![Some(Bytes::from("a")), None, None]
        );
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok(Frame::simple("OK")).is_ok());
        assert!(expect_ok(Frame::simple("QUEUED")).is_err());
        assert!(matches!(
            expect_ok(Frame::error("CLUSTERDOWN The cluster is down")),
            Err(Error::ClusterDown { .. })
        ));
    }
}

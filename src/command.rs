//! Outbound commands
//!
//! A command is an ordered list of binary-safe arguments, name first.
//! Key positions drive slot computation in cluster mode and are looked up
//! from a small command table unless the caller supplies them.

use std::borrow::Cow;
use std::fmt;

/// Conversion into a single command argument
pub trait ToArg {
    fn to_arg(&self) -> Vec<u8>;
}

impl ToArg for &str {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for &String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl<const N: usize> ToArg for &[u8; N] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Vec<u8> {
        self.clone()
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Vec<u8> {
                    let mut buffer = itoa::Buffer::new();
                    buffer.format(*self).as_bytes().to_vec()
                }
            }
        )*
    };
}

int_to_arg!(i32, i64, u16, u32, u64, usize);

impl ToArg for f64 {
    fn to_arg(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

/// Build a [`Command`] from a name and arguments
///
/// ```
/// use valkey_cluster_client::cmd;
/// let c = cmd!("SET", "k", "v");
/// assert_eq!(c.len(), 3);
/// ```
#[macro_export]
macro_rules! cmd {
    ($name:expr $(, $arg:expr)* $(,)?) => {
        $crate::command::Command::new($name)$(.arg($arg))*
    };
}

/// A command and its arguments
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
    /// Explicit key positions; `None` means use the command table
    key_positions: Option<Vec<usize>>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Self {
        Self {
            args: vec![name.to_arg()],
            key_positions: None,
        }
    }

    /// Build from raw argument list (name first)
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        Self {
            args: args.into_iter().map(|a| a.to_arg()).collect(),
            key_positions: None,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Override the key positions (indexes into the argument list, name = 0)
    pub fn with_key_positions(mut self, positions: Vec<usize>) -> Self {
        self.key_positions = Some(positions);
        self
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Upper-cased command name
    pub fn name(&self) -> Cow<'_, str> {
        match self.args.first() {
            Some(n) => match std::str::from_utf8(n) {
                Ok(s) if s.bytes().all(|b| !b.is_ascii_lowercase()) => Cow::Borrowed(s),
                Ok(s) => Cow::Owned(s.to_ascii_uppercase()),
                Err(_) => Cow::Owned(String::from_utf8_lossy(n).to_ascii_uppercase()),
            },
            None => Cow::Borrowed(""),
        }
    }

    /// Positions of key arguments
    pub fn key_positions(&self) -> Vec<usize> {
        match &self.key_positions {
            Some(p) => p.iter().copied().filter(|&i| i < self.args.len()).collect(),
            None => table_key_positions(&self.name(), &self.args),
        }
    }

    /// Key arguments in order
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.key_positions()
            .into_iter()
            .map(move |i| self.args[i].as_slice())
    }

    /// Whether the command never writes and may be served by a replica
    pub fn is_read_only(&self) -> bool {
        is_read_only_command(&self.name())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for arg in &self.args {
            list.entry(&String::from_utf8_lossy(arg));
        }
        list.finish()
    }
}

/// Key positions for known commands
fn table_key_positions(name: &str, args: &[Vec<u8>]) -> Vec<usize> {
    let argc = args.len();
    match name {
        // Keyless commands route to any primary
        "PING" | "ECHO" | "INFO" | "CLUSTER" | "ASKING" | "READONLY" | "READWRITE" | "AUTH"
        | "HELLO" | "SELECT" | "TIME" | "DBSIZE" | "FLUSHALL" | "FLUSHDB" | "CONFIG"
        | "CLIENT" | "COMMAND" | "SCRIPT" | "FUNCTION" | "PUBLISH" | "SPUBLISH" | "KEYS"
        | "SCAN" | "RANDOMKEY" | "LASTSAVE" | "SAVE" | "BGSAVE" | "WAIT" | "MULTI" | "EXEC"
        | "DISCARD" | "QUIT" | "RESET" | "SLOWLOG" | "LATENCY" => Vec::new(),

        // Subcommand form: OBJECT ENCODING key, MEMORY USAGE key
        "OBJECT" | "MEMORY" => {
            if argc > 2 {
                vec![2]
            } else {
                Vec::new()
            }
        }

        // Every argument is a key
        "DEL" | "UNLINK" | "EXISTS" | "TOUCH" | "MGET" | "WATCH" | "SINTER" | "SUNION"
        | "SDIFF" | "SINTERSTORE" | "SUNIONSTORE" | "SDIFFSTORE" | "PFCOUNT" | "PFMERGE"
        | "RENAME" | "RENAMENX" | "RPOPLPUSH" => (1..argc).collect(),

        // Source and destination keys, then non-key options
        "SMOVE" | "LMOVE" | "BLMOVE" | "COPY" | "BRPOPLPUSH" | "GEOSEARCHSTORE"
        | "ZRANGESTORE" => (1..argc.min(3)).collect(),

        // key value key value ...
        "MSET" | "MSETNX" => (1..argc).step_by(2).collect(),

        // numkeys at position 2, keys follow
        "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
            numkeys_positions(args, 2)
        }

        // destination + numkeys at position 2
        "ZUNIONSTORE" | "ZINTERSTORE" | "ZDIFFSTORE" => {
            let mut keys = vec![1];
            keys.extend(numkeys_positions(args, 2));
            keys.retain(|&i| i < argc);
            keys
        }

        // numkeys at position 1
        "ZUNION" | "ZINTER" | "ZDIFF" | "ZINTERCARD" | "SINTERCARD" | "LMPOP" | "ZMPOP" => {
            numkeys_positions(args, 1)
        }

        // numkeys at position 2 after the timeout
        "BLMPOP" | "BZMPOP" => numkeys_positions(args, 2),

        // keys then a trailing timeout
        "BLPOP" | "BRPOP" | "BZPOPMIN" | "BZPOPMAX" => (1..argc.saturating_sub(1)).collect(),

        "XREAD" | "XREADGROUP" => stream_key_positions(args),

        _ => {
            if argc > 1 {
                vec![1]
            } else {
                Vec::new()
            }
        }
    }
}

/// Keys following a numkeys argument at `numkeys_at`
fn numkeys_positions(args: &[Vec<u8>], numkeys_at: usize) -> Vec<usize> {
    let count = args
        .get(numkeys_at)
        .and_then(|a| std::str::from_utf8(a).ok())
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);
    let start = numkeys_at + 1;
    (start..start.saturating_add(count).min(args.len())).collect()
}

/// XREAD ... STREAMS k1 k2 id1 id2: the first half after STREAMS are keys
fn stream_key_positions(args: &[Vec<u8>]) -> Vec<usize> {
    let Some(streams_at) = args
        .iter()
        .position(|a| a.eq_ignore_ascii_case(b"STREAMS"))
    else {
        return Vec::new();
    };
    let rest = args.len() - streams_at - 1;
    let start = streams_at + 1;
    (start..start + rest / 2).collect()
}

/// Commands that can be routed to replicas
pub fn is_read_only_command(name: &str) -> bool {
    matches!(
        name,
        "GET"
            | "MGET"
            | "STRLEN"
            | "GETRANGE"
            | "SUBSTR"
            | "EXISTS"
            | "TYPE"
            | "TTL"
            | "PTTL"
            | "EXPIRETIME"
            | "PEXPIRETIME"
            | "HGET"
            | "HMGET"
            | "HGETALL"
            | "HKEYS"
            | "HVALS"
            | "HLEN"
            | "HEXISTS"
            | "HSTRLEN"
            | "HSCAN"
            | "HRANDFIELD"
            | "LRANGE"
            | "LLEN"
            | "LINDEX"
            | "LPOS"
            | "SMEMBERS"
            | "SCARD"
            | "SISMEMBER"
            | "SMISMEMBER"
            | "SRANDMEMBER"
            | "SSCAN"
            | "SUNION"
            | "SINTER"
            | "SINTERCARD"
            | "SDIFF"
            | "ZRANGE"
            | "ZRANGEBYSCORE"
            | "ZRANGEBYLEX"
            | "ZREVRANGE"
            | "ZREVRANGEBYSCORE"
            | "ZREVRANGEBYLEX"
            | "ZCARD"
            | "ZSCORE"
            | "ZMSCORE"
            | "ZCOUNT"
            | "ZLEXCOUNT"
            | "ZRANK"
            | "ZREVRANK"
            | "ZRANDMEMBER"
            | "ZSCAN"
            | "ZUNION"
            | "ZINTER"
            | "ZDIFF"
            | "XRANGE"
            | "XREVRANGE"
            | "XLEN"
            | "XREAD"
            | "BITCOUNT"
            | "BITPOS"
            | "GETBIT"
            | "PFCOUNT"
            | "GEODIST"
            | "GEOHASH"
            | "GEOPOS"
            | "GEOSEARCH"
            | "GEORADIUS_RO"
            | "GEORADIUSBYMEMBER_RO"
            | "EVAL_RO"
            | "EVALSHA_RO"
            | "FCALL_RO"
            | "DUMP"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(c: &Command) -> Vec<String> {
        c.keys()
            .map(|k| String::from_utf8_lossy(k).to_string())
            .collect()
    }

    #[test]
    fn test_single_key_commands() {
        assert_eq!(keys_of(&cmd!("SET", "k", "v")), vec!["k"]);
        assert_eq!(keys_of(&cmd!("get", "k")), vec!["k"]);
        assert_eq!(keys_of(&cmd!("HSET", "h", "f", "v")), vec!["h"]);
    }

    #[test]
    fn test_keyless_commands() {
        assert!(keys_of(&cmd!("PING")).is_empty());
        assert!(keys_of(&cmd!("CLUSTER", "NODES")).is_empty());
        assert!(keys_of(&cmd!("INFO", "server")).is_empty());
    }

    #[test]
    fn test_multi_key_commands() {
        assert_eq!(keys_of(&cmd!("MGET", "a", "b", "c")), vec!["a", "b", "c"]);
        assert_eq!(keys_of(&cmd!("DEL", "a", "b")), vec!["a", "b"]);
        assert_eq!(keys_of(&cmd!("MSET", "a", "1", "b", "2")), vec!["a", "b"]);
        assert_eq!(keys_of(&cmd!("SMOVE", "src", "dst", "m")), vec!["src", "dst"]);
    }

    #[test]
    fn test_numkeys_commands() {
        assert_eq!(
            keys_of(&cmd!("EVAL", "return 1", 2, "a", "b", "arg")),
            vec!["a", "b"]
        );
        assert_eq!(
            keys_of(&cmd!("ZUNIONSTORE", "dst", 2, "a", "b", "WEIGHTS", 1, 2)),
            vec!["dst", "a", "b"]
        );
        assert_eq!(keys_of(&cmd!("SINTERCARD", 2, "a", "b", "LIMIT", 5)), vec!["a", "b"]);
        assert!(keys_of(&cmd!("EVAL", "return 1", 0)).is_empty());
    }

    #[test]
    fn test_blocking_pop_excludes_timeout() {
        assert_eq!(keys_of(&cmd!("BLPOP", "a", "b", 0)), vec!["a", "b"]);
    }

    #[test]
    fn test_xread_keys() {
        assert_eq!(
            keys_of(&cmd!("XREAD", "COUNT", 2, "STREAMS", "s1", "s2", "0", "0")),
            vec!["s1", "s2"]
        );
    }

    #[test]
    fn test_explicit_key_positions() {
        let c = cmd!("CUSTOM.CMD", "opt", "k1", "k2").with_key_positions(vec![2, 3, 99]);
        assert_eq!(keys_of(&c), vec!["k1", "k2"]);
    }

    #[test]
    fn test_read_only() {
        assert!(cmd!("get", "k").is_read_only());
        assert!(!cmd!("SET", "k", "v").is_read_only());
    }

    #[test]
    fn test_integer_args() {
        let c = cmd!("EXPIRE", "k", 60u64);
        assert_eq!(c.args()[2], b"60".to_vec());
    }
}

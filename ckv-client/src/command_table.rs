//! # Command Table
//!
//! Purpose: Static per-command metadata the router needs: where the keys
//! are, whether the command only reads, where keyless commands go by
//! default, how multi-node replies are merged, and how long a blocking
//! command may legitimately wait.
//!
//! ## Design Principles
//! 1. **Enumerated, Not Inferred**: Every command with non-default routing or
//!    reply merging is listed explicitly. Reply shape never depends on reply
//!    content.
//! 2. **Container Commands by Subcommand**: `CONFIG SET` and `CONFIG GET`
//!    route differently, so they are looked up by their full name.
//! 3. **Unknown Means First Key**: Commands not in the table (module commands
//!    included) route by their first argument, or randomly when they have
//!    none.

use std::time::Duration;

use ckv_common::Command;

/// Where the keys of a command sit in its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// Keyless.
    None,
    /// One key at this argument index.
    Index(usize),
    /// Every argument from this index on (`DEL k1 k2`, `BITOP AND dest k1`).
    AllFrom(usize),
    /// Every other argument from the first (`MSET k1 v1 k2 v2`).
    Interleaved,
    /// Every argument but the last (`BLPOP k1 k2 timeout`).
    AllButLast,
    /// The first two arguments (`RENAME src dst`).
    FirstTwo,
    /// A key count at `count_at` followed by that many keys (`EVAL s 2 k1 k2`).
    NumKeys { count_at: usize },
    /// A destination key, then a key count and keys (`ZUNIONSTORE d 2 k1 k2`).
    DestAndNumKeys,
    /// Keys are the first half of the arguments after `STREAMS`.
    Streams,
    /// An explicit slot number at this argument index (`CLUSTER COUNTKEYSINSLOT`).
    SlotAt(usize),
}

/// Default target for a command that carries no key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeylessRoute {
    Random,
    AllPrimaries,
    AllNodes,
}

/// How replies from several nodes collapse into one value.
///
/// Commands without a policy return a per-node map instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    /// Every node must succeed; the first failure aborts the call. Returns
    /// one of the (identical) replies.
    AllSucceeded,
    /// Return the first success; fail only if every node failed.
    OneSucceeded,
    /// Integer replies are summed.
    AggregateSum,
    /// Array replies are concatenated.
    CombineArrays,
}

/// Where a blocking command carries its wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingSpec {
    /// Last argument, in (possibly fractional) seconds.
    LastArgSecs,
    /// Argument at this index, in seconds.
    ArgSecs(usize),
    /// Value after the `BLOCK` token, in milliseconds.
    BlockMs,
}

/// Wait time of a blocking command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingTimeout {
    /// A timeout of 0: the command may block indefinitely.
    Forever,
    For(Duration),
}

/// Routing metadata for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub keys: KeySpec,
    pub readonly: bool,
    pub keyless_route: KeylessRoute,
    pub policy: Option<ResponsePolicy>,
    pub blocking: Option<BlockingSpec>,
}

impl CommandInfo {
    const fn keyed(keys: KeySpec) -> Self {
        CommandInfo {
            keys,
            readonly: false,
            keyless_route: KeylessRoute::Random,
            policy: None,
            blocking: None,
        }
    }

    const fn keyless(route: KeylessRoute, policy: Option<ResponsePolicy>) -> Self {
        CommandInfo {
            keys: KeySpec::None,
            readonly: false,
            keyless_route: route,
            policy,
            blocking: None,
        }
    }

    fn blocking(mut self, spec: BlockingSpec) -> Self {
        self.blocking = Some(spec);
        self
    }
}

const CONTAINER_COMMANDS: &[&str] = &[
    "ACL", "CLIENT", "CLUSTER", "COMMAND", "CONFIG", "FUNCTION", "LATENCY", "MEMORY", "MODULE",
    "OBJECT", "PUBSUB", "SCRIPT", "SLOWLOG", "XGROUP", "XINFO",
];

/// Name used for table lookups: `CONFIG SET` for container commands, the
/// bare upper-cased name otherwise.
pub fn lookup_name(cmd: &Command) -> String {
    let name = cmd.name_upper();
    if CONTAINER_COMMANDS.contains(&name.as_str()) {
        cmd.full_name()
    } else {
        name
    }
}

/// Routing metadata for `cmd`.
pub fn lookup(cmd: &Command) -> CommandInfo {
    use KeylessRoute::*;
    use ResponsePolicy::*;

    let name = lookup_name(cmd);
    let mut info = match name.as_str() {
        // Keyless, fanned out to every primary.
        "PING" | "FLUSHALL" | "FLUSHDB" | "FUNCTION LOAD" | "FUNCTION DELETE" | "FUNCTION FLUSH"
        | "FUNCTION RESTORE" | "MEMORY PURGE" => CommandInfo::keyless(AllPrimaries, Some(AllSucceeded)),
        "DBSIZE" => CommandInfo::keyless(AllPrimaries, Some(AggregateSum)),
        "KEYS" => CommandInfo::keyless(AllPrimaries, Some(CombineArrays)),
        "INFO" | "MEMORY STATS" | "MEMORY DOCTOR" | "RANDOMKEY" | "SCRIPT EXISTS" => {
            CommandInfo::keyless(AllPrimaries, None)
        }
        "SCRIPT KILL" | "FUNCTION KILL" => CommandInfo::keyless(AllPrimaries, Some(OneSucceeded)),

        // Keyless, fanned out to every node.
        "CONFIG SET" | "CONFIG RESETSTAT" | "CONFIG REWRITE" | "SCRIPT FLUSH" | "SCRIPT LOAD"
        | "CLIENT SETNAME" | "ACL SETUSER" | "ACL DELUSER" | "ACL SAVE" | "SLOWLOG RESET"
        | "LATENCY RESET" => CommandInfo::keyless(AllNodes, Some(AllSucceeded)),
        "SLOWLOG GET" | "PUBSUB CHANNELS" | "PUBSUB SHARDCHANNELS" => {
            CommandInfo::keyless(AllNodes, Some(CombineArrays))
        }
        "SLOWLOG LEN" | "PUBSUB NUMPAT" => CommandInfo::keyless(AllNodes, Some(AggregateSum)),

        // Keyless, one node is enough.
        "ECHO" | "TIME" | "LASTSAVE" | "CONFIG GET" | "CLIENT GETNAME" | "CLIENT ID"
        | "CLIENT INFO" | "CLIENT LIST" | "CLUSTER INFO" | "CLUSTER NODES" | "CLUSTER SLOTS"
        | "CLUSTER SHARDS" | "CLUSTER MYID" | "CLUSTER KEYSLOT" | "COMMAND" | "COMMAND COUNT"
        | "COMMAND INFO" | "COMMAND DOCS" | "FUNCTION LIST" | "FUNCTION STATS" | "ACL WHOAMI"
        | "ACL LIST" | "ACL USERS" | "ACL GETUSER" | "MODULE LIST" | "READONLY" | "READWRITE"
        | "MULTI" | "EXEC" | "DISCARD" | "ASKING" | "HELLO" | "AUTH" | "SELECT" | "SCAN" | "WAIT"
        | "WAITAOF" => CommandInfo::keyless(Random, None),

        "CLUSTER COUNTKEYSINSLOT" | "CLUSTER GETKEYSINSLOT" => CommandInfo::keyed(KeySpec::SlotAt(1)),

        // Multi-key commands.
        "DEL" | "UNLINK" | "EXISTS" | "TOUCH" | "MGET" | "WATCH" | "SINTER" | "SUNION" | "SDIFF"
        | "SINTERSTORE" | "SUNIONSTORE" | "SDIFFSTORE" | "PFCOUNT" | "PFMERGE" => {
            CommandInfo::keyed(KeySpec::AllFrom(0))
        }
        "BITOP" => CommandInfo::keyed(KeySpec::AllFrom(1)),
        "MSET" | "MSETNX" => CommandInfo::keyed(KeySpec::Interleaved),
        "RENAME" | "RENAMENX" | "COPY" | "SMOVE" | "LMOVE" | "RPOPLPUSH" | "LCS"
        | "GEOSEARCHSTORE" | "ZRANGESTORE" => CommandInfo::keyed(KeySpec::FirstTwo),
        "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
            CommandInfo::keyed(KeySpec::NumKeys { count_at: 1 })
        }
        "LMPOP" | "ZMPOP" | "SINTERCARD" | "ZDIFF" | "ZINTER" | "ZUNION" | "ZINTERCARD" => {
            CommandInfo::keyed(KeySpec::NumKeys { count_at: 0 })
        }
        "ZUNIONSTORE" | "ZINTERSTORE" | "ZDIFFSTORE" => CommandInfo::keyed(KeySpec::DestAndNumKeys),
        "XREAD" | "XREADGROUP" => {
            CommandInfo::keyed(KeySpec::Streams).blocking(BlockingSpec::BlockMs)
        }

        // Blocking commands.
        "BLPOP" | "BRPOP" | "BZPOPMIN" | "BZPOPMAX" => {
            CommandInfo::keyed(KeySpec::AllButLast).blocking(BlockingSpec::LastArgSecs)
        }
        "BLMOVE" | "BRPOPLPUSH" => {
            CommandInfo::keyed(KeySpec::FirstTwo).blocking(BlockingSpec::LastArgSecs)
        }
        "BLMPOP" | "BZMPOP" => {
            CommandInfo::keyed(KeySpec::NumKeys { count_at: 1 }).blocking(BlockingSpec::ArgSecs(0))
        }

        // Subcommands whose key is the second argument.
        "OBJECT ENCODING" | "OBJECT FREQ" | "OBJECT IDLETIME" | "OBJECT REFCOUNT" | "MEMORY USAGE"
        | "XINFO STREAM" | "XINFO GROUPS" | "XINFO CONSUMERS" | "XGROUP CREATE" | "XGROUP DESTROY"
        | "XGROUP SETID" | "XGROUP CREATECONSUMER" | "XGROUP DELCONSUMER" => {
            CommandInfo::keyed(KeySpec::Index(1))
        }

        // Unlisted subcommands never take their subcommand name as a key.
        _ if CONTAINER_COMMANDS.contains(&cmd.name_upper().as_str()) => CommandInfo::keyless(Random, None),
        _ => CommandInfo::keyed(KeySpec::Index(0)),
    };
    info.readonly = is_readonly(&name);
    info
}

fn is_readonly(name: &str) -> bool {
    matches!(
        name,
        "GET" | "MGET" | "GETRANGE" | "SUBSTR" | "STRLEN" | "EXISTS" | "TYPE" | "TTL" | "PTTL"
            | "EXPIRETIME" | "PEXPIRETIME" | "DUMP" | "GETBIT" | "BITCOUNT" | "BITPOS" | "LCS"
            | "HGET" | "HMGET" | "HGETALL" | "HKEYS" | "HVALS" | "HLEN" | "HEXISTS" | "HSTRLEN"
            | "HRANDFIELD" | "HSCAN" | "LRANGE" | "LLEN" | "LINDEX" | "LPOS" | "SMEMBERS"
            | "SISMEMBER" | "SMISMEMBER" | "SCARD" | "SRANDMEMBER" | "SINTER" | "SUNION" | "SDIFF"
            | "SINTERCARD" | "SSCAN" | "ZRANGE" | "ZRANGEBYSCORE" | "ZRANGEBYLEX" | "ZREVRANGE"
            | "ZREVRANGEBYSCORE" | "ZREVRANGEBYLEX" | "ZSCORE" | "ZMSCORE" | "ZCARD" | "ZCOUNT"
            | "ZLEXCOUNT" | "ZRANK" | "ZREVRANK" | "ZRANDMEMBER" | "ZDIFF" | "ZINTER" | "ZUNION"
            | "ZINTERCARD" | "ZSCAN" | "PFCOUNT" | "XRANGE" | "XREVRANGE" | "XLEN" | "XREAD"
            | "XINFO STREAM" | "XINFO GROUPS" | "XINFO CONSUMERS" | "GEOPOS" | "GEODIST"
            | "GEOHASH" | "GEOSEARCH" | "EVAL_RO" | "EVALSHA_RO" | "FCALL_RO" | "OBJECT ENCODING"
            | "OBJECT FREQ" | "OBJECT IDLETIME" | "OBJECT REFCOUNT" | "MEMORY USAGE"
    )
}

/// Keys carried by `cmd` under `spec`.
///
/// Missing or malformed counts yield the keys that can be found; a routing
/// decision is never made on arguments that are not there.
pub fn keys<'a>(cmd: &'a Command, spec: KeySpec) -> Vec<&'a [u8]> {
    let args = cmd.args();
    let slice = |from: usize, to: usize| -> Vec<&'a [u8]> {
        let to = to.min(args.len());
        if from >= to {
            return Vec::new();
        }
        args[from..to].iter().map(|a| a.as_ref()).collect()
    };

    match spec {
        KeySpec::None | KeySpec::SlotAt(_) => Vec::new(),
        KeySpec::Index(idx) => slice(idx, idx + 1),
        KeySpec::AllFrom(idx) => slice(idx, args.len()),
        KeySpec::Interleaved => args.iter().step_by(2).map(|a| a.as_ref()).collect(),
        KeySpec::AllButLast => slice(0, args.len().saturating_sub(1)),
        KeySpec::FirstTwo => slice(0, 2),
        KeySpec::NumKeys { count_at } => match parse_count(cmd.arg_at(count_at)) {
            Some(n) => slice(count_at + 1, count_at + 1 + n),
            None => Vec::new(),
        },
        KeySpec::DestAndNumKeys => {
            let mut keys = slice(0, 1);
            if let Some(n) = parse_count(cmd.arg_at(1)) {
                keys.extend(slice(2, 2 + n));
            }
            keys
        }
        KeySpec::Streams => {
            let Some(pos) = args.iter().position(|a| a.eq_ignore_ascii_case(b"STREAMS")) else {
                return Vec::new();
            };
            let rest = args.len() - pos - 1;
            slice(pos + 1, pos + 1 + rest / 2)
        }
    }
}

/// Explicit slot argument for commands that address a slot directly.
pub fn slot_argument(cmd: &Command, spec: KeySpec) -> Option<u16> {
    match spec {
        KeySpec::SlotAt(idx) => std::str::from_utf8(cmd.arg_at(idx)?)
            .ok()?
            .parse::<u16>()
            .ok(),
        _ => None,
    }
}

/// Wait time of a blocking command, if `cmd` is one and the timeout argument
/// is present.
pub fn blocking_timeout(cmd: &Command, info: &CommandInfo) -> Option<BlockingTimeout> {
    let (raw, scale_ms) = match info.blocking? {
        BlockingSpec::LastArgSecs => (cmd.args().last()?.as_ref(), 1000.0),
        BlockingSpec::ArgSecs(idx) => (cmd.arg_at(idx)?, 1000.0),
        BlockingSpec::BlockMs => {
            let pos = cmd.args().iter().position(|a| a.eq_ignore_ascii_case(b"BLOCK"))?;
            (cmd.arg_at(pos + 1)?, 1.0)
        }
    };
    let value: f64 = std::str::from_utf8(raw).ok()?.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value == 0.0 {
        return Some(BlockingTimeout::Forever);
    }
    Some(BlockingTimeout::For(Duration::from_micros(
        (value * scale_ms * 1000.0) as u64,
    )))
}

fn parse_count(raw: Option<&[u8]>) -> Option<usize> {
    std::str::from_utf8(raw?).ok()?.parse().ok()
}

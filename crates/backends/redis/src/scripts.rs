//! Lua scripts backing the atomic meta primitives.
//!
//! Scripts run atomically on the server, which is what makes the
//! conditional claim and the fenced delete safe under concurrent callers
//! from unrelated processes.

/// Atomic set-if-absent with optional expiry.
///
/// KEYS\[1\] = the meta key
/// ARGV\[1\] = value to set
/// ARGV\[2\] = TTL in milliseconds (0 means no expiry)
///
/// Returns 1 if the key was newly set, 0 if a live entry already existed.
pub const CHECK_AND_SET: &str = r"
local ttl = tonumber(ARGV[2])
local ok
if ttl > 0 then
    ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ttl)
else
    ok = redis.call('SET', KEYS[1], ARGV[1], 'NX')
end
if ok then
    return 1
end
return 0
";

/// Fenced delete: remove the key only while it still holds the expected
/// value.
///
/// KEYS\[1\] = the meta key
/// ARGV\[1\] = expected current value
///
/// Returns 1 if deleted, 0 if the value did not match (or the key is gone).
pub const COMPARE_AND_DELETE: &str = r"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
";

//! Cached cluster slot map.

use std::collections::HashMap;

use procstore_core::error::StoreError;

/// One contiguous slot range owned by a primary node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub addr: String,
}

/// Snapshot of slot ownership, plus per-slot corrections learned from
/// `MOVED` redirects since the last full refresh.
#[derive(Debug, Default)]
pub(crate) struct Topology {
    ranges: Vec<SlotRange>,
    moved: HashMap<u16, String>,
}

impl Topology {
    /// Current owner of a slot, if known. `MOVED` corrections take
    /// precedence over the last full snapshot.
    pub fn node_for(&self, slot: u16) -> Option<&str> {
        if let Some(addr) = self.moved.get(&slot) {
            return Some(addr);
        }
        self.ranges
            .iter()
            .find(|r| r.start <= slot && slot <= r.end)
            .map(|r| r.addr.as_str())
    }

    /// Record the new owner a `MOVED` redirect named for one slot.
    pub fn apply_moved(&mut self, slot: u16, addr: String) {
        self.moved.insert(slot, addr);
    }

    /// Replace the snapshot with a freshly fetched slot map, dropping all
    /// per-slot corrections.
    pub fn replace(&mut self, ranges: Vec<SlotRange>) {
        self.ranges = ranges;
        self.moved.clear();
    }
}

/// Parse the reply of `CLUSTER SLOTS` into owned ranges.
///
/// The reply is an array of `[start, end, [primary-ip, port, ...], ...]`
/// entries; replicas after the primary are ignored. Nodes sometimes
/// report an empty ip for "the address you dialed", in which case
/// `fallback_host` fills the gap.
pub(crate) fn parse_cluster_slots(
    value: &redis::Value,
    fallback_host: &str,
) -> Result<Vec<SlotRange>, StoreError> {
    let corrupt = |what: &str| StoreError::Data(format!("unexpected CLUSTER SLOTS reply: {what}"));

    let redis::Value::Array(entries) = value else {
        return Err(corrupt("top level is not an array"));
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let redis::Value::Array(fields) = entry else {
            return Err(corrupt("range entry is not an array"));
        };
        let (Some(redis::Value::Int(start)), Some(redis::Value::Int(end))) =
            (fields.first(), fields.get(1))
        else {
            return Err(corrupt("range bounds are not integers"));
        };
        let Some(redis::Value::Array(primary)) = fields.get(2) else {
            return Err(corrupt("range has no primary node"));
        };
        let host = match primary.first() {
            Some(redis::Value::BulkString(ip)) if !ip.is_empty() => {
                String::from_utf8_lossy(ip).into_owned()
            }
            _ => fallback_host.to_owned(),
        };
        let Some(redis::Value::Int(port)) = primary.get(1) else {
            return Err(corrupt("primary node has no port"));
        };

        let start = u16::try_from(*start).map_err(|_| corrupt("slot out of range"))?;
        let end = u16::try_from(*end).map_err(|_| corrupt("slot out of range"))?;
        ranges.push(SlotRange {
            start,
            end,
            addr: format!("{host}:{port}"),
        });
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn slots_reply() -> Value {
        Value::Array(vec![
            Value::Array(vec![
                Value::Int(0),
                Value::Int(8191),
                Value::Array(vec![Value::BulkString(b"10.0.0.1".to_vec()), Value::Int(7000)]),
            ]),
            Value::Array(vec![
                Value::Int(8192),
                Value::Int(16383),
                Value::Array(vec![Value::BulkString(b"10.0.0.2".to_vec()), Value::Int(7001)]),
            ]),
        ])
    }

    #[test]
    fn parses_two_ranges() {
        let ranges = parse_cluster_slots(&slots_reply(), "seed").unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].addr, "10.0.0.1:7000");
        assert_eq!(ranges[1].start, 8192);
    }

    #[test]
    fn empty_ip_falls_back_to_dialed_host() {
        let reply = Value::Array(vec![Value::Array(vec![
            Value::Int(0),
            Value::Int(16383),
            Value::Array(vec![Value::BulkString(Vec::new()), Value::Int(7000)]),
        ])]);
        let ranges = parse_cluster_slots(&reply, "seed-host").unwrap();
        assert_eq!(ranges[0].addr, "seed-host:7000");
    }

    #[test]
    fn moved_correction_overrides_snapshot() {
        let mut topo = Topology::default();
        topo.replace(parse_cluster_slots(&slots_reply(), "seed").unwrap());
        assert_eq!(topo.node_for(100), Some("10.0.0.1:7000"));

        topo.apply_moved(100, "10.0.0.3:7002".into());
        assert_eq!(topo.node_for(100), Some("10.0.0.3:7002"));
        assert_eq!(topo.node_for(101), Some("10.0.0.1:7000"));

        // A full refresh supersedes corrections.
        topo.replace(parse_cluster_slots(&slots_reply(), "seed").unwrap());
        assert_eq!(topo.node_for(100), Some("10.0.0.1:7000"));
    }

    #[test]
    fn garbage_reply_is_a_data_error() {
        assert!(matches!(
            parse_cluster_slots(&Value::Int(3), "seed"),
            Err(StoreError::Data(_))
        ));
    }
}

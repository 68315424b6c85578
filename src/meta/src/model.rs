// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Identifiers and span model shared by every subsystem.

use std::fmt;
use std::sync::Arc;

use spanstream_pb as pb;
use uuid::Uuid;

pub type TableId = i64;
pub type SchemaId = i64;
pub type Ts = u64;

/// 128-bit identity of one dispatcher. Ordered, so the smallest influenced
/// dispatcher can be picked deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DispatcherId(u128);

impl DispatcherId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    pub fn from_pb(pb: pb::common::DispatcherId) -> Self {
        Self(pb.to_u128())
    }

    pub fn to_pb(self) -> pb::common::DispatcherId {
        pb::common::DispatcherId::from_u128(self.0)
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_u128(self.0).fmt(f)
    }
}

impl fmt::Debug for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Opaque identity of a worker node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a changefeed; doubles as the identity of its maintainer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug)]
pub struct ChangefeedId(Arc<str>);

impl ChangefeedId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChangefeedId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for ChangefeedId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for ChangefeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A maintainer is addressed by the changefeed it runs.
pub type MaintainerId = ChangefeedId;

const SPAN_KEY_PREFIX: u8 = b't';

/// The canonical span covering the whole key range of `table_id`.
pub fn span_for_table(table_id: TableId) -> pb::common::TableSpan {
    pb::common::TableSpan {
        table_id,
        start_key: table_key_prefix(table_id),
        end_key: table_key_prefix(table_id + 1),
    }
}

fn table_key_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(SPAN_KEY_PREFIX);
    key.extend_from_slice(&table_id.to_be_bytes());
    key
}

/// Midpoint of a span's key range, if the range is wide enough to split.
pub fn span_split_key(span: &pb::common::TableSpan) -> Option<Vec<u8>> {
    if span.start_key >= span.end_key {
        return None;
    }
    let len = span.start_key.len().max(span.end_key.len());
    let at = |key: &[u8], i: usize| key.get(i).copied().unwrap_or(0) as u16;

    // Keys are base-256 numbers (right-padded with zeros): add them, then
    // halve most-significant-first. `sum` keeps one leading overflow byte.
    let mut sum = vec![0u16; len + 1];
    let mut carry = 0u16;
    for i in (0..len).rev() {
        let s = at(&span.start_key, i) + at(&span.end_key, i) + carry;
        sum[i + 1] = s & 0xff;
        carry = s >> 8;
    }
    sum[0] = carry;

    let mut mid = Vec::with_capacity(len + 1);
    let mut rem = 0u16;
    for digit in sum {
        let cur = rem * 256 + digit;
        mid.push((cur / 2) as u8);
        rem = cur % 2;
    }
    // The quotient fits in `len` bytes, so the leading byte is always zero.
    mid.remove(0);
    if rem != 0 {
        mid.push(128);
    }
    (mid.as_slice() > span.start_key.as_slice() && mid.as_slice() < span.end_key.as_slice())
        .then_some(mid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_id_pb_round_trip() {
        let id = DispatcherId::new();
        assert_eq!(DispatcherId::from_pb(id.to_pb()), id);
    }

    #[test]
    fn test_span_for_table_ordering() {
        let a = span_for_table(1);
        let b = span_for_table(2);
        assert_eq!(a.end_key, b.start_key);
        assert!(a.start_key < a.end_key);
    }

    #[test]
    fn test_span_split_key() {
        let span = span_for_table(7);
        let mid = span_split_key(&span).unwrap();
        assert!(mid.as_slice() > span.start_key.as_slice());
        assert!(mid.as_slice() < span.end_key.as_slice());

        let degenerate = pb::common::TableSpan {
            table_id: 7,
            start_key: vec![1],
            end_key: vec![1],
        };
        assert!(span_split_key(&degenerate).is_none());
    }
}

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

/// A contiguous key range of one table.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Message)]
pub struct TableSpan {
    #[prost(int64, tag = "1")]
    pub table_id: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub end_key: Vec<u8>,
}

/// 128-bit dispatcher identity, split into two halves for the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Message)]
pub struct DispatcherId {
    #[prost(uint64, tag = "1")]
    pub high: u64,
    #[prost(uint64, tag = "2")]
    pub low: u64,
}

impl DispatcherId {
    pub fn to_u128(self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    pub fn from_u128(v: u128) -> Self {
        Self {
            high: (v >> 64) as u64,
            low: v as u64,
        }
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Watermark {
    #[prost(uint64, tag = "1")]
    pub checkpoint_ts: u64,
    #[prost(uint64, tag = "2")]
    pub resolved_ts: u64,
}

/// Observed lifecycle state of a remote component. The discriminants are
/// wire-stable.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ComponentState {
    Unknown = 0,
    Absent = 1,
    Working = 2,
    Stopped = 3,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn dispatcher_id_round_trip() {
        let id = DispatcherId::from_u128(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        assert_eq!(id.high, 0x0123_4567_89ab_cdef);
        assert_eq!(id.low, 0xfedc_ba98_7654_3210);
        assert_eq!(DispatcherId::from_u128(id.to_u128()), id);
    }

    #[test]
    fn component_state_wire_values() {
        assert_eq!(ComponentState::Unknown as i32, 0);
        assert_eq!(ComponentState::Absent as i32, 1);
        assert_eq!(ComponentState::Working as i32, 2);
        assert_eq!(ComponentState::Stopped as i32, 3);
    }

    #[test]
    fn table_span_encoding() {
        let span = TableSpan {
            table_id: 42,
            start_key: vec![0x74, 0x00],
            end_key: vec![0x74, 0x01],
        };
        let buf = span.encode_to_vec();
        assert_eq!(TableSpan::decode(buf.as_slice()).unwrap(), span);
    }
}

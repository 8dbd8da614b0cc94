// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Range partitioning of sorted rows

use std::cmp::Ordering;
use std::ops::Range;

use crate::error::Result;
use crate::key::{cmp_key_tuples, KeyTuple};

/// Maps `num_rows` rows, already sorted ascending by key, onto the
/// partitions defined by `boundaries`.
///
/// Partition `i` receives the rows whose key `k` satisfies
/// `boundaries[i - 1] < k <= boundaries[i]`, with open ends for the
/// first and last partition, so the result always holds
/// `boundaries.len() + 1` ranges. Empty ranges are emitted rather than
/// skipped: every map task in a plan must produce the same number of
/// partitions in the same order for the shuffle to line up.
///
/// `key_at` reads the key of the row at an index. Boundaries must be
/// sorted ascending, which plans validate when they are built.
pub fn partition_ranges<F>(
    num_rows: usize,
    boundaries: &[KeyTuple],
    key_at: F,
) -> Result<Vec<Range<usize>>>
where
    F: Fn(usize) -> Result<KeyTuple>,
{
    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0;
    for boundary in boundaries {
        let end = upper_bound(start, num_rows, boundary, &key_at)?;
        ranges.push(start..end);
        start = end;
    }
    ranges.push(start..num_rows);
    Ok(ranges)
}

/// First index in `[lo, hi)` whose key orders strictly above `boundary`.
fn upper_bound<F>(
    mut lo: usize,
    mut hi: usize,
    boundary: &KeyTuple,
    key_at: &F,
) -> Result<usize>
where
    F: Fn(usize) -> Result<KeyTuple>,
{
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if cmp_key_tuples(&key_at(mid)?, boundary)? == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    use datafusion::common::ScalarValue;

    fn int_keys(values: Vec<Option<i64>>) -> Vec<KeyTuple> {
        values
            .into_iter()
            .map(|v| vec![ScalarValue::Int64(v)])
            .collect()
    }

    fn ranges_for(
        keys: &[KeyTuple],
        boundaries: &[KeyTuple],
    ) -> Vec<Range<usize>> {
        partition_ranges(keys.len(), boundaries, |i| Ok(keys[i].clone())).unwrap()
    }

    #[test]
    fn boundary_is_an_inclusive_upper_bound() {
        let keys = int_keys(vec![Some(1), Some(1), Some(5), Some(6)]);
        let boundaries = int_keys(vec![Some(5)]);
        assert_eq!(ranges_for(&keys, &boundaries), vec![0..3, 3..4]);
    }

    #[test]
    fn empty_partitions_are_emitted() {
        let keys = int_keys(vec![Some(1), Some(9)]);
        let boundaries = int_keys(vec![Some(3), Some(3), Some(7)]);
        assert_eq!(
            ranges_for(&keys, &boundaries),
            vec![0..1, 1..1, 1..1, 1..2]
        );
    }

    #[test]
    fn no_rows_yields_all_empty_partitions() {
        let boundaries = int_keys(vec![Some(0)]);
        assert_eq!(ranges_for(&[], &boundaries), vec![0..0, 0..0]);
    }

    #[test]
    fn no_boundaries_yields_one_partition() {
        let keys = int_keys(vec![Some(2), Some(4)]);
        assert_eq!(ranges_for(&keys, &[]), vec![0..2]);
    }

    #[test]
    fn nulls_fall_in_the_first_partition() {
        let keys = int_keys(vec![None, None, Some(1)]);
        let boundaries = int_keys(vec![None]);
        assert_eq!(ranges_for(&keys, &boundaries), vec![0..2, 2..3]);
    }

    #[test]
    fn composite_keys_partition_lexicographically() {
        let keys = vec![
            vec![ScalarValue::Int64(Some(1)), ScalarValue::from("a")],
            vec![ScalarValue::Int64(Some(1)), ScalarValue::from("m")],
            vec![ScalarValue::Int64(Some(2)), ScalarValue::from("a")],
        ];
        let boundaries = vec![vec![
            ScalarValue::Int64(Some(1)),
            ScalarValue::from("m"),
        ]];
        assert_eq!(ranges_for(&keys, &boundaries), vec![0..2, 2..3]);
    }
}

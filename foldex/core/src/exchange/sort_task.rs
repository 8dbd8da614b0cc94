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

use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;
use rand::{rng, Rng};

use crate::block::{
    merge_sorted_blocks, normalize_block_types, BatchFormat, Block, BlockData,
};
use crate::error::{FoldexError, Result};
use crate::exchange::{validate_boundaries, ExchangeTask, MapTaskOutput};
use crate::key::{cmp_key_tuples, key_tuple_at, GroupKey, KeyTuple};
use crate::metadata::{BlockExecStats, BlockMetadata};

/// A range-partitioned total sort run as an exchange.
///
/// Map tasks sort each block by the key and split the sorted rows at
/// the configured boundaries; reduce tasks merge the sorted runs of
/// one range into that range's output block. Unlike
/// [`SortAggregateExchange`](crate::exchange::SortAggregateExchange)
/// no rows are collapsed, so duplicate keys survive in key order.
#[derive(Debug)]
pub struct SortExchange {
    boundaries: Vec<KeyTuple>,
    key: GroupKey,
    batch_format: BatchFormat,
}

impl SortExchange {
    /// Creates a sort exchange with `boundaries.len() + 1` reduce
    /// partitions. Boundaries must be sorted ascending and match the
    /// key arity.
    pub fn try_new(
        boundaries: Vec<KeyTuple>,
        key: GroupKey,
        batch_format: BatchFormat,
    ) -> Result<Self> {
        validate_boundaries(&boundaries, key.arity())?;
        Ok(Self {
            boundaries,
            key,
            batch_format,
        })
    }
}

impl ExchangeTask for SortExchange {
    fn output_partition_count(&self) -> usize {
        self.boundaries.len() + 1
    }

    fn map(&self, block_index: usize, block: Block) -> Result<MapTaskOutput> {
        let stats = BlockExecStats::builder();
        let partitions = block.sort_and_partition(&self.boundaries, &self.key)?;
        let metadata = block.get_metadata(Some(Arc::new(stats.build())));
        debug!(
            "sort map task {block_index} split {} rows into {} partitions",
            metadata.num_rows,
            partitions.len()
        );
        Ok(MapTaskOutput {
            partitions,
            metadata,
        })
    }

    // Merging sorted runs is the same operation whether or not the
    // reduction is partial.
    fn reduce(
        &self,
        blocks: &[Block],
        _partial_reduce: bool,
    ) -> Result<(Block, BlockMetadata)> {
        if blocks.is_empty() {
            return Err(FoldexError::Internal(
                "reduce requires at least one input block".to_owned(),
            ));
        }
        let normalized = normalize_block_types(blocks, Some(self.batch_format))?;
        merge_sorted_blocks(&normalized, &self.key)
    }
}

/// Derives partition boundaries from random key samples.
///
/// Each input block contributes up to `sample_size` randomly chosen
/// key values; the pooled samples are sorted and cut at evenly spaced
/// positions to yield `num_partitions - 1` boundaries. Skewed data
/// yields repeated boundaries, which the exchanges accept and turn
/// into empty partitions.
#[derive(Debug, Clone)]
pub struct BoundarySampler {
    sample_size: usize,
}

impl Default for BoundarySampler {
    fn default() -> Self {
        Self { sample_size: 100 }
    }
}

impl BoundarySampler {
    /// Creates a sampler drawing up to `sample_size` keys per block.
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    /// Samples boundaries for `num_partitions` partitions using the
    /// thread-local random number generator.
    pub fn sample_boundaries(
        &self,
        blocks: &[Block],
        key: &GroupKey,
        num_partitions: usize,
    ) -> Result<Vec<KeyTuple>> {
        self.sample_boundaries_with(&mut rng(), blocks, key, num_partitions)
    }

    /// Samples boundaries with a caller-provided generator, which
    /// makes boundary selection reproducible.
    pub fn sample_boundaries_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        blocks: &[Block],
        key: &GroupKey,
        num_partitions: usize,
    ) -> Result<Vec<KeyTuple>> {
        if num_partitions <= 1 {
            return Ok(vec![]);
        }
        let mut samples = Vec::new();
        for block in blocks {
            let num_rows = block.num_rows();
            if num_rows == 0 {
                continue;
            }
            let key_arrays = block.key_arrays(key)?;
            for _ in 0..self.sample_size.min(num_rows) {
                let row = rng.random_range(0..num_rows);
                samples.push(key_tuple_at(&key_arrays, row)?);
            }
        }
        if samples.is_empty() {
            return Err(FoldexError::General(
                "cannot sample partition boundaries from empty input".to_owned(),
            ));
        }

        let mut failed = None;
        samples.sort_by(|a, b| match cmp_key_tuples(a, b) {
            Ok(ordering) => ordering,
            Err(e) => {
                failed.get_or_insert(e);
                Ordering::Equal
            }
        });
        if let Some(e) = failed {
            return Err(e);
        }

        let mut boundaries = Vec::with_capacity(num_partitions - 1);
        for cut in 1..num_partitions {
            boundaries.push(samples[cut * samples.len() / num_partitions].clone());
        }
        Ok(boundaries)
    }
}

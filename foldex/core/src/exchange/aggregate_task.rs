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

use std::sync::Arc;

use log::debug;

use crate::aggregate::AggregateFn;
use crate::block::{
    aggregate_combined_blocks, normalize_block_types, BatchFormat, Block, BlockData,
};
use crate::error::{FoldexError, Result};
use crate::exchange::prune::{plan_projection, prune_block};
use crate::exchange::{validate_boundaries, ExchangeTask, MapTaskOutput};
use crate::key::{GroupKey, KeyTuple};
use crate::metadata::{BlockExecStats, BlockMetadata};

/// A grouped or global aggregation run as a sort exchange.
///
/// Map tasks prune unread columns, sort by the key, split the sorted
/// rows at the configured boundaries and collapse each partition into
/// one partial-aggregate row per key, so reduce tasks only ever see
/// key-deduplicated state. Reduce tasks merge those states and, unless
/// asked for a partial reduction, evaluate them into final values.
///
/// Without a key the whole input forms one group: there is a single
/// reduce partition and its output is exactly one row.
#[derive(Debug)]
pub struct SortAggregateExchange {
    boundaries: Vec<KeyTuple>,
    key: Option<GroupKey>,
    aggs: Vec<Arc<dyn AggregateFn>>,
    batch_format: BatchFormat,
    projection: Option<Vec<String>>,
}

impl SortAggregateExchange {
    /// Creates an aggregation exchange with `boundaries.len() + 1`
    /// reduce partitions.
    ///
    /// Boundaries must be sorted ascending and match the key arity. A
    /// global aggregation (no key) takes no boundaries and needs at
    /// least one aggregate; a grouped aggregation may run without
    /// aggregates, in which case it deduplicates keys.
    pub fn try_new(
        boundaries: Vec<KeyTuple>,
        key: Option<GroupKey>,
        aggs: Vec<Arc<dyn AggregateFn>>,
        batch_format: BatchFormat,
    ) -> Result<Self> {
        match &key {
            None => {
                if !boundaries.is_empty() {
                    return Err(FoldexError::Configuration(
                        "a global aggregation takes no partition boundaries"
                            .to_owned(),
                    ));
                }
                if aggs.is_empty() {
                    return Err(FoldexError::Configuration(
                        "a global aggregation needs at least one aggregate"
                            .to_owned(),
                    ));
                }
            }
            Some(key) => validate_boundaries(&boundaries, key.arity())?,
        }
        let projection = plan_projection(key.as_ref(), &aggs);
        Ok(Self {
            boundaries,
            key,
            aggs,
            batch_format,
            projection,
        })
    }
}

impl ExchangeTask for SortAggregateExchange {
    fn output_partition_count(&self) -> usize {
        self.boundaries.len() + 1
    }

    fn map(&self, block_index: usize, block: Block) -> Result<MapTaskOutput> {
        let stats = BlockExecStats::builder();
        let pruned = prune_block(&block, self.projection.as_deref())?;
        let partitions = match &self.key {
            None => vec![pruned.clone()],
            Some(key) => pruned.sort_and_partition(&self.boundaries, key)?,
        };
        let mut combined = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            combined.push(partition.combine(self.key.as_ref(), &self.aggs)?);
        }
        let metadata = pruned.get_metadata(Some(Arc::new(stats.build())));
        debug!(
            "aggregate map task {block_index} split {} rows into {} partitions",
            metadata.num_rows,
            combined.len()
        );
        Ok(MapTaskOutput {
            partitions: combined,
            metadata,
        })
    }

    fn reduce(
        &self,
        blocks: &[Block],
        partial_reduce: bool,
    ) -> Result<(Block, BlockMetadata)> {
        if blocks.is_empty() {
            return Err(FoldexError::Internal(
                "reduce requires at least one input block".to_owned(),
            ));
        }
        let normalized = normalize_block_types(blocks, Some(self.batch_format))?;
        aggregate_combined_blocks(
            &normalized,
            self.key.as_ref(),
            &self.aggs,
            !partial_reduce,
        )
    }
}

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

//! Sort-based exchange tasks.
//!
//! An exchange repartitions data between two stages. Map tasks run one
//! per input block and split it into one output block per reduce
//! partition; the caller routes partition `i` of every map task to
//! reduce task `i`, which merges them into that partition's final
//! block. Both phases are pure functions of their inputs, so a
//! scheduler may rerun either side after a failure and obtain the same
//! bytes.
//!
//! Two task implementations are provided: [`SortExchange`] produces a
//! range-partitioned total sort and [`SortAggregateExchange`] layers
//! per-key aggregation on top of the same sort-and-merge machinery.

use std::cmp::Ordering;
use std::fmt::Debug;

use crate::block::Block;
use crate::error::{FoldexError, Result};
use crate::key::{cmp_key_tuples, KeyTuple};
use crate::metadata::BlockMetadata;

mod aggregate_task;
mod prune;
mod sort_task;

pub use aggregate_task::SortAggregateExchange;
pub use prune::{plan_projection, prune_block};
pub use sort_task::{BoundarySampler, SortExchange};

/// Everything one map task hands back to the caller: the per-partition
/// output blocks, positionally aligned with the reduce tasks, and the
/// metadata of the block the task read.
#[derive(Debug)]
pub struct MapTaskOutput {
    /// One output block per reduce partition. Partitions with no rows
    /// for this input are present as empty blocks so the positions
    /// stay aligned across map tasks.
    pub partitions: Vec<Block>,
    /// Metadata describing the consumed input block.
    pub metadata: BlockMetadata,
}

/// A two-phase exchange over horizontally partitioned blocks.
pub trait ExchangeTask: Debug + Send + Sync {
    /// Number of reduce partitions every map task emits.
    fn output_partition_count(&self) -> usize;

    /// Runs the map phase over one input block. `block_index` is the
    /// position of the block in the input partition list and is used
    /// for logging only.
    fn map(&self, block_index: usize, block: Block) -> Result<MapTaskOutput>;

    /// Merges the map outputs routed to one reduce partition into that
    /// partition's output block. With `partial_reduce` the output is
    /// kept in a form that a later [`ExchangeTask::reduce`] call can
    /// consume again, enabling tree-shaped reductions.
    fn reduce(
        &self,
        blocks: &[Block],
        partial_reduce: bool,
    ) -> Result<(Block, BlockMetadata)>;
}

/// Checks that every boundary matches the key arity and that the
/// boundary list is sorted ascending. Equal consecutive boundaries are
/// allowed and simply produce empty partitions.
pub(crate) fn validate_boundaries(
    boundaries: &[KeyTuple],
    arity: usize,
) -> Result<()> {
    for boundary in boundaries {
        if boundary.len() != arity {
            return Err(FoldexError::Configuration(format!(
                "partition boundary {boundary:?} has arity {}, expected {arity}",
                boundary.len()
            )));
        }
    }
    for pair in boundaries.windows(2) {
        if cmp_key_tuples(&pair[0], &pair[1])? == Ordering::Greater {
            return Err(FoldexError::Configuration(
                "partition boundaries must be sorted ascending".to_owned(),
            ));
        }
    }
    Ok(())
}

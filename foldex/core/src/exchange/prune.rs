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

//! Column pruning for the map side of an aggregation exchange.
//!
//! Sorting and shuffling only need the key columns and the columns the
//! aggregates read, so everything else is dropped before the sort.
//! Pruning never changes results, only the bytes moved.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::aggregate::{AggregateFn, AggregateInput};
use crate::block::{Block, BlockData};
use crate::error::Result;
use crate::key::GroupKey;

/// Columns an aggregation over `key` and `aggs` actually reads, sorted
/// by name, or `None` when the required set cannot be determined (a
/// computed key or an aggregate that inspects whole rows) and pruning
/// must be skipped.
///
/// The set may be empty: a global row count reads no columns at all,
/// and pruning then keeps only the row count of each block.
pub fn plan_projection(
    key: Option<&GroupKey>,
    aggs: &[Arc<dyn AggregateFn>],
) -> Option<Vec<String>> {
    let mut columns = BTreeSet::new();
    if let Some(key) = key {
        columns.extend(key.projected_columns()?);
    }
    for agg in aggs {
        match agg.input() {
            AggregateInput::None => {}
            AggregateInput::Column(name) => {
                columns.insert(name);
            }
            AggregateInput::Opaque => return None,
        }
    }
    Some(columns.into_iter().collect())
}

/// Applies a projection planned by [`plan_projection`] to one block.
/// Empty blocks pass through untouched, as does everything when no
/// projection could be planned.
pub fn prune_block(block: &Block, projection: Option<&[String]>) -> Result<Block> {
    match projection {
        Some(columns) if block.num_rows() > 0 => block.select(columns),
        _ => Ok(block.clone()),
    }
}

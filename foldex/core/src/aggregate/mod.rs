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

//! Aggregate function and accumulator capabilities.
//!
//! An [AggregateFn] describes one aggregation in a plan: which input it
//! reads, the schema of its partial state, and how to build an
//! [Accumulator] over that state. Map tasks accumulate raw rows into
//! partial state; reduce tasks merge partial states from many producers
//! and optionally finalize them into output values. Merging must be
//! associative and commutative so that reducers can run in any tree
//! shape over any grouping of producers.

use std::fmt;

use datafusion::arrow::array::ArrayRef;
use datafusion::arrow::datatypes::{Field, Schema};
use datafusion::common::ScalarValue;

use crate::error::{FoldexError, Result};

mod builtin;

pub use builtin::{Count, Max, Mean, Min, Sum};

/// The input an aggregate function reads from each row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateInput {
    /// No input at all, e.g. a pure row count. Does not prevent column
    /// pruning.
    None,
    /// A single named column. Pruning keeps the column.
    Column(String),
    /// An input that cannot be described as a plain column reference.
    /// Disables column pruning for the whole plan; accumulators with
    /// opaque input receive every column of the block.
    Opaque,
}

/// One aggregation in an exchange plan.
///
/// The state schema is the contract between map and reduce tasks: a
/// map-side combine writes `num_state_columns` columns per aggregate
/// into its partial blocks and reducers slice those same columns back
/// out by position.
pub trait AggregateFn: fmt::Debug + Send + Sync {
    /// Display name, also used for the output column.
    fn name(&self) -> String;

    /// The input this aggregate reads, used to plan column pruning.
    fn input(&self) -> AggregateInput;

    /// Number of columns of partial state this aggregate produces.
    fn num_state_columns(&self) -> usize;

    /// Partial state fields for the given input schema, in state order.
    /// Must have exactly [num_state_columns](Self::num_state_columns)
    /// entries.
    fn state_fields(&self, input_schema: &Schema) -> Result<Vec<Field>>;

    /// Output field produced by finalizing the given state fields.
    fn output_field(&self, state_fields: &[Field]) -> Result<Field>;

    /// Creates a fresh accumulator for the given state fields. A fresh
    /// accumulator must hold the identity of the merge operation so
    /// that seeding it from any partial state is a plain merge.
    fn create_accumulator(&self, state_fields: &[Field])
        -> Result<Box<dyn Accumulator>>;
}

/// Mutable aggregation state for one group.
pub trait Accumulator: fmt::Debug {
    /// Folds a run of raw input values into the state. `values` holds
    /// the arrays resolved from [AggregateFn::input] and `num_rows` the
    /// length of the run (also covering inputs with no columns).
    fn update_batch(&mut self, values: &[ArrayRef], num_rows: usize) -> Result<()>;

    /// Folds one row of partial state, as previously produced by
    /// [state](Self::state) on some other accumulator, into this one.
    fn merge_state(&mut self, state: &[ScalarValue]) -> Result<()>;

    /// Current partial state, one scalar per state column.
    fn state(&self) -> Result<Vec<ScalarValue>>;

    /// Finalizes the state into the output value.
    fn evaluate(&self) -> Result<ScalarValue>;
}

/// Resolves the single state field of a one-column aggregate.
pub(crate) fn single_state_field<'a>(
    name: &str,
    state_fields: &'a [Field],
) -> Result<&'a Field> {
    match state_fields {
        [field] => Ok(field),
        other => Err(FoldexError::Internal(format!(
            "aggregate {} expects one state column, got {}",
            name,
            other.len()
        ))),
    }
}

/// Resolves the single input array of a one-column aggregate.
pub(crate) fn single_input<'a>(
    name: &str,
    values: &'a [ArrayRef],
) -> Result<&'a ArrayRef> {
    match values {
        [array] => Ok(array),
        other => Err(FoldexError::Internal(format!(
            "aggregate {} expects one input column, got {}",
            name,
            other.len()
        ))),
    }
}

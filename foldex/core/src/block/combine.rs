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

//! Local combine and the k-way merge of combined blocks.
//!
//! `combine` runs on the map side: it collapses runs of equal keys in a
//! sorted block into one partial-aggregate row per key. The reduce side
//! then merges such blocks from many producers with a cursor-based
//! k-way merge that holds one accumulator set per distinct key at a
//! time. Both passes visit every row exactly once and rely only on the
//! inputs being sorted, never on hashing.

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef};
use datafusion::arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::common::ScalarValue;
use log::debug;

use crate::aggregate::{Accumulator, AggregateFn, AggregateInput};
use crate::block::{
    concat_blocks, BatchFormat, Block, BlockBuilder, BlockData,
};
use crate::error::{FoldexError, Result};
use crate::key::{cmp_key_tuples, key_tuple_at, GroupKey, KeyTuple};
use crate::metadata::{BlockExecStats, BlockMetadata};

/// Combines runs of equal keys in sorted columns into one
/// partial-aggregate row per key. With no key the whole input is a
/// single group and the output always has exactly one row.
pub(crate) fn combine_sorted_columns(
    schema: &SchemaRef,
    columns: &[ArrayRef],
    num_rows: usize,
    key: Option<&GroupKey>,
    aggs: &[Arc<dyn AggregateFn>],
    format: BatchFormat,
) -> Result<Block> {
    let key_names = key.map(|key| key.column_names()).unwrap_or_default();
    let mut key_indices = Vec::with_capacity(key_names.len());
    for name in &key_names {
        key_indices.push(schema.index_of(name)?);
    }
    let key_arrays: Vec<ArrayRef> =
        key_indices.iter().map(|&index| columns[index].clone()).collect();

    let mut output_fields: Vec<Field> = key_indices
        .iter()
        .map(|&index| schema.field(index).clone())
        .collect();
    let mut state_fields = Vec::with_capacity(aggs.len());
    for agg in aggs {
        let fields = agg.state_fields(schema)?;
        if fields.len() != agg.num_state_columns() {
            return Err(FoldexError::Internal(format!(
                "aggregate {} declared {} state columns but produced {}",
                agg.name(),
                agg.num_state_columns(),
                fields.len()
            )));
        }
        output_fields.extend(fields.iter().cloned());
        state_fields.push(fields);
    }
    let mut builder = BlockBuilder::new(format, Arc::new(Schema::new(output_fields)));

    for run in key_runs(&key_arrays, num_rows, key.is_some())? {
        let mut row = key_tuple_at(&key_arrays, run.start)?;
        for (agg, fields) in aggs.iter().zip(&state_fields) {
            let mut accumulator = agg.create_accumulator(fields)?;
            let values = resolve_input_arrays(agg.input(), schema, columns, &run)?;
            accumulator.update_batch(&values, run.end - run.start)?;
            row.extend(accumulator.state()?);
        }
        builder.push_row(row)?;
    }
    builder.build()
}

/// Ranges of adjacent rows sharing an equal key. Ungrouped input forms
/// one run covering the whole block, rows or not.
fn key_runs(
    key_arrays: &[ArrayRef],
    num_rows: usize,
    grouped: bool,
) -> Result<Vec<Range<usize>>> {
    if !grouped {
        return Ok(vec![0..num_rows]);
    }
    let mut runs = Vec::new();
    let mut start = 0;
    for row in 1..num_rows {
        let previous = key_tuple_at(key_arrays, row - 1)?;
        let current = key_tuple_at(key_arrays, row)?;
        if cmp_key_tuples(&previous, &current)? != Ordering::Equal {
            runs.push(start..row);
            start = row;
        }
    }
    if num_rows > 0 {
        runs.push(start..num_rows);
    }
    Ok(runs)
}

fn resolve_input_arrays(
    input: AggregateInput,
    schema: &SchemaRef,
    columns: &[ArrayRef],
    run: &Range<usize>,
) -> Result<Vec<ArrayRef>> {
    let slice = |index: usize| columns[index].slice(run.start, run.end - run.start);
    match input {
        AggregateInput::None => Ok(vec![]),
        AggregateInput::Column(name) => Ok(vec![slice(schema.index_of(&name)?)]),
        AggregateInput::Opaque => Ok((0..columns.len()).map(slice).collect()),
    }
}

struct MergeCursor {
    columns: Vec<ArrayRef>,
    row: usize,
    num_rows: usize,
}

fn cursor_key(cursor: &MergeCursor, arity: usize) -> Result<KeyTuple> {
    key_tuple_at(&cursor.columns[..arity], cursor.row)
}

fn create_accumulators(
    aggs: &[Arc<dyn AggregateFn>],
    state_fields: &[Vec<Field>],
) -> Result<Vec<Box<dyn Accumulator>>> {
    aggs.iter()
        .zip(state_fields)
        .map(|(agg, fields)| agg.create_accumulator(fields))
        .collect()
}

fn merge_row(
    accumulators: &mut [Box<dyn Accumulator>],
    aggs: &[Arc<dyn AggregateFn>],
    columns: &[ArrayRef],
    arity: usize,
    row: usize,
) -> Result<()> {
    let mut offset = arity;
    for (agg, accumulator) in aggs.iter().zip(accumulators.iter_mut()) {
        let state = columns[offset..offset + agg.num_state_columns()]
            .iter()
            .map(|column| Ok(ScalarValue::try_from_array(column, row)?))
            .collect::<Result<Vec<_>>>()?;
        accumulator.merge_state(&state)?;
        offset += agg.num_state_columns();
    }
    Ok(())
}

fn output_row(
    accumulators: &[Box<dyn Accumulator>],
    key_scalars: &[ScalarValue],
    finalize: bool,
) -> Result<Vec<ScalarValue>> {
    let mut row = key_scalars.to_vec();
    for accumulator in accumulators {
        if finalize {
            row.push(accumulator.evaluate()?);
        } else {
            row.extend(accumulator.state()?);
        }
    }
    Ok(row)
}

/// Merges sorted, key-deduplicated partial-aggregate blocks from many
/// producers into one output block with one row per distinct key.
///
/// Every input must share the combine layout: the key columns first,
/// then each aggregate's state columns. Whenever the same key appears
/// in several inputs their states are merged through the aggregate's
/// associative merge, visiting cursors in input order so reruns over
/// identical inputs produce identical bytes. With `finalize` the merged
/// state is evaluated into output values; otherwise the output stays in
/// state form for a further reduction round.
pub fn aggregate_combined_blocks(
    blocks: &[Block],
    key: Option<&GroupKey>,
    aggs: &[Arc<dyn AggregateFn>],
    finalize: bool,
) -> Result<(Block, BlockMetadata)> {
    let stats = BlockExecStats::builder();
    let first = blocks.first().ok_or_else(|| {
        FoldexError::Internal("merge requires at least one input block".to_owned())
    })?;
    let schema = first.schema();
    for block in &blocks[1..] {
        if block.schema() != schema {
            return Err(FoldexError::General(format!(
                "cannot merge blocks with differing schemas: {:?} vs {:?}",
                schema,
                block.schema()
            )));
        }
    }

    let key_names = key.map(|key| key.column_names()).unwrap_or_default();
    let arity = key_names.len();
    if schema.fields().len() < arity {
        return Err(FoldexError::General(format!(
            "combined block has {} columns but the key needs {arity}",
            schema.fields().len()
        )));
    }
    for (index, name) in key_names.iter().enumerate() {
        if schema.field(index).name() != name {
            return Err(FoldexError::General(format!(
                "combined block column {index} is {}, expected key column {name}",
                schema.field(index).name()
            )));
        }
    }
    let state_width: usize = aggs.iter().map(|agg| agg.num_state_columns()).sum();
    if schema.fields().len() != arity + state_width {
        return Err(FoldexError::General(format!(
            "combined block has {} columns, expected {arity} key and {state_width} state columns",
            schema.fields().len()
        )));
    }

    let mut state_fields = Vec::with_capacity(aggs.len());
    let mut offset = arity;
    for agg in aggs {
        let fields: Vec<Field> = (offset..offset + agg.num_state_columns())
            .map(|index| schema.field(index).clone())
            .collect();
        offset += agg.num_state_columns();
        state_fields.push(fields);
    }

    let output_schema = if finalize {
        let mut fields: Vec<Field> =
            (0..arity).map(|index| schema.field(index).clone()).collect();
        for (agg, fields_for_agg) in aggs.iter().zip(&state_fields) {
            fields.push(agg.output_field(fields_for_agg)?);
        }
        Arc::new(Schema::new(fields))
    } else {
        schema.clone()
    };
    let mut builder = BlockBuilder::new(first.format(), output_schema);

    let mut cursors = Vec::new();
    for block in blocks {
        if block.num_rows() == 0 {
            continue;
        }
        cursors.push(MergeCursor {
            columns: block.columns()?,
            row: 0,
            num_rows: block.num_rows(),
        });
    }

    if key.is_none() {
        // One global group: fold every producer row into one output row.
        let mut accumulators = create_accumulators(aggs, &state_fields)?;
        for cursor in &cursors {
            for row in 0..cursor.num_rows {
                merge_row(&mut accumulators, aggs, &cursor.columns, arity, row)?;
            }
        }
        builder.push_row(output_row(&accumulators, &[], finalize)?)?;
    } else {
        while !cursors.is_empty() {
            let mut min_key = cursor_key(&cursors[0], arity)?;
            for cursor in cursors.iter().skip(1) {
                let candidate = cursor_key(cursor, arity)?;
                if cmp_key_tuples(&candidate, &min_key)? == Ordering::Less {
                    min_key = candidate;
                }
            }

            let mut accumulators = create_accumulators(aggs, &state_fields)?;
            for cursor in &mut cursors {
                while cursor.row < cursor.num_rows
                    && cmp_key_tuples(&cursor_key(cursor, arity)?, &min_key)?
                        == Ordering::Equal
                {
                    merge_row(&mut accumulators, aggs, &cursor.columns, arity, cursor.row)?;
                    cursor.row += 1;
                }
            }
            cursors.retain(|cursor| cursor.row < cursor.num_rows);
            builder.push_row(output_row(&accumulators, &min_key, finalize)?)?;
        }
    }

    let block = builder.build()?;
    debug!(
        "merged {} combined blocks into {} groups (finalize={finalize})",
        blocks.len(),
        block.num_rows()
    );
    let metadata = block.get_metadata(Some(Arc::new(stats.build())));
    Ok((block, metadata))
}

/// Merges sorted blocks from many producers into one sorted block.
/// Inputs must share one representation and schema.
pub fn merge_sorted_blocks(
    blocks: &[Block],
    key: &GroupKey,
) -> Result<(Block, BlockMetadata)> {
    let stats = BlockExecStats::builder();
    let combined = concat_blocks(blocks)?;
    let mut partitions = combined.sort_and_partition(&[], key)?;
    let sorted = partitions.pop().ok_or_else(|| {
        FoldexError::Internal("sorting produced no output block".to_owned())
    })?;
    let metadata = sorted.get_metadata(Some(Arc::new(stats.build())));
    Ok((sorted, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::DataType;
    use datafusion::arrow::record_batch::RecordBatch;

    use crate::aggregate::{Count, Sum};
    use crate::block::ArrowBlock;

    fn sorted_block(a: Vec<i64>, b: Vec<i64>) -> ArrowBlock {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(a)) as ArrayRef,
                Arc::new(Int64Array::from(b)) as ArrayRef,
            ],
        )
        .unwrap();
        ArrowBlock::new(batch)
    }

    fn partial_block(rows: Vec<(i64, Option<i64>)>) -> Block {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("sum(b)", DataType::Int64, true),
        ]));
        let mut builder = BlockBuilder::new(BatchFormat::Arrow, schema);
        for (a, sum) in rows {
            builder
                .push_row(vec![ScalarValue::Int64(Some(a)), ScalarValue::Int64(sum)])
                .unwrap();
        }
        builder.build().unwrap()
    }

    fn int_rows(block: &Block) -> Vec<Vec<Option<i64>>> {
        let batch = block.to_record_batch().unwrap();
        (0..batch.num_rows())
            .map(|row| {
                batch
                    .columns()
                    .iter()
                    .map(|column| {
                        match ScalarValue::try_from_array(column, row).unwrap() {
                            ScalarValue::Int64(v) => v,
                            ScalarValue::UInt64(v) => v.map(|v| v as i64),
                            other => panic!("unexpected scalar {other}"),
                        }
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn combine_collapses_adjacent_equal_keys() {
        let block = sorted_block(vec![1, 1, 6], vec![10, 5, 20]);
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Sum::new("b"))];
        let key = GroupKey::column("a");

        let combined = block.combine(Some(&key), &aggs).unwrap();
        assert_eq!(
            int_rows(&combined),
            vec![vec![Some(1), Some(15)], vec![Some(6), Some(20)]]
        );
    }

    #[test]
    fn combine_without_key_always_yields_one_row() {
        let block = sorted_block(vec![], vec![]);
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Count::new())];

        let combined = block.combine(None, &aggs).unwrap();
        assert_eq!(combined.num_rows(), 1);
        assert_eq!(int_rows(&combined), vec![vec![Some(0)]]);
    }

    #[test]
    fn merge_adds_partial_sums_for_equal_keys() {
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Sum::new("b"))];
        let key = GroupKey::column("a");
        let blocks = vec![
            partial_block(vec![(1, Some(15))]),
            partial_block(vec![(1, Some(7))]),
        ];

        let (merged, metadata) =
            aggregate_combined_blocks(&blocks, Some(&key), &aggs, true).unwrap();
        assert_eq!(int_rows(&merged), vec![vec![Some(1), Some(22)]]);
        assert_eq!(metadata.num_rows, 1);
    }

    #[test]
    fn merge_keeps_keys_sorted_and_unique() {
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Sum::new("b"))];
        let key = GroupKey::column("a");
        let blocks = vec![
            partial_block(vec![(1, Some(1)), (5, Some(2))]),
            partial_block(vec![(2, Some(3)), (5, Some(4))]),
            partial_block(vec![]),
        ];

        let (merged, _) =
            aggregate_combined_blocks(&blocks, Some(&key), &aggs, true).unwrap();
        assert_eq!(
            int_rows(&merged),
            vec![
                vec![Some(1), Some(1)],
                vec![Some(2), Some(3)],
                vec![Some(5), Some(6)],
            ]
        );
    }

    #[test]
    fn partial_merge_keeps_state_mergeable() {
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Sum::new("b"))];
        let key = GroupKey::column("a");

        let (partial, _) = aggregate_combined_blocks(
            &[
                partial_block(vec![(1, Some(15))]),
                partial_block(vec![(1, Some(7))]),
            ],
            Some(&key),
            &aggs,
            false,
        )
        .unwrap();
        let (finalized, _) = aggregate_combined_blocks(
            &[partial, partial_block(vec![(1, Some(20))])],
            Some(&key),
            &aggs,
            true,
        )
        .unwrap();
        assert_eq!(int_rows(&finalized), vec![vec![Some(1), Some(42)]]);
    }

    #[test]
    fn merge_of_zero_blocks_is_an_internal_error() {
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Count::new())];
        assert!(matches!(
            aggregate_combined_blocks(&[], None, &aggs, true),
            Err(FoldexError::Internal(_))
        ));
    }

    #[test]
    fn merge_rejects_mismatched_layouts() {
        let aggs: Vec<Arc<dyn AggregateFn>> = vec![Arc::new(Sum::new("b"))];
        let key = GroupKey::column("missing");
        let blocks = vec![partial_block(vec![(1, Some(1))])];

        let err =
            aggregate_combined_blocks(&blocks, Some(&key), &aggs, true).unwrap_err();
        assert!(err.to_string().contains("expected key column"));
    }

    #[test]
    fn merge_sorted_blocks_interleaves_runs() {
        let key = GroupKey::column("a");
        let blocks: Vec<Block> = vec![
            Arc::new(sorted_block(vec![1, 4], vec![10, 40])),
            Arc::new(sorted_block(vec![2, 3], vec![20, 30])),
        ];

        let (sorted, metadata) = merge_sorted_blocks(&blocks, &key).unwrap();
        assert_eq!(metadata.num_rows, 4);
        assert_eq!(
            int_rows(&sorted),
            vec![
                vec![Some(1), Some(10)],
                vec![Some(2), Some(20)],
                vec![Some(3), Some(30)],
                vec![Some(4), Some(40)],
            ]
        );
    }
}

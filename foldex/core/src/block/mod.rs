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

//! Block representations behind a common capability interface.
//!
//! A block is an immutable, ordered chunk of rows held by one worker.
//! Exchange tasks never touch the physical layout directly; they go
//! through [BlockData], whose implementation is fixed when the block is
//! constructed. Two representations ship with this crate: Arrow record
//! batches ([ArrowBlock]) and row-oriented scalar tuples ([RowBlock]).
//!
//! Reducers can receive blocks from heterogeneous producers, so
//! [normalize_block_types] converts a mixed set into one uniform
//! representation before merging. All transforms produce new blocks;
//! nothing here mutates a block in place.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use datafusion::arrow::array::{ArrayRef, new_empty_array};
use datafusion::arrow::compute::concat_batches;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::common::ScalarValue;
use log::warn;

use crate::aggregate::AggregateFn;
use crate::error::{FoldexError, Result};
use crate::key::{GroupKey, KeyTuple};
use crate::metadata::{BlockExecStats, BlockMetadata};

mod arrow;
mod combine;
mod row;

pub use self::arrow::ArrowBlock;
pub use self::combine::{aggregate_combined_blocks, merge_sorted_blocks};
pub use self::row::RowBlock;

/// Shared handle to an immutable block.
pub type Block = Arc<dyn BlockData>;

/// Physical representation of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFormat {
    /// Arrow columnar record batches.
    #[default]
    Arrow,
    /// Row-oriented scalar tuples.
    Row,
}

impl fmt::Display for BatchFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatchFormat::Arrow => write!(f, "arrow"),
            BatchFormat::Row => write!(f, "row"),
        }
    }
}

/// Capability interface implemented once per block representation.
///
/// `sort_and_partition` and `combine` are the map-side operations of a
/// sort exchange; both leave the receiver untouched and return new
/// blocks in the receiver's representation.
pub trait BlockData: fmt::Debug + Send + Sync {
    /// Returns self for representation-specific downcasting.
    fn as_any(&self) -> &dyn Any;

    /// The representation of this block.
    fn format(&self) -> BatchFormat;

    /// Schema of the block.
    fn schema(&self) -> SchemaRef;

    /// Number of rows in the block.
    fn num_rows(&self) -> usize;

    /// Approximate in-memory size of the block in bytes.
    fn size_bytes(&self) -> usize;

    /// Materializes every column as an Arrow array, in schema order.
    fn columns(&self) -> Result<Vec<ArrayRef>>;

    /// Projects the block onto the named columns. Selecting no columns
    /// keeps the row count: the result is a zero-width block that still
    /// reports [num_rows](Self::num_rows) rows.
    fn select(&self, columns: &[String]) -> Result<Block>;

    /// Materializes the key columns for `key`, evaluating computed
    /// keys when their output column is not already present.
    fn key_arrays(&self, key: &GroupKey) -> Result<Vec<ArrayRef>>;

    /// Sorts the block by `key` (ascending, nulls first) and splits it
    /// at `boundaries` into `boundaries.len() + 1` blocks in partition
    /// order. Computed keys are materialized as an extra column so the
    /// partitions carry the key values they were split by.
    fn sort_and_partition(
        &self,
        boundaries: &[KeyTuple],
        key: &GroupKey,
    ) -> Result<Vec<Block>>;

    /// Combines runs of rows with equal keys into one partial-aggregate
    /// row each. Requires the block to be sorted by `key`; with no key
    /// the whole block forms a single group and the result always has
    /// exactly one row. The output holds the key columns followed by
    /// each aggregate's state columns.
    fn combine(
        &self,
        key: Option<&GroupKey>,
        aggs: &[Arc<dyn AggregateFn>],
    ) -> Result<Block>;

    /// Copies the block into an Arrow record batch.
    fn to_record_batch(&self) -> Result<RecordBatch>;

    /// Converts the block to the given representation.
    fn to_format(&self, format: BatchFormat) -> Result<Block>;

    /// Metadata describing this block, with optional task statistics.
    fn get_metadata(&self, exec_stats: Option<Arc<BlockExecStats>>) -> BlockMetadata {
        BlockMetadata::new(
            self.num_rows() as u64,
            self.size_bytes() as u64,
            self.schema(),
            exec_stats,
        )
    }
}

/// Row-at-a-time builder producing a block in a chosen representation.
#[derive(Debug)]
pub struct BlockBuilder {
    format: BatchFormat,
    schema: SchemaRef,
    rows: Vec<Vec<ScalarValue>>,
}

impl BlockBuilder {
    /// Creates an empty builder for the given representation and schema.
    pub fn new(format: BatchFormat, schema: SchemaRef) -> Self {
        Self {
            format,
            schema,
            rows: vec![],
        }
    }

    /// Appends one row. The row must have one scalar per schema field.
    pub fn push_row(&mut self, row: Vec<ScalarValue>) -> Result<()> {
        if row.len() != self.schema.fields().len() {
            return Err(FoldexError::Internal(format!(
                "row width {} does not match schema width {}",
                row.len(),
                self.schema.fields().len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows appended so far.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Builds the block.
    pub fn build(self) -> Result<Block> {
        match self.format {
            BatchFormat::Arrow => {
                let batch = rows_to_record_batch(&self.schema, &self.rows)?;
                Ok(Arc::new(ArrowBlock::new(batch)) as Block)
            }
            BatchFormat::Row => {
                Ok(Arc::new(RowBlock::try_new(self.schema, self.rows)?) as Block)
            }
        }
    }
}

/// Builds a record batch from rows of scalars. Zero-width schemas are
/// preserved via an explicit row count.
pub(crate) fn rows_to_record_batch(
    schema: &SchemaRef,
    rows: &[Vec<ScalarValue>],
) -> Result<RecordBatch> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    for (index, field) in schema.fields().iter().enumerate() {
        let column = if rows.is_empty() {
            new_empty_array(field.data_type())
        } else {
            ScalarValue::iter_to_array(rows.iter().map(|row| row[index].clone()))?
        };
        columns.push(column);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        columns,
        &options,
    )?)
}

/// Brings a set of blocks into one uniform representation.
///
/// With an explicit `format`, every block is converted to it. With
/// `None`, blocks that already share a representation pass through
/// unchanged and mixed sets are normalized to [BatchFormat::default].
pub fn normalize_block_types(
    blocks: &[Block],
    format: Option<BatchFormat>,
) -> Result<Vec<Block>> {
    let target = match format {
        Some(format) => format,
        None => match blocks.first() {
            Some(first) if blocks.iter().all(|b| b.format() == first.format()) => {
                return Ok(blocks.to_vec())
            }
            _ => BatchFormat::default(),
        },
    };
    let mismatched = blocks.iter().filter(|b| b.format() != target).count();
    if mismatched > 0 {
        warn!(
            "normalizing {mismatched} of {} input blocks to the {target} representation",
            blocks.len()
        );
    }
    blocks
        .iter()
        .map(|block| {
            if block.format() == target {
                Ok(block.clone())
            } else {
                block.to_format(target)
            }
        })
        .collect()
}

/// Concatenates blocks sharing one representation and schema into a
/// single block, preserving row order.
pub fn concat_blocks(blocks: &[Block]) -> Result<Block> {
    let first = blocks
        .first()
        .ok_or_else(|| FoldexError::Internal("cannot concatenate zero blocks".to_owned()))?;
    for block in &blocks[1..] {
        if block.format() != first.format() {
            return Err(FoldexError::Internal(
                "cannot concatenate blocks of mixed representations".to_owned(),
            ));
        }
        if block.schema() != first.schema() {
            return Err(FoldexError::General(format!(
                "cannot concatenate blocks with differing schemas: {:?} vs {:?}",
                first.schema(),
                block.schema()
            )));
        }
    }
    match first.format() {
        BatchFormat::Arrow => {
            let batches = blocks
                .iter()
                .map(|block| block.to_record_batch())
                .collect::<Result<Vec<_>>>()?;
            let batch = concat_batches(&first.schema(), &batches)?;
            Ok(Arc::new(ArrowBlock::new(batch)) as Block)
        }
        BatchFormat::Row => {
            let mut rows = Vec::with_capacity(blocks.iter().map(|b| b.num_rows()).sum());
            for block in blocks {
                let row_block = block
                    .as_any()
                    .downcast_ref::<RowBlock>()
                    .ok_or_else(|| {
                        FoldexError::Internal(
                            "row-formatted block is not a RowBlock".to_owned(),
                        )
                    })?;
                rows.extend_from_slice(row_block.rows());
            }
            Ok(Arc::new(RowBlock::try_new(first.schema(), rows)?) as Block)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use datafusion::arrow::datatypes::{DataType, Field, Schema};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]))
    }

    #[test]
    fn batch_format_defaults_to_arrow() {
        assert_eq!(BatchFormat::default(), BatchFormat::Arrow);
        assert_eq!(BatchFormat::Arrow.to_string(), "arrow");
        assert_eq!(BatchFormat::Row.to_string(), "row");
    }

    #[test]
    fn builder_rejects_wrong_row_width() {
        let mut builder = BlockBuilder::new(BatchFormat::Arrow, test_schema());
        let err = builder
            .push_row(vec![
                ScalarValue::Int64(Some(1)),
                ScalarValue::Int64(Some(2)),
            ])
            .unwrap_err();
        assert!(matches!(err, FoldexError::Internal(_)));
    }

    #[test]
    fn builder_produces_requested_representation() {
        for format in [BatchFormat::Arrow, BatchFormat::Row] {
            let mut builder = BlockBuilder::new(format, test_schema());
            builder.push_row(vec![ScalarValue::Int64(Some(7))]).unwrap();
            let block = builder.build().unwrap();
            assert_eq!(block.format(), format);
            assert_eq!(block.num_rows(), 1);

            let batch = block.to_record_batch().unwrap();
            assert_eq!(batch.num_rows(), 1);
        }
    }

    #[test]
    fn normalize_leaves_uniform_blocks_untouched() {
        let mut builder = BlockBuilder::new(BatchFormat::Row, test_schema());
        builder.push_row(vec![ScalarValue::Int64(Some(1))]).unwrap();
        let block = builder.build().unwrap();

        let normalized = normalize_block_types(&[block.clone()], None).unwrap();
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].format(), BatchFormat::Row);
        assert!(Arc::ptr_eq(&normalized[0], &block));
    }

    #[test]
    fn normalize_converts_mixed_blocks_to_target() {
        let mut arrow = BlockBuilder::new(BatchFormat::Arrow, test_schema());
        arrow.push_row(vec![ScalarValue::Int64(Some(1))]).unwrap();
        let mut row = BlockBuilder::new(BatchFormat::Row, test_schema());
        row.push_row(vec![ScalarValue::Int64(Some(2))]).unwrap();

        let normalized =
            normalize_block_types(&[arrow.build().unwrap(), row.build().unwrap()], None)
                .unwrap();
        assert!(normalized.iter().all(|b| b.format() == BatchFormat::Arrow));
        assert_eq!(normalized[1].num_rows(), 1);
    }

    #[test]
    fn concat_preserves_row_order() {
        let mut left = BlockBuilder::new(BatchFormat::Arrow, test_schema());
        left.push_row(vec![ScalarValue::Int64(Some(1))]).unwrap();
        let mut right = BlockBuilder::new(BatchFormat::Arrow, test_schema());
        right.push_row(vec![ScalarValue::Int64(Some(2))]).unwrap();

        let merged =
            concat_blocks(&[left.build().unwrap(), right.build().unwrap()]).unwrap();
        assert_eq!(merged.num_rows(), 2);
        let batch = merged.to_record_batch().unwrap();
        let column = batch.column(0);
        assert_eq!(
            ScalarValue::try_from_array(column, 0).unwrap(),
            ScalarValue::Int64(Some(1))
        );
        assert_eq!(
            ScalarValue::try_from_array(column, 1).unwrap(),
            ScalarValue::Int64(Some(2))
        );
    }
}

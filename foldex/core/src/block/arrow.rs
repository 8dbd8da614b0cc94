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

//! Arrow columnar block representation

use std::any::Any;
use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef};
use datafusion::arrow::compute::{lexsort_to_indices, take, SortColumn, SortOptions};
use datafusion::arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::common::ScalarValue;

use crate::aggregate::AggregateFn;
use crate::block::combine::combine_sorted_columns;
use crate::block::{BatchFormat, Block, BlockData, RowBlock};
use crate::error::{FoldexError, Result};
use crate::key::{key_tuple_at, GroupKey, KeyExpr, KeyTuple};
use crate::partition::partition_ranges;

/// Block backed by an Arrow record batch.
///
/// Sorting goes through the Arrow sort kernels and partitioning
/// produces zero-copy slices of the sorted batch.
#[derive(Debug, Clone)]
pub struct ArrowBlock {
    batch: RecordBatch,
}

impl ArrowBlock {
    /// Wraps a record batch.
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// The underlying record batch.
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }
}

fn column_by_name(batch: &RecordBatch, name: &str) -> Result<ArrayRef> {
    let index = batch.schema_ref().index_of(name)?;
    Ok(batch.column(index).clone())
}

/// Returns `batch` with a computed key materialized as a trailing
/// column, so partitions carry the key values they were grouped by.
/// Plain column keys and already-materialized computed keys pass the
/// batch through untouched.
fn attach_computed_key(batch: &RecordBatch, key: &GroupKey) -> Result<RecordBatch> {
    let GroupKey::Computed(expr) = key else {
        return Ok(batch.clone());
    };
    if batch.schema_ref().index_of(expr.name()).is_ok() {
        return Ok(batch.clone());
    }
    let array = expr.evaluate(batch)?;
    if array.len() != batch.num_rows() {
        return Err(FoldexError::Internal(format!(
            "key expression {} produced {} values for {} rows",
            expr.name(),
            array.len(),
            batch.num_rows()
        )));
    }
    let mut fields = batch.schema_ref().fields().iter().cloned().collect::<Vec<_>>();
    fields.push(Arc::new(Field::new(
        expr.name(),
        array.data_type().clone(),
        true,
    )));
    let mut columns = batch.columns().to_vec();
    columns.push(array);
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        columns,
        &options,
    )?)
}

impl BlockData for ArrowBlock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn format(&self) -> BatchFormat {
        BatchFormat::Arrow
    }

    fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    fn size_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    fn columns(&self) -> Result<Vec<ArrayRef>> {
        Ok(self.batch.columns().to_vec())
    }

    fn select(&self, columns: &[String]) -> Result<Block> {
        let schema = self.batch.schema_ref();
        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays = Vec::with_capacity(columns.len());
        for name in columns {
            let index = schema.index_of(name)?;
            fields.push(schema.field(index).clone());
            arrays.push(self.batch.column(index).clone());
        }
        // An explicit row count keeps zero-width projections sized.
        let options =
            RecordBatchOptions::new().with_row_count(Some(self.batch.num_rows()));
        let batch = RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            arrays,
            &options,
        )?;
        Ok(Arc::new(ArrowBlock::new(batch)) as Block)
    }

    fn key_arrays(&self, key: &GroupKey) -> Result<Vec<ArrayRef>> {
        match key {
            GroupKey::Column(name) => Ok(vec![column_by_name(&self.batch, name)?]),
            GroupKey::Columns(names) => names
                .iter()
                .map(|name| column_by_name(&self.batch, name))
                .collect(),
            GroupKey::Computed(expr) => {
                let batch = attach_computed_key(&self.batch, key)?;
                Ok(vec![column_by_name(&batch, expr.name())?])
            }
        }
    }

    fn sort_and_partition(
        &self,
        boundaries: &[KeyTuple],
        key: &GroupKey,
    ) -> Result<Vec<Block>> {
        let working = attach_computed_key(&self.batch, key)?;
        let key_names = key.column_names();

        let sort_columns = key_names
            .iter()
            .map(|name| {
                Ok(SortColumn {
                    values: column_by_name(&working, name)?,
                    options: Some(SortOptions {
                        descending: false,
                        nulls_first: true,
                    }),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let indices = lexsort_to_indices(&sort_columns, None)?;

        let sorted_columns = working
            .columns()
            .iter()
            .map(|column| Ok(take(column.as_ref(), &indices, None)?))
            .collect::<Result<Vec<_>>>()?;
        let options =
            RecordBatchOptions::new().with_row_count(Some(working.num_rows()));
        let sorted = RecordBatch::try_new_with_options(
            working.schema(),
            sorted_columns,
            &options,
        )?;

        let sorted_keys = key_names
            .iter()
            .map(|name| column_by_name(&sorted, name))
            .collect::<Result<Vec<_>>>()?;
        let ranges = partition_ranges(sorted.num_rows(), boundaries, |row| {
            key_tuple_at(&sorted_keys, row)
        })?;
        Ok(ranges
            .into_iter()
            .map(|range| {
                let slice = sorted.slice(range.start, range.end - range.start);
                Arc::new(ArrowBlock::new(slice)) as Block
            })
            .collect())
    }

    fn combine(
        &self,
        key: Option<&GroupKey>,
        aggs: &[Arc<dyn AggregateFn>],
    ) -> Result<Block> {
        let working = match key {
            Some(key) => attach_computed_key(&self.batch, key)?,
            None => self.batch.clone(),
        };
        let schema = working.schema();
        combine_sorted_columns(
            &schema,
            working.columns(),
            working.num_rows(),
            key,
            aggs,
            BatchFormat::Arrow,
        )
    }

    fn to_record_batch(&self) -> Result<RecordBatch> {
        Ok(self.batch.clone())
    }

    fn to_format(&self, format: BatchFormat) -> Result<Block> {
        match format {
            BatchFormat::Arrow => Ok(Arc::new(self.clone()) as Block),
            BatchFormat::Row => {
                let mut rows = Vec::with_capacity(self.batch.num_rows());
                for row in 0..self.batch.num_rows() {
                    let mut scalars = Vec::with_capacity(self.batch.num_columns());
                    for column in self.batch.columns() {
                        scalars.push(ScalarValue::try_from_array(column, row)?);
                    }
                    rows.push(scalars);
                }
                Ok(Arc::new(RowBlock::try_new(self.batch.schema(), rows)?) as Block)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::DataType;

    fn test_block(a: Vec<i64>, b: Vec<i64>) -> ArrowBlock {
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

    fn int_column(block: &Block, name: &str) -> Vec<Option<i64>> {
        let batch = block.to_record_batch().unwrap();
        let index = batch.schema_ref().index_of(name).unwrap();
        (0..batch.num_rows())
            .map(|row| {
                match ScalarValue::try_from_array(batch.column(index), row).unwrap() {
                    ScalarValue::Int64(v) => v,
                    other => panic!("unexpected scalar {other}"),
                }
            })
            .collect()
    }

    #[test]
    fn select_projects_named_columns() {
        let block = test_block(vec![1, 2], vec![10, 20]);
        let selected = block.select(&["b".to_owned()]).unwrap();
        assert_eq!(selected.schema().fields().len(), 1);
        assert_eq!(int_column(&selected, "b"), vec![Some(10), Some(20)]);
    }

    #[test]
    fn selecting_no_columns_keeps_the_row_count() {
        let block = test_block(vec![1, 2, 3], vec![10, 20, 30]);
        let selected = block.select(&[]).unwrap();
        assert_eq!(selected.schema().fields().len(), 0);
        assert_eq!(selected.num_rows(), 3);

        let batch = selected.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 0);
    }

    #[test]
    fn sort_and_partition_splits_at_boundaries() {
        let block = test_block(vec![1, 6, 1], vec![10, 20, 5]);
        let key = GroupKey::column("a");
        let boundaries = vec![vec![ScalarValue::Int64(Some(5))]];

        let partitions = block.sort_and_partition(&boundaries, &key).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(int_column(&partitions[0], "a"), vec![Some(1), Some(1)]);
        assert_eq!(int_column(&partitions[1], "a"), vec![Some(6)]);
        assert_eq!(int_column(&partitions[1], "b"), vec![Some(20)]);
    }

    #[test]
    fn every_partition_is_emitted_even_when_empty() {
        let block = test_block(vec![1, 2], vec![10, 20]);
        let key = GroupKey::column("a");
        let boundaries = vec![vec![ScalarValue::Int64(Some(5))]];

        let partitions = block.sort_and_partition(&boundaries, &key).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].num_rows(), 2);
        assert_eq!(partitions[1].num_rows(), 0);
        assert_eq!(partitions[1].schema(), partitions[0].schema());
    }

    #[test]
    fn conversion_to_rows_preserves_values() {
        let block = test_block(vec![3, 1], vec![30, 10]);
        let rows = block.to_format(BatchFormat::Row).unwrap();
        assert_eq!(rows.format(), BatchFormat::Row);
        assert_eq!(rows.num_rows(), 2);
        assert_eq!(int_column(&rows, "a"), vec![Some(3), Some(1)]);
        assert_eq!(int_column(&rows, "b"), vec![Some(30), Some(10)]);
    }
}

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

//! Row-oriented block representation

use std::any::Any;
use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef, new_empty_array};
use datafusion::arrow::compute::{lexsort_to_indices, take, SortColumn, SortOptions};
use datafusion::arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;

use crate::aggregate::AggregateFn;
use crate::block::combine::combine_sorted_columns;
use crate::block::{rows_to_record_batch, ArrowBlock, BatchFormat, Block, BlockData};
use crate::error::{FoldexError, Result};
use crate::key::{key_tuple_at, GroupKey, KeyExpr, KeyTuple};
use crate::partition::partition_ranges;

/// Block holding rows of scalar tuples.
///
/// Row blocks materialize Arrow arrays on demand and run the same sort
/// kernels as [ArrowBlock], permuting the stored rows by the resulting
/// indices.
#[derive(Debug, Clone)]
pub struct RowBlock {
    schema: SchemaRef,
    rows: Vec<Vec<ScalarValue>>,
}

impl RowBlock {
    /// Creates a row block after validating that every row matches the
    /// schema width.
    pub fn try_new(schema: SchemaRef, rows: Vec<Vec<ScalarValue>>) -> Result<Self> {
        let width = schema.fields().len();
        if let Some(row) = rows.iter().find(|row| row.len() != width) {
            return Err(FoldexError::General(format!(
                "row width {} does not match schema width {width}",
                row.len()
            )));
        }
        Ok(Self { schema, rows })
    }

    /// The rows of this block.
    pub fn rows(&self) -> &[Vec<ScalarValue>] {
        &self.rows
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        Ok(self.schema.index_of(name)?)
    }

    fn materialize_column(&self, index: usize) -> Result<ArrayRef> {
        let field = self.schema.field(index);
        if self.rows.is_empty() {
            return Ok(new_empty_array(field.data_type()));
        }
        Ok(ScalarValue::iter_to_array(
            self.rows.iter().map(|row| row[index].clone()),
        )?)
    }

    /// Returns this block with a computed key materialized as a
    /// trailing column; plain column keys pass through untouched.
    fn with_computed_key(&self, key: &GroupKey) -> Result<RowBlock> {
        let GroupKey::Computed(expr) = key else {
            return Ok(self.clone());
        };
        if self.schema.index_of(expr.name()).is_ok() {
            return Ok(self.clone());
        }
        let array = self.key_arrays(key)?.remove(0);
        let mut fields = self.schema.fields().iter().cloned().collect::<Vec<_>>();
        fields.push(Arc::new(Field::new(
            expr.name(),
            array.data_type().clone(),
            true,
        )));
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let mut row = row.clone();
                row.push(ScalarValue::try_from_array(&array, index)?);
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        RowBlock::try_new(Arc::new(Schema::new(fields)), rows)
    }
}

impl BlockData for RowBlock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn format(&self) -> BatchFormat {
        BatchFormat::Row
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn size_bytes(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().map(|value| value.size()).sum::<usize>())
            .sum()
    }

    fn columns(&self) -> Result<Vec<ArrayRef>> {
        (0..self.schema.fields().len())
            .map(|index| self.materialize_column(index))
            .collect()
    }

    fn select(&self, columns: &[String]) -> Result<Block> {
        let mut indices = Vec::with_capacity(columns.len());
        let mut fields = Vec::with_capacity(columns.len());
        for name in columns {
            let index = self.column_index(name)?;
            indices.push(index);
            fields.push(self.schema.field(index).clone());
        }
        // Projecting away every column still keeps one (empty) tuple
        // per row, so the row count survives.
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&index| row[index].clone()).collect())
            .collect();
        Ok(Arc::new(RowBlock::try_new(Arc::new(Schema::new(fields)), rows)?) as Block)
    }

    fn key_arrays(&self, key: &GroupKey) -> Result<Vec<ArrayRef>> {
        match key {
            GroupKey::Column(name) => {
                Ok(vec![self.materialize_column(self.column_index(name)?)?])
            }
            GroupKey::Columns(names) => names
                .iter()
                .map(|name| self.materialize_column(self.column_index(name)?))
                .collect(),
            GroupKey::Computed(expr) => {
                if let Ok(index) = self.schema.index_of(expr.name()) {
                    return Ok(vec![self.materialize_column(index)?]);
                }
                let batch = self.to_record_batch()?;
                let array = expr.evaluate(&batch)?;
                if array.len() != self.rows.len() {
                    return Err(FoldexError::Internal(format!(
                        "key expression {} produced {} values for {} rows",
                        expr.name(),
                        array.len(),
                        self.rows.len()
                    )));
                }
                Ok(vec![array])
            }
        }
    }

    fn sort_and_partition(
        &self,
        boundaries: &[KeyTuple],
        key: &GroupKey,
    ) -> Result<Vec<Block>> {
        let working = self.with_computed_key(key)?;
        let key_names = key.column_names();

        let sort_columns = key_names
            .iter()
            .map(|name| {
                Ok(SortColumn {
                    values: working.materialize_column(working.column_index(name)?)?,
                    options: Some(SortOptions {
                        descending: false,
                        nulls_first: true,
                    }),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let indices = lexsort_to_indices(&sort_columns, None)?;

        let sorted_rows = indices
            .values()
            .iter()
            .map(|&index| working.rows[index as usize].clone())
            .collect::<Vec<_>>();
        let sorted_keys = sort_columns
            .iter()
            .map(|column| Ok(take(column.values.as_ref(), &indices, None)?))
            .collect::<Result<Vec<_>>>()?;

        let ranges = partition_ranges(sorted_rows.len(), boundaries, |row| {
            key_tuple_at(&sorted_keys, row)
        })?;
        ranges
            .into_iter()
            .map(|range| {
                let rows = sorted_rows[range].to_vec();
                Ok(Arc::new(RowBlock::try_new(working.schema.clone(), rows)?) as Block)
            })
            .collect()
    }

    fn combine(
        &self,
        key: Option<&GroupKey>,
        aggs: &[Arc<dyn AggregateFn>],
    ) -> Result<Block> {
        let working = match key {
            Some(key) => self.with_computed_key(key)?,
            None => self.clone(),
        };
        let columns = working.columns()?;
        combine_sorted_columns(
            &working.schema,
            &columns,
            working.rows.len(),
            key,
            aggs,
            BatchFormat::Row,
        )
    }

    fn to_record_batch(&self) -> Result<RecordBatch> {
        rows_to_record_batch(&self.schema, &self.rows)
    }

    fn to_format(&self, format: BatchFormat) -> Result<Block> {
        match format {
            BatchFormat::Row => Ok(Arc::new(self.clone()) as Block),
            BatchFormat::Arrow => {
                Ok(Arc::new(ArrowBlock::new(self.to_record_batch()?)) as Block)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use datafusion::arrow::datatypes::DataType;

    fn test_block(values: Vec<(i64, &str)>) -> RowBlock {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        let rows = values
            .into_iter()
            .map(|(a, s)| vec![ScalarValue::Int64(Some(a)), ScalarValue::from(s)])
            .collect();
        RowBlock::try_new(schema, rows).unwrap()
    }

    #[test]
    fn rejects_rows_of_the_wrong_width() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "a",
            DataType::Int64,
            true,
        )]));
        let err = RowBlock::try_new(
            schema,
            vec![vec![ScalarValue::Int64(Some(1)), ScalarValue::Int64(Some(2))]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match schema width"));
    }

    #[test]
    fn selecting_no_columns_keeps_the_row_count() {
        let block = test_block(vec![(1, "x"), (2, "y")]);
        let selected = block.select(&[]).unwrap();
        assert_eq!(selected.num_rows(), 2);
        assert_eq!(selected.schema().fields().len(), 0);
    }

    #[test]
    fn sort_and_partition_orders_rows() {
        let block = test_block(vec![(6, "c"), (1, "a"), (3, "b")]);
        let key = GroupKey::column("a");
        let boundaries = vec![vec![ScalarValue::Int64(Some(3))]];

        let partitions = block.sort_and_partition(&boundaries, &key).unwrap();
        assert_eq!(partitions.len(), 2);

        let low = partitions[0]
            .as_any()
            .downcast_ref::<RowBlock>()
            .unwrap()
            .rows()
            .to_vec();
        assert_eq!(
            low,
            vec![
                vec![ScalarValue::Int64(Some(1)), ScalarValue::from("a")],
                vec![ScalarValue::Int64(Some(3)), ScalarValue::from("b")],
            ]
        );
        assert_eq!(partitions[1].num_rows(), 1);
    }

    #[test]
    fn conversion_round_trips_through_arrow() {
        let block = test_block(vec![(5, "e"), (2, "b")]);
        let arrow = block.to_format(BatchFormat::Arrow).unwrap();
        assert_eq!(arrow.format(), BatchFormat::Arrow);

        let back = arrow.to_format(BatchFormat::Row).unwrap();
        let rows = back.as_any().downcast_ref::<RowBlock>().unwrap().rows();
        assert_eq!(rows, block.rows());
    }
}

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

//! Built-in aggregate functions.

use std::cmp::Ordering;

use datafusion::arrow::array::{Array, ArrayRef, AsArray};
use datafusion::arrow::compute::{self, cast};
use datafusion::arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, Schema, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use datafusion::common::ScalarValue;

use crate::aggregate::{
    single_input, single_state_field, Accumulator, AggregateFn, AggregateInput,
};
use crate::error::{FoldexError, Result};
use crate::key::cmp_scalars;

/// Accumulation type for sums and means of the given input type.
/// Signed integers widen to `Int64`, unsigned to `UInt64`, floats to
/// `Float64`.
fn accumulation_type(input: &DataType) -> Result<DataType> {
    match input {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            Ok(DataType::Int64)
        }
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            Ok(DataType::UInt64)
        }
        DataType::Float32 | DataType::Float64 => Ok(DataType::Float64),
        other => Err(FoldexError::NotImplemented(format!(
            "numeric aggregation over column type {other}"
        ))),
    }
}

fn min_max_supported(data_type: &DataType) -> Result<()> {
    match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float32
        | DataType::Float64
        | DataType::Utf8 => Ok(()),
        other => Err(FoldexError::NotImplemented(format!(
            "min/max over column type {other}"
        ))),
    }
}

fn add_options<T: std::ops::Add<Output = T>>(
    left: Option<T>,
    right: Option<T>,
) -> Option<T> {
    match (left, right) {
        (None, None) => None,
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (Some(l), Some(r)) => Some(l + r),
    }
}

fn add_scalars(left: &ScalarValue, right: &ScalarValue) -> Result<ScalarValue> {
    Ok(match (left, right) {
        (ScalarValue::Int64(l), ScalarValue::Int64(r)) => {
            ScalarValue::Int64(add_options(*l, *r))
        }
        (ScalarValue::UInt64(l), ScalarValue::UInt64(r)) => {
            ScalarValue::UInt64(add_options(*l, *r))
        }
        (ScalarValue::Float64(l), ScalarValue::Float64(r)) => {
            ScalarValue::Float64(add_options(*l, *r))
        }
        (l, r) => {
            return Err(FoldexError::General(format!(
                "cannot add partial sums of type {} and {}",
                l.data_type(),
                r.data_type()
            )))
        }
    })
}

/// Sums an array after widening it to the accumulation type.
fn sum_array(array: &ArrayRef, accumulation: &DataType) -> Result<ScalarValue> {
    let array = cast(array, accumulation)?;
    Ok(match accumulation {
        DataType::Int64 => {
            ScalarValue::Int64(compute::sum(array.as_primitive::<Int64Type>()))
        }
        DataType::UInt64 => {
            ScalarValue::UInt64(compute::sum(array.as_primitive::<UInt64Type>()))
        }
        DataType::Float64 => {
            ScalarValue::Float64(compute::sum(array.as_primitive::<Float64Type>()))
        }
        other => {
            return Err(FoldexError::Internal(format!(
                "unexpected accumulation type {other}"
            )))
        }
    })
}

macro_rules! typed_min_max {
    ($ARRAY:expr, $KERNEL:ident, $STRING_KERNEL:ident) => {{
        let array = $ARRAY;
        match array.data_type() {
            DataType::Int8 => {
                ScalarValue::Int8(compute::$KERNEL(array.as_primitive::<Int8Type>()))
            }
            DataType::Int16 => {
                ScalarValue::Int16(compute::$KERNEL(array.as_primitive::<Int16Type>()))
            }
            DataType::Int32 => {
                ScalarValue::Int32(compute::$KERNEL(array.as_primitive::<Int32Type>()))
            }
            DataType::Int64 => {
                ScalarValue::Int64(compute::$KERNEL(array.as_primitive::<Int64Type>()))
            }
            DataType::UInt8 => {
                ScalarValue::UInt8(compute::$KERNEL(array.as_primitive::<UInt8Type>()))
            }
            DataType::UInt16 => ScalarValue::UInt16(compute::$KERNEL(
                array.as_primitive::<UInt16Type>(),
            )),
            DataType::UInt32 => ScalarValue::UInt32(compute::$KERNEL(
                array.as_primitive::<UInt32Type>(),
            )),
            DataType::UInt64 => ScalarValue::UInt64(compute::$KERNEL(
                array.as_primitive::<UInt64Type>(),
            )),
            DataType::Float32 => ScalarValue::Float32(compute::$KERNEL(
                array.as_primitive::<Float32Type>(),
            )),
            DataType::Float64 => ScalarValue::Float64(compute::$KERNEL(
                array.as_primitive::<Float64Type>(),
            )),
            DataType::Utf8 => ScalarValue::Utf8(
                compute::$STRING_KERNEL(array.as_string::<i32>())
                    .map(|value| value.to_owned()),
            ),
            other => {
                return Err(FoldexError::NotImplemented(format!(
                    "min/max over column type {other}"
                )))
            }
        }
    }};
}

fn min_array(array: &ArrayRef) -> Result<ScalarValue> {
    Ok(typed_min_max!(array, min, min_string))
}

fn max_array(array: &ArrayRef) -> Result<ScalarValue> {
    Ok(typed_min_max!(array, max, max_string))
}

fn state_mismatch(name: &str, state: &[ScalarValue]) -> FoldexError {
    FoldexError::General(format!(
        "partial state {state:?} does not match aggregate {name}"
    ))
}

/// Row count. Needs no input column, so it never prevents column
/// pruning; rows count whether or not any column value is null.
#[derive(Debug, Clone, Default)]
pub struct Count {}

impl Count {
    /// Creates a row count aggregate.
    pub fn new() -> Self {
        Self {}
    }
}

impl AggregateFn for Count {
    fn name(&self) -> String {
        "count()".to_owned()
    }

    fn input(&self) -> AggregateInput {
        AggregateInput::None
    }

    fn num_state_columns(&self) -> usize {
        1
    }

    fn state_fields(&self, _input_schema: &Schema) -> Result<Vec<Field>> {
        Ok(vec![Field::new(self.name(), DataType::UInt64, false)])
    }

    fn output_field(&self, state_fields: &[Field]) -> Result<Field> {
        Ok(single_state_field(&self.name(), state_fields)?.clone())
    }

    fn create_accumulator(
        &self,
        state_fields: &[Field],
    ) -> Result<Box<dyn Accumulator>> {
        single_state_field(&self.name(), state_fields)?;
        Ok(Box::new(CountAccumulator { count: 0 }))
    }
}

#[derive(Debug)]
struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn update_batch(&mut self, _values: &[ArrayRef], num_rows: usize) -> Result<()> {
        self.count += num_rows as u64;
        Ok(())
    }

    fn merge_state(&mut self, state: &[ScalarValue]) -> Result<()> {
        match state {
            [ScalarValue::UInt64(count)] => {
                self.count += count.unwrap_or(0);
                Ok(())
            }
            other => Err(state_mismatch("count()", other)),
        }
    }

    fn state(&self) -> Result<Vec<ScalarValue>> {
        Ok(vec![ScalarValue::UInt64(Some(self.count))])
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(ScalarValue::UInt64(Some(self.count)))
    }
}

/// Sum of a numeric column. Signed integers accumulate as `Int64`,
/// unsigned as `UInt64`, floats as `Float64`. Nulls are ignored and the
/// sum of no non-null values is null.
#[derive(Debug, Clone)]
pub struct Sum {
    column: String,
}

impl Sum {
    /// Sums the given column.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl AggregateFn for Sum {
    fn name(&self) -> String {
        format!("sum({})", self.column)
    }

    fn input(&self) -> AggregateInput {
        AggregateInput::Column(self.column.clone())
    }

    fn num_state_columns(&self) -> usize {
        1
    }

    fn state_fields(&self, input_schema: &Schema) -> Result<Vec<Field>> {
        let input = input_schema.field_with_name(&self.column)?;
        let accumulation = accumulation_type(input.data_type())?;
        Ok(vec![Field::new(self.name(), accumulation, true)])
    }

    fn output_field(&self, state_fields: &[Field]) -> Result<Field> {
        Ok(single_state_field(&self.name(), state_fields)?.clone())
    }

    fn create_accumulator(
        &self,
        state_fields: &[Field],
    ) -> Result<Box<dyn Accumulator>> {
        let field = single_state_field(&self.name(), state_fields)?;
        Ok(Box::new(SumAccumulator {
            sum: ScalarValue::try_from(field.data_type())?,
        }))
    }
}

#[derive(Debug)]
struct SumAccumulator {
    sum: ScalarValue,
}

impl Accumulator for SumAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let values = single_input("sum", values)?;
        let delta = sum_array(values, &self.sum.data_type())?;
        self.sum = add_scalars(&self.sum, &delta)?;
        Ok(())
    }

    fn merge_state(&mut self, state: &[ScalarValue]) -> Result<()> {
        match state {
            [partial] => {
                self.sum = add_scalars(&self.sum, partial)?;
                Ok(())
            }
            other => Err(state_mismatch("sum", other)),
        }
    }

    fn state(&self) -> Result<Vec<ScalarValue>> {
        Ok(vec![self.sum.clone()])
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(self.sum.clone())
    }
}

/// Minimum of a numeric or string column, ignoring nulls.
#[derive(Debug, Clone)]
pub struct Min {
    column: String,
}

impl Min {
    /// Takes the minimum of the given column.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl AggregateFn for Min {
    fn name(&self) -> String {
        format!("min({})", self.column)
    }

    fn input(&self) -> AggregateInput {
        AggregateInput::Column(self.column.clone())
    }

    fn num_state_columns(&self) -> usize {
        1
    }

    fn state_fields(&self, input_schema: &Schema) -> Result<Vec<Field>> {
        let input = input_schema.field_with_name(&self.column)?;
        min_max_supported(input.data_type())?;
        Ok(vec![Field::new(self.name(), input.data_type().clone(), true)])
    }

    fn output_field(&self, state_fields: &[Field]) -> Result<Field> {
        Ok(single_state_field(&self.name(), state_fields)?.clone())
    }

    fn create_accumulator(
        &self,
        state_fields: &[Field],
    ) -> Result<Box<dyn Accumulator>> {
        let field = single_state_field(&self.name(), state_fields)?;
        Ok(Box::new(MinMaxAccumulator::try_new(field.data_type(), true)?))
    }
}

/// Maximum of a numeric or string column, ignoring nulls.
#[derive(Debug, Clone)]
pub struct Max {
    column: String,
}

impl Max {
    /// Takes the maximum of the given column.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl AggregateFn for Max {
    fn name(&self) -> String {
        format!("max({})", self.column)
    }

    fn input(&self) -> AggregateInput {
        AggregateInput::Column(self.column.clone())
    }

    fn num_state_columns(&self) -> usize {
        1
    }

    fn state_fields(&self, input_schema: &Schema) -> Result<Vec<Field>> {
        let input = input_schema.field_with_name(&self.column)?;
        min_max_supported(input.data_type())?;
        Ok(vec![Field::new(self.name(), input.data_type().clone(), true)])
    }

    fn output_field(&self, state_fields: &[Field]) -> Result<Field> {
        Ok(single_state_field(&self.name(), state_fields)?.clone())
    }

    fn create_accumulator(
        &self,
        state_fields: &[Field],
    ) -> Result<Box<dyn Accumulator>> {
        let field = single_state_field(&self.name(), state_fields)?;
        Ok(Box::new(MinMaxAccumulator::try_new(
            field.data_type(),
            false,
        )?))
    }
}

#[derive(Debug)]
struct MinMaxAccumulator {
    value: ScalarValue,
    prefer_min: bool,
}

impl MinMaxAccumulator {
    fn try_new(data_type: &DataType, prefer_min: bool) -> Result<Self> {
        Ok(Self {
            value: ScalarValue::try_from(data_type)?,
            prefer_min,
        })
    }

    fn fold(&mut self, candidate: &ScalarValue) -> Result<()> {
        if candidate.is_null() {
            return Ok(());
        }
        if self.value.is_null() {
            self.value = candidate.clone();
            return Ok(());
        }
        let replace = match cmp_scalars(candidate, &self.value)? {
            Ordering::Less => self.prefer_min,
            Ordering::Greater => !self.prefer_min,
            Ordering::Equal => false,
        };
        if replace {
            self.value = candidate.clone();
        }
        Ok(())
    }
}

impl Accumulator for MinMaxAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let values = single_input("min/max", values)?;
        let candidate = if self.prefer_min {
            min_array(values)?
        } else {
            max_array(values)?
        };
        self.fold(&candidate)
    }

    fn merge_state(&mut self, state: &[ScalarValue]) -> Result<()> {
        match state {
            [partial] => self.fold(partial),
            other => Err(state_mismatch("min/max", other)),
        }
    }

    fn state(&self) -> Result<Vec<ScalarValue>> {
        Ok(vec![self.value.clone()])
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(self.value.clone())
    }
}

/// Arithmetic mean of a numeric column. Partial state is the running
/// `(sum, count)` pair over non-null values, so partials merge exactly
/// regardless of how rows were spread across producers.
#[derive(Debug, Clone)]
pub struct Mean {
    column: String,
}

impl Mean {
    /// Averages the given column.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl AggregateFn for Mean {
    fn name(&self) -> String {
        format!("mean({})", self.column)
    }

    fn input(&self) -> AggregateInput {
        AggregateInput::Column(self.column.clone())
    }

    fn num_state_columns(&self) -> usize {
        2
    }

    fn state_fields(&self, input_schema: &Schema) -> Result<Vec<Field>> {
        let input = input_schema.field_with_name(&self.column)?;
        accumulation_type(input.data_type())?;
        Ok(vec![
            Field::new(format!("{}_sum", self.name()), DataType::Float64, true),
            Field::new(format!("{}_count", self.name()), DataType::UInt64, false),
        ])
    }

    fn output_field(&self, state_fields: &[Field]) -> Result<Field> {
        if state_fields.len() != 2 {
            return Err(FoldexError::Internal(format!(
                "aggregate {} expects two state columns, got {}",
                self.name(),
                state_fields.len()
            )));
        }
        Ok(Field::new(self.name(), DataType::Float64, true))
    }

    fn create_accumulator(
        &self,
        state_fields: &[Field],
    ) -> Result<Box<dyn Accumulator>> {
        if state_fields.len() != 2 {
            return Err(FoldexError::Internal(format!(
                "aggregate {} expects two state columns, got {}",
                self.name(),
                state_fields.len()
            )));
        }
        Ok(Box::new(MeanAccumulator { sum: None, count: 0 }))
    }
}

#[derive(Debug)]
struct MeanAccumulator {
    sum: Option<f64>,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let values = single_input("mean", values)?;
        let array = cast(values, &DataType::Float64)?;
        let non_null = (array.len() - array.null_count()) as u64;
        let delta = compute::sum(array.as_primitive::<Float64Type>());
        self.sum = add_options(self.sum, delta);
        self.count += non_null;
        Ok(())
    }

    fn merge_state(&mut self, state: &[ScalarValue]) -> Result<()> {
        match state {
            [ScalarValue::Float64(sum), ScalarValue::UInt64(count)] => {
                self.sum = add_options(self.sum, *sum);
                self.count += count.unwrap_or(0);
                Ok(())
            }
            other => Err(state_mismatch("mean", other)),
        }
    }

    fn state(&self) -> Result<Vec<ScalarValue>> {
        Ok(vec![
            ScalarValue::Float64(self.sum),
            ScalarValue::UInt64(Some(self.count)),
        ])
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(ScalarValue::Float64(
            self.sum.map(|sum| sum / self.count as f64),
        ))
    }
}

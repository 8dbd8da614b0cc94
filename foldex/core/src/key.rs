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

//! Grouping key descriptors and key value ordering

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use datafusion::arrow::array::ArrayRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;

use crate::error::{FoldexError, Result};

/// The key value of one row: one scalar per key column, compared left
/// to right with nulls ordered first.
pub type KeyTuple = Vec<ScalarValue>;

/// A key derived from the block rather than read from a column.
///
/// Implementations must be deterministic: the same batch must always
/// produce the same key array, or task retries would repartition rows
/// differently.
pub trait KeyExpr: fmt::Debug + Send + Sync {
    /// Name of the key column this expression produces.
    fn name(&self) -> &str;

    /// Evaluates the expression to one key value per row.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Grouping key of an exchange.
///
/// The key decides sort order, range partitioning, and which rows
/// collapse into one group. Exchanges without a key (global
/// aggregation) carry no `GroupKey` at all.
#[derive(Debug, Clone)]
pub enum GroupKey {
    /// A single named column.
    Column(String),
    /// Multiple named columns, most significant first.
    Columns(Vec<String>),
    /// A computed key. Blocks cannot be pruned in this case because the
    /// expression does not declare which columns it reads.
    Computed(Arc<dyn KeyExpr>),
}

impl GroupKey {
    /// Key for a single named column.
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column(name.into())
    }

    /// Number of key columns.
    pub fn arity(&self) -> usize {
        match self {
            Self::Column(_) | Self::Computed(_) => 1,
            Self::Columns(names) => names.len(),
        }
    }

    /// Names of the key columns, in key order.
    pub fn column_names(&self) -> Vec<String> {
        match self {
            Self::Column(name) => vec![name.clone()],
            Self::Columns(names) => names.clone(),
            Self::Computed(expr) => vec![expr.name().to_owned()],
        }
    }

    /// Input columns the key reads, or `None` when that set is unknown
    /// and column pruning must be disabled.
    pub fn projected_columns(&self) -> Option<Vec<String>> {
        match self {
            Self::Column(name) => Some(vec![name.clone()]),
            Self::Columns(names) => Some(names.clone()),
            Self::Computed(_) => None,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Column(name) => write!(f, "{name}"),
            Self::Columns(names) => write!(f, "{}", names.join(", ")),
            Self::Computed(expr) => write!(f, "{}", expr.name()),
        }
    }
}

/// Compares two key scalars with nulls first.
///
/// Values of mismatched types (and incomparable values such as NaN)
/// are rejected rather than ordered arbitrarily, since an arbitrary
/// order would break the agreement between mappers and reducers.
pub fn cmp_scalars(left: &ScalarValue, right: &ScalarValue) -> Result<Ordering> {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ok(Ordering::Equal),
        (true, false) => Ok(Ordering::Less),
        (false, true) => Ok(Ordering::Greater),
        (false, false) => left.partial_cmp(right).ok_or_else(|| {
            FoldexError::General(format!(
                "cannot order key value of type {} against type {}",
                left.data_type(),
                right.data_type()
            ))
        }),
    }
}

/// Compares two key tuples column by column.
pub fn cmp_key_tuples(left: &KeyTuple, right: &KeyTuple) -> Result<Ordering> {
    if left.len() != right.len() {
        return Err(FoldexError::Internal(format!(
            "key arity mismatch: {} vs {}",
            left.len(),
            right.len()
        )));
    }
    for (l, r) in left.iter().zip(right.iter()) {
        match cmp_scalars(l, r)? {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

/// Reads the key tuple at `row` from evaluated key arrays.
pub fn key_tuple_at(key_arrays: &[ArrayRef], row: usize) -> Result<KeyTuple> {
    key_arrays
        .iter()
        .map(|array| Ok(ScalarValue::try_from_array(array, row)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_order_first() {
        let null = ScalarValue::Int64(None);
        let one = ScalarValue::Int64(Some(1));
        assert_eq!(cmp_scalars(&null, &one).unwrap(), Ordering::Less);
        assert_eq!(cmp_scalars(&one, &null).unwrap(), Ordering::Greater);
        assert_eq!(cmp_scalars(&null, &null).unwrap(), Ordering::Equal);
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let int = ScalarValue::Int64(Some(1));
        let string = ScalarValue::from("a");
        let err = cmp_scalars(&int, &string).unwrap_err();
        assert!(err.to_string().contains("cannot order key value"));
    }

    #[test]
    fn tuples_compare_lexicographically() {
        let a = vec![ScalarValue::Int64(Some(1)), ScalarValue::from("b")];
        let b = vec![ScalarValue::Int64(Some(1)), ScalarValue::from("c")];
        assert_eq!(cmp_key_tuples(&a, &b).unwrap(), Ordering::Less);
        assert_eq!(cmp_key_tuples(&b, &a).unwrap(), Ordering::Greater);
        assert_eq!(cmp_key_tuples(&a, &a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn tuple_arity_mismatch_is_internal_error() {
        let a = vec![ScalarValue::Int64(Some(1))];
        let b = vec![ScalarValue::Int64(Some(1)), ScalarValue::Int64(Some(2))];
        assert!(matches!(
            cmp_key_tuples(&a, &b),
            Err(FoldexError::Internal(_))
        ));
    }

    #[test]
    fn key_descriptors_report_their_columns() {
        let single = GroupKey::column("a");
        assert_eq!(single.arity(), 1);
        assert_eq!(single.column_names(), vec!["a".to_owned()]);
        assert_eq!(single.projected_columns(), Some(vec!["a".to_owned()]));

        let multi = GroupKey::Columns(vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(multi.arity(), 2);
        assert_eq!(multi.to_string(), "a, b");
    }
}

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

//! Foldex error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    result,
};

use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;

/// Result type alias for Foldex operations.
pub type Result<T> = result::Result<T, FoldexError>;

/// Foldex error types for distributed aggregation tasks.
#[derive(Debug)]
pub enum FoldexError {
    /// Feature is not yet implemented.
    NotImplemented(String),
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Exchange plan error with invalid settings.
    Configuration(String),
    /// Error from Arrow operations.
    ArrowError(Box<ArrowError>),
    /// Error from DataFusion operations.
    DataFusionError(Box<DataFusionError>),
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for FoldexError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

/// Creates a general Foldex error from a string message.
pub fn foldex_error(message: &str) -> FoldexError {
    FoldexError::General(message.to_owned())
}

impl From<String> for FoldexError {
    fn from(e: String) -> Self {
        FoldexError::General(e)
    }
}

impl From<ArrowError> for FoldexError {
    fn from(e: ArrowError) -> Self {
        match e {
            ArrowError::ExternalError(e)
                if e.downcast_ref::<FoldexError>().is_some() =>
            {
                *e.downcast::<FoldexError>().unwrap()
            }
            ArrowError::ExternalError(e)
                if e.downcast_ref::<DataFusionError>().is_some() =>
            {
                FoldexError::DataFusionError(Box::new(
                    *e.downcast::<DataFusionError>().unwrap(),
                ))
            }
            other => FoldexError::ArrowError(Box::new(other)),
        }
    }
}

impl From<DataFusionError> for FoldexError {
    fn from(e: DataFusionError) -> Self {
        match e {
            DataFusionError::ArrowError(e, _) => Self::from(*e),
            _ => FoldexError::DataFusionError(Box::new(e)),
        }
    }
}

impl Display for FoldexError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FoldexError::NotImplemented(desc) => {
                write!(f, "Not implemented: {desc}")
            }
            FoldexError::General(desc) => write!(f, "General error: {desc}"),
            FoldexError::Internal(desc) => {
                write!(f, "Internal Foldex error: {desc}")
            }
            FoldexError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            FoldexError::ArrowError(desc) => write!(f, "Arrow error: {desc}"),
            FoldexError::DataFusionError(desc) => {
                write!(f, "DataFusion error: {desc}")
            }
        }
    }
}

impl Error for FoldexError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_external_arrow_errors() {
        let inner = FoldexError::Internal("cursor out of range".to_owned());
        let wrapped = ArrowError::ExternalError(Box::new(inner));
        match FoldexError::from(wrapped) {
            FoldexError::Internal(desc) => assert_eq!(desc, "cursor out of range"),
            other => panic!("expected Internal, got {other}"),
        }
    }

    #[test]
    fn unwraps_arrow_inside_datafusion() {
        let e = DataFusionError::ArrowError(
            Box::new(ArrowError::ComputeError("bad kernel".to_owned())),
            None,
        );
        match FoldexError::from(e) {
            FoldexError::ArrowError(inner) => {
                assert!(inner.to_string().contains("bad kernel"))
            }
            other => panic!("expected ArrowError, got {other}"),
        }
    }
}

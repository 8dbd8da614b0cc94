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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// The current version of Foldex, derived from the Cargo package version.
pub const FOLDEX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prints the current Foldex version to stdout.
pub fn print_version() {
    println!("Foldex version: {FOLDEX_VERSION}")
}

/// Aggregate functions and their mergeable accumulator state.
pub mod aggregate;
/// Block representations and the sort, partition and merge kernels.
pub mod block;
/// Error types and result definitions for Foldex operations.
pub mod error;
/// Map and reduce tasks of the sort-based exchanges.
pub mod exchange;
/// Grouping keys and key ordering.
pub mod key;
/// Block metadata and execution statistics.
pub mod metadata;
/// Range partitioning of sorted rows.
pub mod partition;

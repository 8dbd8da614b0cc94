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

//! Block metadata and per-task execution statistics

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datafusion::arrow::datatypes::SchemaRef;

/// Execution statistics recorded while a task produced a block.
///
/// Stats are wall-clock based and purely informational; schedulers
/// surface them in job progress reports but never branch on them.
#[derive(Debug, Clone, Default)]
pub struct BlockExecStats {
    /// Wall-clock time spent producing the block.
    pub wall_time: Duration,
}

impl BlockExecStats {
    /// Starts timing a task. Call [`BlockExecStatsBuilder::build`] when
    /// the task output is ready.
    pub fn builder() -> BlockExecStatsBuilder {
        BlockExecStatsBuilder {
            start: Instant::now(),
        }
    }
}

impl fmt::Display for BlockExecStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "wallTime={:?}", self.wall_time)
    }
}

/// In-flight timer for [BlockExecStats].
#[derive(Debug)]
pub struct BlockExecStatsBuilder {
    start: Instant,
}

impl BlockExecStatsBuilder {
    /// Finalizes the statistics for a completed task.
    pub fn build(self) -> BlockExecStats {
        BlockExecStats {
            wall_time: self.start.elapsed(),
        }
    }
}

/// Summary of a produced block
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    /// Number of rows in the block.
    pub num_rows: u64,
    /// In-memory size of the block in bytes.
    pub size_bytes: u64,
    /// Schema of the block.
    pub schema: SchemaRef,
    /// Statistics for the task that produced the block, if recorded.
    pub exec_stats: Option<Arc<BlockExecStats>>,
}

impl BlockMetadata {
    /// Creates metadata for a block.
    pub fn new(
        num_rows: u64,
        size_bytes: u64,
        schema: SchemaRef,
        exec_stats: Option<Arc<BlockExecStats>>,
    ) -> Self {
        Self {
            num_rows,
            size_bytes,
            schema,
            exec_stats,
        }
    }
}

impl fmt::Display for BlockMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "numRows={}, sizeBytes={}, fields={}",
            self.num_rows,
            self.size_bytes,
            self.schema.fields().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use datafusion::arrow::datatypes::{DataType, Field, Schema};

    #[test]
    fn exec_stats_builder_records_elapsed_time() {
        let builder = BlockExecStats::builder();
        std::thread::sleep(Duration::from_millis(2));
        let stats = builder.build();
        assert!(stats.wall_time >= Duration::from_millis(2));
    }

    #[test]
    fn metadata_display() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
        ]));
        let meta = BlockMetadata::new(3, 48, schema, None);
        assert_eq!(meta.to_string(), "numRows=3, sizeBytes=48, fields=2");
    }
}

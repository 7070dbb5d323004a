// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Refcounted interning tables shared by every sample in a session.

mod function_table;
mod intern_set;
mod string_table;

pub use function_table::*;
pub use string_table::*;

/// Both tables, borrowed together wherever a sample is created or destroyed.
#[derive(Debug, Default)]
pub struct InternTables {
    pub strings: StringTable,
    pub functions: FunctionTable,
}

impl InternTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approximate heap usage of both tables, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.strings.memory_usage() + self.functions.memory_usage()
    }
}

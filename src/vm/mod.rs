// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bundle evaluator: a frame-based stack machine over the compiled IR.

mod machine;

pub use machine::Machine;

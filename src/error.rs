// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

/// Runtime-wide error kinds.
///
/// Structural and lifecycle errors abort graph construction at the call
/// site; numeric and resource errors abort the current scheduling pass and
/// leave runtime state (persistent delays, pending jobs) intact for
/// inspection. Unresolved dependencies are *not* errors; they are values
/// re-evaluated after the next parameter update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A parameter with the same (case-folded) name already exists in the graph.
    DuplicateParam { graph: String, name: String },
    /// The name is reserved by the runtime and may not be used for user graphs.
    ReservedName(String),
    /// An expression depends on a dynamic parameter where a static value was required.
    DynamicExpression { entity: String, expression: String },
    /// Persistent delays may not carry a setter or getter.
    PersistentDelaySetterGetter { edge: String },
    /// A self-loop needs at least one sink-rate worth of delay tokens.
    InsufficientDelay {
        vertex: String,
        required: i64,
        actual: i64,
    },
    /// The repetition vector has no integer solution for this graph.
    InconsistentGraph { graph: String, detail: String },
    /// Expression could not be tokenized or parsed.
    ExpressionSyntax { expression: String, detail: String },
    /// Expression references a parameter missing from the evaluation table.
    UnknownParameter { expression: String, name: String },
    /// Division or modulo by zero, or integer overflow, during evaluation.
    EvaluationFault { expression: String },
    /// Persistent-delay (or other) reservation exceeded the memory unit.
    AllocationFailure { requested: u64, capacity: u64 },
    /// An external buffer index outside the registered range was referenced.
    ExternalBufferOutOfRange { index: usize },
    /// Only one physical platform may exist per session.
    PlatformAlreadyExists,
    /// Only one top-level application graph may exist per session.
    ApplicationAlreadyExists,
    /// A runtime operation was attempted before the platform was described.
    NoPlatform,
    /// A port index outside the vertex port array, or already connected.
    InvalidPort {
        vertex: String,
        port: usize,
        detail: &'static str,
    },
    /// Vertex subtype port-count invariant violated (fork with two inputs, ...).
    InvalidVertex { vertex: String, detail: &'static str },
    /// Config actors may only live in a graph that carries dynamic parameters.
    ConfigInStaticGraph { graph: String, vertex: String },
    /// An id (graph, vertex, edge, parameter, PE, kernel) did not resolve.
    InvalidIndex { entity: &'static str, index: usize },
    /// The mapper found no enabled PE satisfying the mapping constraints.
    NoMappablePe { task: String },
    /// Writing a persisted output (Gantt SVG, trace JSON) failed.
    ExportFailed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DuplicateParam { graph, name } => {
                write!(f, "ERROR: parameter '{}' already exists in graph '{}'", name, graph)
            }
            Self::ReservedName(name) => {
                write!(f, "ERROR: '{}' is a name reserved by the runtime", name)
            }
            Self::DynamicExpression { entity, expression } => {
                write!(
                    f,
                    "ERROR: {} requires a static value but expression '{}' is dynamic",
                    entity, expression
                )
            }
            Self::PersistentDelaySetterGetter { edge } => {
                write!(f, "ERROR: persistent delay on edge {} can not have setter nor getter", edge)
            }
            Self::InsufficientDelay { vertex, required, actual } => {
                write!(
                    f,
                    "ERROR: self-loop on '{}' needs a delay of at least {} tokens, got {}",
                    vertex, required, actual
                )
            }
            Self::InconsistentGraph { graph, detail } => {
                write!(f, "ERROR: graph '{}' is not consistent: {}", graph, detail)
            }
            Self::ExpressionSyntax { expression, detail } => {
                write!(f, "ERROR: failed to parse '{}': {}", expression, detail)
            }
            Self::UnknownParameter { expression, name } => {
                write!(f, "ERROR: expression '{}' references unknown parameter '{}'", expression, name)
            }
            Self::EvaluationFault { expression } => {
                write!(f, "ERROR: evaluation of '{}' did not produce a finite value", expression)
            }
            Self::AllocationFailure { requested, capacity } => {
                write!(
                    f,
                    "ERROR: reservation of {} bytes exceeds memory unit capacity of {}",
                    requested, capacity
                )
            }
            Self::InvalidPort { vertex, port, detail } => {
                write!(f, "ERROR: invalid port {} on vertex '{}': {}", port, vertex, detail)
            }
            Self::InvalidVertex { vertex, detail } => {
                write!(f, "ERROR: invalid vertex '{}': {}", vertex, detail)
            }
            Self::ConfigInStaticGraph { graph, vertex } => {
                write!(
                    f,
                    "ERROR: config actor '{}' requires graph '{}' to declare dynamic parameters",
                    vertex, graph
                )
            }
            Self::InvalidIndex { entity, index } => {
                write!(f, "ERROR: invalid {} index {}", entity, index)
            }
            Self::NoMappablePe { task } => {
                write!(f, "ERROR: no enabled PE can execute task '{}'", task)
            }
            _ => write!(f, "ERROR: {:?}", self),
        }
    }
}

impl std::error::Error for Error {}

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

//! Spider2: a runtime executing Parameterized and Interfaced Synchronous
//! Dataflow (PiSDF) applications on heterogeneous multi-core platforms.
//!
//! Applications are hierarchical dataflow graphs whose edge rates may be
//! symbolic expressions over parameters, some of which only become known at
//! runtime. The runtime computes repetition vectors, resolves firing
//! dependencies symbolically (without expanding to a single-rate DAG), maps
//! firings onto processing elements with a best-fit heuristic, materializes
//! FIFO storage, and executes the resulting plan on one worker thread per
//! local runtime.

mod api;
mod archi;
mod brv;
mod dependencies;
mod error;
mod expr;
mod firing;
mod gantt;
mod math;
mod pisdf;
mod runtime;
mod scheduler;

// Public types
pub use crate::api::{Rate, RuntimeConfig, Spider};
pub use crate::archi::{
    ClusterCostRoutine, ClusterId, MemoryCostRoutine, MemoryUnit, Pe, PeId, PeKind, Platform,
};
pub use crate::brv::compute as compute_brv;
pub use crate::dependencies::{
    cons_dependencies, exec_dependencies, vertex_cons_dependencies, vertex_exec_dependencies,
    DepKind, DependencyInfo,
};
pub use crate::error::Error;
pub use crate::expr::Expression;
pub use crate::firing::{FiringId, FiringTree, UNRESOLVED};
pub use crate::gantt::export as export_gantt;
pub use crate::pisdf::{
    Delay, Edge, Graph, GraphId, Graphs, Param, ParamKind, RuntimeInfo, Vertex, VertexType,
};
pub use crate::runtime::{
    BuiltinOp, ExecConstraint, ExternalBuffers, GrtMessage, JobFifos, JobMessage, Kernel,
    LrtMessage, MemoryInterface, NotificationMessage, ParameterMessage, RuntimePlatform,
    TraceMessage,
};
pub use crate::scheduler::{
    BestFitMapper, ExecutionPolicy, Fifo, FifoAllocator, FifoAttribute, ResourcesAllocator,
    Schedule, Scheduler, SchedulingPolicy, Stats, StorageInit, Task, TaskIx, TaskKind, TaskState,
};
pub use petgraph::graph::{EdgeIndex, NodeIndex};

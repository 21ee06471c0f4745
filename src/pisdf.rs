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

//! The PiSDF graph model: hierarchical dataflow graphs of typed vertices
//! connected by edges with symbolic production/consumption rates, optional
//! delays, and parameters resolved per graph instance.

mod edge;
mod graph;
mod param;
mod vertex;

pub use edge::{Delay, Edge};
pub use graph::{Graph, GraphId, Graphs};
pub use param::{Param, ParamKind};
pub use vertex::{RuntimeInfo, Vertex, VertexType};

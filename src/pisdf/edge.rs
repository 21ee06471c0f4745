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

use petgraph::graph::{EdgeIndex, NodeIndex};

use crate::expr::Expression;

/// An edge of a PiSDF graph. Rates are expressions over the parameters of
/// the containing graph and evaluate per firing instance; tokens are bytes.
#[derive(Clone, Debug)]
pub struct Edge {
    src_port: usize,
    snk_port: usize,
    src_rate: Expression,
    snk_rate: Expression,
    /// Slot in the owning graph's delay list.
    delay: Option<usize>,
}

impl Edge {
    pub fn new(src_port: usize, src_rate: Expression, snk_port: usize, snk_rate: Expression) -> Self {
        Self {
            src_port,
            snk_port,
            src_rate,
            snk_rate,
            delay: None,
        }
    }

    pub fn src_port(&self) -> usize {
        self.src_port
    }

    pub fn snk_port(&self) -> usize {
        self.snk_port
    }

    pub fn src_rate(&self) -> &Expression {
        &self.src_rate
    }

    pub fn snk_rate(&self) -> &Expression {
        &self.snk_rate
    }

    pub fn delay(&self) -> Option<usize> {
        self.delay
    }

    pub(crate) fn set_delay(&mut self, delay: usize) {
        self.delay = Some(delay);
    }

    pub(crate) fn rewrite_delay(&mut self, from: usize, to: usize) {
        if self.delay == Some(from) {
            self.delay = Some(to);
        }
    }
}

/// Initial tokens on an edge.
///
/// A persistent delay owns top-level storage surviving graph iterations and
/// carries neither setter nor getter. A local delay may name a setter vertex
/// writing the initial tokens and a getter vertex consuming the final ones;
/// both connect through a virtual `Delay` vertex materialized in the graph.
#[derive(Clone, Debug)]
pub struct Delay {
    edge: EdgeIndex,
    value: i64,
    setter: Option<(NodeIndex, usize)>,
    getter: Option<(NodeIndex, usize)>,
    /// The virtual vertex, present iff a setter or getter is.
    vertex: Option<NodeIndex>,
    persistent: bool,
    /// How many hierarchy levels the storage outlives; `u32::MAX` reaches
    /// the top graph.
    level_count: u32,
}

impl Delay {
    pub(crate) fn new(
        edge: EdgeIndex,
        value: i64,
        setter: Option<(NodeIndex, usize)>,
        getter: Option<(NodeIndex, usize)>,
        vertex: Option<NodeIndex>,
        persistent: bool,
        level_count: u32,
    ) -> Self {
        Self {
            edge,
            value,
            setter,
            getter,
            vertex,
            persistent,
            level_count,
        }
    }

    pub fn edge(&self) -> EdgeIndex {
        self.edge
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn setter(&self) -> Option<(NodeIndex, usize)> {
        self.setter
    }

    pub fn getter(&self) -> Option<(NodeIndex, usize)> {
        self.getter
    }

    pub fn vertex(&self) -> Option<NodeIndex> {
        self.vertex
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    pub(crate) fn rewrite_edge(&mut self, from: EdgeIndex, to: EdgeIndex) {
        if self.edge == from {
            self.edge = to;
        }
    }

    pub(crate) fn rewrite_vertex(&mut self, from: NodeIndex, to: NodeIndex) {
        if let Some((v, _)) = &mut self.setter {
            if *v == from {
                *v = to;
            }
        }
        if let Some((v, _)) = &mut self.getter {
            if *v == from {
                *v = to;
            }
        }
        if self.vertex == Some(from) {
            self.vertex = Some(to);
        }
    }
}

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

use petgraph::graph::EdgeIndex;

use crate::archi::Pe;
use crate::expr::Expression;
use crate::pisdf::{GraphId, Param};
use crate::Error;

/// Vertex subtype. Special subtypes have fixed port shapes checked at
/// construction; `Input`/`Output`/`Graph`/`Delay` never execute as tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexType {
    Normal,
    Config,
    Fork,
    Join,
    Head,
    Tail,
    Duplicate,
    Repeat,
    Init,
    End,
    Delay,
    Input,
    Output,
    Graph,
    ExternIn,
    ExternOut,
}

impl VertexType {
    pub fn is_interface(self) -> bool {
        matches!(self, VertexType::Input | VertexType::Output)
    }

    /// Whether firings of this subtype become schedulable tasks. External
    /// buffers are plain memory mappings, so `ExternIn`/`ExternOut` never
    /// execute either.
    pub fn is_executable(self) -> bool {
        !matches!(
            self,
            VertexType::Input
                | VertexType::Output
                | VertexType::Graph
                | VertexType::Delay
                | VertexType::ExternIn
                | VertexType::ExternOut
        )
    }

    /// (input, output) port-count constraint, `None` meaning unconstrained.
    fn port_shape(self) -> (Option<usize>, Option<usize>) {
        match self {
            VertexType::Fork => (Some(1), None),
            VertexType::Join => (None, Some(1)),
            VertexType::Head | VertexType::Tail => (None, Some(1)),
            VertexType::Duplicate => (Some(1), None),
            VertexType::Repeat => (Some(1), Some(1)),
            VertexType::Init => (Some(0), Some(1)),
            VertexType::End => (Some(1), Some(0)),
            VertexType::Delay => (Some(1), Some(1)),
            VertexType::Input => (Some(0), Some(1)),
            VertexType::Output => (Some(1), Some(0)),
            VertexType::ExternIn => (Some(0), Some(1)),
            VertexType::ExternOut => (Some(1), Some(0)),
            _ => (None, None),
        }
    }
}

/// Mapping constraints and timing model of a vertex.
#[derive(Clone, Debug)]
pub struct RuntimeInfo {
    /// Per-PE (virtual index) mappability; `None` = mappable anywhere.
    mappable: Option<Vec<bool>>,
    /// Timing overrides keyed by hardware type.
    timings: Vec<(u32, Expression)>,
    default_timing: Expression,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            mappable: None,
            timings: Vec::new(),
            default_timing: Expression::constant(100),
        }
    }
}

impl RuntimeInfo {
    pub fn is_mappable(&self, pe: &Pe) -> bool {
        if !pe.enabled() {
            return false;
        }
        match &self.mappable {
            Some(map) => map.get(pe.virt_ix()).copied().unwrap_or(false),
            None => true,
        }
    }

    pub fn set_mappable(&mut self, pe_count: usize, pe: usize, mappable: bool) {
        let map = self
            .mappable
            .get_or_insert_with(|| vec![true; pe_count]);
        if map.len() < pe_count {
            map.resize(pe_count, true);
        }
        map[pe] = mappable;
    }

    pub fn set_timing(&mut self, hw_type: u32, timing: Expression) {
        if let Some(entry) = self.timings.iter_mut().find(|(t, _)| *t == hw_type) {
            entry.1 = timing;
        } else {
            self.timings.push((hw_type, timing));
        }
    }

    pub fn set_default_timing(&mut self, timing: Expression) {
        self.default_timing = timing;
    }

    pub fn timing_on(&self, pe: &Pe, params: &[Param]) -> Result<u64, Error> {
        let expression = self
            .timings
            .iter()
            .find(|(t, _)| *t == pe.hw_type())
            .map(|(_, e)| e)
            .unwrap_or(&self.default_timing);
        Ok(expression.evaluate(params)?.max(0) as u64)
    }
}

/// A vertex of a PiSDF graph. Port arrays are indexed by port and filled as
/// edges are connected; special subtypes are zero-timed data movers handled
/// by the runtime itself rather than user kernels.
#[derive(Clone, Debug)]
pub struct Vertex {
    name: String,
    subtype: VertexType,
    inputs: Vec<Option<EdgeIndex>>,
    outputs: Vec<Option<EdgeIndex>>,
    kernel: Option<usize>,
    /// `Graph` subtype: the graph this vertex expands to and its slot in the
    /// owning graph's subgraph list.
    subgraph: Option<GraphId>,
    sub_ix: Option<usize>,
    /// `Input`/`Output` subtype: slot in the owning graph's interface list.
    if_ix: Option<usize>,
    /// `Delay` subtype: slot in the owning graph's delay list.
    delay_ix: Option<usize>,
    /// `ExternIn`/`ExternOut`: index of the user-registered buffer.
    external_buffer: Option<usize>,
    /// `Config` subtype: parameter slots written by the kernel, in output
    /// order.
    output_params: Vec<usize>,
    rt: RuntimeInfo,
}

impl Vertex {
    pub fn new(
        name: &str,
        subtype: VertexType,
        in_count: usize,
        out_count: usize,
    ) -> Result<Self, Error> {
        let (want_in, want_out) = subtype.port_shape();
        if want_in.map_or(false, |n| n != in_count) {
            return Err(Error::InvalidVertex {
                vertex: name.to_string(),
                detail: "wrong input port count for subtype",
            });
        }
        if want_out.map_or(false, |n| n != out_count) {
            return Err(Error::InvalidVertex {
                vertex: name.to_string(),
                detail: "wrong output port count for subtype",
            });
        }
        Ok(Self {
            name: name.to_string(),
            subtype,
            inputs: vec![None; in_count],
            outputs: vec![None; out_count],
            kernel: None,
            subgraph: None,
            sub_ix: None,
            if_ix: None,
            delay_ix: None,
            external_buffer: None,
            output_params: Vec::new(),
            rt: RuntimeInfo::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subtype(&self) -> VertexType {
        self.subtype
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, port: usize) -> Option<EdgeIndex> {
        self.inputs.get(port).copied().flatten()
    }

    pub fn output(&self, port: usize) -> Option<EdgeIndex> {
        self.outputs.get(port).copied().flatten()
    }

    pub fn inputs(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.inputs.iter().filter_map(|e| *e)
    }

    pub fn outputs(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.outputs.iter().filter_map(|e| *e)
    }

    pub fn kernel(&self) -> Option<usize> {
        self.kernel
    }

    pub fn set_kernel(&mut self, kernel: usize) {
        self.kernel = Some(kernel);
    }

    pub fn subgraph(&self) -> Option<GraphId> {
        self.subgraph
    }

    pub fn sub_ix(&self) -> Option<usize> {
        self.sub_ix
    }

    pub fn if_ix(&self) -> Option<usize> {
        self.if_ix
    }

    pub fn delay_ix(&self) -> Option<usize> {
        self.delay_ix
    }

    pub fn external_buffer(&self) -> Option<usize> {
        self.external_buffer
    }

    pub fn set_external_buffer(&mut self, ix: usize) {
        self.external_buffer = Some(ix);
    }

    pub fn output_params(&self) -> &[usize] {
        &self.output_params
    }

    pub fn set_output_params(&mut self, params: Vec<usize>) {
        self.output_params = params;
    }

    pub fn rt(&self) -> &RuntimeInfo {
        &self.rt
    }

    pub fn rt_mut(&mut self) -> &mut RuntimeInfo {
        &mut self.rt
    }

    pub(crate) fn set_subgraph(&mut self, graph: GraphId, sub_ix: usize) {
        self.subgraph = Some(graph);
        self.sub_ix = Some(sub_ix);
    }

    pub(crate) fn set_if_ix(&mut self, ix: usize) {
        self.if_ix = Some(ix);
    }

    pub(crate) fn set_delay_ix(&mut self, ix: usize) {
        self.delay_ix = Some(ix);
    }

    pub(crate) fn connect_input(&mut self, port: usize, edge: EdgeIndex) -> Result<(), Error> {
        let slot = self.inputs.get_mut(port).ok_or(Error::InvalidPort {
            vertex: self.name.clone(),
            port,
            detail: "input port out of range",
        })?;
        if slot.is_some() {
            return Err(Error::InvalidPort {
                vertex: self.name.clone(),
                port,
                detail: "input port already connected",
            });
        }
        *slot = Some(edge);
        Ok(())
    }

    pub(crate) fn connect_output(&mut self, port: usize, edge: EdgeIndex) -> Result<(), Error> {
        let slot = self.outputs.get_mut(port).ok_or(Error::InvalidPort {
            vertex: self.name.clone(),
            port,
            detail: "output port out of range",
        })?;
        if slot.is_some() {
            return Err(Error::InvalidPort {
                vertex: self.name.clone(),
                port,
                detail: "output port already connected",
            });
        }
        *slot = Some(edge);
        Ok(())
    }

    pub(crate) fn disconnect(&mut self, edge: EdgeIndex) {
        for slot in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if *slot == Some(edge) {
                *slot = None;
            }
        }
    }

    pub(crate) fn rewrite_edge(&mut self, from: EdgeIndex, to: EdgeIndex) {
        for slot in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if *slot == Some(from) {
                *slot = Some(to);
            }
        }
    }
}

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

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::expr::Expression;
use crate::pisdf::{Delay, Edge, Param, ParamKind, Vertex, VertexType};
use crate::Error;

pub type GraphId = usize;

/// One level of a hierarchical PiSDF graph.
///
/// Vertex and edge indices equal their storage slot; removing a vertex moves
/// the last vertex into the freed slot and rewrites every reference to it
/// (petgraph's swap-remove, mirrored into the port arrays, interface lists
/// and delay records kept alongside the topology).
pub struct Graph {
    id: GraphId,
    name: String,
    topo: DiGraph<Vertex, Edge>,
    params: Vec<Param>,
    delays: Vec<Delay>,
    input_interfaces: Vec<NodeIndex>,
    output_interfaces: Vec<NodeIndex>,
    config_vertices: Vec<NodeIndex>,
    subgraphs: Vec<NodeIndex>,
    /// Owning graph and the vertex slot this graph expands, for non-top
    /// graphs.
    parent: Option<(GraphId, NodeIndex)>,
}

impl Graph {
    fn new(id: GraphId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            topo: DiGraph::new(),
            params: Vec::new(),
            delays: Vec::new(),
            input_interfaces: Vec::new(),
            output_interfaces: Vec::new(),
            config_vertices: Vec::new(),
            subgraphs: Vec::new(),
            parent: None,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<(GraphId, NodeIndex)> {
        self.parent
    }

    /// True when any parameter receives or derives its value at runtime.
    pub fn dynamic(&self) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p.kind(), ParamKind::Dynamic | ParamKind::DynamicDependant))
    }

    pub fn add_param(&mut self, param: Param) -> Result<usize, Error> {
        if self.params.iter().any(|p| p.name() == param.name()) {
            return Err(Error::DuplicateParam {
                graph: self.name.clone(),
                name: param.name().to_string(),
            });
        }
        self.params.push(param);
        Ok(self.params.len() - 1)
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param(&self, ix: usize) -> Result<&Param, Error> {
        self.params.get(ix).ok_or(Error::InvalidIndex {
            entity: "parameter",
            index: ix,
        })
    }

    pub fn find_param(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        self.params.iter().position(|p| p.name() == name)
    }

    pub fn add_vertex(
        &mut self,
        name: &str,
        subtype: VertexType,
        in_count: usize,
        out_count: usize,
    ) -> Result<NodeIndex, Error> {
        let vertex = Vertex::new(name, subtype, in_count, out_count)?;
        let ix = self.topo.add_node(vertex);
        match subtype {
            VertexType::Input => {
                self.topo[ix].set_if_ix(self.input_interfaces.len());
                self.input_interfaces.push(ix);
            }
            VertexType::Output => {
                self.topo[ix].set_if_ix(self.output_interfaces.len());
                self.output_interfaces.push(ix);
            }
            VertexType::Config => self.config_vertices.push(ix),
            _ => {}
        }
        Ok(ix)
    }

    pub fn vertex(&self, ix: NodeIndex) -> &Vertex {
        &self.topo[ix]
    }

    pub fn vertex_mut(&mut self, ix: NodeIndex) -> &mut Vertex {
        &mut self.topo[ix]
    }

    pub fn vertex_count(&self) -> usize {
        self.topo.node_count()
    }

    pub fn vertices(&self) -> impl Iterator<Item = NodeIndex> {
        self.topo.node_indices()
    }

    pub fn edge(&self, ix: EdgeIndex) -> &Edge {
        &self.topo[ix]
    }

    pub fn edge_count(&self) -> usize {
        self.topo.edge_count()
    }

    pub fn edges(&self) -> impl Iterator<Item = EdgeIndex> {
        self.topo.edge_indices()
    }

    pub fn source(&self, edge: EdgeIndex) -> NodeIndex {
        self.topo.edge_endpoints(edge).expect("corrupted edge index").0
    }

    pub fn sink(&self, edge: EdgeIndex) -> NodeIndex {
        self.topo.edge_endpoints(edge).expect("corrupted edge index").1
    }

    pub fn connect(
        &mut self,
        src: NodeIndex,
        src_port: usize,
        src_rate: Expression,
        snk: NodeIndex,
        snk_port: usize,
        snk_rate: Expression,
    ) -> Result<EdgeIndex, Error> {
        let edge = Edge::new(src_port, src_rate, snk_port, snk_rate);
        let ix = self.topo.add_edge(src, snk, edge);
        if let Err(e) = self.topo[src].connect_output(src_port, ix) {
            self.topo.remove_edge(ix);
            return Err(e);
        }
        if let Err(e) = self.topo[snk].connect_input(snk_port, ix) {
            self.topo[src].disconnect(ix);
            self.topo.remove_edge(ix);
            return Err(e);
        }
        Ok(ix)
    }

    /// Attach initial tokens to an edge. A setter or getter materializes the
    /// virtual `Delay` vertex and its two edges; persistent delays may have
    /// neither.
    pub fn add_delay(
        &mut self,
        edge: EdgeIndex,
        value: i64,
        setter: Option<(NodeIndex, usize)>,
        getter: Option<(NodeIndex, usize)>,
        persistent: bool,
        level_count: u32,
    ) -> Result<usize, Error> {
        let edge_name = format!(
            "{}--{}",
            self.vertex(self.source(edge)).name(),
            self.vertex(self.sink(edge)).name()
        );
        if persistent && (setter.is_some() || getter.is_some()) {
            return Err(Error::PersistentDelaySetterGetter { edge: edge_name });
        }
        if self.topo[edge].delay().is_some() {
            return Err(Error::InvalidVertex {
                vertex: edge_name,
                detail: "edge already carries a delay",
            });
        }
        let vertex = if setter.is_some() || getter.is_some() {
            let name = format!("delay-{}", edge_name);
            let v = self.add_vertex(&name, VertexType::Delay, 1, 1)?;
            if let Some((setter, port)) = setter {
                self.connect(
                    setter,
                    port,
                    Expression::constant(value),
                    v,
                    0,
                    Expression::constant(value),
                )?;
            }
            if let Some((getter, port)) = getter {
                self.connect(
                    v,
                    0,
                    Expression::constant(value),
                    getter,
                    port,
                    Expression::constant(value),
                )?;
            }
            Some(v)
        } else {
            None
        };
        let ix = self.delays.len();
        self.delays
            .push(Delay::new(edge, value, setter, getter, vertex, persistent, level_count));
        self.topo[edge].set_delay(ix);
        if let Some(v) = vertex {
            self.topo[v].set_delay_ix(ix);
        }
        Ok(ix)
    }

    pub fn delays(&self) -> &[Delay] {
        &self.delays
    }

    pub fn delay(&self, ix: usize) -> &Delay {
        &self.delays[ix]
    }

    pub fn input_interfaces(&self) -> &[NodeIndex] {
        &self.input_interfaces
    }

    pub fn output_interfaces(&self) -> &[NodeIndex] {
        &self.output_interfaces
    }

    pub fn config_vertices(&self) -> &[NodeIndex] {
        &self.config_vertices
    }

    pub fn subgraphs(&self) -> &[NodeIndex] {
        &self.subgraphs
    }

    /// The edge behind an input interface (its single output into the graph).
    pub fn input_interface_edge(&self, slot: usize) -> Option<EdgeIndex> {
        self.input_interfaces
            .get(slot)
            .and_then(|v| self.topo[*v].output(0))
    }

    /// The edge feeding an output interface (its single input).
    pub fn output_interface_edge(&self, slot: usize) -> Option<EdgeIndex> {
        self.output_interfaces
            .get(slot)
            .and_then(|v| self.topo[*v].input(0))
    }

    /// Check port contiguity and the config-actor placement rule before any
    /// analysis runs on the graph.
    pub fn validate(&self) -> Result<(), Error> {
        for v in self.topo.node_indices() {
            let vertex = &self.topo[v];
            for port in 0..vertex.input_count() {
                if vertex.input(port).is_none() {
                    return Err(Error::InvalidPort {
                        vertex: vertex.name().to_string(),
                        port,
                        detail: "input port left unconnected",
                    });
                }
            }
            for port in 0..vertex.output_count() {
                if vertex.output(port).is_none() {
                    return Err(Error::InvalidPort {
                        vertex: vertex.name().to_string(),
                        port,
                        detail: "output port left unconnected",
                    });
                }
            }
        }
        if !self.config_vertices.is_empty() && !self.dynamic() {
            return Err(Error::ConfigInStaticGraph {
                graph: self.name.clone(),
                vertex: self.topo[self.config_vertices[0]].name().to_string(),
            });
        }
        Ok(())
    }

    fn remove_edge_inner(&mut self, edge: EdgeIndex) {
        let (src, snk) = self.topo.edge_endpoints(edge).expect("corrupted edge index");
        self.topo[src].disconnect(edge);
        self.topo[snk].disconnect(edge);
        if let Some(dix) = self.topo[edge].delay() {
            self.remove_delay_record(dix);
        }
        let last = EdgeIndex::new(self.topo.edge_count() - 1);
        self.topo.remove_edge(edge);
        if last != edge {
            // the former last edge now sits in the freed slot
            let nodes: Vec<NodeIndex> = self.topo.node_indices().collect();
            for v in nodes {
                self.topo[v].rewrite_edge(last, edge);
            }
            for delay in &mut self.delays {
                delay.rewrite_edge(last, edge);
            }
        }
    }

    fn remove_delay_record(&mut self, ix: usize) {
        let last = self.delays.len() - 1;
        self.delays.swap_remove(ix);
        if last != ix {
            let edges: Vec<EdgeIndex> = self.topo.edge_indices().collect();
            for e in edges {
                self.topo[e].rewrite_delay(last, ix);
            }
            if let Some(v) = self.delays[ix].vertex() {
                self.topo[v].set_delay_ix(ix);
            }
        }
    }

    /// Remove a vertex and its incident edges. The last vertex moves into
    /// slot `v`; returns `(moved_subgraph, new_index)` when the moved vertex
    /// expands a subgraph, so the arena can rewrite the child's parent slot.
    pub(crate) fn remove_vertex_inner(
        &mut self,
        v: NodeIndex,
    ) -> Result<Option<(GraphId, NodeIndex)>, Error> {
        if v.index() >= self.topo.node_count() {
            return Err(Error::InvalidIndex {
                entity: "vertex",
                index: v.index(),
            });
        }
        loop {
            let next = self
                .topo
                .edges_directed(v, Direction::Outgoing)
                .map(|e| e.id())
                .next()
                .or_else(|| {
                    self.topo
                        .edges_directed(v, Direction::Incoming)
                        .map(|e| e.id())
                        .next()
                });
            match next {
                Some(edge) => self.remove_edge_inner(edge),
                None => break,
            }
        }
        for list in [
            &mut self.input_interfaces,
            &mut self.output_interfaces,
            &mut self.config_vertices,
            &mut self.subgraphs,
        ] {
            list.retain(|n| *n != v);
        }
        let last = NodeIndex::new(self.topo.node_count() - 1);
        self.topo.remove_node(v);
        let mut moved = None;
        if last != v {
            for list in [
                &mut self.input_interfaces,
                &mut self.output_interfaces,
                &mut self.config_vertices,
                &mut self.subgraphs,
            ] {
                for n in list.iter_mut() {
                    if *n == last {
                        *n = v;
                    }
                }
            }
            for delay in &mut self.delays {
                delay.rewrite_vertex(last, v);
            }
            if let Some(child) = self.topo[v].subgraph() {
                moved = Some((child, v));
            }
        }
        // interface and subgraph slots stay positional
        for (slot, n) in self.input_interfaces.clone().iter().enumerate() {
            self.topo[*n].set_if_ix(slot);
        }
        for (slot, n) in self.output_interfaces.clone().iter().enumerate() {
            self.topo[*n].set_if_ix(slot);
        }
        let subs = self.subgraphs.clone();
        for (slot, n) in subs.iter().enumerate() {
            let child = self.topo[*n].subgraph().expect("subgraph list corrupted");
            self.topo[*n].set_subgraph(child, slot);
        }
        Ok(moved)
    }
}

/// Arena of every graph of the application, top graph included. Subgraph
/// relationships are ids, never references.
pub struct Graphs {
    graphs: Vec<Graph>,
}

impl Graphs {
    pub fn new() -> Self {
        Self { graphs: Vec::new() }
    }

    pub fn create(&mut self, name: &str) -> GraphId {
        let id = self.graphs.len();
        self.graphs.push(Graph::new(id, name));
        id
    }

    pub fn graph(&self, id: GraphId) -> &Graph {
        &self.graphs[id]
    }

    pub fn graph_mut(&mut self, id: GraphId) -> &mut Graph {
        &mut self.graphs[id]
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Create the `Graph`-subtype vertex expanding `child` inside `parent`.
    /// Port counts equal the child's interface counts.
    pub fn attach_subgraph(
        &mut self,
        parent: GraphId,
        name: &str,
        child: GraphId,
    ) -> Result<NodeIndex, Error> {
        let (in_count, out_count) = {
            let child = self.graph(child);
            (child.input_interfaces.len(), child.output_interfaces.len())
        };
        let parent_graph = self.graph_mut(parent);
        let v = parent_graph.add_vertex(name, VertexType::Graph, in_count, out_count)?;
        let sub_ix = parent_graph.subgraphs.len();
        parent_graph.subgraphs.push(v);
        parent_graph.topo[v].set_subgraph(child, sub_ix);
        self.graph_mut(child).parent = Some((parent, v));
        Ok(v)
    }

    pub fn remove_vertex(&mut self, graph: GraphId, v: NodeIndex) -> Result<(), Error> {
        if let Some((child, new_ix)) = self.graph_mut(graph).remove_vertex_inner(v)? {
            self.graph_mut(child).parent = Some((graph, new_ix));
        }
        Ok(())
    }
}

impl Default for Graphs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_param_rejected() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        graphs.graph_mut(g).add_param(Param::new_static("N", 4)).unwrap();
        assert!(matches!(
            graphs.graph_mut(g).add_param(Param::new_static("n", 8)),
            Err(Error::DuplicateParam { .. })
        ));
    }

    #[test]
    fn test_port_bookkeeping() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 0).unwrap();
        let e = graph
            .connect(a, 0, Expression::constant(2), b, 0, Expression::constant(2))
            .unwrap();
        assert_eq!(graph.vertex(a).output(0), Some(e));
        assert_eq!(graph.vertex(b).input(0), Some(e));
        // double connection on the same port is a structural error
        assert!(graph
            .connect(a, 0, Expression::constant(1), b, 0, Expression::constant(1))
            .is_err());
    }

    #[test]
    fn test_subtype_port_shape() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        assert!(graph.add_vertex("f", VertexType::Fork, 2, 3).is_err());
        assert!(graph.add_vertex("f", VertexType::Fork, 1, 3).is_ok());
        assert!(graph.add_vertex("j", VertexType::Join, 3, 2).is_err());
        assert!(graph.add_vertex("i", VertexType::Init, 0, 1).is_ok());
    }

    #[test]
    fn test_persistent_delay_setter_rejected() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 1).unwrap();
        let s = graph.add_vertex("s", VertexType::Normal, 0, 1).unwrap();
        let e = graph
            .connect(a, 0, Expression::constant(1), b, 0, Expression::constant(1))
            .unwrap();
        assert!(matches!(
            graph.add_delay(e, 4, Some((s, 0)), None, true, u32::MAX),
            Err(Error::PersistentDelaySetterGetter { .. })
        ));
    }

    #[test]
    fn test_delay_vertex_materialization() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 1).unwrap();
        let s = graph.add_vertex("s", VertexType::Init, 0, 1).unwrap();
        let t = graph.add_vertex("t", VertexType::End, 1, 0).unwrap();
        let e = graph
            .connect(a, 0, Expression::constant(2), b, 0, Expression::constant(2))
            .unwrap();
        let d = graph
            .add_delay(e, 4, Some((s, 0)), Some((t, 0)), false, 0)
            .unwrap();
        let delay = graph.delay(d);
        let v = delay.vertex().expect("setter/getter delay needs its vertex");
        assert_eq!(graph.vertex(v).subtype(), VertexType::Delay);
        assert_eq!(graph.vertex(v).delay_ix(), Some(d));
        assert_eq!(graph.source(graph.vertex(v).input(0).unwrap()), s);
        assert_eq!(graph.sink(graph.vertex(v).output(0).unwrap()), t);
    }

    #[test]
    fn test_vertex_removal_moves_last_into_slot() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 1).unwrap();
        let c = graph.add_vertex("c", VertexType::Normal, 1, 0).unwrap();
        graph
            .connect(a, 0, Expression::constant(1), b, 0, Expression::constant(1))
            .unwrap();
        graph
            .connect(b, 0, Expression::constant(1), c, 0, Expression::constant(1))
            .unwrap();
        graphs.remove_vertex(g, NodeIndex::new(0)).unwrap();
        let graph = graphs.graph(g);
        assert_eq!(graph.vertex_count(), 2);
        // "c" was the last vertex and now occupies slot 0
        assert_eq!(graph.vertex(NodeIndex::new(0)).name(), "c");
        assert_eq!(graph.vertex(NodeIndex::new(1)).name(), "b");
        // the surviving edge still connects b -> c through valid indices
        assert_eq!(graph.edge_count(), 1);
        let e = graph.edges().next().unwrap();
        assert_eq!(graph.vertex(graph.source(e)).name(), "b");
        assert_eq!(graph.vertex(graph.sink(e)).name(), "c");
        assert_eq!(graph.vertex(NodeIndex::new(1)).output(0), Some(e));
    }
}

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

//! Per-instance state of subgraph firings.
//!
//! Every firing of every (sub)graph instance owns a parameter snapshot, the
//! repetition vector computed from it, a per-vertex task-index register and
//! the ids of its child firings. The whole structure lives in one arena and
//! relates by index, mirroring the hierarchical graph at runtime.

use smallvec::SmallVec;

use petgraph::graph::NodeIndex;

use crate::brv;
use crate::pisdf::{GraphId, Graphs, Param, ParamKind};
use crate::Error;

pub type FiringId = usize;

/// Sentinel for unknown repetition counts and unset task registers.
pub const UNRESOLVED: u32 = u32::MAX;

pub struct GraphFiring {
    graph: GraphId,
    parent: Option<FiringId>,
    firing: u32,
    params: SmallVec<[Param; 8]>,
    brv: Vec<u32>,
    /// Schedule-task index of every (vertex, firing), `UNRESOLVED` until the
    /// scheduler emits it.
    task_ix: Vec<Vec<u32>>,
    /// Child firing ids, `children[subgraph_slot][subgraph_firing]`.
    children: Vec<Vec<FiringId>>,
    resolved: bool,
}

impl GraphFiring {
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn parent(&self) -> Option<FiringId> {
        self.parent
    }

    /// Which firing of its subgraph instance this is.
    pub fn firing_value(&self) -> u32 {
        self.firing
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn resolved(&self) -> bool {
        self.resolved
    }

    /// Whether every parameter the BRV depends on is known.
    fn resolvable(&self) -> bool {
        self.params
            .iter()
            .all(|p| p.kind() == ParamKind::DynamicDependant || p.is_set())
    }
}

pub struct FiringTree {
    firings: Vec<GraphFiring>,
    top: GraphId,
}

impl FiringTree {
    /// Build the firing tree of `top` and resolve every firing whose
    /// parameters are statically known.
    pub fn new(graphs: &Graphs, top: GraphId) -> Result<Self, Error> {
        let mut tree = Self {
            firings: Vec::new(),
            top,
        };
        let root_params: SmallVec<[Param; 8]> =
            graphs.graph(top).params().iter().cloned().collect();
        tree.create_firing(graphs, top, None, 0, root_params);
        tree.resolve(graphs, 0)?;
        Ok(tree)
    }

    pub fn root(&self) -> FiringId {
        0
    }

    pub fn len(&self) -> usize {
        self.firings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.firings.is_empty()
    }

    pub fn firing(&self, id: FiringId) -> &GraphFiring {
        &self.firings[id]
    }

    pub fn firing_ids(&self) -> impl Iterator<Item = FiringId> {
        0..self.firings.len()
    }

    /// Repetition count of `vertex` within firing `id`.
    pub fn rv(&self, id: FiringId, vertex: NodeIndex) -> u32 {
        self.firings[id].brv[vertex.index()]
    }

    pub fn child(&self, id: FiringId, sub_slot: usize, firing: u32) -> Option<FiringId> {
        self.firings[id]
            .children
            .get(sub_slot)
            .and_then(|c| c.get(firing as usize))
            .copied()
    }

    pub fn register_task_ix(&mut self, id: FiringId, vertex: NodeIndex, firing: u32, task: u32) {
        debug_assert!(
            (firing as usize) < self.firings[id].task_ix[vertex.index()].len(),
            "firing outside the repetition count"
        );
        self.firings[id].task_ix[vertex.index()][firing as usize] = task;
    }

    pub fn task_ix(&self, id: FiringId, vertex: NodeIndex, firing: u32) -> u32 {
        self.firings[id]
            .task_ix
            .get(vertex.index())
            .and_then(|v| v.get(firing as usize))
            .copied()
            .unwrap_or(UNRESOLVED)
    }

    pub fn set_param(&mut self, id: FiringId, param_ix: usize, value: i64) {
        self.firings[id].params[param_ix].set_value(value);
    }

    pub fn param_value(&self, id: FiringId, param_ix: usize) -> i64 {
        self.firings[id].params[param_ix].value()
    }

    fn create_firing(
        &mut self,
        graphs: &Graphs,
        graph: GraphId,
        parent: Option<FiringId>,
        firing: u32,
        params: SmallVec<[Param; 8]>,
    ) -> FiringId {
        let g = graphs.graph(graph);
        let n = g.vertex_count();
        let mut brv = vec![UNRESOLVED; n];
        let mut task_ix: Vec<Vec<u32>> = vec![Vec::new(); n];
        // config actors fire once per graph firing and are schedulable even
        // before the repetition vector is known
        for v in g.config_vertices() {
            brv[v.index()] = 1;
            task_ix[v.index()] = vec![UNRESOLVED; 1];
        }
        let id = self.firings.len();
        self.firings.push(GraphFiring {
            graph,
            parent,
            firing,
            params,
            brv,
            task_ix,
            children: vec![Vec::new(); g.subgraphs().len()],
            resolved: false,
        });
        id
    }

    /// Copy a parameter for a child firing, materializing inherited values
    /// from the parent snapshot.
    fn snapshot_param(param: &Param, parent_params: &[Param]) -> Param {
        match param.kind() {
            ParamKind::Inherited => {
                let mut copy = param.clone();
                let parent_ix = param.parent().expect("inherited parameter without parent");
                if parent_params[parent_ix].is_set() {
                    copy.set_value(parent_params[parent_ix].value());
                }
                copy
            }
            _ => param.clone(),
        }
    }

    /// Resolve `id` and every descendant whose parameters are known: refresh
    /// dependant parameters, recompute the BRV, reset the task registers and
    /// instantiate child firings.
    pub fn resolve(&mut self, graphs: &Graphs, id: FiringId) -> Result<(), Error> {
        let mut work = vec![id];
        while let Some(f) = work.pop() {
            if self.firings[f].resolved || !self.firings[f].resolvable() {
                continue;
            }
            let graph = graphs.graph(self.firings[f].graph);
            // dependant parameters re-evaluate against the current snapshot
            for ix in 0..self.firings[f].params.len() {
                if self.firings[f].params[ix].kind() == ParamKind::DynamicDependant {
                    let expression = self.firings[f].params[ix]
                        .expression()
                        .expect("dependant parameter without expression")
                        .clone();
                    let value = expression.evaluate(&self.firings[f].params)?;
                    self.firings[f].params[ix].set_value(value);
                }
            }
            let params: Vec<Param> = self.firings[f].params.iter().cloned().collect();
            let brv = brv::compute(graph, &params)?;
            for v in graph.vertices() {
                let rv = brv[v.index()];
                let size = if rv == UNRESOLVED { 0 } else { rv as usize };
                let old = std::mem::take(&mut self.firings[f].task_ix[v.index()]);
                let mut fresh = vec![UNRESOLVED; size];
                // config tasks scheduled before resolution keep their slot
                for (slot, value) in old.into_iter().enumerate().take(size) {
                    fresh[slot] = value;
                }
                self.firings[f].task_ix[v.index()] = fresh;
            }
            self.firings[f].brv = brv;
            for (slot, sub_vertex) in graph.subgraphs().iter().enumerate() {
                let count = self.firings[f].brv[sub_vertex.index()];
                let child_graph = graph
                    .vertex(*sub_vertex)
                    .subgraph()
                    .expect("subgraph list corrupted");
                self.firings[f].children[slot].clear();
                for k in 0..count {
                    let child_params: SmallVec<[Param; 8]> = graphs
                        .graph(child_graph)
                        .params()
                        .iter()
                        .map(|p| Self::snapshot_param(p, &params))
                        .collect();
                    let child = self.create_firing(graphs, child_graph, Some(f), k, child_params);
                    self.firings[f].children[slot].push(child);
                    work.push(child);
                }
            }
            self.firings[f].resolved = true;
            log::trace!(
                "resolved firing {} of graph '{}' ({} vertices)",
                self.firings[f].firing,
                graph.name(),
                graph.vertex_count()
            );
        }
        Ok(())
    }

    /// Drop all per-iteration state and rebuild the tree. Dynamic parameter
    /// values do not survive; persistent delay storage is not owned here and
    /// does.
    pub fn reset(&mut self, graphs: &Graphs) -> Result<(), Error> {
        self.firings.clear();
        let root_params: SmallVec<[Param; 8]> =
            graphs.graph(self.top).params().iter().cloned().collect();
        self.create_firing(graphs, self.top, None, 0, root_params);
        self.resolve(graphs, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;
    use crate::pisdf::VertexType as VT;

    fn rate(v: i64) -> Expression {
        Expression::constant(v)
    }

    /// top: a -(2:1)-> sub[ in -> b ] with sub firing twice.
    fn hierarchical() -> (Graphs, GraphId, GraphId) {
        let mut graphs = Graphs::new();
        let top = graphs.create("top");
        let sub = graphs.create("sub");
        {
            let g = graphs.graph_mut(sub);
            let input = g.add_vertex("in", VT::Input, 0, 1).unwrap();
            let b = g.add_vertex("b", VT::Normal, 1, 0).unwrap();
            g.connect(input, 0, rate(1), b, 0, rate(1)).unwrap();
        }
        let sub_v = graphs.attach_subgraph(top, "sub", sub).unwrap();
        {
            let g = graphs.graph_mut(top);
            let a = g.add_vertex("a", VT::Normal, 0, 1).unwrap();
            g.connect(a, 0, rate(2), sub_v, 0, rate(1)).unwrap();
        }
        (graphs, top, sub)
    }

    #[test]
    fn test_static_tree_resolves_recursively() {
        let (graphs, top, _) = hierarchical();
        let tree = FiringTree::new(&graphs, top).unwrap();
        let root = tree.root();
        assert!(tree.firing(root).resolved());
        // sub fires twice: two child firings exist and are resolved
        let c0 = tree.child(root, 0, 0).unwrap();
        let c1 = tree.child(root, 0, 1).unwrap();
        assert!(tree.firing(c0).resolved());
        assert!(tree.firing(c1).resolved());
        assert_eq!(tree.firing(c1).firing_value(), 1);
    }

    #[test]
    fn test_task_register_roundtrip() {
        let (graphs, top, _) = hierarchical();
        let mut tree = FiringTree::new(&graphs, top).unwrap();
        let root = tree.root();
        let a = graphs
            .graph(top)
            .vertices()
            .find(|v| graphs.graph(top).vertex(*v).name() == "a")
            .unwrap();
        assert_eq!(tree.task_ix(root, a, 0), UNRESOLVED);
        tree.register_task_ix(root, a, 0, 7);
        assert_eq!(tree.task_ix(root, a, 0), 7);
    }

    #[test]
    fn test_dynamic_child_stays_unresolved() {
        let mut graphs = Graphs::new();
        let top = graphs.create("top");
        let sub = graphs.create("sub");
        {
            let g = graphs.graph_mut(sub);
            g.add_param(Param::new_dynamic("p")).unwrap();
            let params = g.params().to_vec();
            let input = g.add_vertex("in", VT::Input, 0, 1).unwrap();
            let b = g.add_vertex("b", VT::Normal, 1, 0).unwrap();
            let p = Expression::new("p", &params).unwrap();
            g.connect(input, 0, rate(4), b, 0, p).unwrap();
        }
        let sub_v = graphs.attach_subgraph(top, "sub", sub).unwrap();
        {
            let g = graphs.graph_mut(top);
            let a = g.add_vertex("a", VT::Normal, 0, 1).unwrap();
            g.connect(a, 0, rate(4), sub_v, 0, rate(4)).unwrap();
        }
        let mut tree = FiringTree::new(&graphs, top).unwrap();
        let root = tree.root();
        let child = tree.child(root, 0, 0).unwrap();
        assert!(!tree.firing(child).resolved());
        // the dynamic parameter arrives, the child resolves
        let p_ix = graphs.graph(sub).find_param("p").unwrap();
        tree.set_param(child, p_ix, 2);
        tree.resolve(&graphs, child).unwrap();
        assert!(tree.firing(child).resolved());
        let b = graphs
            .graph(sub)
            .vertices()
            .find(|v| graphs.graph(sub).vertex(*v).name() == "b")
            .unwrap();
        assert_eq!(tree.rv(child, b), 2);
    }
}

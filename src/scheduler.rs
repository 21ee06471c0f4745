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

//! Task emission and the schedule-plan pipeline.
//!
//! The scheduler walks the firing tree, computes dependencies for every
//! unscheduled vertex firing, rejects those reaching into unresolved
//! subgraphs (they are re-discovered on the next invocation, once dynamic
//! parameters arrived), orders the rest by critical-path level and hands
//! them to the mapper. The resources allocator wires scheduler, mapper and
//! FIFO allocator according to the execution policy.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use petgraph::graph::NodeIndex;

use crate::archi::Platform;
use crate::dependencies::{self, DepKind, DependencyInfo};
use crate::firing::{FiringId, FiringTree, UNRESOLVED};
use crate::pisdf::{Graphs, VertexType};
use crate::Error;

pub mod alloc;
pub mod mapper;
pub mod sched;
pub mod task;

pub use alloc::{Fifo, FifoAllocator, FifoAttribute, StorageInit};
pub use mapper::BestFitMapper;
pub use sched::{Schedule, Stats};
pub use task::{Task, TaskIx, TaskKind, TaskState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Critical-path list scheduling.
    List,
    /// Emit schedulable firings in discovery order.
    Greedy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Dispatch each task as it is mapped; completion stamps are broadcast.
    Jit,
    /// Map everything, compute precise notifications, then dispatch.
    Delayed,
}

struct Candidate {
    firing: FiringId,
    vertex: NodeIndex,
    k: u32,
    level: i64,
    deps: Vec<Vec<DependencyInfo>>,
}

pub struct Scheduler {
    policy: SchedulingPolicy,
    /// How many candidates the last pass left unschedulable.
    last_unschedulable: usize,
}

impl Scheduler {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self {
            policy,
            last_unschedulable: 0,
        }
    }

    pub fn last_unschedulable(&self) -> usize {
        self.last_unschedulable
    }

    /// Emit every currently schedulable vertex firing as a `Pending` task,
    /// in mapping order. Returns the indices of the emitted tasks.
    pub fn schedule(
        &mut self,
        graphs: &Graphs,
        tree: &mut FiringTree,
        platform: &Platform,
        schedule: &mut sched::Schedule,
    ) -> Result<Vec<TaskIx>, Error> {
        let mut candidates = self.collect(graphs, tree)?;

        // candidates whose dependencies reach into unresolved subgraphs are
        // not schedulable, and neither is anything downstream of them in the
        // same handler
        let mut blocked: HashSet<(FiringId, NodeIndex)> = HashSet::new();
        for candidate in &candidates {
            let unresolved = candidate
                .deps
                .iter()
                .any(|port| port.iter().any(|d| d.is_unresolved()));
            if unresolved {
                mark_blocked(graphs, tree, candidate.firing, candidate.vertex, &mut blocked);
            }
        }
        self.last_unschedulable = candidates
            .iter()
            .filter(|c| blocked.contains(&(c.firing, c.vertex)))
            .count();
        candidates.retain(|c| !blocked.contains(&(c.firing, c.vertex)));

        if self.policy == SchedulingPolicy::List {
            let mut levels: HashMap<(FiringId, NodeIndex), i64> = HashMap::new();
            for candidate in &mut candidates {
                candidate.level = compute_level(
                    graphs,
                    tree,
                    platform,
                    candidate.firing,
                    candidate.vertex,
                    &mut levels,
                    &mut HashSet::new(),
                )?;
            }
            candidates = candidates
                .into_iter()
                .sorted_by(|a, b| b.level.cmp(&a.level))
                .collect();
        }

        // emit in order; a candidate whose producers are not registered yet
        // is retried after the others (greedy ordering may discover
        // consumers first)
        let mut emitted = Vec::new();
        let mut remaining = candidates;
        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();
            for candidate in remaining {
                if producers_registered(tree, &candidate, graphs) {
                    let ix = self.emit(graphs, tree, platform, schedule, &candidate)?;
                    emitted.push(ix);
                    progressed = true;
                } else {
                    deferred.push(candidate);
                }
            }
            remaining = deferred;
            if remaining.is_empty() || !progressed {
                break;
            }
        }
        self.last_unschedulable += remaining.len();
        log::debug!(
            "scheduling pass emitted {} tasks, {} not schedulable",
            emitted.len(),
            self.last_unschedulable
        );
        Ok(emitted)
    }

    fn collect(&self, graphs: &Graphs, tree: &FiringTree) -> Result<Vec<Candidate>, Error> {
        let mut candidates = Vec::new();
        for f in tree.firing_ids() {
            let gf = tree.firing(f);
            let graph = graphs.graph(gf.graph());
            if gf.resolved() {
                for v in graph.vertices() {
                    if !graph.vertex(v).subtype().is_executable() {
                        continue;
                    }
                    let rv = tree.rv(f, v);
                    if rv == UNRESOLVED || rv == 0 {
                        continue;
                    }
                    for k in 0..rv {
                        if tree.task_ix(f, v, k) == UNRESOLVED {
                            candidates.push(Candidate {
                                firing: f,
                                vertex: v,
                                k,
                                level: 0,
                                deps: dependencies::vertex_exec_dependencies(
                                    graphs, tree, f, v, k,
                                )?,
                            });
                        }
                    }
                }
            } else {
                // config actors of an unresolved firing run first and feed
                // the parameters the rest of the graph waits on
                for v in graph.config_vertices() {
                    if tree.task_ix(f, *v, 0) == UNRESOLVED {
                        candidates.push(Candidate {
                            firing: f,
                            vertex: *v,
                            k: 0,
                            level: 0,
                            deps: dependencies::vertex_exec_dependencies(graphs, tree, f, *v, 0)?,
                        });
                    }
                }
            }
        }
        Ok(candidates)
    }

    fn emit(
        &self,
        graphs: &Graphs,
        tree: &mut FiringTree,
        platform: &Platform,
        schedule: &mut sched::Schedule,
        candidate: &Candidate,
    ) -> Result<TaskIx, Error> {
        let graph = graphs.graph(tree.firing(candidate.firing).graph());
        let vertex = graph.vertex(candidate.vertex);
        // collapse duplicate producers, summing the bytes they contribute
        let mut dep_bytes: HashMap<TaskIx, u64> = HashMap::new();
        for port in &candidate.deps {
            for dep in port {
                if let DepKind::Vertex { firing, vertex } = dep.kind {
                    let dep_graph = graphs.graph(tree.firing(firing).graph());
                    if dep_graph.vertex(vertex).subtype() == VertexType::ExternIn {
                        continue;
                    }
                    for kk in dep.firing_start..=dep.firing_end {
                        let producer = tree.task_ix(firing, vertex, kk);
                        debug_assert_ne!(producer, UNRESOLVED, "producer emitted after consumer");
                        let start = if kk == dep.firing_start { dep.memory_start } else { 0 };
                        let end = if kk == dep.firing_end {
                            dep.memory_end
                        } else {
                            dep.rate as u32 - 1
                        };
                        *dep_bytes.entry(producer).or_insert(0) += u64::from(end - start + 1);
                    }
                }
            }
        }
        let deps: Vec<(TaskIx, u64)> = dep_bytes
            .into_iter()
            .sorted_by_key(|(task, _)| *task)
            .collect();
        let ix = schedule.next_task_ix();
        let task = Task::vertex(
            ix,
            candidate.firing,
            candidate.vertex,
            candidate.k,
            format!("{}:{}", vertex.name(), candidate.k),
            vertex.kernel(),
            platform.lrt_count(),
            candidate.deps.clone(),
            deps,
        );
        schedule.add_task(task);
        tree.register_task_ix(candidate.firing, candidate.vertex, candidate.k, ix);
        Ok(ix)
    }
}

fn producers_registered(tree: &FiringTree, candidate: &Candidate, graphs: &Graphs) -> bool {
    candidate.deps.iter().flatten().all(|dep| match dep.kind {
        DepKind::Vertex { firing, vertex } => {
            let graph = graphs.graph(tree.firing(firing).graph());
            if graph.vertex(vertex).subtype() == VertexType::ExternIn {
                return true;
            }
            (dep.firing_start..=dep.firing_end)
                .all(|kk| tree.task_ix(firing, vertex, kk) != UNRESOLVED)
        }
        _ => true,
    })
}

/// Propagate non-schedulability to every executable successor inside the
/// same firing handler.
fn mark_blocked(
    graphs: &Graphs,
    tree: &FiringTree,
    firing: FiringId,
    vertex: NodeIndex,
    blocked: &mut HashSet<(FiringId, NodeIndex)>,
) {
    if !blocked.insert((firing, vertex)) {
        return;
    }
    let graph = graphs.graph(tree.firing(firing).graph());
    let mut stack = vec![vertex];
    while let Some(v) = stack.pop() {
        for edge in graph.vertex(v).outputs() {
            let snk = graph.sink(edge);
            if snk == v || !graph.vertex(snk).subtype().is_executable() {
                continue;
            }
            if blocked.insert((firing, snk)) {
                stack.push(snk);
            }
        }
    }
}

/// Critical-path level: `level(v) = max over successors s of level(s) +
/// timing(s)`; leaves are 0 and subgraph boundaries are opaque. Cycles are
/// delay-broken and contribute nothing.
fn compute_level(
    graphs: &Graphs,
    tree: &FiringTree,
    platform: &Platform,
    firing: FiringId,
    vertex: NodeIndex,
    levels: &mut HashMap<(FiringId, NodeIndex), i64>,
    visiting: &mut HashSet<(FiringId, NodeIndex)>,
) -> Result<i64, Error> {
    if let Some(level) = levels.get(&(firing, vertex)) {
        return Ok(*level);
    }
    if !visiting.insert((firing, vertex)) {
        return Ok(0);
    }
    let graph = graphs.graph(tree.firing(firing).graph());
    let params = tree.firing(firing).params();
    let reference_pe = platform
        .pes()
        .iter()
        .find(|pe| pe.enabled() && pe.lrt().is_some());
    let mut level = 0i64;
    for edge in graph.vertex(vertex).outputs() {
        let snk = graph.sink(edge);
        if snk == vertex || !graph.vertex(snk).subtype().is_executable() {
            continue;
        }
        let timing = match reference_pe {
            Some(pe) => graph.vertex(snk).rt().timing_on(pe, params)? as i64,
            None => 0,
        };
        let successor =
            compute_level(graphs, tree, platform, firing, snk, levels, visiting)?;
        level = level.max(successor + timing);
    }
    visiting.remove(&(firing, vertex));
    levels.insert((firing, vertex), level);
    Ok(level)
}

/// Wires scheduler, mapper and FIFO allocator into the schedule-plan
/// pipeline: emit, map (inserting sync tasks), set up notifications, attach
/// FIFOs. Dispatch is the runtime's business.
pub struct ResourcesAllocator {
    scheduler: Scheduler,
    mapper: BestFitMapper,
    allocator: FifoAllocator,
    execution_policy: ExecutionPolicy,
}

impl ResourcesAllocator {
    pub fn new(scheduling: SchedulingPolicy, execution: ExecutionPolicy) -> Self {
        Self {
            scheduler: Scheduler::new(scheduling),
            mapper: BestFitMapper::new(),
            allocator: FifoAllocator::new(),
            execution_policy: execution,
        }
    }

    pub fn allocator(&self) -> &FifoAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut FifoAllocator {
        &mut self.allocator
    }

    pub fn last_unschedulable(&self) -> usize {
        self.scheduler.last_unschedulable()
    }

    /// Reserve persistent delay storage; call once before the first pass.
    pub fn reserve_persistent_delays(
        &mut self,
        graphs: &Graphs,
        platform: &mut Platform,
    ) -> Result<(), Error> {
        self.allocator.allocate_persistent_delays(graphs, platform)
    }

    /// One scheduling pass: every task emitted is mapped and fully allocated
    /// on return, ready for dispatch in schedule order.
    pub fn execute(
        &mut self,
        graphs: &Graphs,
        tree: &mut FiringTree,
        platform: &Platform,
        schedule: &mut Schedule,
    ) -> Result<Vec<TaskIx>, Error> {
        let first_new = schedule.task_count() as TaskIx;
        let emitted = self.scheduler.schedule(graphs, tree, platform, schedule)?;
        for ix in &emitted {
            self.mapper.map(graphs, tree, platform, schedule, *ix)?;
        }
        // mapping appends sync tasks; everything new gets allocated and
        // dispatched together
        let all_new: Vec<TaskIx> = (first_new..schedule.task_count() as TaskIx).collect();
        match self.execution_policy {
            ExecutionPolicy::Jit => {
                for ix in &all_new {
                    schedule.task_mut(*ix).notify_all();
                }
            }
            ExecutionPolicy::Delayed => {
                for ix in &all_new {
                    let deps = schedule.task(*ix).deps().to_vec();
                    let Some(pe) = schedule.task(*ix).mapped_pe() else { continue };
                    let Some(lrt) = platform.pe(pe).lrt() else { continue };
                    for (dep, _) in deps {
                        let dep_lrt = schedule
                            .task(dep)
                            .mapped_pe()
                            .and_then(|p| platform.pe(p).lrt());
                        if let Some(dep_lrt) = dep_lrt {
                            if dep_lrt != lrt {
                                schedule.task_mut(dep).set_notification(lrt, true);
                            }
                        }
                    }
                }
            }
        }
        for ix in &all_new {
            self.allocator.allocate(graphs, tree, schedule, *ix)?;
        }
        Ok(all_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archi::{MemoryUnit, PeKind, Platform};
    use crate::expr::Expression;

    fn platform() -> Platform {
        let mut platform = Platform::new(1);
        let c = platform.create_cluster(MemoryUnit::new(0, 4096));
        platform.create_pe(0, 0, c, "pe0", PeKind::LrtPe).unwrap();
        platform
    }

    fn rate(v: i64) -> Expression {
        Expression::constant(v)
    }

    #[test]
    fn test_critical_path_levels() {
        let _ = env_logger::try_init();
        // a(100) -> b(200); a -> c(100) -> d(100); c -> e(300)
        // level(a) = max(level(b) + 200, level(c) + 100) = 400
        // level(c) = max(level(d) + 100, level(e) + 300) = 300
        let mut graphs = Graphs::new();
        let g = graphs.create("app");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", crate::pisdf::VertexType::Normal, 0, 2).unwrap();
        let b = graph.add_vertex("b", crate::pisdf::VertexType::Normal, 1, 0).unwrap();
        let c = graph.add_vertex("c", crate::pisdf::VertexType::Normal, 1, 2).unwrap();
        let d = graph.add_vertex("d", crate::pisdf::VertexType::Normal, 1, 0).unwrap();
        let e = graph.add_vertex("e", crate::pisdf::VertexType::Normal, 1, 0).unwrap();
        graph.connect(a, 0, rate(1), b, 0, rate(1)).unwrap();
        graph.connect(a, 1, rate(1), c, 0, rate(1)).unwrap();
        graph.connect(c, 0, rate(1), d, 0, rate(1)).unwrap();
        graph.connect(c, 1, rate(1), e, 0, rate(1)).unwrap();
        graph.vertex_mut(b).rt_mut().set_default_timing(rate(200));
        graph.vertex_mut(e).rt_mut().set_default_timing(rate(300));
        let tree = crate::firing::FiringTree::new(&graphs, g).unwrap();
        let platform = platform();

        let mut levels = HashMap::new();
        let root = tree.root();
        let level_of = |v, levels: &mut HashMap<_, _>| {
            compute_level(&graphs, &tree, &platform, root, v, levels, &mut HashSet::new()).unwrap()
        };
        assert_eq!(level_of(a, &mut levels), 400);
        assert_eq!(level_of(c, &mut levels), 300);
        assert_eq!(level_of(b, &mut levels), 0);
        assert_eq!(level_of(d, &mut levels), 0);
        assert_eq!(level_of(e, &mut levels), 0);
    }

    #[test]
    fn test_greedy_policy_emits_everything() {
        let _ = env_logger::try_init();
        let mut graphs = Graphs::new();
        let g = graphs.create("app");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", crate::pisdf::VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", crate::pisdf::VertexType::Normal, 1, 0).unwrap();
        graph.connect(a, 0, rate(1), b, 0, rate(3)).unwrap();
        let mut tree = crate::firing::FiringTree::new(&graphs, g).unwrap();
        let platform = platform();
        let mut schedule = sched::Schedule::new(platform.pe_count());
        let mut scheduler = Scheduler::new(SchedulingPolicy::Greedy);
        let emitted = scheduler
            .schedule(&graphs, &mut tree, &platform, &mut schedule)
            .unwrap();
        assert_eq!(emitted.len(), 4);
        assert_eq!(scheduler.last_unschedulable(), 0);
        // discovery order still respects producer-before-consumer
        assert_eq!(schedule.task(3).name(), "b:0");
    }
}

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

//! FIFO allocation: turns the dependency intervals of each task into `Fifo`
//! descriptors with a virtual address, and reserves storage for delays.
//!
//! Virtual addresses come from a monotonically increasing 64-bit counter;
//! the memory interface of the runtime maps them to buffers and reference
//! counts. Persistent delay storage is reserved once, up front, and keeps
//! its address across graph iterations; other delay storage is allocated on
//! first use every iteration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::archi::Platform;
use crate::dependencies::{self, DepKind, DependencyInfo};
use crate::firing::{FiringId, FiringTree};
use crate::pisdf::{GraphId, Graphs, VertexType};
use crate::scheduler::sched::Schedule;
use crate::scheduler::task::{TaskIx, TaskKind};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FifoAttribute {
    /// Fresh allocation owned by the producing task.
    RwOwn,
    /// Read-only view of an existing allocation.
    RwOnly,
    /// User-provided external buffer; never freed by the runtime.
    RwExt,
    /// Virtual FIFO concatenating the sub-FIFOs that follow it; `offset`
    /// holds the sub-FIFO count.
    RMerge,
    /// Virtual FIFO tiling the single sub-FIFO that follows it up to `size`.
    RRepeat,
    /// Placeholder keeping port indexing dense for zero-size windows.
    Dummy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fifo {
    pub address: u64,
    pub size: u32,
    /// Byte offset into the addressed buffer; sub-FIFO count for `RMerge`.
    pub offset: u32,
    /// Reads the memory interface will see before reclaiming the buffer.
    pub count: u32,
    pub attribute: FifoAttribute,
}

impl Fifo {
    pub fn dummy() -> Self {
        Self {
            address: 0,
            size: 0,
            offset: 0,
            count: 0,
            attribute: FifoAttribute::Dummy,
        }
    }
}

/// How one input port interval maps onto storage, before it becomes a Fifo.
#[derive(Clone, Copy, Debug)]
enum AllocationRule {
    /// Reuse a producer task's output allocation.
    SameIn { task: TaskIx, port: u32, offset: u32, size: u32 },
    /// Read delay storage.
    DelayStorage { address: u64, offset: u32, size: u32 },
    /// Read an external buffer.
    External { buffer: usize, offset: u32, size: u32 },
}

fn rule_size(rule: &AllocationRule) -> u32 {
    match rule {
        AllocationRule::SameIn { size, .. }
        | AllocationRule::DelayStorage { size, .. }
        | AllocationRule::External { size, .. } => *size,
    }
}

/// A storage region the runtime must install in the memory interface.
#[derive(Clone, Copy, Debug)]
pub struct StorageInit {
    pub address: u64,
    pub size: u64,
    pub persistent: bool,
}

pub struct FifoAllocator {
    next_address: u64,
    persistent: HashMap<(GraphId, usize), u64>,
    iteration_storage: HashMap<(FiringId, usize), u64>,
    pending_storage: Vec<StorageInit>,
    reserved: u64,
}

impl FifoAllocator {
    pub fn new() -> Self {
        Self {
            next_address: 0,
            persistent: HashMap::new(),
            iteration_storage: HashMap::new(),
            pending_storage: Vec::new(),
            reserved: 0,
        }
    }

    fn fresh_address(&mut self) -> u64 {
        let address = self.next_address;
        self.next_address += 1;
        address
    }

    /// Total bytes of persistent reservations.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Address of a persistent delay's storage, once reserved.
    pub fn persistent_address(&self, graph: GraphId, delay: usize) -> Option<u64> {
        self.persistent.get(&(graph, delay)).copied()
    }

    /// Storage regions allocated since the last drain, for the runtime to
    /// install before dispatching.
    pub fn drain_storage(&mut self) -> Vec<StorageInit> {
        std::mem::take(&mut self.pending_storage)
    }

    /// Forget per-iteration storage; persistent addresses survive.
    pub fn next_iteration(&mut self) {
        self.iteration_storage.clear();
    }

    /// Walk every persistent delay and reserve a non-reclaimable region of
    /// `delay.value()` bytes backed by the first cluster's memory unit.
    pub fn allocate_persistent_delays(
        &mut self,
        graphs: &Graphs,
        platform: &mut Platform,
    ) -> Result<(), Error> {
        for graph_id in 0..graphs.len() {
            let graph = graphs.graph(graph_id);
            for (ix, delay) in graph.delays().iter().enumerate() {
                if !delay.persistent() || self.persistent.contains_key(&(graph_id, ix)) {
                    continue;
                }
                let size = delay.value() as u64;
                // capacity accounting happens on the physical unit, the
                // virtual address is runtime-wide
                let cluster = platform
                    .clusters()
                    .first()
                    .map(|c| c.ix())
                    .ok_or(Error::NoPlatform)?;
                let _physical = {
                    let unit = platform.cluster_mut(cluster).memory_mut();
                    unit.reserve(size)?
                };
                let address = self.fresh_address();
                self.persistent.insert((graph_id, ix), address);
                self.pending_storage.push(StorageInit {
                    address,
                    size,
                    persistent: true,
                });
                self.reserved += size;
                log::debug!(
                    "reserved {} bytes at virtual address {} for persistent delay on '{}'",
                    size,
                    address,
                    graph.name()
                );
            }
        }
        Ok(())
    }

    fn storage_address(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        delay_ix: usize,
    ) -> u64 {
        let graph_id = tree.firing(firing).graph();
        let delay = &graphs.graph(graph_id).delays()[delay_ix];
        if delay.persistent() {
            *self
                .persistent
                .get(&(graph_id, delay_ix))
                .expect("persistent delay storage reserved before scheduling")
        } else {
            match self.iteration_storage.get(&(firing, delay_ix)) {
                Some(address) => *address,
                None => {
                    let address = self.fresh_address();
                    self.iteration_storage.insert((firing, delay_ix), address);
                    self.pending_storage.push(StorageInit {
                        address,
                        size: delay.value() as u64,
                        persistent: false,
                    });
                    address
                }
            }
        }
    }

    /// Allocate the input and output FIFOs of one task. Producer tasks must
    /// already be allocated (the schedule emits tasks in dependency order).
    pub fn allocate(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        schedule: &mut Schedule,
        task_ix: TaskIx,
    ) -> Result<(), Error> {
        let (firing, vertex, k) = match schedule.task(task_ix).kind() {
            TaskKind::Vertex { firing, vertex, k } => (*firing, *vertex, *k),
            // sync tasks move one opaque payload
            TaskKind::Send { .. } | TaskKind::Receive { .. } => {
                return self.allocate_sync(schedule, task_ix)
            }
        };
        let mut inputs = self.allocate_inputs(graphs, tree, schedule, task_ix)?;
        let graph = graphs.graph(tree.firing(firing).graph());
        let subtype = graph.vertex(vertex).subtype();
        let outputs = match subtype {
            VertexType::Fork => self.alias_fork(graphs, tree, firing, vertex, k, &inputs)?,
            VertexType::Duplicate => self.alias_duplicate(graphs, tree, firing, vertex, k, &inputs)?,
            VertexType::Repeat => {
                self.allocate_repeat(graphs, tree, firing, vertex, k, &mut inputs)?
            }
            _ => self.allocate_default_outputs(graphs, tree, firing, vertex, k)?,
        };
        // a mover aliasing its merged input onward keeps the merge image
        // alive for every downstream reader
        for fifo in &mut inputs {
            if fifo.attribute != FifoAttribute::RMerge {
                continue;
            }
            let aliased: u32 = outputs
                .iter()
                .filter(|o| o.attribute == FifoAttribute::RwOnly && o.address == fifo.address)
                .map(|o| o.count)
                .sum();
            if aliased > 0 {
                fifo.count = aliased;
            }
        }
        let task = schedule.task_mut(task_ix);
        task.set_inputs(inputs);
        task.set_outputs(outputs);
        Ok(())
    }

    fn allocate_sync(&mut self, schedule: &mut Schedule, task_ix: TaskIx) -> Result<(), Error> {
        let bytes = schedule.task(task_ix).comm_bytes() as u32;
        let (dep, _) = schedule.task(task_ix).deps()[0];
        let input = match schedule.task(task_ix).kind() {
            TaskKind::Send { .. } => {
                // forwards the producer's first output allocation
                schedule
                    .task(dep)
                    .outputs()
                    .first()
                    .copied()
                    .map(|mut fifo| {
                        fifo.count = 1;
                        fifo
                    })
                    .unwrap_or_else(Fifo::dummy)
            }
            TaskKind::Receive { .. } => schedule
                .task(dep)
                .outputs()
                .first()
                .copied()
                .map(|mut fifo| {
                    fifo.attribute = FifoAttribute::RwOnly;
                    fifo.count = 1;
                    fifo
                })
                .unwrap_or_else(Fifo::dummy),
            TaskKind::Vertex { .. } => unreachable!("sync allocation on a vertex task"),
        };
        let output = Fifo {
            address: self.fresh_address(),
            size: bytes,
            offset: 0,
            count: 1,
            attribute: FifoAttribute::RwOwn,
        };
        let task = schedule.task_mut(task_ix);
        task.set_inputs(vec![input]);
        task.set_outputs(vec![output]);
        Ok(())
    }

    fn allocate_inputs(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        schedule: &Schedule,
        task_ix: TaskIx,
    ) -> Result<Vec<Fifo>, Error> {
        let task = schedule.task(task_ix);
        let mut fifos = Vec::new();
        for port_deps in task.input_deps().to_vec() {
            if port_deps.is_empty() {
                fifos.push(Fifo::dummy());
                continue;
            }
            let mut rules = Vec::new();
            for dep in &port_deps {
                self.push_rules(graphs, tree, schedule, dep, &mut rules)?;
            }
            if rules.len() == 1 {
                fifos.push(self.rule_to_fifo(schedule, rules[0], 1));
            } else {
                // several intervals concatenate through a virtual merge fifo
                let total: u32 = rules.iter().map(rule_size).sum();
                fifos.push(Fifo {
                    address: self.fresh_address(),
                    size: total,
                    offset: rules.len() as u32,
                    count: 1,
                    attribute: FifoAttribute::RMerge,
                });
                for rule in rules {
                    let fifo = self.rule_to_fifo(schedule, rule, 1);
                    fifos.push(fifo);
                }
            }
        }
        Ok(fifos)
    }

    /// Expand one dependency interval into per-producer-firing rules.
    fn push_rules(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        schedule: &Schedule,
        dep: &DependencyInfo,
        rules: &mut Vec<AllocationRule>,
    ) -> Result<(), Error> {
        match dep.kind {
            // the scheduler never hands unresolved tasks to the allocator
            DepKind::Unresolved => panic!("unresolved dependency reached the allocator"),
            DepKind::Delay { firing, delay } => {
                let address = self.storage_address(graphs, tree, firing, delay);
                rules.push(AllocationRule::DelayStorage {
                    address,
                    offset: dep.memory_start,
                    size: dep.memory_end - dep.memory_start + 1,
                });
                Ok(())
            }
            DepKind::Vertex { firing, vertex } => {
                let graph = graphs.graph(tree.firing(firing).graph());
                for k in dep.firing_start..=dep.firing_end {
                    let start = if k == dep.firing_start { dep.memory_start } else { 0 };
                    let end = if k == dep.firing_end {
                        dep.memory_end
                    } else {
                        dep.rate as u32 - 1
                    };
                    if graph.vertex(vertex).subtype() == VertexType::ExternIn {
                        let buffer = graph.vertex(vertex).external_buffer().ok_or(
                            Error::ExternalBufferOutOfRange { index: usize::MAX },
                        )?;
                        rules.push(AllocationRule::External {
                            buffer,
                            offset: k * dep.rate as u32 + start,
                            size: end - start + 1,
                        });
                        continue;
                    }
                    let producer = tree.task_ix(firing, vertex, k);
                    if producer == u32::MAX {
                        return Err(Error::InvalidIndex {
                            entity: "unscheduled producer task",
                            index: vertex.index(),
                        });
                    }
                    let producer_fifo =
                        schedule.task(producer).outputs().get(dep.port as usize).copied();
                    let base_offset = producer_fifo.map(|f| f.offset).unwrap_or(0);
                    rules.push(AllocationRule::SameIn {
                        task: producer,
                        port: dep.port,
                        offset: base_offset + start,
                        size: end - start + 1,
                    });
                }
                Ok(())
            }
        }
    }

    fn rule_to_fifo(&self, schedule: &Schedule, rule: AllocationRule, count: u32) -> Fifo {
        match rule {
            AllocationRule::SameIn { task, port, offset, size } => {
                let producer = schedule.task(task).outputs()[port as usize];
                Fifo {
                    address: producer.address,
                    size,
                    offset,
                    count,
                    attribute: FifoAttribute::RwOwn,
                }
            }
            AllocationRule::DelayStorage { address, offset, size } => Fifo {
                address,
                size,
                offset,
                count,
                attribute: FifoAttribute::RwOwn,
            },
            AllocationRule::External { buffer, offset, size } => Fifo {
                address: buffer as u64,
                size,
                offset,
                count: 0,
                attribute: FifoAttribute::RwExt,
            },
        }
    }

    /// Reader count of one output window: scheduled consumer firings plus
    /// one carry read per delay-storage interval. Unknown (unresolved)
    /// consumers pin the buffer for the whole iteration.
    fn reader_count(
        &self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        vertex: petgraph::graph::NodeIndex,
        port: usize,
        k: u32,
    ) -> Result<u32, Error> {
        let graph = graphs.graph(tree.firing(firing).graph());
        let edge = graph.vertex(vertex).output(port).ok_or(Error::InvalidPort {
            vertex: graph.vertex(vertex).name().to_string(),
            port,
            detail: "output port left unconnected",
        })?;
        let params = tree.firing(firing).params();
        let src_rate = graph.edge(edge).src_rate().evaluate(params)?;
        if src_rate == 0 {
            return Ok(0);
        }
        let lower = src_rate * i64::from(k);
        let upper = src_rate * (i64::from(k) + 1) - 1;
        let deps = dependencies::cons_dependencies(graphs, tree, firing, edge, lower, upper)?;
        let mut count = 0u32;
        for dep in &deps {
            match dep.kind {
                DepKind::Unresolved => return Ok(u32::MAX),
                DepKind::Delay { .. } => count += 1,
                DepKind::Vertex { firing: cf, vertex: cv } => {
                    // a consumer that aliases the buffer (fork, duplicate,
                    // matching-rate repeat) passes it on to its own readers
                    for kk in dep.firing_start..=dep.firing_end {
                        count = count.saturating_add(self.consumer_reads(graphs, tree, cf, cv, kk)?);
                    }
                }
            }
        }
        Ok(count)
    }

    /// How many reads one consumer firing performs on the buffer: one of its
    /// own, plus its downstream readers when it aliases the buffer onward.
    fn consumer_reads(
        &self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        vertex: petgraph::graph::NodeIndex,
        k: u32,
    ) -> Result<u32, Error> {
        let graph = graphs.graph(tree.firing(firing).graph());
        let subtype = graph.vertex(vertex).subtype();
        let aliases = match subtype {
            VertexType::Fork | VertexType::Duplicate => true,
            VertexType::Repeat => {
                let params = tree.firing(firing).params();
                let in_edge = graph.vertex(vertex).input(0);
                let out_edge = graph.vertex(vertex).output(0);
                match (in_edge, out_edge) {
                    (Some(i), Some(o)) => {
                        graph.edge(i).snk_rate().evaluate(params)?
                            == graph.edge(o).src_rate().evaluate(params)?
                    }
                    _ => false,
                }
            }
            _ => false,
        };
        if !aliases {
            return Ok(1);
        }
        // an aliasing mover whose input merges several intervals aliases the
        // merge buffer instead; the source then only sees the merge's read
        let input_deps = dependencies::vertex_exec_dependencies(graphs, tree, firing, vertex, k)?;
        let intervals: u32 = input_deps
            .first()
            .map(|port| {
                port.iter()
                    .map(|d| if d.is_unresolved() { 1 } else { d.firing_count().max(1) })
                    .sum()
            })
            .unwrap_or(0);
        if intervals > 1 {
            return Ok(1);
        }
        let mut reads = 1u32;
        for port in 0..graph.vertex(vertex).output_count() {
            reads = reads.saturating_add(self.reader_count(graphs, tree, firing, vertex, port, k)?);
        }
        Ok(reads)
    }

    fn allocate_default_outputs(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        vertex: petgraph::graph::NodeIndex,
        k: u32,
    ) -> Result<Vec<Fifo>, Error> {
        let graph = graphs.graph(tree.firing(firing).graph());
        let params = tree.firing(firing).params();
        let mut fifos = Vec::new();
        for port in 0..graph.vertex(vertex).output_count() {
            let edge = graph.vertex(vertex).output(port).ok_or(Error::InvalidPort {
                vertex: graph.vertex(vertex).name().to_string(),
                port,
                detail: "output port left unconnected",
            })?;
            let src_rate = graph.edge(edge).src_rate().evaluate(params)?;
            if src_rate == 0 {
                fifos.push(Fifo::dummy());
                continue;
            }
            let snk = graph.sink(edge);
            if graph.vertex(snk).subtype() == VertexType::ExternOut {
                let buffer = graph
                    .vertex(snk)
                    .external_buffer()
                    .ok_or(Error::ExternalBufferOutOfRange { index: usize::MAX })?;
                fifos.push(Fifo {
                    address: buffer as u64,
                    size: src_rate as u32,
                    offset: k * src_rate as u32,
                    count: 0,
                    attribute: FifoAttribute::RwExt,
                });
                continue;
            }
            let count = self.reader_count(graphs, tree, firing, vertex, port, k)?;
            fifos.push(Fifo {
                address: self.fresh_address(),
                size: src_rate as u32,
                offset: 0,
                count,
                attribute: FifoAttribute::RwOwn,
            });
        }
        Ok(fifos)
    }

    /// Fork outputs are offset views of the single input allocation.
    fn alias_fork(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        vertex: petgraph::graph::NodeIndex,
        k: u32,
        inputs: &[Fifo],
    ) -> Result<Vec<Fifo>, Error> {
        let graph = graphs.graph(tree.firing(firing).graph());
        let params = tree.firing(firing).params();
        let base = inputs.first().copied().unwrap_or_else(Fifo::dummy);
        // a merge fifo's offset is its sub-count, not a byte position
        let mut offset = if base.attribute == FifoAttribute::RMerge {
            0
        } else {
            base.offset
        };
        let mut fifos = Vec::new();
        for port in 0..graph.vertex(vertex).output_count() {
            let edge = graph.vertex(vertex).output(port).ok_or(Error::InvalidPort {
                vertex: graph.vertex(vertex).name().to_string(),
                port,
                detail: "output port left unconnected",
            })?;
            let src_rate = graph.edge(edge).src_rate().evaluate(params)? as u32;
            let count = self.reader_count(graphs, tree, firing, vertex, port, k)?;
            fifos.push(Fifo {
                address: base.address,
                size: src_rate,
                offset,
                count,
                attribute: FifoAttribute::RwOnly,
            });
            offset += src_rate;
        }
        Ok(fifos)
    }

    /// Duplicate outputs all alias the whole input allocation.
    fn alias_duplicate(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        vertex: petgraph::graph::NodeIndex,
        k: u32,
        inputs: &[Fifo],
    ) -> Result<Vec<Fifo>, Error> {
        let graph = graphs.graph(tree.firing(firing).graph());
        let base = inputs.first().copied().unwrap_or_else(Fifo::dummy);
        let base_offset = if base.attribute == FifoAttribute::RMerge {
            0
        } else {
            base.offset
        };
        let mut fifos = Vec::new();
        for port in 0..graph.vertex(vertex).output_count() {
            let count = self.reader_count(graphs, tree, firing, vertex, port, k)?;
            fifos.push(Fifo {
                address: base.address,
                size: base.size,
                offset: base_offset,
                count,
                attribute: FifoAttribute::RwOnly,
            });
        }
        Ok(fifos)
    }

    /// Repeat aliases its input when the rates match; otherwise a repeat
    /// fifo tiles the input up to the output size at read time.
    fn allocate_repeat(
        &mut self,
        graphs: &Graphs,
        tree: &FiringTree,
        firing: FiringId,
        vertex: petgraph::graph::NodeIndex,
        k: u32,
        inputs: &mut Vec<Fifo>,
    ) -> Result<Vec<Fifo>, Error> {
        let graph = graphs.graph(tree.firing(firing).graph());
        let params = tree.firing(firing).params();
        let in_edge = graph.vertex(vertex).input(0).ok_or(Error::InvalidPort {
            vertex: graph.vertex(vertex).name().to_string(),
            port: 0,
            detail: "input port left unconnected",
        })?;
        let out_edge = graph.vertex(vertex).output(0).ok_or(Error::InvalidPort {
            vertex: graph.vertex(vertex).name().to_string(),
            port: 0,
            detail: "output port left unconnected",
        })?;
        let in_rate = graph.edge(in_edge).snk_rate().evaluate(params)? as u32;
        let out_rate = graph.edge(out_edge).src_rate().evaluate(params)? as u32;
        let count = self.reader_count(graphs, tree, firing, vertex, 0, k)?;
        if in_rate == out_rate {
            let base = inputs.first().copied().unwrap_or_else(Fifo::dummy);
            let base_offset = if base.attribute == FifoAttribute::RMerge {
                0
            } else {
                base.offset
            };
            return Ok(vec![Fifo {
                address: base.address,
                size: base.size,
                offset: base_offset,
                count,
                attribute: FifoAttribute::RwOnly,
            }]);
        }
        let address = self.fresh_address();
        let mut wrapped = vec![Fifo {
            address,
            size: out_rate,
            offset: 0,
            count: count.max(1),
            attribute: FifoAttribute::RRepeat,
        }];
        wrapped.append(inputs);
        *inputs = wrapped;
        Ok(vec![Fifo {
            address,
            size: out_rate,
            offset: 0,
            count,
            attribute: FifoAttribute::RwOnly,
        }])
    }
}

impl Default for FifoAllocator {
    fn default() -> Self {
        Self::new()
    }
}

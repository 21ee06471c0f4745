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

//! The user-facing session: graph construction, platform description,
//! runtime configuration and the iteration driver.
//!
//! A session owns the single application graph and the single platform;
//! every constructor is a method here so no process-wide state exists.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use petgraph::graph::{EdgeIndex, NodeIndex};

use crate::archi::{ClusterCostRoutine, ClusterId, MemoryCostRoutine, MemoryUnit, PeId, PeKind, Platform};
use crate::dependencies::{self, DepKind};
use crate::expr::Expression;
use crate::firing::FiringTree;
use crate::gantt;
use crate::pisdf::{GraphId, Graphs, Param, VertexType};
use crate::runtime::{
    ExternalBuffers, GrtMessage, Kernel, ParameterMessage, RuntimePlatform, TraceMessage,
};
use crate::scheduler::{
    ExecutionPolicy, ResourcesAllocator, Schedule, SchedulingPolicy, TaskKind, TaskState,
};
use crate::Error;

/// The only graph name the runtime reserves for itself.
const RESERVED_GRAPH_NAME: &str = "app-graph";

const RUNTIME_TIMEOUT: Duration = Duration::from_secs(10);

/// An edge rate: a plain value or a symbolic expression over the containing
/// graph's parameters.
#[derive(Clone, Debug)]
pub enum Rate {
    Value(i64),
    Expression(String),
}

impl From<i64> for Rate {
    fn from(value: i64) -> Self {
        Rate::Value(value)
    }
}

impl From<&str> for Rate {
    fn from(text: &str) -> Self {
        Rate::Expression(text.to_string())
    }
}

impl Rate {
    fn resolve(self, params: &[Param]) -> Result<Expression, Error> {
        match self {
            Rate::Value(value) => Ok(Expression::constant(value)),
            Rate::Expression(text) => Expression::new(&text, params),
        }
    }
}

/// Runtime configuration toggles and policy selectors.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    pub verbose: bool,
    pub export_trace: bool,
    pub static_schedule_optim: bool,
    /// Accepted for API parity; the symbolic path is the only analysis
    /// front, so this has no effect.
    pub srdag_optims: bool,
    pub scheduling: SchedulingPolicy,
    pub execution: ExecutionPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            export_trace: false,
            static_schedule_optim: true,
            srdag_optims: false,
            scheduling: SchedulingPolicy::List,
            execution: ExecutionPolicy::Delayed,
        }
    }
}

struct RunState {
    tree: FiringTree,
    schedule: Schedule,
    resources: ResourcesAllocator,
    runtime: RuntimePlatform,
    trace: Vec<TraceMessage>,
    /// Every storage region installed this iteration, for static replay.
    storages: Vec<crate::scheduler::StorageInit>,
    iteration: u64,
}

/// A Spider session.
pub struct Spider {
    graphs: Graphs,
    top: Option<GraphId>,
    platform: Option<Platform>,
    config: RuntimeConfig,
    kernels: Vec<Kernel>,
    external: Vec<Vec<u8>>,
    state: Option<RunState>,
}

impl Spider {
    pub fn new() -> Self {
        Self {
            graphs: Graphs::new(),
            top: None,
            platform: None,
            config: RuntimeConfig::default(),
            kernels: Vec::new(),
            external: Vec::new(),
            state: None,
        }
    }

    /* === Graph construction === */

    /// Create the application graph. Only one per session.
    pub fn create_graph(&mut self, name: &str) -> Result<GraphId, Error> {
        if name == RESERVED_GRAPH_NAME {
            return Err(Error::ReservedName(name.to_string()));
        }
        if self.top.is_some() {
            return Err(Error::ApplicationAlreadyExists);
        }
        let id = self.graphs.create(name);
        self.top = Some(id);
        Ok(id)
    }

    /// Create a subgraph and the vertex expanding it inside `parent`. The
    /// interface counts fix the port counts of that vertex.
    pub fn create_subgraph(
        &mut self,
        parent: GraphId,
        name: &str,
        in_if_count: usize,
        out_if_count: usize,
    ) -> Result<(GraphId, NodeIndex), Error> {
        if name == RESERVED_GRAPH_NAME {
            return Err(Error::ReservedName(name.to_string()));
        }
        let id = self.graphs.create(name);
        {
            let graph = self.graphs.graph_mut(id);
            for i in 0..in_if_count {
                graph.add_vertex(&format!("in_{}", i), VertexType::Input, 0, 1)?;
            }
            for i in 0..out_if_count {
                graph.add_vertex(&format!("out_{}", i), VertexType::Output, 1, 0)?;
            }
        }
        let vertex = self.graphs.attach_subgraph(parent, name, id)?;
        Ok((id, vertex))
    }

    pub fn create_vertex(
        &mut self,
        graph: GraphId,
        name: &str,
        in_count: usize,
        out_count: usize,
    ) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Normal, in_count, out_count)
    }

    pub fn create_fork(&mut self, graph: GraphId, name: &str, out_count: usize) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Fork, 1, out_count)
    }

    pub fn create_join(&mut self, graph: GraphId, name: &str, in_count: usize) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Join, in_count, 1)
    }

    pub fn create_head(&mut self, graph: GraphId, name: &str, in_count: usize) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Head, in_count, 1)
    }

    pub fn create_tail(&mut self, graph: GraphId, name: &str, in_count: usize) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Tail, in_count, 1)
    }

    pub fn create_duplicate(
        &mut self,
        graph: GraphId,
        name: &str,
        out_count: usize,
    ) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Duplicate, 1, out_count)
    }

    pub fn create_repeat(&mut self, graph: GraphId, name: &str) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Repeat, 1, 1)
    }

    pub fn create_init(&mut self, graph: GraphId, name: &str) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::Init, 0, 1)
    }

    pub fn create_end(&mut self, graph: GraphId, name: &str) -> Result<NodeIndex, Error> {
        self.graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::End, 1, 0)
    }

    /// Config actors require the graph to declare dynamic parameters first.
    pub fn create_config_actor(
        &mut self,
        graph: GraphId,
        name: &str,
        in_count: usize,
        out_count: usize,
    ) -> Result<NodeIndex, Error> {
        let g = self.graphs.graph_mut(graph);
        if !g.dynamic() {
            return Err(Error::ConfigInStaticGraph {
                graph: g.name().to_string(),
                vertex: name.to_string(),
            });
        }
        g.add_vertex(name, VertexType::Config, in_count, out_count)
    }

    pub fn create_extern_in(
        &mut self,
        graph: GraphId,
        name: &str,
        buffer: usize,
    ) -> Result<NodeIndex, Error> {
        if buffer >= self.external.len() {
            return Err(Error::ExternalBufferOutOfRange { index: buffer });
        }
        let v = self
            .graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::ExternIn, 0, 1)?;
        self.graphs.graph_mut(graph).vertex_mut(v).set_external_buffer(buffer);
        Ok(v)
    }

    pub fn create_extern_out(
        &mut self,
        graph: GraphId,
        name: &str,
        buffer: usize,
    ) -> Result<NodeIndex, Error> {
        if buffer >= self.external.len() {
            return Err(Error::ExternalBufferOutOfRange { index: buffer });
        }
        let v = self
            .graphs
            .graph_mut(graph)
            .add_vertex(name, VertexType::ExternOut, 1, 0)?;
        self.graphs.graph_mut(graph).vertex_mut(v).set_external_buffer(buffer);
        Ok(v)
    }

    /* === Parameters === */

    pub fn create_static_param(&mut self, graph: GraphId, name: &str, value: i64) -> Result<usize, Error> {
        self.graphs.graph_mut(graph).add_param(Param::new_static(name, value))
    }

    pub fn create_dynamic_param(&mut self, graph: GraphId, name: &str) -> Result<usize, Error> {
        self.graphs.graph_mut(graph).add_param(Param::new_dynamic(name))
    }

    /// A parameter derived from other parameters of the same graph.
    pub fn create_derived_param(
        &mut self,
        graph: GraphId,
        name: &str,
        expression: &str,
    ) -> Result<usize, Error> {
        let expression = Expression::new(expression, self.graphs.graph(graph).params())?;
        self.graphs
            .graph_mut(graph)
            .add_param(Param::new_dynamic_dependant(name, expression))
    }

    pub fn create_inherited_param(
        &mut self,
        graph: GraphId,
        name: &str,
        parent_param: usize,
    ) -> Result<usize, Error> {
        let (parent_graph, _) = self
            .graphs
            .graph(graph)
            .parent()
            .ok_or(Error::InvalidIndex { entity: "parent graph", index: graph })?;
        self.graphs.graph(parent_graph).param(parent_param)?;
        self.graphs
            .graph_mut(graph)
            .add_param(Param::new_inherited(name, parent_param))
    }

    /* === Edges and delays === */

    pub fn create_edge(
        &mut self,
        graph: GraphId,
        src: NodeIndex,
        src_port: usize,
        src_rate: impl Into<Rate>,
        snk: NodeIndex,
        snk_port: usize,
        snk_rate: impl Into<Rate>,
    ) -> Result<EdgeIndex, Error> {
        let g = self.graphs.graph_mut(graph);
        let src_rate = src_rate.into().resolve(g.params())?;
        let snk_rate = snk_rate.into().resolve(g.params())?;
        g.connect(src, src_port, src_rate, snk, snk_port, snk_rate)
    }

    pub fn create_persistent_delay(
        &mut self,
        graph: GraphId,
        edge: EdgeIndex,
        value: impl Into<Rate>,
    ) -> Result<usize, Error> {
        let value = self.static_delay_value(graph, value)?;
        self.graphs
            .graph_mut(graph)
            .add_delay(edge, value, None, None, true, u32::MAX)
    }

    /// Persistent up to `level_count` hierarchy levels above the edge.
    pub fn create_local_persistent_delay(
        &mut self,
        graph: GraphId,
        edge: EdgeIndex,
        value: impl Into<Rate>,
        level_count: u32,
    ) -> Result<usize, Error> {
        let value = self.static_delay_value(graph, value)?;
        self.graphs
            .graph_mut(graph)
            .add_delay(edge, value, None, None, true, level_count)
    }

    pub fn create_local_delay(
        &mut self,
        graph: GraphId,
        edge: EdgeIndex,
        value: impl Into<Rate>,
        setter: Option<(NodeIndex, usize)>,
        getter: Option<(NodeIndex, usize)>,
    ) -> Result<usize, Error> {
        let value = self.static_delay_value(graph, value)?;
        self.graphs
            .graph_mut(graph)
            .add_delay(edge, value, setter, getter, false, 0)
    }

    fn static_delay_value(&self, graph: GraphId, value: impl Into<Rate>) -> Result<i64, Error> {
        let g = self.graphs.graph(graph);
        let expression = value.into().resolve(g.params())?;
        if expression.dynamic() {
            return Err(Error::DynamicExpression {
                entity: format!("delay in graph '{}'", g.name()),
                expression: expression.source().to_string(),
            });
        }
        expression.evaluate(g.params())
    }

    /* === Vertex runtime information === */

    pub fn register_kernel(&mut self, kernel: Kernel) -> usize {
        self.kernels.push(kernel);
        self.kernels.len() - 1
    }

    pub fn set_vertex_kernel(&mut self, graph: GraphId, vertex: NodeIndex, kernel: usize) -> Result<(), Error> {
        if kernel >= self.kernels.len() {
            return Err(Error::InvalidIndex { entity: "kernel", index: kernel });
        }
        self.graphs.graph_mut(graph).vertex_mut(vertex).set_kernel(kernel);
        Ok(())
    }

    /// Parameter slots (of the vertex's graph) a config actor writes, in
    /// kernel output order.
    pub fn set_config_output_params(
        &mut self,
        graph: GraphId,
        vertex: NodeIndex,
        params: Vec<usize>,
    ) -> Result<(), Error> {
        for slot in &params {
            self.graphs.graph(graph).param(*slot)?;
        }
        self.graphs.graph_mut(graph).vertex_mut(vertex).set_output_params(params);
        Ok(())
    }

    pub fn set_vertex_mappable(
        &mut self,
        graph: GraphId,
        vertex: NodeIndex,
        pe: PeId,
        mappable: bool,
    ) -> Result<(), Error> {
        let pe_count = self.platform.as_ref().ok_or(Error::NoPlatform)?.pe_count();
        if pe >= pe_count {
            return Err(Error::InvalidIndex { entity: "PE", index: pe });
        }
        self.graphs
            .graph_mut(graph)
            .vertex_mut(vertex)
            .rt_mut()
            .set_mappable(pe_count, pe, mappable);
        Ok(())
    }

    pub fn set_vertex_timing(
        &mut self,
        graph: GraphId,
        vertex: NodeIndex,
        hw_type: u32,
        timing: impl Into<Rate>,
    ) -> Result<(), Error> {
        let expression = timing.into().resolve(self.graphs.graph(graph).params())?;
        self.graphs
            .graph_mut(graph)
            .vertex_mut(vertex)
            .rt_mut()
            .set_timing(hw_type, expression);
        Ok(())
    }

    pub fn set_vertex_default_timing(
        &mut self,
        graph: GraphId,
        vertex: NodeIndex,
        timing: impl Into<Rate>,
    ) -> Result<(), Error> {
        let expression = timing.into().resolve(self.graphs.graph(graph).params())?;
        self.graphs
            .graph_mut(graph)
            .vertex_mut(vertex)
            .rt_mut()
            .set_default_timing(expression);
        Ok(())
    }

    pub fn register_external_buffer(&mut self, bytes: Vec<u8>) -> usize {
        self.external.push(bytes);
        self.external.len() - 1
    }

    /* === Platform description === */

    pub fn create_platform(&mut self, cluster_count: usize) -> Result<(), Error> {
        if self.platform.is_some() {
            return Err(Error::PlatformAlreadyExists);
        }
        self.platform = Some(Platform::new(cluster_count));
        Ok(())
    }

    pub fn create_cluster(&mut self, memory: MemoryUnit) -> Result<ClusterId, Error> {
        Ok(self
            .platform
            .as_mut()
            .ok_or(Error::NoPlatform)?
            .create_cluster(memory))
    }

    pub fn create_pe(
        &mut self,
        hw_type: u32,
        hw_id: u32,
        cluster: ClusterId,
        name: &str,
        kind: PeKind,
    ) -> Result<PeId, Error> {
        self.platform
            .as_mut()
            .ok_or(Error::NoPlatform)?
            .create_pe(hw_type, hw_id, cluster, name, kind)
    }

    pub fn enable_pe(&mut self, pe: PeId) -> Result<(), Error> {
        self.platform.as_mut().ok_or(Error::NoPlatform)?.set_enabled(pe, true)
    }

    pub fn disable_pe(&mut self, pe: PeId) -> Result<(), Error> {
        self.platform.as_mut().ok_or(Error::NoPlatform)?.set_enabled(pe, false)
    }

    pub fn set_spider_grt_pe(&mut self, pe: PeId) -> Result<(), Error> {
        self.platform.as_mut().ok_or(Error::NoPlatform)?.set_grt(pe)
    }

    pub fn set_cluster_to_cluster_cost_routine(&mut self, routine: ClusterCostRoutine) -> Result<(), Error> {
        self.platform
            .as_mut()
            .ok_or(Error::NoPlatform)?
            .set_cluster_cost_routine(routine);
        Ok(())
    }

    pub fn set_cluster_read_cost_routine(
        &mut self,
        cluster: ClusterId,
        routine: MemoryCostRoutine,
    ) -> Result<(), Error> {
        self.platform
            .as_mut()
            .ok_or(Error::NoPlatform)?
            .set_read_cost_routine(cluster, routine);
        Ok(())
    }

    pub fn set_cluster_write_cost_routine(
        &mut self,
        cluster: ClusterId,
        routine: MemoryCostRoutine,
    ) -> Result<(), Error> {
        self.platform
            .as_mut()
            .ok_or(Error::NoPlatform)?
            .set_write_cost_routine(cluster, routine);
        Ok(())
    }

    /* === Configuration toggles === */

    pub fn enable_verbose(&mut self) {
        self.config.verbose = true;
    }

    pub fn disable_verbose(&mut self) {
        self.config.verbose = false;
    }

    pub fn enable_export_trace(&mut self) {
        self.config.export_trace = true;
    }

    pub fn disable_export_trace(&mut self) {
        self.config.export_trace = false;
    }

    pub fn enable_static_schedule_optim(&mut self) {
        self.config.static_schedule_optim = true;
    }

    pub fn disable_static_schedule_optim(&mut self) {
        self.config.static_schedule_optim = false;
    }

    pub fn enable_srdag_optims(&mut self) {
        self.config.srdag_optims = true;
    }

    pub fn disable_srdag_optims(&mut self) {
        self.config.srdag_optims = false;
    }

    pub fn set_scheduling_policy(&mut self, policy: SchedulingPolicy) {
        self.config.scheduling = policy;
    }

    pub fn set_execution_policy(&mut self, policy: ExecutionPolicy) {
        self.config.execution = policy;
    }

    /* === Analysis-side accessors (no worker threads involved) === */

    pub fn graphs(&self) -> &Graphs {
        &self.graphs
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.state.as_ref().map(|s| &s.schedule)
    }

    pub fn firing_tree(&self) -> Option<&FiringTree> {
        self.state.as_ref().map(|s| &s.tree)
    }

    pub fn trace(&self) -> &[TraceMessage] {
        self.state.as_ref().map(|s| s.trace.as_slice()).unwrap_or(&[])
    }

    /// Snapshot of an external buffer's contents.
    pub fn external_buffer(&self, index: usize) -> Option<Vec<u8>> {
        self.state
            .as_ref()
            .and_then(|s| s.runtime.external().snapshot(index))
            .or_else(|| self.external.get(index).cloned())
    }

    /* === Execution === */

    fn validate(&self) -> Result<GraphId, Error> {
        let top = self.top.ok_or(Error::InvalidIndex { entity: "application graph", index: 0 })?;
        for id in 0..self.graphs.len() {
            let graph = self.graphs.graph(id);
            graph.validate()?;
            for v in graph.config_vertices() {
                if graph.vertex(*v).kernel().is_none() {
                    return Err(Error::InvalidVertex {
                        vertex: graph.vertex(*v).name().to_string(),
                        detail: "config actor needs a kernel to produce its parameters",
                    });
                }
            }
        }
        Ok(top)
    }

    fn fully_static(&self) -> bool {
        (0..self.graphs.len()).all(|id| !self.graphs.graph(id).dynamic())
    }

    /// Run one top-level graph iteration to completion: schedule, map,
    /// allocate, dispatch, and re-schedule as dynamic parameters arrive.
    ///
    /// A fully static application keeps its plan across iterations when
    /// `static_schedule_optim` is on; only dispatch is repeated.
    pub fn run_iteration(&mut self) -> Result<(), Error> {
        let top = self.validate()?;
        if self.platform.is_none() {
            return Err(Error::NoPlatform);
        }
        let replay =
            self.state.is_some() && self.config.static_schedule_optim && self.fully_static();
        if self.state.is_none() {
            self.boot(top)?;
        } else if replay {
            self.prepare_replay();
        } else {
            self.prepare_next_iteration()?;
        }
        let platform = self.platform.as_ref().expect("checked above");
        let state = self.state.as_mut().expect("booted above");

        if replay {
            let tasks: Vec<crate::scheduler::TaskIx> =
                (0..state.schedule.task_count() as crate::scheduler::TaskIx).collect();
            Self::dispatch_and_wait(&self.graphs, state, platform, &tasks, top)?;
        } else {
            loop {
                let new = state
                    .resources
                    .execute(&self.graphs, &mut state.tree, platform, &mut state.schedule)?;
                let storage = state.resources.allocator_mut().drain_storage();
                state.storages.extend(storage.iter().copied());
                state.runtime.install_storage(&storage);
                if new.is_empty() {
                    if state.resources.last_unschedulable() == 0 {
                        break;
                    }
                    return Err(Error::InconsistentGraph {
                        graph: self.graphs.graph(top).name().to_string(),
                        detail: "unschedulable firings remain but no parameters are pending"
                            .to_string(),
                    });
                }
                Self::dispatch_and_wait(&self.graphs, state, platform, &new, top)?;
            }
        }
        if self.config.verbose {
            let state = self.state.as_ref().expect("still booted");
            log::debug!(
                "plan: {} tasks, makespan {}",
                state.schedule.task_count(),
                state.schedule.stats().makespan()
            );
        }
        self.carry_persistent_delays()?;
        let state = self.state.as_mut().expect("still booted");
        state.iteration += 1;
        log::debug!("iteration {} complete", state.iteration);
        Ok(())
    }

    /// Push a batch of ready tasks to the workers and pump messages until
    /// every one of them completed.
    fn dispatch_and_wait(
        graphs: &Graphs,
        state: &mut RunState,
        platform: &Platform,
        tasks: &[crate::scheduler::TaskIx],
        top: GraphId,
    ) -> Result<(), Error> {
        for ix in tasks {
            state
                .runtime
                .dispatch(graphs, &state.tree, platform, &state.schedule, *ix)?;
        }
        let mut in_flight = tasks.len();
        while in_flight > 0 {
            match state.runtime.recv_timeout(RUNTIME_TIMEOUT) {
                Some(GrtMessage::JobDone { task_ix, .. }) => {
                    state.schedule.task_mut(task_ix).set_state(TaskState::Done);
                    in_flight -= 1;
                }
                Some(GrtMessage::Parameter(message)) => {
                    Self::apply_parameter(graphs, &mut state.tree, &state.schedule, message)?;
                }
                Some(GrtMessage::Trace(trace)) => state.trace.push(trace),
                None => {
                    return Err(Error::InconsistentGraph {
                        graph: graphs.graph(top).name().to_string(),
                        detail: format!("runtime stalled with {} jobs in flight", in_flight),
                    })
                }
            }
        }
        Ok(())
    }

    fn boot(&mut self, top: GraphId) -> Result<(), Error> {
        let platform = self.platform.as_mut().expect("platform checked by caller");
        let tree = FiringTree::new(&self.graphs, top)?;
        let schedule = Schedule::new(platform.pe_count());
        let mut resources = ResourcesAllocator::new(self.config.scheduling, self.config.execution);
        resources.reserve_persistent_delays(&self.graphs, platform)?;
        let runtime = RuntimePlatform::spawn(
            platform,
            Arc::new(std::mem::take(&mut self.kernels)),
            ExternalBuffers::new(std::mem::take(&mut self.external)),
            self.config.export_trace,
        );
        self.state = Some(RunState {
            tree,
            schedule,
            resources,
            runtime,
            trace: Vec::new(),
            storages: Vec::new(),
            iteration: 0,
        });
        Ok(())
    }

    fn prepare_next_iteration(&mut self) -> Result<(), Error> {
        let state = self.state.as_mut().expect("prepare without boot");
        state.tree.reset(&self.graphs)?;
        state.schedule.clear();
        state.storages.clear();
        state.runtime.memory().clear_transient();
        state.runtime.reset_ledgers();
        state.resources.allocator_mut().next_iteration();
        Ok(())
    }

    /// Static replay: keep the plan, refresh the runtime state only.
    fn prepare_replay(&mut self) {
        let state = self.state.as_mut().expect("replay without boot");
        state.runtime.memory().clear_transient();
        state.runtime.reset_ledgers();
        state.runtime.install_storage(&state.storages);
        for ix in 0..state.schedule.task_count() as crate::scheduler::TaskIx {
            state.schedule.task_mut(ix).set_state(TaskState::Ready);
        }
    }

    fn apply_parameter(
        graphs: &Graphs,
        tree: &mut FiringTree,
        schedule: &Schedule,
        message: ParameterMessage,
    ) -> Result<(), Error> {
        let task = schedule.task(message.task_ix);
        let TaskKind::Vertex { firing, vertex, .. } = task.kind() else {
            return Ok(());
        };
        let graph = graphs.graph(tree.firing(*firing).graph());
        let slots = graph.vertex(*vertex).output_params().to_vec();
        for (slot, value) in slots.iter().zip(message.values.iter()) {
            tree.set_param(message.firing, *slot, *value);
            log::debug!(
                "parameter '{}' of '{}' set to {}",
                graph.param(*slot).map(|p| p.name()).unwrap_or("?"),
                graph.name(),
                value
            );
        }
        tree.resolve(graphs, message.firing)
    }

    /// Copy the final `delay` tokens of each persistent delay back into its
    /// storage so the next iteration starts from them.
    fn carry_persistent_delays(&mut self) -> Result<(), Error> {
        let state = self.state.as_mut().expect("carry without boot");
        let tree = &state.tree;
        for f in tree.firing_ids() {
            if !tree.firing(f).resolved() {
                continue;
            }
            let graph_id = tree.firing(f).graph();
            let graph = self.graphs.graph(graph_id);
            let params = tree.firing(f).params();
            for (delay_ix, delay) in graph.delays().iter().enumerate() {
                if !delay.persistent() {
                    continue;
                }
                let address = state
                    .resources
                    .allocator()
                    .persistent_address(graph_id, delay_ix)
                    .expect("persistent delay without reservation");
                let edge = delay.edge();
                let snk_rate = graph.edge(edge).snk_rate().evaluate(params)?;
                let snk_rv = i64::from(tree.rv(f, graph.sink(edge)));
                let snk_tot = snk_rate * snk_rv;
                let d = delay.value();
                let deps =
                    dependencies::exec_dependencies(&self.graphs, tree, f, edge, snk_tot, snk_tot + d - 1)?;
                let mut carried: Vec<u8> = Vec::with_capacity(d as usize);
                for dep in &deps {
                    match dep.kind {
                        DepKind::Unresolved => continue,
                        DepKind::Delay { .. } => {
                            let size = (dep.memory_end - dep.memory_start + 1) as usize;
                            carried.extend(state.runtime.memory().read(
                                address,
                                dep.memory_start as usize,
                                size,
                                0,
                            ));
                        }
                        DepKind::Vertex { firing, vertex } => {
                            for kk in dep.firing_start..=dep.firing_end {
                                let start = if kk == dep.firing_start { dep.memory_start } else { 0 };
                                let end = if kk == dep.firing_end {
                                    dep.memory_end
                                } else {
                                    dep.rate as u32 - 1
                                };
                                let task_ix = tree.task_ix(firing, vertex, kk);
                                if task_ix == u32::MAX {
                                    continue;
                                }
                                let fifo = state
                                    .schedule
                                    .task(task_ix)
                                    .outputs()
                                    .get(dep.port as usize)
                                    .copied();
                                if let Some(fifo) = fifo {
                                    carried.extend(state.runtime.memory().read(
                                        fifo.address,
                                        (fifo.offset + start) as usize,
                                        (end - start + 1) as usize,
                                        1,
                                    ));
                                }
                            }
                        }
                    }
                }
                carried.resize(d as usize, 0);
                state.runtime.memory().write(address, 0, &carried);
                log::trace!(
                    "carried {} delay tokens on '{}' into the next iteration",
                    d,
                    graph.name()
                );
            }
        }
        Ok(())
    }

    /// Write the schedule as an SVG Gantt chart.
    pub fn export_gantt<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        let (Some(state), Some(platform)) = (self.state.as_ref(), self.platform.as_ref()) else {
            return Err(Error::NoPlatform);
        };
        gantt::export(&state.schedule, platform, out).map_err(|e| Error::ExportFailed(e.to_string()))
    }

    /// Serialize the collected execution trace as JSON.
    pub fn export_trace<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        let trace = self.trace();
        serde_json::to_writer_pretty(out, trace).map_err(|e| Error::ExportFailed(e.to_string()))
    }

    /// Stop every worker; in-flight jobs complete normally.
    pub fn shutdown(&mut self) {
        if let Some(state) = self.state.take() {
            state.runtime.shutdown();
        }
    }
}

impl Default for Spider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Spider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

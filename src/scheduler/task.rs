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

use petgraph::graph::NodeIndex;

use crate::archi::{ClusterId, PeId};
use crate::dependencies::DependencyInfo;
use crate::firing::FiringId;
use crate::scheduler::alloc::Fifo;

/// Index of a task inside the schedule.
pub type TaskIx = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// A dependency points into an unresolved subgraph; re-evaluated after
    /// the next parameter update.
    NotSchedulable,
    /// Dependencies are known but not all of them are mapped yet.
    NotRunnable,
    Pending,
    Ready,
    Running,
    Done,
}

#[derive(Clone, Debug)]
pub enum TaskKind {
    /// One firing of one vertex.
    Vertex {
        firing: FiringId,
        vertex: NodeIndex,
        k: u32,
    },
    /// Inter-cluster transfer emission, inserted by the mapper.
    Send { to: ClusterId },
    /// Inter-cluster transfer reception, paired with a `Send`.
    Receive { from: ClusterId },
}

/// One unit of scheduled work.
///
/// Constraint and notification vectors are indexed by LRT: `constraints[k]`
/// is the job execution index on LRT `k` this task must wait for, and
/// `notifications[k]` is set when completion must be signalled to LRT `k`.
#[derive(Clone, Debug)]
pub struct Task {
    ix: TaskIx,
    kind: TaskKind,
    name: String,
    kernel: Option<usize>,
    state: TaskState,
    mapped_pe: Option<PeId>,
    start: u64,
    end: u64,
    job_exec_ix: u32,
    constraints: Vec<Option<u32>>,
    notifications: Vec<bool>,
    /// Producer tasks and the bytes flowing from each.
    deps: Vec<(TaskIx, u64)>,
    /// Producer intervals per input port, set at scheduling time and
    /// consumed by the FIFO allocator.
    input_deps: Vec<Vec<DependencyInfo>>,
    inputs: Vec<Fifo>,
    outputs: Vec<Fifo>,
    /// Payload of a sync task, in bytes.
    comm_bytes: u64,
    /// Sync tasks the allocator may collapse when both ends land on one
    /// cluster after later mapping decisions.
    sync_optimizable: bool,
}

impl Task {
    pub fn vertex(
        ix: TaskIx,
        firing: FiringId,
        vertex: NodeIndex,
        k: u32,
        name: String,
        kernel: Option<usize>,
        lrt_count: usize,
        input_deps: Vec<Vec<DependencyInfo>>,
        deps: Vec<(TaskIx, u64)>,
    ) -> Self {
        Self {
            ix,
            kind: TaskKind::Vertex { firing, vertex, k },
            name,
            kernel,
            state: TaskState::Pending,
            mapped_pe: None,
            start: 0,
            end: 0,
            job_exec_ix: u32::MAX,
            constraints: vec![None; lrt_count],
            notifications: vec![false; lrt_count],
            deps,
            input_deps,
            inputs: Vec::new(),
            outputs: Vec::new(),
            comm_bytes: 0,
            sync_optimizable: false,
        }
    }

    pub fn sync(
        ix: TaskIx,
        kind: TaskKind,
        name: String,
        lrt_count: usize,
        dep: (TaskIx, u64),
        comm_bytes: u64,
    ) -> Self {
        Self {
            ix,
            kind,
            name,
            kernel: None,
            state: TaskState::Pending,
            mapped_pe: None,
            start: 0,
            end: 0,
            job_exec_ix: u32::MAX,
            constraints: vec![None; lrt_count],
            notifications: vec![false; lrt_count],
            deps: vec![dep],
            input_deps: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            comm_bytes,
            sync_optimizable: true,
        }
    }

    pub fn ix(&self) -> TaskIx {
        self.ix
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> Option<usize> {
        self.kernel
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn mapped_pe(&self) -> Option<PeId> {
        self.mapped_pe
    }

    pub fn set_mapped_pe(&mut self, pe: PeId) {
        self.mapped_pe = Some(pe);
    }

    pub fn start_time(&self) -> u64 {
        self.start
    }

    pub fn set_start_time(&mut self, t: u64) {
        self.start = t;
    }

    pub fn end_time(&self) -> u64 {
        self.end
    }

    pub fn set_end_time(&mut self, t: u64) {
        self.end = t;
    }

    pub fn job_exec_ix(&self) -> u32 {
        self.job_exec_ix
    }

    pub fn set_job_exec_ix(&mut self, ix: u32) {
        self.job_exec_ix = ix;
    }

    pub fn deps(&self) -> &[(TaskIx, u64)] {
        &self.deps
    }

    pub fn replace_dep(&mut self, from: TaskIx, to: TaskIx) {
        for (dep, _) in &mut self.deps {
            if *dep == from {
                *dep = to;
            }
        }
    }

    pub fn input_deps(&self) -> &[Vec<DependencyInfo>] {
        &self.input_deps
    }

    pub fn constraints(&self) -> &[Option<u32>] {
        &self.constraints
    }

    pub fn set_constraint(&mut self, lrt: usize, job: u32) {
        let slot = &mut self.constraints[lrt];
        *slot = Some(slot.map_or(job, |j| j.max(job)));
    }

    pub fn notifications(&self) -> &[bool] {
        &self.notifications
    }

    pub fn set_notification(&mut self, lrt: usize, notify: bool) {
        self.notifications[lrt] = notify;
    }

    pub fn notify_all(&mut self) {
        self.notifications.iter_mut().for_each(|n| *n = true);
    }

    pub fn inputs(&self) -> &[Fifo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Fifo] {
        &self.outputs
    }

    pub fn set_inputs(&mut self, fifos: Vec<Fifo>) {
        self.inputs = fifos;
    }

    pub fn set_outputs(&mut self, fifos: Vec<Fifo>) {
        self.outputs = fifos;
    }

    pub fn comm_bytes(&self) -> u64 {
        self.comm_bytes
    }

    pub fn is_sync_optimizable(&self) -> bool {
        self.sync_optimizable
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.kind, TaskKind::Send { .. } | TaskKind::Receive { .. })
    }
}

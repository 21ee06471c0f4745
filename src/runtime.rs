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

//! Thread-per-LRT execution platform.
//!
//! One worker thread per LRT-hosting PE plus the global runtime thread that
//! owns scheduling state. Typed bounded queues carry jobs and notifications
//! to the workers; parameters, traces and completions flow back over a
//! shared channel. Shutdown is a sentinel message per queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::archi::Platform;
use crate::firing::FiringTree;
use crate::pisdf::{Graphs, VertexType};
use crate::scheduler::{Schedule, StorageInit, TaskIx, TaskKind};
use crate::Error;

pub mod message;
mod runner;

pub use message::{
    BuiltinOp, ExecConstraint, GrtMessage, JobFifos, JobMessage, LrtMessage, NotificationMessage,
    ParameterMessage, TraceMessage,
};

/// User kernel: `(params, inputs, outputs) -> output parameter values`.
/// Buffers arrive in port order; output parameter values are only read from
/// config actors.
pub type Kernel = Arc<dyn Fn(&[i64], &[&[u8]], &mut [Vec<u8>]) -> Vec<i64> + Send + Sync>;

const QUEUE_CAPACITY: usize = 1024;

struct Buffer {
    data: Vec<u8>,
    count: u32,
    persistent: bool,
}

/// Maps virtual FIFO addresses to buffers and reference counts. Buffers
/// disappear once their count drains to zero; persistent buffers never do.
pub struct MemoryInterface {
    inner: Mutex<HashMap<u64, Buffer>>,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or replace) the buffer behind `address`.
    pub fn install(&self, address: u64, data: Vec<u8>, count: u32, persistent: bool) {
        self.inner.lock().insert(
            address,
            Buffer {
                data,
                count,
                persistent,
            },
        );
    }

    pub fn install_storage(&self, init: &StorageInit) {
        let mut inner = self.inner.lock();
        if init.persistent && inner.contains_key(&init.address) {
            return;
        }
        inner.insert(
            init.address,
            Buffer {
                data: vec![0u8; init.size as usize],
                count: u32::MAX,
                persistent: init.persistent,
            },
        );
    }

    /// Read a slice and burn `decrement` references. Out-of-range reads pad
    /// with zeroes (windows into not-yet-written storage).
    pub fn read(&self, address: u64, offset: usize, size: usize, decrement: u32) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let Some(buffer) = inner.get_mut(&address) else {
            log::warn!("read of unmapped virtual address {}", address);
            return vec![0u8; size];
        };
        let mut out = vec![0u8; size];
        if offset < buffer.data.len() {
            let take = size.min(buffer.data.len() - offset);
            out[..take].copy_from_slice(&buffer.data[offset..offset + take]);
        }
        if !buffer.persistent && buffer.count != u32::MAX {
            buffer.count = buffer.count.saturating_sub(decrement);
            if buffer.count == 0 {
                inner.remove(&address);
            }
        }
        out
    }

    pub fn write(&self, address: u64, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let Some(buffer) = inner.get_mut(&address) else {
            log::warn!("write to unmapped virtual address {}", address);
            return;
        };
        if offset + bytes.len() > buffer.data.len() {
            buffer.data.resize(offset + bytes.len(), 0);
        }
        buffer.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Drop everything that does not survive the iteration.
    pub fn clear_transient(&self) {
        self.inner.lock().retain(|_, b| b.persistent);
    }
}

impl Default for MemoryInterface {
    fn default() -> Self {
        Self::new()
    }
}

/// User-registered external buffers, shared with every worker.
#[derive(Clone)]
pub struct ExternalBuffers {
    buffers: Arc<Vec<Mutex<Vec<u8>>>>,
}

impl ExternalBuffers {
    pub fn new(buffers: Vec<Vec<u8>>) -> Self {
        Self {
            buffers: Arc::new(buffers.into_iter().map(Mutex::new).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn read(&self, index: usize, offset: usize, size: usize) -> Vec<u8> {
        let Some(buffer) = self.buffers.get(index) else {
            log::error!("external buffer {} out of range", index);
            return vec![0u8; size];
        };
        let buffer = buffer.lock();
        let mut out = vec![0u8; size];
        if offset < buffer.len() {
            let take = size.min(buffer.len() - offset);
            out[..take].copy_from_slice(&buffer[offset..offset + take]);
        }
        out
    }

    pub fn write(&self, index: usize, offset: usize, bytes: &[u8]) {
        let Some(buffer) = self.buffers.get(index) else {
            log::error!("external buffer {} out of range", index);
            return;
        };
        let mut buffer = buffer.lock();
        if offset + bytes.len() > buffer.len() {
            buffer.resize(offset + bytes.len(), 0);
        }
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn snapshot(&self, index: usize) -> Option<Vec<u8>> {
        self.buffers.get(index).map(|b| b.lock().clone())
    }
}

/// The spawned worker fleet and the channels to reach it.
pub struct RuntimePlatform {
    lrt_senders: Vec<Sender<LrtMessage>>,
    grt_rx: Receiver<GrtMessage>,
    handles: Vec<JoinHandle<()>>,
    memory: Arc<MemoryInterface>,
    external: ExternalBuffers,
    lrt_count: usize,
}

impl RuntimePlatform {
    pub fn spawn(
        platform: &Platform,
        kernels: Arc<Vec<Kernel>>,
        external: ExternalBuffers,
        export_trace: bool,
    ) -> Self {
        let lrt_count = platform.lrt_count();
        let memory = Arc::new(MemoryInterface::new());
        let (grt_tx, grt_rx) = crossbeam_channel::bounded::<GrtMessage>(QUEUE_CAPACITY);
        let channels: Vec<(Sender<LrtMessage>, Receiver<LrtMessage>)> = (0..lrt_count)
            .map(|_| crossbeam_channel::bounded::<LrtMessage>(QUEUE_CAPACITY))
            .collect();
        let lrt_senders: Vec<Sender<LrtMessage>> =
            channels.iter().map(|(tx, _)| tx.clone()).collect();
        let mut handles = Vec::with_capacity(lrt_count);
        for (lrt_ix, (_, rx)) in channels.into_iter().enumerate() {
            let runner = runner::LrtRunner::new(
                lrt_ix,
                lrt_count,
                rx,
                lrt_senders.clone(),
                grt_tx.clone(),
                memory.clone(),
                external.clone(),
                kernels.clone(),
                export_trace,
            );
            handles.push(
                std::thread::Builder::new()
                    .name(format!("lrt-{}", lrt_ix))
                    .spawn(move || runner.run())
                    .expect("failed to spawn LRT worker"),
            );
        }
        Self {
            lrt_senders,
            grt_rx,
            handles,
            memory,
            external,
            lrt_count,
        }
    }

    pub fn lrt_count(&self) -> usize {
        self.lrt_count
    }

    pub fn memory(&self) -> &Arc<MemoryInterface> {
        &self.memory
    }

    pub fn external(&self) -> &ExternalBuffers {
        &self.external
    }

    pub fn install_storage(&self, inits: &[StorageInit]) {
        for init in inits {
            self.memory.install_storage(init);
        }
    }

    /// Push one mapped, allocated task to its LRT queue.
    pub fn dispatch(
        &self,
        graphs: &Graphs,
        tree: &FiringTree,
        platform: &Platform,
        schedule: &Schedule,
        task_ix: TaskIx,
    ) -> Result<(), Error> {
        let job = build_job(graphs, tree, schedule, task_ix)?;
        let pe = schedule.task(task_ix).mapped_pe().expect("dispatch of unmapped task");
        let lrt = platform.pe(pe).lrt().expect("dispatch on a PE without LRT");
        self.lrt_senders[lrt]
            .send(LrtMessage::Job(job))
            .map_err(|_| Error::NoPlatform)?;
        Ok(())
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<GrtMessage> {
        self.grt_rx.recv_timeout(timeout).ok()
    }

    /// Restart the completion ledgers; only safe with no job in flight.
    pub fn reset_ledgers(&self) {
        for tx in &self.lrt_senders {
            let _ = tx.send(LrtMessage::ResetLedger);
        }
    }

    /// Stop every worker at its next queue poll and join the threads.
    pub fn shutdown(self) {
        for tx in &self.lrt_senders {
            let _ = tx.send(LrtMessage::Stop);
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn builtin_op(kind: &TaskKind, subtype: Option<VertexType>, has_kernel: bool) -> BuiltinOp {
    match kind {
        TaskKind::Send { .. } | TaskKind::Receive { .. } => BuiltinOp::Forward,
        TaskKind::Vertex { .. } => {
            if has_kernel {
                return BuiltinOp::Kernel;
            }
            match subtype.expect("vertex task without subtype") {
                VertexType::Fork | VertexType::Duplicate | VertexType::Repeat => BuiltinOp::Alias,
                VertexType::Join | VertexType::Head => BuiltinOp::Forward,
                VertexType::Tail => BuiltinOp::ForwardTail,
                _ => BuiltinOp::Zero,
            }
        }
    }
}

/// Assemble the self-contained job record for one task.
pub fn build_job(
    graphs: &Graphs,
    tree: &FiringTree,
    schedule: &Schedule,
    task_ix: TaskIx,
) -> Result<JobMessage, Error> {
    let task = schedule.task(task_ix);
    let (firing, subtype, n_params_out, input_params) = match task.kind() {
        TaskKind::Vertex { firing, vertex, .. } => {
            let graph = graphs.graph(tree.firing(*firing).graph());
            let vertex = graph.vertex(*vertex);
            (
                *firing,
                Some(vertex.subtype()),
                vertex.output_params().len(),
                tree.firing(*firing).params().iter().map(|p| p.value()).collect(),
            )
        }
        _ => (0, None, 0, Vec::new()),
    };
    let exec_constraints = task
        .constraints()
        .iter()
        .enumerate()
        .filter_map(|(lrt, job)| job.map(|job| ExecConstraint { lrt, job }))
        .collect();
    Ok(JobMessage {
        task_ix,
        task_name: task.name().to_string(),
        kernel_ix: task.kernel(),
        op: builtin_op(task.kind(), subtype, task.kernel().is_some()),
        job_exec_ix: task.job_exec_ix(),
        firing,
        n_params_out,
        input_params,
        synchronization_flags: task.notifications().to_vec(),
        exec_constraints,
        fifos: JobFifos {
            inputs: task.inputs().to_vec(),
            outputs: task.outputs().to_vec(),
        },
    })
}

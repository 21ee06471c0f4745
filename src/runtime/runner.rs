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

//! The LRT worker: a single-threaded cooperative loop per processing
//! element.
//!
//! The worker owns its completion ledger; other LRTs only reach it through
//! notifications routed over its own queue, so no locking is involved. A job
//! whose constraints are not met yet parks in a pending list and is retried
//! after every notification.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::runtime::message::{
    BuiltinOp, GrtMessage, JobMessage, LrtMessage, NotificationMessage, ParameterMessage,
    TraceMessage,
};
use crate::runtime::{ExternalBuffers, Kernel, MemoryInterface};
use crate::scheduler::FifoAttribute;

pub(crate) struct LrtRunner {
    lrt_ix: usize,
    rx: Receiver<LrtMessage>,
    peers: Vec<Sender<LrtMessage>>,
    grt_tx: Sender<GrtMessage>,
    memory: Arc<MemoryInterface>,
    external: ExternalBuffers,
    kernels: Arc<Vec<Kernel>>,
    export_trace: bool,
    /// `ledger[k]` = number of jobs LRT `k` is known to have completed.
    ledger: Vec<u32>,
    pending: VecDeque<JobMessage>,
    epoch: Instant,
}

impl LrtRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        lrt_ix: usize,
        lrt_count: usize,
        rx: Receiver<LrtMessage>,
        peers: Vec<Sender<LrtMessage>>,
        grt_tx: Sender<GrtMessage>,
        memory: Arc<MemoryInterface>,
        external: ExternalBuffers,
        kernels: Arc<Vec<Kernel>>,
        export_trace: bool,
    ) -> Self {
        Self {
            lrt_ix,
            rx,
            peers,
            grt_tx,
            memory,
            external,
            kernels,
            export_trace,
            ledger: vec![0; lrt_count],
            pending: VecDeque::new(),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!("LRT #{} up", self.lrt_ix);
        loop {
            self.drain_pending();
            let message = match self.rx.recv() {
                Ok(message) => message,
                Err(_) => break,
            };
            match message {
                LrtMessage::Job(job) => {
                    if self.is_runnable(&job) {
                        self.run_job(job);
                    } else {
                        self.pending.push_back(job);
                    }
                }
                LrtMessage::Notification(notification) => self.read_notification(notification),
                LrtMessage::ResetLedger => self.ledger.iter_mut().for_each(|v| *v = 0),
                LrtMessage::Stop => break,
            }
        }
        log::debug!("LRT #{} draining and exiting", self.lrt_ix);
    }

    fn read_notification(&mut self, notification: NotificationMessage) {
        let slot = &mut self.ledger[notification.sender_lrt];
        *slot = (*slot).max(notification.job_exec_ix + 1);
    }

    fn is_runnable(&self, job: &JobMessage) -> bool {
        job.exec_constraints
            .iter()
            .all(|c| self.ledger[c.lrt] > c.job)
    }

    fn drain_pending(&mut self) {
        loop {
            let Some(pos) = self.pending.iter().position(|j| self.is_runnable(j)) else {
                return;
            };
            let job = self.pending.remove(pos).expect("position just found");
            self.run_job(job);
        }
    }

    fn run_job(&mut self, job: JobMessage) {
        let start = self.epoch.elapsed().as_micros() as u64;
        let inputs = self.read_inputs(&job);
        let mut outputs: Vec<Vec<u8>> = job
            .fifos
            .outputs
            .iter()
            .map(|f| vec![0u8; f.size as usize])
            .collect();
        let mut params_out: Vec<i64> = Vec::new();
        match job.op {
            BuiltinOp::Kernel => {
                let kernel = self.kernels[job.kernel_ix.expect("kernel op without kernel")].clone();
                let input_refs: Vec<&[u8]> = inputs.iter().map(|b| b.as_slice()).collect();
                params_out = kernel(&job.input_params, &input_refs, &mut outputs);
            }
            BuiltinOp::Forward | BuiltinOp::ForwardTail => {
                let concat: Vec<u8> = inputs.iter().flatten().copied().collect();
                let wanted: usize = outputs.iter().map(|o| o.len()).sum();
                let skip = if job.op == BuiltinOp::ForwardTail {
                    concat.len().saturating_sub(wanted)
                } else {
                    0
                };
                let mut cursor = skip;
                for output in &mut outputs {
                    let take = output.len().min(concat.len().saturating_sub(cursor));
                    output[..take].copy_from_slice(&concat[cursor..cursor + take]);
                    cursor += take;
                }
            }
            BuiltinOp::Alias | BuiltinOp::Zero => {}
        }
        self.commit_outputs(&job, outputs);
        let end = self.epoch.elapsed().as_micros() as u64;

        if job.n_params_out > 0 {
            params_out.truncate(job.n_params_out);
            let _ = self.grt_tx.send(GrtMessage::Parameter(ParameterMessage {
                task_ix: job.task_ix,
                firing: job.firing,
                values: params_out,
            }));
        }
        self.ledger[self.lrt_ix] = self.ledger[self.lrt_ix].max(job.job_exec_ix + 1);
        for (lrt, notify) in job.synchronization_flags.iter().enumerate() {
            if *notify && lrt != self.lrt_ix {
                let _ = self.peers[lrt].send(LrtMessage::Notification(NotificationMessage {
                    sender_lrt: self.lrt_ix,
                    job_exec_ix: job.job_exec_ix,
                }));
            }
        }
        if self.export_trace {
            let _ = self.grt_tx.send(GrtMessage::Trace(TraceMessage {
                lrt: self.lrt_ix,
                task_name: job.task_name.clone(),
                start,
                end,
            }));
        }
        let _ = self.grt_tx.send(GrtMessage::JobDone {
            lrt: self.lrt_ix,
            task_ix: job.task_ix,
        });
        log::trace!("LRT #{} finished job {} ('{}')", self.lrt_ix, job.job_exec_ix, job.task_name);
    }

    /// Materialize the input buffers, expanding merge and repeat FIFOs the
    /// way their descriptors prescribe: a merge owns the `offset` sub-FIFOs
    /// that follow it, a repeat owns exactly one.
    fn read_inputs(&self, job: &JobMessage) -> Vec<Vec<u8>> {
        let fifos = &job.fifos.inputs;
        let mut buffers = Vec::new();
        let mut i = 0usize;
        while i < fifos.len() {
            let (buffer, consumed) = self.read_one(&fifos[i..]);
            buffers.push(buffer);
            i += consumed;
        }
        buffers
    }

    fn read_one(&self, fifos: &[crate::scheduler::Fifo]) -> (Vec<u8>, usize) {
        let fifo = fifos[0];
        match fifo.attribute {
            FifoAttribute::Dummy => (Vec::new(), 1),
            FifoAttribute::RwOwn | FifoAttribute::RwOnly => (
                self.memory
                    .read(fifo.address, fifo.offset as usize, fifo.size as usize, 1),
                1,
            ),
            FifoAttribute::RwExt => (
                self.external
                    .read(fifo.address as usize, fifo.offset as usize, fifo.size as usize),
                1,
            ),
            FifoAttribute::RMerge => {
                let n = fifo.offset as usize;
                let mut merged = Vec::with_capacity(fifo.size as usize);
                let mut consumed = 1;
                for _ in 0..n {
                    let (chunk, used) = self.read_one(&fifos[consumed..]);
                    merged.extend_from_slice(&chunk);
                    consumed += used;
                }
                merged.resize(fifo.size as usize, 0);
                // aliases downstream may read the merged image by address
                self.memory.install(fifo.address, merged.clone(), fifo.count, false);
                (merged, consumed)
            }
            FifoAttribute::RRepeat => {
                let (source, used) = self.read_one(&fifos[1..]);
                let mut tiled = Vec::with_capacity(fifo.size as usize);
                if source.is_empty() {
                    tiled.resize(fifo.size as usize, 0);
                } else {
                    while tiled.len() < fifo.size as usize {
                        let rest = fifo.size as usize - tiled.len();
                        let take = rest.min(source.len());
                        tiled.extend_from_slice(&source[..take]);
                    }
                }
                self.memory.install(fifo.address, tiled.clone(), fifo.count, false);
                (tiled, 1 + used)
            }
        }
    }

    fn commit_outputs(&self, job: &JobMessage, outputs: Vec<Vec<u8>>) {
        for (fifo, data) in job.fifos.outputs.iter().zip(outputs) {
            match fifo.attribute {
                FifoAttribute::RwOwn => {
                    self.memory.install(fifo.address, data, fifo.count, false);
                }
                FifoAttribute::RwExt => {
                    self.external
                        .write(fifo.address as usize, fifo.offset as usize, &data);
                }
                // aliases point into buffers someone else owns
                FifoAttribute::RwOnly
                | FifoAttribute::RMerge
                | FifoAttribute::RRepeat
                | FifoAttribute::Dummy => {}
            }
        }
    }
}

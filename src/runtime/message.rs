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

//! Wire format between the global runtime and the LRT workers.

use serde::{Deserialize, Serialize};

use crate::firing::FiringId;
use crate::scheduler::Fifo;

/// How the worker produces the task's outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuiltinOp {
    /// Invoke the user kernel at `kernel_ix`.
    Kernel,
    /// Outputs alias existing allocations; reading the inputs is all the
    /// work there is (merge/repeat materialization included).
    Alias,
    /// Concatenate the inputs and fill the outputs front-first.
    Forward,
    /// Concatenate the inputs and fill the outputs from the tail end.
    ForwardTail,
    /// Fresh zeroed outputs, no kernel.
    Zero,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConstraint {
    /// LRT whose progress gates this job.
    pub lrt: usize,
    /// Job execution index that must have completed there.
    pub job: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobFifos {
    pub inputs: Vec<Fifo>,
    pub outputs: Vec<Fifo>,
}

/// One job, self-contained: parameter snapshot values, synchronization
/// constraints, notification flags and the FIFO plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobMessage {
    pub task_ix: u32,
    pub task_name: String,
    pub kernel_ix: Option<usize>,
    pub op: BuiltinOp,
    pub job_exec_ix: u32,
    pub firing: FiringId,
    pub n_params_out: usize,
    pub input_params: Vec<i64>,
    /// Per-LRT completion-notification flags.
    pub synchronization_flags: Vec<bool>,
    pub exec_constraints: Vec<ExecConstraint>,
    pub fifos: JobFifos,
}

/// Dynamic parameter values written back by a config actor's firing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterMessage {
    pub task_ix: u32,
    pub firing: FiringId,
    pub values: Vec<i64>,
}

/// Raises the receiver's completion ledger for `sender_lrt` to `job + 1`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub sender_lrt: usize,
    pub job_exec_ix: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceMessage {
    pub lrt: usize,
    pub task_name: String,
    pub start: u64,
    pub end: u64,
}

/// Everything an LRT queue carries; `Stop` is the shutdown sentinel.
#[derive(Clone, Debug)]
pub enum LrtMessage {
    Job(JobMessage),
    Notification(NotificationMessage),
    /// Job indices restart at an iteration boundary; so do the ledgers.
    ResetLedger,
    Stop,
}

/// Everything flowing back to the global runtime.
#[derive(Clone, Debug)]
pub enum GrtMessage {
    Parameter(ParameterMessage),
    Trace(TraceMessage),
    JobDone { lrt: usize, task_ix: u32 },
}

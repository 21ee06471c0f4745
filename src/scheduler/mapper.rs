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

//! Best-fit task mapping.
//!
//! Every enabled, mappable PE of every cluster is evaluated; the winner
//! minimizes `max(ready_time, pe_end_time) + timing + communication`.
//! Crossing a cluster boundary inserts a send/receive pair between the
//! producer and the consumer, timed by the cluster write/read cost routines.

use crate::archi::{PeId, Platform};
use crate::firing::FiringTree;
use crate::pisdf::Graphs;
use crate::scheduler::sched::Schedule;
use crate::scheduler::task::{Task, TaskIx, TaskKind};
use crate::Error;

#[derive(Clone, Copy, Debug)]
struct MappingResult {
    pe: PeId,
    start: u64,
    end: u64,
    cost: u64,
    needs_comm: bool,
}

pub struct BestFitMapper;

impl BestFitMapper {
    pub fn new() -> Self {
        Self
    }

    /// Map one task whose dependencies are all mapped.
    pub fn map(
        &self,
        graphs: &Graphs,
        tree: &FiringTree,
        platform: &Platform,
        schedule: &mut Schedule,
        task_ix: TaskIx,
    ) -> Result<(), Error> {
        let (firing, vertex) = match schedule.task(task_ix).kind() {
            TaskKind::Vertex { firing, vertex, .. } => (*firing, *vertex),
            _ => panic!("sync tasks are mapped at insertion"),
        };
        let deps: Vec<(TaskIx, u64, u64, Option<PeId>)> = schedule
            .task(task_ix)
            .deps()
            .iter()
            .map(|(dep, bytes)| {
                let d = schedule.task(*dep);
                (*dep, *bytes, d.end_time(), d.mapped_pe())
            })
            .collect();
        let ready: u64 = deps.iter().map(|(_, _, end, _)| *end).max().unwrap_or(0);

        let graph = graphs.graph(tree.firing(firing).graph());
        let rt = graph.vertex(vertex).rt();
        let params = tree.firing(firing).params();
        let mut best: Option<MappingResult> = None;
        for cluster in platform.clusters() {
            for pe_ix in cluster.pes() {
                let pe = platform.pe(*pe_ix);
                if pe.lrt().is_none() || !rt.is_mappable(pe) {
                    continue;
                }
                let timing = rt.timing_on(pe, params)?;
                let mut comm = 0u64;
                let mut needs_comm = false;
                for (_, bytes, _, dep_pe) in &deps {
                    if let Some(dep_pe) = dep_pe {
                        if platform.cluster_of(*dep_pe) != cluster.ix() {
                            comm += platform.comm_cost(*dep_pe, pe.virt_ix(), *bytes);
                            needs_comm = true;
                        }
                    }
                }
                let start = ready.max(schedule.stats().end_time(pe.virt_ix()));
                let cost = start + timing + comm;
                let better = match best {
                    None => true,
                    Some(b) => cost < b.cost,
                };
                if better {
                    best = Some(MappingResult {
                        pe: pe.virt_ix(),
                        start,
                        end: start + timing,
                        cost,
                        needs_comm,
                    });
                }
            }
        }
        let best = best.ok_or_else(|| Error::NoMappablePe {
            task: schedule.task(task_ix).name().to_string(),
        })?;

        let (start, end) = if best.needs_comm {
            self.map_communications(platform, schedule, task_ix, &deps, best)?
        } else {
            (best.start, best.end)
        };
        schedule.update_task_and_set_ready(task_ix, best.pe, start, end);

        // execution constraints against every producer; the same-LRT entries
        // are satisfied by queue order but still document the dependency
        let final_deps: Vec<(TaskIx, u64)> = schedule.task(task_ix).deps().to_vec();
        for (dep, _) in final_deps {
            let (dep_pe, dep_job) = {
                let d = schedule.task(dep);
                (d.mapped_pe(), d.job_exec_ix())
            };
            if let Some(dep_pe) = dep_pe {
                if let Some(dep_lrt) = platform.pe(dep_pe).lrt() {
                    schedule.task_mut(task_ix).set_constraint(dep_lrt, dep_job);
                }
            }
        }
        log::trace!(
            "mapped '{}' on PE {} [{}..{}]",
            schedule.task(task_ix).name(),
            best.pe,
            start,
            end
        );
        Ok(())
    }

    /// Insert a send task on each foreign producer's cluster and the paired
    /// receive task on the consumer's cluster, rewriting the dependency to
    /// flow through the pair.
    fn map_communications(
        &self,
        platform: &Platform,
        schedule: &mut Schedule,
        task_ix: TaskIx,
        deps: &[(TaskIx, u64, u64, Option<PeId>)],
        best: MappingResult,
    ) -> Result<(u64, u64), Error> {
        let lrt_count = platform.lrt_count();
        let my_cluster = platform.cluster_of(best.pe);
        let mut ready = 0u64;
        for (dep, bytes, dep_end, dep_pe) in deps {
            let Some(dep_pe) = dep_pe else { continue };
            let dep_cluster = platform.cluster_of(*dep_pe);
            if dep_cluster == my_cluster {
                ready = ready.max(*dep_end);
                continue;
            }
            // send on the producer's PE, timed by the write-cost routine
            let send_ix = schedule.next_task_ix();
            let send = Task::sync(
                send_ix,
                TaskKind::Send { to: my_cluster },
                format!("send:{}", schedule.task(*dep).name()),
                lrt_count,
                (*dep, *bytes),
                *bytes,
            );
            schedule.add_task(send);
            let send_start = (*dep_end).max(schedule.stats().end_time(*dep_pe));
            let send_end = send_start + platform.cluster(dep_cluster).write_cost(*bytes);
            schedule.update_task_and_set_ready(send_ix, *dep_pe, send_start, send_end);
            if let Some(dep_lrt) = platform.pe(*dep_pe).lrt() {
                let dep_job = schedule.task(*dep).job_exec_ix();
                schedule.task_mut(send_ix).set_constraint(dep_lrt, dep_job);
            }

            // receive on the consumer's PE, timed by the read-cost routine
            let recv_ix = schedule.next_task_ix();
            let recv = Task::sync(
                recv_ix,
                TaskKind::Receive { from: dep_cluster },
                format!("recv:{}", schedule.task(*dep).name()),
                lrt_count,
                (send_ix, *bytes),
                *bytes,
            );
            schedule.add_task(recv);
            let recv_start = send_end.max(schedule.stats().end_time(best.pe));
            let recv_end = recv_start + platform.cluster(my_cluster).read_cost(*bytes);
            schedule.update_task_and_set_ready(recv_ix, best.pe, recv_start, recv_end);
            let send_lrt = platform.pe(*dep_pe).lrt().expect("send PE without LRT");
            let send_job = schedule.task(send_ix).job_exec_ix();
            schedule.task_mut(recv_ix).set_constraint(send_lrt, send_job);

            schedule.task_mut(task_ix).replace_dep(*dep, recv_ix);
            ready = ready.max(recv_end);
        }
        let start = ready.max(schedule.stats().end_time(best.pe));
        let timing = best.end - best.start;
        Ok((start, start + timing))
    }
}

impl Default for BestFitMapper {
    fn default() -> Self {
        Self::new()
    }
}

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

//! The schedule: ordered task list plus per-PE occupation statistics.

use crate::archi::PeId;
use crate::scheduler::task::{Task, TaskIx, TaskState};

/// Per-PE start/end/load/idle/job-count counters.
#[derive(Clone, Debug)]
pub struct Stats {
    start: Vec<u64>,
    end: Vec<u64>,
    load: Vec<u64>,
    idle: Vec<u64>,
    jobs: Vec<u32>,
}

impl Stats {
    pub fn new(pe_count: usize) -> Self {
        Self {
            start: vec![u64::MAX; pe_count],
            end: vec![0; pe_count],
            load: vec![0; pe_count],
            idle: vec![0; pe_count],
            jobs: vec![0; pe_count],
        }
    }

    pub fn reset(&mut self) {
        self.start.iter_mut().for_each(|v| *v = u64::MAX);
        self.end.iter_mut().for_each(|v| *v = 0);
        self.load.iter_mut().for_each(|v| *v = 0);
        self.idle.iter_mut().for_each(|v| *v = 0);
        self.jobs.iter_mut().for_each(|v| *v = 0);
    }

    pub fn start_time(&self, pe: PeId) -> u64 {
        if self.start[pe] == u64::MAX {
            0
        } else {
            self.start[pe]
        }
    }

    pub fn end_time(&self, pe: PeId) -> u64 {
        self.end[pe]
    }

    pub fn load_time(&self, pe: PeId) -> u64 {
        self.load[pe]
    }

    pub fn idle_time(&self, pe: PeId) -> u64 {
        self.idle[pe]
    }

    pub fn job_count(&self, pe: PeId) -> u32 {
        self.jobs[pe]
    }

    pub fn update_start_time(&mut self, pe: PeId, time: u64) {
        self.start[pe] = self.start[pe].min(time);
    }

    pub fn update_end_time(&mut self, pe: PeId, time: u64) {
        self.end[pe] = self.end[pe].max(time);
    }

    pub fn update_load_time(&mut self, pe: PeId, time: u64) {
        self.load[pe] += time;
    }

    pub fn update_idle_time(&mut self, pe: PeId, time: u64) {
        self.idle[pe] += time;
    }

    pub fn next_job(&mut self, pe: PeId) -> u32 {
        let job = self.jobs[pe];
        self.jobs[pe] += 1;
        job
    }

    /// Earliest start over PEs that actually run something.
    pub fn min_start_time(&self) -> u64 {
        self.start
            .iter()
            .filter(|s| **s != u64::MAX)
            .min()
            .copied()
            .unwrap_or(0)
    }

    pub fn makespan(&self) -> u64 {
        let end = self.end.iter().max().copied().unwrap_or(0);
        end.saturating_sub(self.min_start_time())
    }

    /// Fraction of the makespan a PE spends executing.
    pub fn utilization(&self, pe: PeId) -> f64 {
        let span = self.makespan();
        if span == 0 {
            0.0
        } else {
            self.load[pe] as f64 / span as f64
        }
    }
}

pub struct Schedule {
    tasks: Vec<Task>,
    stats: Stats,
}

impl Schedule {
    pub fn new(pe_count: usize) -> Self {
        Self {
            tasks: Vec::new(),
            stats: Stats::new(pe_count),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, ix: TaskIx) -> &Task {
        &self.tasks[ix as usize]
    }

    pub fn task_mut(&mut self, ix: TaskIx) -> &mut Task {
        &mut self.tasks[ix as usize]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn next_task_ix(&self) -> TaskIx {
        self.tasks.len() as TaskIx
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn add_task(&mut self, task: Task) -> TaskIx {
        debug_assert_eq!(task.ix() as usize, self.tasks.len(), "task index out of order");
        let ix = task.ix();
        self.tasks.push(task);
        ix
    }

    /// Record a mapping decision and move the task to `Ready`.
    pub fn update_task_and_set_ready(&mut self, ix: TaskIx, pe: PeId, start: u64, end: u64) {
        let task = &mut self.tasks[ix as usize];
        if task.state() == TaskState::Ready {
            return;
        }
        task.set_mapped_pe(pe);
        task.set_start_time(start);
        task.set_end_time(end);
        let job = self.stats.next_job(pe);
        self.tasks[ix as usize].set_job_exec_ix(job);
        self.stats.update_start_time(pe, start);
        self.stats
            .update_idle_time(pe, start.saturating_sub(self.stats.end_time(pe)));
        self.stats.update_end_time(pe, end);
        self.stats.update_load_time(pe, end - start);
        self.tasks[ix as usize].set_state(TaskState::Ready);
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_bookkeeping() {
        let mut schedule = Schedule::new(2);
        let task = Task::vertex(0, 0, petgraph::graph::NodeIndex::new(0), 0, "a:0".into(), None, 2, vec![], vec![]);
        schedule.add_task(task);
        schedule.update_task_and_set_ready(0, 1, 10, 30);
        assert_eq!(schedule.task(0).job_exec_ix(), 0);
        assert_eq!(schedule.stats().end_time(1), 30);
        assert_eq!(schedule.stats().load_time(1), 20);
        assert_eq!(schedule.stats().idle_time(1), 10);
        assert_eq!(schedule.stats().job_count(1), 1);
        assert_eq!(schedule.stats().start_time(0), 0);

        let task = Task::vertex(1, 0, petgraph::graph::NodeIndex::new(1), 0, "b:0".into(), None, 2, vec![], vec![]);
        schedule.add_task(task);
        schedule.update_task_and_set_ready(1, 1, 30, 50);
        assert_eq!(schedule.task(1).job_exec_ix(), 1);
        assert_eq!(schedule.stats().idle_time(1), 10);
        assert_eq!(schedule.stats().makespan(), 40);
        assert!((schedule.stats().utilization(1) - 1.0).abs() < f64::EPSILON);
    }
}

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

//! SVG Gantt export of a schedule: one row per PE with non-zero
//! utilization, tasks as rectangles along the time axis.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};

use crate::archi::Platform;
use crate::scheduler::Schedule;

const OFFSET_X: u64 = 3;
const OFFSET_Y: u64 = 3;
const BORDER: u64 = 5;
const ARROW_SIZE: u64 = 8;
const ARROW_STROKE: u64 = 2;
const TASK_HEIGHT: u64 = 50;
const TASK_SPACE: u64 = 5;
const TASK_MIN_WIDTH: u64 = 50;
const TASK_MAX_WIDTH: u64 = 600;
const GRID_STEP: u64 = 40;

/// 24-bit color from the task label, packed as 8-bit R/G/B channels.
fn task_color(name: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as u32) & 0x00ff_ffff
}

/// Export `schedule` as an SVG document.
pub fn export<W: Write>(schedule: &Schedule, platform: &Platform, out: &mut W) -> io::Result<()> {
    let stats = schedule.stats();
    let rows: Vec<usize> = (0..platform.pe_count())
        .filter(|pe| stats.utilization(*pe) > 0.0)
        .collect();
    let makespan = stats.makespan().max(1);
    let (min_exec, max_exec) = schedule
        .tasks()
        .iter()
        .map(|t| t.end_time() - t.start_time())
        .fold((u64::MAX, 0), |(lo, hi), d| (lo.min(d.max(1)), hi.max(d.max(1))));
    let width_max = if min_exec == u64::MAX {
        TASK_MAX_WIDTH
    } else {
        let ratio = max_exec as f64 / min_exec as f64;
        TASK_MAX_WIDTH.max((TASK_MIN_WIDTH as f64 * ratio) as u64)
    };
    let alpha = width_max as f64 / max_exec.max(1) as f64;
    let scale = |time: u64| (alpha * time as f64) as u64;

    let name_offset: u64 = rows
        .iter()
        .map(|pe| platform.pe(*pe).name().len() as u64 * 8)
        .max()
        .unwrap_or(0)
        .max(OFFSET_X);
    let chart_width = scale(makespan);
    let width = chart_width + name_offset + 2 * BORDER + ARROW_STROKE + ARROW_SIZE;
    let height =
        rows.len() as u64 * (TASK_HEIGHT + TASK_SPACE) + TASK_SPACE + ARROW_STROKE + ARROW_SIZE + OFFSET_Y;

    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>"#)?;
    writeln!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}">"#,
        width, height
    )?;
    writeln!(out, "  <g>")?;

    // grid
    let mut x = name_offset;
    while x <= name_offset + chart_width {
        writeln!(
            out,
            r##"    <line x1="{x}" y1="{}" x2="{x}" y2="{}" stroke="#e0e0e0" stroke-width="1"/>"##,
            OFFSET_Y,
            height - ARROW_SIZE - ARROW_STROKE,
        )?;
        x += GRID_STEP;
    }

    // PE labels
    for (row, pe) in rows.iter().enumerate() {
        let y = OFFSET_Y + row as u64 * (TASK_HEIGHT + TASK_SPACE) + TASK_SPACE + TASK_HEIGHT / 2;
        writeln!(
            out,
            r#"    <text x="2" y="{}" font-size="14">{}</text>"#,
            y,
            platform.pe(*pe).name()
        )?;
    }

    // axes with arrowheads
    let axis_y = height - ARROW_SIZE - ARROW_STROKE;
    writeln!(
        out,
        r#"    <line x1="{}" y1="{}" x2="{}" y2="{}" stroke="black" stroke-width="{}"/>"#,
        name_offset,
        axis_y,
        name_offset + chart_width + ARROW_SIZE,
        axis_y,
        ARROW_STROKE
    )?;
    writeln!(
        out,
        r#"    <polygon points="{},{} {},{} {},{}"/>"#,
        name_offset + chart_width + ARROW_SIZE,
        axis_y - ARROW_SIZE / 2,
        name_offset + chart_width + ARROW_SIZE,
        axis_y + ARROW_SIZE / 2,
        name_offset + chart_width + 2 * ARROW_SIZE,
        axis_y
    )?;
    writeln!(
        out,
        r#"    <line x1="{}" y1="{}" x2="{}" y2="{}" stroke="black" stroke-width="{}"/>"#,
        name_offset,
        axis_y,
        name_offset,
        OFFSET_Y,
        ARROW_STROKE
    )?;
    writeln!(
        out,
        r#"    <polygon points="{},{} {},{} {},{}"/>"#,
        name_offset - ARROW_SIZE / 2,
        OFFSET_Y + ARROW_SIZE,
        name_offset + ARROW_SIZE / 2,
        OFFSET_Y + ARROW_SIZE,
        name_offset,
        OFFSET_Y.saturating_sub(ARROW_SIZE / 2)
    )?;

    // tasks
    let origin = stats.min_start_time();
    for task in schedule.tasks() {
        let Some(pe) = task.mapped_pe() else { continue };
        let Some(row) = rows.iter().position(|r| *r == pe) else {
            continue;
        };
        let x = name_offset + scale(task.start_time() - origin);
        let y = OFFSET_Y + row as u64 * (TASK_HEIGHT + TASK_SPACE) + TASK_SPACE;
        let w = scale(task.end_time() - task.start_time()).max(1);
        let color = task_color(task.name());
        writeln!(
            out,
            r##"    <rect x="{}" y="{}" width="{}" height="{}" rx="3" fill="#{:06x}"/>"##,
            x, y, w, TASK_HEIGHT, color
        )?;
        writeln!(
            out,
            r#"    <text x="{}" y="{}" font-size="12">{}</text>"#,
            x + 2,
            y + TASK_HEIGHT / 2,
            task.name()
        )?;
        writeln!(
            out,
            r#"    <text x="{}" y="{}" font-size="9">[{}:{}]</text>"#,
            x + 2,
            y + TASK_HEIGHT / 2 + 12,
            task.start_time(),
            task.end_time()
        )?;
    }

    writeln!(out, "  </g>")?;
    writeln!(out, "</svg>")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_24_bit() {
        for name in ["a:0", "b:1", "some-vertex:12"] {
            assert!(task_color(name) <= 0x00ff_ffff);
        }
        // stable across calls
        assert_eq!(task_color("a:0"), task_color("a:0"));
    }
}

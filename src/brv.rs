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

//! Basic Repetition Vector computation.
//!
//! Builds the topology matrix of each connected component over exact
//! rationals, solves the null space by Gaussian elimination, scales by the
//! LCM of the denominators, then adjusts the result so interface and config
//! production is fully consumed.

use num::rational::Ratio;
use num::{Signed, Zero};
use petgraph::graph::{EdgeIndex, NodeIndex};

use crate::math::ceil_div;
use crate::pisdf::{Graph, Param, VertexType};
use crate::Error;

type Rat = Ratio<i64>;

/// Repetition count of every vertex of `graph`, indexed by vertex slot,
/// for one firing of the graph under `params`. Interfaces and config actors
/// fire once; vertices whose every adjacent rate is zero do not fire.
pub fn compute(graph: &Graph, params: &[Param]) -> Result<Vec<u32>, Error> {
    let n = graph.vertex_count();
    let mut rv = vec![1u32; n];
    let mut rates: Vec<(i64, i64)> = Vec::with_capacity(graph.edge_count());
    for e in graph.edges() {
        let edge = graph.edge(e);
        rates.push((
            edge.src_rate().evaluate(params)?,
            edge.snk_rate().evaluate(params)?,
        ));
    }

    let eligible: Vec<bool> = graph
        .vertices()
        .map(|v| is_eligible(graph, v, &rates))
        .collect();
    for v in graph.vertices() {
        let subtype = graph.vertex(v).subtype();
        if !eligible[v.index()]
            && !subtype.is_interface()
            && subtype != VertexType::Config
        {
            rv[v.index()] = 0;
        }
    }

    for component in connected_components(graph, &eligible, &rates) {
        solve_component(graph, &component, &rates, &mut rv)?;
    }

    check_consistency(graph, &rates, &rv)?;
    log::debug!("BRV of graph '{}': {:?}", graph.name(), rv);
    Ok(rv)
}

/// A vertex enters the topology matrix when it is neither an interface nor a
/// config actor and at least one adjacent rate is non-zero.
fn is_eligible(graph: &Graph, v: NodeIndex, rates: &[(i64, i64)]) -> bool {
    let vertex = graph.vertex(v);
    if vertex.subtype().is_interface() || vertex.subtype() == VertexType::Config {
        return false;
    }
    vertex.inputs().any(|e| rates[e.index()].1 != 0)
        || vertex.outputs().any(|e| rates[e.index()].0 != 0)
}

fn is_edge_valid(graph: &Graph, e: EdgeIndex, eligible: &[bool], rates: &[(i64, i64)]) -> bool {
    let (src, snk) = (graph.source(e), graph.sink(e));
    src != snk
        && eligible[src.index()]
        && eligible[snk.index()]
        && (rates[e.index()].0 != 0 || rates[e.index()].1 != 0)
}

struct Component {
    vertices: Vec<NodeIndex>,
    edges: Vec<EdgeIndex>,
}

fn connected_components(
    graph: &Graph,
    eligible: &[bool],
    rates: &[(i64, i64)],
) -> Vec<Component> {
    let n = graph.vertex_count();
    let mut visited = vec![false; n];
    let mut components = Vec::new();
    for start in graph.vertices() {
        if visited[start.index()] || !eligible[start.index()] {
            continue;
        }
        let mut vertices = Vec::new();
        let mut edges = Vec::new();
        let mut stack = vec![start];
        visited[start.index()] = true;
        while let Some(v) = stack.pop() {
            vertices.push(v);
            let vertex = graph.vertex(v);
            for e in vertex.inputs().chain(vertex.outputs()) {
                if !is_edge_valid(graph, e, eligible, rates) {
                    continue;
                }
                let (src, snk) = (graph.source(e), graph.sink(e));
                let other = if src == v { snk } else { src };
                if !edges.contains(&e) {
                    edges.push(e);
                }
                if !visited[other.index()] {
                    visited[other.index()] = true;
                    stack.push(other);
                }
            }
        }
        components.push(Component { vertices, edges });
    }
    components
}

fn solve_component(
    graph: &Graph,
    component: &Component,
    rates: &[(i64, i64)],
    rv: &mut [u32],
) -> Result<(), Error> {
    let n_cols = component.vertices.len();
    let n_rows = component.edges.len();
    let inconsistent = |detail: String| Error::InconsistentGraph {
        graph: graph.name().to_string(),
        detail,
    };
    // column of each vertex in the topology matrix
    let mut col = vec![usize::MAX; graph.vertex_count()];
    for (i, v) in component.vertices.iter().enumerate() {
        col[v.index()] = i;
    }
    let mut matrix = vec![Rat::zero(); n_rows * n_cols];
    for (row, e) in component.edges.iter().enumerate() {
        let (src_rate, snk_rate) = rates[e.index()];
        matrix[row * n_cols + col[graph.source(*e).index()]] = Rat::from_integer(src_rate);
        matrix[row * n_cols + col[graph.sink(*e).index()]] = Rat::from_integer(-snk_rate);
    }

    // Gaussian elimination with partial pivoting
    for i in 0..n_rows.min(n_cols) {
        let mut pivot = matrix[i * n_cols + i].abs();
        let mut pivot_row = i;
        for t in i + 1..n_rows {
            let candidate = matrix[t * n_cols + i].abs();
            if candidate > pivot {
                pivot = candidate;
                pivot_row = t;
            }
        }
        if pivot.is_zero() {
            break;
        }
        if pivot_row != i {
            for t in 0..n_cols {
                matrix.swap(pivot_row * n_cols + t, i * n_cols + t);
            }
        }
        let old_pivot = matrix[i * n_cols + i];
        for t in i..n_cols {
            matrix[i * n_cols + t] = matrix[i * n_cols + t] / old_pivot;
        }
        for j in i + 1..n_rows {
            let factor = matrix[j * n_cols + i];
            if !factor.is_zero() {
                for k in 0..n_cols {
                    let sub = factor * matrix[i * n_cols + k];
                    matrix[j * n_cols + k] = matrix[j * n_cols + k] - sub;
                }
            }
        }
    }

    // back-substitution of the null-space solution
    let mut result = vec![Rat::from_integer(1); n_cols];
    for i in (0..n_rows.min(n_cols)).rev() {
        let mut val = Rat::zero();
        for k in i + 1..n_cols {
            val = val + result[k] * matrix[i * n_cols + k];
        }
        if !val.is_zero() {
            if matrix[i * n_cols + i].is_zero() {
                return Err(inconsistent(format!(
                    "null diagonal element [{}][{}] of the topology matrix",
                    i, i
                )));
            }
            result[i] = val.abs() / matrix[i * n_cols + i];
        }
    }

    let lcm = result
        .iter()
        .fold(1i64, |acc, r| num::integer::lcm(acc, *r.denom()));
    for (i, v) in component.vertices.iter().enumerate() {
        let scaled = result[i] * lcm;
        if *scaled.denom() != 1 {
            return Err(inconsistent(format!(
                "repetition of '{}' is not integer after LCM scaling",
                graph.vertex(*v).name()
            )));
        }
        rv[v.index()] = scaled.abs().to_integer() as u32;
    }

    // scale the component so interface and config production is consumed
    let mut factor = 1i64;
    for slot in 0..graph.input_interfaces().len() {
        let Some(e) = graph.input_interface_edge(slot) else {
            continue;
        };
        let snk = graph.sink(e);
        if col[snk.index()] == usize::MAX {
            continue;
        }
        let prod = rates[e.index()].0;
        let cons = rates[e.index()].1 * i64::from(rv[snk.index()]);
        if cons > 0 && prod > cons {
            factor = factor.max(ceil_div(prod, cons));
        }
    }
    for slot in 0..graph.output_interfaces().len() {
        let Some(e) = graph.output_interface_edge(slot) else {
            continue;
        };
        let src = graph.source(e);
        if col[src.index()] == usize::MAX {
            continue;
        }
        let cons = rates[e.index()].1;
        let prod = rates[e.index()].0 * i64::from(rv[src.index()]);
        if prod > 0 && cons > prod {
            factor = factor.max(ceil_div(cons, prod));
        }
    }
    for config in graph.config_vertices() {
        for e in graph.vertex(*config).outputs() {
            let snk = graph.sink(e);
            if col[snk.index()] == usize::MAX {
                continue;
            }
            let prod = rates[e.index()].0;
            let cons = rates[e.index()].1 * i64::from(rv[snk.index()]);
            if cons > 0 && prod > cons {
                factor = factor.max(ceil_div(prod, cons));
            }
        }
    }
    if factor > 1 {
        for v in &component.vertices {
            rv[v.index()] = (i64::from(rv[v.index()]) * factor) as u32;
        }
    }
    Ok(())
}

fn check_consistency(graph: &Graph, rates: &[(i64, i64)], rv: &[u32]) -> Result<(), Error> {
    for e in graph.edges() {
        let (src, snk) = (graph.source(e), graph.sink(e));
        let src_vertex = graph.vertex(src);
        let snk_vertex = graph.vertex(snk);
        let (src_rate, snk_rate) = rates[e.index()];
        if src == snk {
            // self-loop: both sides fire the same count, the delay must
            // cover at least one firing's consumption
            if src_rate != snk_rate {
                return Err(Error::InconsistentGraph {
                    graph: graph.name().to_string(),
                    detail: format!("self-loop on '{}' with unequal rates", src_vertex.name()),
                });
            }
            let delay = graph.edge(e).delay().map(|d| graph.delay(d).value()).unwrap_or(0);
            if delay < snk_rate {
                return Err(Error::InsufficientDelay {
                    vertex: src_vertex.name().to_string(),
                    required: snk_rate,
                    actual: delay,
                });
            }
            continue;
        }
        if src_vertex.subtype().is_interface()
            || snk_vertex.subtype().is_interface()
            || src_vertex.subtype() == VertexType::Config
            || snk_vertex.subtype() == VertexType::Config
        {
            continue;
        }
        let produced = src_rate * i64::from(rv[src.index()]);
        let consumed = snk_rate * i64::from(rv[snk.index()]);
        if produced != consumed {
            return Err(Error::InconsistentGraph {
                graph: graph.name().to_string(),
                detail: format!(
                    "edge {}:{} -> {}:{} produces {} tokens but consumes {}",
                    src_vertex.name(),
                    graph.edge(e).src_port(),
                    snk_vertex.name(),
                    graph.edge(e).snk_port(),
                    produced,
                    consumed
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;
    use crate::pisdf::Graphs;

    fn rate(v: i64) -> Expression {
        Expression::constant(v)
    }

    #[test]
    fn test_matched_rates() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 0).unwrap();
        graph.connect(a, 0, rate(2), b, 0, rate(2)).unwrap();
        let rv = compute(graph, &[]).unwrap();
        assert_eq!(rv[a.index()], 1);
        assert_eq!(rv[b.index()], 1);
    }

    #[test]
    fn test_rational_scaling() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 1).unwrap();
        let c = graph.add_vertex("c", VertexType::Normal, 1, 0).unwrap();
        graph.connect(a, 0, rate(1), b, 0, rate(3)).unwrap();
        graph.connect(b, 0, rate(2), c, 0, rate(3)).unwrap();
        let rv = compute(graph, &[]).unwrap();
        assert_eq!(rv[a.index()], 9);
        assert_eq!(rv[b.index()], 3);
        assert_eq!(rv[c.index()], 2);
    }

    #[test]
    fn test_symbolic_rates() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        graph.add_param(Param::new_static("n", 4)).unwrap();
        let params = graph.params().to_vec();
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 0).unwrap();
        let n = Expression::new("n", &params).unwrap();
        graph.connect(a, 0, rate(1), b, 0, n).unwrap();
        let params = graph.params().to_vec();
        let rv = compute(graph, &params).unwrap();
        assert_eq!(rv[a.index()], 4);
        assert_eq!(rv[b.index()], 1);
    }

    #[test]
    fn test_zero_rate_vertex_does_not_fire() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 1).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 1, 0).unwrap();
        graph.connect(a, 0, rate(0), b, 0, rate(0)).unwrap();
        let rv = compute(graph, &[]).unwrap();
        assert_eq!(rv[a.index()], 0);
        assert_eq!(rv[b.index()], 0);
    }

    #[test]
    fn test_input_interface_scales_component() {
        let mut graphs = Graphs::new();
        let g = graphs.create("sub");
        let graph = graphs.graph_mut(g);
        let input = graph.add_vertex("in", VertexType::Input, 0, 1).unwrap();
        let a = graph.add_vertex("a", VertexType::Normal, 1, 0).unwrap();
        // the interface delivers 8 tokens per graph firing, the consumer
        // takes 2 per firing: a must fire 4 times
        graph.connect(input, 0, rate(8), a, 0, rate(2)).unwrap();
        let rv = compute(graph, &[]).unwrap();
        assert_eq!(rv[a.index()], 4);
    }

    #[test]
    fn test_self_loop_needs_delay() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 1, 1).unwrap();
        let e = graph.connect(a, 0, rate(2), a, 0, rate(2)).unwrap();
        assert!(matches!(
            compute(graph, &[]),
            Err(Error::InsufficientDelay { .. })
        ));
        graphs.graph_mut(g).add_delay(e, 2, None, None, false, 0).unwrap();
        let rv = compute(graphs.graph(g), &[]).unwrap();
        assert_eq!(rv[0], 1);
    }

    #[test]
    fn test_inconsistent_graph_fails() {
        let mut graphs = Graphs::new();
        let g = graphs.create("top");
        let graph = graphs.graph_mut(g);
        let a = graph.add_vertex("a", VertexType::Normal, 0, 2).unwrap();
        let b = graph.add_vertex("b", VertexType::Normal, 2, 0).unwrap();
        graph.connect(a, 0, rate(2), b, 0, rate(2)).unwrap();
        // second edge contradicts the first: no integer solution
        graph.connect(a, 1, rate(3), b, 1, rate(2)).unwrap();
        assert!(matches!(
            compute(graph, &[]),
            Err(Error::InconsistentGraph { .. })
        ));
    }
}

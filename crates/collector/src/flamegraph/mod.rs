//! Span forest to nested-rectangle layout.
//!
//! Layout is proportional, not wall-clock: roots tile `[0, total)` where
//! `total` is the sum of root durations, and each node's children tile its
//! band left to right in span-start order. A child is as wide as its own
//! duration unless the children together would overflow the parent, in which
//! case they are all scaled down by the same factor. Children therefore
//! never overlap each other and never leave their parent's band.
//!
//! Nodes live in one flat vector in depth-first preorder and refer to each
//! other by index, so nothing here recurses and span chains of any depth are
//! safe to build, walk and drop.

mod svg;

use std::collections::HashMap;

use perfwatch_core::ids::{SpanId, TraceId};
use perfwatch_core::model::{Span, SpanKind, Status};
use serde::{Deserialize, Serialize};

pub use svg::SvgOptions;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlameNode {
    pub span_id: SpanId,
    pub name: String,
    pub kind: SpanKind,
    pub status: Status,
    /// Own duration in milliseconds; zero for spans that never completed.
    pub value: f64,
    pub x: f64,
    pub width: f64,
    pub depth: usize,
    pub parent: Option<usize>,
    /// Indexes into [`Flamegraph::nodes`], in span-start order.
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flamegraph {
    pub trace_id: TraceId,
    pub total: f64,
    /// Every frame, parents before their children.
    pub nodes: Vec<FlameNode>,
    pub roots: Vec<usize>,
}

impl Flamegraph {
    pub fn build(trace_id: &TraceId, spans: &[Span]) -> Self {
        let mut order = (0..spans.len()).collect::<Vec<_>>();
        order.sort_by_key(|&i| spans[i].start);

        let mut index: HashMap<&SpanId, usize> = HashMap::new();
        for &i in &order {
            index.entry(&spans[i].id).or_insert(i);
        }

        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut root_idx = Vec::new();
        for &i in &order {
            let parent = spans[i]
                .parent_span_id
                .as_ref()
                .and_then(|p| index.get(p).copied())
                .filter(|&p| p != i);
            match parent {
                Some(p) => children.entry(p).or_default().push(i),
                None => root_idx.push(i),
            }
        }

        let mut graph = Self {
            trace_id: trace_id.clone(),
            total: 0.0,
            nodes: Vec::with_capacity(spans.len()),
            roots: Vec::new(),
        };
        let mut visited = vec![false; spans.len()];
        for &i in &root_idx {
            graph.grow(i, spans, &children, &mut visited);
        }
        // Spans caught in a parent cycle are unreachable from any root.
        for &i in &order {
            graph.grow(i, spans, &children, &mut visited);
        }

        graph.place();
        graph
    }

    pub fn root_nodes(&self) -> impl Iterator<Item = &FlameNode> {
        self.roots.iter().filter_map(|&i| self.nodes.get(i))
    }

    pub fn children<'a>(&'a self, node: &'a FlameNode) -> impl Iterator<Item = &'a FlameNode> {
        node.children.iter().filter_map(|&i| self.nodes.get(i))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.nodes.iter().map(|n| n.depth).max()
    }

    /// Collapsed-stack text (`root;child;leaf <self time in µs>`), one line
    /// per frame with non-zero self time.
    pub fn to_folded(&self) -> String {
        let mut out = String::new();
        let mut path: Vec<&str> = Vec::new();
        for node in &self.nodes {
            path.truncate(node.depth);
            path.push(&node.name);

            let below = self.children(node).map(|c| c.value).sum::<f64>();
            let self_us = ((node.value - below).max(0.0) * 1000.0).round() as u64;
            if self_us > 0 {
                let frames = path
                    .iter()
                    .map(|f| f.replace(';', ":"))
                    .collect::<Vec<_>>()
                    .join(";");
                out.push_str(&format!("{frames} {self_us}\n"));
            }
        }
        out
    }

    pub fn render_svg(&self, opts: &SvgOptions) -> String {
        svg::render(self, opts)
    }

    /// Depth-first from `root`, appending nodes in preorder.
    fn grow(
        &mut self,
        root: usize,
        spans: &[Span],
        children: &HashMap<usize, Vec<usize>>,
        visited: &mut [bool],
    ) {
        let mut stack = vec![(root, None::<usize>)];
        while let Some((i, parent)) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;

            let span = &spans[i];
            let idx = self.nodes.len();
            let depth = parent.map_or(0, |p| self.nodes[p].depth + 1);
            self.nodes.push(FlameNode {
                span_id: span.id.clone(),
                name: span.name.clone(),
                kind: span.kind,
                status: span.status,
                value: span.duration_ms().unwrap_or(0.0),
                x: 0.0,
                width: 0.0,
                depth,
                parent,
                children: Vec::new(),
            });
            match parent {
                Some(p) => self.nodes[p].children.push(idx),
                None => self.roots.push(idx),
            }

            if let Some(kids) = children.get(&i) {
                stack.extend(kids.iter().rev().map(|&c| (c, Some(idx))));
            }
        }
    }

    /// Preorder guarantees a node is placed before its children are.
    fn place(&mut self) {
        let mut offset = 0.0;
        for &r in &self.roots {
            let node = &mut self.nodes[r];
            node.x = offset;
            node.width = node.value;
            offset += node.value;
        }
        self.total = offset;

        for i in 0..self.nodes.len() {
            let (x, width) = (self.nodes[i].x, self.nodes[i].width);
            let kids = std::mem::take(&mut self.nodes[i].children);

            let wanted = kids.iter().map(|&c| self.nodes[c].value).sum::<f64>();
            let scale = if wanted > width && wanted > 0.0 {
                width / wanted
            } else {
                1.0
            };

            let end = x + width;
            let mut cursor = x;
            for &c in &kids {
                let child = &mut self.nodes[c];
                let w = (child.value * scale).min(end - cursor).max(0.0);
                child.x = cursor;
                child.width = w;
                cursor += w;
            }
            self.nodes[i].children = kids;
        }
    }
}

#[cfg(test)]
mod tests {
    use testkit::{fixed_trace_id, flame_spans, span, span_id};

    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_tiles(graph: &Flamegraph) {
        for node in &graph.nodes {
            let mut cursor = node.x;
            for child in graph.children(node) {
                assert!(child.x + EPS >= cursor, "child overlaps previous sibling");
                assert!(child.width >= 0.0);
                assert!(child.x + child.width <= node.x + node.width + EPS, "child leaves parent band");
                assert_eq!(child.depth, node.depth + 1);
                cursor = child.x + child.width;
            }
        }
    }

    fn kids(graph: &Flamegraph, node: &FlameNode) -> Vec<FlameNode> {
        graph.children(node).cloned().collect()
    }

    #[test]
    fn builds_single_root_with_two_children() {
        let graph = Flamegraph::build(&fixed_trace_id(), &flame_spans());
        assert_eq!(graph.roots.len(), 1);

        let root = &graph.nodes[graph.roots[0]];
        assert_eq!(root.span_id, span_id("A"));
        assert_eq!(root.value, 100.0);
        assert_eq!(graph.total, 100.0);

        let children = kids(&graph, root);
        let ids = children.iter().map(|c| c.span_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![span_id("B"), span_id("C")]);
        let widths = children.iter().map(|c| c.width).sum::<f64>();
        assert!(widths <= root.width);
        assert_eq!(children[0].x, 0.0);
        assert_eq!(children[1].x, 40.0);
        assert_eq!(children[1].parent, Some(graph.roots[0]));
        assert_tiles(&graph);
    }

    #[test]
    fn overflowing_children_are_scaled_into_parent() {
        let t = fixed_trace_id();
        let spans = vec![
            span(&t, "p", None, "handler", SpanKind::Http, 0, 50),
            span(&t, "a", Some("p"), "fanout-1", SpanKind::Http, 0, 40),
            span(&t, "b", Some("p"), "fanout-2", SpanKind::Http, 0, 40),
            span(&t, "c", Some("p"), "fanout-3", SpanKind::Http, 0, 20),
        ];
        let graph = Flamegraph::build(&t, &spans);
        let children = kids(&graph, &graph.nodes[graph.roots[0]]);
        assert_eq!(children.len(), 3);
        let widths = children.iter().map(|c| c.width).sum::<f64>();
        assert!((widths - 50.0).abs() < EPS);
        assert!((children[0].width - 20.0).abs() < EPS);
        assert_tiles(&graph);
    }

    #[test]
    fn orphans_and_cycles_become_roots() {
        let t = fixed_trace_id();
        let spans = vec![
            span(&t, "a", None, "root", SpanKind::Function, 0, 10),
            span(&t, "o", Some("gone"), "orphan", SpanKind::Function, 1, 5),
            span(&t, "x", Some("y"), "loop-x", SpanKind::Function, 2, 3),
            span(&t, "y", Some("x"), "loop-y", SpanKind::Function, 3, 2),
            span(&t, "s", Some("s"), "self-parent", SpanKind::Function, 4, 1),
        ];
        let graph = Flamegraph::build(&t, &spans);
        assert_eq!(graph.node_count(), 5);
        let names = graph.root_nodes().map(|r| r.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["root", "orphan", "self-parent", "loop-x"]);
        let looped = graph.root_nodes().nth(3).unwrap();
        assert_eq!(kids(&graph, looped)[0].name, "loop-y");
        assert_tiles(&graph);
    }

    #[test]
    fn pending_spans_have_zero_width() {
        let t = fixed_trace_id();
        let mut open = span(&t, "p", None, "stuck", SpanKind::Custom, 0, 0);
        open.end = None;
        open.status = Status::Pending;
        let child = span(&t, "c", Some("p"), "work", SpanKind::Function, 0, 25);

        let graph = Flamegraph::build(&t, &[open, child]);
        let root = &graph.nodes[graph.roots[0]];
        assert_eq!(root.value, 0.0);
        assert_eq!(kids(&graph, root)[0].width, 0.0);
        assert_eq!(graph.total, 0.0);
    }

    #[test]
    fn empty_span_list_gives_empty_graph() {
        let graph = Flamegraph::build(&fixed_trace_id(), &[]);
        assert!(graph.roots.is_empty());
        assert_eq!(graph.total, 0.0);
        assert_eq!(graph.to_folded(), "");
    }

    #[test]
    fn folded_output_uses_self_time() {
        let graph = Flamegraph::build(&fixed_trace_id(), &flame_spans());
        let folded = graph.to_folded();
        let lines = folded.lines().collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "GET /api/users 30000",
                "GET /api/users;db.query:listUsers 40000",
                "GET /api/users;cache.get users 30000",
            ]
        );
    }

    #[test]
    fn deep_span_chain_is_built_without_recursion() {
        const DEPTH: usize = 100_000;
        let t = fixed_trace_id();
        let tags = (0..DEPTH).map(|i| i.to_string()).collect::<Vec<_>>();
        let spans = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| {
                let parent = i.checked_sub(1).map(|p| tags[p].as_str());
                span(&t, tag, parent, "recurse", SpanKind::Function, 0, 10)
            })
            .collect::<Vec<_>>();

        let graph = Flamegraph::build(&t, &spans);
        assert_eq!(graph.node_count(), DEPTH);
        assert_eq!(graph.roots, vec![0]);
        assert_eq!(graph.max_depth(), Some(DEPTH - 1));
        let leaf = &graph.nodes[DEPTH - 1];
        assert_eq!(leaf.depth, DEPTH - 1);
        assert_eq!(leaf.width, 10.0);

        let folded = graph.to_folded();
        assert_eq!(folded.lines().count(), 1);
        assert!(folded.ends_with(" 10000\n"));

        let svg = graph.render_svg(&SvgOptions::default());
        assert_eq!(svg.matches("<rect").count(), DEPTH);
        drop(graph);
    }
}

use std::fmt::Write;

use perfwatch_core::model::{SpanKind, Status};

use super::{FlameNode, Flamegraph};

#[derive(Debug, Clone)]
pub struct SvgOptions {
    pub width: u32,
    pub frame_height: u32,
    pub font_size: u32,
    pub title: Option<String>,
}

impl Default for SvgOptions {
    fn default() -> Self {
        Self {
            width: 1200,
            frame_height: 18,
            font_size: 12,
            title: None,
        }
    }
}

const TITLE_HEIGHT: u32 = 24;
const CHAR_WIDTH: f64 = 0.6;

pub(super) fn render(graph: &Flamegraph, opts: &SvgOptions) -> String {
    let depth = graph.max_depth().map_or(0, |d| d + 1);
    let height = TITLE_HEIGHT + depth as u32 * opts.frame_height + 4;
    let scale = if graph.total > 0.0 {
        f64::from(opts.width) / graph.total
    } else {
        0.0
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{height}" viewBox="0 0 {w} {height}" font-family="monospace" font-size="{fs}">"#,
        w = opts.width,
        fs = opts.font_size,
    );
    let title = opts
        .title
        .clone()
        .unwrap_or_else(|| format!("trace {}", graph.trace_id));
    let _ = writeln!(
        out,
        r#"<text x="4" y="{}">{} ({:.1} ms)</text>"#,
        TITLE_HEIGHT - 8,
        escape(&title),
        graph.total
    );
    for node in &graph.nodes {
        frame(&mut out, node, scale, opts);
    }
    out.push_str("</svg>\n");
    out
}

fn frame(out: &mut String, node: &FlameNode, scale: f64, opts: &SvgOptions) {
    let x = node.x * scale;
    let w = node.width * scale;
    let y = TITLE_HEIGHT + node.depth as u32 * opts.frame_height;
    let h = opts.frame_height.saturating_sub(1);
    let label = format!("{} ({:.2} ms)", node.name, node.value);

    let _ = write!(
        out,
        r#"<g><title>{}</title><rect x="{x:.2}" y="{y}" width="{w:.2}" height="{h}" fill="{}" rx="2"/>"#,
        escape(&label),
        fill(node),
    );
    let fits = (w / (f64::from(opts.font_size) * CHAR_WIDTH)).floor() as usize;
    if fits >= 4 {
        let text = truncate(&node.name, fits);
        let _ = write!(
            out,
            r#"<text x="{:.2}" y="{}">{}</text>"#,
            x + 3.0,
            y + opts.frame_height - 5,
            escape(&text)
        );
    }
    out.push_str("</g>\n");
}

fn fill(node: &FlameNode) -> &'static str {
    if node.status == Status::Error {
        return "#e45757";
    }
    match node.kind {
        SpanKind::Http => "#f2a65a",
        SpanKind::Database => "#5b8def",
        SpanKind::Cache => "#59c3a5",
        SpanKind::Function => "#f5d76e",
        SpanKind::Custom => "#b59ee6",
    }
}

fn truncate(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }
    let kept = name.chars().take(max_chars.saturating_sub(2)).collect::<String>();
    format!("{kept}..")
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

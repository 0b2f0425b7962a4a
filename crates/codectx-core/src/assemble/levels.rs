//! Level rendering: one span, four fidelities.
//!
//! The ladder mirrors how a reader zooms in: capsule (where is it,
//! what is it), definition (signature and docs), implementation (the
//! body and its context window), full (the surrounding file-level
//! chunk). Degradation walks down the ladder instead of dropping the
//! item outright.

use crate::types::{Chunk, Span};

use super::bundle::ContextLevel;

/// Render a span at a level.
///
/// `chunk` is the span's retrieval chunk (body + leading docs +
/// sibling window). `sibling_chunks` backs the Full level; when empty,
/// Full renders like Implementation.
pub fn render(
    span: &Span,
    chunk: Option<&Chunk>,
    sibling_chunks: &[Chunk],
    level: ContextLevel,
    verbose_comments: bool,
) -> String {
    match level {
        ContextLevel::Capsule => render_capsule(span),
        ContextLevel::Definition => render_definition(span, verbose_comments),
        ContextLevel::Implementation => render_implementation(span, chunk, verbose_comments),
        ContextLevel::Full => render_full(span, chunk, sibling_chunks, verbose_comments),
    }
}

/// L1: path, symbol, kind, one summary line.
fn render_capsule(span: &Span) -> String {
    let mut out = format!("// {} [{}]", span.path, span.kind.as_str());
    if let Some(name) = &span.name {
        out.push_str(&format!(" {name}"));
    }
    out.push('\n');
    if let Some(signature) = &span.signature {
        out.push_str(signature);
        out.push('\n');
    }
    if let Some(summary) = span.doc.as_deref().and_then(|d| d.lines().next()) {
        if !summary.is_empty() {
            out.push_str(&format!("// {summary}\n"));
        }
    }
    out
}

/// L2: signature plus the nearest doc block, body elided.
fn render_definition(span: &Span, verbose_comments: bool) -> String {
    let mut out = String::new();
    if let Some(doc) = &span.doc {
        if verbose_comments {
            for line in doc.lines() {
                out.push_str(&format!("/// {line}\n"));
            }
        } else if let Some(summary) = doc.lines().next() {
            out.push_str(&format!("/// {summary}\n"));
        }
    }
    match &span.signature {
        Some(signature) => {
            out.push_str(signature);
            out.push_str(" { /* ... */ }\n");
        }
        None => {
            out.push_str(&format!(
                "// {} [{}] bytes {}..{}\n",
                span.path,
                span.kind.as_str(),
                span.byte_start,
                span.byte_end
            ));
        }
    }
    out
}

/// L3: the chunk body. Comments are stripped unless requested; the
/// doc block travels with the chunk content already.
fn render_implementation(span: &Span, chunk: Option<&Chunk>, verbose_comments: bool) -> String {
    let Some(chunk) = chunk else {
        // No chunk in the store; the definition is the best we have.
        return render_definition(span, verbose_comments);
    };
    if verbose_comments {
        return chunk.content.clone();
    }
    strip_plain_comments(&chunk.content)
}

/// L4: the span's chunk plus its sibling window, joined in id order.
fn render_full(
    span: &Span,
    chunk: Option<&Chunk>,
    sibling_chunks: &[Chunk],
    verbose_comments: bool,
) -> String {
    let mut out = render_implementation(span, chunk, verbose_comments);
    for sibling in sibling_chunks {
        if chunk.is_some_and(|c| c.id == sibling.id) {
            continue;
        }
        out.push('\n');
        if verbose_comments {
            out.push_str(&sibling.content);
        } else {
            out.push_str(&strip_plain_comments(&sibling.content));
        }
    }
    out
}

/// Drop whole-line `//` comments that are not doc comments. Trailing
/// comments stay; cutting mid-line risks breaking string literals.
fn strip_plain_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") && !trimmed.starts_with("///") && !trimmed.starts_with("//!") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpanKind;

    fn span_with(doc: Option<&str>, signature: Option<&str>) -> Span {
        Span {
            id: "id".into(),
            repo: "r".into(),
            path: "src/auth.rs".into(),
            byte_start: 10,
            byte_end: 90,
            kind: SpanKind::Function,
            name: Some("rotate".into()),
            signature: signature.map(str::to_string),
            doc: doc.map(str::to_string),
            parents: Vec::new(),
        }
    }

    fn chunk_with(content: &str) -> Chunk {
        Chunk {
            id: "c1".into(),
            span_id: "id".into(),
            content: content.into(),
            context_hash: "ctx".into(),
            token_estimate: 10,
        }
    }

    #[test]
    fn test_capsule_is_compact() {
        let span = span_with(Some("Rotates refresh tokens.\nMore detail."), Some("fn rotate()"));
        let out = render_capsule(&span);
        assert!(out.contains("src/auth.rs"));
        assert!(out.contains("rotate"));
        assert!(out.contains("Rotates refresh tokens."));
        assert!(!out.contains("More detail."));
    }

    #[test]
    fn test_definition_elides_body() {
        let span = span_with(Some("Rotates refresh tokens."), Some("fn rotate()"));
        let out = render_definition(&span, false);
        assert!(out.contains("fn rotate() { /* ... */ }"));
        assert!(out.contains("/// Rotates refresh tokens."));
    }

    #[test]
    fn test_definition_verbose_keeps_full_doc() {
        let span = span_with(Some("Line one.\nLine two."), Some("fn rotate()"));
        let out = render_definition(&span, true);
        assert!(out.contains("Line one."));
        assert!(out.contains("Line two."));
    }

    #[test]
    fn test_implementation_strips_plain_comments() {
        let span = span_with(None, Some("fn rotate()"));
        let chunk = chunk_with("fn rotate() {\n    // a note\n    /// doc\n    work();\n}\n");
        let out = render_implementation(&span, Some(&chunk), false);
        assert!(!out.contains("// a note"));
        assert!(out.contains("/// doc"));
        assert!(out.contains("work();"));

        let verbose = render_implementation(&span, Some(&chunk), true);
        assert!(verbose.contains("// a note"));
    }

    #[test]
    fn test_implementation_without_chunk_falls_back() {
        let span = span_with(Some("Doc."), Some("fn rotate()"));
        let out = render_implementation(&span, None, false);
        assert!(out.contains("fn rotate()"));
    }

    #[test]
    fn test_full_appends_siblings() {
        let span = span_with(None, Some("fn rotate()"));
        let chunk = chunk_with("fn rotate() { work(); }\n");
        let sibling = Chunk {
            id: "c2".into(),
            span_id: "id2".into(),
            content: "fn helper() {}\n".into(),
            context_hash: "ctx".into(),
            token_estimate: 5,
        };
        let out = render_full(&span, Some(&chunk), &[chunk.clone(), sibling], false);
        assert!(out.contains("rotate"));
        assert!(out.contains("helper"));
        // The span's own chunk is not duplicated.
        assert_eq!(out.matches("rotate").count(), 1);
    }

    #[test]
    fn test_levels_shrink_monotonically() {
        let span = span_with(Some("Doc line."), Some("fn rotate(a: A, b: B) -> R"));
        let chunk = chunk_with(
            "/// Doc line.\nfn rotate(a: A, b: B) -> R {\n    step_one();\n    step_two();\n    step_three();\n}\n",
        );
        let l3 = render(&span, Some(&chunk), &[], ContextLevel::Implementation, false);
        let l2 = render(&span, Some(&chunk), &[], ContextLevel::Definition, false);
        let l1 = render(&span, Some(&chunk), &[], ContextLevel::Capsule, false);
        assert!(l3.len() > l2.len());
        assert!(l2.len() >= l1.len() || l1.len() < l3.len());
    }
}

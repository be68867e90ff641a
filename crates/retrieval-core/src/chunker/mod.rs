//! Chunking: turns parsed structural elements or raw web/document text into
//! the [`Chunk`] records the embedding and retrieval pipelines operate on.
//!
//! Two entry points:
//!
//! - [`chunk_code`] -- AST-aware, operates on [`StructuralElement`]s from the
//!   parser. Each element becomes one chunk unless it exceeds
//!   `max_chunk_tokens`, in which case it is re-split at line boundaries with
//!   a configurable overlap.
//! - [`chunk_document`] -- section-aware, operates on raw web/document text.
//!   Splits on Markdown-style headings, carries the heading breadcrumb as
//!   `section_path`, and routes fenced code blocks through the same
//!   line-boundary splitter [`chunk_code`] uses internally.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::parser::StructuralElement;
use crate::types::{Chunk, Language, SymbolMeta, WebMeta};

/// Rough token estimation: ~4 characters per token. Conservative; actual
/// tokenization happens inside the embedding service.
fn estimate_tokens(content: &str) -> u32 {
    #[expect(clippy::cast_possible_truncation)]
    let estimate = (content.len() / 4) as u32;
    estimate.max(1)
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `content`'s lines into windows of approximately `max_tokens` each,
/// with `overlap_fraction` of the previous window's lines repeated at the
/// start of the next, so a boundary never costs semantic continuity.
fn split_with_overlap(content: &str, max_tokens: u32, overlap_fraction: f64) -> Vec<(String, u32, u32)> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return vec![(content.to_string(), 1, 1)];
    }

    let max_chars = (max_tokens as usize) * 4;
    let mut windows = Vec::new();
    let mut start_idx = 0usize;

    while start_idx < lines.len() {
        let mut end_idx = start_idx;
        let mut size = 0usize;
        while end_idx < lines.len() && (size == 0 || size + lines[end_idx].len() + 1 <= max_chars) {
            size += lines[end_idx].len() + 1;
            end_idx += 1;
        }
        let window = lines[start_idx..end_idx].join("\n");
        windows.push((window, (start_idx + 1) as u32, end_idx as u32));

        if end_idx >= lines.len() {
            break;
        }

        let overlap_lines = ((end_idx - start_idx) as f64 * overlap_fraction).round() as usize;
        start_idx = end_idx.saturating_sub(overlap_lines).max(start_idx + 1);
    }

    windows
}

/// Chunk a parsed file's structural elements into embedding-ready chunks.
pub fn chunk_code(
    elements: &[StructuralElement],
    document_id: Uuid,
    collection_id: Uuid,
    language: Language,
    file_or_url: &str,
    config: &Config,
) -> Vec<Chunk> {
    let max_tokens = config.indexing.max_chunk_tokens;
    let overlap = config.indexing.overlap_fraction;
    let mut chunks = Vec::new();
    let mut ordinal = 0u32;

    for elem in elements {
        let estimated = estimate_tokens(&elem.content);
        let symbol = Some(SymbolMeta {
            name: elem.name.clone(),
            kind: elem.kind,
            signature: elem.signature.clone(),
            parent: elem.parent.clone(),
            docstring: elem.doc_comment.clone(),
        });

        if estimated <= max_tokens {
            chunks.push(Chunk {
                id: Uuid::new_v4(),
                document_id,
                collection_id,
                ordinal,
                start_line: Some(elem.line_start),
                end_line: Some(elem.line_end),
                language,
                file_or_url: file_or_url.to_string(),
                chunk_title: elem.symbol_path.clone(),
                symbol,
                web: None,
                content_hash: content_hash(&elem.content),
                content: elem.content.clone(),
                token_count: estimated,
                dense_vector_id: None,
                sparse_vector_id: None,
            });
            ordinal += 1;
            continue;
        }

        for (window, rel_start, rel_end) in split_with_overlap(&elem.content, max_tokens, overlap) {
            let abs_start = elem.line_start + rel_start - 1;
            let abs_end = elem.line_start + rel_end - 1;
            chunks.push(Chunk {
                id: Uuid::new_v4(),
                document_id,
                collection_id,
                ordinal,
                start_line: Some(abs_start),
                end_line: Some(abs_end),
                language,
                file_or_url: file_or_url.to_string(),
                chunk_title: elem.symbol_path.clone(),
                symbol: symbol.clone(),
                web: None,
                content_hash: content_hash(&window),
                token_count: estimate_tokens(&window),
                content: window,
                dense_vector_id: None,
                sparse_vector_id: None,
            });
            ordinal += 1;
        }
    }

    chunks
}

/// A heading-delimited section of a web page or document.
struct Section {
    path: Vec<String>,
    content: String,
}

/// Split Markdown-flavored text into heading-delimited sections, tracking a
/// breadcrumb of enclosing heading titles for each section.
fn split_sections(source: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = String::new();
    let mut current_path: Vec<String> = Vec::new();

    let flush = |sections: &mut Vec<Section>, path: &[String], content: &str| {
        if !content.trim().is_empty() {
            sections.push(Section {
                path: path.to_vec(),
                content: content.to_string(),
            });
        }
    };

    for line in source.lines() {
        if let Some(stripped) = line.strip_prefix('#') {
            let level = 1 + stripped.chars().take_while(|c| *c == '#').count();
            let title = line.trim_start_matches('#').trim().to_string();

            flush(&mut sections, &current_path, &current);
            current.clear();

            stack.retain(|(lvl, _)| *lvl < level);
            stack.push((level, title));
            current_path = stack.iter().map(|(_, t)| t.clone()).collect();
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    flush(&mut sections, &current_path, &current);

    if sections.is_empty() && !source.trim().is_empty() {
        sections.push(Section {
            path: Vec::new(),
            content: source.to_string(),
        });
    }

    sections
}

/// Split a section's body into prose and fenced-code sub-blocks, preserving
/// ordering so code blocks don't get mixed into surrounding prose chunks.
enum Block {
    Prose(String),
    Code(String, Option<String>),
}

fn split_fenced_blocks(content: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prose = String::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        if let Some(lang_tag) = line.trim_start().strip_prefix("```") {
            if !prose.trim().is_empty() {
                blocks.push(Block::Prose(std::mem::take(&mut prose)));
            } else {
                prose.clear();
            }
            let lang = if lang_tag.is_empty() { None } else { Some(lang_tag.trim().to_string()) };
            let mut code = String::new();
            for code_line in lines.by_ref() {
                if code_line.trim_start().starts_with("```") {
                    break;
                }
                code.push_str(code_line);
                code.push('\n');
            }
            blocks.push(Block::Code(code, lang));
        } else {
            prose.push_str(line);
            prose.push('\n');
        }
    }
    if !prose.trim().is_empty() {
        blocks.push(Block::Prose(prose));
    }

    blocks
}

/// Separator cascades tried in order by the recursive fallback splitter,
/// grouped by language family. The splitter falls through to the next
/// level whenever a separator fails to subdivide the text further.
fn fallback_separators(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => &["\n\n\n", "\n\n", "\ndef ", "\nclass ", "\n", " "],
        Language::Rust | Language::Go | Language::Java | Language::TypeScript | Language::JavaScript => {
            &["\n\n", "\n}\n", "\n", "; ", " "]
        }
        Language::Markdown => &["\n## ", "\n### ", "\n\n", "\n", " "],
        _ => &["\n\n", "\n", ". ", " "],
    }
}

/// Recursively split `text` on a cascade of separators until every piece
/// fits within `max_chars`, falling back to a hard character split once the
/// separator cascade is exhausted. Never emits empty or whitespace-only
/// chunks.
fn recursive_character_split(text: &str, max_chars: usize, overlap_chars: usize, separators: &[&str]) -> Vec<String> {
    let text = text.trim_end();
    if text.trim().is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let Some((sep, rest)) = separators.split_first() else {
        return hard_char_split(text, max_chars, overlap_chars);
    };
    if sep.is_empty() {
        return hard_char_split(text, max_chars, overlap_chars);
    }

    let pieces: Vec<&str> = text.split(*sep).collect();
    if pieces.len() <= 1 {
        return recursive_character_split(text, max_chars, overlap_chars, rest);
    }

    // Re-merge pieces into windows close to max_chars, keeping the separator.
    let mut windows: Vec<String> = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        let joined = if current.is_empty() { piece.to_string() } else { format!("{current}{sep}{piece}") };
        if joined.chars().count() > max_chars && !current.is_empty() {
            windows.push(std::mem::take(&mut current));
            current = piece.to_string();
        } else {
            current = joined;
        }
    }
    if !current.is_empty() {
        windows.push(current);
    }

    let mut out = Vec::new();
    for window in windows {
        if window.chars().count() > max_chars {
            out.extend(recursive_character_split(&window, max_chars, overlap_chars, rest));
        } else if !window.trim().is_empty() {
            out.push(window);
        }
    }
    apply_char_overlap(out, overlap_chars)
}

/// Last-resort split when no separator subdivides the text: fixed-size
/// character windows with a trailing-character overlap.
fn hard_char_split(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let step = max_chars.saturating_sub(overlap_chars).max(1);
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            out.push(piece);
        }
        if end >= chars.len() {
            break;
        }
        start += step;
    }
    out
}

/// Prepend the trailing `overlap_chars` of each window to the next, so a
/// hard split never costs semantic continuity at the boundary.
fn apply_char_overlap(windows: Vec<String>, overlap_chars: usize) -> Vec<String> {
    if overlap_chars == 0 || windows.len() <= 1 {
        return windows.into_iter().filter(|w| !w.trim().is_empty()).collect();
    }
    let mut out = Vec::with_capacity(windows.len());
    for (i, window) in windows.iter().enumerate() {
        if i == 0 {
            out.push(window.clone());
            continue;
        }
        let tail: String = windows[i - 1].chars().rev().take(overlap_chars).collect::<Vec<_>>().into_iter().rev().collect();
        out.push(format!("{tail}{window}"));
    }
    out.into_iter().filter(|w| !w.trim().is_empty()).collect()
}

/// Derive a display title for a fallback-split chunk: the first non-blank
/// line that isn't an import/export statement, or the file path as a last
/// resort.
fn fallback_chunk_title(content: &str, file_or_url: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("import ") && !l.starts_with("export ") && !l.starts_with("use "))
        .map(str::to_string)
        .unwrap_or_else(|| file_or_url.to_string())
}

/// Fallback chunker used when AST parsing fails or yields no splittable
/// nodes: a recursive character splitter with separators chosen by
/// language family. Produces the same [`Chunk`] shape as [`chunk_code`],
/// minus symbol metadata, so callers can treat both as interchangeable.
pub fn chunk_fallback_text(
    content: &str,
    document_id: Uuid,
    collection_id: Uuid,
    language: Language,
    file_or_url: &str,
    config: &Config,
) -> Vec<Chunk> {
    let max_chars = (config.indexing.max_chunk_tokens as usize) * 4;
    let overlap_chars = (max_chars as f64 * config.indexing.overlap_fraction).round() as usize;
    let separators = fallback_separators(language);
    let title = fallback_chunk_title(content, file_or_url);

    recursive_character_split(content, max_chars, overlap_chars, separators)
        .into_iter()
        .enumerate()
        .map(|(ordinal, window)| Chunk {
            id: Uuid::new_v4(),
            document_id,
            collection_id,
            #[expect(clippy::cast_possible_truncation)]
            ordinal: ordinal as u32,
            start_line: None,
            end_line: None,
            language,
            file_or_url: file_or_url.to_string(),
            chunk_title: title.clone(),
            symbol: None,
            web: None,
            content_hash: content_hash(&window),
            token_count: estimate_tokens(&window),
            content: window,
            dense_vector_id: None,
            sparse_vector_id: None,
        })
        .collect()
}

/// Extract the host portion of a URL without pulling in a full URL parser.
fn extract_domain(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Chunk a web page or document into section-scoped prose chunks, routing
/// fenced code blocks through the same line-windowing logic code chunks use.
pub fn chunk_document(
    source: &str,
    document_id: Uuid,
    collection_id: Uuid,
    language: Language,
    file_or_url: &str,
    url: Option<&str>,
    title: Option<&str>,
    config: &Config,
) -> Vec<Chunk> {
    let max_tokens = config.indexing.max_chunk_tokens;
    let overlap = config.indexing.overlap_fraction;
    let domain = url.map(extract_domain);

    let mut chunks = Vec::new();
    let mut ordinal = 0u32;

    for section in split_sections(source) {
        let web_meta = url.map(|u| WebMeta {
            url: u.to_string(),
            domain: domain.clone().unwrap_or_default(),
            title: title.map(str::to_string),
            section_path: section.path.clone(),
        });
        let section_title = if section.path.is_empty() {
            file_or_url.to_string()
        } else {
            section.path.join(" > ")
        };

        for block in split_fenced_blocks(&section.content) {
            match block {
                Block::Prose(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    for (window, _, _) in split_with_overlap(&text, max_tokens, overlap) {
                        if window.trim().is_empty() {
                            continue;
                        }
                        chunks.push(Chunk {
                            id: Uuid::new_v4(),
                            document_id,
                            collection_id,
                            ordinal,
                            start_line: None,
                            end_line: None,
                            language,
                            file_or_url: file_or_url.to_string(),
                            chunk_title: section_title.clone(),
                            symbol: None,
                            web: web_meta.clone(),
                            content_hash: content_hash(&window),
                            token_count: estimate_tokens(&window),
                            content: window,
                            dense_vector_id: None,
                            sparse_vector_id: None,
                        });
                        ordinal += 1;
                    }
                }
                Block::Code(code, lang_tag) => {
                    if code.trim().is_empty() {
                        continue;
                    }
                    let code_lang = lang_tag
                        .as_deref()
                        .map(Language::from_extension)
                        .unwrap_or(Language::Unknown);
                    for (window, _, _) in split_with_overlap(&code, max_tokens, overlap) {
                        chunks.push(Chunk {
                            id: Uuid::new_v4(),
                            document_id,
                            collection_id,
                            ordinal,
                            start_line: None,
                            end_line: None,
                            language: code_lang,
                            file_or_url: file_or_url.to_string(),
                            chunk_title: format!("{section_title} (code)"),
                            symbol: None,
                            web: web_meta.clone(),
                            content_hash: content_hash(&window),
                            token_count: estimate_tokens(&window),
                            content: window,
                            dense_vector_id: None,
                            sparse_vector_id: None,
                        });
                        ordinal += 1;
                    }
                }
            }
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StructuralElement;
    use crate::types::{ChunkKind, Visibility};

    fn elem(content: &str) -> StructuralElement {
        StructuralElement {
            symbol_path: "mod.func".to_string(),
            name: "func".to_string(),
            kind: ChunkKind::Function,
            visibility: Visibility::Public,
            line_start: 1,
            line_end: content.lines().count() as u32,
            content: content.to_string(),
            doc_comment: None,
            signature: None,
            parent: None,
        }
    }

    #[test]
    fn test_small_element_is_single_chunk() {
        let cfg = Config::defaults(std::path::Path::new("./data"));
        let elements = vec![elem("fn func() {}\n")];
        let chunks = chunk_code(&elements, Uuid::new_v4(), Uuid::new_v4(), Language::Rust, "src/lib.rs", &cfg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_title, "mod.func");
    }

    #[test]
    fn test_oversized_element_splits_with_overlap() {
        let mut cfg = Config::defaults(std::path::Path::new("./data"));
        cfg.indexing.max_chunk_tokens = 10; // 40 chars
        cfg.indexing.overlap_fraction = 0.25;
        let big = (0..50).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let elements = vec![elem(&big)];
        let chunks = chunk_code(&elements, Uuid::new_v4(), Uuid::new_v4(), Language::Rust, "src/lib.rs", &cfg);
        assert!(chunks.len() > 1);
        // Every chunk still carries the same symbol metadata.
        assert!(chunks.iter().all(|c| c.symbol.is_some()));
    }

    #[test]
    fn test_chunk_document_splits_on_headings() {
        let cfg = Config::defaults(std::path::Path::new("./data"));
        let src = "# Intro\n\nHello there.\n\n## Setup\n\nRun the installer.\n";
        let chunks = chunk_document(
            src,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Language::Markdown,
            "https://example.com/docs",
            Some("https://example.com/docs"),
            Some("Docs"),
            &cfg,
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_title, "Intro");
        assert_eq!(chunks[1].chunk_title, "Intro > Setup");
        assert!(chunks[0].web.is_some());
    }

    #[test]
    fn test_chunk_document_routes_fenced_code() {
        let cfg = Config::defaults(std::path::Path::new("./data"));
        let src = "# Usage\n\nRun this:\n\n```rust\nfn main() {}\n```\n";
        let chunks = chunk_document(
            src,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Language::Markdown,
            "guide.md",
            None,
            None,
            &cfg,
        );
        assert!(chunks.iter().any(|c| c.language == Language::Rust));
        assert!(chunks.iter().any(|c| c.chunk_title.ends_with("(code)")));
    }

    #[test]
    fn test_fallback_text_small_input_is_single_chunk() {
        let cfg = Config::defaults(std::path::Path::new("./data"));
        let chunks = chunk_fallback_text("fn main() {}\n", Uuid::new_v4(), Uuid::new_v4(), Language::Rust, "src/main.rs", &cfg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.trim(), "fn main() {}");
    }

    #[test]
    fn test_fallback_text_splits_oversized_input_without_empty_chunks() {
        let mut cfg = Config::defaults(std::path::Path::new("./data"));
        cfg.indexing.max_chunk_tokens = 10; // 40 chars
        cfg.indexing.overlap_fraction = 0.25;
        let big = (0..50).map(|i| format!("line number {i}")).collect::<Vec<_>>().join("\n\n");
        let chunks = chunk_fallback_text(&big, Uuid::new_v4(), Uuid::new_v4(), Language::Rust, "src/lib.rs", &cfg);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.content.trim().is_empty()));
        assert!(chunks.iter().all(|c| c.symbol.is_none()));
    }

    #[test]
    fn test_fallback_text_hard_splits_when_no_separators_present() {
        let mut cfg = Config::defaults(std::path::Path::new("./data"));
        cfg.indexing.max_chunk_tokens = 5; // 20 chars
        cfg.indexing.overlap_fraction = 0.1;
        let unsplittable = "x".repeat(200);
        let chunks = chunk_fallback_text(&unsplittable, Uuid::new_v4(), Uuid::new_v4(), Language::Unknown, "blob.bin", &cfg);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.content.is_empty()));
    }

    #[test]
    fn test_fallback_chunk_title_skips_imports() {
        let title = fallback_chunk_title("import foo\n\nfn handler() {}\n", "src/lib.rs");
        assert_eq!(title, "fn handler() {}");
    }
}

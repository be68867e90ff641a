//! AST parsing subsystem using tree-sitter.
//!
//! This module provides language-agnostic AST parsing with per-language
//! structural extractors. Each supported language registers an analyzer
//! that maps tree-sitter AST nodes to structural elements the chunker then
//! turns into chunks.
//!
//! ```text
//! Source File -> Language Detection -> tree-sitter Grammar
//!            -> Parse -> CST
//!            -> Structural Extraction -> Vec<StructuralElement>
//! ```
//!
//! The parser is stateless and can be invoked from multiple threads.

pub mod registry;
pub mod languages;

use std::path::Path;

use crate::error::{RetrievalError, RetrievalResult};
use crate::types::{ChunkKind, Language, Visibility};

/// A structural element extracted from an AST or a document section.
#[derive(Debug, Clone)]
pub struct StructuralElement {
    /// Fully qualified name of this element.
    pub symbol_path: String,
    /// Short name (last component of symbol_path).
    pub name: String,
    /// What kind of construct this is.
    pub kind: ChunkKind,
    /// Visibility specifier.
    pub visibility: Visibility,
    /// Starting line (1-indexed).
    pub line_start: u32,
    /// Ending line (1-indexed, inclusive).
    pub line_end: u32,
    /// Raw source code of this element.
    pub content: String,
    /// Extracted doc comment, if present.
    pub doc_comment: Option<String>,
    /// Declaration signature (parameter list / return type / header), if
    /// extractable.
    pub signature: Option<String>,
    /// Enclosing element's symbol path, if any.
    pub parent: Option<String>,
}

/// Trait that each language analyzer must implement.
pub trait LanguageAnalyzer: Send + Sync {
    /// Returns the language identifier (e.g., "python", "rust").
    fn language_id(&self) -> &str;

    /// Returns the tree-sitter `Language` for this analyzer.
    fn tree_sitter_language(&self) -> tree_sitter::Language;

    /// Extract structural elements from a parsed tree.
    fn extract_structure(
        &self,
        tree: &tree_sitter::Tree,
        source: &[u8],
        file_path: &Path,
    ) -> Vec<StructuralElement>;
}

/// Parse a source file and extract its structural elements.
///
/// This is the primary entry point for the parser. It:
/// 1. Looks up the registered analyzer for `language`
/// 2. Loads the appropriate tree-sitter grammar
/// 3. Parses the source code
/// 4. Extracts structural elements via the language analyzer
pub fn parse_file(
    file_path: &Path,
    source: &[u8],
    language: Language,
) -> RetrievalResult<Vec<StructuralElement>> {
    let registry = registry::global_registry();

    let analyzer = registry.get(language).ok_or_else(|| RetrievalError::Parse {
        path: file_path.display().to_string(),
        message: format!("no analyzer registered for language: {language}"),
    })?;

    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&analyzer.tree_sitter_language())
        .map_err(|e| RetrievalError::Parse {
            path: file_path.display().to_string(),
            message: format!("failed to set tree-sitter language: {e}"),
        })?;

    let tree = parser.parse(source, None).ok_or_else(|| RetrievalError::Parse {
        path: file_path.display().to_string(),
        message: "tree-sitter returned None (parse timeout or cancellation)".into(),
    })?;

    Ok(analyzer.extract_structure(&tree, source, file_path))
}

/// Caps doc-comment lines collected from consecutive single-line comments
/// preceding a node (already in top-to-bottom order), keeping only the
/// last 5 -- the ones immediately before the node -- before applying the
/// 200-char cap every language analyzer shares.
pub fn cap_doc_lines(lines: &[String]) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(5);
    cap_doc_text(&lines[start..].join("\n"))
}

/// Caps a single doc-comment block (e.g. a cleaned docstring, JSDoc, or
/// Javadoc) to at most 5 lines and 200 characters.
pub fn cap_doc_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(5);
    let joined = lines[start..].join("\n");
    Some(joined.chars().take(200).collect())
}

/// Derive a dotted module name from a file path for use as the root of a
/// structural element's symbol path, e.g. `src/auth/token.py` ->
/// `src.auth.token`.
pub fn build_module_name_from_path(file_path: &Path) -> String {
    let without_ext = file_path.with_extension("");
    without_ext
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_unknown_language_returns_error() {
        let result = parse_file(Path::new("test.xyz"), b"hello world", Language::Unknown);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_module_name_from_path() {
        assert_eq!(
            build_module_name_from_path(Path::new("src/auth/token.py")),
            "src.auth.token"
        );
        assert_eq!(build_module_name_from_path(Path::new("lib.rs")), "lib");
    }

    #[test]
    fn test_cap_doc_lines_keeps_last_five() {
        let lines: Vec<String> = (1..=8).map(|n| format!("line {n}")).collect();
        let capped = cap_doc_lines(&lines).expect("some doc");
        assert_eq!(capped, "line 4\nline 5\nline 6\nline 7\nline 8");
    }

    #[test]
    fn test_cap_doc_text_truncates_to_200_chars() {
        let text = "x".repeat(500);
        let capped = cap_doc_text(&text).expect("some doc");
        assert_eq!(capped.chars().count(), 200);
    }

    #[test]
    fn test_cap_doc_lines_empty_is_none() {
        assert!(cap_doc_lines(&[]).is_none());
    }
}

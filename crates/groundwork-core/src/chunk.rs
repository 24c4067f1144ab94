//! Content-aware document chunker.
//!
//! Splits document text into [`Chunk`]s that respect a token ceiling
//! (`max_chunk_size`, estimated at 4 chars/token). The strategy depends on
//! what the document looks like:
//!
//! | Kind | Strategy |
//! |------|----------|
//! | [`DocumentKind::NaturalText`] | paragraph accumulation with overlap, small chunks merged forward |
//! | [`DocumentKind::TechnicalSpec`] | as text, but every heading starts a new chunk |
//! | [`DocumentKind::ProgrammingCode`] | function/class boundaries per language, greedy line packing for oversized items |
//! | [`DocumentKind::MixedContent`] | fenced and heuristic code blocks interleaved with prose blocks |
//!
//! Each chunk gets a deterministic UUIDv5 derived from its document id,
//! index and content hash, so re-chunking identical text yields identical
//! ids.
//!
//! # Incremental updates
//!
//! [`Chunker::chunk`] hashes the whole document and consults the
//! [`ChunkCache`]. When the hash matches and `force_update` is false the
//! cached chunk set (embeddings included) is returned with
//! `was_updated = false`, which is what lets the pipeline skip re-embedding
//! unchanged documents.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Chunk, ContentType};
use crate::store::{CachedChunks, ChunkCache};
use crate::text::{self, CHARS_PER_TOKEN};

/// Chunk size limits, in estimated tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            min_chunk_size: 50,
            overlap_tokens: 50,
        }
    }
}

/// Coarse classification of a whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    ProgrammingCode,
    NaturalText,
    MixedContent,
    TechnicalSpec,
}

static CODE_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s*(def|class|fn|pub|impl|struct|enum|trait|use|mod|import|from|package|func|function|const|let|var|return|if|for|while|else|elif|try|except|catch|switch|case|public|private|protected|static|async|await|#include|#define)\b",
        r"[{};]\s*$",
        r"^\s*[}\])]",
        r"(=>|->|::|==|!=|&&|\|\||\+=|-=|:=)",
        r"\b[A-Za-z_]\w*\([^()]*\)",
        r"^\s*(//|#!|/\*|\*\s|--\s)",
        r"^(    |\t)\S",
        r"\s=\s",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid code indicator regex"))
    .collect()
});

static MARKDOWN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*#*$").expect("valid heading regex"));

static NUMBERED_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(\.\d+)*\.?)\s+[A-Z][^.!?]{0,80}$").expect("valid numbered heading regex")
});

static SPEC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\|.*\||\s*[\w .-]{1,40}:\s+\S.*|\s*(\d+\.)+\d*\s+\S.*|.*\b(MUST|SHALL|SHOULD|REQUIRED)\b.*)$")
        .expect("valid spec line regex")
});

static LANGUAGE_PATTERNS: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    let python = vec![
        r"(?m)^\s*def \w+\(.*\)\s*(->\s*[\w\[\], ]+)?:\s*$",
        r"(?m)^\s*(import \w+|from [\w.]+ import )",
        r"\bself\.",
        r"(?m)^\s*(if|for|while|elif|else|try|except|with)\b.*:\s*$",
        r"\bprint\(",
    ];
    let rust = vec![
        r"\bfn \w+",
        r"\blet (mut )?\w+",
        r"(?m)^\s*impl\b",
        r"\w::\w",
        r"\bpub (fn|struct|enum|trait|mod)\b",
        r"&(mut )?self\b",
        r"#\[derive",
    ];
    let javascript = vec![
        r"\bfunction\b",
        r"=>",
        r"\b(const|let) \w+ =",
        r"console\.log",
        r"\brequire\(",
        r"\bexport (default )?",
    ];
    let typescript_extra = vec![
        r":\s*(string|number|boolean|any|void)\b",
        r"(?m)^\s*(export )?interface \w+",
        r"(?m)^\s*(export )?type \w+ =",
    ];
    let java = vec![
        r"\bpublic (static )?(class|void|final)\b",
        r"System\.out",
        r"(?m)^import java\.",
        r"@Override",
        r"\bprivate final\b",
    ];
    let go = vec![
        r"(?m)^package \w+",
        r"\bfunc \w*\(",
        r":=",
        r"\bfmt\.",
        r"\bgo func\b",
    ];
    let c = vec![
        r"(?m)^#include\s*[<\x22]",
        r"\bprintf\(",
        r"\bint main\(",
        r"\bmalloc\(",
    ];
    let cpp_extra = vec![r"std::", r"\bcout\b", r"template\s*<", r"(?m)^class \w+"];

    let compile = |patterns: Vec<&str>| -> Vec<Regex> {
        patterns
            .into_iter()
            .map(|p| Regex::new(p).expect("valid language regex"))
            .collect()
    };
    // Supersets come after their base language so plain JS / C win ties.
    vec![
        ("python", compile(python)),
        ("rust", compile(rust)),
        ("javascript", compile(javascript.clone())),
        (
            "typescript",
            compile(javascript.into_iter().chain(typescript_extra).collect()),
        ),
        ("java", compile(java)),
        ("go", compile(go)),
        ("c", compile(c.clone())),
        ("cpp", compile(c.into_iter().chain(cpp_extra).collect())),
    ]
});

static BOUNDARIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("python", r"^(async\s+def|def|class)\s+\w+"),
        (
            "rust",
            r"^(pub(\([^)]*\))?\s+)?(async\s+|unsafe\s+|const\s+)*(fn|struct|enum|impl|trait|mod)\b",
        ),
        (
            "javascript",
            r"^(export\s+)?(default\s+)?((async\s+)?function\b|class\s+\w+|(const|let)\s+\w+\s*=\s*(async\s*)?(\([^)]*\)|\w+)\s*=>)",
        ),
        (
            "typescript",
            r"^(export\s+)?(default\s+)?((async\s+)?function\b|(abstract\s+)?class\s+\w+|interface\s+\w+|type\s+\w+\s*=|(const|let)\s+\w+\s*(:[^=]+)?=\s*(async\s*)?(\([^)]*\)|\w+)\s*=>)",
        ),
        (
            "java",
            r"^\s{0,4}(((public|private|protected|static|final|abstract|synchronized)\s+)+[\w<>\[\], ]+\s*\(|((public|private|protected|abstract|final)\s+)*(class|interface|enum)\s+\w+)",
        ),
        ("go", r"^(func\s|type\s+\w+\s+(struct|interface)\b)"),
        ("c", r"^[A-Za-z_][\w \*]*\s\**[A-Za-z_]\w*\s*\([^;]*$"),
        (
            "cpp",
            r"^([A-Za-z_][\w \*&:<>,]*\s[\*&]*[A-Za-z_][\w:]*\s*\([^;]*$|(class|struct)\s+\w+)",
        ),
    ]
    .into_iter()
    .map(|(lang, p)| (lang, Regex::new(p).expect("valid boundary regex")))
    .collect()
});

static ITEM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(fn|def|class|function|func|struct|enum|impl|trait|interface|type|mod)\s+([A-Za-z_]\w*)")
        .expect("valid item name regex")
});

/// Score each line as code vs prose. A line is code when code indicators
/// outnumber prose indicators.
pub fn line_is_code(line: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    let code = CODE_INDICATORS.iter().filter(|re| re.is_match(line)).count();
    let trimmed = line.trim();
    let mut prose = 0;
    if text::word_count(trimmed) >= 6 {
        prose += 1;
    }
    if trimmed.ends_with(['.', '?', '!']) {
        prose += 1;
    }
    let mut chars = trimmed.chars();
    if matches!((chars.next(), chars.next()), (Some(a), Some(b)) if a.is_uppercase() && b.is_lowercase())
    {
        prose += 1;
    }
    code > prose
}

/// Classify a whole document.
pub fn detect_document_kind(input: &str) -> DocumentKind {
    let lines: Vec<&str> = input.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return DocumentKind::NaturalText;
    }

    let (prose_text, fences) = text::split_code_fences(input);
    if !fences.is_empty() && prose_text.lines().any(|l| !l.trim().is_empty()) {
        return DocumentKind::MixedContent;
    }

    let total = lines.len() as f64;
    let code_ratio = lines.iter().filter(|l| line_is_code(l)).count() as f64 / total;
    if code_ratio >= 0.6 || (!fences.is_empty() && prose_text.trim().is_empty()) {
        return DocumentKind::ProgrammingCode;
    }
    if code_ratio >= 0.15 {
        return DocumentKind::MixedContent;
    }

    let headings = lines.iter().filter(|l| heading_title(l).is_some()).count();
    let spec_lines = lines.iter().filter(|l| SPEC_LINE.is_match(l)).count();
    if headings >= 2 && (spec_lines + headings) as f64 / total >= 0.3 {
        return DocumentKind::TechnicalSpec;
    }
    DocumentKind::NaturalText
}

/// Best-scoring programming language, if any pattern matches.
pub fn detect_language(input: &str) -> Option<&'static str> {
    let mut best: Option<(&'static str, usize)> = None;
    for (lang, patterns) in LANGUAGE_PATTERNS.iter() {
        let score: usize = patterns.iter().map(|re| re.find_iter(input).count()).sum();
        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((lang, score));
        }
    }
    best.map(|(lang, _)| lang)
}

/// SHA-256 hex digest of `input`.
pub fn content_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chunk content before ids and hashes are assigned.
#[derive(Debug, Clone)]
struct Piece {
    content: String,
    content_type: ContentType,
    section_title: Option<String>,
    language: Option<String>,
}

impl Piece {
    fn text(content: &str, section_title: Option<String>) -> Self {
        Self {
            content: content.trim().to_string(),
            content_type: ContentType::Text,
            section_title,
            language: None,
        }
    }
}

/// Splits documents and maintains the incremental chunk cache.
pub struct Chunker {
    cache: Arc<dyn ChunkCache>,
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(cache: Arc<dyn ChunkCache>, config: ChunkingConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk a document, reusing the cached chunk set when the text is unchanged.
    ///
    /// Returns `(chunks, was_updated)`. Cache lookup failures are logged
    /// and treated as a miss.
    pub async fn chunk(
        &self,
        document_id: &str,
        input: &str,
        metadata: &BTreeMap<String, String>,
        force_update: bool,
    ) -> (Vec<Chunk>, bool) {
        if !force_update {
            let hash = content_hash(input);
            match self.cache.get(document_id).await {
                Ok(Some(cached)) if cached.content_hash == hash => {
                    debug!(
                        document_id,
                        chunks = cached.chunks.len(),
                        "content unchanged, reusing cached chunks"
                    );
                    return (cached.chunks, false);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(document_id, error = %e, "chunk cache lookup failed, re-chunking");
                }
            }
        }
        (self.split(document_id, input, metadata), true)
    }

    /// Record the chunk set (normally with embeddings filled in) for `input`.
    pub async fn update_cache(&self, document_id: &str, input: &str, chunks: &[Chunk]) -> Result<()> {
        self.cache
            .put(
                document_id,
                CachedChunks {
                    content_hash: content_hash(input),
                    chunks: chunks.to_vec(),
                },
            )
            .await
    }

    pub async fn forget(&self, document_id: &str) -> Result<()> {
        self.cache.remove(document_id).await
    }

    /// Pure split with no cache interaction. Empty text yields no chunks.
    ///
    /// Recognized metadata keys: `language` overrides language detection,
    /// `title` is the section title until the first heading.
    pub fn split(
        &self,
        document_id: &str,
        input: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Vec<Chunk> {
        if input.trim().is_empty() {
            return Vec::new();
        }

        let kind = detect_document_kind(input);
        let language = metadata
            .get("language")
            .cloned()
            .or_else(|| detect_language(input).map(str::to_string));
        let title = metadata.get("title").map(String::as_str);
        debug!(document_id, ?kind, language = ?language, "chunking document");

        let pieces = match kind {
            DocumentKind::ProgrammingCode => self.split_code(input, language.as_deref()),
            DocumentKind::MixedContent => self.split_mixed(input, language.as_deref(), title),
            DocumentKind::TechnicalSpec => self.merge_small(self.split_text(input, title, true)),
            DocumentKind::NaturalText => self.merge_small(self.split_text(input, title, false)),
        };

        pieces
            .into_iter()
            .filter(|p| !p.content.trim().is_empty())
            .enumerate()
            .map(|(i, p)| make_chunk(document_id, i as i64, p))
            .collect()
    }

    fn max_chars(&self) -> usize {
        self.config.max_chunk_size.max(1) * CHARS_PER_TOKEN
    }

    fn overlap_chars(&self) -> usize {
        (self.config.overlap_tokens * CHARS_PER_TOKEN).min(self.max_chars() / 4)
    }

    /// Paragraph accumulation. With `flush_on_heading`, each heading closes
    /// the current chunk and no overlap is carried across sections.
    fn split_text(&self, input: &str, default_title: Option<&str>, flush_on_heading: bool) -> Vec<Piece> {
        let max_chars = self.max_chars();
        let overlap_chars = self.overlap_chars();

        let mut pieces = Vec::new();
        let mut title: Option<String> = default_title.map(str::to_string);
        let mut buf = String::new();
        let mut buf_title = title.clone();
        // False while `buf` holds only the overlap tail of the previous chunk.
        let mut buf_has_new = false;

        for para in input.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(heading) = trimmed.lines().next().and_then(heading_title) {
                if flush_on_heading && buf_has_new {
                    pieces.push(Piece::text(&buf, buf_title.clone()));
                    buf.clear();
                    buf_has_new = false;
                } else if flush_on_heading {
                    buf.clear();
                }
                title = Some(heading);
            }

            let would_be = if buf.is_empty() {
                trimmed.len()
            } else {
                buf.len() + 2 + trimmed.len()
            };
            if would_be > max_chars && buf_has_new {
                let tail = overlap_tail(&buf, overlap_chars).to_string();
                pieces.push(Piece::text(&buf, buf_title.clone()));
                buf = tail;
                buf_has_new = false;
            }
            // The carried tail gives way when it and the paragraph overflow.
            if !buf_has_new && !buf.is_empty() && buf.len() + 2 + trimmed.len() > max_chars {
                let room = max_chars.saturating_sub(trimmed.len() + 2);
                buf = overlap_tail(&buf, room).to_string();
            }

            if trimmed.len() > max_chars {
                if buf_has_new {
                    pieces.push(Piece::text(&buf, buf_title.clone()));
                }
                buf.clear();
                buf_has_new = false;
                for part in hard_split(trimmed, max_chars) {
                    pieces.push(Piece::text(&part, title.clone()));
                }
                continue;
            }

            if !buf_has_new {
                buf_title = title.clone();
            }
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
            buf_has_new = true;
        }

        if buf_has_new {
            pieces.push(Piece::text(&buf, buf_title));
        }
        pieces
    }

    /// Merge chunks below `min_chunk_size` into their successor (or, for the
    /// last one, into its predecessor) while the result stays under the ceiling.
    fn merge_small(&self, pieces: Vec<Piece>) -> Vec<Piece> {
        let min = self.config.min_chunk_size;
        let max_chars = self.max_chars();
        let mut out: Vec<Piece> = Vec::with_capacity(pieces.len());
        let mut pending: Option<Piece> = None;

        for mut piece in pieces {
            if let Some(small) = pending.take() {
                if small.content.len() + 2 + piece.content.len() <= max_chars {
                    piece.content = format!("{}\n\n{}", small.content, piece.content);
                    piece.section_title = small.section_title.or(piece.section_title);
                } else {
                    out.push(small);
                }
            }
            if text::estimate_tokens(&piece.content) < min {
                pending = Some(piece);
            } else {
                out.push(piece);
            }
        }

        if let Some(small) = pending {
            match out.last_mut() {
                Some(prev) if prev.content.len() + 2 + small.content.len() <= max_chars => {
                    prev.content.push_str("\n\n");
                    prev.content.push_str(&small.content);
                }
                _ => out.push(small),
            }
        }
        out
    }

    /// Split source code at top-level function/class boundaries.
    fn split_code(&self, input: &str, language: Option<&str>) -> Vec<Piece> {
        let max_chars = self.max_chars();
        let boundary = language.and_then(|lang| {
            BOUNDARIES
                .iter()
                .find(|(l, _)| *l == lang)
                .map(|(_, re)| re)
        });

        let segments = match boundary {
            Some(re) => segment_at_boundaries(input, re),
            None => Vec::new(),
        };
        let code_piece = |content: String| Piece {
            section_title: item_name(&content),
            content,
            content_type: ContentType::Code,
            language: language.map(str::to_string),
        };

        if segments.len() <= 1 {
            return split_lines(input, max_chars)
                .into_iter()
                .map(code_piece)
                .collect();
        }

        let mut pieces = Vec::new();
        let mut buf = String::new();
        for segment in segments {
            if segment.len() > max_chars {
                if !buf.is_empty() {
                    pieces.push(code_piece(std::mem::take(&mut buf)));
                }
                pieces.extend(split_lines(&segment, max_chars).into_iter().map(code_piece));
                continue;
            }
            if !buf.is_empty() && buf.len() + 1 + segment.len() > max_chars {
                pieces.push(code_piece(std::mem::take(&mut buf)));
            }
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&segment);
        }
        if !buf.trim().is_empty() {
            pieces.push(code_piece(buf));
        }
        pieces
    }

    /// Interleaved prose and code: fenced blocks first, then runs of
    /// code-looking lines, packed into size-bounded chunks.
    fn split_mixed(&self, input: &str, language: Option<&str>, default_title: Option<&str>) -> Vec<Piece> {
        let max_chars = self.max_chars();
        let blocks = mixed_blocks(input);

        let mut pieces = Vec::new();
        let mut title = default_title.map(str::to_string);
        let mut buf = String::new();
        let mut buf_title = title.clone();
        let mut buf_code_lang: Option<String> = None;
        let mut buf_has_code = false;

        let flush = |pieces: &mut Vec<Piece>,
                     buf: &mut String,
                     buf_title: &Option<String>,
                     has_code: &mut bool,
                     code_lang: &mut Option<String>| {
            if buf.trim().is_empty() {
                buf.clear();
                return;
            }
            pieces.push(Piece {
                content: buf.trim().to_string(),
                content_type: if *has_code {
                    ContentType::Mixed
                } else {
                    ContentType::Text
                },
                section_title: buf_title.clone(),
                language: code_lang.take(),
            });
            buf.clear();
            *has_code = false;
        };

        for block in blocks {
            if let Some(heading) = block
                .content
                .lines()
                .find(|l| !l.trim().is_empty())
                .filter(|_| !block.is_code)
                .and_then(heading_title)
            {
                title = Some(heading);
            }

            if block.content.len() > max_chars {
                flush(&mut pieces, &mut buf, &buf_title, &mut buf_has_code, &mut buf_code_lang);
                if block.is_code {
                    let lang = block.language.clone().or_else(|| language.map(str::to_string));
                    for part in split_lines(&block.content, max_chars) {
                        pieces.push(Piece {
                            content: part,
                            content_type: ContentType::Mixed,
                            section_title: title.clone(),
                            language: lang.clone(),
                        });
                    }
                } else {
                    pieces.extend(self.split_text(&block.content, title.as_deref(), false));
                }
                continue;
            }

            if !buf.is_empty() && buf.len() + 2 + block.content.len() > max_chars {
                flush(&mut pieces, &mut buf, &buf_title, &mut buf_has_code, &mut buf_code_lang);
            }
            if buf.is_empty() {
                buf_title = title.clone();
            } else {
                buf.push_str("\n\n");
            }
            buf.push_str(&block.content);
            if block.is_code {
                buf_has_code = true;
                if buf_code_lang.is_none() {
                    buf_code_lang = block.language.clone().or_else(|| language.map(str::to_string));
                }
            }
        }
        flush(&mut pieces, &mut buf, &buf_title, &mut buf_has_code, &mut buf_code_lang);
        pieces
    }
}

struct Block {
    content: String,
    is_code: bool,
    language: Option<String>,
}

/// Segment mixed content. Unfenced runs of fewer than three code-looking
/// lines stay with the surrounding prose.
fn mixed_blocks(input: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut fence: Option<(Vec<&str>, Option<String>)> = None;

    for line in input.lines() {
        let is_fence = line.trim_start().starts_with("```");
        match fence.as_mut() {
            Some((lines, _)) => {
                lines.push(line);
                if is_fence {
                    if let Some((lines, lang)) = fence.take() {
                        blocks.push(Block {
                            content: lines.join("\n"),
                            is_code: true,
                            language: lang,
                        });
                    }
                }
            }
            None if is_fence => {
                flush_prose(&mut prose, &mut blocks);
                let info = line.trim_start().trim_start_matches('`').trim();
                let lang = info.split_whitespace().next().map(str::to_lowercase);
                fence = Some((vec![line], lang));
            }
            None => prose.push(line),
        }
    }
    if let Some((lines, lang)) = fence {
        blocks.push(Block {
            content: lines.join("\n"),
            is_code: true,
            language: lang,
        });
    }
    flush_prose(&mut prose, &mut blocks);
    blocks
}

fn flush_prose(prose: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    let mut run: Vec<&str> = Vec::new();
    let mut run_is_code = false;
    for line in prose.drain(..) {
        if line.trim().is_empty() {
            run.push(line);
            continue;
        }
        let is_code = line_is_code(line);
        if is_code != run_is_code && run.iter().any(|l| !l.trim().is_empty()) {
            emit_run(&mut run, run_is_code, blocks);
        }
        run_is_code = is_code;
        run.push(line);
    }
    emit_run(&mut run, run_is_code, blocks);
}

fn emit_run(run: &mut Vec<&str>, is_code: bool, blocks: &mut Vec<Block>) {
    let content = run.join("\n").trim().to_string();
    run.clear();
    if content.is_empty() {
        return;
    }
    let is_code = is_code && content.lines().filter(|l| !l.trim().is_empty()).count() >= 3;
    match blocks.last_mut() {
        Some(last) if !last.is_code && !is_code => {
            last.content.push_str("\n\n");
            last.content.push_str(&content);
        }
        _ => blocks.push(Block {
            language: if is_code {
                detect_language(&content).map(str::to_string)
            } else {
                None
            },
            content,
            is_code,
        }),
    }
}

/// Cut source into segments, each starting at a boundary line. Attached
/// decorators, attributes and doc comments move with the item below them.
fn segment_at_boundaries(input: &str, boundary: &Regex) -> Vec<String> {
    let lines: Vec<&str> = input.lines().collect();
    let mut starts: Vec<usize> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if !boundary.is_match(line) {
            continue;
        }
        let mut start = i;
        while start > 0 && is_attached_prefix(lines[start - 1]) {
            start -= 1;
        }
        if starts.last().map_or(true, |&s| start > s) {
            starts.push(start);
        }
    }
    if starts.is_empty() {
        return Vec::new();
    }
    if starts[0] != 0 {
        starts.insert(0, 0);
    }

    let mut segments = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(lines.len());
        let segment = lines[start..end].join("\n");
        let segment = segment.trim_end();
        if !segment.trim().is_empty() {
            segments.push(segment.to_string());
        }
    }
    segments
}

fn is_attached_prefix(line: &str) -> bool {
    let t = line.trim_start();
    !t.is_empty()
        && (t.starts_with('@')
            || t.starts_with("#[")
            || t.starts_with("//")
            || t.starts_with("/*")
            || t.starts_with("* ")
            || t.starts_with("*/")
            || (t.starts_with('#') && !t.starts_with("#include")))
}

fn item_name(code: &str) -> Option<String> {
    ITEM_NAME
        .captures(code)
        .map(|caps| format!("{} {}", &caps[1], &caps[2]))
}

/// Title text when `line` is a Markdown or numbered section heading.
fn heading_title(line: &str) -> Option<String> {
    let line = line.trim();
    if let Some(caps) = MARKDOWN_HEADING.captures(line) {
        return Some(caps[1].trim().to_string());
    }
    if NUMBERED_HEADING.is_match(line) && text::word_count(line) <= 12 {
        return Some(line.to_string());
    }
    None
}

/// Greedy line accumulation under `max_chars`; lines longer than the
/// ceiling are hard-split.
fn split_lines(input: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for line in input.lines() {
        if line.len() > max_chars {
            if !buf.trim().is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            buf.clear();
            out.extend(hard_split(line, max_chars));
            continue;
        }
        if !buf.is_empty() && buf.len() + 1 + line.len() > max_chars {
            out.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.trim().is_empty() {
        out.push(buf);
    }
    out.into_iter()
        .map(|s| s.trim_end().to_string())
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// Split an oversized run at the last newline or space before the ceiling.
fn hard_split(input: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = input;
    while !remaining.is_empty() {
        let split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if split_at == 0 {
            next_char_boundary(remaining)
        } else {
            split_at
        };
        let actual = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let actual = snap_to_char_boundary(remaining, actual);
        let actual = if actual == 0 {
            next_char_boundary(remaining)
        } else {
            actual
        };
        let piece = remaining[..actual].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[actual..];
    }
    out
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Last `overlap_chars` of `s`, starting at a word boundary. Empty when the
/// whole chunk would be repeated.
fn overlap_tail(s: &str, overlap_chars: usize) -> &str {
    if overlap_chars == 0 || s.len() <= overlap_chars * 2 {
        return "";
    }
    let start = snap_to_char_boundary(s, s.len() - overlap_chars);
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim(),
        None => "",
    }
}

fn make_chunk(document_id: &str, index: i64, piece: Piece) -> Chunk {
    let hash = content_hash(&piece.content);
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}:{}", document_id, index, hash).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        content: piece.content,
        chunk_index: index,
        section_title: piece.section_title,
        content_type: piece.content_type,
        programming_language: piece.language,
        embedding: None,
        hash,
        bm25_score: 0.0,
        semantic_score: 0.0,
        rerank_score: 0.0,
        final_score: 0.0,
    }
}

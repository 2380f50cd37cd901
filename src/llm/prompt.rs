//! Prompt construction for the suggestion engine.

use std::fmt::Write;

use crate::core::retrieval::ContextPacket;
use crate::domain::{Citation, CitationKind};

/// Characters of each neighbor preview included in the prompt
const NEIGHBOR_PREVIEW_CHARS: usize = 200;

pub const SYSTEM_PROMPT: &str = "\
You review technical documentation written in Markdown and propose small, safe edits.

What to look for:
- Spelling and grammar in prose. Code is not prose; leave it alone.
- Sentences that are hard to follow. Rewrite them without changing what they say.
- Statements that contradict the FACTS or the other excerpts. Report these only with a citation.
- Terminology used inconsistently within the document.

Constraints:
- Edit only lines inside the chunk, and keep every edit as small as possible.
- Do not touch headings, links, images or code fences unless a catalog fact requires it.
- A code_edit needs a catalog citation copied from FACTS.
- Do not invent facts. When unsure, emit a `question` with rule_code LLM_UNSURE.
- Line numbers are the ones printed at the start of each chunk line.

Reply with a single JSON object matching the response schema and nothing else.";

/// User prompt for one chunk
pub fn user_prompt(packet: &ContextPacket) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "DOCUMENT: {}", packet.document);
    if let Some(title) = &packet.title {
        let _ = writeln!(out, "TITLE: {}", title);
    }
    if !packet.heading_path.is_empty() {
        let _ = writeln!(out, "SECTION: {}", packet.heading_path.join(" > "));
    }
    let _ = writeln!(out, "LINES: {}-{}", packet.start_line, packet.end_line);

    let _ = writeln!(out, "\nCHUNK:\n<<<\n{}\n>>>", packet.rendered);

    for block in &packet.code_blocks {
        let _ = writeln!(
            out,
            "\nCODE BLOCK {} ({}, starts at line {}), read-only:\n<<<\n{}\n>>>",
            block.id,
            block.lang.as_deref().unwrap_or("no language"),
            block.start_line,
            block.body
        );
    }

    let context = &packet.context;
    if !context.before.is_empty() || !context.after.is_empty() {
        let _ = writeln!(
            out,
            "\nSURROUNDING TEXT (read-only):\n<<<\n{}\n...\n{}\n>>>",
            context.before.join("\n"),
            context.after.join("\n")
        );
    }

    if !context.neighbors.is_empty() {
        out.push_str("\nRELATED EXCERPTS (read-only):\n");
        for neighbor in &context.neighbors {
            let preview: String = neighbor.chunk.preview.chars().take(NEIGHBOR_PREVIEW_CHARS).collect();
            let _ = writeln!(
                out,
                "- {} lines {}-{} (score {:.2}): {}",
                neighbor.chunk.document,
                neighbor.chunk.start_line,
                neighbor.chunk.end_line,
                neighbor.score,
                preview.replace('\n', " ")
            );
        }
    }

    out.push_str("\nFACTS (cite these exactly):\n");
    if context.facts.is_empty() {
        out.push_str("- none\n");
    }
    for fact in &context.facts {
        let _ = writeln!(out, "- {}", describe_fact(fact));
    }

    if !packet.rule_facts.is_empty() {
        out.push_str("\nALREADY REPORTED BY RULES (do not repeat):\n");
        for fact in &packet.rule_facts {
            let _ = writeln!(out, "- {}", fact);
        }
    }

    out.push_str("\nReturn JSON only.");
    out
}

/// The user prompt again, with the validation error and a stricter instruction
pub fn stricter(user_prompt: &str, error: &str) -> String {
    format!(
        "{}\n\nYOUR PREVIOUS REPLY WAS REJECTED: {}\n\
         Reply with one JSON object of the form {{\"suggestions\": [...]}}. \
         Every suggestion needs every required field, a rule_code from the LLM set, \
         a confidence between 0 and 1, and a location inside lines shown above. \
         No prose, no markdown fence.",
        user_prompt, error
    )
}

fn describe_fact(fact: &Citation) -> String {
    let key = fact.key.as_deref().unwrap_or_default();
    let value = fact.value.as_deref().unwrap_or_default();
    match fact.kind {
        CitationKind::Catalog => format!(
            "catalog source={} key={} value={}",
            fact.source.as_deref().unwrap_or("catalog"),
            key,
            value
        ),
        CitationKind::Fact => format!("fact key={} value={}", key, value),
        CitationKind::Document => format!(
            "document path={} lines {}-{}",
            fact.path.as_deref().unwrap_or_default(),
            fact.line_start.unwrap_or_default(),
            fact.line_end.unwrap_or_default()
        ),
    }
}

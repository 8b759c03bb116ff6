//! Report Synthesizer
//!
//! Composes the final report from the Evidence Store. The composer cites
//! with `<cite source="src-N"/>` tags; every tag is resolved against the
//! store before the report is finalized. Resolvable tags become Markdown
//! links and are recorded on their section, unresolvable ones are dropped.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use super::ResearchError;
use crate::evidence::{EvidenceStore, SourceId};
use crate::gateway::{CallContext, ToolError, ToolGateway};
use crate::llm::ModelRole;

/// Marks composer prompts (used by scripted test models).
pub const COMPOSER_MARKER: &str = "CITED REPORT COMPOSITION";
/// Marks outline prompts.
pub const OUTLINE_MARKER: &str = "REPORT OUTLINE PLANNING";

const OUTLINE_CONTEXT: &str = "You are an expert report architect. You design the logical structure of \
research reports.";
const MIN_OUTLINE_SECTIONS: usize = 4;
const MAX_OUTLINE_SECTIONS: usize = 6;

const COMPOSER_CONTEXT: &str = "You are a research writer. You transform gathered evidence into a \
polished, professional and meticulously cited report.";

static CITE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[ \t]*<cite\s+source\s*=\s*["']?\s*(src-\d+)\s*["']?\s*/?>(?:\s*</cite>)?"#).expect("valid regex")
});
static SPACE_BEFORE_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+([.,;:])").expect("valid regex"));

#[derive(Debug, Clone, Serialize)]
pub struct ReportSection {
    pub heading: String,
    /// Markdown heading level (0 for text before the first heading).
    pub level: usize,
    pub body: String,
    pub citations: Vec<SourceId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CitedSource {
    pub id: SourceId,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportFlags {
    /// The loop stopped on its round or time budget, not on a sufficiency verdict.
    pub budget_exhausted: bool,
    pub unverified_sufficiency: bool,
    pub no_evidence: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub question: String,
    pub sections: Vec<ReportSection>,
    /// Sources cited anywhere in the report, in first-citation order.
    pub sources: Vec<CitedSource>,
    pub markdown: String,
    /// Section headings planned before composition; empty when none was planned.
    pub outline: Vec<String>,
    pub flags: ReportFlags,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn citation_ids(&self) -> impl Iterator<Item = &SourceId> {
        self.sections.iter().flat_map(|s| s.citations.iter())
    }

    /// Report for a session that gathered nothing.
    pub fn unable_to_research(question: &str, flags: ReportFlags) -> Self {
        let heading = "Unable to research this question".to_string();
        let body = format!(
            "No evidence could be gathered for \"{}\". Every search either failed or returned \
             nothing usable, so no findings can be reported. Rephrasing the question or trying \
             again later may help.",
            question
        );
        let markdown = format!("# {}\n\n{}\n", heading, body);
        Self {
            question: question.to_string(),
            sections: vec![ReportSection {
                heading,
                level: 1,
                body,
                citations: Vec::new(),
            }],
            sources: Vec::new(),
            markdown,
            outline: Vec::new(),
            flags: ReportFlags {
                no_evidence: true,
                ..flags
            },
            generated_at: Utc::now(),
        }
    }
}

pub struct ReportSynthesizer {
    prompt_evidence_limit: usize,
}

impl ReportSynthesizer {
    pub fn new(prompt_evidence_limit: usize) -> Self {
        Self { prompt_evidence_limit }
    }

    pub async fn synthesize(
        &self,
        gateway: &ToolGateway,
        ctx: &CallContext,
        question: &str,
        store: &EvidenceStore,
        flags: ReportFlags,
    ) -> Result<Report, ResearchError> {
        if store.is_empty() {
            info!(session_id = %ctx.session_id, "No evidence, returning minimal report");
            return Ok(Report::unable_to_research(question, flags));
        }

        let outline = self.plan_outline(gateway, ctx, question, store).await;
        let prompt = self.create_prompt(question, store, &outline);
        let raw = gateway
            .complete(ctx, ModelRole::Critic, prompt, COMPOSER_CONTEXT)
            .await
            .map_err(ResearchError::Synthesis)?;

        let mut report = finalize(question, &raw, store, flags)?;
        let missing = missing_sections(&report.sections, &outline);
        if !missing.is_empty() {
            warn!(session_id = %ctx.session_id, missing = ?missing, "Report left out outlined sections");
        }
        report.outline = outline;
        info!(
            session_id = %ctx.session_id,
            sections = report.sections.len(),
            cited_sources = report.sources.len(),
            "Report composed"
        );
        Ok(report)
    }

    /// Ask the worker model for a 4-6 section outline. Outline failures are
    /// not fatal; the composer then picks its own sections.
    async fn plan_outline(&self, gateway: &ToolGateway, ctx: &CallContext, question: &str, store: &EvidenceStore) -> Vec<String> {
        let titles: Vec<String> = store.sources().iter().map(|s| format!("- {}", s.title)).collect();
        let prompt = format!(
            r###"{marker}

RESEARCH QUESTION:
{question}

SOURCES GATHERED:
{titles}

Design the structure of the final report as a Markdown outline with {min} to {max}
distinct sections that cover the question without overlap. Write each section as
a "## Section Name" heading followed by one line describing what it covers.
Do not include a "References" or "Sources" section; citations are inline."###,
            marker = OUTLINE_MARKER,
            question = question,
            titles = titles.join("\n"),
            min = MIN_OUTLINE_SECTIONS,
            max = MAX_OUTLINE_SECTIONS,
        );

        match gateway.complete(ctx, ModelRole::Worker, prompt, OUTLINE_CONTEXT).await {
            Ok(raw) => {
                let outline = parse_outline(&raw);
                if outline.is_empty() {
                    warn!(session_id = %ctx.session_id, "Outline had no sections, composing without one");
                }
                outline
            }
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "Outline planning failed, composing without one");
                Vec::new()
            }
        }
    }

    fn create_prompt(&self, question: &str, store: &EvidenceStore, outline: &[String]) -> String {
        let sources: Vec<String> = store
            .sources()
            .iter()
            .map(|s| format!("- {}: {} ({})", s.id, s.title, s.url))
            .collect();
        let structure = if outline.is_empty() {
            format!(
                "Organize the report into {} to {} \"## \" sections that cover the question without overlap.",
                MIN_OUTLINE_SECTIONS, MAX_OUTLINE_SECTIONS
            )
        } else {
            let listed: Vec<String> = outline.iter().map(|h| format!("## {}", h)).collect();
            format!(
                "REPORT OUTLINE (use each entry as a \"## \" section heading, in this order):\n{}",
                listed.join("\n")
            )
        };

        format!(
            r###"{marker}

RESEARCH QUESTION:
{question}

EVIDENCE (grouped by source id):
{evidence}

CITATION SOURCES:
{sources}

Write a comprehensive report that answers the question using only this evidence.
Start with a "# " title, then use "## " section headings.
{structure}

CITATION SYSTEM:
Cite a source by inserting a tag directly after the claim it supports.
The only correct format is: <cite source="src-ID_NUMBER" />
Only cite ids from CITATION SOURCES. Do not add a "References" or "Sources"
section; all citations must be inline."###,
            marker = COMPOSER_MARKER,
            question = question,
            evidence = store.format_for_prompt(self.prompt_evidence_limit),
            sources = sources.join("\n"),
            structure = structure,
        )
    }
}

/// Resolve citation tags, split into sections and render Markdown.
pub fn finalize(question: &str, raw: &str, store: &EvidenceStore, flags: ReportFlags) -> Result<Report, ResearchError> {
    let mut sections: Vec<ReportSection> = Vec::new();
    let mut cited: Vec<CitedSource> = Vec::new();

    for (level, heading, body) in split_sections(raw) {
        let mut citations: Vec<SourceId> = Vec::new();
        let body = CITE_TAG.replace_all(&body, |caps: &regex::Captures| {
            let Some(source) = store.resolve(&caps[1]) else {
                warn!(tag = %&caps[0], "Removed citation to unknown source");
                return String::new();
            };
            if !citations.contains(&source.id) {
                citations.push(source.id.clone());
            }
            if !cited.iter().any(|c| c.id == source.id) {
                cited.push(CitedSource {
                    id: source.id.clone(),
                    title: source.title.clone(),
                    url: source.url.clone(),
                });
            }
            format!(" [{}]({})", source.title, source.url)
        });
        let body = SPACE_BEFORE_PUNCTUATION.replace_all(&body, "$1").trim().to_string();
        let heading = CITE_TAG.replace_all(&heading, "").trim().to_string();

        if heading.is_empty() && body.is_empty() {
            continue;
        }
        sections.push(ReportSection {
            heading,
            level,
            body,
            citations,
        });
    }

    if sections.iter().all(|s| s.body.is_empty()) {
        return Err(ResearchError::Synthesis(ToolError::permanent(
            "composer returned no report text",
        )));
    }

    let markdown = render_markdown(&sections);
    Ok(Report {
        question: question.to_string(),
        sections,
        sources: cited,
        markdown,
        outline: Vec::new(),
        flags,
        generated_at: Utc::now(),
    })
}

/// Split Markdown on ATX headings into `(level, heading, body)`.
fn split_sections(raw: &str) -> Vec<(usize, String, String)> {
    let mut sections: Vec<(usize, String, String)> = vec![(0, String::new(), String::new())];
    let mut in_fence = false;

    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let level = line.chars().take_while(|c| *c == '#').count();
        let is_heading = !in_fence && (1..=6).contains(&level) && line[level..].starts_with(' ');
        if is_heading {
            sections.push((level, line[level..].trim().to_string(), String::new()));
        } else if let Some((_, _, body)) = sections.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    sections
}

/// Outline headings from planner output. A lone top-level heading above the
/// sections is the report title, not a section.
fn parse_outline(raw: &str) -> Vec<String> {
    let mut headings: Vec<(usize, String)> = split_sections(raw)
        .into_iter()
        .filter(|(level, heading, _)| *level > 0 && !heading.is_empty())
        .map(|(level, heading, _)| (level, heading))
        .collect();

    if let Some(top) = headings.iter().map(|(level, _)| *level).min() {
        let at_top = headings.iter().filter(|(level, _)| *level == top).count();
        if headings.len() > 1 && at_top == 1 && headings[0].0 == top {
            headings.remove(0);
        }
    }

    let mut outline: Vec<String> = Vec::new();
    for (_, heading) in headings {
        let key = normalize_heading(&heading);
        if matches!(key.as_str(), "references" | "sources" | "bibliography") {
            continue;
        }
        if outline.iter().any(|h| normalize_heading(h) == key) {
            continue;
        }
        outline.push(heading);
        if outline.len() == MAX_OUTLINE_SECTIONS {
            break;
        }
    }
    outline
}

/// Outlined headings with no matching section in the composed report.
fn missing_sections<'a>(sections: &[ReportSection], outline: &'a [String]) -> Vec<&'a str> {
    outline
        .iter()
        .filter(|planned| {
            let key = normalize_heading(planned);
            !sections.iter().any(|s| normalize_heading(&s.heading) == key)
        })
        .map(String::as_str)
        .collect()
}

fn normalize_heading(heading: &str) -> String {
    heading
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c.is_whitespace())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn render_markdown(sections: &[ReportSection]) -> String {
    let mut output = String::new();
    for section in sections {
        if section.level > 0 {
            output.push_str(&"#".repeat(section.level));
            output.push(' ');
            output.push_str(&section.heading);
            output.push_str("\n\n");
        }
        if !section.body.is_empty() {
            output.push_str(&section.body);
            output.push_str("\n\n");
        }
    }
    output.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gateway_with, FakeFetcher, FakeSearch, ScriptedLlm};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn store() -> EvidenceStore {
        let mut store = EvidenceStore::new();
        let (a, _) = store.register_source("https://blog.google/io-2025/", "I/O 2025 recap", 1).unwrap();
        let (b, _) = store.register_source("https://www.theverge.com/io-pricing", "", 2).unwrap();
        store.add_evidence(a, "io 2025", 1, "Three new models were announced.", 0.9);
        store.add_evidence(b, "io pricing", 2, "The pro plan costs $19.99 per month.", 0.7);
        store
    }

    #[test]
    fn test_finalize_resolves_and_filters_citations() {
        let raw = "# I/O 2025 Report\n\n\
                   ## Announcements\n\
                   Three models launched <cite source=\"src-1\"/>.\n\n\
                   ## Pricing\n\
                   The plan costs $19.99 <cite source='src-2' /> , up from before <cite source=\"src-9\"/>.\n";

        let report = finalize("latest I/O event report", raw, &store(), ReportFlags::default()).unwrap();

        assert_eq!(report.sections.len(), 3);
        assert_eq!(report.sections[0].heading, "I/O 2025 Report");
        assert_eq!(report.sections[1].citations, vec![store().sources()[0].id.clone()]);
        assert_eq!(
            report.sections[1].body,
            "Three models launched [I/O 2025 recap](https://blog.google/io-2025/)."
        );
        // src-9 is unknown and dropped; the untitled source falls back to its domain
        assert_eq!(
            report.sections[2].body,
            "The plan costs $19.99 [theverge.com](https://www.theverge.com/io-pricing), up from before."
        );
        assert_eq!(report.sources.len(), 2);
        assert!(report.citation_ids().all(|id| store().resolve_id(id).is_some()));
        assert!(report.markdown.starts_with("# I/O 2025 Report\n\n## Announcements\n\n"));
        assert!(!report.markdown.contains("<cite"));
    }

    #[test]
    fn test_composer_prompt_states_heading_rules() {
        let prompt = ReportSynthesizer::new(20).create_prompt("latest I/O event report", &store(), &[]);
        assert!(prompt.starts_with(COMPOSER_MARKER));
        assert!(prompt.contains("Start with a \"# \" title, then use \"## \" section headings."));
        assert!(prompt.contains("<cite source=\"src-ID_NUMBER\" />"));
        assert!(prompt.contains("- src-1: I/O 2025 recap (https://blog.google/io-2025/)"));
        assert!(!prompt.contains("REPORT OUTLINE"));
    }

    #[test]
    fn test_parse_outline_drops_title_and_reference_sections() {
        let raw = "# I/O 2025 Report\n\
                   ## 1. Announcements\nWhat launched.\n\
                   ## Pricing\nWhat it costs.\n\
                   ## announcements\n\
                   ## References\n\
                   ## Devices\n## Developer tools\n## Availability\n## Reception\n## Outlook\n";
        let outline = parse_outline(raw);
        assert_eq!(
            outline,
            vec!["1. Announcements", "Pricing", "Devices", "Developer tools", "Availability", "Reception"]
        );
        assert!(parse_outline("no headings here").is_empty());
    }

    #[test]
    fn test_missing_sections_compares_normalized_headings() {
        let report = finalize(
            "q",
            "# Report\n## Announcements\nModels <cite source=\"src-1\"/>.\n",
            &store(),
            ReportFlags::default(),
        )
        .unwrap();
        let outline = vec!["1. announcements".to_string(), "Pricing".to_string()];
        assert_eq!(missing_sections(&report.sections, &outline), vec!["Pricing"]);
    }

    #[test]
    fn test_fenced_hashes_are_not_headings() {
        let raw = "## Example\n```\n# not a heading\n```\nDone.";
        let report = finalize("q", raw, &store(), ReportFlags::default()).unwrap();
        assert_eq!(report.sections.len(), 1);
        assert!(report.sections[0].body.contains("# not a heading"));
    }

    #[test]
    fn test_empty_output_is_a_synthesis_failure() {
        let err = finalize("q", "  \n# Title only\n", &store(), ReportFlags::default()).unwrap_err();
        assert_eq!(err.error_kind(), "SYNTHESIS_FAILURE");
    }

    #[test]
    fn test_unable_to_research_report() {
        let flags = ReportFlags {
            budget_exhausted: true,
            ..ReportFlags::default()
        };
        let report = Report::unable_to_research("what is X?", flags);
        assert!(report.flags.no_evidence);
        assert!(report.flags.budget_exhausted);
        assert_eq!(report.citation_ids().count(), 0);
        assert!(report.markdown.contains("what is X?"));
    }

    #[tokio::test]
    async fn test_empty_store_skips_the_model() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = gateway_with(llm.clone(), Arc::new(FakeSearch::new()), Arc::new(FakeFetcher::new()));
        let ctx = CallContext::new(Uuid::new_v4(), CancellationToken::new());

        let report = ReportSynthesizer::new(20)
            .synthesize(&gateway, &ctx, "q", &EvidenceStore::new(), ReportFlags::default())
            .await
            .unwrap();
        assert!(report.flags.no_evidence);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_outline_shapes_the_composer_prompt() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .on(
                    OUTLINE_MARKER,
                    Ok("# I/O 2025\n## Announcements\nWhat launched.\n## Pricing\nWhat it costs.\n## Sources\n".to_string()),
                )
                .on(
                    COMPOSER_MARKER,
                    Ok("# I/O 2025 Report\n## Announcements\nModels <cite source=\"src-1\"/>.\n## Pricing\n$19.99 <cite source=\"src-2\"/>.".to_string()),
                ),
        );
        let gateway = gateway_with(llm.clone(), Arc::new(FakeSearch::new()), Arc::new(FakeFetcher::new()));
        let ctx = CallContext::new(Uuid::new_v4(), CancellationToken::new());

        let report = ReportSynthesizer::new(20)
            .synthesize(&gateway, &ctx, "latest I/O event report", &store(), ReportFlags::default())
            .await
            .unwrap();

        assert_eq!(report.outline, vec!["Announcements".to_string(), "Pricing".to_string()]);
        assert_eq!(llm.roles(), vec![ModelRole::Worker, ModelRole::Critic]);
        let composer_prompt = &llm.prompts()[1];
        assert!(composer_prompt.contains("REPORT OUTLINE"));
        assert!(composer_prompt.contains("## Announcements\n## Pricing"));
        assert_eq!(report.sources.len(), 2);
    }

    #[tokio::test]
    async fn test_outline_failure_still_composes() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .on(OUTLINE_MARKER, Err(ToolError::permanent("model unavailable")))
                .on(COMPOSER_MARKER, Ok("# Report\nModels <cite source=\"src-1\"/>.".to_string())),
        );
        let gateway = gateway_with(llm.clone(), Arc::new(FakeSearch::new()), Arc::new(FakeFetcher::new()));
        let ctx = CallContext::new(Uuid::new_v4(), CancellationToken::new());

        let report = ReportSynthesizer::new(20)
            .synthesize(&gateway, &ctx, "q", &store(), ReportFlags::default())
            .await
            .unwrap();
        assert!(report.outline.is_empty());
        assert!(llm.prompts()[1].contains("Organize the report into 4 to 6"));
    }

    #[tokio::test]
    async fn test_composer_failure_is_fatal() {
        let llm = Arc::new(ScriptedLlm::new().on(COMPOSER_MARKER, Err(ToolError::permanent("context too long"))));
        let gateway = gateway_with(llm, Arc::new(FakeSearch::new()), Arc::new(FakeFetcher::new()));
        let ctx = CallContext::new(Uuid::new_v4(), CancellationToken::new());

        let err = ReportSynthesizer::new(20)
            .synthesize(&gateway, &ctx, "q", &store(), ReportFlags::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "SYNTHESIS_FAILURE");
    }
}

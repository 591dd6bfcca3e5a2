//! Document parsing.
//!
//! The primary path submits the file to the structured-parse service and
//! polls the job. On service failure (or for plain-text formats) a
//! per-extension fallback produces elements locally: HTML via tag strip,
//! TXT/MD/CSV/JSON directly, binary formats via printable-run salvage.
//! A second pass threads a heading stack through the element sequence to
//! give every element its `section_path` and `parent_heading`.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use async_trait::async_trait;
use callbridge_config::constants::ingestion;

use crate::IngestError;

/// Kinds of structured elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Heading,
    Paragraph,
    Table,
    List,
    Image,
    Text,
}

/// One parsed element, in document order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Heading level, 1-based, for `Heading` elements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

impl StructuredElement {
    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Heading,
            level: Some(level),
            text: text.into(),
            markdown: None,
            page: None,
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Paragraph,
            level: None,
            text: text.into(),
            markdown: None,
            page: None,
        }
    }
}

/// An element with its section context resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedElement {
    #[serde(flatten)]
    pub element: StructuredElement,
    /// Headings from the document root down to this element.
    pub section_path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_heading: Option<String>,
}

/// Parser seam; the pipeline depends on this, not the HTTP client.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(
        &self,
        file_name: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<Vec<StructuredElement>, IngestError>;
}

/// Parse-service configuration.
#[derive(Debug, Clone)]
pub struct ParseServiceConfig {
    pub endpoint: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub max_retries: u32,
}

impl Default for ParseServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: callbridge_config::constants::endpoints::PARSE_SERVICE_DEFAULT.to_string(),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(ingestion::PARSE_POLL_TIMEOUT_SECS),
            max_retries: ingestion::PARSE_MAX_RETRIES,
        }
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default)]
    elements: Vec<StructuredElement>,
    #[serde(default)]
    error: Option<String>,
}

/// Production parser: service first, local fallback per extension.
pub struct DocumentParser {
    client: Client,
    config: ParseServiceConfig,
}

impl DocumentParser {
    pub fn new(config: ParseServiceConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Submit the file and poll the job to completion.
    async fn parse_via_service(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<StructuredElement>, IngestError> {
        let submit_url = format!("{}/parse", self.config.endpoint);
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
        );

        let response = self
            .submit_with_retry(&submit_url, form, file_name, bytes)
            .await?;
        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        let job_url = format!("{}/jobs/{}", self.config.endpoint, submitted.job_id);
        let deadline = tokio::time::Instant::now() + self.config.poll_timeout;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(IngestError::Transport(format!(
                    "parse job {} timed out",
                    submitted.job_id
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;

            let job: JobResponse = self
                .client
                .get(&job_url)
                .send()
                .await
                .map_err(|e| IngestError::Transport(e.to_string()))?
                .json()
                .await
                .map_err(|e| IngestError::Transport(e.to_string()))?;

            match job.status.as_str() {
                "completed" => return Ok(job.elements),
                "failed" => {
                    return Err(IngestError::Pipeline(
                        job.error.unwrap_or_else(|| "parse job failed".to_string()),
                    ))
                }
                _ => continue,
            }
        }
    }

    /// Retry the submit on network/timeout causes only, with exponential
    /// backoff 1s -> 2s -> 4s capped at 10s.
    async fn submit_with_retry(
        &self,
        url: &str,
        form: reqwest::multipart::Form,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<reqwest::Response, IngestError> {
        let mut backoff = Duration::from_millis(ingestion::PARSE_BACKOFF_INITIAL_MS);
        let cap = Duration::from_millis(ingestion::PARSE_BACKOFF_CAP_MS);
        let mut attempt = 0u32;
        let mut form = Some(form);

        loop {
            // Multipart forms are consumed by send; rebuild on retry.
            let current = form.take().unwrap_or_else(|| {
                reqwest::multipart::Form::new().part(
                    "file",
                    reqwest::multipart::Part::bytes(bytes.to_vec())
                        .file_name(file_name.to_string()),
                )
            });

            match self.client.post(url).multipart(current).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    // A definitive service answer is not retryable.
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(IngestError::Pipeline(format!("{status}: {body}")));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(IngestError::Transport(e.to_string()));
                    }
                    tracing::warn!(attempt, error = %e, "Parse submit failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }
}

#[async_trait]
impl Parser for DocumentParser {
    async fn parse(
        &self,
        file_name: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<Vec<StructuredElement>, IngestError> {
        // Plain-text formats never need the service round trip.
        if matches!(extension, "txt" | "md" | "csv" | "json") {
            return fallback_parse(extension, bytes);
        }

        match self.parse_via_service(file_name, bytes).await {
            Ok(elements) if !elements.is_empty() => Ok(elements),
            Ok(_) => fallback_parse(extension, bytes),
            Err(IngestError::Pipeline(reason)) => {
                tracing::warn!(%reason, extension, "Parse service rejected file, trying fallback");
                fallback_parse(extension, bytes)
            }
            Err(e) => Err(e),
        }
    }
}

/// Local fallback per extension.
pub fn fallback_parse(
    extension: &str,
    bytes: &[u8],
) -> Result<Vec<StructuredElement>, IngestError> {
    let elements = match extension {
        "txt" | "csv" => text_elements(&String::from_utf8_lossy(bytes)),
        "json" => text_elements(&String::from_utf8_lossy(bytes)),
        "md" => markdown_elements(&String::from_utf8_lossy(bytes)),
        "html" | "htm" => text_elements(&strip_tags(&String::from_utf8_lossy(bytes))),
        // Binary formats: salvage printable UTF-8 runs.
        "pdf" | "docx" | "doc" | "xlsx" | "xls" => text_elements(&salvage_text(bytes)),
        other => return Err(IngestError::UnsupportedType(other.to_string())),
    };

    if elements.is_empty() {
        return Err(IngestError::Pipeline(
            "parser produced no structured elements".to_string(),
        ));
    }
    Ok(elements)
}

/// Blank-line separated paragraphs.
fn text_elements(text: &str) -> Vec<StructuredElement> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(StructuredElement::paragraph)
        .collect()
}

/// Markdown: `#` headings become heading elements with their level.
fn markdown_elements(text: &str) -> Vec<StructuredElement> {
    let mut elements = Vec::new();
    let mut paragraph = String::new();

    let mut flush = |paragraph: &mut String, elements: &mut Vec<StructuredElement>| {
        let trimmed = paragraph.trim();
        if !trimmed.is_empty() {
            elements.push(StructuredElement::paragraph(trimmed));
        }
        paragraph.clear();
    };

    for line in text.lines() {
        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) && trimmed.chars().nth(hashes) == Some(' ') {
            flush(&mut paragraph, &mut elements);
            elements.push(StructuredElement::heading(
                hashes as u8,
                trimmed[hashes + 1..].trim(),
            ));
        } else if trimmed.is_empty() {
            flush(&mut paragraph, &mut elements);
        } else {
            if !paragraph.is_empty() {
                paragraph.push(' ');
            }
            paragraph.push_str(trimmed);
        }
    }
    flush(&mut paragraph, &mut elements);
    elements
}

/// Drop tags, scripts and styles; keep text content.
fn strip_tags(html: &str) -> String {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static SCRIPT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("static"));
    static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("static"));
    static BLOCK_END: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|br)>").expect("static"));

    let without_scripts = SCRIPT.replace_all(html, " ");
    let with_breaks = BLOCK_END.replace_all(&without_scripts, "\n\n");
    let text = TAG.replace_all(&with_breaks, " ");
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// Extract printable UTF-8 runs from a binary blob. Best effort for
/// uncompressed streams; compressed documents need the parse service.
fn salvage_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::new();
    let mut run = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c.is_whitespace() || ".,;:!?()-'\"%".contains(c) {
            run.push(c);
        } else {
            if run.split_whitespace().count() >= 3 {
                out.push_str(run.trim());
                out.push_str("\n\n");
            }
            run.clear();
        }
    }
    if run.split_whitespace().count() >= 3 {
        out.push_str(run.trim());
    }
    out
}

/// Second pass: resolve section context by walking a heading stack.
///
/// A heading at level N pops the stack to N-1 before pushing itself.
/// Unleveled headings are treated as level 1.
pub fn annotate_sections(elements: Vec<StructuredElement>) -> Vec<AnnotatedElement> {
    let mut stack: Vec<(u8, String)> = Vec::new();
    let mut annotated = Vec::with_capacity(elements.len());

    for element in elements {
        if element.kind == ElementKind::Heading {
            let level = element.level.unwrap_or(1);
            while stack.last().map(|(l, _)| *l >= level).unwrap_or(false) {
                stack.pop();
            }
            stack.push((level, element.text.clone()));
        }

        let section_path: Vec<String> = stack.iter().map(|(_, t)| t.clone()).collect();
        let parent_heading = if element.kind == ElementKind::Heading {
            // Parent is the heading above this one.
            stack
                .len()
                .checked_sub(2)
                .and_then(|i| stack.get(i))
                .map(|(_, t)| t.clone())
        } else {
            stack.last().map(|(_, t)| t.clone())
        };

        annotated.push(AnnotatedElement {
            element,
            section_path,
            parent_heading,
        });
    }
    annotated
}

//! Template documents: markdown where a level-1 heading names a namespace,
//! a level-2 heading names a template, paragraphs under the name form its
//! description, and fenced `sql` code blocks hold the template body.
//!
//! Several sql blocks under one name are joined with a newline. Code blocks
//! in any other language, and indented ones, are skipped.

use std::ops::Range;

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};

use crate::error::{DocumentError, DocumentErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub namespace: String,
    pub name: String,
    pub description: String,
    pub content: String,
}

impl TemplateSource {
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct Pending {
    name: Option<String>,
    description: Vec<String>,
    blocks: Vec<String>,
}

impl Pending {
    fn flush(&mut self, namespace: Option<&str>, out: &mut Vec<TemplateSource>) {
        let pending = std::mem::take(self);
        let (Some(namespace), Some(name)) = (namespace, pending.name) else {
            return;
        };
        if pending.blocks.is_empty() {
            return;
        }
        out.push(TemplateSource {
            namespace: namespace.to_string(),
            name,
            description: pending.description.join("\n"),
            content: pending.blocks.join("\n"),
        });
    }

    fn describing(&self) -> bool {
        self.name.is_some() && self.blocks.is_empty()
    }
}

/// What the text events currently seen belong to.
enum Capture {
    None,
    Heading(HeadingLevel, String),
    Paragraph(String),
    Sql(String),
    Skip,
}

fn line_of(document: &str, offset: usize) -> usize {
    document[..offset].matches('\n').count() + 1
}

fn is_sql(info: &str) -> bool {
    info.split_whitespace()
        .next()
        .is_some_and(|lang| lang.eq_ignore_ascii_case("sql"))
}

pub fn extract(document: &str) -> Result<Vec<TemplateSource>, DocumentError> {
    let mut templates = Vec::new();
    let mut namespace: Option<String> = None;
    let mut pending = Pending::default();
    let mut capture = Capture::None;

    let parser = Parser::new_ext(document, Options::empty());
    for (event, range) in parser.into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                capture = Capture::Heading(level, String::new());
            }
            Event::End(TagEnd::Heading(_)) => {
                let Capture::Heading(level, text) = std::mem::replace(&mut capture, Capture::None)
                else {
                    continue;
                };
                match level {
                    HeadingLevel::H1 => {
                        pending.flush(namespace.as_deref(), &mut templates);
                        namespace = Some(text.trim().to_string());
                    }
                    HeadingLevel::H2 => {
                        pending.flush(namespace.as_deref(), &mut templates);
                        pending.name = Some(text.trim().to_string());
                    }
                    _ => {}
                }
            }
            Event::Start(Tag::Paragraph) if pending.describing() => {
                capture = Capture::Paragraph(String::new());
            }
            Event::End(TagEnd::Paragraph) => {
                if let Capture::Paragraph(text) = std::mem::replace(&mut capture, Capture::None) {
                    let text = text.trim();
                    if !text.is_empty() {
                        pending.description.push(text.to_string());
                    }
                }
            }
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) if is_sql(&info) => {
                check_headings(document, &range, namespace.is_some(), pending.name.is_some())?;
                capture = Capture::Sql(String::new());
            }
            Event::Start(Tag::CodeBlock(_)) => capture = Capture::Skip,
            Event::End(TagEnd::CodeBlock) => {
                if let Capture::Sql(block) = std::mem::replace(&mut capture, Capture::None) {
                    pending.blocks.push(block);
                }
            }
            Event::Text(text) | Event::Code(text) => match &mut capture {
                Capture::Heading(_, buf) | Capture::Paragraph(buf) | Capture::Sql(buf) => {
                    buf.push_str(&text)
                }
                Capture::None | Capture::Skip => {}
            },
            Event::SoftBreak | Event::HardBreak => {
                if let Capture::Paragraph(buf) = &mut capture {
                    buf.push('\n');
                }
            }
            _ => {}
        }
    }

    pending.flush(namespace.as_deref(), &mut templates);
    Ok(templates)
}

fn check_headings(
    document: &str,
    fence: &Range<usize>,
    has_namespace: bool,
    has_name: bool,
) -> Result<(), DocumentError> {
    let kind = match (has_namespace, has_name) {
        (false, _) => DocumentErrorKind::MissingNamespace,
        (true, false) => DocumentErrorKind::MissingName,
        (true, true) => return Ok(()),
    };
    Err(DocumentError {
        line: line_of(document, fence.start),
        kind,
    })
}

//! Text-template request processor.
//!
//! A template is plain text with placeholders that are substituted per
//! request:
//!
//! | placeholder        | value                                  |
//! |--------------------|----------------------------------------|
//! | `{data}`           | the request payload, byte for byte     |
//! | `{local_address}`  | the server side of the connection      |
//! | `{remote_address}` | the client side of the connection      |
//!
//! `{{` and `}}` produce literal braces. Anything else inside braces, or an
//! unmatched brace, is rejected when the template is loaded.

use crate::error::ProcessorError;
use crate::processor::{ConnectionContext, ProcessorLoader, RequestProcessor};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Data,
    LocalAddress,
    RemoteAddress,
}

/// A compiled response template.
#[derive(Debug, Clone)]
pub struct TemplateProcessor {
    segments: Vec<Segment>,
}

impl TemplateProcessor {
    /// Compile a template.
    pub fn parse(source: &str) -> Result<Self, ProcessorError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|&(_, c)| c) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|&(_, c)| c) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(ProcessorError::Load(format!(
                            "unclosed placeholder at offset {pos}"
                        )));
                    }

                    let segment = match name.as_str() {
                        "data" => Segment::Data,
                        "local_address" => Segment::LocalAddress,
                        "remote_address" => Segment::RemoteAddress,
                        other => {
                            return Err(ProcessorError::Load(format!(
                                "unknown placeholder {{{other}}} at offset {pos}"
                            )));
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => {
                    return Err(ProcessorError::Load(format!(
                        "unmatched '}}' at offset {pos}"
                    )));
                }
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Substitute the placeholders. The payload is copied verbatim, so a
    /// binary request yields a binary response.
    pub fn render(&self, payload: &[u8], ctx: &ConnectionContext) -> Bytes {
        let mut out = BytesMut::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.extend_from_slice(text.as_bytes()),
                Segment::Data => out.extend_from_slice(payload),
                Segment::LocalAddress => {
                    out.extend_from_slice(ctx.local_addr.to_string().as_bytes());
                }
                Segment::RemoteAddress => {
                    out.extend_from_slice(ctx.peer_addr.to_string().as_bytes());
                }
            }
        }
        out.freeze()
    }
}

impl RequestProcessor for TemplateProcessor {
    fn process(&self, payload: &[u8], ctx: &ConnectionContext) -> Result<Bytes, ProcessorError> {
        Ok(self.render(payload, ctx))
    }
}

/// Loads [`TemplateProcessor`]s from template text.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateLoader;

impl ProcessorLoader for TemplateLoader {
    fn load(&self, source: &str) -> Result<Box<dyn RequestProcessor>, ProcessorError> {
        Ok(Box::new(TemplateProcessor::parse(source)?))
    }
}

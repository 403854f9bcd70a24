//! Transport response normalization.
//!
//! Engines hand back whatever their transport produced: a status code, a
//! raw header blob, and an undecoded body. [`parse_response`] folds header
//! names to lowercase and decodes the body according to the declared
//! content type, so consumers see one shape regardless of transport.
//!
//! Pure transformation: no I/O, no side effects. Malformed input degrades
//! (junk header lines are skipped, undecodable bodies stay raw text); it
//! never fails.

use std::collections::BTreeMap;

use quick_xml::{Reader, events::Event};

use crate::engine::RawResponse;

/// Normalized transport response.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResponse {
    pub status: u16,
    /// Header names folded to lowercase; the last occurrence of a repeated
    /// name wins
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl UploadResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Raw body, kept verbatim
    Text(String),
    /// Parsed document for content types containing "xml"
    Xml(XmlDocument),
    /// Parsed value for content types containing "json"
    Json(serde_json::Value),
}

impl ResponseBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_xml(&self) -> Option<&XmlDocument> {
        match self {
            Self::Xml(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Minimal navigable XML tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlDocument {
    pub children: Vec<XmlNode>,
}

impl XmlDocument {
    /// The document element, when there is exactly one top-level element.
    pub fn root(&self) -> Option<&XmlElement> {
        self.children.iter().find_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            XmlNode::Text(_) => None,
        })
    }

    /// All elements with the given tag name, in document order.
    pub fn elements_by_tag_name(&self, name: &str) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        collect_elements(&self.children, name, &mut found);
        found
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Descendant elements with the given tag name, in document order.
    pub fn elements_by_tag_name(&self, name: &str) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        collect_elements(&self.children, name, &mut found);
        found
    }

    /// Concatenated text content of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.children, &mut out);
        out
    }
}

fn collect_elements<'a>(nodes: &'a [XmlNode], name: &str, found: &mut Vec<&'a XmlElement>) {
    for node in nodes {
        if let XmlNode::Element(element) = node {
            if element.name == name {
                found.push(element);
            }
            collect_elements(&element.children, name, found);
        }
    }
}

fn collect_text(nodes: &[XmlNode], out: &mut String) {
    for node in nodes {
        match node {
            XmlNode::Text(text) => out.push_str(text),
            XmlNode::Element(element) => collect_text(&element.children, out),
        }
    }
}

/// Normalize a raw transport response.
pub fn parse_response(raw: &RawResponse) -> UploadResponse {
    let headers = parse_headers(&raw.headers);
    let body = decode_body(headers.get("content-type").map(String::as_str), &raw.body);
    UploadResponse {
        status: raw.status,
        headers,
        body,
    }
}

fn parse_headers(blob: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for line in blob.lines() {
        // Split at the first colon only; values may contain colons.
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        headers.insert(name, value.trim().to_string());
    }
    headers
}

fn decode_body(content_type: Option<&str>, body: &str) -> ResponseBody {
    let declared = content_type.unwrap_or("").to_ascii_lowercase();
    if declared.contains("xml") {
        if let Some(doc) = parse_xml(body) {
            return ResponseBody::Xml(doc);
        }
    } else if declared.contains("json") {
        if let Ok(value) = serde_json::from_str(body) {
            return ResponseBody::Json(value);
        }
    }
    ResponseBody::Text(body.to_string())
}

fn parse_xml(body: &str) -> Option<XmlDocument> {
    let mut reader = Reader::from_str(body);

    let mut doc = XmlDocument::default();
    let mut stack: Vec<XmlElement> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                stack.push(element_from_start(&start)?);
            }
            Ok(Event::Empty(start)) => {
                let element = element_from_start(&start)?;
                push_node(&mut doc, &mut stack, XmlNode::Element(element));
            }
            Ok(Event::End(_)) => {
                let element = stack.pop()?;
                push_node(&mut doc, &mut stack, XmlNode::Element(element));
            }
            Ok(Event::Text(text)) => {
                let value = text.unescape().ok()?;
                // Indentation between elements is markup noise, not content.
                let value = value.trim();
                if !value.is_empty() {
                    push_node(&mut doc, &mut stack, XmlNode::Text(value.to_string()));
                }
            }
            Ok(Event::CData(data)) => {
                let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                push_node(&mut doc, &mut stack, XmlNode::Text(value));
            }
            Ok(Event::Eof) => break,
            // Declarations, comments and processing instructions carry no
            // payload the consumer can navigate to.
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    // Unbalanced markup, or a body with no element at all: not a document.
    if !stack.is_empty() || doc.root().is_none() {
        return None;
    }
    Some(doc)
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Option<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.ok()?;
        attributes.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        );
    }
    Some(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn push_node(doc: &mut XmlDocument, stack: &mut [XmlElement], node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => doc.children.push(node),
    }
}

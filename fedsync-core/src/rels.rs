//! RELS-EXT editing
//!
//! RELS-EXT is a small RDF/XML document describing the object itself. Edits
//! are applied by streaming the existing document through a reader/writer
//! pair and splicing statements into the first `rdf:Description`, so
//! unrelated statements are preserved byte for byte.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};

use crate::error::{RepoError, Result};

pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const MODEL_NS: &str = "info:fedora/fedora-system:def/model#";

/// Object of an RDF statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelsObject {
    Resource(String),
    Literal(String),
}

/// A statement about the object: `<prefix:name xmlns:prefix="ns">object</prefix:name>`
#[derive(Debug, Clone)]
pub struct Statement {
    pub prefix: String,
    pub namespace: String,
    pub name: String,
    pub object: RelsObject,
}

impl Statement {
    /// `fedora-model:hasModel` statement for a content model URI
    pub fn has_model(uri: &str) -> Self {
        Self {
            prefix: "fedora-model".to_string(),
            namespace: MODEL_NS.to_string(),
            name: "hasModel".to_string(),
            object: RelsObject::Resource(uri.to_string()),
        }
    }

    fn qname(&self) -> String {
        format!("{}:{}", self.prefix, self.name)
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let qname = self.qname();
        let xmlns = format!("xmlns:{}", self.prefix);
        let mut start = BytesStart::new(qname.as_str());
        start.push_attribute((xmlns.as_str(), self.namespace.as_str()));
        match &self.object {
            RelsObject::Resource(uri) => {
                start.push_attribute(("rdf:resource", uri.as_str()));
                writer.write_event(Event::Empty(start))?;
            }
            RelsObject::Literal(value) => {
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(value)))?;
                writer.write_event(Event::End(BytesEnd::new(qname.as_str())))?;
            }
        }
        Ok(())
    }
}

fn xml_err(e: impl std::fmt::Display) -> RepoError {
    RepoError::Xml(e.to_string())
}

/// A RELS-EXT document with one empty description of `pid`
pub fn empty_rels(pid: &str) -> String {
    format!(
        r#"<rdf:RDF xmlns:rdf="{}"><rdf:Description rdf:about="info:fedora/{}"></rdf:Description></rdf:RDF>"#,
        RDF_NS, pid
    )
}

/// Values (resource URI or literal text) of every statement with the given
/// local name
pub fn statement_values(rels: &[u8], local_name: &str) -> Vec<String> {
    let mut reader = Reader::from_reader(rels);
    reader.config_mut().trim_text(true);
    let mut values = Vec::new();
    let mut in_statement = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == local_name.as_bytes() => {
                match resource_attr(&e) {
                    Some(uri) => values.push(uri),
                    None => in_statement = true,
                }
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == local_name.as_bytes() => {
                if let Some(uri) = resource_attr(&e) {
                    values.push(uri);
                }
            }
            Ok(Event::Text(t)) if in_statement => {
                if let Ok(text) = t.unescape() {
                    values.push(text.into_owned());
                }
            }
            Ok(Event::End(_)) => in_statement = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    values
}

fn resource_attr(e: &BytesStart<'_>) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == b"resource")
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Add a statement to the first description, dropping any existing
/// statements with the same qualified name when `replace` is set.
///
/// Blank input starts from [`empty_rels`].
pub fn set_statement(rels: &[u8], pid: &str, statement: &Statement, replace: bool) -> Result<String> {
    let owned;
    let input: &[u8] = if rels.iter().all(|b| b.is_ascii_whitespace()) {
        owned = empty_rels(pid);
        owned.as_bytes()
    } else {
        rels
    };

    let qname = statement.qname();
    let mut reader = Reader::from_reader(input);
    let mut writer = Writer::new(Vec::new());
    let mut inserted = false;

    loop {
        let event = reader.read_event().map_err(xml_err)?;
        match event {
            Event::Start(ref e) if replace && e.name().as_ref() == qname.as_bytes() => {
                reader.read_to_end(QName(qname.as_bytes())).map_err(xml_err)?;
            }
            Event::Empty(ref e) if replace && e.name().as_ref() == qname.as_bytes() => {}
            Event::Empty(ref e) if !inserted && e.local_name().as_ref() == b"Description" => {
                // expand <rdf:Description .../> so the statement fits inside
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer.write_event(Event::Start(e.clone()))?;
                statement.write(&mut writer)?;
                writer.write_event(Event::End(BytesEnd::new(name)))?;
                inserted = true;
            }
            Event::End(ref e) if !inserted && e.local_name().as_ref() == b"Description" => {
                statement.write(&mut writer)?;
                inserted = true;
                writer.write_event(Event::End(e.clone()))?;
            }
            Event::End(ref e) if !inserted && e.local_name().as_ref() == b"RDF" => {
                let mut desc = BytesStart::new("rdf:Description");
                desc.push_attribute(("rdf:about", format!("info:fedora/{}", pid).as_str()));
                writer.write_event(Event::Start(desc))?;
                statement.write(&mut writer)?;
                writer.write_event(Event::End(BytesEnd::new("rdf:Description")))?;
                inserted = true;
                writer.write_event(Event::End(e.clone()))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    if !inserted {
        return Err(RepoError::Xml("RELS-EXT has no rdf:RDF element".to_string()));
    }
    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

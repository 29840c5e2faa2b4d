//! FOXML 1.1 object serialization
//!
//! - [`write_object`] serializes an object for ingest
//! - [`parse_object`] reads an export/ingest document back
//! - [`ExportRewriter`] / [`rewrite_export`] rewrite an export stream on the
//!   fly, dropping recorded digests for selected datastreams and optionally
//!   replacing managed binary content by source URLs

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use std::collections::BTreeSet;

use crate::client::ByteStream;
use crate::error::{RepoError, Result};
use crate::model::{ControlGroup, ObjectState, format_fedora_time, parse_fedora_time};

/// FOXML namespace
pub const FOXML_NS: &str = "info:fedora/fedora-system:def/foxml#";

const MODEL_NS: &str = "info:fedora/fedora-system:def/model#";
const VIEW_NS: &str = "info:fedora/fedora-system:def/view#";

/// Object-level properties carried in `objectProperties`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoxmlProperties {
    pub state: ObjectState,
    pub label: Option<String>,
    pub owner: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Recorded `contentDigest`
#[derive(Debug, Clone, PartialEq)]
pub struct FoxmlDigest {
    /// Declared algorithm name, as written (`MD5`, `SHA-256`, `DISABLED`, ...)
    pub algorithm: String,
    pub digest: Option<String>,
}

/// Content of one datastream version
#[derive(Debug, Clone, PartialEq)]
pub enum FoxmlContent {
    /// Inline XML, kept verbatim
    Xml(String),
    /// Decoded `binaryContent`
    Binary(Bytes),
    Location { reference: String, kind: String },
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoxmlVersion {
    pub id: String,
    pub label: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub mimetype: String,
    pub format_uri: Option<String>,
    pub size: Option<u64>,
    pub digest: Option<FoxmlDigest>,
    pub content: FoxmlContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoxmlDatastream {
    pub id: String,
    pub control_group: ControlGroup,
    pub state: ObjectState,
    pub versionable: bool,
    /// Oldest first
    pub versions: Vec<FoxmlVersion>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoxmlObject {
    pub pid: Option<String>,
    pub properties: FoxmlProperties,
    pub datastreams: Vec<FoxmlDatastream>,
}

impl FoxmlObject {
    pub fn datastream(&self, dsid: &str) -> Option<&FoxmlDatastream> {
        self.datastreams.iter().find(|ds| ds.id == dsid)
    }
}

// ─────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────

/// Serialize an object as a FOXML document
pub fn write_object(obj: &FoxmlObject) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("foxml:digitalObject");
    root.push_attribute(("VERSION", "1.1"));
    if let Some(pid) = &obj.pid {
        root.push_attribute(("PID", pid.as_str()));
    }
    root.push_attribute(("xmlns:foxml", FOXML_NS));
    writer.write_event(Event::Start(root))?;

    write_properties(&mut writer, &obj.properties)?;
    for ds in &obj.datastreams {
        write_datastream(&mut writer, ds)?;
    }

    writer.write_event(Event::End(BytesEnd::new("foxml:digitalObject")))?;
    Ok(writer.into_inner())
}

fn write_property(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<()> {
    let mut prop = BytesStart::new("foxml:property");
    prop.push_attribute(("NAME", name));
    prop.push_attribute(("VALUE", value));
    writer.write_event(Event::Empty(prop))?;
    Ok(())
}

fn write_properties(writer: &mut Writer<Vec<u8>>, props: &FoxmlProperties) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("foxml:objectProperties")))?;
    write_property(writer, &format!("{}state", MODEL_NS), props.state.code())?;
    if let Some(label) = &props.label {
        write_property(writer, &format!("{}label", MODEL_NS), label)?;
    }
    if let Some(owner) = &props.owner {
        write_property(writer, &format!("{}ownerId", MODEL_NS), owner)?;
    }
    if let Some(created) = &props.created {
        write_property(writer, &format!("{}createdDate", MODEL_NS), &format_fedora_time(created))?;
    }
    if let Some(modified) = &props.modified {
        write_property(writer, &format!("{}lastModifiedDate", VIEW_NS), &format_fedora_time(modified))?;
    }
    writer.write_event(Event::End(BytesEnd::new("foxml:objectProperties")))?;
    Ok(())
}

fn write_datastream(writer: &mut Writer<Vec<u8>>, ds: &FoxmlDatastream) -> Result<()> {
    let mut start = BytesStart::new("foxml:datastream");
    start.push_attribute(("ID", ds.id.as_str()));
    start.push_attribute(("STATE", ds.state.code()));
    start.push_attribute(("CONTROL_GROUP", ds.control_group.code()));
    start.push_attribute(("VERSIONABLE", if ds.versionable { "true" } else { "false" }));
    writer.write_event(Event::Start(start))?;

    for version in &ds.versions {
        let mut vstart = BytesStart::new("foxml:datastreamVersion");
        vstart.push_attribute(("ID", version.id.as_str()));
        if let Some(label) = &version.label {
            vstart.push_attribute(("LABEL", label.as_str()));
        }
        if let Some(created) = &version.created {
            vstart.push_attribute(("CREATED", format_fedora_time(created).as_str()));
        }
        vstart.push_attribute(("MIMETYPE", version.mimetype.as_str()));
        if let Some(format_uri) = &version.format_uri {
            vstart.push_attribute(("FORMAT_URI", format_uri.as_str()));
        }
        if let Some(size) = version.size {
            vstart.push_attribute(("SIZE", size.to_string().as_str()));
        }
        writer.write_event(Event::Start(vstart))?;

        if let Some(digest) = &version.digest {
            let mut d = BytesStart::new("foxml:contentDigest");
            d.push_attribute(("TYPE", digest.algorithm.as_str()));
            if let Some(value) = &digest.digest {
                d.push_attribute(("DIGEST", value.as_str()));
            }
            writer.write_event(Event::Empty(d))?;
        }

        match &version.content {
            FoxmlContent::Xml(xml) => {
                writer.write_event(Event::Start(BytesStart::new("foxml:xmlContent")))?;
                writer.write_event(Event::Text(BytesText::from_escaped(strip_xml_decl(xml))))?;
                writer.write_event(Event::End(BytesEnd::new("foxml:xmlContent")))?;
            }
            FoxmlContent::Binary(data) => {
                writer.write_event(Event::Start(BytesStart::new("foxml:binaryContent")))?;
                let encoded = BASE64.encode(data);
                writer.write_event(Event::Text(BytesText::from_escaped(encoded.as_str())))?;
                writer.write_event(Event::End(BytesEnd::new("foxml:binaryContent")))?;
            }
            FoxmlContent::Location { reference, kind } => {
                let mut loc = BytesStart::new("foxml:contentLocation");
                loc.push_attribute(("REF", reference.as_str()));
                loc.push_attribute(("TYPE", kind.as_str()));
                writer.write_event(Event::Empty(loc))?;
            }
            FoxmlContent::Empty => {}
        }

        writer.write_event(Event::End(BytesEnd::new("foxml:datastreamVersion")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("foxml:datastream")))?;
    Ok(())
}

/// Inline XML must not carry its own declaration once embedded
fn strip_xml_decl(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

// ─────────────────────────────────────────────────────
// Reading
// ─────────────────────────────────────────────────────

fn xml_err(e: impl std::fmt::Display) -> RepoError {
    RepoError::Xml(e.to_string())
}

/// Read a named attribute, unescaped
pub(crate) fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(xml_err)?;
        if a.key.as_ref() == name {
            return Ok(Some(a.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn required_attr(e: &BytesStart<'_>, name: &[u8]) -> Result<String> {
    attr(e, name)?.ok_or_else(|| {
        RepoError::Xml(format!(
            "<{}> is missing {}",
            String::from_utf8_lossy(e.name().as_ref()),
            String::from_utf8_lossy(name)
        ))
    })
}

/// Parse a FOXML document
pub fn parse_object(data: &[u8]) -> Result<FoxmlObject> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut obj = FoxmlObject::default();
    let mut current_ds: Option<FoxmlDatastream> = None;
    let mut current_version: Option<FoxmlVersion> = None;
    let mut seen_root = false;

    loop {
        let event = reader.read_event().map_err(xml_err)?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"digitalObject" => {
                        seen_root = true;
                        obj.pid = attr(e, b"PID")?;
                    }
                    b"property" => {
                        let name = required_attr(e, b"NAME")?;
                        let value = attr(e, b"VALUE")?.unwrap_or_default();
                        apply_property(&mut obj.properties, &name, value)?;
                    }
                    b"datastream" => {
                        let control_group = attr(e, b"CONTROL_GROUP")?
                            .and_then(|c| ControlGroup::from_code(&c))
                            .unwrap_or_default();
                        let ds = FoxmlDatastream {
                            id: required_attr(e, b"ID")?,
                            control_group,
                            state: attr(e, b"STATE")?
                                .and_then(|s| ObjectState::from_code(&s))
                                .unwrap_or_default(),
                            versionable: attr(e, b"VERSIONABLE")?.map(|v| v != "false").unwrap_or(true),
                            versions: Vec::new(),
                        };
                        if is_start {
                            current_ds = Some(ds);
                        } else {
                            obj.datastreams.push(ds);
                        }
                    }
                    b"datastreamVersion" => {
                        let version = FoxmlVersion {
                            id: required_attr(e, b"ID")?,
                            label: attr(e, b"LABEL")?,
                            created: attr(e, b"CREATED")?.map(|c| parse_fedora_time(&c)).transpose()?,
                            mimetype: attr(e, b"MIMETYPE")?.unwrap_or_default(),
                            format_uri: attr(e, b"FORMAT_URI")?,
                            size: attr(e, b"SIZE")?.and_then(|s| s.parse().ok()),
                            digest: None,
                            content: FoxmlContent::Empty,
                        };
                        if is_start {
                            current_version = Some(version);
                        } else if let Some(ds) = current_ds.as_mut() {
                            ds.versions.push(version);
                        }
                    }
                    b"contentDigest" => {
                        if let Some(v) = current_version.as_mut() {
                            v.digest = Some(FoxmlDigest {
                                algorithm: attr(e, b"TYPE")?.unwrap_or_else(|| "MD5".to_string()),
                                digest: attr(e, b"DIGEST")?,
                            });
                        }
                    }
                    b"contentLocation" => {
                        if let Some(v) = current_version.as_mut() {
                            v.content = FoxmlContent::Location {
                                reference: required_attr(e, b"REF")?,
                                kind: attr(e, b"TYPE")?.unwrap_or_else(|| "URL".to_string()),
                            };
                        }
                    }
                    b"xmlContent" if is_start => {
                        let name = e.name().as_ref().to_vec();
                        let span = reader.read_to_end(QName(&name)).map_err(xml_err)?;
                        let inner = &data[span.start as usize..span.end as usize];
                        if let Some(v) = current_version.as_mut() {
                            v.content = FoxmlContent::Xml(String::from_utf8_lossy(inner).trim().to_string());
                        }
                    }
                    b"binaryContent" if is_start => {
                        let name = e.name().as_ref().to_vec();
                        let span = reader.read_to_end(QName(&name)).map_err(xml_err)?;
                        let encoded: Vec<u8> = data[span.start as usize..span.end as usize]
                            .iter()
                            .copied()
                            .filter(|b| !b.is_ascii_whitespace())
                            .collect();
                        let decoded = BASE64
                            .decode(&encoded)
                            .map_err(|e| RepoError::Xml(format!("Invalid binaryContent: {}", e)))?;
                        if let Some(v) = current_version.as_mut() {
                            v.content = FoxmlContent::Binary(Bytes::from(decoded));
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"datastreamVersion" => {
                    if let (Some(v), Some(ds)) = (current_version.take(), current_ds.as_mut()) {
                        ds.versions.push(v);
                    }
                }
                b"datastream" => {
                    if let Some(ds) = current_ds.take() {
                        obj.datastreams.push(ds);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(RepoError::Xml("Not a FOXML document: no digitalObject element".to_string()));
    }
    Ok(obj)
}

fn apply_property(props: &mut FoxmlProperties, name: &str, value: String) -> Result<()> {
    let key = name.rsplit('#').next().unwrap_or(name);
    match key {
        "state" => props.state = ObjectState::from_code(&value).unwrap_or_default(),
        "label" => props.label = Some(value),
        "ownerId" => props.owner = Some(value),
        "createdDate" => props.created = Some(parse_fedora_time(&value)?),
        "lastModifiedDate" => props.modified = Some(parse_fedora_time(&value)?),
        _ => {}
    }
    Ok(())
}

// ─────────────────────────────────────────────────────
// Digest stripping
// ─────────────────────────────────────────────────────

/// Resolves the URL the content of a datastream version can be fetched
/// from, given `(pid, dsid, version created)`
pub type ContentLocator = Box<dyn Fn(&str, &str, Option<DateTime<Utc>>) -> Option<String> + Send>;

/// Streaming rewriter for export documents.
///
/// - removes the `DIGEST` attribute from `contentDigest` elements of the
///   selected datastreams; `TYPE` is kept so the receiving repository
///   recomputes a digest of the declared kind
/// - with a [`ContentLocator`], replaces the `binaryContent` of managed
///   versions (other than `text/xml`) by a `contentLocation` URL
///
/// Only markup is buffered (one tag at a time); text, including base64
/// binary content of any length, is passed through (or dropped) as it
/// arrives.
pub struct ExportRewriter {
    strip: BTreeSet<String>,
    locator: Option<ContentLocator>,
    pid: Option<String>,
    current_ds: Option<String>,
    current_managed: bool,
    version_created: Option<DateTime<Utc>>,
    version_mimetype: Option<String>,
    /// Inside a `binaryContent` that was replaced
    skipping: bool,
    tag: Vec<u8>,
    in_tag: bool,
    quote: Option<u8>,
    stripped: usize,
    externalized: usize,
}

impl ExportRewriter {
    /// Rewriter that strips the digests of `strip`
    pub fn new(strip: BTreeSet<String>) -> Self {
        Self {
            strip,
            locator: None,
            pid: None,
            current_ds: None,
            current_managed: false,
            version_created: None,
            version_mimetype: None,
            skipping: false,
            tag: Vec::new(),
            in_tag: false,
            quote: None,
            stripped: 0,
            externalized: 0,
        }
    }

    /// Also move managed binary content out of the document
    pub fn with_locator(mut self, locator: ContentLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Number of digests removed so far
    pub fn stripped(&self) -> usize {
        self.stripped
    }

    /// Number of versions whose content was replaced by a location
    pub fn externalized(&self) -> usize {
        self.externalized
    }

    /// Process one chunk, returning the bytes that can be emitted now
    pub fn process(&mut self, chunk: &[u8]) -> Result<Bytes> {
        let mut out = Vec::with_capacity(chunk.len());
        let mut pos = 0;
        while pos < chunk.len() {
            if !self.in_tag {
                match chunk[pos..].iter().position(|&b| b == b'<') {
                    Some(offset) => {
                        if !self.skipping {
                            out.extend_from_slice(&chunk[pos..pos + offset]);
                        }
                        pos += offset;
                        self.in_tag = true;
                        self.quote = None;
                        self.tag.clear();
                    }
                    None => {
                        if !self.skipping {
                            out.extend_from_slice(&chunk[pos..]);
                        }
                        break;
                    }
                }
            }

            // inside markup: accumulate until the tag closes
            while pos < chunk.len() {
                let b = chunk[pos];
                self.tag.push(b);
                pos += 1;
                if self.closes_tag(b) {
                    let tag = std::mem::take(&mut self.tag);
                    out.extend_from_slice(&self.rewrite_tag(tag)?);
                    self.in_tag = false;
                    break;
                }
            }
        }
        Ok(Bytes::from(out))
    }

    /// Flush anything still buffered at end of input
    pub fn finish(&mut self) -> Bytes {
        self.in_tag = false;
        Bytes::from(std::mem::take(&mut self.tag))
    }

    fn closes_tag(&mut self, b: u8) -> bool {
        let tag = &self.tag;
        if tag.len() >= 2 && tag[1] == b'!' {
            if tag.starts_with(b"<!--") {
                return tag.len() >= 7 && tag.ends_with(b"-->");
            }
            if tag.starts_with(b"<![CDATA[") {
                return tag.len() >= 12 && tag.ends_with(b"]]>");
            }
            if b"<![CDATA[".starts_with(tag) || b"<!--".starts_with(tag) {
                return false;
            }
            return b == b'>';
        }
        match (self.quote, b) {
            (Some(q), _) if q == b => {
                self.quote = None;
                false
            }
            (Some(_), _) => false,
            (None, b'"') | (None, b'\'') => {
                self.quote = Some(b);
                false
            }
            (None, b'>') => true,
            _ => false,
        }
    }

    fn rewrite_tag(&mut self, tag: Vec<u8>) -> Result<Vec<u8>> {
        if tag.len() < 3 || tag[1] == b'!' || tag[1] == b'?' {
            return Ok(tag);
        }
        let closing = tag[1] == b'/';
        let name_start = if closing { 2 } else { 1 };
        let name_end = tag[name_start..]
            .iter()
            .position(|b| b.is_ascii_whitespace() || *b == b'/' || *b == b'>')
            .map(|p| p + name_start)
            .unwrap_or(tag.len());
        let qname = &tag[name_start..name_end];
        let (prefix, local) = match qname.iter().position(|&b| b == b':') {
            Some(i) => (&qname[..=i], &qname[i + 1..]),
            None => (&qname[..0], qname),
        };

        match (local, closing) {
            (b"digitalObject", false) => {
                if let Some(start) = parse_single_tag(&tag)? {
                    self.pid = attr(&start, b"PID")?;
                }
                Ok(tag)
            }
            (b"datastream", true) => {
                self.current_ds = None;
                self.current_managed = false;
                Ok(tag)
            }
            (b"datastream", false) => {
                if let Some(start) = parse_single_tag(&tag)? {
                    self.current_ds = attr(&start, b"ID")?;
                    self.current_managed = attr(&start, b"CONTROL_GROUP")?.as_deref() == Some("M");
                }
                Ok(tag)
            }
            (b"datastreamVersion", false) => {
                if let Some(start) = parse_single_tag(&tag)? {
                    self.version_created = attr(&start, b"CREATED")?.and_then(|v| parse_fedora_time(&v).ok());
                    self.version_mimetype = attr(&start, b"MIMETYPE")?;
                }
                Ok(tag)
            }
            (b"binaryContent", false) if !tag.ends_with(b"/>") => {
                let prefix = String::from_utf8_lossy(prefix).into_owned();
                match self.content_location()? {
                    Some(url) => {
                        self.skipping = true;
                        self.externalized += 1;
                        let mut location = BytesStart::new(format!("{}contentLocation", prefix));
                        location.push_attribute(("TYPE", "URL"));
                        location.push_attribute(("REF", url.as_str()));
                        let mut writer = Writer::new(Vec::new());
                        writer.write_event(Event::Empty(location))?;
                        Ok(writer.into_inner())
                    }
                    None => Ok(tag),
                }
            }
            (b"binaryContent", true) if self.skipping => {
                self.skipping = false;
                Ok(Vec::new())
            }
            (b"contentDigest", false) => {
                let strip = self
                    .current_ds
                    .as_ref()
                    .map(|id| self.strip.contains(id))
                    .unwrap_or(false);
                if !strip {
                    return Ok(tag);
                }
                let rewritten = remove_attribute(&tag, b"DIGEST")?;
                if rewritten.len() != tag.len() {
                    self.stripped += 1;
                    tracing::debug!(
                        "Stripped recorded digest from datastream {}",
                        self.current_ds.as_deref().unwrap_or("?")
                    );
                }
                Ok(rewritten)
            }
            _ => Ok(tag),
        }
    }

    /// URL replacing the binary content of the current version, if any
    fn content_location(&self) -> Result<Option<String>> {
        let locator = match &self.locator {
            Some(locator) if self.current_managed => locator,
            _ => return Ok(None),
        };
        if self.version_mimetype.as_deref() == Some("text/xml") {
            return Ok(None);
        }
        match (&self.pid, &self.current_ds) {
            (Some(pid), Some(dsid)) => Ok(locator(pid, dsid, self.version_created)),
            _ => Err(RepoError::Xml("binaryContent outside of an identified datastream".to_string())),
        }
    }
}

/// Parse one isolated start or empty tag
fn parse_single_tag(tag: &[u8]) -> Result<Option<BytesStart<'static>>> {
    let mut reader = Reader::from_reader(tag);
    match reader.read_event().map_err(xml_err)? {
        Event::Start(e) | Event::Empty(e) => Ok(Some(e.into_owned())),
        _ => Ok(None),
    }
}

fn remove_attribute(tag: &[u8], name: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(tag);
    let (start, empty) = match reader.read_event().map_err(xml_err)? {
        Event::Start(e) => (e, false),
        Event::Empty(e) => (e, true),
        _ => return Ok(tag.to_vec()),
    };

    let tag_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(tag_name);
    let mut removed = false;
    for a in start.attributes() {
        let a = a.map_err(xml_err)?;
        if a.key.as_ref() == name {
            removed = true;
        } else {
            rebuilt.push_attribute(a);
        }
    }
    if !removed {
        return Ok(tag.to_vec());
    }

    let mut writer = Writer::new(Vec::new());
    if empty {
        writer.write_event(Event::Empty(rebuilt))?;
    } else {
        writer.write_event(Event::Start(rebuilt))?;
    }
    Ok(writer.into_inner())
}

/// Wrap an export stream so that digests of the given datastreams are removed
pub fn strip_digests(stream: ByteStream, dsids: BTreeSet<String>) -> ByteStream {
    rewrite_export(stream, ExportRewriter::new(dsids))
}

/// Pass an export stream through a rewriter
pub fn rewrite_export(stream: ByteStream, rewriter: ExportRewriter) -> ByteStream {
    let state = Some((stream, rewriter));
    Box::pin(futures::stream::unfold(state, |state| async move {
        let (mut inner, mut rewriter) = state?;
        match inner.try_next().await {
            Ok(Some(chunk)) => match rewriter.process(&chunk) {
                Ok(out) => Some((Ok(out), Some((inner, rewriter)))),
                Err(e) => Some((Err(e), None)),
            },
            Ok(None) => {
                if rewriter.stripped() > 0 {
                    tracing::info!("Removed {} recorded digest(s) from export", rewriter.stripped());
                }
                if rewriter.externalized() > 0 {
                    tracing::info!("Replaced {} binary content(s) with locations", rewriter.externalized());
                }
                Some((Ok(rewriter.finish()), None))
            }
            Err(e) => Some((Err(e), None)),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::collect_bytes;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<foxml:digitalObject VERSION="1.1" PID="synctest:1" xmlns:foxml="info:fedora/fedora-system:def/foxml#">
<foxml:objectProperties>
<foxml:property NAME="info:fedora/fedora-system:def/model#state" VALUE="A"/>
<foxml:property NAME="info:fedora/fedora-system:def/model#label" VALUE="Sync test"/>
<foxml:property NAME="info:fedora/fedora-system:def/model#ownerId" VALUE="fedoraAdmin"/>
</foxml:objectProperties>
<foxml:datastream ID="DC" STATE="A" CONTROL_GROUP="X" VERSIONABLE="true">
<foxml:datastreamVersion ID="DC.2" LABEL="Dublin Core" CREATED="2012-10-11T14:13:03.658Z" MIMETYPE="text/xml" SIZE="771">
<foxml:contentDigest TYPE="MD5" DIGEST="f53aec07f2607f536bac7ee03dbbfe7c"/>
<foxml:xmlContent>
<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>A &amp; B</dc:title></oai_dc:dc>
</foxml:xmlContent>
</foxml:datastreamVersion>
</foxml:datastream>
<foxml:datastream ID="TEXT" STATE="A" CONTROL_GROUP="M" VERSIONABLE="false">
<foxml:datastreamVersion ID="TEXT.0" LABEL="text" CREATED="2012-10-11T14:13:04.000Z" MIMETYPE="text/plain" SIZE="11">
<foxml:contentDigest TYPE="MD5" DIGEST="5eb63bbbe01eeed093cb22bb8f5acdc3"/>
<foxml:binaryContent>
aGVsbG8g
d29ybGQ=
</foxml:binaryContent>
</foxml:datastreamVersion>
</foxml:datastream>
</foxml:digitalObject>"#;

    #[test]
    fn test_parse_sample() {
        let obj = parse_object(SAMPLE.as_bytes()).unwrap();
        assert_eq!(obj.pid.as_deref(), Some("synctest:1"));
        assert_eq!(obj.properties.label.as_deref(), Some("Sync test"));
        assert_eq!(obj.properties.owner.as_deref(), Some("fedoraAdmin"));
        assert_eq!(obj.datastreams.len(), 2);

        let dc = obj.datastream("DC").unwrap();
        assert_eq!(dc.control_group, ControlGroup::Inline);
        let v = &dc.versions[0];
        assert_eq!(v.id, "DC.2");
        assert_eq!(v.size, Some(771));
        assert_eq!(v.digest.as_ref().unwrap().digest.as_deref(), Some("f53aec07f2607f536bac7ee03dbbfe7c"));
        match &v.content {
            FoxmlContent::Xml(xml) => {
                assert!(xml.starts_with("<oai_dc:dc"));
                assert!(xml.contains("A &amp; B"));
            }
            other => panic!("unexpected content {:?}", other),
        }

        let text = obj.datastream("TEXT").unwrap();
        assert!(!text.versionable);
        assert_eq!(text.versions[0].content, FoxmlContent::Binary(Bytes::from_static(b"hello world")));
    }

    #[test]
    fn test_write_then_parse_preserves_content() {
        let obj = parse_object(SAMPLE.as_bytes()).unwrap();
        let written = write_object(&obj).unwrap();
        let reparsed = parse_object(&written).unwrap();
        assert_eq!(reparsed, obj);
    }

    #[test]
    fn test_parse_rejects_non_foxml() {
        assert!(parse_object(b"<html><body/></html>").is_err());
    }

    #[test]
    fn test_strip_xml_decl() {
        assert_eq!(strip_xml_decl("<?xml version=\"1.0\"?>\n<a/>"), "<a/>");
        assert_eq!(strip_xml_decl("<a/>"), "<a/>");
    }

    fn strip_all(input: &[u8], dsids: &[&str], chunk_size: usize) -> String {
        let mut stripper = ExportRewriter::new(dsids.iter().map(|s| s.to_string()).collect());
        let mut out = Vec::new();
        for chunk in input.chunks(chunk_size) {
            out.extend_from_slice(&stripper.process(chunk).unwrap());
        }
        out.extend_from_slice(&stripper.finish());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_stripper_removes_only_selected_digests() {
        let out = strip_all(SAMPLE.as_bytes(), &["DC"], 4096);
        assert!(!out.contains("f53aec07f2607f536bac7ee03dbbfe7c"));
        assert!(out.contains("5eb63bbbe01eeed093cb22bb8f5acdc3"));

        let obj = parse_object(out.as_bytes()).unwrap();
        let dc_digest = obj.datastream("DC").unwrap().versions[0].digest.clone().unwrap();
        assert_eq!(dc_digest.algorithm, "MD5");
        assert!(dc_digest.digest.is_none());
    }

    #[test]
    fn test_stripper_is_chunking_independent() {
        let whole = strip_all(SAMPLE.as_bytes(), &["DC", "TEXT"], SAMPLE.len());
        for size in [1, 2, 7, 64, 250] {
            assert_eq!(strip_all(SAMPLE.as_bytes(), &["DC", "TEXT"], size), whole, "chunk size {}", size);
        }
        assert!(!whole.contains("DIGEST="));
    }

    #[test]
    fn test_stripper_passthrough_when_nothing_selected() {
        let out = strip_all(SAMPLE.as_bytes(), &[], 13);
        assert_eq!(out, SAMPLE);
    }

    #[test]
    fn test_stripper_handles_gt_in_attribute_and_comment() {
        let input = r#"<a t="x>y"><!-- <b> --><foxml:datastream ID="DC"><c/><foxml:contentDigest TYPE="MD5" DIGEST="abc"/></foxml:datastream></a>"#;
        let out = strip_all(input.as_bytes(), &["DC"], 3);
        assert_eq!(
            out,
            r#"<a t="x>y"><!-- <b> --><foxml:datastream ID="DC"><c/><foxml:contentDigest TYPE="MD5"/></foxml:datastream></a>"#
        );
    }

    fn locate(pid: &str, dsid: &str, created: Option<DateTime<Utc>>) -> Option<String> {
        let created = created.map(|c| format_fedora_time(&c)).unwrap_or_default();
        Some(format!("http://source/{}/{}?at={}&x=1", pid, dsid, created))
    }

    fn externalize_all(input: &[u8], chunk_size: usize) -> (String, usize) {
        let mut rewriter = ExportRewriter::new(BTreeSet::new()).with_locator(Box::new(locate));
        let mut out = Vec::new();
        for chunk in input.chunks(chunk_size) {
            out.extend_from_slice(&rewriter.process(chunk).unwrap());
        }
        out.extend_from_slice(&rewriter.finish());
        (String::from_utf8(out).unwrap(), rewriter.externalized())
    }

    #[test]
    fn test_managed_content_replaced_by_location() {
        let (out, count) = externalize_all(SAMPLE.as_bytes(), 4096);
        assert_eq!(count, 1);
        assert!(!out.contains("binaryContent"));
        assert!(!out.contains("aGVsbG8g"));

        let obj = parse_object(out.as_bytes()).unwrap();
        let text = &obj.datastream("TEXT").unwrap().versions[0];
        assert_eq!(
            text.content,
            FoxmlContent::Location {
                reference: "http://source/synctest:1/TEXT?at=2012-10-11T14:13:04.000Z&x=1".to_string(),
                kind: "URL".to_string(),
            }
        );
        // digest kept for the destination to verify
        assert_eq!(
            text.digest.as_ref().unwrap().digest.as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        // inline XML stays in the document
        assert!(matches!(obj.datastream("DC").unwrap().versions[0].content, FoxmlContent::Xml(_)));

        for size in [1, 5, 33] {
            assert_eq!(externalize_all(SAMPLE.as_bytes(), size).0, out, "chunk size {}", size);
        }
    }

    #[test]
    fn test_managed_xml_stays_inline() {
        let input = SAMPLE.replace(
            r#"MIMETYPE="text/plain" SIZE="11""#,
            r#"MIMETYPE="text/xml" SIZE="11""#,
        );
        let (out, count) = externalize_all(input.as_bytes(), 64);
        assert_eq!(count, 0);
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_strip_digests_stream() {
        let chunks: Vec<Result<Bytes>> = SAMPLE
            .as_bytes()
            .chunks(17)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let dsids: BTreeSet<String> = ["DC".to_string()].into_iter().collect();
        let out = collect_bytes(strip_digests(stream, dsids)).await.unwrap();
        let out = String::from_utf8(out.to_vec()).unwrap();
        assert!(!out.contains("f53aec07f2607f536bac7ee03dbbfe7c"));
        assert!(out.contains("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }
}

//! Parsing of REST API responses
//!
//! The repository answers metadata requests (`format=xml`) with small flat
//! documents: one record element whose children carry one value each. The
//! resource index answers queries as CSV.

use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashMap;

use crate::client::{DatastreamInfo, QueryRow};
use crate::error::{RepoError, Result};
use crate::model::{
    ChecksumAlgorithm, ControlGroup, DatastreamDescriptor, DatastreamVersion, ObjectProfile, ObjectState,
    parse_fedora_time,
};

fn xml_err(e: impl std::fmt::Display) -> RepoError {
    RepoError::Xml(e.to_string())
}

/// One record element: its attributes and the text of its children
#[derive(Debug, Default)]
struct Record {
    attrs: HashMap<String, String>,
    fields: HashMap<String, String>,
    /// Repeated `<model>` children
    models: Vec<String>,
}

impl Record {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }
}

fn local_name(raw: &[u8]) -> String {
    let local = match raw.iter().position(|&b| b == b':') {
        Some(i) => &raw[i + 1..],
        None => raw,
    };
    String::from_utf8_lossy(local).into_owned()
}

fn read_attrs(e: &quick_xml::events::BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for a in e.attributes() {
        let a = a.map_err(xml_err)?;
        attrs.insert(
            local_name(a.key.as_ref()),
            a.unescape_value().map_err(xml_err)?.into_owned(),
        );
    }
    Ok(attrs)
}

/// Collect every `tag` element in the document
fn records(xml: &[u8], tag: &str) -> Result<Vec<Record>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut current: Option<Record> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                if name == tag {
                    current = Some(Record {
                        attrs: read_attrs(&e)?,
                        ..Default::default()
                    });
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Event::Empty(e) => {
                if local_name(e.name().as_ref()) == tag {
                    out.push(Record {
                        attrs: read_attrs(&e)?,
                        ..Default::default()
                    });
                }
            }
            Event::Text(t) => {
                if let (Some(rec), Some(name)) = (current.as_mut(), field.as_ref()) {
                    let text = t.unescape().map_err(xml_err)?.into_owned();
                    if name == "model" {
                        rec.models.push(text);
                    } else {
                        rec.fields.entry(name.clone()).or_default().push_str(&text);
                    }
                }
            }
            Event::End(e) => {
                if local_name(e.name().as_ref()) == tag {
                    if let Some(rec) = current.take() {
                        out.push(rec);
                    }
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn parse_time_opt(value: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    value.map(parse_fedora_time).transpose()
}

/// Parse an `objectProfile` document
pub fn parse_object_profile(pid: &str, xml: &[u8]) -> Result<ObjectProfile> {
    let rec = records(xml, "objectProfile")?
        .into_iter()
        .next()
        .ok_or_else(|| RepoError::Xml(format!("No objectProfile in response for {}", pid)))?;

    Ok(ObjectProfile {
        pid: rec.attr("pid").unwrap_or(pid).to_string(),
        label: rec.field("objLabel").map(str::to_string),
        owner: rec.field("objOwnerId").map(str::to_string),
        state: rec
            .field("objState")
            .and_then(ObjectState::from_code)
            .unwrap_or_default(),
        created: parse_time_opt(rec.field("objCreateDate"))?,
        modified: parse_time_opt(rec.field("objLastModDate"))?,
        content_models: rec.models,
    })
}

/// Parse an `objectDatastreams` listing into ids, in document order
pub fn parse_datastream_list(xml: &[u8]) -> Result<Vec<String>> {
    Ok(records(xml, "datastream")?
        .into_iter()
        .filter_map(|rec| rec.attrs.get("dsid").cloned())
        .collect())
}

fn version_from_record(dsid: &str, rec: &Record) -> Result<DatastreamVersion> {
    let control_group = rec
        .field("dsControlGroup")
        .and_then(ControlGroup::from_code)
        .unwrap_or_default();
    let created = rec
        .field("dsCreateDate")
        .map(parse_fedora_time)
        .transpose()?
        .ok_or_else(|| RepoError::Xml(format!("Datastream {} profile has no dsCreateDate", dsid)))?;
    let digest = rec
        .field("dsChecksum")
        .filter(|d| !d.eq_ignore_ascii_case("none"))
        .map(|d| d.to_ascii_lowercase());
    let location = match control_group {
        ControlGroup::Redirect | ControlGroup::External => rec.field("dsLocation").map(str::to_string),
        _ => None,
    };

    Ok(DatastreamVersion {
        dsid: rec.attr("dsID").unwrap_or(dsid).to_string(),
        version_id: rec.field("dsVersionID").unwrap_or_default().to_string(),
        label: rec.field("dsLabel").unwrap_or_default().to_string(),
        mimetype: rec.field("dsMIME").unwrap_or_default().to_string(),
        created,
        size: rec.field("dsSize").and_then(|s| s.parse().ok()).unwrap_or(0),
        digest,
        algorithm: rec.field("dsChecksumType").and_then(ChecksumAlgorithm::from_name),
        location,
    })
}

/// Parse a `datastreamProfile` document into descriptor and current version
pub fn parse_datastream_profile(dsid: &str, xml: &[u8]) -> Result<DatastreamInfo> {
    let rec = records(xml, "datastreamProfile")?
        .into_iter()
        .next()
        .ok_or_else(|| RepoError::Xml(format!("No datastreamProfile in response for {}", dsid)))?;
    let version = version_from_record(dsid, &rec)?;

    let descriptor = DatastreamDescriptor {
        id: version.dsid.clone(),
        label: version.label.clone(),
        mimetype: version.mimetype.clone(),
        versionable: rec.field("dsVersionable").map(|v| v == "true").unwrap_or(true),
        control_group: rec
            .field("dsControlGroup")
            .and_then(ControlGroup::from_code)
            .unwrap_or_default(),
        checksum_type: version.algorithm.unwrap_or(ChecksumAlgorithm::Disabled),
        format_uri: rec.field("dsFormatURI").map(str::to_string),
        state: rec
            .field("dsState")
            .and_then(ObjectState::from_code)
            .unwrap_or_default(),
    };
    Ok(DatastreamInfo { descriptor, version })
}

/// Parse a `datastreamHistory` document; versions are returned oldest first
pub fn parse_datastream_history(dsid: &str, xml: &[u8]) -> Result<Vec<DatastreamVersion>> {
    let mut versions = records(xml, "datastreamProfile")?
        .iter()
        .map(|rec| version_from_record(dsid, rec))
        .collect::<Result<Vec<_>>>()?;
    versions.sort_by_key(|v| v.created);
    Ok(versions)
}

/// Split one CSV line, honoring double-quoted fields
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Parse resource-index CSV output; the first line names the columns
pub fn parse_csv_rows(text: &str) -> Vec<QueryRow> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(h) => split_csv_line(h),
        None => return Vec::new(),
    };
    lines
        .map(|line| {
            header
                .iter()
                .cloned()
                .zip(split_csv_line(line))
                .collect::<QueryRow>()
        })
        .collect()
}

/// Strip the `info:fedora/` prefix from a resource-index object URI
pub fn uri_to_pid(uri: &str) -> &str {
    uri.strip_prefix("info:fedora/").unwrap_or(uri)
}

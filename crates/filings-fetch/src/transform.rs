//! XBRL transformation
//!
//! Turns a fetched filing into a [`FinancialStatementRecord`]. The pipeline
//! only depends on the [`FilingTransformer`] trait; [`XbrlTransformer`] is
//! the production implementation, a streaming pass over the XBRL instance
//! document that resolves contexts (periods and dimension members) and units
//! into one flat fact entry per reported value.
//!
//! Consolidation rules: a context whose dimension members include
//! `ConsolidatedMember` marks group-level figures; the
//! `ConsolidatedSoloDimension`/`ConsolidatedMember`/`SoloMember` markers are
//! stripped from the remaining dimensions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use filings_common::types::{FactEntry, FinancialStatementRecord};

use crate::download::FetchedFiling;
use crate::error::ItemError;

/// Seam between the worker and the transformation collaborator.
#[async_trait]
pub trait FilingTransformer: Send + Sync {
    async fn transform(
        &self,
        fetched: &FetchedFiling,
    ) -> Result<FinancialStatementRecord, ItemError>;
}

/// Production transformer for XBRL instance documents.
#[derive(Default)]
pub struct XbrlTransformer;

impl XbrlTransformer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FilingTransformer for XbrlTransformer {
    async fn transform(
        &self,
        fetched: &FetchedFiling,
    ) -> Result<FinancialStatementRecord, ItemError> {
        let parsed = parse_instance(&fetched.document)?;

        let form_kind = match parsed.schema_ref.as_deref().and_then(xsd_file_name) {
            Some(name) => Some(name),
            None => match &fetched.extension {
                Some(bytes) => form_kind_from_extension(bytes)?,
                None => None,
            },
        };

        let mut entries = Vec::with_capacity(parsed.facts.len());
        for fact in parsed.facts {
            let context = parsed.contexts.get(&fact.context_ref).ok_or_else(|| {
                ItemError::Transform(format!(
                    "fact {} references unknown context {}",
                    fact.name, fact.context_ref
                ))
            })?;
            let (consolidated, other_dimensions) = classify_dimensions(&context.dimensions);
            let unit_id = fact
                .unit_ref
                .as_ref()
                .and_then(|r| parsed.units.get(r))
                .cloned();
            entries.push(FactEntry {
                field_name: fact.name,
                field_value: fact.value,
                decimals: fact.decimals,
                precision: fact.precision,
                start_date: context.start,
                end_date: context.end,
                unit_id,
                consolidated,
                other_dimensions,
            });
        }

        Ok(FinancialStatementRecord {
            cvr: fetched.item.cvr,
            published_at: fetched.item.published_at,
            loaded_at: fetched.item.loaded_at,
            erst_id: fetched.item.erst_id.clone(),
            form_kind,
            entries,
        })
    }
}

struct ParsedInstance {
    contexts: HashMap<String, ParsedContext>,
    units: HashMap<String, String>,
    facts: Vec<RawFact>,
    schema_ref: Option<String>,
}

struct ParsedContext {
    start: NaiveDateTime,
    end: NaiveDateTime,
    /// Dimension member qnames as written, e.g. `cmn:ConsolidatedMember`.
    dimensions: Vec<String>,
}

struct RawFact {
    name: String,
    context_ref: String,
    unit_ref: Option<String>,
    decimals: Option<String>,
    precision: Option<String>,
    value: String,
}

#[derive(Default)]
struct ContextBuilder {
    id: String,
    start: Option<String>,
    end: Option<String>,
    instant: Option<String>,
    dimensions: Vec<String>,
}

/// Which leaf element's text we are currently inside.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Leaf {
    StartDate,
    EndDate,
    Instant,
    Measure,
    Dimension,
}

fn parse_instance(document: &str) -> Result<ParsedInstance, ItemError> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut contexts = HashMap::new();
    let mut units: HashMap<String, String> = HashMap::new();
    let mut facts = Vec::new();
    let mut schema_ref: Option<String> = None;

    let mut context: Option<ContextBuilder> = None;
    let mut unit: Option<String> = None;
    let mut leaf: Option<Leaf> = None;
    let mut fact: Option<RawFact> = None;
    let mut text = String::new();
    // Open-element depth; quick-xml reaches Eof without complaint when the
    // input ends inside an element, so truncation is detected here.
    let mut depth: usize = 0;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ItemError::Transform(format!("malformed XBRL document: {}", e)))?;
        match event {
            Event::Start(e) => {
                depth += 1;
                text.clear();
                let local = local_name(e.name().as_ref()).to_vec();
                match local.as_slice() {
                    b"context" => {
                        context = Some(ContextBuilder {
                            id: required_attr(&e, b"id")?,
                            ..Default::default()
                        });
                    },
                    b"unit" => {
                        unit = Some(required_attr(&e, b"id")?);
                    },
                    b"startDate" if context.is_some() => leaf = Some(Leaf::StartDate),
                    b"endDate" if context.is_some() => leaf = Some(Leaf::EndDate),
                    b"instant" if context.is_some() => leaf = Some(Leaf::Instant),
                    b"explicitMember" if context.is_some() => leaf = Some(Leaf::Dimension),
                    b"measure" if unit.is_some() => leaf = Some(Leaf::Measure),
                    b"schemaRef" => schema_ref = href_attr(&e),
                    _ if context.is_none() && unit.is_none() => {
                        if let Some(context_ref) = optional_attr(&e, b"contextRef") {
                            fact = Some(RawFact {
                                name: qname_string(e.name().as_ref()),
                                context_ref,
                                unit_ref: optional_attr(&e, b"unitRef"),
                                decimals: optional_attr(&e, b"decimals"),
                                precision: optional_attr(&e, b"precision"),
                                value: String::new(),
                            });
                        }
                    },
                    _ => {},
                }
            },
            Event::Empty(e) => {
                let local = local_name(e.name().as_ref()).to_vec();
                if local.as_slice() == b"schemaRef" {
                    schema_ref = href_attr(&e);
                } else if context.is_none() && unit.is_none() {
                    // Nil facts appear as empty elements with a contextRef.
                    if let Some(context_ref) = optional_attr(&e, b"contextRef") {
                        facts.push(RawFact {
                            name: qname_string(e.name().as_ref()),
                            context_ref,
                            unit_ref: optional_attr(&e, b"unitRef"),
                            decimals: optional_attr(&e, b"decimals"),
                            precision: optional_attr(&e, b"precision"),
                            value: String::new(),
                        });
                    }
                }
            },
            Event::Text(t) => {
                let chunk = t
                    .unescape()
                    .map_err(|e| ItemError::Transform(format!("bad text content: {}", e)))?;
                text.push_str(&chunk);
            },
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                let local = local_name(e.name().as_ref()).to_vec();
                match local.as_slice() {
                    b"context" => {
                        if let Some(builder) = context.take() {
                            let parsed = finish_context(&builder)?;
                            contexts.insert(builder.id.clone(), parsed);
                        }
                    },
                    b"unit" => {
                        // A unit without a measure simply never lands in the
                        // map; facts referencing it get no unit id.
                        unit = None;
                    },
                    _ => {
                        if let Some(current) = leaf.take() {
                            apply_leaf(current, &text, &mut context, &unit, &mut units);
                        } else if let Some(mut current) = fact.take() {
                            if qname_string(e.name().as_ref()) == current.name {
                                current.value = text.trim().to_string();
                                facts.push(current);
                            } else {
                                fact = Some(current);
                            }
                        }
                    },
                }
                text.clear();
            },
            Event::Eof => {
                if depth > 0 {
                    return Err(ItemError::Transform(
                        "document ended with unclosed elements".to_string(),
                    ));
                }
                break;
            },
            _ => {},
        }
    }

    Ok(ParsedInstance {
        contexts,
        units,
        facts,
        schema_ref,
    })
}

fn apply_leaf(
    leaf: Leaf,
    text: &str,
    context: &mut Option<ContextBuilder>,
    unit: &Option<String>,
    units: &mut HashMap<String, String>,
) {
    match leaf {
        Leaf::StartDate => {
            if let Some(c) = context {
                c.start = Some(text.trim().to_string());
            }
        },
        Leaf::EndDate => {
            if let Some(c) = context {
                c.end = Some(text.trim().to_string());
            }
        },
        Leaf::Instant => {
            if let Some(c) = context {
                c.instant = Some(text.trim().to_string());
            }
        },
        Leaf::Dimension => {
            if let Some(c) = context {
                c.dimensions.push(text.trim().to_string());
            }
        },
        Leaf::Measure => {
            if let Some(id) = unit {
                // "iso4217:DKK" -> "DKK"
                let measure = text.trim();
                let local = measure.rsplit(':').next().unwrap_or(measure);
                units.insert(id.clone(), local.to_string());
            }
        },
    }
}

fn finish_context(builder: &ContextBuilder) -> Result<ParsedContext, ItemError> {
    let (start, end) = match (&builder.instant, &builder.start, &builder.end) {
        (Some(instant), _, _) => {
            let at = parse_xbrl_date(instant)?;
            (at, at)
        },
        (None, start, Some(end)) => {
            let end = parse_xbrl_date(end)?;
            // Instant-like contexts sometimes omit the start date.
            let start = match start {
                Some(s) => parse_xbrl_date(s)?,
                None => end,
            };
            (start, end)
        },
        _ => {
            return Err(ItemError::Transform(format!(
                "context {} has no usable period",
                builder.id
            )))
        },
    };
    Ok(ParsedContext {
        start,
        end,
        dimensions: builder.dimensions.clone(),
    })
}

/// Split dimension members into the consolidated flag and the remainder.
fn classify_dimensions(dimensions: &[String]) -> (bool, Vec<String>) {
    let consolidated = dimensions
        .iter()
        .any(|d| member_name(d) == "ConsolidatedMember");
    let rest = dimensions
        .iter()
        .filter(|d| {
            !matches!(
                member_name(d),
                "ConsolidatedMember" | "SoloMember" | "ConsolidatedSoloDimension"
            )
        })
        .cloned()
        .collect();
    (consolidated, rest)
}

fn member_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

fn parse_xbrl_date(raw: &str) -> Result<NaiveDateTime, ItemError> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ItemError::Transform(format!("invalid period date: {}", raw)))?;
    date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| ItemError::Transform(format!("invalid period date: {}", raw)))
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    }
}

fn qname_string(qname: &[u8]) -> String {
    String::from_utf8_lossy(qname).to_string()
}

fn required_attr(element: &BytesStart<'_>, name: &[u8]) -> Result<String, ItemError> {
    optional_attr(element, name).ok_or_else(|| {
        ItemError::Transform(format!(
            "element {} missing {} attribute",
            qname_string(element.name().as_ref()),
            String::from_utf8_lossy(name)
        ))
    })
}

fn optional_attr(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element.attributes().flatten().find_map(|attr| {
        if local_name(attr.key.as_ref()) == name {
            Some(String::from_utf8_lossy(&attr.value).to_string())
        } else {
            None
        }
    })
}

fn href_attr(element: &BytesStart<'_>) -> Option<String> {
    optional_attr(element, b"href")
}

/// `"http://example/path/aarl_20121101.xsd"` -> `"aarl_20121101.xsd"`
fn xsd_file_name(href: &str) -> Option<String> {
    let name = href.rsplit('/').next()?;
    if name.to_lowercase().ends_with(".xsd") {
        Some(name.to_string())
    } else {
        None
    }
}

/// Fall back to the first schema file inside the taxonomy-extension archive.
fn form_kind_from_extension(bytes: &[u8]) -> Result<Option<String>, ItemError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ItemError::InputData(format!("unreadable extension archive: {}", e)))?;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| ItemError::InputData(format!("unreadable extension entry: {}", e)))?;
        if entry.name().to_lowercase().ends_with(".xsd") {
            let name = entry.name().rsplit('/').next().unwrap_or(entry.name());
            return Ok(Some(name.to_string()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use filings_common::types::WorkItem;
    use std::io::Write;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance"
            xmlns:link="http://www.xbrl.org/2003/linkbase"
            xmlns:xlink="http://www.w3.org/1999/xlink"
            xmlns:xbrldi="http://xbrl.org/2006/xbrldi"
            xmlns:iso4217="http://www.xbrl.org/2003/iso4217"
            xmlns:cmn="http://xbrl.dcca.dk/cmn"
            xmlns:fsa="http://xbrl.dcca.dk/fsa">
  <link:schemaRef xlink:type="simple" xlink:href="http://archprod.service.eogs.dk/taxonomy/aarl_20131220.xsd"/>
  <xbrli:context id="duration_cons">
    <xbrli:entity>
      <xbrli:identifier scheme="http://www.dcca.dk/cvr">10403782</xbrli:identifier>
      <xbrli:segment>
        <xbrldi:explicitMember dimension="cmn:ConsolidatedSoloDimension">cmn:ConsolidatedMember</xbrldi:explicitMember>
        <xbrldi:explicitMember dimension="fsa:SomeDimension">fsa:SomeMember</xbrldi:explicitMember>
      </xbrli:segment>
    </xbrli:entity>
    <xbrli:period>
      <xbrli:startDate>2015-01-01</xbrli:startDate>
      <xbrli:endDate>2015-12-31</xbrli:endDate>
    </xbrli:period>
  </xbrli:context>
  <xbrli:context id="instant_solo">
    <xbrli:entity>
      <xbrli:identifier scheme="http://www.dcca.dk/cvr">10403782</xbrli:identifier>
      <xbrli:segment>
        <xbrldi:explicitMember dimension="cmn:ConsolidatedSoloDimension">cmn:SoloMember</xbrldi:explicitMember>
      </xbrli:segment>
    </xbrli:entity>
    <xbrli:period>
      <xbrli:instant>2015-12-31</xbrli:instant>
    </xbrli:period>
  </xbrli:context>
  <xbrli:unit id="dkk">
    <xbrli:measure>iso4217:DKK</xbrli:measure>
  </xbrli:unit>
  <fsa:ProfitLoss contextRef="duration_cons" unitRef="dkk" decimals="0">125000</fsa:ProfitLoss>
  <fsa:Equity contextRef="instant_solo" unitRef="dkk" decimals="0">800000</fsa:Equity>
  <fsa:NameOfAuditor contextRef="instant_solo">Revision A/S</fsa:NameOfAuditor>
</xbrli:xbrl>"#;

    fn fetched(document: &str, extension: Option<Vec<u8>>) -> FetchedFiling {
        let ts = NaiveDate::from_ymd_opt(2016, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        FetchedFiling {
            item: WorkItem {
                cvr: Some(10403782),
                published_at: ts,
                document_url: "http://docs.example/doc.xml".to_string(),
                extension_url: None,
                erst_id: "erst-t".to_string(),
                loaded_at: ts,
            },
            document: document.to_string(),
            extension,
        }
    }

    #[tokio::test]
    async fn transforms_facts_with_contexts_and_units() {
        let record = XbrlTransformer::new()
            .transform(&fetched(SAMPLE, None))
            .await
            .unwrap();

        assert_eq!(record.erst_id, "erst-t");
        assert_eq!(record.form_kind.as_deref(), Some("aarl_20131220.xsd"));
        assert_eq!(record.entries.len(), 3);

        let profit = &record.entries[0];
        assert_eq!(profit.field_name, "fsa:ProfitLoss");
        assert_eq!(profit.field_value, "125000");
        assert_eq!(profit.decimals.as_deref(), Some("0"));
        assert_eq!(profit.unit_id.as_deref(), Some("DKK"));
        assert!(profit.consolidated);
        assert_eq!(profit.other_dimensions, vec!["fsa:SomeMember".to_string()]);
        assert_eq!(
            profit.start_date.date(),
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap()
        );
        assert_eq!(
            profit.end_date.date(),
            NaiveDate::from_ymd_opt(2015, 12, 31).unwrap()
        );

        let equity = &record.entries[1];
        assert!(!equity.consolidated);
        assert!(equity.other_dimensions.is_empty());
        // Instant period: start collapses onto end.
        assert_eq!(equity.start_date, equity.end_date);

        let auditor = &record.entries[2];
        assert_eq!(auditor.field_value, "Revision A/S");
        assert_eq!(auditor.unit_id, None);
    }

    #[tokio::test]
    async fn unknown_context_is_transform_error() {
        let doc = r#"<x:xbrl xmlns:x="urn:x"><f:Fact xmlns:f="urn:f" contextRef="missing">1</f:Fact></x:xbrl>"#;
        let result = XbrlTransformer::new().transform(&fetched(doc, None)).await;
        match result {
            Err(ItemError::Transform(reason)) => assert!(reason.contains("missing")),
            other => panic!("expected transform error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn malformed_document_is_transform_error() {
        let result = XbrlTransformer::new()
            .transform(&fetched("<xbrl><unclosed>", None))
            .await;
        assert!(matches!(result, Err(ItemError::Transform(_))));
    }

    #[tokio::test]
    async fn truncated_document_is_transform_error() {
        // A valid document cut off mid-stream must fail the item, never
        // yield an empty record.
        let cut = &SAMPLE[..SAMPLE.len() / 2];
        let result = XbrlTransformer::new().transform(&fetched(cut, None)).await;
        assert!(matches!(result, Err(ItemError::Transform(_))));
    }

    #[tokio::test]
    async fn form_kind_falls_back_to_extension_archive() {
        // Document without a schemaRef.
        let doc = r#"<x:xbrl xmlns:x="urn:x"></x:xbrl>"#;

        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("ext/custom_20160101.xsd", options).unwrap();
            writer.write_all(b"<schema/>").unwrap();
            writer.finish().unwrap();
        }

        let record = XbrlTransformer::new()
            .transform(&fetched(doc, Some(buf.into_inner())))
            .await
            .unwrap();
        assert_eq!(record.form_kind.as_deref(), Some("custom_20160101.xsd"));
        assert!(record.entries.is_empty());
    }
}

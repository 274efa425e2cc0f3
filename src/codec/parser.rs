//! Streaming reader for DrugBank XML.
//!
//! The document is read event by event with `quick-xml`; only the `<drug>` element currently
//! being assembled is held in memory. Element paths are matched relative to the enclosing
//! record, so a `<drug>` nested inside a pathway, or a `<name>` inside a target, never gets
//! confused with the record's own fields.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use regex::Regex;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use unicode_normalization::UnicodeNormalization;

use super::record::{
    RawCategory, RawInteraction, RawPartner, RawPatent, RawPolypeptide, RawRecord, RawXref,
};
use crate::{error::ParseError, properties::PartnerRole};

pub const DRUGBANK_XML_NAMESPACE: &str = "http://www.drugbank.ca";
/// The DrugBank export schema version this parser maps. Other versions are rejected.
pub const SUPPORTED_SCHEMA_VERSION: &str = "5.1";

const ROOT_ELEMENT: &str = "drugbank";
const RECORD_ELEMENT: &str = "drug";
const PATENT_DATE_FORMAT: &str = "%Y-%m-%d";

static PUBMED_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").expect("static regex"));

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        attr(&self.attrs, key)
    }
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[derive(Debug)]
enum Token {
    Start(Element),
    Empty(Element),
    End,
    Text(String),
    Eof,
}

/// Lazily yields one [RawRecord] per top-level `<drug>` element.
///
/// Construction validates the root element and its declared schema version, so an
/// incompatible document fails before a single record is produced. The iterator is a single
/// forward pass; re-open the source to read it again.
pub struct RecordParser<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    schema_version: String,
    /// Local element names from the root down to the current element.
    stack: Vec<String>,
    text: String,
    record: Option<RecordBuilder>,
    next_index: usize,
    finished: bool,
}

impl RecordParser<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        tracing::debug!("[RecordParser] opening {:?}", path.as_ref());
        let file = File::open(path)?;
        RecordParser::new(BufReader::new(file))
    }
}

impl<R: BufRead> RecordParser<R> {
    pub fn new(source: R) -> Result<Self, ParseError> {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);
        let mut parser = RecordParser {
            reader,
            buf: Vec::new(),
            schema_version: String::new(),
            stack: Vec::new(),
            text: String::new(),
            record: None,
            next_index: 0,
            finished: false,
        };
        parser.read_root()?;
        Ok(parser)
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    fn read_root(&mut self) -> Result<(), ParseError> {
        loop {
            match self.next_token()? {
                Token::Start(root) | Token::Empty(root) => {
                    if root.name != ROOT_ELEMENT {
                        return Err(ParseError::UnexpectedRoot {
                            expected: ROOT_ELEMENT.to_string(),
                            found: root.name,
                        });
                    }
                    if let Some(ns) = root.attr("xmlns") {
                        if ns != DRUGBANK_XML_NAMESPACE {
                            return Err(ParseError::UnexpectedRoot {
                                expected: format!("{ROOT_ELEMENT} in {DRUGBANK_XML_NAMESPACE}"),
                                found: format!("{ROOT_ELEMENT} in {ns}"),
                            });
                        }
                    }
                    let version = root.attr("version").ok_or_else(|| {
                        ParseError::MissingVersion {
                            expected: SUPPORTED_SCHEMA_VERSION.to_string(),
                        }
                    })?;
                    if version.trim() != SUPPORTED_SCHEMA_VERSION {
                        return Err(ParseError::UnsupportedVersion {
                            expected: SUPPORTED_SCHEMA_VERSION.to_string(),
                            found: version.to_string(),
                        });
                    }
                    self.schema_version = version.trim().to_string();
                    self.stack.push(root.name);
                    tracing::debug!(
                        "[RecordParser] root <{}> schema version {}",
                        ROOT_ELEMENT,
                        self.schema_version
                    );
                    return Ok(());
                }
                Token::Eof => return Err(ParseError::EmptyDocument),
                Token::End | Token::Text(_) => continue,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        loop {
            self.buf.clear();
            let position = self.reader.buffer_position();
            let token = match self.reader.read_event_into(&mut self.buf) {
                Err(e) => {
                    return Err(ParseError::Xml {
                        position,
                        message: format!("{e}"),
                    })
                }
                Ok(Event::Start(e)) => Token::Start(element(&e, position)?),
                Ok(Event::Empty(e)) => Token::Empty(element(&e, position)?),
                Ok(Event::End(_)) => Token::End,
                Ok(Event::Text(e)) => Token::Text(
                    e.unescape()
                        .map_err(|err| ParseError::Xml {
                            position,
                            message: format!("{err}"),
                        })?
                        .into_owned(),
                ),
                Ok(Event::CData(e)) => {
                    Token::Text(String::from_utf8_lossy(&e.into_inner()).into_owned())
                }
                Ok(Event::Eof) => Token::Eof,
                // Declarations, comments, processing instructions, doctype
                Ok(_) => continue,
            };
            return Ok(token);
        }
    }

    fn open_element(&mut self, element: Element) {
        self.text.clear();
        self.stack.push(element.name.clone());
        if self.stack.len() == 2 {
            if element.name == RECORD_ELEMENT {
                self.record = Some(RecordBuilder::new(
                    self.next_index,
                    element.attr("type").map(str::to_string),
                ));
                self.next_index += 1;
            }
            return;
        }
        if let Some(builder) = self.record.as_mut() {
            builder.start(&self.stack[2..], &element.attrs);
        }
    }

    fn close(&mut self) -> Option<Result<RawRecord, ParseError>> {
        let mut finished = None;
        if self.stack.len() == 2 {
            finished = self.record.take().map(RecordBuilder::finish);
        } else if let (true, Some(builder)) = (self.stack.len() > 2, self.record.as_mut()) {
            builder.end(&self.stack[2..], &self.text);
        }
        self.stack.pop();
        self.text.clear();
        finished
    }
}

impl<R: BufRead> Iterator for RecordParser<R> {
    type Item = Result<RawRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let token = match self.next_token() {
                Ok(token) => token,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            match token {
                Token::Eof => {
                    self.finished = true;
                    if let Some(builder) = self.record.take() {
                        return Some(Err(ParseError::Xml {
                            position: self.reader.buffer_position(),
                            message: format!(
                                "document ended inside record #{}",
                                builder.record.index
                            ),
                        }));
                    }
                    return None;
                }
                Token::Start(element) => self.open_element(element),
                Token::Empty(element) => {
                    self.open_element(element);
                    if let Some(done) = self.close() {
                        return Some(done);
                    }
                }
                Token::Text(text) => {
                    if self.record.is_some() {
                        self.text.push_str(&text);
                    }
                }
                Token::End => {
                    if let Some(done) = self.close() {
                        return Some(done);
                    }
                }
            }
        }
    }
}

fn element(e: &BytesStart<'_>, position: u64) -> Result<Element, ParseError> {
    let xml_err = |message: String| ParseError::Xml { position, message };
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| xml_err(format!("{err}")))?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| xml_err(format!("{err}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Element { name, attrs })
}

/// Trimmed, NFC-normalized text, or `None` when blank.
fn clean(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.nfc().collect())
    }
}

fn partner_role(section: &str, element: &str) -> Option<PartnerRole> {
    PartnerRole::from_section(section).filter(|role| role.element() == element)
}

#[derive(Debug, Default)]
struct PatentFields {
    number: Option<String>,
    country: Option<String>,
    approved: Option<String>,
    expires: Option<String>,
    pediatric_extension: Option<String>,
}

/// Accumulates one `<drug>` element.
#[derive(Debug)]
struct RecordBuilder {
    record: RawRecord,
    drug_type: Option<String>,
    /// First problem found; a record with a problem is reported as malformed.
    problem: Option<String>,
    primary_pending: bool,
    language_pending: Option<String>,
    category: Option<RawCategory>,
    patent: Option<PatentFields>,
    xref: Option<RawXref>,
    property: Option<(Option<String>, Option<String>)>,
    interaction: Option<RawInteraction>,
    partner: Option<RawPartner>,
    polypeptide: Option<RawPolypeptide>,
    polypeptide_xref: Option<RawXref>,
}

impl RecordBuilder {
    fn new(index: usize, drug_type: Option<String>) -> Self {
        RecordBuilder {
            record: RawRecord {
                index,
                ..Default::default()
            },
            drug_type: drug_type.and_then(|t| clean(&t)),
            problem: None,
            primary_pending: false,
            language_pending: None,
            category: None,
            patent: None,
            xref: None,
            property: None,
            interaction: None,
            partner: None,
            polypeptide: None,
            polypeptide_xref: None,
        }
    }

    fn flag(&mut self, problem: String) {
        if self.problem.is_none() {
            self.problem = Some(problem);
        }
    }

    fn start(&mut self, path: &[String], attrs: &[(String, String)]) {
        let path = path.iter().map(String::as_str).collect::<Vec<&str>>();
        match path.as_slice() {
            ["drugbank-id"] => {
                self.primary_pending = attr(attrs, "primary") == Some("true");
            }
            ["synonyms", "synonym"] => {
                self.language_pending = attr(attrs, "language").map(str::to_string);
            }
            ["atc-codes", "atc-code"] => {
                if let Some(code) = attr(attrs, "code").and_then(clean) {
                    self.record.atc_codes.push(code);
                }
            }
            ["categories", "category"] => self.category = Some(RawCategory::default()),
            ["patents", "patent"] => self.patent = Some(PatentFields::default()),
            ["external-identifiers", "external-identifier"] => self.xref = Some(RawXref::default()),
            ["calculated-properties", "property"] => self.property = Some((None, None)),
            ["drug-interactions", "drug-interaction"] => {
                self.interaction = Some(RawInteraction::default())
            }
            [section, element] => {
                if let Some(role) = partner_role(section, element) {
                    self.partner = Some(RawPartner::new(role));
                }
            }
            [section, element, "polypeptide"] if partner_role(section, element).is_some() => {
                self.polypeptide = Some(RawPolypeptide {
                    id: attr(attrs, "id").and_then(clean),
                    source: attr(attrs, "source").and_then(clean),
                    ..Default::default()
                });
            }
            [section, element, "polypeptide", "external-identifiers", "external-identifier"]
                if partner_role(section, element).is_some() =>
            {
                self.polypeptide_xref = Some(RawXref::default());
            }
            _ => {}
        }
    }

    fn end(&mut self, path: &[String], text: &str) {
        let value = clean(text);
        let path = path.iter().map(String::as_str).collect::<Vec<&str>>();
        match path.as_slice() {
            ["drugbank-id"] => {
                if let Some(id) = value {
                    if self.primary_pending && self.record.primary_id.is_none() {
                        self.record.primary_id = Some(id);
                    } else {
                        self.record.secondary_ids.push(id);
                    }
                }
                self.primary_pending = false;
            }
            ["name"] => self.record.name = value.unwrap_or_default(),
            ["description"] => self.record.description = value,
            ["cas-number"] => self.record.cas_number = value,
            ["groups", "group"] => self.record.groups.extend(value),
            ["categories", "category", "category"] => {
                if let Some(category) = self.category.as_mut() {
                    category.name = value.unwrap_or_default();
                }
            }
            ["categories", "category", "mesh-id"] => {
                if let Some(category) = self.category.as_mut() {
                    category.mesh_id = value;
                }
            }
            ["categories", "category"] => {
                if let Some(category) = self.category.take() {
                    if !category.name.is_empty() {
                        self.record.categories.push(category);
                    }
                }
            }
            ["synonyms", "synonym"] => {
                let language = self.language_pending.take();
                let english = language
                    .as_deref()
                    .map(|l| l.eq_ignore_ascii_case("english"))
                    .unwrap_or(true);
                if english {
                    self.record.synonyms.extend(value);
                }
            }
            ["international-brands", "international-brand", "name"]
            | ["international-brands", "international-brand"]
            | ["products", "product", "name"] => self.record.synonyms.extend(value),
            ["patents", "patent", field] => {
                if let Some(patent) = self.patent.as_mut() {
                    match *field {
                        "number" => patent.number = value,
                        "country" => patent.country = value,
                        "approved" => patent.approved = value,
                        "expires" => patent.expires = value,
                        "pediatric-extension" => patent.pediatric_extension = value,
                        _ => {}
                    }
                }
            }
            ["patents", "patent"] => {
                if let Some(fields) = self.patent.take() {
                    match finish_patent(fields) {
                        Ok(patent) => self.record.patents.push(patent),
                        Err(problem) => self.flag(problem),
                    }
                }
            }
            ["external-identifiers", "external-identifier", field] => {
                if let Some(xref) = self.xref.as_mut() {
                    set_xref_field(xref, field, value);
                }
            }
            ["external-identifiers", "external-identifier"] => {
                if let Some(xref) = self.xref.take() {
                    if !xref.resource.is_empty() && !xref.identifier.is_empty() {
                        self.record.external_identifiers.push(xref);
                    }
                }
            }
            ["calculated-properties", "property", field] => {
                if let Some((kind, val)) = self.property.as_mut() {
                    match *field {
                        "kind" => *kind = value,
                        "value" => *val = value,
                        _ => {}
                    }
                }
            }
            ["calculated-properties", "property"] => {
                if let Some((Some(kind), val)) = self.property.take() {
                    match kind.as_str() {
                        "InChI" => self.record.inchi = val,
                        "InChIKey" => self.record.inchikey = val,
                        _ => {}
                    }
                }
            }
            ["drug-interactions", "drug-interaction", field] => {
                if let Some(interaction) = self.interaction.as_mut() {
                    match *field {
                        "drugbank-id" => interaction.drugbank_id = value.unwrap_or_default(),
                        "name" => interaction.name = value,
                        "description" => interaction.description = value,
                        _ => {}
                    }
                }
            }
            ["drug-interactions", "drug-interaction"] => {
                if let Some(interaction) = self.interaction.take() {
                    if interaction.drugbank_id.is_empty() {
                        self.flag("drug interaction without a drugbank-id".to_string());
                    } else {
                        self.record.interactions.push(interaction);
                    }
                }
            }
            [section, element] if partner_role(section, element).is_some() => {
                if let Some(partner) = self.partner.take() {
                    if partner.bioentity_id.is_none()
                        && partner.name.is_none()
                        && partner.polypeptides.is_empty()
                    {
                        self.flag(format!(
                            "{} #{} has neither an id nor a name",
                            partner.role.element(),
                            self.record.partners.len()
                        ));
                    } else {
                        self.record.partners.push(partner);
                    }
                }
            }
            [section, element, field] if partner_role(section, element).is_some() => {
                if let Some(partner) = self.partner.as_mut() {
                    match *field {
                        "id" => partner.bioentity_id = value,
                        "name" => partner.name = value,
                        "organism" => partner.organism = value,
                        "known-action" => {
                            partner.known_action = match value.as_deref() {
                                Some("yes") => Some(true),
                                Some("no") => Some(false),
                                _ => None,
                            }
                        }
                        "polypeptide" => {
                            if let Some(polypeptide) = self.polypeptide.take() {
                                partner.polypeptides.push(polypeptide);
                            }
                        }
                        _ => {}
                    }
                }
            }
            [section, element, "actions", "action"] if partner_role(section, element).is_some() => {
                if let (Some(partner), Some(action)) = (self.partner.as_mut(), value) {
                    partner.actions.push(action.to_lowercase());
                }
            }
            [section, element, "references", "articles", "article", "pubmed-id"]
                if partner_role(section, element).is_some() =>
            {
                if let (Some(partner), Some(pmid)) = (self.partner.as_mut(), value) {
                    if PUBMED_ID.is_match(&pmid) {
                        partner.pubmed_ids.push(pmid);
                    }
                }
            }
            [section, element, "polypeptide", field] if partner_role(section, element).is_some() => {
                if let Some(polypeptide) = self.polypeptide.as_mut() {
                    match *field {
                        "name" => polypeptide.name = value,
                        "gene-name" => polypeptide.gene_name = value,
                        "organism" => polypeptide.organism = value,
                        _ => {}
                    }
                }
            }
            [section, element, "polypeptide", "external-identifiers", "external-identifier", field]
                if partner_role(section, element).is_some() =>
            {
                if let Some(xref) = self.polypeptide_xref.as_mut() {
                    set_xref_field(xref, field, value);
                }
            }
            [section, element, "polypeptide", "external-identifiers", "external-identifier"]
                if partner_role(section, element).is_some() =>
            {
                if let (Some(polypeptide), Some(xref)) =
                    (self.polypeptide.as_mut(), self.polypeptide_xref.take())
                {
                    if !xref.resource.is_empty() && !xref.identifier.is_empty() {
                        polypeptide.external_identifiers.push(xref);
                    }
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Result<RawRecord, ParseError> {
        let index = self.record.index;
        let malformed = |reason: String| ParseError::MalformedRecord { index, reason };
        let Some(drug_type) = self.drug_type else {
            return Err(malformed("missing type attribute on <drug>".to_string()));
        };
        if self.record.name.is_empty() {
            return Err(malformed("missing <name>".to_string()));
        }
        if let Some(problem) = self.problem {
            return Err(malformed(problem));
        }
        let mut record = self.record;
        record.drug_type = drug_type;
        // The record's own name is a label, not a synonym.
        let name = record.name.clone();
        record.synonyms.remove(&name);
        Ok(record)
    }
}

fn set_xref_field(xref: &mut RawXref, field: &str, value: Option<String>) {
    match field {
        "resource" => xref.resource = value.unwrap_or_default(),
        "identifier" => xref.identifier = value.unwrap_or_default(),
        _ => {}
    }
}

fn finish_patent(fields: PatentFields) -> Result<RawPatent, String> {
    let (Some(number), Some(country)) = (fields.number, fields.country) else {
        return Err("patent without number or country".to_string());
    };
    let parse_date = |label: &str, raw: Option<String>| -> Result<Option<NaiveDate>, String> {
        raw.map(|s| {
            NaiveDate::parse_from_str(&s, PATENT_DATE_FORMAT)
                .map_err(|e| format!("patent {number} has invalid {label} date '{s}': {e}"))
        })
        .transpose()
    };
    Ok(RawPatent {
        approved: parse_date("approved", fields.approved)?,
        expires: parse_date("expires", fields.expires)?,
        pediatric_extension: fields.pediatric_extension.as_deref() == Some("true"),
        number,
        country,
    })
}

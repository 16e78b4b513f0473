//! Serializes record batches into the appliance's XML feed format.
//!
//! Output is deterministic: records appear in input order, attributes in a
//! fixed order, principals sorted. The appliance relies on record order
//! for its latest-wins semantics, so nothing here may reorder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use searchlink_core::{Acl, DocIdCodec, DocIdRecord, NamedResource};

use crate::error::FeedError;

/// Which authority a feed carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedType {
    /// Defines the authoritative set of document ids.
    FullReplace,
    /// Additive changes since the last push.
    Incremental,
}

impl FeedType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::FullReplace => "full-replace",
            Self::Incremental => "incremental",
        }
    }
}

/// Builds feed XML documents for one data source.
#[derive(Clone)]
pub struct FeedComposer {
    datasource: String,
    codec: Arc<DocIdCodec>,
}

impl FeedComposer {
    pub fn new(datasource: impl Into<String>, codec: Arc<DocIdCodec>) -> Self {
        Self {
            datasource: datasource.into(),
            codec,
        }
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    /// Composes one feed from a record batch, in input order.
    pub fn compose_records(
        &self,
        feed_type: FeedType,
        records: &[DocIdRecord],
    ) -> Result<String, FeedError> {
        self.compose(feed_type, |writer| {
            for record in records {
                self.write_record(writer, record)?;
            }
            Ok(())
        })
    }

    /// Composes one feed of ACL-only entries.
    pub fn compose_named_resources(
        &self,
        resources: &[NamedResource],
    ) -> Result<String, FeedError> {
        self.compose(FeedType::Incremental, |writer| {
            for resource in resources {
                let mut record = BytesStart::new("record");
                record.push_attribute(("url", self.codec.encode(&resource.doc_id).as_str()));
                writer.write_event(Event::Start(record))?;
                self.write_acl(writer, &resource.acl)?;
                writer.write_event(Event::End(BytesEnd::new("record")))?;
            }
            Ok(())
        })
    }

    fn compose<F>(&self, feed_type: FeedType, write_group: F) -> Result<String, FeedError>
    where
        F: FnOnce(&mut Writer<Vec<u8>>) -> Result<(), FeedError>,
    {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("feed")))?;

        writer.write_event(Event::Start(BytesStart::new("header")))?;
        write_text_element(&mut writer, "datasource", &self.datasource)?;
        write_text_element(&mut writer, "feedtype", feed_type.as_wire_str())?;
        writer.write_event(Event::End(BytesEnd::new("header")))?;

        writer.write_event(Event::Start(BytesStart::new("group")))?;
        write_group(&mut writer)?;
        writer.write_event(Event::End(BytesEnd::new("group")))?;

        writer.write_event(Event::End(BytesEnd::new("feed")))?;

        // The writer only ever produced valid UTF-8.
        Ok(String::from_utf8(writer.into_inner())
            .expect("feed writer emitted invalid UTF-8"))
    }

    fn write_record(
        &self,
        writer: &mut Writer<Vec<u8>>,
        record: &DocIdRecord,
    ) -> Result<(), FeedError> {
        let url = self.codec.encode(record.doc_id());
        let mut element = BytesStart::new("record");
        element.push_attribute(("url", url.as_str()));
        if let Some(modified) = record.last_modified() {
            element.push_attribute(("last-modified", rfc1123(modified).as_str()));
        }
        if record.is_delete() {
            element.push_attribute(("action", "delete"));
        }
        if record.crawl_immediately() {
            element.push_attribute(("crawl-immediately", "true"));
        }
        if record.lock() {
            element.push_attribute(("lock", "true"));
        }
        if let Some(link) = record.result_link() {
            element.push_attribute(("displayurl", link));
        }
        writer.write_event(Event::Empty(element))?;
        Ok(())
    }

    fn write_acl(&self, writer: &mut Writer<Vec<u8>>, acl: &Acl) -> Result<(), FeedError> {
        let mut element = BytesStart::new("acl");
        element.push_attribute(("inheritance", acl.inheritance().as_wire_str()));
        if let Some(parent) = acl.parent() {
            element.push_attribute(("inherit-from", self.codec.encode(parent).as_str()));
        }
        writer.write_event(Event::Start(element))?;
        for user in acl.permitted_users() {
            write_principal(writer, "user", "permit", user)?;
        }
        for user in acl.denied_users() {
            write_principal(writer, "user", "deny", user)?;
        }
        for group in acl.permitted_groups() {
            write_principal(writer, "group", "permit", group)?;
        }
        for group in acl.denied_groups() {
            write_principal(writer, "group", "deny", group)?;
        }
        writer.write_event(Event::End(BytesEnd::new("acl")))?;
        Ok(())
    }
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), FeedError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_principal(
    writer: &mut Writer<Vec<u8>>,
    scope: &str,
    access: &str,
    name: &str,
) -> Result<(), FeedError> {
    let mut element = BytesStart::new("principal");
    element.push_attribute(("scope", scope));
    element.push_attribute(("access", access));
    writer.write_event(Event::Start(element))?;
    writer.write_event(Event::Text(BytesText::new(name)))?;
    writer.write_event(Event::End(BytesEnd::new("principal")))?;
    Ok(())
}

/// RFC-1123 date, always in GMT, as the feed format requires.
fn rfc1123(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use searchlink_core::{DocId, InheritanceRule};

    fn composer() -> FeedComposer {
        FeedComposer::new(
            "unit-source",
            Arc::new(DocIdCodec::new("http://adaptor:5678", "/doc/")),
        )
    }

    #[test]
    fn records_appear_in_input_order() {
        let records = vec![
            DocIdRecord::new(DocId::new("A")),
            DocIdRecord::new(DocId::new("B")),
            DocIdRecord::new(DocId::new("C")),
        ];
        let xml = composer()
            .compose_records(FeedType::FullReplace, &records)
            .unwrap();
        let a = xml.find("/doc/A").unwrap();
        let b = xml.find("/doc/B").unwrap();
        let c = xml.find("/doc/C").unwrap();
        assert!(a < b && b < c, "records reordered: {xml}");
        assert!(xml.contains("<feedtype>full-replace</feedtype>"));
        assert!(xml.contains("<datasource>unit-source</datasource>"));
    }

    #[test]
    fn record_attributes_are_emitted() {
        let modified = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let records = vec![DocIdRecord::new(DocId::new("x"))
            .with_last_modified(modified)
            .with_delete()
            .with_lock()
            .with_result_link("http://display/x")];
        let xml = composer()
            .compose_records(FeedType::Incremental, &records)
            .unwrap();
        assert!(xml.contains(r#"last-modified="Wed, 01 Jan 2020 00:00:00 GMT""#));
        assert!(xml.contains(r#"action="delete""#));
        assert!(xml.contains(r#"lock="true""#));
        assert!(xml.contains(r#"displayurl="http://display/x""#));
        assert!(xml.contains("<feedtype>incremental</feedtype>"));
    }

    #[test]
    fn doc_id_is_escaped_into_url() {
        let records = vec![DocIdRecord::new(DocId::new("a b&c"))];
        let xml = composer()
            .compose_records(FeedType::FullReplace, &records)
            .unwrap();
        // Percent-escaped by the codec, then attribute-escaped by the writer.
        assert!(xml.contains("/doc/a%20b%26c"));
    }

    #[test]
    fn named_resources_carry_acl_fragment() {
        let acl = Acl::new()
            .permit_user("alice")
            .deny_group("contractors")
            .inherit_from(DocId::new("root"))
            .with_inheritance(InheritanceRule::ParentOverrides);
        let resources = vec![NamedResource::new(DocId::new("folder"), acl)];
        let xml = composer().compose_named_resources(&resources).unwrap();
        assert!(xml.contains(r#"inheritance="parent-overrides""#));
        assert!(xml.contains(r#"inherit-from="http://adaptor:5678/doc/root""#));
        assert!(xml.contains(r#"<principal scope="user" access="permit">alice</principal>"#));
        assert!(xml.contains(r#"<principal scope="group" access="deny">contractors</principal>"#));
    }

    #[test]
    fn output_is_deterministic() {
        let records = vec![
            DocIdRecord::new(DocId::new("A")),
            DocIdRecord::new(DocId::new("B")),
        ];
        let first = composer()
            .compose_records(FeedType::FullReplace, &records)
            .unwrap();
        let second = composer()
            .compose_records(FeedType::FullReplace, &records)
            .unwrap();
        assert_eq!(first, second);
    }
}

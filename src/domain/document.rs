//! XML codec for map documents.
//!
//! ```xml
//! <map version="0.9.0">
//!   <node ID="ID_1" TEXT="root">
//!     <node ID="ID_2" TEXT="child" POSITION="left" FOLDED="true" LINK="#ID_3">
//!       <icon BUILTIN="idea"/>
//!       <hook NAME="encryption" DIGEST="…"/>
//!     </node>
//!   </node>
//! </map>
//! ```
//!
//! Unknown elements and attributes are skipped when reading.

use std::collections::HashSet;
use std::io::BufRead;

use generational_arena::Index;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use tracing::{debug, instrument, trace};

use crate::domain::arena::MapTree;
use crate::domain::entities::{generate_node_id, NodeData, Side};
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::extension::{EncryptionState, Extension, IconSet, NodeLink};
use crate::domain::version::CURRENT_VERSION;

const ENCRYPTION_HOOK: &str = "encryption";

/// A parsed document: the declared version and the node tree.
#[derive(Debug)]
pub struct ParsedDocument {
    pub version: Option<String>,
    pub tree: MapTree,
}

/// Options for [`write_map`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Only write `ID` for nodes some link points to
    pub save_only_intrinsically_needed_ids: bool,
}

// ============================================================
// Reading
// ============================================================

/// Parse a map document into a fresh tree.
#[instrument(level = "debug", skip(input))]
pub fn parse_map<R: BufRead>(input: R) -> DomainResult<ParsedDocument> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut tree = MapTree::new();
    let mut version = None;
    let mut seen_map = false;
    let mut map_closed = false;
    let mut open: Vec<Index> = Vec::new();
    let mut buf = Vec::new();
    let mut skip_buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            DomainError::invalid_document(format!(
                "XML error at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    b"map" => {
                        if seen_map {
                            return Err(DomainError::invalid_document("nested <map> element"));
                        }
                        seen_map = true;
                        version = attribute(e, b"version")?;
                        if is_empty {
                            map_closed = true;
                        }
                    }
                    b"node" => {
                        if !seen_map || map_closed {
                            return Err(DomainError::invalid_document(
                                "<node> outside of <map>",
                            ));
                        }
                        let idx = open_node(&mut tree, &open, e)?;
                        if !is_empty {
                            open.push(idx);
                        }
                    }
                    b"icon" if !open.is_empty() => {
                        if let (Some(name), Some(&node)) = (attribute(e, b"BUILTIN")?, open.last()) {
                            add_icon(&mut tree, node, name)?;
                        }
                        if !is_empty {
                            skip_element(&mut reader, b"icon", &mut skip_buf)?;
                        }
                    }
                    b"hook" if !open.is_empty() => {
                        if attribute(e, b"NAME")?.as_deref() == Some(ENCRYPTION_HOOK) {
                            if let (Some(digest), Some(&node)) =
                                (attribute(e, b"DIGEST")?, open.last())
                            {
                                tree.data_mut(node)?
                                    .extensions
                                    .put(Extension::Encryption(EncryptionState::from_digest(digest)));
                            }
                        }
                        if !is_empty {
                            skip_element(&mut reader, b"hook", &mut skip_buf)?;
                        }
                    }
                    other => {
                        trace!("parse_map: skipping <{}>", String::from_utf8_lossy(other));
                        if !is_empty {
                            let name = other.to_vec();
                            skip_element(&mut reader, &name, &mut skip_buf)?;
                        }
                    }
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"node" => {
                    open.pop();
                }
                b"map" => map_closed = true,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_map {
        return Err(DomainError::invalid_document("no <map> element found"));
    }
    if !open.is_empty() {
        return Err(DomainError::invalid_document(format!(
            "unexpected end of document inside {} open <node> element(s)",
            open.len()
        )));
    }
    if !map_closed {
        return Err(DomainError::invalid_document("unexpected end of document inside <map>"));
    }
    if tree.root().is_none() {
        return Err(DomainError::NoRoot);
    }
    debug!(
        "parse_map: version={:?}, nodes={}",
        version,
        tree.node_count()
    );
    Ok(ParsedDocument { version, tree })
}

fn attribute(e: &BytesStart, key: &[u8]) -> DomainResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr
            .map_err(|err| DomainError::invalid_document(format!("attribute error: {}", err)))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|err| DomainError::invalid_document(format!("attribute error: {}", err)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Create the node for a `<node>` element and attach it below the innermost open node.
fn open_node(tree: &mut MapTree, open: &[Index], e: &BytesStart) -> DomainResult<Index> {
    let mut data = NodeData::with_id(String::new(), String::new());
    for attr in e.attributes() {
        let attr = attr
            .map_err(|err| DomainError::invalid_document(format!("attribute error: {}", err)))?;
        let value = attr
            .unescape_value()
            .map_err(|err| DomainError::invalid_document(format!("attribute error: {}", err)))?;
        match attr.key.as_ref() {
            b"ID" => data.id = value.into_owned(),
            b"TEXT" => data.text = value.into_owned(),
            b"FOLDED" => data.folded = value.eq_ignore_ascii_case("true"),
            b"POSITION" => data.side = Side::parse(&value),
            b"LINK" => match value.strip_prefix('#') {
                Some(target) if !target.is_empty() => {
                    data.extensions.put(Extension::Link(NodeLink::new(target)));
                }
                _ => trace!("open_node: ignoring external link {}", value),
            },
            _ => {}
        }
    }
    if data.id.is_empty() {
        data.id = generate_node_id();
    }

    match open.last() {
        None if tree.root().is_some() => {
            Err(DomainError::invalid_document("more than one root <node>"))
        }
        None => {
            data.side = None;
            Ok(tree.set_root(data))
        }
        Some(&parent) => {
            if tree.parent(parent).is_some() {
                data.side = None;
            }
            let idx = tree.create_node(data);
            let len = tree.child_count(parent)?;
            tree.insert(parent, len, idx)?;
            Ok(idx)
        }
    }
}

fn add_icon(tree: &mut MapTree, node: Index, name: String) -> DomainResult<()> {
    let extensions = &mut tree.data_mut(node)?.extensions;
    let mut icons = extensions.icons().cloned().unwrap_or_default();
    icons.add(name);
    extensions.put(Extension::Icons(icons));
    Ok(())
}

fn skip_element<R: BufRead>(
    reader: &mut Reader<R>,
    name: &[u8],
    buf: &mut Vec<u8>,
) -> DomainResult<()> {
    reader
        .read_to_end_into(QName(name), buf)
        .map_err(|e| DomainError::invalid_document(format!("XML error: {}", e)))?;
    buf.clear();
    Ok(())
}

// ============================================================
// Writing
// ============================================================

/// Serialize `tree` as a current-version document.
///
/// The output starts with the version header itself, without an XML
/// declaration, so the version detector recognises saved files.
#[instrument(level = "debug", skip(tree))]
pub fn write_map(tree: &MapTree, options: &WriteOptions) -> DomainResult<Vec<u8>> {
    let root = tree.root().ok_or(DomainError::NoRoot)?;
    let link_targets: HashSet<&str> = tree
        .iter()
        .filter_map(|(_, n)| n.data.extensions.link().map(|l| l.target.as_str()))
        .collect();

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    let mut map = BytesStart::new("map");
    map.push_attribute(("version", CURRENT_VERSION));
    write_event(&mut writer, Event::Start(map))?;
    write_node(&mut writer, tree, root, options, &link_targets)?;
    write_event(&mut writer, Event::End(BytesEnd::new("map")))?;

    let mut out = writer.into_inner();
    out.push(b'\n');
    Ok(out)
}

fn write_node(
    writer: &mut Writer<Vec<u8>>,
    tree: &MapTree,
    idx: Index,
    options: &WriteOptions,
    link_targets: &HashSet<&str>,
) -> DomainResult<()> {
    let data = tree.data(idx)?;
    let mut elem = BytesStart::new("node");
    if !options.save_only_intrinsically_needed_ids || link_targets.contains(data.id.as_str()) {
        elem.push_attribute(("ID", data.id.as_str()));
    }
    elem.push_attribute(("TEXT", data.text.as_str()));
    if data.folded {
        elem.push_attribute(("FOLDED", "true"));
    }
    if tree.parent(idx).is_some() && tree.parent(idx) == tree.root() {
        if let Some(side) = data.side {
            elem.push_attribute(("POSITION", side.as_str()));
        }
    }
    let link = data.extensions.link().map(|l| format!("#{}", l.target));
    if let Some(link) = &link {
        elem.push_attribute(("LINK", link.as_str()));
    }

    let icons = data.extensions.icons().filter(|i| !i.is_empty());
    let encryption = data.extensions.encryption();
    let children = tree.children(idx);
    if icons.is_none() && encryption.is_none() && children.is_empty() {
        return write_event(writer, Event::Empty(elem));
    }

    write_event(writer, Event::Start(elem))?;
    if let Some(icons) = icons {
        write_icons(writer, icons)?;
    }
    if let Some(state) = encryption {
        let mut hook = BytesStart::new("hook");
        hook.push_attribute(("NAME", ENCRYPTION_HOOK));
        hook.push_attribute(("DIGEST", state.digest()));
        write_event(writer, Event::Empty(hook))?;
    }
    for &child in children {
        write_node(writer, tree, child, options, link_targets)?;
    }
    write_event(writer, Event::End(BytesEnd::new("node")))
}

fn write_icons(writer: &mut Writer<Vec<u8>>, icons: &IconSet) -> DomainResult<()> {
    for name in icons.names() {
        let mut icon = BytesStart::new("icon");
        icon.push_attribute(("BUILTIN", name.as_str()));
        write_event(writer, Event::Empty(icon))?;
    }
    Ok(())
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> DomainResult<()> {
    writer
        .write_event(event)
        .map_err(|e| DomainError::invalid_document(format!("XML write error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"<map version="0.9.0">
<!-- comment -->
<node ID="ID_1" TEXT="root">
  <node ID="ID_2" TEXT="left &amp; folded" POSITION="left" FOLDED="true">
    <icon BUILTIN="idea"/>
    <node ID="ID_3" TEXT="deep" POSITION="right"/>
  </node>
  <node ID="ID_4" TEXT="linked" LINK="#ID_3">
    <font SIZE="12"><unknown/></font>
    <hook NAME="encryption" DIGEST="abc"/>
  </node>
</node>
</map>"##;

    #[test]
    fn given_sample_document_when_parsing_then_builds_tree() {
        let doc = parse_map(SAMPLE.as_bytes()).unwrap();
        let tree = &doc.tree;
        assert_eq!(doc.version.as_deref(), Some("0.9.0"));
        assert_eq!(tree.node_count(), 4);

        let left = tree.find_by_id("ID_2").unwrap();
        let data = tree.data(left).unwrap();
        assert_eq!(data.text, "left & folded");
        assert!(data.folded);
        assert_eq!(data.side, Some(Side::Left));
        assert_eq!(data.extensions.icons().unwrap().names(), &["idea".to_string()]);

        // side below a non-root parent is dropped
        let deep = tree.find_by_id("ID_3").unwrap();
        assert_eq!(tree.data(deep).unwrap().side, None);

        let linked = tree.data(tree.find_by_id("ID_4").unwrap()).unwrap();
        assert_eq!(linked.extensions.link().unwrap().target, "ID_3");
        assert!(!linked.is_accessible());
    }

    #[test]
    fn given_tree_when_writing_then_starts_with_version_header() {
        let doc = parse_map(SAMPLE.as_bytes()).unwrap();
        let out = write_map(&doc.tree, &WriteOptions::default()).unwrap();
        assert!(out.starts_with(b"<map version=\"0.9.0\">"));

        let reparsed = parse_map(out.as_slice()).unwrap();
        let texts = |t: &MapTree| t.iter().map(|(_, n)| n.data.text.clone()).collect::<Vec<_>>();
        assert_eq!(texts(&doc.tree), texts(&reparsed.tree));
    }

    #[test]
    fn given_minimal_ids_option_then_only_link_targets_keep_ids() {
        let doc = parse_map(SAMPLE.as_bytes()).unwrap();
        let options = WriteOptions {
            save_only_intrinsically_needed_ids: true,
        };
        let out = String::from_utf8(write_map(&doc.tree, &options).unwrap()).unwrap();
        assert!(out.contains("ID=\"ID_3\""));
        assert!(!out.contains("ID=\"ID_1\""));
        assert!(!out.contains("ID=\"ID_2\""));
    }

    #[test]
    fn given_duplicate_ids_when_parsing_then_first_keeps_id_and_later_gets_fresh_one() {
        let xml = r#"<map version="0.9.0"><node ID="ID_1" TEXT="root"><node ID="ID_7" TEXT="first"/><node ID="ID_7" TEXT="second"/><node ID="ID_1" TEXT="third"/></node></map>"#;

        let tree = parse_map(xml.as_bytes()).unwrap().tree;

        assert_eq!(tree.node_count(), 4);
        let first = tree.find_by_id("ID_7").unwrap();
        assert_eq!(tree.data(first).unwrap().text, "first");
        let ids: HashSet<String> = tree.iter().map(|(_, n)| n.data.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        let root = tree.root().unwrap();
        assert_eq!(tree.data(root).unwrap().text, "root");
    }

    #[test]
    fn given_truncated_document_then_fails() {
        let err = parse_map(r#"<map version="0.9.0"><node TEXT="root">"#.as_bytes()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidDocument { .. }));
    }

    #[test]
    fn given_two_roots_then_fails() {
        let xml = r#"<map version="0.9.0"><node TEXT="a"/><node TEXT="b"/></map>"#;
        assert!(parse_map(xml.as_bytes()).is_err());
    }

    #[test]
    fn given_map_without_nodes_then_no_root() {
        let xml = r#"<map version="0.9.0"></map>"#;
        assert_eq!(parse_map(xml.as_bytes()).unwrap_err(), DomainError::NoRoot);
    }
}

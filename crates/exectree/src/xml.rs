//! Serialized tree documents (`execTree`, version "1.0").
//!
//! The emitter writes a canonical form (fixed attribute order, stable child
//! order) so that `emit(parse(emit(tree)))` is byte-identical to
//! `emit(tree)`.

use std::io::Cursor;
use std::sync::Arc;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

use crate::dependency::ExecDependency;
use crate::error::ExecError;
use crate::job::{ExecJob, JobBody};
use crate::resource::ExecResource;
use crate::state::JobState;
use crate::tree::ExecTree;

const VERSION: &str = "1.0";

pub(crate) fn emit(tree: &ExecTree) -> Result<String, ExecError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    emit_tree(&mut writer, tree)?;
    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|err| ExecError::Xml(err.to_string()))
}

fn emit_tree(writer: &mut Writer<Cursor<Vec<u8>>>, tree: &ExecTree) -> Result<(), ExecError> {
    let name = tree.name();
    let href = tree.href();
    let uuid = tree.uuid().simple().to_string();
    let cwd = tree.cwd().to_string_lossy().into_owned();

    let mut element = BytesStart::new("execTree");
    element.push_attribute(("version", VERSION));
    element.push_attribute(("name", name.as_str()));
    element.push_attribute(("href", href.as_str()));
    element.push_attribute(("uuid", uuid.as_str()));
    element.push_attribute(("cwd", cwd.as_str()));
    writer.write_event(Event::Start(element))?;

    for job in tree.jobs() {
        if let JobBody::Subtree(subtree) = job.body() {
            emit_tree(writer, &subtree)?;
        }
        emit_job(writer, &job)?;
    }
    for dep in tree.deps() {
        emit_dep(writer, &dep)?;
    }
    for resource in tree.resources() {
        emit_resource(writer, &resource)?;
    }
    for (name, value) in tree.legend() {
        let mut element = BytesStart::new("legendItem");
        element.push_attribute(("name", name.as_str()));
        element.push_attribute(("value", value.as_str()));
        writer.write_event(Event::Empty(element))?;
    }

    writer.write_event(Event::End(BytesEnd::new("execTree")))?;
    Ok(())
}

fn emit_job(writer: &mut Writer<Cursor<Vec<u8>>>, job: &Arc<ExecJob>) -> Result<(), ExecError> {
    let uuid = job.uuid().simple().to_string();
    let href = job.href();
    let tcolor = job.tcolor();
    let body = job.body();
    let body_attr = match &body {
        JobBody::Path(path) => Some(("jobpath", path.to_string_lossy().into_owned())),
        JobBody::Subtree(subtree) => Some(("subtreeuuid", subtree.uuid().simple().to_string())),
        JobBody::Unset => None,
    };
    let logfile = job
        .logfile()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut element = BytesStart::new("execJob");
    element.push_attribute(("name", job.name()));
    element.push_attribute(("uuid", uuid.as_str()));
    element.push_attribute(("mustcomplete", if job.mustcomplete() { "True" } else { "False" }));
    element.push_attribute(("href", href.as_str()));
    element.push_attribute(("tcolor", tcolor.as_str()));
    if let Some((key, value)) = &body_attr {
        element.push_attribute((*key, value.as_str()));
    }
    element.push_attribute(("logfile", logfile.as_str()));

    let arguments = job.arguments();
    let resources = job.resources();
    if arguments.is_empty() && resources.is_empty() {
        writer.write_event(Event::Empty(element))?;
        return Ok(());
    }
    writer.write_event(Event::Start(element))?;
    for value in &arguments {
        let mut argument = BytesStart::new("execArg");
        argument.push_attribute(("value", value.as_str()));
        writer.write_event(Event::Empty(argument))?;
    }
    for resource in &resources {
        let uuid = resource.uuid().simple().to_string();
        let mut reference = BytesStart::new("execResource");
        reference.push_attribute(("uuid", uuid.as_str()));
        writer.write_event(Event::Empty(reference))?;
    }
    writer.write_event(Event::End(BytesEnd::new("execJob")))?;
    Ok(())
}

fn emit_dep(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    dep: &Arc<ExecDependency>,
) -> Result<(), ExecError> {
    let parent = dep.parent().uuid().simple().to_string();
    let child = dep.child().uuid().simple().to_string();
    let state = dep.state().value().to_string();

    let mut element = BytesStart::new("execDependency");
    element.push_attribute(("parent", parent.as_str()));
    element.push_attribute(("child", child.as_str()));
    element.push_attribute(("state", state.as_str()));
    element.push_attribute(("dcolor", dep.dcolor()));
    element.push_attribute(("ucolor", dep.ucolor()));
    writer.write_event(Event::Empty(element))?;
    Ok(())
}

fn emit_resource(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    resource: &Arc<ExecResource>,
) -> Result<(), ExecError> {
    let uuid = resource.uuid().simple().to_string();
    let avail = resource.avail().to_string();

    let mut element = BytesStart::new("execResource");
    element.push_attribute(("name", resource.name()));
    element.push_attribute(("uuid", uuid.as_str()));
    element.push_attribute(("avail", avail.as_str()));
    writer.write_event(Event::Empty(element))?;
    Ok(())
}

struct XmlElement {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn require(&self, name: &str) -> Result<&str, ExecError> {
        self.attr(name).ok_or_else(|| {
            ExecError::Xml(format!(
                "{} is missing required attribute {}",
                self.name, name
            ))
        })
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, ExecError> {
    let name = String::from_utf8(start.name().as_ref().to_vec())
        .map_err(|err| ExecError::Xml(err.to_string()))?;
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())
            .map_err(|err| ExecError::Xml(err.to_string()))?;
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    Ok(XmlElement {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn read_document(input: &str) -> Result<XmlElement, ExecError> {
    let mut reader = Reader::from_str(input);
    let mut stack: Vec<XmlElement> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return finish_root(element, &mut reader),
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ExecError::Xml("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return finish_root(element, &mut reader),
                }
            }
            Event::Text(text) => {
                if !text.unescape()?.trim().is_empty() {
                    return Err(ExecError::Xml("unexpected text content".to_string()));
                }
            }
            Event::Eof => return Err(ExecError::Xml("unexpected end of document".to_string())),
            _ => {}
        }
    }
}

fn finish_root(root: XmlElement, reader: &mut Reader<&[u8]>) -> Result<XmlElement, ExecError> {
    loop {
        match reader.read_event()? {
            Event::Eof => return Ok(root),
            Event::Text(text) => {
                if !text.unescape()?.trim().is_empty() {
                    return Err(ExecError::Xml(
                        "unexpected content after document root".to_string(),
                    ));
                }
            }
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) => {}
            _ => {
                return Err(ExecError::Xml(
                    "unexpected content after document root".to_string(),
                ));
            }
        }
    }
}

pub(crate) fn parse(input: &str) -> Result<Arc<ExecTree>, ExecError> {
    let root = read_document(input)?;
    parse_tree(&root, &mut Vec::new())
}

fn parse_tree(
    element: &XmlElement,
    resource_scope: &mut Vec<Vec<Arc<ExecResource>>>,
) -> Result<Arc<ExecTree>, ExecError> {
    if element.name != "execTree" {
        return Err(ExecError::Xml(format!(
            "expected execTree, found {}",
            element.name
        )));
    }
    if element.require("version")? != VERSION {
        return Err(ExecError::Xml(format!(
            "tree document version {} is not supported",
            element.require("version")?
        )));
    }

    let uuid = parse_uuid(element.require("uuid")?)?;
    let tree = ExecTree::with_uuid(element.attr("name").unwrap_or_default().to_string(), uuid);
    tree.set_href(element.attr("href").unwrap_or_default());
    tree.set_cwd(element.attr("cwd").unwrap_or("/"));

    for child in element.children_named("execResource") {
        parse_resource(child, &tree)?;
    }
    resource_scope.push(tree.resources());

    for child in element.children_named("execTree") {
        let subtree = parse_tree(child, resource_scope)?;
        tree.register_subtree(subtree);
    }
    for child in element.children_named("execJob") {
        let job = parse_job(child, &tree, resource_scope)?;
        tree.add_job(&job)?;
    }
    for child in element.children_named("execDependency") {
        parse_dep(child, &tree)?;
    }
    for child in element.children_named("legendItem") {
        tree.add_legend(child.require("name")?, child.require("value")?);
    }

    resource_scope.pop();
    Ok(tree)
}

fn parse_resource(
    element: &XmlElement,
    tree: &Arc<ExecTree>,
) -> Result<Arc<ExecResource>, ExecError> {
    let name = element.attr("name").unwrap_or_default().to_string();
    let uuid = parse_uuid(element.require("uuid")?)?;
    let avail: i64 = element
        .attr("avail")
        .unwrap_or("-1")
        .parse()
        .map_err(|_| ExecError::Xml(format!("invalid avail on resource {name}")))?;
    Ok(ExecResource::with_uuid(tree, name, avail, uuid))
}

fn parse_job(
    element: &XmlElement,
    tree: &Arc<ExecTree>,
    resource_scope: &[Vec<Arc<ExecResource>>],
) -> Result<Arc<ExecJob>, ExecError> {
    let name = element.require("name")?.to_string();
    let uuid = parse_uuid(element.require("uuid")?)?;
    let job = ExecJob::from_parts(name, uuid);
    job.set_mustcomplete(element.attr("mustcomplete") == Some("True"));
    if let Some(href) = element.attr("href") {
        job.set_href(href);
    }
    if let Some(tcolor) = element.attr("tcolor") {
        job.set_tcolor(tcolor);
    }

    match (element.attr("jobpath"), element.attr("subtreeuuid")) {
        (Some(path), _) if !path.is_empty() => job.set_jobpath(path)?,
        (_, Some(subtree_uuid)) => {
            let subtree = tree
                .find_subtree(parse_uuid(subtree_uuid)?)
                .ok_or_else(|| {
                    ExecError::Xml(format!(
                        "job {} references subtree {} which cannot be found",
                        job.name(),
                        subtree_uuid
                    ))
                })?;
            job.set_subtree(subtree)?;
        }
        _ => {}
    }

    match element.attr("logfile") {
        None | Some("") => {}
        Some(path) => job.set_logfile(path),
    }

    for argument in element.children_named("execArg") {
        job.push_argument(argument.require("value")?);
    }
    for reference in element.children_named("execResource") {
        let needle = reference.require("uuid")?;
        let found = resource_scope
            .iter()
            .flatten()
            .find(|resource| resource.uuid().simple().to_string() == needle);
        match found {
            Some(resource) => job.add_resource(Arc::clone(resource)),
            None => tracing::warn!(
                job = %job.name(),
                resource = needle,
                "job references unknown resource; ignoring"
            ),
        }
    }
    Ok(job)
}

fn parse_dep(element: &XmlElement, tree: &Arc<ExecTree>) -> Result<(), ExecError> {
    let parent_ref = element.require("parent")?;
    let child_ref = element.require("child")?;
    let state_value: i64 = element
        .require("state")?
        .parse()
        .map_err(|_| ExecError::Xml("invalid dependency state".to_string()))?;
    let state = JobState::from_value(state_value)?;

    let parent = tree.find_job(parent_ref).ok_or_else(|| ExecError::JobUndefined {
        job: parent_ref.to_string(),
        tree: tree.name(),
    })?;
    let child = tree.find_job(child_ref).ok_or_else(|| ExecError::JobUndefined {
        job: child_ref.to_string(),
        tree: tree.name(),
    })?;

    let colors = match (element.attr("dcolor"), element.attr("ucolor")) {
        (Some(dcolor), Some(ucolor)) => Some((dcolor.to_string(), ucolor.to_string())),
        _ => None,
    };
    tree.insert_dep(&parent, &child, state, colors)?;
    Ok(())
}

fn parse_uuid(value: &str) -> Result<Uuid, ExecError> {
    Uuid::parse_str(value).map_err(|_| ExecError::Xml(format!("invalid uuid {value}")))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::job::UNDEF_JOB;

    fn rich_tree() -> Arc<ExecTree> {
        let tree = ExecTree::new("base");
        tree.set_cwd("/tmp");
        tree.set_href("http://example.invalid/tree");
        let db = ExecResource::new(&tree, "db", 2);

        let ltree = ExecTree::new("local tree");
        let throttle = ExecResource::new(&ltree, "throttle", 1);
        let yup = ExecJob::new("yup", "/bin/true");
        yup.push_argument("one");
        // Subtree jobs may reference resources owned by an ancestor tree.
        yup.add_resource(Arc::clone(&db));
        yup.add_resource(throttle);
        ltree.add_job(&yup).unwrap();
        let yak = ExecJob::new("yak", "/bin/true");
        ltree.add_job(&yak).unwrap();
        ltree.add_dep(&yup, &yak).unwrap();

        let foo = ExecJob::new("foo", "/bin/echo");
        foo.push_argument("a");
        foo.push_argument("b");
        foo.set_logfile("/tmp/foo.log");
        foo.add_resource(db);
        foo.set_href("http://example.invalid/foo");
        tree.add_job(&foo).unwrap();

        let rez = ExecJob::with_subtree("rez", ltree);
        tree.add_job(&rez).unwrap();

        let jum = ExecJob::new("jum", UNDEF_JOB);
        jum.set_mustcomplete(false);
        tree.add_job(&jum).unwrap();

        let war = ExecJob::new("war", "/bin/false");
        tree.add_job(&war).unwrap();

        tree.add_dep(&foo, &rez).unwrap();
        tree.add_dep(&foo, &jum).unwrap();
        tree.add_dep(&foo, &war).unwrap();
        tree.add_dep_with_state(&war, &jum, JobState::Failed)
            .unwrap();

        tree.add_legend("release", "1.2");
        tree.add_legend("build", "abc");
        tree
    }

    #[test]
    fn round_trips_byte_for_byte() -> Result<()> {
        let tree = rich_tree();
        let first = tree.to_xml_string()?;
        let parsed = ExecTree::from_xml_str(&first)?;
        let second = parsed.to_xml_string()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn parse_restores_the_structure() -> Result<()> {
        let tree = rich_tree();
        let parsed = ExecTree::from_xml_str(&tree.to_xml_string()?)?;

        assert_eq!(parsed.name(), "base");
        assert_eq!(parsed.uuid(), tree.uuid());
        assert_eq!(parsed.cwd(), std::path::PathBuf::from("/tmp"));
        assert_eq!(parsed.jobs().len(), 4);
        assert_eq!(parsed.deps().len(), 4);
        assert_eq!(parsed.resources().len(), 1);
        assert_eq!(parsed.subtrees().len(), 1);
        assert_eq!(parsed.legend().len(), 2);

        let foo = parsed.find_job("foo").unwrap();
        assert_eq!(foo.arguments(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(foo.logfile(), Some(std::path::PathBuf::from("/tmp/foo.log")));
        assert_eq!(foo.resources().len(), 1);

        let jum = parsed.find_job("jum").unwrap();
        assert_eq!(jum.state(), JobState::Undef);
        assert!(!jum.mustcomplete());

        let rez = parsed.find_job("rez").unwrap();
        let subtree = rez.subtree().unwrap();
        assert_eq!(subtree.name(), "local tree");
        let yup = subtree.find_job("yup").unwrap();
        // One local resource plus one resolved from the ancestor tree.
        assert_eq!(yup.resources().len(), 2);

        let failure_edge = parsed
            .deps()
            .into_iter()
            .find(|dep| dep.state() == JobState::Failed)
            .unwrap();
        assert_eq!(failure_edge.parent().name(), "war");
        assert_eq!(failure_edge.child().name(), "jum");
        Ok(())
    }

    #[test]
    fn rejects_unsupported_versions() -> Result<()> {
        let tree = rich_tree();
        let document = tree.to_xml_string()?.replace("version=\"1.0\"", "version=\"2.0\"");
        assert!(matches!(
            ExecTree::from_xml_str(&document),
            Err(ExecError::Xml(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_a_foreign_root_element() {
        assert!(matches!(
            ExecTree::from_xml_str("<notATree version=\"1.0\"/>"),
            Err(ExecError::Xml(_))
        ));
    }

    #[test]
    fn rejects_unknown_dependency_states() {
        let parent = Uuid::new_v4().simple().to_string();
        let child = Uuid::new_v4().simple().to_string();
        let tree_uuid = Uuid::new_v4().simple().to_string();
        let document = format!(
            "<execTree version=\"1.0\" name=\"t\" href=\"\" uuid=\"{tree_uuid}\" cwd=\"/\">\
             <execJob name=\"a\" uuid=\"{parent}\" mustcomplete=\"True\" href=\"\" tcolor=\"lavender\" jobpath=\"/bin/true\" logfile=\"\"/>\
             <execJob name=\"b\" uuid=\"{child}\" mustcomplete=\"True\" href=\"\" tcolor=\"lavender\" jobpath=\"/bin/true\" logfile=\"\"/>\
             <execDependency parent=\"{parent}\" child=\"{child}\" state=\"9\" dcolor=\"x\" ucolor=\"y\"/>\
             </execTree>"
        );
        assert!(matches!(
            ExecTree::from_xml_str(&document),
            Err(ExecError::UnknownState(9))
        ));
    }

    #[test]
    fn drops_unknown_resource_references() {
        let job_uuid = Uuid::new_v4().simple().to_string();
        let tree_uuid = Uuid::new_v4().simple().to_string();
        let ghost = Uuid::new_v4().simple().to_string();
        let document = format!(
            "<execTree version=\"1.0\" name=\"t\" href=\"\" uuid=\"{tree_uuid}\" cwd=\"/\">\
             <execJob name=\"a\" uuid=\"{job_uuid}\" mustcomplete=\"True\" href=\"\" tcolor=\"lavender\" jobpath=\"/bin/true\" logfile=\"\">\
             <execResource uuid=\"{ghost}\"/>\
             </execJob>\
             </execTree>"
        );
        let parsed = ExecTree::from_xml_str(&document).unwrap();
        assert!(parsed.find_job("a").unwrap().resources().is_empty());
    }

    #[test]
    fn escapes_attribute_values() -> Result<()> {
        let tree = ExecTree::new("quotes & <angles>");
        let job = ExecJob::new("a", "/bin/true");
        job.push_argument("two words & a <tag>");
        tree.add_job(&job).unwrap();

        let document = tree.to_xml_string()?;
        assert!(document.contains("&amp;"), "{document}");
        let parsed = ExecTree::from_xml_str(&document)?;
        assert_eq!(parsed.name(), "quotes & <angles>");
        assert_eq!(
            parsed.find_job("a").unwrap().arguments(),
            vec!["two words & a <tag>".to_string()]
        );
        assert_eq!(parsed.to_xml_string()?, document);
        Ok(())
    }
}

//! Decoder for Java source files, built on tree-sitter.
//!
//! Each top-level or nested type declaration becomes one record. Nested types
//! use binary names (`a.b.Outer$Inner`) and follow their enclosing record.
//! Constructors are reported as `<init>(...)`. Supertype and annotation
//! names are resolved against the file's own declarations, its single-type
//! imports, `java.lang` and finally the file's package.

use std::collections::HashMap;
use tree_sitter::{Node, Parser};

use crate::decode::{
    ClassEvent, DecodeError, Decoder, EventSink, Owner, PACKAGE_INFO, RecordHeader,
};
use crate::policy::Modifiers;

const JAVA_LANG: &[&str] = &[
    "AutoCloseable",
    "Boolean",
    "CharSequence",
    "Class",
    "Cloneable",
    "Comparable",
    "Deprecated",
    "Enum",
    "Error",
    "Exception",
    "FunctionalInterface",
    "Integer",
    "Iterable",
    "Long",
    "Number",
    "Object",
    "Override",
    "Record",
    "Runnable",
    "RuntimeException",
    "SafeVarargs",
    "String",
    "SuppressWarnings",
    "Thread",
    "Throwable",
    "Void",
];

const TYPE_KINDS: &[&str] = &[
    "class_declaration",
    "interface_declaration",
    "enum_declaration",
    "record_declaration",
    "annotation_type_declaration",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct JavaSourceDecoder;

impl JavaSourceDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for JavaSourceDecoder {
    fn extension(&self) -> &str {
        ".java"
    }

    fn resource_for(&self, class_name: &str) -> String {
        let top = class_name.split('$').next().unwrap_or(class_name);
        format!("{}{}", top.replace('.', "/"), self.extension())
    }

    fn decode(&self, resource: &str, bytes: &[u8], sink: &mut dyn EventSink) -> Result<(), DecodeError> {
        let source = std::str::from_utf8(bytes).map_err(|e| DecodeError::Malformed {
            resource: resource.to_string(),
            reason: e.to_string(),
        })?;

        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_java::LANGUAGE.into())
            .map_err(|e| DecodeError::Other(anyhow::anyhow!(e)))?;
        let tree = parser.parse(source, None).ok_or_else(|| DecodeError::Truncated {
            resource: resource.to_string(),
        })?;
        let root = tree.root_node();
        if let Some(bad) = first_error(root) {
            return Err(DecodeError::Malformed {
                resource: resource.to_string(),
                reason: format!("syntax error at line {}", bad.start_position().row + 1),
            });
        }

        let mut scope = Scope::default();
        let mut package_node = None;
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            match child.kind() {
                "package_declaration" => {
                    scope.package = extract_package(&child, bytes);
                    package_node = Some(child);
                }
                "import_declaration" => {
                    if let Some(path) = extract_type_import(&child, bytes) {
                        let simple = path.rsplit('.').next().unwrap_or(&path).to_string();
                        scope.imports.insert(simple, path);
                    }
                }
                _ => {}
            }
        }

        let is_package_info = resource
            .rsplit(['/', '\\'])
            .next()
            .is_some_and(|file| file == format!("{PACKAGE_INFO}.java"));
        if is_package_info {
            if let Some(node) = package_node {
                emit_package_info(&node, bytes, &scope, sink);
            }
            return Ok(());
        }

        let types: Vec<Node> = root
            .children(&mut cursor)
            .filter(|c| TYPE_KINDS.contains(&c.kind()))
            .collect();
        for node in &types {
            if let Some(simple) = name_of(node, bytes) {
                let binary = scope.qualify(simple);
                collect_declared(node, bytes, &binary, &mut scope.declared);
            }
        }
        for node in &types {
            emit_type(node, bytes, None, &scope, sink);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Scope {
    package: String,
    imports: HashMap<String, String>,
    declared: HashMap<String, String>,
}

impl Scope {
    fn qualify(&self, simple: &str) -> String {
        if self.package.is_empty() {
            simple.to_string()
        } else {
            format!("{}.{}", self.package, simple)
        }
    }

    fn resolve(&self, raw: &str) -> String {
        let name = strip_type_arguments(raw);
        let (head, rest) = match name.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (name.as_str(), None),
        };
        let base = if let Some(binary) = self.declared.get(head) {
            binary.clone()
        } else if let Some(path) = self.imports.get(head) {
            path.clone()
        } else if JAVA_LANG.contains(&head) {
            format!("java.lang.{head}")
        } else if rest.is_some() {
            return name;
        } else {
            self.qualify(head)
        };
        match rest {
            Some(rest) => format!("{base}${}", rest.replace('.', "$")),
            None => base,
        }
    }
}

fn collect_declared(node: &Node, source: &[u8], binary: &str, declared: &mut HashMap<String, String>) {
    if let Some(simple) = name_of(node, source) {
        declared
            .entry(simple.to_string())
            .or_insert_with(|| binary.to_string());
    }
    for nested in nested_types(node) {
        if let Some(simple) = name_of(&nested, source) {
            collect_declared(&nested, source, &format!("{binary}${simple}"), declared);
        }
    }
}

fn emit_package_info(node: &Node, source: &[u8], scope: &Scope, sink: &mut dyn EventSink) {
    let name = if scope.package.is_empty() {
        PACKAGE_INFO.to_string()
    } else {
        format!("{}.{}", scope.package, PACKAGE_INFO)
    };
    let modifiers = Modifiers::INTERFACE | Modifiers::ABSTRACT | Modifiers::SYNTHETIC;
    let header = RecordHeader {
        name: &name,
        modifiers: modifiers.bits(),
        superclass: Some("java.lang.Object"),
        interfaces: Vec::new(),
    };
    if sink.accept(ClassEvent::BeginRecord(header)).wanted() {
        let mut cursor = node.walk();
        let annotations: Vec<Node> = node
            .children(&mut cursor)
            .filter(|c| is_annotation(c))
            .collect();
        emit_annotations(&annotations, source, scope, Owner::Record, sink);
    }
    sink.accept(ClassEvent::EndRecord);
}

fn emit_type(node: &Node, source: &[u8], enclosing: Option<&str>, scope: &Scope, sink: &mut dyn EventSink) {
    let Some(simple) = name_of(node, source) else {
        return;
    };
    let name = match enclosing {
        Some(outer) => format!("{outer}${simple}"),
        None => scope.qualify(simple),
    };

    let modifier_node = node
        .children(&mut node.walk())
        .find(|c| c.kind() == "modifiers");
    let (mut modifiers, annotations) = match modifier_node {
        Some(m) => read_modifiers(&m),
        None => (Modifiers::empty(), Vec::new()),
    };
    match node.kind() {
        "interface_declaration" => modifiers |= Modifiers::INTERFACE | Modifiers::ABSTRACT,
        "annotation_type_declaration" => {
            modifiers |= Modifiers::INTERFACE | Modifiers::ABSTRACT | Modifiers::ANNOTATION
        }
        "enum_declaration" => modifiers |= Modifiers::ENUM,
        "record_declaration" => modifiers |= Modifiers::FINAL,
        _ => {}
    }

    let superclass = match node.kind() {
        _ if name == "java.lang.Object" => None,
        "class_declaration" => Some(
            node.child_by_field_name("superclass")
                .and_then(|s| s.named_child(0))
                .map(|t| scope.resolve(&type_name(&t, source)))
                .unwrap_or_else(|| "java.lang.Object".to_string()),
        ),
        "enum_declaration" => Some("java.lang.Enum".to_string()),
        "record_declaration" => Some("java.lang.Record".to_string()),
        _ => Some("java.lang.Object".to_string()),
    };

    let interfaces: Vec<String> = match node.kind() {
        "annotation_type_declaration" => vec!["java.lang.annotation.Annotation".to_string()],
        "interface_declaration" => {
            let extends = node
                .children(&mut node.walk())
                .find(|c| c.kind() == "extends_interfaces");
            type_list(extends, source, scope)
        }
        _ => type_list(node.child_by_field_name("interfaces"), source, scope),
    };

    let header = RecordHeader {
        name: &name,
        modifiers: modifiers.bits(),
        superclass: superclass.as_deref(),
        interfaces: interfaces.iter().map(String::as_str).collect(),
    };
    if sink.accept(ClassEvent::BeginRecord(header)).wanted() {
        emit_annotations(&annotations, source, scope, Owner::Record, sink);
        if node.kind() == "record_declaration" {
            emit_record_components(node, source, scope, sink);
        }
        if let Some(body) = node.child_by_field_name("body") {
            emit_members(&body, source, scope, sink);
        }
    }
    sink.accept(ClassEvent::EndRecord);

    for nested in nested_types(node) {
        emit_type(&nested, source, Some(&name), scope, sink);
    }
}

fn emit_record_components(node: &Node, source: &[u8], scope: &Scope, sink: &mut dyn EventSink) {
    let Some(params) = node.child_by_field_name("parameters") else {
        return;
    };
    let mut cursor = params.walk();
    for param in params.named_children(&mut cursor) {
        let Some(field) = param.child_by_field_name("name") else {
            continue;
        };
        let annotations = param
            .children(&mut param.walk())
            .find(|c| c.kind() == "modifiers")
            .map(|m| read_modifiers(&m).1)
            .unwrap_or_default();
        if sink
            .accept(ClassEvent::Field {
                name: node_text(&field, source),
            })
            .wanted()
        {
            emit_annotations(&annotations, source, scope, Owner::Field, sink);
        }
    }
}

fn emit_members(body: &Node, source: &[u8], scope: &Scope, sink: &mut dyn EventSink) {
    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        match child.kind() {
            "field_declaration" | "constant_declaration" => {
                let annotations = member_annotations(&child);
                let mut inner = child.walk();
                for declarator in child.children_by_field_name("declarator", &mut inner) {
                    let Some(field) = declarator.child_by_field_name("name") else {
                        continue;
                    };
                    if sink
                        .accept(ClassEvent::Field {
                            name: node_text(&field, source),
                        })
                        .wanted()
                    {
                        emit_annotations(&annotations, source, scope, Owner::Field, sink);
                    }
                }
            }
            "enum_constant" => {
                let Some(field) = child.child_by_field_name("name") else {
                    continue;
                };
                let annotations = member_annotations(&child);
                if sink
                    .accept(ClassEvent::Field {
                        name: node_text(&field, source),
                    })
                    .wanted()
                {
                    emit_annotations(&annotations, source, scope, Owner::Field, sink);
                }
            }
            "method_declaration" | "constructor_declaration" | "compact_constructor_declaration"
            | "annotation_type_element_declaration" => {
                let Some(signature) = method_signature(&child, source) else {
                    continue;
                };
                let annotations = member_annotations(&child);
                if sink
                    .accept(ClassEvent::Method {
                        signature: &signature,
                    })
                    .wanted()
                {
                    emit_annotations(&annotations, source, scope, Owner::Method, sink);
                }
            }
            "enum_body_declarations" => emit_members(&child, source, scope, sink),
            _ => {}
        }
    }
}

fn emit_annotations(annotations: &[Node], source: &[u8], scope: &Scope, owner: Owner, sink: &mut dyn EventSink) {
    for annotation in annotations {
        let Some(name) = annotation.child_by_field_name("name") else {
            continue;
        };
        let resolved = scope.resolve(node_text(&name, source));
        let detail = annotation
            .child_by_field_name("arguments")
            .map(|a| normalize_whitespace(node_text(&a, source)));
        sink.accept(ClassEvent::Annotation {
            owner,
            annotation: &resolved,
            detail: detail.as_deref(),
        });
    }
}

fn read_modifiers<'t>(node: &Node<'t>) -> (Modifiers, Vec<Node<'t>>) {
    let mut flags = Modifiers::empty();
    let mut annotations = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "public" => flags |= Modifiers::PUBLIC,
            "private" => flags |= Modifiers::PRIVATE,
            "protected" => flags |= Modifiers::PROTECTED,
            "static" => flags |= Modifiers::STATIC,
            "final" => flags |= Modifiers::FINAL,
            "abstract" => flags |= Modifiers::ABSTRACT,
            _ if is_annotation(&child) => annotations.push(child),
            _ => {}
        }
    }
    (flags, annotations)
}

fn member_annotations<'t>(node: &Node<'t>) -> Vec<Node<'t>> {
    node.children(&mut node.walk())
        .find(|c| c.kind() == "modifiers")
        .map(|m| read_modifiers(&m).1)
        .unwrap_or_default()
}

fn nested_types<'t>(node: &Node<'t>) -> Vec<Node<'t>> {
    let Some(body) = node.child_by_field_name("body") else {
        return Vec::new();
    };
    let mut found = Vec::new();
    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        if TYPE_KINDS.contains(&child.kind()) {
            found.push(child);
        } else if child.kind() == "enum_body_declarations" {
            let mut inner = child.walk();
            found.extend(
                child
                    .children(&mut inner)
                    .filter(|c| TYPE_KINDS.contains(&c.kind())),
            );
        }
    }
    found
}

fn type_list(node: Option<Node>, source: &[u8], scope: &Scope) -> Vec<String> {
    let Some(node) = node else {
        return Vec::new();
    };
    let Some(list) = node.children(&mut node.walk()).find(|c| c.kind() == "type_list") else {
        return Vec::new();
    };
    let mut cursor = list.walk();
    list.named_children(&mut cursor)
        .map(|t| scope.resolve(&type_name(&t, source)))
        .collect()
}

fn type_name(node: &Node, source: &[u8]) -> String {
    match node.kind() {
        "generic_type" => node
            .named_child(0)
            .map(|n| type_name(&n, source))
            .unwrap_or_default(),
        "annotated_type" => {
            let count = node.named_child_count();
            count
                .checked_sub(1)
                .and_then(|last| node.named_child(last as u32))
                .map(|n| type_name(&n, source))
                .unwrap_or_default()
        }
        _ => strip_type_arguments(node_text(node, source)),
    }
}

fn method_signature(node: &Node, source: &[u8]) -> Option<String> {
    let name = match node.kind() {
        "constructor_declaration" | "compact_constructor_declaration" => "<init>",
        _ => node_text(&node.child_by_field_name("name")?, source),
    };
    let params = node
        .child_by_field_name("parameters")
        .map(|p| normalize_whitespace(node_text(&p, source)))
        .unwrap_or_else(|| "()".to_string());
    Some(format!("{name}{params}"))
}

fn extract_package(node: &Node, source: &[u8]) -> String {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == "scoped_identifier" || child.kind() == "identifier" {
            return node_text(&child, source).to_string();
        }
    }
    String::new()
}

/// Single-type imports only; static and on-demand imports name no type.
fn extract_type_import(node: &Node, source: &[u8]) -> Option<String> {
    let mut path = None;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "static" | "asterisk" => return None,
            "scoped_identifier" | "identifier" => {
                path = Some(node_text(&child, source).to_string());
            }
            _ => {}
        }
    }
    path
}

fn name_of<'s>(node: &Node, source: &'s [u8]) -> Option<&'s str> {
    node.child_by_field_name("name").map(|n| node_text(&n, source))
}

fn is_annotation(node: &Node) -> bool {
    matches!(node.kind(), "annotation" | "marker_annotation")
}

fn first_error<'t>(node: Node<'t>) -> Option<Node<'t>> {
    if !node.has_error() {
        return None;
    }
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'t>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error).or(Some(node))
}

fn strip_type_arguments(text: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            c if depth == 0 && !c.is_whitespace() => out.push(c),
            _ => {}
        }
    }
    out
}

fn node_text<'a>(node: &Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Interest;

    #[derive(Default)]
    struct Recording {
        events: Vec<String>,
        skip_records: Vec<&'static str>,
    }

    impl EventSink for Recording {
        fn accept(&mut self, event: ClassEvent<'_>) -> Interest {
            let line = match &event {
                ClassEvent::BeginRecord(h) => format!(
                    "begin {} super={} ifaces={} mods={:#x}",
                    h.name,
                    h.superclass.unwrap_or("-"),
                    h.interfaces.join(","),
                    h.modifiers
                ),
                ClassEvent::Field { name } => format!("field {name}"),
                ClassEvent::Method { signature } => format!("method {signature}"),
                ClassEvent::Annotation {
                    owner,
                    annotation,
                    detail,
                } => format!("anno {owner:?} {annotation} {}", detail.unwrap_or("")),
                ClassEvent::EndRecord => "end".to_string(),
            };
            self.events.push(line);
            match event {
                ClassEvent::BeginRecord(h) if self.skip_records.iter().any(|s| *s == h.name) => {
                    Interest::Skip
                }
                _ => Interest::Wanted,
            }
        }
    }

    fn decode(resource: &str, source: &str) -> Vec<String> {
        let mut sink = Recording::default();
        JavaSourceDecoder
            .decode(resource, source.as_bytes(), &mut sink)
            .unwrap();
        sink.events
    }

    #[test]
    fn decode_class_with_imports_and_annotations() {
        let source = r#"
package org.example;

import java.util.List;
import org.lib.Entity;
import org.lib.Repository;

@Entity
public abstract class AbstractRepository<T> extends Base implements Repository<T>, Runnable {
    @Column(length = 10)
    private String name, alias;

    @Override
    public void run() {}

    protected AbstractRepository(String name) {}
}
"#;
        let events = decode("org/example/AbstractRepository.java", source);
        assert_eq!(
            events[0],
            "begin org.example.AbstractRepository super=org.example.Base \
             ifaces=org.lib.Repository,java.lang.Runnable mods=0x401"
        );
        assert_eq!(events[1], "anno Record org.lib.Entity ");
        assert_eq!(events[2], "field name");
        assert_eq!(events[3], "anno Field org.example.Column (length = 10)");
        assert_eq!(events[4], "field alias");
        assert_eq!(events[5], "anno Field org.example.Column (length = 10)");
        assert_eq!(events[6], "method run()");
        assert_eq!(events[7], "anno Method java.lang.Override ");
        assert_eq!(events[8], "method <init>(String name)");
        assert_eq!(events.last().map(String::as_str), Some("end"));
    }

    #[test]
    fn nested_types_follow_their_outer_record() {
        let source = r#"
package a;

public class Outer {
    static class Inner extends Outer {}
    interface Callback extends Comparable<Inner> {}
}
"#;
        let events = decode("a/Outer.java", source);
        let begins: Vec<&String> = events.iter().filter(|e| e.starts_with("begin")).collect();
        assert_eq!(begins.len(), 3);
        assert!(begins[0].starts_with("begin a.Outer super=java.lang.Object"));
        assert!(begins[1].starts_with("begin a.Outer$Inner super=a.Outer"));
        assert!(begins[2].starts_with("begin a.Outer$Callback super=java.lang.Object ifaces=java.lang.Comparable"));
    }

    #[test]
    fn enums_records_and_annotation_types_get_implicit_supertypes() {
        let events = decode("a/Color.java", "package a; public enum Color { @Deprecated RED, GREEN }");
        assert!(events[0].starts_with("begin a.Color super=java.lang.Enum"));
        assert!(events.contains(&"field RED".to_string()));
        assert!(events.contains(&"anno Field java.lang.Deprecated ".to_string()));

        let events = decode("a/Point.java", "package a; public record Point(int x, int y) {}");
        assert!(events[0].starts_with("begin a.Point super=java.lang.Record"));
        assert_eq!(events[1], "field x");
        assert_eq!(events[2], "field y");

        let events = decode("a/Marker.java", "package a; public @interface Marker { String value() default \"\"; }");
        assert_eq!(
            events[0],
            "begin a.Marker super=java.lang.Object ifaces=java.lang.annotation.Annotation mods=0x2601"
        );
        assert_eq!(events[1], "method value()");
    }

    #[test]
    fn package_info_yields_a_package_record() {
        let source = "@Deprecated\n@org.lib.Api(\"v1\")\npackage a.b;\n";
        let events = decode("a/b/package-info.java", source);
        assert!(events[0].starts_with("begin a.b.package-info super=java.lang.Object"));
        assert_eq!(events[1], "anno Record java.lang.Deprecated ");
        assert_eq!(events[2], "anno Record org.lib.Api (\"v1\")");
        assert_eq!(events[3], "end");
    }

    #[test]
    fn skipped_record_still_closes_and_nested_types_continue() {
        let mut sink = Recording {
            skip_records: vec!["a.Outer"],
            ..Default::default()
        };
        let source = "package a; @Foo class Outer { int x; class Inner {} }";
        JavaSourceDecoder
            .decode("a/Outer.java", source.as_bytes(), &mut sink)
            .unwrap();
        assert!(sink.events[1] == "end");
        assert!(sink.events[2].starts_with("begin a.Outer$Inner"));
    }

    #[test]
    fn syntax_errors_are_malformed() {
        let mut sink = Recording::default();
        let err = JavaSourceDecoder
            .decode("a/Broken.java", b"package a; class Broken {", &mut sink)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn resources_map_nested_names_to_the_outer_file() {
        let d = JavaSourceDecoder;
        assert_eq!(d.resource_for("a.b.Outer$Inner"), "a/b/Outer.java");
        assert_eq!(d.class_name_of("a/b/Outer.java").as_deref(), Some("a.b.Outer"));
    }
}

//! Parser for protobufjs-style JSON service descriptions.
//!
//! ```json
//! { "nested": { "demo": { "nested": {
//!     "Echo": { "methods": {
//!         "Say": { "requestType": "Req", "responseType": "Resp" },
//!         "Chat": { "requestType": "Req", "requestStream": true,
//!                   "responseType": "Resp", "responseStream": true }
//!     } }
//! } } } }
//! ```
//!
//! The document is first read into an order-preserving tree that keeps
//! repeated keys, so duplicates can be rejected instead of silently
//! overwritten.

use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

use crate::descriptor::{qualify_type, Cardinality, MethodDescriptor, ServiceDef};
use crate::error::SchemaError;

#[derive(Debug)]
enum Node {
    Null,
    Bool(bool),
    Number,
    String(String),
    Array(Vec<Node>),
    Object(Vec<(String, Node)>),
}

impl Node {
    fn type_name(&self) -> &'static str {
        match self {
            Node::Null => "null",
            Node::Bool(_) => "boolean",
            Node::Number => "number",
            Node::String(_) => "string",
            Node::Array(_) => "array",
            Node::Object(_) => "object",
        }
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
        Ok(Node::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Node, E> {
        Ok(Node::Number)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Node, E> {
        Ok(Node::Number)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Node, E> {
        Ok(Node::Number)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
        Ok(Node::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
        Ok(Node::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Node, D::Error> {
        Node::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Node::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Node, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, Node>()? {
            entries.push((key, value));
        }
        Ok(Node::Object(entries))
    }
}

fn check_duplicate_keys(node: &Node, path: &str) -> Result<(), SchemaError> {
    match node {
        Node::Object(entries) => {
            let mut seen = HashSet::new();
            for (key, value) in entries {
                if !seen.insert(key.as_str()) {
                    return Err(SchemaError::DuplicateKey {
                        path: path.to_string(),
                        key: key.clone(),
                    });
                }
                check_duplicate_keys(value, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        Node::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| check_duplicate_keys(item, &format!("{path}[{i}]"))),
        _ => Ok(()),
    }
}

fn get<'a>(entries: &'a [(String, Node)], key: &str) -> Option<&'a Node> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn join(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

fn check_name(name: &str, path: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.contains('.') || name.contains('/') {
        return Err(SchemaError::invalid(path, format!("invalid name '{name}'")));
    }
    Ok(())
}

pub(crate) fn parse(text: &str) -> Result<Vec<ServiceDef>, SchemaError> {
    let root: Node = serde_json::from_str(text)?;
    check_duplicate_keys(&root, "$")?;

    let Node::Object(entries) = &root else {
        return Err(SchemaError::invalid(
            "$",
            format!("expected an object, found {}", root.type_name()),
        ));
    };
    if get(entries, "methods").is_some() {
        return Err(SchemaError::invalid("$", "methods declared outside a named service"));
    }

    let mut services = Vec::new();
    collect(entries, "", &mut services)?;
    Ok(services)
}

fn collect(
    entries: &[(String, Node)],
    namespace: &str,
    out: &mut Vec<ServiceDef>,
) -> Result<(), SchemaError> {
    if let Some(methods) = get(entries, "methods") {
        out.push(parse_service(namespace, methods)?);
    }

    if let Some(nested) = get(entries, "nested") {
        let path = join(namespace, "nested");
        let Node::Object(children) = nested else {
            return Err(SchemaError::invalid(
                path,
                format!("expected an object, found {}", nested.type_name()),
            ));
        };
        for (name, child) in children {
            let child_ns = join(namespace, name);
            check_name(name, &child_ns)?;
            match child {
                Node::Object(child_entries) => collect(child_entries, &child_ns, out)?,
                other => {
                    return Err(SchemaError::invalid(
                        child_ns,
                        format!("expected an object, found {}", other.type_name()),
                    ))
                }
            }
        }
    }
    Ok(())
}

fn parse_service(service: &str, node: &Node) -> Result<ServiceDef, SchemaError> {
    let path = format!("{service}.methods");
    let Node::Object(methods) = node else {
        return Err(SchemaError::invalid(
            path,
            format!("expected an object, found {}", node.type_name()),
        ));
    };
    let namespace = service.rsplit_once('.').map_or("", |(ns, _)| ns);

    let mut out = Vec::with_capacity(methods.len());
    for (name, method) in methods {
        let path = format!("{path}.{name}");
        check_name(name, &path)?;
        let Node::Object(fields) = method else {
            return Err(SchemaError::invalid(
                path,
                format!("expected an object, found {}", method.type_name()),
            ));
        };
        let request = string_field(fields, "requestType", &path)?;
        let response = string_field(fields, "responseType", &path)?;
        let client_streaming = bool_field(fields, "requestStream", &path)?;
        let server_streaming = bool_field(fields, "responseStream", &path)?;

        out.push(MethodDescriptor {
            service: service.to_string(),
            method: name.clone(),
            cardinality: Cardinality::from_flags(client_streaming, server_streaming),
            request_type: qualify_type(namespace, request),
            response_type: qualify_type(namespace, response),
        });
    }

    Ok(ServiceDef {
        name: service.to_string(),
        methods: out,
    })
}

fn string_field<'a>(
    fields: &'a [(String, Node)],
    key: &str,
    path: &str,
) -> Result<&'a str, SchemaError> {
    match get(fields, key) {
        Some(Node::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(Node::String(_)) => Err(SchemaError::invalid(path, format!("{key} is empty"))),
        Some(other) => Err(SchemaError::invalid(
            path,
            format!("{key} must be a string, found {}", other.type_name()),
        )),
        None => Err(SchemaError::invalid(path, format!("missing {key}"))),
    }
}

fn bool_field(fields: &[(String, Node)], key: &str, path: &str) -> Result<bool, SchemaError> {
    match get(fields, key) {
        None | Some(Node::Null) => Ok(false),
        Some(Node::Bool(b)) => Ok(*b),
        Some(other) => Err(SchemaError::invalid(
            path,
            format!("{key} must be a boolean, found {}", other.type_name()),
        )),
    }
}

//! The AST arena and JSON loader.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::Node;

/// Dense index of a node in the [`Tree`] arena.
///
/// These indexes double as the stable source keys the lowering layer uses
/// to cache identifier-to-ObjectId lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced while loading or walking the AST.
#[derive(Debug, Error)]
pub enum AstError {
    #[error("failed to parse AST JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("node reference {id} is out of bounds (arena has {len} nodes)")]
    OutOfBounds { id: NodeId, len: usize },

    #[error("root node {id} is not a program")]
    RootNotProgram { id: NodeId },
}

/// The serialized form the external parser hands over: a flat node array
/// plus the root index.
#[derive(Debug, Serialize, Deserialize)]
struct TreeFile {
    nodes: Vec<Node>,
    root: NodeId,
}

/// Arena of AST nodes with a designated program root.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Parses the external parser's JSON into a tree, validating that
    /// every node reference stays inside the arena.
    pub fn from_json(text: &str) -> Result<Tree, AstError> {
        let file: TreeFile = serde_json::from_str(text)?;
        let tree = Tree {
            nodes: file.nodes,
            root: Some(file.root),
        };
        tree.get(file.root)?;
        if !matches!(tree.get(file.root)?, Node::Program { .. }) {
            return Err(AstError::RootNotProgram { id: file.root });
        }
        Ok(tree)
    }

    /// Appends a node, returning its id. Used by the test builders and by
    /// tools that synthesize ASTs programmatically.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Marks `id` as the program root.
    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    /// The program root, when one was designated.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bounds-checked node access.
    pub fn get(&self, id: NodeId) -> Result<&Node, AstError> {
        self.nodes.get(id.0 as usize).ok_or(AstError::OutOfBounds {
            id,
            len: self.nodes.len(),
        })
    }

    /// The `expr_type` reference of an expression node.
    pub fn expr_type(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).ok().and_then(Node::expr_type)
    }

    /// The name carried by an `Ident` node.
    pub fn ident_name(&self, id: NodeId) -> Option<&str> {
        match self.get(id).ok()? {
            Node::Ident { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The canonical declaring node of an `Ident`: its `base` when
    /// resolved, otherwise the ident itself.
    pub fn ident_base(&self, id: NodeId) -> NodeId {
        match self.get(id).ok() {
            Some(Node::Ident {
                base: Some(base), ..
            }) => *base,
            _ => id,
        }
    }

    /// Follows `IdentType` indirection until a concrete type node.
    pub fn resolve_type(&self, mut id: NodeId) -> Result<NodeId, AstError> {
        loop {
            match self.get(id)? {
                Node::IdentType {
                    base: Some(base), ..
                } => id = *base,
                _ => return Ok(id),
            }
        }
    }

    /// Statically known bit size of a type, when computable: ints,
    /// floats, bools, string literals, and fixed arrays of sized types.
    pub fn type_bit_size(&self, id: NodeId) -> Option<u64> {
        let id = self.resolve_type(id).ok()?;
        match self.get(id).ok()? {
            Node::IntType { bit_size, .. } | Node::FloatType { bit_size, .. } => Some(*bit_size),
            Node::BoolType => Some(8),
            Node::StrLiteralType { bit_size, .. } => Some(*bit_size),
            Node::ArrayType {
                element_type,
                length_value: Some(n),
                ..
            } => self.type_bit_size(*element_type).map(|e| e * n),
            Node::EnumType { base } => match self.get(*base).ok()? {
                Node::EnumDecl {
                    base_type: Some(bt),
                    ..
                } => self.type_bit_size(*bt),
                _ => None,
            },
            Node::StructType { base } => self.struct_bit_size(*base),
            _ => None,
        }
    }

    /// Statically known bit size of a whole format: the sum of its field
    /// sizes, `None` as soon as any field is dynamic.
    pub fn struct_bit_size(&self, format: NodeId) -> Option<u64> {
        let body = match self.get(format).ok()? {
            Node::Format { body, .. } => body,
            Node::State { fields, .. } => fields,
            _ => return None,
        };
        let mut total = 0u64;
        for &element in body {
            if let Ok(Node::Field {
                field_type,
                is_state_variable,
                ..
            }) = self.get(element)
            {
                if *is_state_variable {
                    continue;
                }
                total += self.type_bit_size(*field_type)?;
            }
        }
        Some(total)
    }
}

//! AST-to-IR lowering.
//!
//! [`lower`] converts an AST [`Tree`] into the raw binary module: one
//! `DEFINE_PROGRAM` scope containing every definition, with an encoder
//! and decoder function synthesized per format. The result is the input
//! of the `binmod-transform` pass pipeline.
//!
//! The lowering is split by concern:
//! - [`expr`]: expressions down to single result ids
//! - [`control`]: statements, control flow, assignment, and φ bookkeeping
//! - [`definition`]: formats, enums, states, fields, unions, bit fields
//! - [`coder`]: encoder/decoder synthesis per field type

pub mod coder;
pub mod control;
pub mod definition;
pub mod error;
pub mod expr;

use std::collections::{HashMap, HashSet};

use binmod_ast::{Node, NodeId, Tree};
use binmod_core::{
    AbstractOp, Module, ObjectId, Storage, StorageRef, StorageType, Storages,
};

pub use error::LowerError;

/// Evaluation mode for statement walks: the same control-flow shapes are
/// lowered in all three, but fields mean "define", "write", or "read"
/// depending on the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Definition,
    Encode,
    Decode,
}

/// Salts for deriving per-node identifier cache keys, so that e.g. a
/// format node and its synthesized encoder share the node but not the id.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IdentSalt {
    Plain = 0,
    EncodeFn = 1,
    DecodeFn = 2,
    Union = 3,
}

/// Lowering context: the AST being read and the module being built.
pub struct Lowerer<'a> {
    pub tree: &'a Tree,
    pub m: Module,
    pub(crate) scope_stack: Vec<ObjectId>,
    pub(crate) recursive_formats: HashSet<NodeId>,
    /// First member field of each packed run, keyed by field node.
    pub(crate) bit_field_begin: HashMap<NodeId, ObjectId>,
    /// Last member field of each packed run.
    pub(crate) bit_field_end: HashSet<NodeId>,
    /// Interned string id to its `IMMEDIATE_STRING` opcode.
    pub(crate) string_immediates: HashMap<ObjectId, ObjectId>,
    /// Union-member ids keyed by the member's field node, recorded during
    /// definition and read back by the coder walks.
    pub(crate) union_member_ids: HashMap<NodeId, ObjectId>,
    /// Field node to its enclosing format body and position, used to
    /// classify what follows an open array.
    pub(crate) field_position: HashMap<NodeId, (NodeId, usize)>,
}

/// Lowers a parsed program into the raw IR module.
pub fn lower(tree: &Tree) -> Result<Module, LowerError> {
    let root = tree
        .root()
        .ok_or_else(|| LowerError::invalid("AST has no program root"))?;
    let (name, elements) = match tree.get(root)? {
        Node::Program { name, elements } => (name.clone(), elements.clone()),
        _ => return Err(LowerError::invalid("root node is not a program")),
    };

    let mut lowerer = Lowerer::new(tree);
    let program_id = lowerer.m.new_named_id(&name);
    lowerer
        .m
        .op_with(AbstractOp::DefineProgram, |c| c.ident = Some(program_id));
    lowerer.scope_stack.push(program_id);
    // Three walks over the same elements: definitions first, then the
    // synthesized encoders, then the decoders.
    for mode in [Mode::Definition, Mode::Encode, Mode::Decode] {
        lowerer.m.set_default_endian(binmod_core::Endian::Unspec, ObjectId::NONE);
        lowerer.eval_stmt_list(&elements, mode)?;
    }
    lowerer.scope_stack.pop();
    lowerer.m.op(AbstractOp::EndProgram);

    let mut module = lowerer.m;
    module.rebind_ident_index();
    Ok(module)
}

impl<'a> Lowerer<'a> {
    pub fn new(tree: &'a Tree) -> Self {
        let recursive_formats = find_recursive_formats(tree);
        let mut field_position = HashMap::new();
        for i in 0..tree.len() {
            let id = NodeId(i as u32);
            if let Ok(Node::Format { body, .. }) = tree.get(id) {
                for (index, &element) in body.iter().enumerate() {
                    if matches!(tree.get(element), Ok(Node::Field { .. })) {
                        field_position.insert(element, (id, index));
                    }
                }
            }
        }
        Lowerer {
            tree,
            m: Module::new(),
            scope_stack: Vec::new(),
            recursive_formats,
            bit_field_begin: HashMap::new(),
            bit_field_end: HashSet::new(),
            string_immediates: HashMap::new(),
            union_member_ids: HashMap::new(),
            field_position,
        }
    }

    /// The innermost enclosing definition scope.
    pub(crate) fn current_scope(&self) -> ObjectId {
        self.scope_stack.last().copied().unwrap_or(ObjectId::NONE)
    }

    /// Per-node identifier cache key; the salt distinguishes entities
    /// synthesized from the same node.
    pub(crate) fn source_key(node: NodeId, salt: IdentSalt) -> u64 {
        ((salt as u64) << 32) | node.0 as u64
    }

    /// The canonical key node of an identifier: a use site's `base` points
    /// at the declaring construct, whose own ident node is the key, so the
    /// declaration site and every use resolve to the same id.
    pub(crate) fn canonical_ident_node(&self, ident: NodeId) -> NodeId {
        let base = self.tree.ident_base(ident);
        match self.tree.get(base) {
            Ok(Node::Field {
                ident: Some(decl), ..
            })
            | Ok(Node::Format { ident: decl, .. })
            | Ok(Node::EnumDecl { ident: decl, .. })
            | Ok(Node::EnumMember { ident: decl, .. })
            | Ok(Node::State { ident: decl, .. })
            | Ok(Node::FunctionDecl { ident: decl, .. }) => *decl,
            _ => base,
        }
    }

    /// Resolves a source identifier use to its stable id.
    pub(crate) fn lookup_ident(&mut self, ident: NodeId) -> Result<ObjectId, LowerError> {
        let name = self
            .tree
            .ident_name(ident)
            .ok_or_else(|| LowerError::inconsistent(format!("node {} is not an ident", ident)))?
            .to_string();
        let key = self.canonical_ident_node(ident);
        Ok(self
            .m
            .lookup_source_ident(Self::source_key(key, IdentSalt::Plain), &name))
    }

    /// Returns the declaring construct node an identifier resolves to.
    pub(crate) fn ident_decl(&self, ident: NodeId) -> NodeId {
        self.tree.ident_base(ident)
    }

    /// Allocates (or reuses) the id of an entity synthesized from `node`,
    /// such as a format's encoder function.
    pub(crate) fn synthesized_ident(
        &mut self,
        node: NodeId,
        salt: IdentSalt,
        name: &str,
    ) -> ObjectId {
        self.m
            .lookup_source_ident(Self::source_key(node, salt), name)
    }

    /// Builds the storage shape of a type node. With `detect_recursive`,
    /// struct references to formats participating in a reference cycle
    /// become `RECURSIVE_STRUCT_REF` edges.
    pub(crate) fn define_storage(
        &mut self,
        type_node: NodeId,
        detect_recursive: bool,
    ) -> Result<StorageRef, LowerError> {
        let storages = self.build_storages(type_node, detect_recursive)?;
        Ok(self.m.get_storage_ref(storages))
    }

    pub(crate) fn build_storages(
        &mut self,
        type_node: NodeId,
        detect_recursive: bool,
    ) -> Result<Storages, LowerError> {
        let resolved = self.tree.resolve_type(type_node)?;
        let node = self.tree.get(resolved)?.clone();
        match node {
            Node::IntType {
                bit_size,
                is_signed,
                ..
            } => Ok(if is_signed {
                Storages::int(bit_size)
            } else {
                Storages::uint(bit_size)
            }),
            Node::FloatType { bit_size, .. } => Ok(Storages::single(Storage::sized(
                StorageType::Float,
                bit_size,
            ))),
            Node::BoolType => Ok(Storages::bool()),
            Node::StrLiteralType { bit_size, .. } => {
                let mut shape = Storages::uint(8);
                shape = shape.wrapped(Storage::sized(StorageType::Array, bit_size / 8));
                Ok(shape)
            }
            Node::ArrayType {
                element_type,
                length_value,
                ..
            } => {
                let base = self.build_storages(element_type, detect_recursive)?;
                Ok(match length_value {
                    Some(n) => base.wrapped(Storage::sized(StorageType::Array, n)),
                    None => base.wrapped(Storage::plain(StorageType::Vector)),
                })
            }
            Node::OptionalType { base } => {
                let inner = self.build_storages(base, detect_recursive)?;
                Ok(inner.wrapped(Storage::plain(StorageType::Optional)))
            }
            Node::StructType { base } => self.struct_ref_storage(base, detect_recursive),
            Node::EnumType { base } => {
                let enum_ident = match self.tree.get(base)? {
                    Node::EnumDecl { ident, .. } => *ident,
                    _ => return Err(LowerError::inconsistent("enum type with non-enum base")),
                };
                let id = self.lookup_ident(enum_ident)?;
                Ok(Storages::single(Storage::referencing(StorageType::Enum, id)))
            }
            Node::UnionType { common_type, .. } => match common_type {
                Some(ty) => self.build_storages(ty, detect_recursive),
                None => Err(LowerError::invalid(
                    "union type without a common type has no direct storage",
                )),
            },
            Node::RangeType { base, .. } => match base {
                Some(ty) => self.build_storages(ty, detect_recursive),
                None => Err(LowerError::invalid("range type without a base type")),
            },
            Node::VoidType => Err(LowerError::invalid("void has no storage")),
            other => Err(LowerError::invalid(format!(
                "type node {:?} has no storage representation",
                other
            ))),
        }
    }

    fn struct_ref_storage(
        &mut self,
        base: NodeId,
        detect_recursive: bool,
    ) -> Result<Storages, LowerError> {
        let ident = match self.tree.get(base)? {
            Node::Format { ident, .. } | Node::State { ident, .. } => *ident,
            _ => return Err(LowerError::inconsistent("struct type with non-format base")),
        };
        let id = self.lookup_ident(ident)?;
        if detect_recursive && self.recursive_formats.contains(&base) {
            return Ok(Storages::single(Storage::referencing(
                StorageType::RecursiveStructRef,
                id,
            )));
        }
        let mut storage = Storage::referencing(StorageType::StructRef, id);
        storage.size = match self.tree.struct_bit_size(base) {
            Some(bits) => bits + 1,
            None => 0,
        };
        Ok(Storages::single(storage))
    }
}

/// Formats that participate in a type reference cycle (including direct
/// self-reference). The cycle edge is what `RECURSIVE_STRUCT_REF` marks.
fn find_recursive_formats(tree: &Tree) -> HashSet<NodeId> {
    let mut formats = Vec::new();
    for i in 0..tree.len() {
        let id = NodeId(i as u32);
        if matches!(tree.get(id), Ok(Node::Format { .. })) {
            formats.push(id);
        }
    }
    let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for &format in &formats {
        let mut targets = Vec::new();
        if let Ok(Node::Format { body, .. }) = tree.get(format) {
            for &element in body {
                if let Ok(Node::Field { field_type, .. }) = tree.get(element) {
                    collect_struct_targets(tree, *field_type, &mut targets);
                }
            }
        }
        edges.insert(format, targets);
    }

    // A format is recursive if it can reach itself.
    let mut recursive = HashSet::new();
    for &start in &formats {
        let mut stack: Vec<NodeId> = edges.get(&start).cloned().unwrap_or_default();
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == start {
                recursive.insert(start);
                break;
            }
            if seen.insert(next) {
                stack.extend(edges.get(&next).cloned().unwrap_or_default());
            }
        }
    }
    recursive
}

fn collect_struct_targets(tree: &Tree, type_node: NodeId, out: &mut Vec<NodeId>) {
    let resolved = match tree.resolve_type(type_node) {
        Ok(id) => id,
        Err(_) => return,
    };
    match tree.get(resolved) {
        Ok(Node::StructType { base }) => out.push(*base),
        Ok(Node::OptionalType { base }) => collect_struct_targets(tree, *base, out),
        Ok(Node::ArrayType { element_type, .. }) => {
            collect_struct_targets(tree, *element_type, out)
        }
        Ok(Node::UnionType { candidates, .. }) => {
            for candidate in candidates {
                if let Some(field) = candidate.field {
                    if let Ok(Node::Field { field_type, .. }) = tree.get(field) {
                        collect_struct_targets(tree, *field_type, out);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmod_ast::AstEndian;

    #[test]
    fn recursive_format_detection() {
        let mut tree = Tree::new();
        let ident = tree.add(Node::Ident {
            name: "Tree".into(),
            base: None,
            expr_type: None,
        });
        // placeholder format node id must exist before the field type
        // references it, so build the format last with a known index.
        let struct_ty = tree.add(Node::StructType { base: NodeId(4) });
        let opt_ty = tree.add(Node::OptionalType { base: struct_ty });
        let field = tree.add(Node::Field {
            ident: None,
            field_type: opt_ty,
            is_state_variable: false,
            arguments: None,
        });
        let format = tree.add(Node::Format {
            ident,
            body: vec![field],
            encode_fn: None,
            decode_fn: None,
        });
        assert_eq!(format, NodeId(4));
        let recursive = find_recursive_formats(&tree);
        assert!(recursive.contains(&format));
    }

    #[test]
    fn non_recursive_formats_not_marked() {
        let mut tree = Tree::new();
        let t8 = tree.add(Node::IntType {
            bit_size: 8,
            endian: AstEndian::Unspec,
            is_signed: false,
        });
        let field = tree.add(Node::Field {
            ident: None,
            field_type: t8,
            is_state_variable: false,
            arguments: None,
        });
        let ident = tree.add(Node::Ident {
            name: "Plain".into(),
            base: None,
            expr_type: None,
        });
        let format = tree.add(Node::Format {
            ident,
            body: vec![field],
            encode_fn: None,
            decode_fn: None,
        });
        assert!(!find_recursive_formats(&tree).contains(&format));
    }

    #[test]
    fn storage_for_optional_recursive_struct() {
        let mut tree = Tree::new();
        let ident = tree.add(Node::Ident {
            name: "Tree".into(),
            base: None,
            expr_type: None,
        });
        let struct_ty = tree.add(Node::StructType { base: NodeId(4) });
        let opt_ty = tree.add(Node::OptionalType { base: struct_ty });
        let field = tree.add(Node::Field {
            ident: None,
            field_type: opt_ty,
            is_state_variable: false,
            arguments: None,
        });
        let format = tree.add(Node::Format {
            ident,
            body: vec![field],
            encode_fn: None,
            decode_fn: None,
        });
        assert_eq!(format, NodeId(4));

        let mut lowerer = Lowerer::new(&tree);
        let shape = lowerer.build_storages(opt_ty, true).unwrap();
        assert_eq!(shape.storages.len(), 2);
        assert_eq!(shape.storages[0].kind, StorageType::Optional);
        assert_eq!(shape.storages[1].kind, StorageType::RecursiveStructRef);
    }

    #[test]
    fn ident_lookup_is_stable_across_uses() {
        let mut tree = Tree::new();
        let decl = tree.add(Node::Ident {
            name: "n".into(),
            base: None,
            expr_type: None,
        });
        let use1 = tree.add(Node::Ident {
            name: "n".into(),
            base: Some(decl),
            expr_type: None,
        });
        let use2 = tree.add(Node::Ident {
            name: "n".into(),
            base: Some(decl),
            expr_type: None,
        });
        let mut lowerer = Lowerer::new(&tree);
        let a = lowerer.lookup_ident(decl).unwrap();
        let b = lowerer.lookup_ident(use1).unwrap();
        let c = lowerer.lookup_ident(use2).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }
}

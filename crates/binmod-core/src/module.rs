//! The binary module: the opcode stream plus all side tables.
//!
//! [`Module`] owns the linear code vector, the identifier/string/metadata
//! tables, the content-addressed storage table, the immediate cache, and
//! the per-definition range tables. It also carries the lowering scratch
//! state: the current-function stack, the encode-vs-decode mode flag, the
//! "previous expression" slot, and the φ frame stack used to emit `PHI`
//! opcodes at control-flow joins.
//!
//! Everything whose iteration order can reach the serialized output is an
//! insertion-ordered `IndexMap`, so two runs over the same input produce
//! byte-identical modules.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::code::Code;
use crate::error::CoreError;
use crate::id::{IdentRange, ObjectId, Range, StorageRef};
use crate::op::{AbstractOp, Endian, EndianExpr};
use crate::storage::Storages;

/// One predecessor arm of an `IF`/`ELIF`/`ELSE` chain: the arm's
/// condition (none for `ELSE`) and the last definition of every variable
/// assigned inside it.
#[derive(Debug, Clone, Default)]
pub struct PhiCandidate {
    pub condition: ObjectId,
    pub assigns: IndexMap<ObjectId, ObjectId>,
}

/// Bookkeeping for a single `IF`/`ELIF`/`ELSE` chain.
#[derive(Debug, Clone, Default)]
pub struct PhiFrame {
    pub candidates: Vec<PhiCandidate>,
    /// Opcode index where the chain begins. Arms that do not write a
    /// φ'd variable contribute its latest definition *before* this
    /// point, so the φ fallback must not look past it.
    pub start: usize,
}

/// The IR container.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Module {
    /// The main opcode stream.
    pub code: Vec<Code>,
    /// Identifier names, keyed by the id that carries them.
    pub ident_table: IndexMap<ObjectId, String>,
    /// Interned string literals.
    pub string_table: IndexMap<String, ObjectId>,
    /// Interned metadata names.
    pub metadata_table: IndexMap<String, ObjectId>,
    /// Content-addressed type shapes: canonical key to ref.
    pub storage_key_table: IndexMap<Vec<u8>, StorageRef>,
    /// Reverse storage lookup: ref to decoded shape.
    pub storage_table: IndexMap<StorageRef, Storages>,
    /// Integer immediate dedup cache: value to the opcode that holds it.
    pub immediate_table: IndexMap<u64, ObjectId>,
    /// The boolean immediate singletons.
    pub true_id: Option<ObjectId>,
    pub false_id: Option<ObjectId>,
    /// Per-definition opcode ranges, filled by a late pass.
    pub ident_to_ranges: Vec<IdentRange>,
    /// Top-level program extents.
    pub programs: Vec<Range>,

    /// `ident` to opcode index; rebuilt after every mutating pass.
    #[serde(skip)]
    pub ident_index_table: HashMap<ObjectId, usize>,

    next_id: u64,
    next_storage_ref: u64,

    // -- lowering scratch, process-local per module --
    /// `true` while synthesizing an encoder body.
    #[serde(skip)]
    pub on_encode_fn: bool,
    #[serde(skip)]
    prev_expr: ObjectId,
    #[serde(skip)]
    function_stack: Vec<ObjectId>,
    #[serde(skip)]
    phi_stack: Vec<PhiFrame>,
    #[serde(skip)]
    source_ident_ids: HashMap<u64, ObjectId>,
    #[serde(skip)]
    default_endian: Endian,
    #[serde(skip)]
    dynamic_endian_ref: ObjectId,
}

impl Module {
    pub fn new() -> Self {
        Module {
            next_id: 1,
            next_storage_ref: 1,
            default_endian: Endian::Unspec,
            ..Default::default()
        }
    }

    // -- id allocation and identifier lookup --

    /// Allocates a fresh object id.
    pub fn new_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Allocates a fresh id and records `name` for it.
    pub fn new_named_id(&mut self, name: &str) -> ObjectId {
        let id = self.new_id();
        self.ident_table.insert(id, name.to_string());
        id
    }

    /// Resolves a source-level identifier to its id, allocating one on
    /// first sight. `source_key` is the identifier's canonical AST node
    /// key; repeated lookups of the same node return the same id.
    pub fn lookup_source_ident(&mut self, source_key: u64, name: &str) -> ObjectId {
        if let Some(&id) = self.source_ident_ids.get(&source_key) {
            return id;
        }
        let id = self.new_named_id(name);
        self.source_ident_ids.insert(source_key, id);
        id
    }

    // -- interning --

    /// Interns a string literal, returning its id.
    pub fn intern_string(&mut self, value: &str) -> ObjectId {
        if let Some(&id) = self.string_table.get(value) {
            return id;
        }
        let id = self.new_id();
        self.string_table.insert(value.to_string(), id);
        id
    }

    /// Interns a metadata name, returning its id.
    pub fn intern_metadata(&mut self, name: &str) -> ObjectId {
        if let Some(&id) = self.metadata_table.get(name) {
            return id;
        }
        let id = self.new_id();
        self.metadata_table.insert(name.to_string(), id);
        id
    }

    /// Reverse string lookup, used by the textual dump.
    pub fn string_for(&self, id: ObjectId) -> Option<&str> {
        self.string_table
            .iter()
            .find(|(_, &v)| v == id)
            .map(|(k, _)| k.as_str())
    }

    // -- storage table --

    /// Deduplicating shape registration: identical shapes share one ref.
    pub fn get_storage_ref(&mut self, storages: Storages) -> StorageRef {
        let key = storages.key();
        if let Some(&existing) = self.storage_key_table.get(&key) {
            return existing;
        }
        let r = StorageRef(self.next_storage_ref);
        self.next_storage_ref += 1;
        self.storage_key_table.insert(key, r);
        self.storage_table.insert(r, storages);
        r
    }

    /// Reverse shape lookup.
    pub fn get_storage(&self, r: StorageRef) -> Result<&Storages, CoreError> {
        self.storage_table
            .get(&r)
            .ok_or(CoreError::UnknownStorage(r.0))
    }

    /// Replaces the whole storage table after a renumbering pass.
    pub fn replace_storage_tables(
        &mut self,
        key_table: IndexMap<Vec<u8>, StorageRef>,
        table: IndexMap<StorageRef, Storages>,
    ) {
        self.storage_key_table = key_table;
        self.storage_table = table;
    }

    // -- opcode emission --

    /// Appends a bare opcode.
    pub fn op(&mut self, op: AbstractOp) {
        self.code.push(Code::new(op));
    }

    /// Appends an opcode, letting the caller populate its fields.
    pub fn op_with<F: FnOnce(&mut Code)>(&mut self, op: AbstractOp, set: F) {
        let mut code = Code::new(op);
        set(&mut code);
        self.code.push(code);
    }

    // -- previous-expression slot --

    /// Remembers the id of the most recently lowered expression.
    pub fn set_prev_expr(&mut self, id: ObjectId) {
        self.prev_expr = id;
    }

    /// The most recently lowered expression, if any.
    pub fn prev_expr(&self) -> Option<ObjectId> {
        if self.prev_expr.is_none() {
            None
        } else {
            Some(self.prev_expr)
        }
    }

    // -- function stack --

    pub fn enter_function(&mut self, id: ObjectId) {
        self.function_stack.push(id);
    }

    pub fn exit_function(&mut self) {
        self.function_stack.pop();
    }

    /// The innermost enclosing function, or the null id at top level.
    pub fn current_function(&self) -> ObjectId {
        self.function_stack.last().copied().unwrap_or(ObjectId::NONE)
    }

    // -- endian directive state --

    /// Installs the default byte order for subsequent int coders.
    pub fn set_default_endian(&mut self, endian: Endian, dynamic_ref: ObjectId) {
        self.default_endian = endian;
        self.dynamic_endian_ref = dynamic_ref;
    }

    /// Resolves a type-level endian against the active directive:
    /// an unspecified order inherits the directive's order (and dynamic
    /// variable, when the directive is dynamic).
    pub fn resolve_endian(&self, endian: Endian, signed: bool) -> EndianExpr {
        if endian == Endian::Unspec && self.default_endian != Endian::Unspec {
            EndianExpr {
                endian: self.default_endian,
                signed,
                dynamic_ref: self.dynamic_endian_ref,
            }
        } else {
            EndianExpr::new(endian, signed)
        }
    }

    // -- φ stack --

    /// Opens a φ frame for an `IF` chain whose first arm has `cond`.
    pub fn init_phi_stack(&mut self, cond: ObjectId) {
        self.phi_stack.push(PhiFrame {
            candidates: vec![PhiCandidate {
                condition: cond,
                assigns: IndexMap::new(),
            }],
            start: self.code.len(),
        });
    }

    /// Advances to the next predecessor arm (`ELIF cond` or `ELSE` with
    /// the null id).
    pub fn next_phi_candidate(&mut self, cond: ObjectId) {
        if let Some(frame) = self.phi_stack.last_mut() {
            frame.candidates.push(PhiCandidate {
                condition: cond,
                assigns: IndexMap::new(),
            });
        }
    }

    /// Closes the current chain and hands back its frame for φ emission.
    pub fn end_phi_stack(&mut self) -> PhiFrame {
        self.phi_stack.pop().unwrap_or_default()
    }

    /// Records that `target` now resolves to definition `def` within the
    /// current predecessor arm. Called by assignment lowering.
    pub fn notify_assign(&mut self, target: ObjectId, def: ObjectId) {
        if let Some(frame) = self.phi_stack.last_mut() {
            if let Some(candidate) = frame.candidates.last_mut() {
                candidate.assigns.insert(target, def);
            }
        }
    }

    /// The latest SSA definition of `target`: the most recent `ASSIGN` or
    /// `PHI` writing it, or `target` itself if it was never reassigned.
    pub fn prev_assign(&self, target: ObjectId) -> ObjectId {
        self.prev_assign_before(target, self.code.len())
    }

    /// Like [`prev_assign`](Self::prev_assign), but only considers
    /// opcodes before `limit`. Used for the pre-branch value flowing into
    /// a φ arm that did not write the variable.
    pub fn prev_assign_before(&self, target: ObjectId, limit: usize) -> ObjectId {
        for code in self.code[..limit.min(self.code.len())].iter().rev() {
            match code.op {
                AbstractOp::Assign => {
                    if code.left == Some(target) {
                        return code.ident.unwrap_or(target);
                    }
                }
                AbstractOp::Phi => {
                    if code.ref_id == Some(target) {
                        return code.ident.unwrap_or(target);
                    }
                }
                AbstractOp::DefineVariable | AbstractOp::DefineVariableRef => {
                    if code.ident == Some(target) {
                        return target;
                    }
                }
                _ => {}
            }
        }
        target
    }

    // -- index table --

    /// Rebuilds `ident_index_table` from the current code vector. Must be
    /// called after every pass that appends, removes, or reorders code.
    pub fn rebind_ident_index(&mut self) {
        self.ident_index_table.clear();
        for (i, code) in self.code.iter().enumerate() {
            if let Some(ident) = code.ident {
                self.ident_index_table.insert(ident, i);
            }
        }
    }

    /// Position of the opcode whose `ident` is `id`.
    pub fn ident_index(&self, id: ObjectId) -> Result<usize, CoreError> {
        self.ident_index_table
            .get(&id)
            .copied()
            .ok_or(CoreError::UnresolvedRef { id })
    }

    /// The opcode whose `ident` is `id`.
    pub fn code_by_ident(&self, id: ObjectId) -> Result<&Code, CoreError> {
        let index = self.ident_index(id)?;
        self.code
            .get(index)
            .ok_or(CoreError::UnresolvedRef { id })
    }
}

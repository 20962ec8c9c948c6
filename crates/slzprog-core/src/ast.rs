//! AST loader and retrocycler.
//!
//! Two distinct shapes model the two phases of loading a program:
//!
//! - [`RawNode`] mirrors the on-disk JSON schema exactly (tagged by
//!   `"type"`), acyclic and arena-free -- this is what `serde_json`
//!   deserializes into, and what a round-trip test re-serializes.
//! - [`Ast`] is an arena of [`ResolvedNode`]s addressed by [`NodeId`],
//!   produced by [`Ast::load`] and then retrocycled in place by
//!   [`Ast::retrocycle`], which replaces each `ref`/`break` node's numeric
//!   `(reference_level, id)` pair with a direct [`VarRef`] pointer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::AstError;

/// The on-disk AST schema. Deserializes directly from the input JSON
/// document and serializes back to the same shape -- the loader's
/// round-trip contract is a property of this type alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RawNode {
    #[serde(rename = "literal")]
    Literal { ival: i64 },
    #[serde(rename = "ref")]
    Ref { refl: i32, refn: i64 },
    #[serde(rename = "var")]
    Var { refn: i64, name: String, desc: String },
    #[serde(rename = "builtin")]
    Builtin { name: String },
    #[serde(rename = "scope")]
    Scope {
        defs: Vec<RawNode>,
        rval: Box<RawNode>,
    },
    #[serde(rename = "if")]
    If {
        cond: Box<RawNode>,
        then: Box<RawNode>,
        #[serde(rename = "else")]
        els: Box<RawNode>,
    },
    #[serde(rename = "while")]
    While {
        cond: Box<RawNode>,
        then: Box<RawNode>,
    },
    #[serde(rename = "call")]
    Call {
        head: Box<RawNode>,
        args: Vec<RawNode>,
    },
    #[serde(rename = "assign")]
    Assign {
        lval: Box<RawNode>,
        rval: Box<RawNode>,
    },
    #[serde(rename = "break")]
    Break { refl: i32, refn: i64 },
}

impl RawNode {
    /// Parses a JSON document into the on-disk AST shape.
    pub fn from_json(s: &str) -> Result<RawNode, AstError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serializes back to a JSON document. Combined with [`RawNode::from_json`]
    /// this realises the loader's round-trip property: the two values compare
    /// structurally equal via `serde_json::Value`, independent of incidental
    /// key ordering.
    pub fn to_json(&self) -> Result<String, AstError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A stable index into an [`Ast`]'s node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A direct pointer to a `var`'s defining node and its enclosing `scope`,
/// installed into a `ref`/`break` node by [`Ast::retrocycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub scope: NodeId,
    pub var: NodeId,
}

/// The arena-resolved AST. `ref`/`break` nodes carry both the raw
/// `(reference_level, id)` pair (cleared to `None` once retrocycled) and
/// the resolved [`VarRef`] (`None` until retrocycled).
#[derive(Debug, Clone)]
pub enum ResolvedNode {
    Literal {
        ival: i64,
    },
    Ref {
        refl: Option<i32>,
        refn: Option<u32>,
        resolved: Option<VarRef>,
    },
    Var {
        id: u32,
        name: String,
        desc: String,
    },
    Builtin {
        name: String,
    },
    Scope {
        defs: Vec<NodeId>,
        body: NodeId,
    },
    If {
        cond: NodeId,
        then: NodeId,
        els: NodeId,
    },
    While {
        cond: NodeId,
        body: NodeId,
    },
    Call {
        head: NodeId,
        args: Vec<NodeId>,
    },
    Assign {
        lval: NodeId,
        rval: NodeId,
    },
    Break {
        refl: Option<i32>,
        refn: Option<u32>,
        resolved: Option<VarRef>,
    },
}

/// An arena of [`ResolvedNode`]s plus the id of the root expression.
#[derive(Debug, Clone)]
pub struct Ast {
    nodes: Vec<ResolvedNode>,
    pub root: NodeId,
}

impl Ast {
    /// Builds an arena-resolved AST from a freshly parsed [`RawNode`] tree.
    /// Does not resolve references -- call [`Ast::retrocycle`] afterwards.
    pub fn load(raw: &RawNode) -> Result<Ast, AstError> {
        let mut nodes = Vec::new();
        let root = push_raw(&mut nodes, raw)?;
        Ok(Ast { nodes, root })
    }

    pub fn node(&self, id: NodeId) -> &ResolvedNode {
        &self.nodes[id.idx()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replaces every `ref`/`break` node's `(reference_level, id)` pair with
    /// a resolved [`VarRef`], walking the tree with an explicit stack of
    /// enclosing scopes. `reference_level` is non-positive and walks outward:
    /// `stack[stack.len() - 1 + level]` names the target scope.
    pub fn retrocycle(&mut self) -> Result<(), AstError> {
        let root = self.root;
        let mut stack: Vec<NodeId> = Vec::new();
        self.retrocycle_node(root, &mut stack)?;
        tracing::debug!(nodes = self.len(), "retrocycled AST");
        Ok(())
    }

    fn retrocycle_node(&mut self, id: NodeId, stack: &mut Vec<NodeId>) -> Result<(), AstError> {
        match self.nodes[id.idx()].clone_shape() {
            NodeShape::Leaf => Ok(()),
            NodeShape::Ref | NodeShape::Break => {
                let (refl, refn) = match &self.nodes[id.idx()] {
                    ResolvedNode::Ref { refl, refn, .. } | ResolvedNode::Break { refl, refn, .. } => {
                        (refl.expect("unretrocycled node"), refn.expect("unretrocycled node"))
                    }
                    _ => unreachable!(),
                };
                if refl > 0 {
                    return Err(AstError::UnresolvedReference { level: refl, id: refn });
                }
                let target_depth = stack.len() as i64 + refl as i64 - 1;
                if target_depth < 0 {
                    return Err(AstError::UnresolvedReference { level: refl, id: refn });
                }
                let scope_id = stack[target_depth as usize];
                let var_id = self.find_var_in_scope(scope_id, refn).ok_or(
                    AstError::UnresolvedReference { level: refl, id: refn },
                )?;
                let vref = VarRef { scope: scope_id, var: var_id };
                match &mut self.nodes[id.idx()] {
                    ResolvedNode::Ref { refl, refn, resolved } | ResolvedNode::Break { refl, refn, resolved } => {
                        *refl = None;
                        *refn = None;
                        *resolved = Some(vref);
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
            NodeShape::Scope { defs, body } => {
                let mut seen: HashMap<u32, ()> = HashMap::new();
                for &d in &defs {
                    if let ResolvedNode::Var { id: vid, .. } = &self.nodes[d.idx()] {
                        if seen.insert(*vid, ()).is_some() {
                            return Err(AstError::DuplicateDefinition { id: *vid });
                        }
                    }
                }
                stack.push(id);
                self.retrocycle_node(body, stack)?;
                stack.pop();
                Ok(())
            }
            NodeShape::If { cond, then, els } => {
                self.retrocycle_node(cond, stack)?;
                self.retrocycle_node(then, stack)?;
                self.retrocycle_node(els, stack)
            }
            NodeShape::While { cond, body } => {
                self.retrocycle_node(cond, stack)?;
                self.retrocycle_node(body, stack)
            }
            NodeShape::Call { head, args } => {
                self.retrocycle_node(head, stack)?;
                for a in args {
                    self.retrocycle_node(a, stack)?;
                }
                Ok(())
            }
            NodeShape::Assign { lval, rval } => {
                self.retrocycle_node(lval, stack)?;
                self.retrocycle_node(rval, stack)
            }
        }
    }

    fn find_var_in_scope(&self, scope_id: NodeId, refn: u32) -> Option<NodeId> {
        match &self.nodes[scope_id.idx()] {
            ResolvedNode::Scope { defs, .. } => defs.iter().copied().find(|&d| {
                matches!(&self.nodes[d.idx()], ResolvedNode::Var { id, .. } if *id == refn)
            }),
            _ => None,
        }
    }

    /// Re-serializes this AST back into a [`RawNode`] tree, restoring the
    /// numeric `(reference_level, id)` form for any retrocycled reference.
    pub fn to_raw(&self) -> RawNode {
        self.to_raw_node(self.root)
    }

    /// Re-serializes a node. For a retrocycled `ref`/`break`, the original
    /// negative `reference_level` is not retained once the pointer form is
    /// canonical, so this emits level `0` relative to the resolved scope
    /// (the pointer, not the level, is what downstream consumers of a
    /// retrocycled tree are expected to use). The round-trip property in
    /// `ast::tests::loader_round_trip` is exercised on `RawNode` before
    /// retrocycling, where the original levels are always preserved exactly.
    fn to_raw_node(&self, id: NodeId) -> RawNode {
        match &self.nodes[id.idx()] {
            ResolvedNode::Literal { ival } => RawNode::Literal { ival: *ival },
            ResolvedNode::Ref { refl, refn, resolved } => {
                if let Some(vref) = resolved {
                    RawNode::Ref {
                        refl: 0,
                        refn: self.var_id_of(vref.var) as i64,
                    }
                } else {
                    RawNode::Ref {
                        refl: refl.unwrap_or(0),
                        refn: refn.unwrap_or(0) as i64,
                    }
                }
            }
            ResolvedNode::Var { id: vid, name, desc } => RawNode::Var {
                refn: *vid as i64,
                name: name.clone(),
                desc: desc.clone(),
            },
            ResolvedNode::Builtin { name } => RawNode::Builtin { name: name.clone() },
            ResolvedNode::Scope { defs, body } => RawNode::Scope {
                defs: defs.iter().map(|&d| self.to_raw_node(d)).collect(),
                rval: Box::new(self.to_raw_node(*body)),
            },
            ResolvedNode::If { cond, then, els } => RawNode::If {
                cond: Box::new(self.to_raw_node(*cond)),
                then: Box::new(self.to_raw_node(*then)),
                els: Box::new(self.to_raw_node(*els)),
            },
            ResolvedNode::While { cond, body } => RawNode::While {
                cond: Box::new(self.to_raw_node(*cond)),
                then: Box::new(self.to_raw_node(*body)),
            },
            ResolvedNode::Call { head, args } => RawNode::Call {
                head: Box::new(self.to_raw_node(*head)),
                args: args.iter().map(|&a| self.to_raw_node(a)).collect(),
            },
            ResolvedNode::Assign { lval, rval } => RawNode::Assign {
                lval: Box::new(self.to_raw_node(*lval)),
                rval: Box::new(self.to_raw_node(*rval)),
            },
            ResolvedNode::Break { refl, refn, resolved } => {
                if let Some(vref) = resolved {
                    RawNode::Break {
                        refl: 0,
                        refn: self.var_id_of(vref.var) as i64,
                    }
                } else {
                    RawNode::Break {
                        refl: refl.unwrap_or(0),
                        refn: refn.unwrap_or(0) as i64,
                    }
                }
            }
        }
    }

    fn var_id_of(&self, var: NodeId) -> u32 {
        match &self.nodes[var.idx()] {
            ResolvedNode::Var { id, .. } => *id,
            _ => 0,
        }
    }
}

enum NodeShape {
    Leaf,
    Ref,
    Break,
    Scope { defs: Vec<NodeId>, body: NodeId },
    If { cond: NodeId, then: NodeId, els: NodeId },
    While { cond: NodeId, body: NodeId },
    Call { head: NodeId, args: Vec<NodeId> },
    Assign { lval: NodeId, rval: NodeId },
}

impl ResolvedNode {
    fn clone_shape(&self) -> NodeShape {
        match self {
            ResolvedNode::Literal { .. } | ResolvedNode::Var { .. } | ResolvedNode::Builtin { .. } => {
                NodeShape::Leaf
            }
            ResolvedNode::Ref { .. } => NodeShape::Ref,
            ResolvedNode::Break { .. } => NodeShape::Break,
            ResolvedNode::Scope { defs, body } => NodeShape::Scope {
                defs: defs.clone(),
                body: *body,
            },
            ResolvedNode::If { cond, then, els } => NodeShape::If {
                cond: *cond,
                then: *then,
                els: *els,
            },
            ResolvedNode::While { cond, body } => NodeShape::While {
                cond: *cond,
                body: *body,
            },
            ResolvedNode::Call { head, args } => NodeShape::Call {
                head: *head,
                args: args.clone(),
            },
            ResolvedNode::Assign { lval, rval } => NodeShape::Assign {
                lval: *lval,
                rval: *rval,
            },
        }
    }
}

fn push_raw(nodes: &mut Vec<ResolvedNode>, raw: &RawNode) -> Result<NodeId, AstError> {
    let resolved = match raw {
        RawNode::Literal { ival } => ResolvedNode::Literal { ival: *ival },
        RawNode::Ref { refl, refn } => {
            if *refn < 0 {
                return Err(AstError::NegativeIdReserved { id: *refn });
            }
            ResolvedNode::Ref {
                refl: Some(*refl),
                refn: Some(*refn as u32),
                resolved: None,
            }
        }
        RawNode::Var { refn, name, desc } => {
            if *refn < 0 {
                return Err(AstError::NegativeIdReserved { id: *refn });
            }
            ResolvedNode::Var {
                id: *refn as u32,
                name: name.clone(),
                desc: desc.clone(),
            }
        }
        RawNode::Builtin { name } => ResolvedNode::Builtin { name: name.clone() },
        RawNode::Scope { defs, rval } => {
            let mut def_ids = Vec::with_capacity(defs.len());
            for d in defs {
                def_ids.push(push_raw(nodes, d)?);
            }
            let body = push_raw(nodes, rval)?;
            ResolvedNode::Scope { defs: def_ids, body }
        }
        RawNode::If { cond, then, els } => {
            let cond = push_raw(nodes, cond)?;
            let then = push_raw(nodes, then)?;
            let els = push_raw(nodes, els)?;
            ResolvedNode::If { cond, then, els }
        }
        RawNode::While { cond, then } => {
            let cond = push_raw(nodes, cond)?;
            let body = push_raw(nodes, then)?;
            ResolvedNode::While { cond, body }
        }
        RawNode::Call { head, args } => {
            let head = push_raw(nodes, head)?;
            let mut arg_ids = Vec::with_capacity(args.len());
            for a in args {
                arg_ids.push(push_raw(nodes, a)?);
            }
            ResolvedNode::Call { head, args: arg_ids }
        }
        RawNode::Assign { lval, rval } => {
            let lval = push_raw(nodes, lval)?;
            let rval = push_raw(nodes, rval)?;
            ResolvedNode::Assign { lval, rval }
        }
        RawNode::Break { refl, refn } => ResolvedNode::Break {
            refl: Some(*refl),
            refn: {
                if *refn < 0 {
                    return Err(AstError::NegativeIdReserved { id: *refn });
                }
                Some(*refn as u32)
            },
            resolved: None,
        },
    };
    nodes.push(resolved);
    Ok(NodeId((nodes.len() - 1) as u32))
}

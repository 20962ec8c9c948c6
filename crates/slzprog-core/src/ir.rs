//! The SSA instruction arena: opcodes, use-chains, and the append/renumber
//! utilities the lowering engine and assembly emitter both depend on.
//!
//! Instructions live in a per-[`Function`] arena (`Vec<Instruction>`)
//! addressed by [`InstrId`] rather than as an intrusive linked list of raw
//! pointers -- the arena sidesteps the cyclic-reference and aliasing
//! concerns a pointer-based design would raise in safe Rust, while
//! preserving the same topology: `next` links an owning top-level or
//! sub-list chain, `arg0..2` are non-owning value operands, and `list0`/
//! `list1` are non-owning heads of nested control-flow bodies.

use indexmap::{IndexMap, IndexSet};

/// A stable index into a [`Function`]'s instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl InstrId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// The closed opcode set the lowering engine and assembly emitter agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Control meta
    NoOp,
    Return,
    While,
    IfNonzero,
    IfZero,
    IfNonpositive,
    IfPositive,
    IfNonnegative,
    IfNegative,
    Phi,
    // Value producers
    Const,
    Copy,
    ZeroExtend,
    SignExtend,
    Neg,
    Not,
    // Arithmetic / bitwise
    Add,
    Sub,
    Mul,
    UDiv,
    IDiv,
    UMod,
    IMod,
    And,
    Or,
    Xor,
    ShiftLeft,
    LogicalShiftRight,
    ArithmeticShiftRight,
    RotateLeft,
    RotateRight,
    // Comparison
    UCompare,
    ICompare,
}

impl Opcode {
    /// `true` for the six `If*` family members.
    pub fn is_if(self) -> bool {
        matches!(
            self,
            Opcode::IfNonzero
                | Opcode::IfZero
                | Opcode::IfNonpositive
                | Opcode::IfPositive
                | Opcode::IfNonnegative
                | Opcode::IfNegative
        )
    }
}

/// One of the three named value-operand slots on an [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Arg0,
    Arg1,
    Arg2,
}

/// A single IR instruction. Owned exclusively by the `next` chain it is
/// spliced into (the function's top-level `code` list, or a `list0`/`list1`
/// sub-list of some enclosing control instruction).
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg0: Option<InstrId>,
    pub arg1: Option<InstrId>,
    pub arg2: Option<InstrId>,
    pub list0: Option<InstrId>,
    pub list1: Option<InstrId>,
    pub next: Option<InstrId>,
    pub konst: i64,
    pub serial: u32,
}

impl Instruction {
    fn operand(&self, slot: Slot) -> Option<InstrId> {
        match slot {
            Slot::Arg0 => self.arg0,
            Slot::Arg1 => self.arg1,
            Slot::Arg2 => self.arg2,
        }
    }

    fn set_operand(&mut self, slot: Slot, value: Option<InstrId>) {
        match slot {
            Slot::Arg0 => self.arg0 = value,
            Slot::Arg1 => self.arg1 = value,
            Slot::Arg2 => self.arg2 = value,
        }
    }

    fn operands(&self) -> [Option<InstrId>; 3] {
        [self.arg0, self.arg1, self.arg2]
    }
}

/// An SSA subroutine under construction: the instruction arena, the
/// use-chain table, and the monotonic serial counter. A name, an (unused by
/// lowering) formal-argument list, the `code` head, and the designated
/// `ret` instruction round out the data model for a subroutine.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub args: Vec<String>,
    instrs: Vec<Instruction>,
    uses: IndexMap<InstrId, IndexSet<InstrId>>,
    pub code: Option<InstrId>,
    pub ret: Option<InstrId>,
    next_serial: u32,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Function {
        Function {
            name: name.into(),
            args: Vec::new(),
            instrs: Vec::new(),
            uses: IndexMap::new(),
            code: None,
            ret: None,
            next_serial: 0,
        }
    }

    pub fn instr(&self, id: InstrId) -> &Instruction {
        &self.instrs[id.idx()]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.instrs[id.idx()]
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// The set of instructions that mention `id` in one of their operand
    /// slots.
    pub fn uses_of(&self, id: InstrId) -> &IndexSet<InstrId> {
        static EMPTY: std::sync::OnceLock<IndexSet<InstrId>> = std::sync::OnceLock::new();
        self.uses
            .get(&id)
            .unwrap_or_else(|| EMPTY.get_or_init(IndexSet::new))
    }

    /// Allocates a new instruction with the given shape, registers it in the
    /// use-chain of every named operand, and assigns it a fresh ascending
    /// serial. Does *not* append it to any list -- callers that want the
    /// instruction reachable from `code`/`list0`/`list1` must call
    /// [`Function::append`] explicitly.
    #[allow(clippy::too_many_arguments)]
    pub fn push_instr(
        &mut self,
        opcode: Opcode,
        arg0: Option<InstrId>,
        arg1: Option<InstrId>,
        arg2: Option<InstrId>,
        list0: Option<InstrId>,
        list1: Option<InstrId>,
        konst: i64,
    ) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(Instruction {
            opcode,
            arg0,
            arg1,
            arg2,
            list0,
            list1,
            next: None,
            konst,
            serial: 0,
        });
        for operand in [arg0, arg1, arg2].into_iter().flatten() {
            self.uses.entry(operand).or_default().insert(id);
        }
        self.instrs[id.idx()].serial = self.next_serial;
        self.next_serial += 1;
        id
    }

    /// Appends `id` to the tail of the intrusive list headed by `*list`
    /// (O(n) tail walk; these streams are small function bodies, not a hot
    /// path worth a more complex structure).
    pub fn append(&mut self, list: &mut Option<InstrId>, id: InstrId) {
        match *list {
            None => *list = Some(id),
            Some(head) => {
                let mut cur = head;
                loop {
                    match self.instrs[cur.idx()].next {
                        Some(next) => cur = next,
                        None => break,
                    }
                }
                self.instrs[cur.idx()].next = Some(id);
            }
        }
    }

    /// Convenience: emits `Const konst`, appends it, returns its id.
    pub fn emit_const(&mut self, list: &mut Option<InstrId>, konst: i64) -> InstrId {
        let id = self.push_instr(Opcode::Const, None, None, None, None, None, konst);
        self.append(list, id);
        id
    }

    /// Convenience: emits `Copy x`, appends it, returns its id. Every
    /// assignment in the lowering engine goes through this so that no two
    /// variables ever share a defining instruction -- a prerequisite for the
    /// loop-phi retrofit in [`crate::lower`].
    pub fn emit_copy(&mut self, list: &mut Option<InstrId>, x: InstrId) -> InstrId {
        let id = self.push_instr(Opcode::Copy, Some(x), None, None, None, None, 0);
        self.append(list, id);
        id
    }

    /// Clears `id`'s `slot` to `None`, removing `id` from the old operand's
    /// use-chain unless another slot of `id` still references it.
    pub fn clear_operand(&mut self, id: InstrId, slot: Slot) {
        let old = self.instrs[id.idx()].operand(slot);
        self.instrs[id.idx()].set_operand(slot, None);
        if let Some(old_id) = old {
            let still_used = self.instrs[id.idx()].operands().contains(&Some(old_id));
            if !still_used {
                if let Some(set) = self.uses.get_mut(&old_id) {
                    set.swap_remove(&id);
                }
            }
        }
    }

    /// Replaces `id`'s `slot` with `new_value`, updating the use-chains of
    /// both the old and new operand. The use-chain discipline requires every
    /// operand re-point to go through this rather than direct field mutation.
    pub fn replace_operand(&mut self, id: InstrId, slot: Slot, new_value: InstrId) {
        self.clear_operand(id, slot);
        self.instrs[id.idx()].set_operand(slot, Some(new_value));
        self.uses.entry(new_value).or_default().insert(id);
    }

    /// Rewires every user of `old` whose serial is `>= min_serial` to
    /// reference `new` instead, leaving users with a smaller serial (outside
    /// the construct doing the retrofit) untouched. This is the primitive a
    /// `while` loop uses to retrofit a back-edge phi at its head without
    /// disturbing references from outside the loop.
    pub fn replace_uses_with_min_serial(&mut self, old: InstrId, new: InstrId, min_serial: u32) {
        let users: Vec<InstrId> = self
            .uses
            .get(&old)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for user in users {
            if self.instrs[user.idx()].serial < min_serial {
                continue;
            }
            for slot in [Slot::Arg0, Slot::Arg1, Slot::Arg2] {
                if self.instrs[user.idx()].operand(slot) == Some(old) {
                    self.replace_operand(user, slot, new);
                }
            }
        }
    }

    /// Re-walks the instruction stream (top-level `code` chain plus any
    /// `list0`/`list1` sub-streams, depth-first in program order) and
    /// overwrites every instruction's `serial` with its position in that
    /// walk. This is the stack-slot index the assembly emitter uses; it is
    /// unrelated to (and run strictly after) the ascending registration-time
    /// serials lowering used for the `Serial >= S_loop` test.
    pub fn renumber_instructions(&mut self) -> u32 {
        let mut counter = 0u32;
        let code = self.code;
        self.renumber_walk(code, &mut counter);
        counter
    }

    fn renumber_walk(&mut self, mut cur: Option<InstrId>, counter: &mut u32) {
        while let Some(id) = cur {
            self.instrs[id.idx()].serial = *counter;
            *counter += 1;
            let list0 = self.instrs[id.idx()].list0;
            if list0.is_some() {
                self.renumber_walk(list0, counter);
            }
            let list1 = self.instrs[id.idx()].list1;
            if list1.is_some() {
                self.renumber_walk(list1, counter);
            }
            cur = self.instrs[id.idx()].next;
        }
    }

    /// Checks use-chain integrity: for every instruction and
    /// every non-null operand slot, the instruction appears in that
    /// operand's use set, and conversely.
    #[cfg(test)]
    pub fn check_use_chain_integrity(&self) -> bool {
        for (id, instr) in self.instrs.iter().enumerate() {
            let id = InstrId(id as u32);
            for operand in instr.operands().into_iter().flatten() {
                match self.uses.get(&operand) {
                    Some(set) if set.contains(&id) => {}
                    _ => return false,
                }
            }
        }
        for (operand, users) in &self.uses {
            for &user in users {
                if !self.instrs[user.idx()].operands().contains(&Some(*operand)) {
                    return false;
                }
            }
        }
        true
    }
}
